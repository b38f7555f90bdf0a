//! Downsampled resolution levels for the positions of a plate.
//!
//! Level `l` is the block mean of the base image over `2^l` voxels along Z, Y
//! and X, computed for every timepoint and channel straight from level 0.
//! Trailing voxels that do not fill a whole block are dropped. Levels are
//! written as float32 arrays named `1`, `2`, ... next to the base array, and
//! the position's `multiscales` entry is rewritten to list them.

use clap::Args;
use ndarray::{s, Array3, ArrayView3};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::metadata::{describe_dataset, replace_downsampled_levels, PositionMetadata};
use crate::pipeline::{PositionSource, ZarrPosition};
use crate::selection::select_positions;
use crate::zarr::{self, Store};

#[derive(Args, Clone)]
pub struct PyramidArgs {
    /// Path to the OME-Zarr plate
    #[arg(long)]
    pub input: String,
    /// Number of levels including the full-resolution base (at least 2)
    #[arg(long, default_value_t = 3)]
    pub levels: usize,
    /// Positions to process: "all", indices, start:stop[:step] or ids like A/1/0
    #[arg(long, default_value = "all")]
    pub positions: String,
    /// Log failing positions and continue with the rest
    #[arg(long)]
    pub keep_going: bool,
}

/// Per-axis `(z, y, x)` block size of `level` over a base of size `zyx`. An
/// axis shorter than `2^level` is averaged down to a single voxel.
pub fn level_factors(level: u32, zyx: [usize; 3]) -> [usize; 3] {
    let factor = 2usize.saturating_pow(level);
    zyx.map(|d| factor.min(d.max(1)))
}

/// Block mean of `volume` over `factors`, dropping incomplete trailing blocks.
pub fn downsample_mean(volume: ArrayView3<'_, f32>, factors: [usize; 3]) -> Array3<f32> {
    let (z, y, x) = volume.dim();
    let [fz, fy, fx] = factors;
    let norm = (fz * fy * fx) as f32;
    Array3::from_shape_fn((z / fz, y / fy, x / fx), |(i, j, k)| {
        volume
            .slice(s![i * fz..(i + 1) * fz, j * fy..(j + 1) * fy, k * fx..(k + 1) * fx])
            .sum()
            / norm
    })
}

/// Build levels `1..levels` of one position. Existing levels with the same
/// names are replaced.
pub fn build_position_pyramid(
    root: &Path,
    store: &Store,
    position: &PositionMetadata,
    levels: usize,
    progress: impl Fn(f64, &str),
) -> Result<()> {
    let source = ZarrPosition::open(store, position)?;
    let [n_t, n_c, z, y, x] = source.dims();
    let base = position.layout.base();
    let base_scale = if base.scale.len() == 5 {
        base.scale.clone()
    } else {
        vec![1.0; 5]
    };

    let mut arrays = Vec::with_capacity(levels - 1);
    let mut entries = Vec::with_capacity(levels - 1);
    for level in 1..levels {
        let name = level.to_string();
        if name == base.path {
            return Err(Error::Config(format!(
                "position {}: base array is named {name:?}, which a pyramid level would overwrite",
                position.id()
            )));
        }
        let factors = level_factors(level as u32, [z, y, x]);
        let [oz, oy, ox] = [z / factors[0], y / factors[1], x / factors[2]].map(|d| d as u64);

        let dir = root.join(&position.path).join(&name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        arrays.push((
            factors,
            zarr::create_array_f32(
                store,
                &format!("/{}/{name}", position.path),
                vec![n_t as u64, n_c as u64, oz, oy, ox],
                vec![1, 1, oz, oy, ox],
                None,
            )?,
        ));

        let mut scale = base_scale.clone();
        for (axis, f) in factors.iter().enumerate() {
            scale[2 + axis] *= *f as f64;
        }
        entries.push(json!({
            "path": name,
            "coordinateTransformations": [{"type": "scale", "scale": scale}],
        }));
    }

    for t in 0..n_t {
        for c in 0..n_c {
            let volume = source.read_volume(t, c)?;
            for (factors, array) in &arrays {
                let down = downsample_mean(volume.view(), *factors);
                let data: Vec<f32> = down.iter().copied().collect();
                zarr::store_chunk_f32(array, &[t as u64, c as u64, 0, 0, 0], &data)?;
            }
        }
        progress((t + 1) as f64 / n_t as f64, &format!("Frame {}/{}", t + 1, n_t));
    }

    replace_downsampled_levels(root, &position.path, entries)
}

pub fn run(args: PyramidArgs, progress: impl Fn(f64, &str)) -> Result<()> {
    if args.levels < 2 {
        return Err(Error::Config(format!(
            "a pyramid needs at least 2 levels (base + 1 downsample), got {}",
            args.levels
        )));
    }
    let root = PathBuf::from(&args.input);
    let meta = describe_dataset(&root)?;
    let positions: Vec<&PositionMetadata> = meta.positions().collect();
    let ids: Vec<String> = positions.iter().map(|p| p.id()).collect();
    let selected = select_positions(&args.positions, &ids)?;
    let store = zarr::open_store(&root)?;
    let total = selected.len();
    let mut failed = Vec::new();

    for (k, &i) in selected.iter().enumerate() {
        let result = build_position_pyramid(&root, &store, positions[i], args.levels, |p, msg| {
            progress((k as f64 + p) / total as f64, &format!("{} {msg}", ids[i]))
        });
        match result {
            Ok(()) => log::info!("{}: wrote {} downsampled level(s)", ids[i], args.levels - 1),
            Err(e) if args.keep_going => {
                log::warn!("{}: skipped after error: {e}", ids[i]);
                failed.push(ids[i].clone());
            }
            Err(e) => return Err(e),
        }
    }

    if !failed.is_empty() {
        return Err(Error::PositionsFailed(failed));
    }
    progress(1.0, &format!("Built pyramids for {total} position(s)"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factors_double_per_level_and_stop_at_the_axis_size() {
        assert_eq!(level_factors(1, [4, 16, 16]), [2, 2, 2]);
        assert_eq!(level_factors(2, [1, 16, 16]), [1, 4, 4]);
        assert_eq!(level_factors(3, [3, 5, 64]), [3, 5, 8]);
        assert_eq!(level_factors(80, [2, 2, 2]), [2, 2, 2]);
    }

    #[test]
    fn block_mean_drops_the_remainder() {
        let volume = Array3::from_shape_fn((1, 2, 5), |(_, y, x)| (y * 5 + x) as f32);
        let down = downsample_mean(volume.view(), [1, 2, 2]);
        assert_eq!(down.dim(), (1, 1, 2));
        // (0 + 1 + 5 + 6) / 4 and (2 + 3 + 7 + 8) / 4
        assert_eq!(down.as_slice().unwrap(), &[3.0, 5.0]);
    }

    #[test]
    fn unit_factors_copy_the_volume() {
        let volume = Array3::from_shape_fn((2, 3, 3), |(z, y, x)| (z * 9 + y * 3 + x) as f32);
        assert_eq!(downsample_mean(volume.view(), [1, 1, 1]), volume);
    }

    #[test]
    fn a_single_level_is_rejected() {
        let args = PyramidArgs {
            input: "/nonexistent".into(),
            levels: 1,
            positions: "all".into(),
            keep_going: false,
        };
        assert!(matches!(run(args, |_, _| {}), Err(Error::Config(_))));
    }
}
