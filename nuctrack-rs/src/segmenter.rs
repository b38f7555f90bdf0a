//! Pluggable per-frame segmentation.
//!
//! A segmenter turns one normalized (c, z, y, x) intensity volume into a
//! LabelVolume with frame-local labels. Identity across frames is the
//! tracker's job, not the segmenter's.

use clap::ValueEnum;
use ndarray::{Array3, ArrayView3, ArrayView4, Axis};
use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::threshold;
use crate::volume::LabelVolume;

pub trait Segmenter {
    fn name(&self) -> &str;

    fn segment(&mut self, volume: ArrayView4<'_, f32>) -> Result<LabelVolume>;
}

/// Segmenter selection on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SegmenterKind {
    /// Otsu threshold + 26-connected components
    Otsu,
    /// Cellpose ONNX model, slice by slice, stitched along Z
    Cellpose,
}

/// Global Otsu threshold followed by connected component labeling.
#[derive(Debug, Clone)]
pub struct OtsuSegmenter {
    /// Components with fewer voxels are dropped.
    pub min_size: usize,
}

impl Default for OtsuSegmenter {
    fn default() -> Self {
        Self { min_size: 1 }
    }
}

impl Segmenter for OtsuSegmenter {
    fn name(&self) -> &str {
        "otsu"
    }

    fn segment(&mut self, volume: ArrayView4<'_, f32>) -> Result<LabelVolume> {
        let channel = first_channel(volume)?;
        let t = match threshold::otsu(channel.iter().map(|&v| v as f64)) {
            Ok(t) => t,
            // Nothing to separate: an empty frame, not a failure.
            Err(Error::DegenerateDistribution(msg)) => {
                log::debug!("otsu: {msg}, frame has no foreground");
                return Ok(Array3::zeros(channel.raw_dim()));
            }
            Err(e) => return Err(e),
        };
        let mask = channel.mapv(|v| v as f64 > t);
        Ok(label_components(mask.view(), self.min_size))
    }
}

fn first_channel(volume: ArrayView4<'_, f32>) -> Result<ArrayView3<'_, f32>> {
    if volume.len_of(Axis(0)) == 0 {
        return Err(Error::Segmentation("volume has no channels".into()));
    }
    Ok(volume.index_axis_move(Axis(0), 0))
}

const NEIGHBORS_26: [(isize, isize, isize); 26] = {
    let mut out = [(0, 0, 0); 26];
    let mut n = 0;
    let mut dz = -1;
    while dz <= 1 {
        let mut dy = -1;
        while dy <= 1 {
            let mut dx = -1;
            while dx <= 1 {
                if !(dz == 0 && dy == 0 && dx == 0) {
                    out[n] = (dz, dy, dx);
                    n += 1;
                }
                dx += 1;
            }
            dy += 1;
        }
        dz += 1;
    }
    out
};

/// Label 26-connected foreground components in raster order. Components
/// smaller than `min_size` are removed and the remaining labels are `1..=n`.
pub fn label_components(mask: ArrayView3<'_, bool>, min_size: usize) -> LabelVolume {
    let (nz, ny, nx) = mask.dim();
    let mut labels = Array3::<u32>::zeros((nz, ny, nx));
    let mut visited = Array3::from_elem((nz, ny, nx), false);
    let mut next = 1u32;
    let mut queue = VecDeque::new();
    let mut members = Vec::new();

    for ((z, y, x), &fg) in mask.indexed_iter() {
        if !fg || visited[[z, y, x]] {
            continue;
        }
        visited[[z, y, x]] = true;
        labels[[z, y, x]] = next;
        queue.push_back((z, y, x));
        members.clear();
        while let Some((cz, cy, cx)) = queue.pop_front() {
            members.push((cz, cy, cx));
            for &(dz, dy, dx) in &NEIGHBORS_26 {
                let (Some(qz), Some(qy), Some(qx)) = (
                    cz.checked_add_signed(dz),
                    cy.checked_add_signed(dy),
                    cx.checked_add_signed(dx),
                ) else {
                    continue;
                };
                if qz >= nz || qy >= ny || qx >= nx {
                    continue;
                }
                if mask[[qz, qy, qx]] && !visited[[qz, qy, qx]] {
                    visited[[qz, qy, qx]] = true;
                    labels[[qz, qy, qx]] = next;
                    queue.push_back((qz, qy, qx));
                }
            }
        }
        if members.len() < min_size {
            for &idx in &members {
                labels[idx] = 0;
            }
        } else {
            next += 1;
        }
    }
    labels
}

#[cfg(feature = "cellpose")]
pub use self::cellpose::CellposeSegmenter;

#[cfg(feature = "cellpose")]
mod cellpose {
    use cellpose_rs::{CellposeSession, SegmentParams};
    use ndarray::{s, Array3, ArrayView4};
    use std::path::Path;

    use super::{first_channel, Segmenter};
    use crate::error::{Error, Result};
    use crate::metric::MatchStrategy;
    use crate::tracker::{self, TrackParams, FIRST_IDENTITY};
    use crate::volume::LabelVolume;

    /// Cellpose cpsam (ONNX) applied per Z plane; planes are stitched into
    /// 3D objects by overlap with the plane below.
    pub struct CellposeSegmenter {
        session: CellposeSession,
        batch_size: usize,
        stitch: TrackParams,
    }

    impl CellposeSegmenter {
        /// `model_dir` must contain `model.onnx`.
        pub fn new(
            model_dir: &Path,
            cpu: bool,
            batch_size: usize,
            stitch_threshold: f64,
        ) -> Result<Self> {
            let model_file = model_dir.join("model.onnx");
            if !model_file.exists() {
                return Err(Error::Config(format!(
                    "Model not found at {}. Expected an exported cellpose model.onnx",
                    model_file.display()
                )));
            }
            let session = CellposeSession::new(&model_file, cpu)
                .map_err(|e| Error::Segmentation(e.to_string()))?;
            Ok(Self {
                session,
                batch_size,
                stitch: TrackParams {
                    strategy: MatchStrategy::Overlap {
                        min_iou: stitch_threshold,
                    },
                },
            })
        }
    }

    impl Segmenter for CellposeSegmenter {
        fn name(&self) -> &str {
            "cellpose"
        }

        fn segment(&mut self, volume: ArrayView4<'_, f32>) -> Result<LabelVolume> {
            let nuclei = first_channel(volume)?;
            let (nz, h, w) = nuclei.dim();
            let mut out = Array3::<u32>::zeros((nz, h, w));
            let mut prev: Option<LabelVolume> = None;
            let mut next_id = FIRST_IDENTITY;

            for z in 0..nz {
                let plane: Vec<f32> = nuclei.slice(s![z, .., ..]).iter().copied().collect();
                // The model takes [cyto, nuclei, cyto]; only a nuclear stain is available.
                let chw = cellpose_rs::preprocess::build_chw_image(plane.clone(), plane, h, w);
                let params = SegmentParams {
                    batch_size: self.batch_size,
                    ..Default::default()
                };
                let masks = self
                    .session
                    .segment(&chw, h, w, params)
                    .map_err(|e| Error::Segmentation(format!("plane {z}: {e}")))?;
                let plane_labels = Array3::from_shape_vec((1, h, w), masks)?;

                let (stitched, next) =
                    tracker::track(prev.as_ref(), &plane_labels, next_id, &self.stitch)?;
                next_id = next;
                out.slice_mut(s![z..z + 1, .., ..]).assign(&stitched);
                prev = Some(stitched);
            }
            Ok(out)
        }
    }
}
