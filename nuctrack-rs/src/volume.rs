//! Frame-level array types and per-object summaries.

use ndarray::{Array3, ArrayView3, ArrayViewMut3};
use std::collections::BTreeMap;

/// Integer-labeled (z, y, x) volume; 0 is background.
pub type LabelVolume = Array3<u32>;

/// Intensity data for one timepoint, indexed (c, z, y, x).
pub type IntensityVolume = ndarray::Array4<f32>;

/// One labeled region of a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRecord {
    pub label: u32,
    /// (z, y, x) in voxel units.
    pub centroid: [f64; 3],
    /// Voxel count.
    pub area: u64,
}

/// Summarize every nonzero label of `labels`, sorted by ascending label.
pub fn object_records(labels: ArrayView3<'_, u32>) -> Vec<ObjectRecord> {
    let mut acc: BTreeMap<u32, ([f64; 3], u64)> = BTreeMap::new();
    for ((z, y, x), &lbl) in labels.indexed_iter() {
        if lbl == 0 {
            continue;
        }
        let entry = acc.entry(lbl).or_insert(([0.0; 3], 0));
        entry.0[0] += z as f64;
        entry.0[1] += y as f64;
        entry.0[2] += x as f64;
        entry.1 += 1;
    }
    acc.into_iter()
        .map(|(label, (sum, area))| {
            let n = area as f64;
            ObjectRecord {
                label,
                centroid: [sum[0] / n, sum[1] / n, sum[2] / n],
                area,
            }
        })
        .collect()
}

/// Min-max normalize in place to [0, 1]. Constant volumes become all zeros.
pub fn normalize_in_place(mut volume: ArrayViewMut3<'_, f32>) {
    let (min, max) = volume
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if !min.is_finite() {
        return;
    }
    let range = max - min + 1e-8;
    volume.mapv_inplace(|v| (v - min) / range);
}

pub(crate) fn dims(labels: &LabelVolume) -> Vec<usize> {
    labels.shape().to_vec()
}
