//! Pairwise costs between the objects of two frames.

use ndarray::ArrayView3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::volume::ObjectRecord;

/// Cost assigned to pairs that must never be matched.
pub const DISALLOWED: f64 = f64::INFINITY;

/// Physical size of one voxel along (z, y, x).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoxelSpacing {
    pub z: f64,
    pub y: f64,
    pub x: f64,
}

impl Default for VoxelSpacing {
    fn default() -> Self {
        Self {
            z: 1.0,
            y: 1.0,
            x: 1.0,
        }
    }
}

impl VoxelSpacing {
    pub fn new(z: f64, y: f64, x: f64) -> Self {
        Self { z, y, x }
    }

    /// Physical distance between two (z, y, x) voxel-space points.
    pub fn distance(&self, a: [f64; 3], b: [f64; 3]) -> f64 {
        let dz = (a[0] - b[0]) * self.z;
        let dy = (a[1] - b[1]) * self.y;
        let dx = (a[2] - b[2]) * self.x;
        (dz * dz + dy * dy + dx * dx).sqrt()
    }
}

/// How two frames are compared, together with the admissibility threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MatchStrategy {
    /// `1 - IoU` of the voxel masks; a pair needs `IoU > min_iou`.
    Overlap { min_iou: f64 },
    /// Centroid distance in physical units; a pair needs `distance < max_dist`.
    Distance { max_dist: f64, spacing: VoxelSpacing },
}

impl Default for MatchStrategy {
    fn default() -> Self {
        MatchStrategy::Overlap { min_iou: 0.1 }
    }
}

impl MatchStrategy {
    /// Whether a solved pair with this cost may continue an identity.
    pub fn accepts(&self, cost: f64) -> bool {
        if !cost.is_finite() {
            return false;
        }
        match *self {
            MatchStrategy::Overlap { min_iou } => 1.0 - cost > min_iou,
            MatchStrategy::Distance { max_dist, .. } => cost < max_dist,
        }
    }
}

/// The objects of one frame plus the volume they were measured on.
#[derive(Debug, Clone)]
pub struct FrameObjects<'a> {
    pub labels: ArrayView3<'a, u32>,
    pub records: Vec<ObjectRecord>,
}

impl<'a> FrameObjects<'a> {
    pub fn new(labels: ArrayView3<'a, u32>) -> Self {
        let records = crate::volume::object_records(labels);
        Self { labels, records }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Dense row-major matrix, rows = previous objects, columns = current objects.
#[derive(Debug, Clone, PartialEq)]
pub struct CostMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl CostMatrix {
    pub fn new(rows: usize, cols: usize, fill: f64) -> Self {
        Self {
            rows,
            cols,
            data: vec![fill; rows * cols],
        }
    }

    /// # Panics
    /// If the rows differ in length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Self {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            assert_eq!(row.len(), cols, "ragged cost matrix");
            data.extend_from_slice(row);
        }
        Self {
            rows: rows.len(),
            cols,
            data,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.cols + col] = value;
    }

    /// True when at least one pair is not the disallowed sentinel.
    pub fn has_finite(&self) -> bool {
        self.data.iter().any(|v| v.is_finite())
    }

    /// Copy with rows and columns swapped.
    pub fn transposed(&self) -> Self {
        let mut out = CostMatrix::new(self.cols, self.rows, 0.0);
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.set(c, r, self.get(r, c));
            }
        }
        out
    }
}

/// Cost of pairing every previous object with every current object.
pub fn compute_cost(
    prev: &FrameObjects<'_>,
    curr: &FrameObjects<'_>,
    strategy: &MatchStrategy,
) -> Result<CostMatrix> {
    if prev.is_empty() || curr.is_empty() {
        return Ok(CostMatrix::new(0, 0, DISALLOWED));
    }
    match strategy {
        MatchStrategy::Overlap { min_iou } => overlap_cost(prev, curr, *min_iou),
        MatchStrategy::Distance { max_dist, spacing } => {
            Ok(distance_cost(&prev.records, &curr.records, *max_dist, spacing))
        }
    }
}

fn distance_cost(
    prev: &[ObjectRecord],
    curr: &[ObjectRecord],
    max_dist: f64,
    spacing: &VoxelSpacing,
) -> CostMatrix {
    let mut cost = CostMatrix::new(prev.len(), curr.len(), DISALLOWED);
    for (i, p) in prev.iter().enumerate() {
        for (j, c) in curr.iter().enumerate() {
            let d = spacing.distance(p.centroid, c.centroid);
            if d < max_dist {
                cost.set(i, j, d);
            }
        }
    }
    cost
}

/// `1 - IoU` from a single co-occurrence pass over both volumes. Pairs with
/// `IoU <= min_iou` are disallowed.
fn overlap_cost(
    prev: &FrameObjects<'_>,
    curr: &FrameObjects<'_>,
    min_iou: f64,
) -> Result<CostMatrix> {
    if prev.labels.shape() != curr.labels.shape() {
        return Err(Error::ShapeMismatch {
            expected: prev.labels.shape().to_vec(),
            found: curr.labels.shape().to_vec(),
        });
    }

    let mut intersections: HashMap<(u32, u32), u64> = HashMap::new();
    for (&p, &c) in prev.labels.iter().zip(curr.labels.iter()) {
        if p != 0 && c != 0 {
            *intersections.entry((p, c)).or_insert(0) += 1;
        }
    }

    let prev_index: HashMap<u32, usize> = prev
        .records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.label, i))
        .collect();
    let curr_index: HashMap<u32, usize> = curr
        .records
        .iter()
        .enumerate()
        .map(|(j, r)| (r.label, j))
        .collect();

    // Pairs that never touch have IoU 0.
    let disjoint = if 0.0 > min_iou { 1.0 } else { DISALLOWED };
    let mut cost = CostMatrix::new(prev.records.len(), curr.records.len(), disjoint);
    for ((p, c), inter) in intersections {
        let i = prev_index[&p];
        let j = curr_index[&c];
        let union = prev.records[i].area + curr.records[j].area - inter;
        let iou = if union > 0 {
            inter as f64 / union as f64
        } else {
            0.0
        };
        if iou > min_iou {
            cost.set(i, j, 1.0 - iou);
        }
    }
    Ok(cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    fn blocks() -> (Array3<u32>, Array3<u32>) {
        // prev: label 1 occupies x 0..4, label 2 occupies x 6..8
        // curr: label 5 occupies x 2..6, label 9 occupies x 7..8
        let mut prev = Array3::<u32>::zeros((1, 1, 8));
        let mut curr = Array3::<u32>::zeros((1, 1, 8));
        for x in 0..4 {
            prev[[0, 0, x]] = 1;
        }
        for x in 6..8 {
            prev[[0, 0, x]] = 2;
        }
        for x in 2..6 {
            curr[[0, 0, x]] = 5;
        }
        curr[[0, 0, 7]] = 9;
        (prev, curr)
    }

    #[test]
    fn overlap_uses_full_masks() {
        let (prev, curr) = blocks();
        let p = FrameObjects::new(prev.view());
        let c = FrameObjects::new(curr.view());
        let cost = compute_cost(&p, &c, &MatchStrategy::Overlap { min_iou: 0.1 }).unwrap();

        assert_eq!((cost.rows(), cost.cols()), (2, 2));
        // 1 vs 5: inter 2, union 6
        assert_abs_diff_eq!(cost.get(0, 0), 1.0 - 2.0 / 6.0, epsilon = 1e-12);
        // 1 vs 9: disjoint
        assert_eq!(cost.get(0, 1), DISALLOWED);
        // 2 vs 5: disjoint
        assert_eq!(cost.get(1, 0), DISALLOWED);
        // 2 vs 9: inter 1, union 2
        assert_abs_diff_eq!(cost.get(1, 1), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn overlap_at_or_below_threshold_is_disallowed() {
        let (prev, curr) = blocks();
        let p = FrameObjects::new(prev.view());
        let c = FrameObjects::new(curr.view());
        // 1 vs 5 has IoU 1/3, 2 vs 9 has IoU 1/2.
        let cost = compute_cost(&p, &c, &MatchStrategy::Overlap { min_iou: 0.4 }).unwrap();
        assert_eq!(cost.get(0, 0), DISALLOWED);
        assert_abs_diff_eq!(cost.get(1, 1), 0.5, epsilon = 1e-12);

        let cost = compute_cost(&p, &c, &MatchStrategy::Overlap { min_iou: 0.5 }).unwrap();
        assert!(!cost.has_finite());
    }

    #[test]
    fn overlap_rejects_mismatched_shapes() {
        let a = Array3::<u32>::ones((1, 2, 2));
        let b = Array3::<u32>::ones((1, 2, 3));
        let err = compute_cost(
            &FrameObjects::new(a.view()),
            &FrameObjects::new(b.view()),
            &MatchStrategy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn distance_scales_axes_by_spacing() {
        let spacing = VoxelSpacing::new(2.0, 0.1, 0.1);
        // One z step is 2 µm, ten x steps are 1 µm.
        assert_abs_diff_eq!(spacing.distance([0.0, 0.0, 0.0], [1.0, 0.0, 0.0]), 2.0);
        assert_abs_diff_eq!(
            spacing.distance([0.0, 0.0, 0.0], [0.0, 0.0, 10.0]),
            1.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn distance_beyond_threshold_is_disallowed() {
        let mut prev = Array3::<u32>::zeros((1, 1, 20));
        let mut curr = Array3::<u32>::zeros((1, 1, 20));
        prev[[0, 0, 0]] = 1;
        curr[[0, 0, 3]] = 1;
        curr[[0, 0, 19]] = 2;

        let strategy = MatchStrategy::Distance {
            max_dist: 5.0,
            spacing: VoxelSpacing::default(),
        };
        let cost = compute_cost(
            &FrameObjects::new(prev.view()),
            &FrameObjects::new(curr.view()),
            &strategy,
        )
        .unwrap();
        assert_abs_diff_eq!(cost.get(0, 0), 3.0);
        assert_eq!(cost.get(0, 1), DISALLOWED);
        assert!(strategy.accepts(cost.get(0, 0)));
        assert!(!strategy.accepts(cost.get(0, 1)));
    }

    #[test]
    fn empty_side_gives_empty_matrix() {
        let prev = Array3::<u32>::zeros((1, 2, 2));
        let curr = Array3::<u32>::ones((1, 2, 2));
        let cost = compute_cost(
            &FrameObjects::new(prev.view()),
            &FrameObjects::new(curr.view()),
            &MatchStrategy::default(),
        )
        .unwrap();
        assert!(cost.is_empty());
        assert!(!cost.has_finite());
    }

    #[test]
    fn overlap_acceptance_is_strict() {
        let strategy = MatchStrategy::Overlap { min_iou: 0.1 };
        assert!(strategy.accepts(0.5));
        assert!(!strategy.accepts(0.9));
        assert!(!strategy.accepts(1.0));
        assert!(!strategy.accepts(DISALLOWED));
    }
}
