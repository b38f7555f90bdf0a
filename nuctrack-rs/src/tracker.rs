//! Identity continuity across consecutive frames.
//!
//! Each frame arrives with its own local labels. `track` maps them onto
//! identities issued for the previous frame where an admissible match exists
//! and mints new identities for everything else. Identities only grow and are
//! never handed out twice within one position.
//!
//! When several assignments have the same optimal cost the solver's scan order
//! decides; this is deterministic for a given input but not guaranteed to
//! agree with other solvers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::assignment;
use crate::error::{Error, Result};
use crate::metric::{compute_cost, FrameObjects, MatchStrategy};
use crate::volume::{dims, LabelVolume};

/// First identity issued at the start of every position.
pub const FIRST_IDENTITY: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackParams {
    #[serde(flatten)]
    pub strategy: MatchStrategy,
}

/// Relabel `curr` so that objects continuing from `prev` keep their identity.
///
/// `prev` must already carry global identities (the previous output). Returns
/// the relabeled volume and the next identity to issue.
pub fn track(
    prev: Option<&LabelVolume>,
    curr: &LabelVolume,
    next_identity: u32,
    params: &TrackParams,
) -> Result<(LabelVolume, u32)> {
    let curr_objects = FrameObjects::new(curr.view());
    let mut remap: HashMap<u32, u32> = HashMap::with_capacity(curr_objects.records.len());

    if let Some(prev) = prev {
        if prev.shape() != curr.shape() {
            return Err(Error::ShapeMismatch {
                expected: dims(prev),
                found: dims(curr),
            });
        }
        let prev_objects = FrameObjects::new(prev.view());
        if !prev_objects.is_empty() && !curr_objects.is_empty() {
            let cost = compute_cost(&prev_objects, &curr_objects, &params.strategy)?;
            if cost.has_finite() {
                for (i, j) in assignment::solve(&cost)? {
                    if params.strategy.accepts(cost.get(i, j)) {
                        remap.insert(curr_objects.records[j].label, prev_objects.records[i].label);
                    }
                }
            }
            log::debug!(
                "tracked {} of {} objects ({} previous)",
                remap.len(),
                curr_objects.records.len(),
                prev_objects.records.len()
            );
        }
    }

    // Births, in ascending local label order.
    let mut next = next_identity;
    for record in &curr_objects.records {
        if remap.contains_key(&record.label) {
            continue;
        }
        remap.insert(record.label, next);
        next = next.checked_add(1).ok_or(Error::IdentityOverflow)?;
    }

    let relabeled = curr.mapv(|v| if v == 0 { 0 } else { remap[&v] });
    Ok((relabeled, next))
}

/// Per-position tracking state owned by the frame loop.
#[derive(Debug, Clone)]
pub struct TrackState {
    previous: Option<LabelVolume>,
    next_identity: u32,
}

impl Default for TrackState {
    fn default() -> Self {
        Self {
            previous: None,
            next_identity: FIRST_IDENTITY,
        }
    }
}

impl TrackState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_identity(&self) -> u32 {
        self.next_identity
    }

    pub fn previous(&self) -> Option<&LabelVolume> {
        self.previous.as_ref()
    }

    /// Track `curr` against the stored frame and make the result the new
    /// previous frame. Returns a view of the relabeled frame.
    pub fn advance(&mut self, curr: &LabelVolume, params: &TrackParams) -> Result<&LabelVolume> {
        let (relabeled, next) = track(self.previous.as_ref(), curr, self.next_identity, params)?;
        self.next_identity = next;
        Ok(self.previous.insert(relabeled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::VoxelSpacing;
    use ndarray::Array3;
    use std::collections::BTreeSet;

    fn distinct(v: &LabelVolume) -> BTreeSet<u32> {
        v.iter().copied().filter(|&x| x != 0).collect()
    }

    fn overlap() -> TrackParams {
        TrackParams {
            strategy: MatchStrategy::Overlap { min_iou: 0.1 },
        }
    }

    fn distance(max_dist: f64) -> TrackParams {
        TrackParams {
            strategy: MatchStrategy::Distance {
                max_dist,
                spacing: VoxelSpacing::default(),
            },
        }
    }

    #[test]
    fn first_frame_mints_in_label_order() {
        let curr = Array3::from_shape_vec((1, 1, 4), vec![3, 1, 0, 2]).unwrap();
        let (out, next) = track(None, &curr, 5, &overlap()).unwrap();
        assert_eq!(out.as_slice().unwrap(), &[7, 5, 0, 6]);
        assert_eq!(distinct(&out), BTreeSet::from([5, 6, 7]));
        assert_eq!(next, 8);
    }

    #[test]
    fn moved_object_keeps_identity_by_distance() {
        let mut prev = Array3::<u32>::zeros((4, 1, 1));
        prev[[0, 0, 0]] = 10;
        let mut curr = Array3::<u32>::zeros((4, 1, 1));
        curr[[3, 0, 0]] = 1;

        let (out, next) = track(Some(&prev), &curr, 11, &distance(5.0)).unwrap();
        assert_eq!(out[[3, 0, 0]], 10);
        assert_eq!(next, 11);
    }

    #[test]
    fn distance_at_threshold_is_a_birth() {
        let mut prev = Array3::<u32>::zeros((1, 1, 6));
        prev[[0, 0, 0]] = 4;
        let mut curr = Array3::<u32>::zeros((1, 1, 6));
        curr[[0, 0, 5]] = 1;

        let (out, next) = track(Some(&prev), &curr, 5, &distance(5.0)).unwrap();
        assert_eq!(out[[0, 0, 5]], 5);
        assert_eq!(next, 6);
    }

    #[test]
    fn nearest_predecessor_wins_a_contested_object() {
        let mut prev = Array3::<u32>::zeros((1, 1, 40));
        prev[[0, 0, 2]] = 10;
        prev[[0, 0, 12]] = 11;
        let mut curr = Array3::<u32>::zeros((1, 1, 40));
        curr[[0, 0, 10]] = 1;
        curr[[0, 0, 30]] = 2;

        let (out, next) = track(Some(&prev), &curr, 12, &distance(10.0)).unwrap();
        assert_eq!(out[[0, 0, 10]], 11);
        assert_eq!(out[[0, 0, 30]], 12);
        assert_eq!(next, 13);
    }

    #[test]
    fn weak_overlaps_cannot_outvote_an_admissible_one() {
        // A = 12 on x 0..20, B = 13 on x 20..40.
        // X = 1 on x 17..22: IoU(A, X) = 3/22, IoU(B, X) = 2/23.
        // Y = 2 on x 0..2: IoU(A, Y) = 0.1, no overlap with B.
        let mut prev = Array3::<u32>::zeros((1, 1, 40));
        let mut curr = Array3::<u32>::zeros((1, 1, 40));
        for x in 0..40 {
            prev[[0, 0, x]] = if x < 20 { 12 } else { 13 };
        }
        for x in 17..22 {
            curr[[0, 0, x]] = 1;
        }
        for x in 0..2 {
            curr[[0, 0, x]] = 2;
        }

        let (out, next) = track(Some(&prev), &curr, 14, &overlap()).unwrap();
        assert_eq!(out[[0, 0, 17]], 12);
        assert_eq!(out[[0, 0, 0]], 14);
        assert_eq!(next, 15);
    }

    #[test]
    fn empty_previous_frame_mints_fresh_identities() {
        let prev = Array3::<u32>::zeros((1, 2, 2));
        let curr = Array3::from_shape_vec((1, 2, 2), vec![2, 0, 0, 9]).unwrap();
        let (out, next) = track(Some(&prev), &curr, 3, &overlap()).unwrap();
        assert_eq!(out.as_slice().unwrap(), &[3, 0, 0, 4]);
        assert_eq!(next, 5);
    }

    #[test]
    fn overlap_swaps_local_labels_back() {
        // Segmentation swapped the labels of two stationary objects.
        let prev = Array3::from_shape_vec((1, 1, 6), vec![20, 20, 0, 0, 21, 21]).unwrap();
        let curr = Array3::from_shape_vec((1, 1, 6), vec![2, 2, 0, 0, 1, 1]).unwrap();
        let (out, next) = track(Some(&prev), &curr, 22, &overlap()).unwrap();
        assert_eq!(out, prev);
        assert_eq!(next, 22);
    }

    #[test]
    fn weak_overlap_is_not_a_match() {
        // IoU = 1/10
        let mut prev = Array3::<u32>::zeros((1, 1, 10));
        for x in 0..10 {
            prev[[0, 0, x]] = 1;
        }
        let mut curr = Array3::<u32>::zeros((1, 1, 10));
        curr[[0, 0, 9]] = 1;

        let (out, next) = track(Some(&prev), &curr, 2, &overlap()).unwrap();
        assert_eq!(out[[0, 0, 9]], 2);
        assert_eq!(next, 3);
    }

    #[test]
    fn division_keeps_one_daughter() {
        let prev = Array3::from_shape_vec((1, 1, 6), vec![1, 1, 1, 1, 1, 1]).unwrap();
        let curr = Array3::from_shape_vec((1, 1, 6), vec![1, 1, 1, 0, 2, 2]).unwrap();
        let (out, next) = track(Some(&prev), &curr, 2, &overlap()).unwrap();

        assert_eq!(out[[0, 0, 0]], 1);
        assert_eq!(out[[0, 0, 4]], 2);
        assert_eq!(next, 3);
        assert!(distinct(&out).len() <= distinct(&prev).len() + distinct(&curr).len());
    }

    #[test]
    fn background_and_shape_are_preserved() {
        let prev = Array3::from_shape_vec((2, 1, 2), vec![0, 3, 3, 0]).unwrap();
        let curr = Array3::from_shape_vec((2, 1, 2), vec![5, 0, 0, 6]).unwrap();
        let (out, _) = track(Some(&prev), &curr, 4, &overlap()).unwrap();
        assert_eq!(out.shape(), curr.shape());
        for (o, c) in out.iter().zip(curr.iter()) {
            assert_eq!(*o == 0, *c == 0);
        }
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let prev = Array3::<u32>::ones((1, 2, 2));
        let curr = Array3::<u32>::ones((1, 2, 3));
        assert!(matches!(
            track(Some(&prev), &curr, 2, &overlap()),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn overflow_is_reported() {
        let curr = Array3::from_shape_vec((1, 1, 2), vec![1, 2]).unwrap();
        assert!(matches!(
            track(None, &curr, u32::MAX, &overlap()),
            Err(Error::IdentityOverflow)
        ));
    }

    #[test]
    fn state_identities_are_monotonic_over_a_sequence() {
        let frames = [
            vec![1, 1, 0, 0, 0, 0, 0, 0],
            vec![0, 1, 1, 0, 0, 0, 2, 2],
            vec![0, 0, 0, 0, 0, 0, 0, 0],
            vec![0, 0, 2, 2, 0, 1, 1, 0],
        ];
        let mut state = TrackState::new();
        let mut seen_next = state.next_identity();
        let mut issued: BTreeSet<u32> = BTreeSet::new();

        for frame in frames {
            let curr = Array3::from_shape_vec((1, 1, 8), frame).unwrap();
            let before = state.next_identity();
            let out = state.advance(&curr, &overlap()).unwrap().clone();
            assert!(state.next_identity() >= before);
            for id in distinct(&out) {
                assert!(id < state.next_identity());
                issued.insert(id);
            }
            seen_next = seen_next.max(state.next_identity());
        }
        // frame 0 mints 1, frame 1 continues 1 and mints 2,
        // frame 3 follows an empty frame and mints 3 and 4.
        assert_eq!(issued, BTreeSet::from([1, 2, 3, 4]));
        assert_eq!(seen_next, 5);
    }
}
