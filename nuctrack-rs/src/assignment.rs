//! Rectangular linear sum assignment.
//!
//! Shortest augmenting path with row/column potentials (the Jonker-Volgenant
//! family, same rectangular formulation as SciPy's `linear_sum_assignment`).
//! Infinite costs are edges that do not exist. They are replaced by a finite
//! placeholder dearer than any set of real edges before solving, so the
//! result pairs as many rows as the real edges allow at minimum total cost.
//! Pairs that landed on a placeholder are dropped from the answer.

use crate::error::{Error, Result};
use crate::metric::CostMatrix;

/// Minimum total cost one-to-one pairing, as `(row, col)` sorted by row.
pub fn solve(cost: &CostMatrix) -> Result<Vec<(usize, usize)>> {
    for r in 0..cost.rows() {
        for c in 0..cost.cols() {
            let v = cost.get(r, c);
            if v.is_nan() || v == f64::NEG_INFINITY {
                return Err(Error::InvalidCost(format!("entry ({r}, {c}) is {v}")));
            }
        }
    }
    if cost.is_empty() {
        return Ok(Vec::new());
    }

    // The augmenting loop runs over rows, so keep rows <= cols.
    let transposed = cost.rows() > cost.cols();
    let mut work = if transposed {
        cost.transposed()
    } else {
        cost.clone()
    };
    fill_missing_edges(&mut work);

    let col4row = shortest_augmenting_path(&work);
    let mut pairs: Vec<(usize, usize)> = col4row
        .into_iter()
        .enumerate()
        .filter_map(|(r, c)| c.map(|c| if transposed { (c, r) } else { (r, c) }))
        .filter(|&(r, c)| cost.get(r, c).is_finite())
        .collect();
    pairs.sort_unstable();
    Ok(pairs)
}

/// Replace infinite entries with a cost larger than the spread of any sum of
/// finite entries. One extra real edge then always beats any saving in cost.
fn fill_missing_edges(cost: &mut CostMatrix) {
    let mut spread = 0.0;
    for r in 0..cost.rows() {
        for c in 0..cost.cols() {
            let v = cost.get(r, c);
            if v.is_finite() {
                spread += v.abs();
            }
        }
    }
    let placeholder = 2.0 * spread + 1.0;
    for r in 0..cost.rows() {
        for c in 0..cost.cols() {
            if !cost.get(r, c).is_finite() {
                cost.set(r, c, placeholder);
            }
        }
    }
}

struct Search {
    u: Vec<f64>,
    v: Vec<f64>,
    shortest: Vec<f64>,
    path: Vec<usize>,
    row4col: Vec<Option<usize>>,
    col4row: Vec<Option<usize>>,
    visited_rows: Vec<bool>,
    visited_cols: Vec<bool>,
}

fn shortest_augmenting_path(cost: &CostMatrix) -> Vec<Option<usize>> {
    let nr = cost.rows();
    let nc = cost.cols();
    let mut s = Search {
        u: vec![0.0; nr],
        v: vec![0.0; nc],
        shortest: vec![f64::INFINITY; nc],
        path: vec![usize::MAX; nc],
        row4col: vec![None; nc],
        col4row: vec![None; nr],
        visited_rows: vec![false; nr],
        visited_cols: vec![false; nc],
    };

    for cur_row in 0..nr {
        let Some((sink, min_val)) = find_path(cost, &mut s, cur_row) else {
            continue;
        };

        // Update potentials along the explored tree.
        s.u[cur_row] += min_val;
        for i in 0..nr {
            if s.visited_rows[i] && i != cur_row {
                if let Some(j) = s.col4row[i] {
                    s.u[i] += min_val - s.shortest[j];
                }
            }
        }
        for j in 0..nc {
            if s.visited_cols[j] {
                s.v[j] -= min_val - s.shortest[j];
            }
        }

        // Flip the augmenting path.
        let mut j = sink;
        loop {
            let i = s.path[j];
            s.row4col[j] = Some(i);
            let prev = s.col4row[i].replace(j);
            if i == cur_row {
                break;
            }
            match prev {
                Some(p) => j = p,
                None => break,
            }
        }
    }
    s.col4row
}

/// Dijkstra over reduced costs from `start`. Returns the free column reached
/// and the path length, or `None` when every reachable column costs infinity.
/// With missing edges filled in this only happens on overflowing costs.
fn find_path(cost: &CostMatrix, s: &mut Search, start: usize) -> Option<(usize, f64)> {
    let nc = cost.cols();
    let mut min_val = 0.0;
    let mut remaining: Vec<usize> = (0..nc).rev().collect();
    s.visited_rows.iter_mut().for_each(|x| *x = false);
    s.visited_cols.iter_mut().for_each(|x| *x = false);
    s.shortest.iter_mut().for_each(|x| *x = f64::INFINITY);

    let mut i = start;
    loop {
        s.visited_rows[i] = true;
        let mut lowest = f64::INFINITY;
        let mut index = usize::MAX;

        for (it, &j) in remaining.iter().enumerate() {
            let r = min_val + cost.get(i, j) - s.u[i] - s.v[j];
            if r < s.shortest[j] {
                s.path[j] = i;
                s.shortest[j] = r;
            }
            // Prefer free columns on ties so paths stay short.
            if s.shortest[j] < lowest || (s.shortest[j] == lowest && s.row4col[j].is_none()) {
                lowest = s.shortest[j];
                index = it;
            }
        }

        if !lowest.is_finite() || index == usize::MAX {
            return None;
        }
        min_val = lowest;
        let j = remaining.swap_remove(index);
        s.visited_cols[j] = true;
        match s.row4col[j] {
            None => return Some((j, min_val)),
            Some(next) => i = next,
        }
    }
}
