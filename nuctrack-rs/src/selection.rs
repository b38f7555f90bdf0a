//! Position selection expressions.
//!
//! A selection is a comma-separated list of terms, each one of: `all`, an
//! index (`3`, `-1`), a half-open range `start:stop[:step]` whose bounds may
//! be negative and are clamped to the plate, or a position id such as
//! `A/1/0`. The result is the sorted, de-duplicated list of selected indices
//! into the plate-ordered positions.

use std::collections::BTreeSet;

use crate::error::{Error, Result};

fn invalid(term: &str, why: &str) -> Error {
    Error::Config(format!("invalid position selection {term:?}: {why}"))
}

/// Resolve `expr` against the plate-ordered position ids.
pub fn select_positions(expr: &str, ids: &[String]) -> Result<Vec<usize>> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(invalid(expr, "empty selection"));
    }
    let len = ids.len() as isize;
    let mut picked = BTreeSet::new();

    for term in expr.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if term.eq_ignore_ascii_case("all") {
            picked.extend(0..ids.len());
        } else if let Some(i) = ids.iter().position(|id| id == term) {
            picked.insert(i);
        } else if term.contains(':') {
            let (start, stop, step) = parse_range(term)?;
            picked.extend(range_indices(start, stop, step, len));
        } else {
            let idx: isize = term
                .parse()
                .map_err(|_| invalid(term, "not an index, range or position id"))?;
            if idx < -len || idx >= len {
                return Err(invalid(term, &format!("index out of range for {len} positions")));
            }
            picked.insert(if idx < 0 { idx + len } else { idx } as usize);
        }
    }
    Ok(picked.into_iter().collect())
}

fn parse_range(term: &str) -> Result<(Option<isize>, Option<isize>, isize)> {
    let parts = term
        .split(':')
        .map(|p| match p.trim() {
            "" => Ok(None),
            t => t.parse().map(Some).map_err(|_| invalid(term, "bad range bound")),
        })
        .collect::<Result<Vec<Option<isize>>>>()?;
    if parts.len() > 3 {
        return Err(invalid(term, "too many ':'"));
    }
    let step = parts.get(2).copied().flatten().unwrap_or(1);
    if step == 0 {
        return Err(invalid(term, "step cannot be zero"));
    }
    Ok((parts[0], parts.get(1).copied().flatten(), step))
}

/// Indices of `start:stop:step` over a sequence of `len`. Negative bounds
/// count from the end; out-of-range bounds are clamped.
fn range_indices(start: Option<isize>, stop: Option<isize>, step: isize, len: isize) -> Vec<usize> {
    let clamp = |v: isize, lo: isize, hi: isize| {
        let v = if v < 0 { v + len } else { v };
        v.clamp(lo, hi)
    };
    let (lo, hi) = if step > 0 { (0, len) } else { (-1, len - 1) };
    let start = start.map_or(if step > 0 { 0 } else { len - 1 }, |s| clamp(s, lo, hi));
    let stop = stop.map_or(if step > 0 { len } else { -1 }, |s| clamp(s, lo, hi));

    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(i as usize);
        i += step;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("A/1/{i}")).collect()
    }

    #[test]
    fn all_selects_everything() {
        assert_eq!(select_positions("all", &ids(3)).unwrap(), vec![0, 1, 2]);
        assert_eq!(select_positions(" ALL ", &ids(2)).unwrap(), vec![0, 1]);
    }

    #[test]
    fn indices_and_negative_indices() {
        assert_eq!(select_positions("2,0,-1", &ids(4)).unwrap(), vec![0, 2, 3]);
    }

    #[test]
    fn ranges_follow_slice_semantics() {
        assert_eq!(select_positions("1:", &ids(4)).unwrap(), vec![1, 2, 3]);
        assert_eq!(select_positions("0:10:2", &ids(5)).unwrap(), vec![0, 2, 4]);
        assert_eq!(select_positions("::-2", &ids(5)).unwrap(), vec![0, 2, 4]);
        assert_eq!(select_positions("-2:", &ids(5)).unwrap(), vec![3, 4]);
        assert!(select_positions("3:1", &ids(5)).unwrap().is_empty());
    }

    #[test]
    fn position_ids_are_accepted() {
        assert_eq!(select_positions("A/1/2, A/1/0", &ids(3)).unwrap(), vec![0, 2]);
    }

    #[test]
    fn bad_terms_are_config_errors() {
        for expr in ["", "5", "B/1/0", "0:1:0", "1:2:3:4", "x:"] {
            assert!(
                matches!(select_positions(expr, &ids(3)), Err(Error::Config(_))),
                "{expr:?}"
            );
        }
    }
}
