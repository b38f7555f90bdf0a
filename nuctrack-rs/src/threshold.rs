//! Otsu's threshold on a 256-bin histogram.

use crate::error::{Error, Result};

const BINS: usize = 256;

/// Threshold maximizing between-class variance. Values strictly above the
/// returned threshold form the foreground class.
///
/// Fails on empty input, non-finite values, or data with no spread.
pub fn otsu<I>(values: I) -> Result<f64>
where
    I: IntoIterator<Item = f64>,
    I::IntoIter: Clone,
{
    let iter = values.into_iter();
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut count = 0usize;
    for v in iter.clone() {
        if !v.is_finite() {
            return Err(Error::DegenerateDistribution(format!(
                "non-finite value {v} in threshold input"
            )));
        }
        min = min.min(v);
        max = max.max(v);
        count += 1;
    }
    if count == 0 {
        return Err(Error::DegenerateDistribution("no values to threshold".into()));
    }
    if max <= min {
        return Err(Error::DegenerateDistribution(format!(
            "all {count} values equal {min}"
        )));
    }

    let width = (max - min) / BINS as f64;
    let mut hist = [0u64; BINS];
    for v in iter {
        let bin = (((v - min) / width) as usize).min(BINS - 1);
        hist[bin] += 1;
    }
    let center = |b: usize| min + width * (b as f64 + 0.5);

    let total = count as f64;
    let sum_all: f64 = (0..BINS).map(|b| hist[b] as f64 * center(b)).sum();

    let mut weight_bg = 0.0;
    let mut sum_bg = 0.0;
    let mut best = f64::NEG_INFINITY;
    let mut best_bin = 0;
    for b in 0..BINS - 1 {
        weight_bg += hist[b] as f64;
        sum_bg += hist[b] as f64 * center(b);
        let weight_fg = total - weight_bg;
        if weight_bg == 0.0 || weight_fg == 0.0 {
            continue;
        }
        let mean_bg = sum_bg / weight_bg;
        let mean_fg = (sum_all - sum_bg) / weight_fg;
        let between = weight_bg * weight_fg * (mean_bg - mean_fg).powi(2);
        if between > best {
            best = between;
            best_bin = b;
        }
    }
    // Upper edge of the split bin, so `v > t` never cuts a bin in half.
    Ok(min + width * (best_bin + 1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separates_two_modes() {
        let mut values = vec![10.0; 50];
        values.extend(vec![200.0; 30]);
        let t = otsu(values.iter().copied()).unwrap();
        assert!(t > 10.0 && t < 200.0, "threshold {t}");
    }

    #[test]
    fn skewed_modes_still_split() {
        let values: Vec<f64> = (0..100)
            .map(|i| if i < 90 { 1.0 + (i % 5) as f64 * 0.01 } else { 5.0 })
            .collect();
        let t = otsu(values.iter().copied()).unwrap();
        assert!(values.iter().filter(|&&v| v > t).count() == 10);
    }

    #[test]
    fn constant_input_is_degenerate() {
        assert!(matches!(
            otsu(vec![3.0; 8]),
            Err(Error::DegenerateDistribution(_))
        ));
    }

    #[test]
    fn empty_input_is_degenerate() {
        assert!(matches!(
            otsu(Vec::<f64>::new()),
            Err(Error::DegenerateDistribution(_))
        ));
    }

    #[test]
    fn nan_is_degenerate() {
        assert!(otsu(vec![1.0, f64::NAN, 2.0]).is_err());
    }
}
