// SPDX-License-Identifier: Apache-2.0

//! Empirical CDFs and trimmed Wasserstein-1 distance between two measured
//! nanosecond-duration samples.

/// Build an empirical CDF from a raw sample, sampled at `ntiles` equally
/// spaced rank positions.
///
/// `raw` is sorted in place (ascending, stable) and then
/// `cdf[i] = raw[floor(i * (L-1) / (ntiles-1))]` for `i in [0, ntiles)`.
///
/// # Panics
///
/// Panics if `ntiles < 2` or `raw` is empty.
pub fn cdf(raw: &mut [i64], ntiles: usize) -> Vec<i64> {
    assert!(ntiles >= 2, "ntiles must be at least 2");
    assert!(!raw.is_empty(), "cannot build a CDF from an empty sample");

    raw.sort_unstable();
    let l = raw.len();
    (0..ntiles)
        .map(|i| {
            let idx = i * (l - 1) / (ntiles - 1);
            raw[idx]
        })
        .collect()
}

/// Trimmed Wasserstein-1 distance between two empirical CDFs sampled at the
/// same `ntiles` resolution.
///
/// `cut_p` trims the upper `(1 - cut_p)` fraction of quantiles before
/// summing; the divisor stays `ntiles`, not the trimmed count, so `cut_p`
/// zeros out the tail rather than renormalising the remaining mass.
///
/// # Panics
///
/// Panics if `cdf_a` and `cdf_b` differ in length, or if `cut_p` is outside
/// `(0, 1]`.
pub fn wasserstein(cdf_a: &[i64], cdf_b: &[i64], ntiles: usize, cut_p: f64) -> f64 {
    assert_eq!(cdf_a.len(), cdf_b.len());
    assert!(cut_p > 0.0 && cut_p <= 1.0, "cut_p must be in (0, 1]");

    let tile_max = ((cut_p * ntiles as f64).floor() as usize).min(cdf_a.len());
    let sum: i64 = cdf_a[..tile_max]
        .iter()
        .zip(&cdf_b[..tile_max])
        .map(|(&a, &b)| (a - b).abs())
        .sum();
    sum as f64 / ntiles as f64
}

/// The fixed percentile set the quantile-gap report is evaluated at.
pub const REPORT_PERCENTILES: [u32; 7] = [0, 50, 75, 90, 95, 99, 100];

/// One row of the quantile-gap diagnostic table: at percentile `p`,
/// `gap = cdf_b[idx] - cdf_a[idx]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantileGap {
    /// Percentile in `[0, 100]`.
    pub percentile: u32,
    /// `cdf_b[idx] - cdf_a[idx]` in nanoseconds.
    pub gap_ns: i64,
}

/// Compute the quantile-gap table at [`REPORT_PERCENTILES`].
///
/// # Panics
///
/// Panics if `cdf_a` and `cdf_b` differ in length.
pub fn quantile_gaps(cdf_a: &[i64], cdf_b: &[i64]) -> Vec<QuantileGap> {
    assert_eq!(cdf_a.len(), cdf_b.len());
    let ntiles = cdf_a.len();

    REPORT_PERCENTILES
        .iter()
        .map(|&p| {
            let idx = ((p as f64 / 100.0) * (ntiles - 1) as f64).round() as usize;
            QuantileGap {
                percentile: p,
                gap_ns: cdf_b[idx] - cdf_a[idx],
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdf_is_monotone_and_spans_min_max() {
        let mut raw: Vec<i64> = vec![50, 10, 30, 20, 40, 90, 15, 77, 3, 61];
        let c = cdf(&mut raw, 10);
        assert_eq!(c.first().copied(), Some(3));
        assert_eq!(c.last().copied(), Some(90));
        for w in c.windows(2) {
            assert!(w[0] <= w[1], "cdf must be non-decreasing: {c:?}");
        }
    }

    #[test]
    fn wasserstein_of_identical_samples_is_zero() {
        let mut raw: Vec<i64> = (0..1000).map(|i| (i * 37) % 997).collect();
        let c = cdf(&mut raw.clone(), 100);
        for cut_p in [0.1, 0.5, 0.9, 1.0] {
            assert_eq!(wasserstein(&c, &c, 100, cut_p), 0.0);
        }
    }

    #[test]
    fn wasserstein_is_symmetric() {
        let mut a: Vec<i64> = (0..500).map(|i| i * 2).collect();
        let mut b: Vec<i64> = (0..500).map(|i| i * 3 + 7).collect();
        let ca = cdf(&mut a, 50);
        let cb = cdf(&mut b, 50);
        assert_eq!(
            wasserstein(&ca, &cb, 50, 0.8),
            wasserstein(&cb, &ca, 50, 0.8)
        );
    }

    #[test]
    fn cut_p_trims_the_tail_monotonically() {
        let mut a: Vec<i64> = (0..1000).map(|i| i).collect();
        let mut b: Vec<i64> = (0..1000).map(|i| if i > 900 { i * 10 } else { i }).collect();
        let ca = cdf(&mut a, 100);
        let cb = cdf(&mut b, 100);
        let w_half = wasserstein(&ca, &cb, 100, 0.5);
        let w_full = wasserstein(&ca, &cb, 100, 1.0);
        assert!(w_half <= w_full);
    }

    #[test]
    fn quantile_gaps_covers_fixed_percentile_set() {
        let mut a: Vec<i64> = (0..200).collect();
        let mut b: Vec<i64> = (0..200).map(|i| i + 5).collect();
        let ca = cdf(&mut a, 100);
        let cb = cdf(&mut b, 100);
        let gaps = quantile_gaps(&ca, &cb);
        assert_eq!(gaps.len(), REPORT_PERCENTILES.len());
        for g in &gaps {
            assert_eq!(g.gap_ns, 5);
        }
    }
}
