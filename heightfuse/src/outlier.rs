//! Median based guard against a single corrupted source (e.g. a
//! building mis-tagged as a tower) dominating a fused height.

/// Per-member outcome of outlier resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Unweighted median of the member heights.
    pub median_m: Option<f64>,

    /// `true` for each member excluded as an outlier, in input order.
    pub excluded: Vec<bool>,

    /// Every member disagreed with the median, so none was excluded.
    pub low_confidence: bool,
}

impl Resolution {
    pub fn accepted(&self) -> usize {
        self.excluded.iter().filter(|excluded| !**excluded).count()
    }
}

/// Unweighted median, `None` when `values` is empty.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    match sorted.len() {
        0 => None,
        n if n % 2 == 1 => Some(sorted[mid]),
        _ => Some((sorted[mid - 1] + sorted[mid]) / 2.0),
    }
}

/// Decides which of `samples` (height, one-sigma uncertainty) to keep.
///
/// A sample deviating from the median by more than `k` of its own
/// sigmas is an outlier. If that would leave nothing, nothing is
/// excluded and the resolution is flagged `low_confidence` instead.
pub fn resolve(samples: &[(f64, f64)], k: f64) -> Resolution {
    let heights: Vec<f64> = samples.iter().map(|(h, _)| *h).collect();
    let Some(median_m) = median(&heights) else {
        return Resolution {
            median_m: None,
            excluded: Vec::new(),
            low_confidence: false,
        };
    };

    let flagged: Vec<bool> = samples
        .iter()
        .map(|(h, sigma)| (h - median_m).abs() > k * sigma)
        .collect();

    if flagged.iter().all(|f| *f) {
        Resolution {
            median_m: Some(median_m),
            excluded: vec![false; samples.len()],
            low_confidence: true,
        }
    } else {
        Resolution {
            median_m: Some(median_m),
            excluded: flagged,
            low_confidence: false,
        }
    }
}
