//! Inverse-variance fusion of a cluster into one height.
//!
//! Each accepted member is weighted by `1/σ²`; the fused height is the
//! weighted mean and the fused sigma `1/√Σw`, the closed form
//! combination of independent Gaussian estimates.

use crate::{
    estimate::canonical_order,
    outlier::{resolve, Resolution},
    FuseError, FusionConfig, SourceEstimate, SourceKind, TowerCluster,
};
use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Coarse summary of a fused uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceLabel {
    Low,
    Medium,
    High,
}

impl ConfidenceLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

impl fmt::Display for ConfidenceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    DeviatesFromMedian,
    MissingHeight,
}

/// How estimates of one source kind entered a fused height.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contribution {
    /// Share of the total weight, summing to 1 over all kinds.
    pub weight: f64,

    /// Number of cluster members of this kind.
    pub members: usize,

    /// At least one member of this kind was used.
    pub included: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_excluded: Option<ExclusionReason>,
}

/// Consensus height of one tower cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedHeight {
    pub height_m: f64,

    /// One standard deviation.
    pub uncertainty_m: f64,

    pub contributions: BTreeMap<SourceKind, Contribution>,

    pub confidence: ConfidenceLabel,

    /// Source of the most heavily weighted member.
    pub representative: SourceKind,

    /// Members disagreed and no outlier could be singled out.
    pub low_confidence: bool,

    /// Number of members used.
    pub accepted: usize,
}

/// A member with a height, ready for weighting.
struct Sample<'a> {
    estimate: &'a SourceEstimate,
    height_m: f64,
    sigma_m: f64,
}

/// Fuses `cluster` into one height.
///
/// The result does not depend on the order of the cluster's members.
pub fn fuse_cluster(cluster: &TowerCluster, config: &FusionConfig) -> Result<FusedHeight, FuseError> {
    if cluster.is_empty() {
        return Err(FuseError::EmptyCluster);
    }
    if cluster.len() > config.max_cluster_members {
        return Err(FuseError::ClusterTooLarge(
            cluster.len(),
            config.max_cluster_members,
        ));
    }

    let mut members: Vec<&SourceEstimate> = cluster.members().iter().collect();
    members.sort_by(|a, b| canonical_order(a, b));

    let samples: Vec<Sample> = members
        .iter()
        .filter_map(|&estimate| {
            estimate.height_m().map(|height_m| Sample {
                estimate,
                height_m,
                sigma_m: estimate.uncertainty_m(),
            })
        })
        .collect();
    if samples.is_empty() {
        return Err(FuseError::NoHeight);
    }

    let resolution = resolve(
        &samples
            .iter()
            .map(|s| (s.height_m, s.sigma_m))
            .collect::<Vec<_>>(),
        config.outlier_k,
    );
    let accepted: Vec<&Sample> = samples
        .iter()
        .zip(&resolution.excluded)
        .filter(|(_, excluded)| !**excluded)
        .map(|(sample, _)| sample)
        .collect();

    let fused = if accepted.len() == 1 {
        single(accepted[0], config)
    } else {
        combine(&accepted, &resolution, config)
    };

    let FusedParts {
        height_m,
        uncertainty_m,
        weights,
        confidence,
    } = fused;

    let representative = accepted
        .iter()
        .zip(&weights)
        .max_by(|(a, wa), (b, wb)| {
            wa.total_cmp(wb)
                .then_with(|| a.estimate.kind().cmp(&b.estimate.kind()))
        })
        .map_or(accepted[0].estimate.kind(), |(s, _)| s.estimate.kind());

    let contributions = contributions(&members, &samples, &resolution, &accepted, &weights);

    if resolution.low_confidence {
        warn!(
            "sources disagree on tower at {:?}, median {:?}",
            cluster.centroid(),
            resolution.median_m
        );
    }
    trace!("fused {} members: {height_m} ± {uncertainty_m}", accepted.len());

    Ok(FusedHeight {
        height_m,
        uncertainty_m,
        contributions,
        confidence,
        representative,
        low_confidence: resolution.low_confidence,
        accepted: accepted.len(),
    })
}

struct FusedParts {
    height_m: f64,
    uncertainty_m: f64,
    /// Normalized weight of each accepted sample.
    weights: Vec<f64>,
    confidence: ConfidenceLabel,
}

/// A lone accepted member passes through unchanged, bar the floor.
fn single(sample: &Sample, config: &FusionConfig) -> FusedParts {
    let confidence = if sample.estimate.kind().is_direct_measurement() {
        ConfidenceLabel::Medium
    } else {
        ConfidenceLabel::Low
    };
    FusedParts {
        height_m: sample.height_m,
        uncertainty_m: sample.sigma_m.max(config.uncertainty_floor_m),
        weights: vec![1.0],
        confidence,
    }
}

#[allow(clippy::cast_precision_loss)]
fn combine(accepted: &[&Sample], resolution: &Resolution, config: &FusionConfig) -> FusedParts {
    let sigmas = recency_adjusted(accepted, config);
    let raw_weights: Vec<f64> = sigmas.iter().map(|s| s.powi(2).recip()).collect();
    let total: f64 = raw_weights.iter().sum();
    let height_m = accepted
        .iter()
        .zip(&raw_weights)
        .map(|(s, w)| s.height_m * w)
        .sum::<f64>()
        / total;

    let smallest = sigmas.iter().copied().fold(f64::INFINITY, f64::min);
    let mut uncertainty_m = total
        .sqrt()
        .recip()
        .max(smallest / (accepted.len() as f64).sqrt());
    let confidence = if resolution.low_confidence {
        uncertainty_m *= config.low_confidence_widen_factor;
        ConfidenceLabel::Low
    } else {
        config
            .confidence
            .label(uncertainty_m.max(config.uncertainty_floor_m))
    };

    FusedParts {
        height_m,
        uncertainty_m: uncertainty_m.max(config.uncertainty_floor_m),
        weights: raw_weights.iter().map(|w| w / total).collect(),
        confidence,
    }
}

/// Member sigmas, inflated for age when recency weighting is enabled.
///
/// A sample's weight halves every half-life, so its sigma grows by
/// `√2` per half-life. Undated samples are left alone. If aging leaves
/// no usable weight (every sample so old its weight underflows), the
/// unadjusted sigmas are returned.
fn recency_adjusted(accepted: &[&Sample], config: &FusionConfig) -> Vec<f64> {
    let unadjusted = || -> Vec<f64> { accepted.iter().map(|s| s.sigma_m).collect() };
    let Some(half_life_days) = config.recency_half_life_days else {
        return unadjusted();
    };
    let newest = accepted
        .iter()
        .filter_map(|s| s.estimate.observed_at())
        .max();
    let reference: Option<DateTime<Utc>> = config.as_of.or(newest);
    let adjusted = accepted
        .iter()
        .map(|s| match (reference, s.estimate.observed_at()) {
            (Some(reference), Some(observed)) => {
                #[allow(clippy::cast_precision_loss)]
                let age_days =
                    ((reference - observed).num_seconds() as f64 / SECONDS_PER_DAY).max(0.0);
                s.sigma_m * 2_f64.powf(age_days / (2.0 * half_life_days))
            }
            _ => s.sigma_m,
        })
        .collect::<Vec<f64>>();

    let total: f64 = adjusted.iter().map(|s| s.powi(2).recip()).sum();
    if total.is_normal() {
        adjusted
    } else {
        debug!("recency weights underflow, fusing without them");
        unadjusted()
    }
}

/// Per-kind contribution record.
fn contributions(
    members: &[&SourceEstimate],
    samples: &[Sample],
    resolution: &Resolution,
    accepted: &[&Sample],
    weights: &[f64],
) -> BTreeMap<SourceKind, Contribution> {
    let mut out: BTreeMap<SourceKind, Contribution> = BTreeMap::new();
    for member in members {
        let entry = out.entry(member.kind()).or_insert(Contribution {
            weight: 0.0,
            members: 0,
            included: false,
            reason_excluded: None,
        });
        entry.members += 1;
        if member.height_m().is_none() && entry.reason_excluded.is_none() {
            entry.reason_excluded = Some(ExclusionReason::MissingHeight);
        }
    }
    for (sample, excluded) in samples.iter().zip(&resolution.excluded) {
        if *excluded {
            if let Some(entry) = out.get_mut(&sample.estimate.kind()) {
                entry.reason_excluded = Some(ExclusionReason::DeviatesFromMedian);
            }
        }
    }
    for (sample, weight) in accepted.iter().zip(weights) {
        if let Some(entry) = out.get_mut(&sample.estimate.kind()) {
            entry.weight += weight;
            entry.included = true;
        }
    }
    for entry in out.values_mut() {
        if entry.included {
            entry.reason_excluded = None;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{fuse_cluster, ConfidenceLabel, ExclusionReason};
    use crate::{FuseError, FusionConfig, SourceEstimate, SourceKind, TowerCluster};
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use chrono::{Duration, TimeZone, Utc};
    use geo::point;

    fn est(kind: SourceKind, height: f64, unc: f64) -> SourceEstimate {
        SourceEstimate::new(kind, point!(x: 106.92, y: 47.92), Some(height), unc).unwrap()
    }

    fn fuse(members: Vec<SourceEstimate>, config: &FusionConfig) -> super::FusedHeight {
        fuse_cluster(&TowerCluster::from_members(members, config), config).unwrap()
    }

    #[test]
    fn test_single_source_idempotent() {
        let config = FusionConfig::default();
        let fused = fuse(vec![est(SourceKind::SatelliteShadow, 42.0, 3.5)], &config);
        assert_eq!(fused.height_m, 42.0);
        assert_eq!(fused.uncertainty_m, 3.5);
        assert_eq!(fused.confidence, ConfidenceLabel::Low);
        assert_eq!(fused.accepted, 1);
        assert_eq!(fused.contributions[&SourceKind::SatelliteShadow].weight, 1.0);
    }

    #[test]
    fn test_single_direct_measurement_is_medium() {
        let config = FusionConfig::default();
        let fused = fuse(vec![est(SourceKind::Lidar, 42.0, 0.5)], &config);
        assert_eq!(fused.confidence, ConfidenceLabel::Medium);
        let fused = fuse(vec![est(SourceKind::FieldSurvey, 42.0, 0.2)], &config);
        assert_eq!(fused.confidence, ConfidenceLabel::Medium);
    }

    #[test]
    fn test_second_estimate_shrinks_uncertainty() {
        let config = FusionConfig::default();
        let one = fuse(vec![est(SourceKind::SatelliteShadow, 40.0, 2.0)], &config);
        let two = fuse(
            vec![
                est(SourceKind::SatelliteShadow, 40.0, 2.0),
                est(SourceKind::CommercialStereo, 40.0, 2.0),
            ],
            &config,
        );
        assert!(two.uncertainty_m < one.uncertainty_m);
        assert_relative_eq!(two.uncertainty_m, one.uncertainty_m / 2_f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(two.height_m, 40.0);
    }

    #[test]
    fn test_order_independent() {
        let config = FusionConfig::default();
        let members = vec![
            est(SourceKind::Osm, 31.0, 7.5),
            est(SourceKind::MlEstimate, 27.3, 10.0),
            est(SourceKind::SatelliteShadow, 29.1, 3.5),
            est(SourceKind::CommercialStereo, 30.2, 2.0),
            est(SourceKind::Lidar, 30.05, 0.5),
        ];
        let forward = fuse(members.clone(), &config);
        let mut reversed = members.clone();
        reversed.reverse();
        let backward = fuse(reversed, &config);
        let mut rotated = members;
        rotated.rotate_left(2);
        let rotated = fuse(rotated, &config);
        assert_eq!(forward.height_m.to_bits(), backward.height_m.to_bits());
        assert_eq!(forward.uncertainty_m.to_bits(), backward.uncertainty_m.to_bits());
        assert_eq!(forward, rotated);
    }

    #[test]
    fn test_outlier_robustness() {
        let config = FusionConfig::default();
        let fused = fuse(
            vec![
                est(SourceKind::Lidar, 50.0, 2.0),
                est(SourceKind::SatelliteShadow, 52.0, 2.0),
                est(SourceKind::CommercialStereo, 48.0, 2.0),
                est(SourceKind::Osm, 500.0, 2.0),
            ],
            &config,
        );
        assert!((48.0..=52.0).contains(&fused.height_m));
        assert_eq!(fused.accepted, 3);
        let osm = &fused.contributions[&SourceKind::Osm];
        assert!(!osm.included);
        assert_eq!(osm.weight, 0.0);
        assert_eq!(osm.reason_excluded, Some(ExclusionReason::DeviatesFromMedian));
        assert!(!fused.low_confidence);
    }

    #[test]
    fn test_unresolved_disagreement_widens() {
        let config = FusionConfig::default();
        let fused = fuse(
            vec![
                est(SourceKind::SatelliteShadow, 20.0, 1.0),
                est(SourceKind::CommercialStereo, 80.0, 1.0),
            ],
            &config,
        );
        assert!(fused.low_confidence);
        assert_eq!(fused.accepted, 2);
        assert_relative_eq!(fused.height_m, 50.0);
        assert_relative_eq!(fused.uncertainty_m, 2.0 / 2_f64.sqrt(), epsilon = 1e-12);
        assert_eq!(fused.confidence, ConfidenceLabel::Low);
    }

    #[test]
    fn test_floor_enforced() {
        let config = FusionConfig::builder().uncertainty_floor(1.0).build().unwrap();
        let many = fuse(
            (0..10)
                .map(|_| est(SourceKind::FieldSurvey, 30.0, 0.3))
                .collect(),
            &config,
        );
        assert_eq!(many.uncertainty_m, 1.0);
        let one = fuse(vec![est(SourceKind::FieldSurvey, 30.0, 0.3)], &config);
        assert_eq!(one.uncertainty_m, 1.0);
    }

    #[test]
    fn test_representative_tie_break() {
        let config = FusionConfig::default();
        let fused = fuse(
            vec![
                est(SourceKind::Osm, 30.0, 1.0),
                est(SourceKind::MlEstimate, 30.0, 1.0),
                est(SourceKind::SatelliteShadow, 30.0, 1.0),
            ],
            &config,
        );
        assert_eq!(fused.representative, SourceKind::SatelliteShadow);
        let total: f64 = fused.contributions.values().map(|c| c.weight).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_height() {
        let config = FusionConfig::default();
        let unmeasured =
            SourceEstimate::new(SourceKind::Osm, point!(x: 106.92, y: 47.92), None, 7.5).unwrap();
        let fused = fuse(vec![unmeasured.clone(), est(SourceKind::Lidar, 30.0, 0.5)], &config);
        assert_eq!(fused.accepted, 1);
        assert_eq!(fused.height_m, 30.0);
        assert_eq!(
            fused.contributions[&SourceKind::Osm].reason_excluded,
            Some(ExclusionReason::MissingHeight)
        );

        let cluster = TowerCluster::from_members(vec![unmeasured], &config);
        assert!(matches!(
            fuse_cluster(&cluster, &config),
            Err(FuseError::NoHeight)
        ));
    }

    #[test]
    fn test_empty_and_oversized() {
        let config = FusionConfig::builder().max_cluster_members(2).build().unwrap();
        let empty = TowerCluster::from_members(Vec::new(), &config);
        assert!(matches!(
            fuse_cluster(&empty, &config),
            Err(FuseError::EmptyCluster)
        ));
        let big = TowerCluster::from_members(
            (0..3).map(|_| est(SourceKind::Lidar, 30.0, 0.5)).collect(),
            &config,
        );
        assert!(matches!(
            fuse_cluster(&big, &config),
            Err(FuseError::ClusterTooLarge(3, 2))
        ));
    }

    #[test]
    fn test_recency_down_weights_old() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let old = now - Duration::days(365);
        let members = vec![
            est(SourceKind::SatelliteShadow, 40.0, 2.0).with_observed_at(Some(old)),
            est(SourceKind::CommercialStereo, 44.0, 2.0).with_observed_at(Some(now)),
        ];
        let plain = fuse(members.clone(), &FusionConfig::default());
        assert_relative_eq!(plain.height_m, 42.0);

        let config = FusionConfig::builder()
            .recency_half_life_days(365.0)
            .build()
            .unwrap();
        let recent = fuse(members, &config);
        // One half-life: the old estimate carries half the weight.
        assert_abs_diff_eq!(recent.height_m, (40.0 + 2.0 * 44.0) / 3.0, epsilon = 1e-9);
        assert_eq!(recent.representative, SourceKind::CommercialStereo);
    }

    #[test]
    fn test_recency_on_ancient_members() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let old = now - Duration::days(3 * 365);
        let members = vec![
            est(SourceKind::SatelliteShadow, 40.0, 2.0).with_observed_at(Some(old)),
            est(SourceKind::CommercialStereo, 44.0, 2.0).with_observed_at(Some(old)),
        ];
        let config = FusionConfig::builder()
            .recency_half_life_days(1.0)
            .as_of(now)
            .build()
            .unwrap();
        let fused = fuse(members.clone(), &config);
        assert!(fused.height_m.is_finite());
        assert!(fused.uncertainty_m.is_finite());
        assert_eq!(fused, fuse(members, &FusionConfig::default()));
    }
}
