use crate::{fusion::ConfidenceLabel, FuseError, SourceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default admission radius (meters) for estimates of `kind`.
///
/// Coarser sources get larger radii: OSM nodes are often placed on the
/// compound rather than the mast itself.
pub fn default_tolerance_m(kind: SourceKind) -> f64 {
    match kind {
        SourceKind::Osm => 50.0,
        SourceKind::MlEstimate => 40.0,
        SourceKind::SatelliteShadow => 25.0,
        SourceKind::CommercialStereo => 15.0,
        SourceKind::Lidar | SourceKind::FieldSurvey => 10.0,
    }
}

/// Upper uncertainty bounds for each confidence label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceThresholds {
    /// Largest uncertainty (meters) still labelled `High`.
    pub high_max_m: f64,

    /// Largest uncertainty (meters) still labelled `Medium`.
    pub medium_max_m: f64,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            high_max_m: 1.0,
            medium_max_m: 5.0,
        }
    }
}

impl ConfidenceThresholds {
    pub fn label(&self, uncertainty_m: f64) -> ConfidenceLabel {
        if uncertainty_m <= self.high_max_m {
            ConfidenceLabel::High
        } else if uncertainty_m <= self.medium_max_m {
            ConfidenceLabel::Medium
        } else {
            ConfidenceLabel::Low
        }
    }
}

/// Parameters for matching and fusing a region.
///
/// Every field has a default, so a partial JSON object deserializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Admission radius (meters) per source kind. Kinds missing from
    /// the map use [`default_tolerance_m`].
    pub tolerance_radius_by_source: BTreeMap<SourceKind, f64>,

    /// A member further than `outlier_k` of its own sigmas from the
    /// cluster median is an outlier.
    pub outlier_k: f64,

    /// No fused uncertainty is reported below this (meters).
    pub uncertainty_floor_m: f64,

    /// Applied to the fused uncertainty of clusters whose members all
    /// disagree with each other.
    pub low_confidence_widen_factor: f64,

    pub confidence: ConfidenceThresholds,

    /// When set, an estimate's weight halves for every this many days
    /// it is older than the reference time.
    pub recency_half_life_days: Option<f64>,

    /// Reference time for recency weighting. Defaults to the newest
    /// observation in each cluster.
    pub as_of: Option<DateTime<Utc>>,

    /// Match square tiles of this many degrees in parallel.
    pub tile_degrees: Option<f64>,

    /// Largest cluster fusion will process.
    pub max_cluster_members: usize,

    /// Worker threads, defaults to the number of cores.
    pub threads: Option<usize>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            tolerance_radius_by_source: SourceKind::ALL
                .iter()
                .map(|&kind| (kind, default_tolerance_m(kind)))
                .collect(),
            outlier_k: 3.0,
            uncertainty_floor_m: 0.05,
            low_confidence_widen_factor: 2.0,
            confidence: ConfidenceThresholds::default(),
            recency_half_life_days: None,
            as_of: None,
            tile_degrees: None,
            max_cluster_members: 10_000,
            threads: None,
        }
    }
}

impl FusionConfig {
    pub fn builder() -> FusionConfigBuilder {
        FusionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Admission radius (meters) for estimates of `kind`.
    pub fn tolerance_m(&self, kind: SourceKind) -> f64 {
        self.tolerance_radius_by_source
            .get(&kind)
            .copied()
            .unwrap_or_else(|| default_tolerance_m(kind))
    }

    /// Largest admission radius of any kind.
    pub fn max_tolerance_m(&self) -> f64 {
        SourceKind::ALL
            .iter()
            .map(|&kind| self.tolerance_m(kind))
            .fold(0.0, f64::max)
    }

    /// Returns the name of the first invalid parameter, if any.
    pub fn validate(&self) -> Result<(), FuseError> {
        fn positive(v: f64) -> bool {
            v.is_finite() && v > 0.0
        }
        if !SourceKind::ALL.iter().all(|&k| positive(self.tolerance_m(k))) {
            return Err(FuseError::Config("tolerance_radius_by_source"));
        }
        if !positive(self.outlier_k) {
            return Err(FuseError::Config("outlier_k"));
        }
        if !positive(self.uncertainty_floor_m) {
            return Err(FuseError::Config("uncertainty_floor_m"));
        }
        if !(self.low_confidence_widen_factor.is_finite() && self.low_confidence_widen_factor >= 1.0)
        {
            return Err(FuseError::Config("low_confidence_widen_factor"));
        }
        let ConfidenceThresholds {
            high_max_m,
            medium_max_m,
        } = self.confidence;
        if !(positive(high_max_m) && positive(medium_max_m) && high_max_m <= medium_max_m) {
            return Err(FuseError::Config("confidence"));
        }
        if self.recency_half_life_days.is_some_and(|h| !positive(h)) {
            return Err(FuseError::Config("recency_half_life_days"));
        }
        if self.tile_degrees.is_some_and(|d| !positive(d) || d > 180.0) {
            return Err(FuseError::Config("tile_degrees"));
        }
        if self.max_cluster_members == 0 {
            return Err(FuseError::Config("max_cluster_members"));
        }
        if self.threads == Some(0) {
            return Err(FuseError::Config("threads"));
        }
        Ok(())
    }
}

pub struct FusionConfigBuilder {
    config: FusionConfig,
}

impl FusionConfigBuilder {
    /// Admission radius for estimates of `kind` (meters).
    #[must_use]
    pub fn tolerance(mut self, kind: SourceKind, meters: f64) -> Self {
        self.config.tolerance_radius_by_source.insert(kind, meters);
        self
    }

    /// Outlier threshold in member sigmas (defaults to 3).
    #[must_use]
    pub fn outlier_k(mut self, k: f64) -> Self {
        self.config.outlier_k = k;
        self
    }

    /// Smallest reported uncertainty (meters, defaults to 0.05).
    #[must_use]
    pub fn uncertainty_floor(mut self, meters: f64) -> Self {
        self.config.uncertainty_floor_m = meters;
        self
    }

    /// Uncertainty multiplier for unresolved disagreement (defaults
    /// to 2).
    #[must_use]
    pub fn low_confidence_widen_factor(mut self, factor: f64) -> Self {
        self.config.low_confidence_widen_factor = factor;
        self
    }

    #[must_use]
    pub fn confidence(mut self, high_max_m: f64, medium_max_m: f64) -> Self {
        self.config.confidence = ConfidenceThresholds {
            high_max_m,
            medium_max_m,
        };
        self
    }

    #[must_use]
    pub fn recency_half_life_days(mut self, days: f64) -> Self {
        self.config.recency_half_life_days = Some(days);
        self
    }

    #[must_use]
    pub fn as_of(mut self, as_of: DateTime<Utc>) -> Self {
        self.config.as_of = Some(as_of);
        self
    }

    #[must_use]
    pub fn tile_degrees(mut self, degrees: f64) -> Self {
        self.config.tile_degrees = Some(degrees);
        self
    }

    #[must_use]
    pub fn max_cluster_members(mut self, members: usize) -> Self {
        self.config.max_cluster_members = members;
        self
    }

    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.config.threads = Some(threads);
        self
    }

    pub fn build(self) -> Result<FusionConfig, FuseError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
