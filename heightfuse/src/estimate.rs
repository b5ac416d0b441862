use crate::MalformedEstimateError;
use chrono::{DateTime, Utc};
use geo::Point;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{cmp::Ordering, fmt};

/// Smallest one-sigma uncertainty (meters) an estimate may carry.
///
/// Zero uncertainty would give a source infinite weight.
pub const MIN_UNCERTAINTY_M: f64 = 0.05;

/// Measurement technique which produced an estimate.
///
/// Variants are declared from lowest to highest precedence, so the
/// derived `Ord` ranks `FieldSurvey` highest and `Osm` lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// OpenStreetMap `height`-like tags.
    Osm,
    /// Height regression model.
    MlEstimate,
    /// Shadow length in satellite imagery.
    SatelliteShadow,
    /// Commercial stereo imagery / photogrammetry.
    CommercialStereo,
    /// Airborne LiDAR point clouds.
    Lidar,
    /// On-site survey.
    FieldSurvey,
}

impl SourceKind {
    /// All kinds, highest precedence first.
    pub const ALL: [Self; 6] = [
        Self::FieldSurvey,
        Self::Lidar,
        Self::CommercialStereo,
        Self::SatelliteShadow,
        Self::MlEstimate,
        Self::Osm,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Osm => "osm",
            Self::MlEstimate => "ml_estimate",
            Self::SatelliteShadow => "satellite_shadow",
            Self::CommercialStereo => "commercial_stereo",
            Self::Lidar => "lidar",
            Self::FieldSurvey => "field_survey",
        }
    }

    /// Sources which physically measure the structure.
    pub fn is_direct_measurement(self) -> bool {
        matches!(self, Self::FieldSurvey | Self::Lidar)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One height observation of one candidate tower from one source.
///
/// Estimates are validated on construction and immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEstimate {
    kind: SourceKind,

    /// WGS84 location, `x` is longitude and `y` latitude.
    location: Point<f64>,

    height_m: Option<f64>,

    /// One standard deviation.
    uncertainty_m: f64,

    /// Height was inferred rather than measured.
    derived: bool,

    observed_at: Option<DateTime<Utc>>,

    /// Source specific data kept for audit.
    payload: Option<Value>,
}

impl SourceEstimate {
    /// Returns a validated estimate.
    ///
    /// Uncertainties below [`MIN_UNCERTAINTY_M`] are raised to it.
    pub fn new(
        kind: SourceKind,
        location: Point<f64>,
        height_m: Option<f64>,
        uncertainty_m: f64,
    ) -> Result<Self, MalformedEstimateError> {
        let (lon, lat) = location.x_y();
        if !(lat.is_finite() && lon.is_finite())
            || !(-90.0..=90.0).contains(&lat)
            || !(-180.0..=180.0).contains(&lon)
        {
            return Err(MalformedEstimateError::Location);
        }
        match height_m {
            Some(h) if h.is_nan() || h.is_infinite() => {
                return Err(MalformedEstimateError::Height(h.to_string()))
            }
            Some(h) if h < 0.0 => return Err(MalformedEstimateError::NegativeHeight(h)),
            _ => (),
        }
        if !uncertainty_m.is_finite() || uncertainty_m < 0.0 {
            return Err(MalformedEstimateError::Accuracy(uncertainty_m.to_string()));
        }
        Ok(Self {
            kind,
            location,
            height_m,
            uncertainty_m: uncertainty_m.max(MIN_UNCERTAINTY_M),
            derived: false,
            observed_at: None,
            payload: None,
        })
    }

    #[must_use]
    pub fn with_derived(mut self, derived: bool) -> Self {
        self.derived = derived;
        self
    }

    #[must_use]
    pub fn with_observed_at(mut self, observed_at: Option<DateTime<Utc>>) -> Self {
        self.observed_at = observed_at;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Option<Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn location(&self) -> Point<f64> {
        self.location
    }

    pub fn height_m(&self) -> Option<f64> {
        self.height_m
    }

    pub fn uncertainty_m(&self) -> f64 {
        self.uncertainty_m
    }

    pub fn is_derived(&self) -> bool {
        self.derived
    }

    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        self.observed_at
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }
}

/// Total order used wherever processing must not depend on the order
/// estimates were supplied in: latitude, longitude, precedence
/// (highest first), height, uncertainty.
pub(crate) fn canonical_order(a: &SourceEstimate, b: &SourceEstimate) -> Ordering {
    a.location
        .y()
        .total_cmp(&b.location.y())
        .then_with(|| a.location.x().total_cmp(&b.location.x()))
        .then_with(|| b.kind.cmp(&a.kind))
        .then_with(|| match (a.height_m, b.height_m) {
            (Some(ha), Some(hb)) => ha.total_cmp(&hb),
            (a, b) => a.is_some().cmp(&b.is_some()),
        })
        .then_with(|| a.uncertainty_m.total_cmp(&b.uncertainty_m))
        .then_with(|| a.observed_at.cmp(&b.observed_at))
}

#[cfg(test)]
mod tests {
    use super::{canonical_order, SourceEstimate, SourceKind, MIN_UNCERTAINTY_M};
    use crate::MalformedEstimateError;
    use geo::point;
    use std::cmp::Ordering;

    #[test]
    fn test_precedence() {
        assert!(SourceKind::FieldSurvey > SourceKind::Lidar);
        assert!(SourceKind::Lidar > SourceKind::CommercialStereo);
        assert!(SourceKind::CommercialStereo > SourceKind::SatelliteShadow);
        assert!(SourceKind::SatelliteShadow > SourceKind::MlEstimate);
        assert!(SourceKind::MlEstimate > SourceKind::Osm);
        let mut sorted = SourceKind::ALL;
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(sorted, SourceKind::ALL);
    }

    #[test]
    fn test_serde_names() {
        let kind: SourceKind = serde_json::from_str("\"satellite_shadow\"").unwrap();
        assert_eq!(kind, SourceKind::SatelliteShadow);
        for kind in SourceKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }

    #[test]
    fn test_uncertainty_floor() {
        let est =
            SourceEstimate::new(SourceKind::Lidar, point!(x: 1.0, y: 1.0), Some(10.0), 0.0).unwrap();
        assert_eq!(est.uncertainty_m(), MIN_UNCERTAINTY_M);
    }

    #[test]
    fn test_rejects_invalid() {
        let p = point!(x: 1.0, y: 1.0);
        assert_eq!(
            SourceEstimate::new(SourceKind::Osm, point!(x: 1.0, y: 91.0), None, 1.0),
            Err(MalformedEstimateError::Location)
        );
        assert_eq!(
            SourceEstimate::new(SourceKind::Osm, point!(x: f64::NAN, y: 1.0), None, 1.0),
            Err(MalformedEstimateError::Location)
        );
        assert_eq!(
            SourceEstimate::new(SourceKind::Osm, p, Some(-1.0), 1.0),
            Err(MalformedEstimateError::NegativeHeight(-1.0))
        );
        assert!(matches!(
            SourceEstimate::new(SourceKind::Osm, p, Some(1.0), -1.0),
            Err(MalformedEstimateError::Accuracy(_))
        ));
    }

    #[test]
    fn test_canonical_order_prefers_precedence() {
        let p = point!(x: 1.0, y: 1.0);
        let osm = SourceEstimate::new(SourceKind::Osm, p, Some(10.0), 1.0).unwrap();
        let lidar = SourceEstimate::new(SourceKind::Lidar, p, Some(10.0), 1.0).unwrap();
        assert_eq!(canonical_order(&lidar, &osm), Ordering::Less);
    }
}
