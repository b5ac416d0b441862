//! Conversion of source specific readings into `SourceEstimate`s.
//!
//! Qualitative accuracy statements such as `"±5-10m"` are mapped to a
//! one-sigma uncertainty at the midpoint of the stated range. Named
//! accuracy classes and the per-source fallbacks live in
//! [`AccuracyTable`], which is plain configuration.

use crate::{MalformedEstimateError, SourceEstimate, SourceKind};
use chrono::{DateTime, Utc};
use geo::Point;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

const METERS_PER_FOOT: f64 = 0.3048;

/// Unit suffixes, longest first so `"metres"` is not read as `"metre"`
/// followed by garbage.
const UNITS: [(&str, f64); 9] = [
    ("metres", 1.0),
    ("meters", 1.0),
    ("metre", 1.0),
    ("meter", 1.0),
    ("feet", METERS_PER_FOOT),
    ("foot", METERS_PER_FOOT),
    ("ft", METERS_PER_FOOT),
    ("m", 1.0),
    ("'", METERS_PER_FOOT),
];

/// OSM tags holding a structure height, in order of preference.
const OSM_HEIGHT_TAGS: [&str; 3] = ["height", "building:height", "tower:height"];

const OSM_LEVELS_TAG: &str = "building:levels";

/// A length as supplied by a source: a bare number of meters or a
/// string with an optional unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawLength {
    Meters(f64),
    Text(String),
}

impl RawLength {
    pub fn meters(&self) -> Result<f64, MalformedEstimateError> {
        match self {
            Self::Meters(m) => Ok(*m),
            Self::Text(text) => {
                parse_length(text).ok_or_else(|| MalformedEstimateError::Height(text.clone()))
            }
        }
    }
}

/// Accuracy as supplied by a source: a one-sigma number of meters, a
/// named class, or a range such as `"±1-5m"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawAccuracy {
    Meters(f64),
    Text(String),
}

impl RawAccuracy {
    pub fn meters(&self, table: &AccuracyTable) -> Result<f64, MalformedEstimateError> {
        match self {
            Self::Meters(m) if m.is_finite() && *m >= 0.0 => Ok(*m),
            Self::Meters(m) => Err(MalformedEstimateError::Accuracy(m.to_string())),
            Self::Text(text) => table.resolve(text),
        }
    }
}

/// One reading as handed over by an external estimator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawReading {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub height: Option<RawLength>,
    pub accuracy: Option<RawAccuracy>,
    /// OpenStreetMap tags, consulted for `Osm` readings without an
    /// explicit height.
    pub tags: BTreeMap<String, String>,
    pub observed_at: Option<DateTime<Utc>>,
    pub payload: Option<Value>,
}

/// Auditable mapping from qualitative accuracy to meters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccuracyTable {
    /// Named classes (matched case-insensitively) and the range each
    /// stands for.
    pub classes: BTreeMap<String, String>,

    /// Range assumed for readings of a kind which carry no accuracy.
    pub defaults: BTreeMap<SourceKind, String>,
}

impl Default for AccuracyTable {
    fn default() -> Self {
        let classes = [
            ("survey", "±0.1-0.5m"),
            ("high", "±0.5-2m"),
            ("medium", "±2-5m"),
            ("low", "±5-10m"),
            ("very_low", "±10-20m"),
        ]
        .into_iter()
        .map(|(name, range)| (name.to_string(), range.to_string()))
        .collect();
        let defaults = SourceKind::ALL
            .into_iter()
            .map(|kind| (kind, default_accuracy(kind).to_string()))
            .collect();
        Self { classes, defaults }
    }
}

impl AccuracyTable {
    /// Resolves a class name or range string to meters.
    pub fn resolve(&self, text: &str) -> Result<f64, MalformedEstimateError> {
        let key = text.trim().to_lowercase();
        let range = self.classes.get(&key).map_or(text, String::as_str);
        parse_range(range).ok_or_else(|| MalformedEstimateError::Accuracy(text.to_string()))
    }

    /// Uncertainty assumed for a reading of `kind` with no accuracy.
    pub fn default_for(&self, kind: SourceKind) -> Result<f64, MalformedEstimateError> {
        match self.defaults.get(&kind) {
            Some(range) => self.resolve(range),
            None => self.resolve(default_accuracy(kind)),
        }
    }
}

/// Typical accuracy of each technique.
fn default_accuracy(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Osm => "±5-10m",
        SourceKind::MlEstimate => "±5-15m",
        SourceKind::SatelliteShadow => "±2-5m",
        SourceKind::CommercialStereo => "±1-3m",
        SourceKind::Lidar => "±0.3-0.7m",
        SourceKind::FieldSurvey => "±0.1-0.5m",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    pub accuracy: AccuracyTable,

    /// Uncertainty multiplier for heights inferred rather than
    /// measured.
    pub derived_uncertainty_factor: f64,

    /// Storey height used to turn `building:levels` into meters.
    pub meters_per_level: f64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            accuracy: AccuracyTable::default(),
            derived_uncertainty_factor: 2.0,
            meters_per_level: 3.0,
        }
    }
}

/// Converts one raw reading of `kind` into a `SourceEstimate`.
pub fn adapt(
    kind: SourceKind,
    raw: &RawReading,
    config: &NormalizerConfig,
) -> Result<SourceEstimate, MalformedEstimateError> {
    let location = match (raw.lat, raw.lon) {
        (Some(lat), Some(lon)) => Point::new(lon, lat),
        _ => return Err(MalformedEstimateError::Location),
    };

    let (height_m, derived) = match &raw.height {
        Some(height) => (Some(height.meters()?), false),
        None if kind == SourceKind::Osm => osm_height(&raw.tags, config.meters_per_level),
        None => (None, false),
    };

    let mut uncertainty_m = match &raw.accuracy {
        Some(accuracy) => accuracy.meters(&config.accuracy)?,
        None => config.accuracy.default_for(kind)?,
    };
    if derived {
        uncertainty_m *= config.derived_uncertainty_factor;
    }

    Ok(SourceEstimate::new(kind, location, height_m, uncertainty_m)?
        .with_derived(derived)
        .with_observed_at(raw.observed_at)
        .with_payload(raw.payload.clone()))
}

/// Height from OSM tags, and whether it was derived from the number of
/// storeys.
///
/// Unparseable or negative tag values are skipped; mappers put all
/// sorts of things in these tags.
fn osm_height(tags: &BTreeMap<String, String>, meters_per_level: f64) -> (Option<f64>, bool) {
    let tagged = OSM_HEIGHT_TAGS
        .iter()
        .filter_map(|tag| tags.get(*tag))
        .filter_map(|value| parse_length(value))
        .find(|h| *h >= 0.0);
    if tagged.is_some() {
        return (tagged, false);
    }
    let levels = tags
        .get(OSM_LEVELS_TAG)
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|levels| levels.is_finite() && *levels > 0.0);
    match levels {
        Some(levels) => (Some(levels * meters_per_level), true),
        None => (None, false),
    }
}

/// Splits a trailing unit off `text`, returning the remainder and the
/// factor converting it to meters, if a unit was present.
fn split_unit(text: &str) -> (&str, Option<f64>) {
    let trimmed = text.trim();
    let lower = trimmed.to_lowercase();
    for (suffix, factor) in UNITS {
        if !lower.ends_with(suffix) || lower.len() != trimmed.len() {
            continue;
        }
        if let Some(number) = trimmed.get(..trimmed.len() - suffix.len()) {
            return (number.trim_end(), Some(factor));
        }
    }
    (trimmed, None)
}

/// Parses `"45"`, `"45 m"`, `"150 ft"` or `"150'"` into meters.
pub fn parse_length(text: &str) -> Option<f64> {
    let (number, factor) = split_unit(text);
    let value = number.parse::<f64>().ok()?;
    value.is_finite().then_some(value * factor.unwrap_or(1.0))
}

/// Parses an accuracy range into the midpoint in meters.
///
/// Grammar: an optional `±`, `+/-` or `+-` prefix, then a single bound
/// or two bounds joined by `-`, `–` or ` to `. A bound is a
/// non-negative number (scientific notation allowed) with an optional
/// unit. A unit given only after the upper bound applies to both, and
/// meters are assumed when there is none: `"5-10m"`, `"5m-10m"` and
/// `"5 to 10"` all resolve to 7.5 m.
pub fn parse_range(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let unsigned = ["±", "+/-", "+-"]
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))
        .unwrap_or(trimmed);

    let bounds = range_bounds(unsigned)
        .into_iter()
        .map(|bound| {
            let (number, factor) = split_unit(bound);
            let value = number
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0)?;
            Some((value, factor))
        })
        .collect::<Option<Vec<(f64, Option<f64>)>>>()?;
    let shared = bounds.last().and_then(|(_, factor)| *factor).unwrap_or(1.0);
    let meters: Vec<f64> = bounds
        .iter()
        .map(|(value, factor)| value * factor.unwrap_or(shared))
        .collect();
    match meters.as_slice() {
        [value] => Some(*value),
        [lo, hi] => Some((lo + hi) / 2.0),
        _ => None,
    }
}

/// Splits a range body on its separators. A `-` directly after a digit
/// and an `e` is an exponent sign, not a separator.
fn range_bounds(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut prev: (Option<char>, Option<char>) = (None, None);
    for (idx, c) in text.char_indices() {
        let exponent = matches!(prev, (Some(d), Some('e' | 'E')) if d.is_ascii_digit());
        if c == '–' || (c == '-' && !exponent) {
            parts.push(&text[start..idx]);
            start = idx + c.len_utf8();
        }
        prev = (prev.1, Some(c));
    }
    parts.push(&text[start..]);
    parts
        .into_iter()
        .flat_map(|part| part.split(" to "))
        .collect()
}
