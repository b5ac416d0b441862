use crate::{ConfidenceLabel, FusedTower};
use serde::Serialize;
use std::{collections::BTreeMap, fmt};

/// Coarse height bucket, as used when styling towers on a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeightClass {
    /// Under 20 m.
    Short,
    /// 20 m up to 50 m.
    Medium,
    /// 50 m and over.
    Tall,
}

impl HeightClass {
    pub const SHORT_MAX_M: f64 = 20.0;
    pub const MEDIUM_MAX_M: f64 = 50.0;

    pub fn of(height_m: f64) -> Self {
        if height_m < Self::SHORT_MAX_M {
            Self::Short
        } else if height_m < Self::MEDIUM_MAX_M {
            Self::Medium
        } else {
            Self::Tall
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Tall => "tall",
        }
    }
}

/// Aggregate statistics over a set of fused towers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub mean_m: Option<f64>,
    pub min_m: Option<f64>,
    pub max_m: Option<f64>,
    pub by_height_class: BTreeMap<HeightClass, usize>,
    pub by_confidence: BTreeMap<ConfidenceLabel, usize>,
}

impl Summary {
    pub fn from_towers(towers: &[FusedTower]) -> Self {
        let mut summary = Self {
            count: towers.len(),
            ..Self::default()
        };
        let mut total = 0.0;
        for tower in towers {
            let h = tower.fused.height_m;
            total += h;
            summary.min_m = Some(summary.min_m.map_or(h, |min| min.min(h)));
            summary.max_m = Some(summary.max_m.map_or(h, |max| max.max(h)));
            *summary.by_height_class.entry(HeightClass::of(h)).or_default() += 1;
            *summary
                .by_confidence
                .entry(tower.fused.confidence)
                .or_default() += 1;
        }
        if !towers.is_empty() {
            #[allow(clippy::cast_precision_loss)]
            let count = towers.len() as f64;
            summary.mean_m = Some(total / count);
        }
        summary
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "towers: {}", self.count)?;
        if let (Some(mean), Some(min), Some(max)) = (self.mean_m, self.min_m, self.max_m) {
            writeln!(f, "height: mean {mean:.1} m, min {min:.1} m, max {max:.1} m")?;
        }
        for (class, count) in &self.by_height_class {
            writeln!(f, "  {:<8}{count}", class.as_str())?;
        }
        for (label, count) in &self.by_confidence {
            writeln!(f, "  {:<8}{count}", label.as_str())?;
        }
        Ok(())
    }
}
