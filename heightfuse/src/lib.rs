//! # Tower Height Fusion
//!
//! `heightfuse` turns heterogeneous tower height readings (OSM tags,
//! satellite shadow analysis, LiDAR, field surveys, ML estimates,
//! commercial stereo imagery) into one best height per physical tower,
//! with an uncertainty and an auditable account of which sources
//! contributed.

mod cluster;
mod config;
mod error;
mod estimate;
mod fusion;
mod math;
mod normalize;
pub mod outlier;
mod region;
mod summary;

pub use {
    crate::{
        cluster::{match_estimates, TowerCluster},
        config::{default_tolerance_m, ConfidenceThresholds, FusionConfig, FusionConfigBuilder},
        error::{FuseError, MalformedEstimateError},
        estimate::{SourceEstimate, SourceKind, MIN_UNCERTAINTY_M},
        fusion::{fuse_cluster, ConfidenceLabel, Contribution, ExclusionReason, FusedHeight},
        math::distance_m,
        normalize::{
            adapt, parse_length, parse_range, AccuracyTable, NormalizerConfig, RawAccuracy,
            RawLength, RawReading,
        },
        region::{fuse_region, ClusterFailure, FusedTower, RegionReport},
        summary::{HeightClass, Summary},
    },
    geo,
};
