mod options;

use anyhow::{Context, Error as AnyError};
use clap::Parser;
use heightfuse::{
    adapt, fuse_region, ClusterFailure, FusedTower, FusionConfig, NormalizerConfig, RawReading,
    RegionReport, SourceEstimate, SourceKind, Summary,
};
use log::{info, warn};
use options::{Cli, Command as CliCmd};
use serde::{Deserialize, Serialize};
use std::{fs, io::Write, path::Path};

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    fusion: FusionConfig,
    normalizer: NormalizerConfig,
}

#[derive(Debug, Deserialize)]
struct InputReading {
    source: SourceKind,
    reading: RawReading,
}

fn main() -> Result<(), AnyError> {
    let Cli {
        config,
        threads,
        input,
        cmd,
    } = Cli::parse();

    env_logger::init();

    let ConfigFile {
        mut fusion,
        normalizer,
    } = match config {
        Some(path) => read_json(&path)?,
        None => ConfigFile::default(),
    };
    if threads.is_some() {
        fusion.threads = threads;
    }

    let readings: Vec<InputReading> = read_json(&input)?;
    let estimates = normalize(readings, &normalizer);
    let report = fuse_region(estimates, &fusion)?;
    info!(
        "{} towers fused, {} clusters failed",
        report.towers.len(),
        report.failures.len()
    );

    match cmd {
        CliCmd::Json => print_json(&report)?,
        CliCmd::Csv => print_csv(&report.towers)?,
        CliCmd::Report => print!("{}", Summary::from_towers(&report.towers)),
    };
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, AnyError> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Adapts every reading, dropping (and logging) the malformed ones.
fn normalize(readings: Vec<InputReading>, config: &NormalizerConfig) -> Vec<SourceEstimate> {
    readings
        .into_iter()
        .enumerate()
        .filter_map(
            |(idx, InputReading { source, reading })| match adapt(source, &reading, config) {
                Ok(estimate) => Some(estimate),
                Err(err) => {
                    warn!("dropping reading {idx} from {source}: {err}");
                    None
                }
            },
        )
        .collect()
}

fn print_json(report: &RegionReport) -> Result<(), AnyError> {
    #[derive(Serialize)]
    struct JsonFailure {
        cluster_id: usize,
        lat: f64,
        lon: f64,
        members: usize,
        error: String,
    }

    #[derive(Serialize)]
    struct JsonReport<'a> {
        towers: &'a [FusedTower],
        failures: Vec<JsonFailure>,
    }

    let failures = report
        .failures
        .iter()
        .map(
            |ClusterFailure {
                 cluster_id,
                 lat,
                 lon,
                 members,
                 error,
             }| JsonFailure {
                cluster_id: *cluster_id,
                lat: *lat,
                lon: *lon,
                members: *members,
                error: error.to_string(),
            },
        )
        .collect();
    let json = serde_json::to_string(&JsonReport {
        towers: &report.towers,
        failures,
    })?;
    println!("{json}");
    Ok(())
}

/// # Example
///
/// ```sh
/// towerfuse readings.json csv | sort -t, -k4 -n -r | head
/// ```
fn print_csv(towers: &[FusedTower]) -> Result<(), AnyError> {
    let mut stdout = std::io::stdout().lock();
    writeln!(
        stdout,
        "ClusterId,Latitude,Longitude,Height,Uncertainty,Confidence,Representative,Sources"
    )?;
    for FusedTower {
        cluster_id,
        lat,
        lon,
        fused,
    } in towers
    {
        let sources = fused
            .contributions
            .iter()
            .filter(|(_, contribution)| contribution.included)
            .map(|(kind, _)| kind.as_str())
            .collect::<Vec<_>>()
            .join(";");
        writeln!(
            stdout,
            "{cluster_id},{lat},{lon},{},{},{},{},{sources}",
            fused.height_m, fused.uncertainty_m, fused.confidence, fused.representative,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{normalize, ConfigFile, InputReading};
    use approx::assert_relative_eq;
    use heightfuse::{NormalizerConfig, SourceKind};

    #[test]
    fn test_normalize_drops_malformed() {
        let readings: Vec<InputReading> = serde_json::from_str(
            r#"[
                {"source": "osm", "reading": {"lat": 47.9, "lon": 106.9, "tags": {"height": "80 m"}}},
                {"source": "lidar", "reading": {"lat": 47.9, "lon": 106.9, "height": 83.0, "accuracy": "±0.3-0.7m"}},
                {"source": "ml_estimate", "reading": {"lon": 106.9, "height": 60.0}},
                {"source": "field_survey", "reading": {"lat": 47.9, "lon": 106.9, "height": -4.0}}
            ]"#,
        )
        .unwrap();
        let estimates = normalize(readings, &NormalizerConfig::default());
        assert_eq!(estimates.len(), 2);
        assert_eq!(estimates[0].kind(), SourceKind::Osm);
        assert_eq!(estimates[0].height_m(), Some(80.0));
        assert_relative_eq!(estimates[1].uncertainty_m(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_partial_config_file() {
        let config: ConfigFile =
            serde_json::from_str(r#"{"fusion": {"outlier_k": 2.5}}"#).unwrap();
        assert_eq!(config.fusion.outlier_k, 2.5);
        assert_eq!(config.normalizer, NormalizerConfig::default());
    }
}
