use crate::{cluster::match_estimates, fuse_cluster, FuseError, FusedHeight, FusionConfig, SourceEstimate};
use dashmap::DashMap;
use log::{debug, error};
use rayon::{prelude::*, ThreadPoolBuilder};
use serde::Serialize;

/// Fused height of one tower, with where it is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedTower {
    /// Index of the cluster within its region.
    pub cluster_id: usize,
    pub lat: f64,
    pub lon: f64,
    #[serde(flatten)]
    pub fused: FusedHeight,
}

/// A cluster which could not be fused.
#[derive(Debug)]
pub struct ClusterFailure {
    pub cluster_id: usize,
    pub lat: f64,
    pub lon: f64,
    pub members: usize,
    pub error: FuseError,
}

#[derive(Debug, Default)]
pub struct RegionReport {
    /// Successfully fused towers, by cluster id.
    pub towers: Vec<FusedTower>,

    /// Clusters which failed, by cluster id.
    pub failures: Vec<ClusterFailure>,
}

/// Matches `estimates` into towers and fuses each of them.
///
/// Clusters are fused in parallel. A cluster which fails is reported in
/// `failures` and does not affect any other cluster. The only error
/// returned is for an invalid `config`.
pub fn fuse_region(
    estimates: Vec<SourceEstimate>,
    config: &FusionConfig,
) -> Result<RegionReport, FuseError> {
    config.validate()?;
    match config.threads {
        Some(threads) => {
            let pool = ThreadPoolBuilder::new().num_threads(threads).build()?;
            Ok(pool.install(|| run(estimates, config)))
        }
        None => Ok(run(estimates, config)),
    }
}

fn run(estimates: Vec<SourceEstimate>, config: &FusionConfig) -> RegionReport {
    let clusters = match_estimates(estimates, config);

    let now = std::time::Instant::now();
    // Each cluster id is written exactly once, by the worker fusing it.
    let sink: DashMap<usize, Result<FusedHeight, FuseError>> =
        DashMap::with_capacity(clusters.len());
    clusters
        .par_iter()
        .enumerate()
        .for_each(|(cluster_id, cluster)| {
            sink.insert(cluster_id, fuse_cluster(cluster, config));
        });
    debug!("fused {} clusters in {:?}", clusters.len(), now.elapsed());

    let mut report = RegionReport::default();
    for (cluster_id, cluster) in clusters.iter().enumerate() {
        let Some((_, result)) = sink.remove(&cluster_id) else {
            continue;
        };
        let centroid = cluster.centroid();
        match result {
            Ok(fused) => report.towers.push(FusedTower {
                cluster_id,
                lat: centroid.y(),
                lon: centroid.x(),
                fused,
            }),
            Err(err) => {
                error!("cluster {cluster_id} at {centroid:?}: {err}");
                report.failures.push(ClusterFailure {
                    cluster_id,
                    lat: centroid.y(),
                    lon: centroid.x(),
                    members: cluster.len(),
                    error: err,
                });
            }
        }
    }
    report
}
