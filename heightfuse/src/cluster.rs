//! Grouping of estimates which refer to the same physical tower.
//!
//! Matching is a single greedy pass over the estimates in a fixed
//! order: each estimate joins the nearest open cluster if close enough,
//! otherwise it starts a new one. Two real towers closer together than
//! the tolerance radius end up in one cluster; telling them apart would
//! need footprints rather than points.

use crate::{
    estimate::canonical_order,
    math::{distance_m, lat_deg_to_meters, meridian_distance_m, meters_to_lat_deg, Centroid},
    FusionConfig, SourceEstimate,
};
use geo::Point;
use log::{debug, trace};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Estimates believed to reference one physical tower.
#[derive(Debug, Clone, PartialEq)]
pub struct TowerCluster {
    centroid: Point<f64>,

    /// Members in the order they were admitted.
    members: Vec<SourceEstimate>,

    /// Admission radius of the least precise member.
    tolerance_m: f64,
}

impl TowerCluster {
    /// Builds a cluster directly from `members`, e.g. to re-fuse a
    /// previously matched set.
    pub fn from_members(members: Vec<SourceEstimate>, config: &FusionConfig) -> Self {
        let tolerance_m = members
            .iter()
            .map(|m| config.tolerance_m(m.kind()))
            .fold(0.0, f64::max);
        let centroid = members
            .split_first()
            .map(|(first, rest)| {
                rest.iter()
                    .fold(Centroid::new(first.location(), weight(first)), |c, m| {
                        c.with(m.location(), weight(m))
                    })
                    .point()
            })
            .unwrap_or_else(|| Point::new(0.0, 0.0));
        Self {
            centroid,
            members,
            tolerance_m,
        }
    }

    pub fn centroid(&self) -> Point<f64> {
        self.centroid
    }

    pub fn members(&self) -> &[SourceEstimate] {
        &self.members
    }

    pub fn tolerance_m(&self) -> f64 {
        self.tolerance_m
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn into_members(self) -> Vec<SourceEstimate> {
        self.members
    }
}

/// Centroid weight of an estimate.
fn weight(estimate: &SourceEstimate) -> f64 {
    estimate.uncertainty_m().recip()
}

/// A cluster still accepting members.
struct OpenCluster {
    centroid: Centroid,
    members: Vec<SourceEstimate>,
    tolerance_m: f64,
}

impl OpenCluster {
    fn new(estimate: SourceEstimate, config: &FusionConfig) -> Self {
        Self {
            centroid: Centroid::new(estimate.location(), weight(&estimate)),
            tolerance_m: config.tolerance_m(estimate.kind()),
            members: vec![estimate],
        }
    }

    /// Returns the updated centroid and tolerance if `estimate` may
    /// join this cluster.
    ///
    /// Besides the candidate itself, every existing member has to stay
    /// within tolerance of the moved centroid.
    fn admission(
        &self,
        estimate: &SourceEstimate,
        distance: f64,
        config: &FusionConfig,
    ) -> Option<(Centroid, f64)> {
        let tolerance_m = self.tolerance_m.max(config.tolerance_m(estimate.kind()));
        if distance > tolerance_m {
            return None;
        }
        let centroid = self.centroid.with(estimate.location(), weight(estimate));
        let center = centroid.point();
        let fits = std::iter::once(estimate)
            .chain(&self.members)
            .all(|m| distance_m(center, m.location()) <= tolerance_m);
        fits.then_some((centroid, tolerance_m))
    }

    fn close(self) -> TowerCluster {
        TowerCluster {
            centroid: self.centroid.point(),
            members: self.members,
            tolerance_m: self.tolerance_m,
        }
    }
}

/// Partitions `estimates` into tower clusters.
///
/// The result does not depend on the order of `estimates` and is
/// sorted by centroid (latitude, then longitude).
pub fn match_estimates(estimates: Vec<SourceEstimate>, config: &FusionConfig) -> Vec<TowerCluster> {
    let now = std::time::Instant::now();
    let n_estimates = estimates.len();
    let mut clusters = match config.tile_degrees {
        Some(tile_deg) => match_tiled(estimates, tile_deg, config),
        None => sweep(estimates, config),
    };
    clusters.sort_by(|a, b| {
        a.centroid
            .y()
            .total_cmp(&b.centroid.y())
            .then_with(|| a.centroid.x().total_cmp(&b.centroid.x()))
            .then_with(|| canonical_order(&a.members[0], &b.members[0]))
    });
    debug!(
        "matched {} estimates into {} clusters in {:?}",
        n_estimates,
        clusters.len(),
        now.elapsed()
    );
    clusters
}

/// Sequential matching of one region.
///
/// Estimates are visited south to north. A cluster whose centroid has
/// fallen further south of the sweep line than the largest tolerance
/// can not admit anything else and is closed.
fn sweep(mut estimates: Vec<SourceEstimate>, config: &FusionConfig) -> Vec<TowerCluster> {
    estimates.sort_by(canonical_order);
    let window_deg = meters_to_lat_deg(config.max_tolerance_m());
    let mut open: Vec<OpenCluster> = Vec::new();
    let mut closed: Vec<TowerCluster> = Vec::with_capacity(estimates.len());

    for estimate in estimates {
        let sweep_lat = estimate.location().y();
        let mut idx = 0;
        while idx < open.len() {
            if open[idx].centroid.point().y() < sweep_lat - window_deg {
                closed.push(open.swap_remove(idx).close());
            } else {
                idx += 1;
            }
        }

        let nearest = open
            .iter()
            .enumerate()
            .map(|(idx, cluster)| (idx, distance_m(cluster.centroid.point(), estimate.location())))
            .min_by(|(_, a), (_, b)| a.total_cmp(b));

        let admission = nearest.and_then(|(idx, distance)| {
            open[idx]
                .admission(&estimate, distance, config)
                .map(|admission| (idx, admission))
        });

        match admission {
            Some((idx, (centroid, tolerance_m))) => {
                trace!("admitting {:?} estimate into cluster {idx}", estimate.kind());
                let cluster = &mut open[idx];
                cluster.centroid = centroid;
                cluster.tolerance_m = tolerance_m;
                cluster.members.push(estimate);
            }
            None => open.push(OpenCluster::new(estimate, config)),
        }
    }

    closed.extend(open.into_iter().map(OpenCluster::close));
    closed
}

type TileKey = (i64, i64);

#[allow(clippy::cast_possible_truncation)]
fn tile_key(point: Point<f64>, tile_deg: f64) -> TileKey {
    (
        (point.y() / tile_deg).floor() as i64,
        (point.x() / tile_deg).floor() as i64,
    )
}

/// Whether `point` lies within `margin_m` of an edge of tile `key`, or
/// of the antimeridian (which is not a tile edge unless `tile_deg`
/// divides 180).
#[allow(clippy::cast_precision_loss)]
fn near_tile_edge(point: Point<f64>, key: TileKey, tile_deg: f64, margin_m: f64) -> bool {
    let (row, col) = key;
    let south = row as f64 * tile_deg;
    let west = col as f64 * tile_deg;
    let lat_gap_deg = (point.y() - south).min(south + tile_deg - point.y());
    let lon_gap_deg = (point.x() - west)
        .min(west + tile_deg - point.x())
        .min(180.0 - point.x().abs());
    lat_deg_to_meters(lat_gap_deg) < margin_m
        || lon_gap_deg < 0.0
        || meridian_distance_m(point.y(), lon_gap_deg) < margin_m
}

/// Matches tiles in parallel, then re-matches the clusters near tile
/// edges together so towers on a boundary are not split.
fn match_tiled(
    estimates: Vec<SourceEstimate>,
    tile_deg: f64,
    config: &FusionConfig,
) -> Vec<TowerCluster> {
    let mut tiles: BTreeMap<TileKey, Vec<SourceEstimate>> = BTreeMap::new();
    for estimate in estimates {
        tiles
            .entry(tile_key(estimate.location(), tile_deg))
            .or_default()
            .push(estimate);
    }
    let n_tiles = tiles.len();

    let margin_m = config.max_tolerance_m();
    let (interior, boundary): (Vec<Vec<TowerCluster>>, Vec<Vec<SourceEstimate>>) = tiles
        .into_par_iter()
        .map(|(key, estimates)| {
            let mut interior = Vec::new();
            let mut boundary = Vec::new();
            for cluster in sweep(estimates, config) {
                if near_tile_edge(cluster.centroid, key, tile_deg, margin_m) {
                    boundary.extend(cluster.into_members());
                } else {
                    interior.push(cluster);
                }
            }
            (interior, boundary)
        })
        .unzip();

    let boundary: Vec<SourceEstimate> = boundary.into_iter().flatten().collect();
    debug!(
        "matched {n_tiles} tiles, reconciling {} boundary estimates",
        boundary.len()
    );
    let mut clusters: Vec<TowerCluster> = interior.into_iter().flatten().collect();
    clusters.extend(sweep(boundary, config));
    clusters
}
