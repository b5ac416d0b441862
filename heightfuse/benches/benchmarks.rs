use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use heightfuse::{fuse_region, geo::point, FusionConfig, SourceEstimate, SourceKind};

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// A `side` x `side` grid of towers roughly 1 km apart, each seen by
/// four sources jittered by a few meters.
fn synthetic_region(side: u32) -> Vec<SourceEstimate> {
    let kinds = [
        (SourceKind::Osm, 7.5),
        (SourceKind::SatelliteShadow, 3.5),
        (SourceKind::Lidar, 0.5),
        (SourceKind::MlEstimate, 10.0),
    ];
    let mut estimates = Vec::new();
    for row in 0..side {
        for col in 0..side {
            let lat = 47.0 + f64::from(row) * 0.01;
            let lon = 106.0 + f64::from(col) * 0.01;
            let height = 20.0 + f64::from((row * 7 + col * 13) % 60);
            for (i, (kind, sigma)) in (0u32..).zip(kinds) {
                let jitter = f64::from(i) * 1e-5;
                estimates.push(
                    SourceEstimate::new(
                        kind,
                        point!(x: lon + jitter, y: lat - jitter),
                        Some(height + f64::from(i)),
                        sigma,
                    )
                    .unwrap(),
                );
            }
        }
    }
    estimates
}

fn region_fusion(c: &mut Criterion) {
    let mut group = c.benchmark_group("Region Fusion");

    let tiled = FusionConfig::builder().tile_degrees(0.1).build().unwrap();
    let untiled = FusionConfig::default();

    for side in [10, 50] {
        let estimates = synthetic_region(side);
        group.bench_with_input(
            BenchmarkId::new("sweep", side),
            &(estimates.clone(), &untiled),
            |b, (e, config)| b.iter(|| fuse_region(e.clone(), config).unwrap()),
        );
        group.bench_with_input(
            BenchmarkId::new("tiled", side),
            &(estimates, &tiled),
            |b, (e, config)| b.iter(|| fuse_region(e.clone(), config).unwrap()),
        );
    }
}

criterion_group!(benches, region_fusion);
criterion_main!(benches);
