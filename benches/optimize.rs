use criterion::{criterion_group, criterion_main, Criterion, black_box};

use figview::asset::primitives::sphere_geometry;
use figview::optimize::{create_lod_levels, optimize_geometry, GeometryOptions};
use figview::streaming::lod::DEFAULT_LOD_RATIOS;

fn bench_decimate_sphere_20k(c: &mut Criterion) {
    // 128 x 80 sphere, roughly 20k triangles
    let geometry = sphere_geometry(1.0, 128, 80);
    let options = GeometryOptions {
        max_triangles: 5_000,
        ..Default::default()
    };

    c.bench_function("decimate_sphere_20k_to_5k", |b| {
        b.iter(|| optimize_geometry(black_box(&geometry), black_box(&options)));
    });
}

fn bench_decimate_within_budget(c: &mut Criterion) {
    let geometry = sphere_geometry(1.0, 32, 16);
    let options = GeometryOptions::default();

    c.bench_function("decimate_within_budget", |b| {
        b.iter(|| optimize_geometry(black_box(&geometry), black_box(&options)));
    });
}

fn bench_lod_levels(c: &mut Criterion) {
    let geometry = sphere_geometry(1.0, 256, 128);
    let options = GeometryOptions::default();

    c.bench_function("lod_levels_sphere_65k", |b| {
        b.iter(|| create_lod_levels(black_box(&geometry), black_box(&DEFAULT_LOD_RATIOS), &options));
    });
}

criterion_group!(
    benches,
    bench_decimate_sphere_20k,
    bench_decimate_within_budget,
    bench_lod_levels,
);
criterion_main!(benches);
