use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use mesh_cmfe::algs::communicator::NoComm;
use mesh_cmfe::algs::partition::{PartitionConfig, partition_into};
use mesh_cmfe::geometry::Aabb;

fn cloud(n: usize, seed: u64) -> Vec<[f64; 3]> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            // clustered towards the origin so pivots need refinement
            let r: f64 = rng.gen_range(0.0f64..1.0).powi(3);
            [r * 10.0, rng.gen_range(0.0..10.0), rng.gen_range(0.0..10.0)]
        })
        .collect()
}

fn bench_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_partition");
    let cfg = PartitionConfig::default();

    for &(n, parts) in &[(10_000, 8), (100_000, 8), (100_000, 64)] {
        let pts = cloud(n, 42);
        let bounds = Aabb::from_points(pts.iter());
        group.bench_with_input(
            BenchmarkId::new(format!("n{n}"), parts),
            &parts,
            |b, &parts| {
                b.iter(|| partition_into(&pts, &bounds, parts, &NoComm, &cfg).unwrap());
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_partition);
criterion_main!(benches);
