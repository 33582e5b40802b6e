use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hsne::knn::{find_k_nearest_neighbors, find_k_nearest_neighbors_approx};
use mimalloc::MiMalloc;
use ndarray::Array2;
use rand::prelude::*;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn knn_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("KNN Benchmark");
    group.sample_size(10);

    // Perplexity 30 with multiplier 3
    let k = 90;
    let dim = 50;
    let sizes = vec![1000, 5000, 10000, 20000];

    let mut rng = Pcg64Mcg::from_seed([0u8; 16]);
    let datasets: Vec<(usize, Array2<f32>)> = sizes
        .iter()
        .map(|&size| (size, generate_random_data(size, dim, &mut rng)))
        .collect();

    for (size, data) in datasets {
        group.bench_with_input(BenchmarkId::new("Exact", size), &data, |b, data| {
            b.iter(|| {
                let (neighbors, distances) = find_k_nearest_neighbors(data.view(), k);
                black_box((neighbors, distances));
            });
        });

        group.bench_with_input(BenchmarkId::new("Approximate", size), &data, |b, data| {
            b.iter(|| match find_k_nearest_neighbors_approx(data.view(), k, 1024, 16) {
                Ok((neighbors, distances)) => {
                    black_box((neighbors, distances));
                }
                Err(err) => {
                    panic!("Error during approximate KNN: {err:?}");
                }
            });
        });
    }

    group.finish();
}

fn generate_random_data(n: usize, dim: usize, rng: &mut impl Rng) -> Array2<f32> {
    Array2::from_shape_fn((n, dim), |_| rng.gen())
}

criterion_group!(benches, knn_benchmark);
criterion_main!(benches);
