use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use hsne::calibration::compute_joint_probability_distribution;
use hsne::{CalibrationConfiguration, Initialization, Tsne, TsneConfiguration};
use mimalloc::MiMalloc;
use ndarray::Array2;
use rand::prelude::*;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn generate_random_data(n: usize, d: usize, seed: u64) -> Array2<f32> {
    let mut rng = SmallRng::seed_from_u64(seed);
    Array2::from_shape_fn((n, d), |_| rng.gen())
}

fn bench_tsne_iterations(c: &mut Criterion) {
    let mut group = c.benchmark_group("tsne_iteration");
    group.sample_size(10);

    let calibration = CalibrationConfiguration::builder().perplexity(10.0).build();
    for &n in &[500, 2000, 5000] {
        let data = generate_random_data(n, 32, 42);
        let Ok(p) = compute_joint_probability_distribution(data.view(), &calibration) else {
            panic!("Calibration failed for n={n}");
        };

        for &theta in &[0.0, 0.5] {
            let config = TsneConfiguration::builder()
                .theta(theta)
                .initialization(Initialization::Random {
                    std: 1e-4,
                    seed: Some(42),
                })
                .build();
            let Ok(tsne) = Tsne::initialize(&p, config) else {
                panic!("Initialization failed for n={n}");
            };

            group.bench_with_input(
                BenchmarkId::new(format!("theta={theta}"), n),
                &tsne,
                |b, tsne| {
                    b.iter_batched(
                        || tsne.clone(),
                        |mut tsne| tsne.do_an_iteration(),
                        criterion::BatchSize::LargeInput,
                    );
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_tsne_iterations);
criterion_main!(benches);
