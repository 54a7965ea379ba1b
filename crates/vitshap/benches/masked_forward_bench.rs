//! Benchmarks for masked forward passes.
//!
//! Run with: cargo bench --bench masked_forward_bench

use burn::prelude::*;
use burn::tensor::Distribution;
use burn_ndarray::NdArray;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde_json::json;

use vitshap::prelude::*;

type BenchBackend = NdArray;

/// Seeded masks keeping each player with probability one half.
fn create_masks(batch: usize, num_players: usize, device: &<BenchBackend as Backend>::Device) -> PlayerMask<BenchBackend> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let rows: Vec<Vec<f32>> = (0..batch)
        .map(|_| (0..num_players).map(|_| if rng.gen::<bool>() { 1.0 } else { 0.0 }).collect())
        .collect();
    PlayerMask::from_rows(&rows, num_players, device).expect("rows have num_players entries")
}

fn bench_mask_locations(c: &mut Criterion) {
    let device = Default::default();
    let config = SurrogateConfig::new("vit_tiny_patch16_224", MaskLocation::PreSoftmax, TargetType::MultiClass, 10)
        .with_backbone_overrides(json!({ "embed_dim": 64, "depth": 2, "num_heads": 4 }));
    let model = SurrogateModel::<BenchBackend>::new(&config, &device).expect("valid surrogate config");

    let batch = 4;
    let images = Tensor::<BenchBackend, 4>::random([batch, 3, 224, 224], Distribution::Normal(0.0, 1.0), &device);
    let masks = create_masks(batch, model.num_players(), &device).into_inner();

    let mut group = c.benchmark_group("masked_forward");
    group.sample_size(10);

    for location in MaskLocation::ALL {
        group.bench_with_input(BenchmarkId::new("vit_tiny", location.as_str()), &location, |b, &location| {
            b.iter(|| {
                let output = model
                    .masked_forward(images.clone(), masks.clone(), Some(location))
                    .expect("masked forward");
                black_box(output.logits)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_mask_locations);
criterion_main!(benches);
