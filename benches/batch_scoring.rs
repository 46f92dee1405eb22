// ========================================================================================
//
//                     DIARISK BATCH SCORING BENCHMARK
//
// ========================================================================================
//
// Measures the cost of one batch request end to end (matrix build + one model call)
// for both demonstration artifacts, across a range of batch sizes.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use diarisk::{FeatureRecord, Predictor, load_handle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;

// --- Benchmark Tuning Parameters ---

/// Batch sizes to test. This array defines the x-axis of the final plot.
const BATCH_SIZES: [usize; 5] = [1, 16, 256, 4096, 65_536];
const ARTIFACTS: [&str; 2] = ["diabetes_risk.toml", "diabetes_risk_trees.toml"];

fn make_records(n: usize) -> Vec<FeatureRecord> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n)
        .map(|_| {
            let mut values = [0.0; 18];
            for (i, value) in values.iter_mut().enumerate() {
                *value = if i >= 15 {
                    rng.gen_range(0..=1) as f64
                } else {
                    rng.gen_range(0.0..250.0)
                };
            }
            FeatureRecord::from_values(values).expect("generated record is valid")
        })
        .collect()
}

fn bench_batch_scoring(c: &mut Criterion) {
    let models_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("models");
    let mut group = c.benchmark_group("predict_batch");

    for artifact in ARTIFACTS {
        let predictor =
            Predictor::new(load_handle(models_dir.join(artifact)).expect("artifact loads"));
        for &size in &BATCH_SIZES {
            let records = make_records(size);
            group.throughput(Throughput::Elements(size as u64));
            group.bench_with_input(BenchmarkId::new(artifact, size), &records, |b, records| {
                b.iter(|| predictor.predict_batch(black_box(records)).expect("scores"))
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_batch_scoring);
criterion_main!(benches);
