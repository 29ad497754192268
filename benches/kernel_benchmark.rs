// ========================================================================================
//
//                     DOSEDIST DISTANCE KERNEL BENCHMARK
//
// ========================================================================================
//
// Measures one full binary batch over the whole triangle for the scalar and vectorized
// accumulate, at a few cohort sizes and missingness rates.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use dosedist::kernel::{BinaryBatchView, KernelStrategy, accumulate_binary};
use dosedist::types::BINARY_BATCH_WIDTH;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Cohort sizes to test.
const INDIVIDUAL_COUNTS: [usize; 3] = [256, 1024, 2048];
/// Fraction of missing records per batch.
const MISSING_RATES: [f64; 2] = [0.0, 0.05];

struct Batch {
    dosages: Vec<f64>,
    masks: Vec<u64>,
    missing_bits: Vec<u64>,
}

fn random_batch(indiv_ct: usize, missing_rate: f64) -> Batch {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut batch = Batch {
        dosages: vec![0.0; indiv_ct * BINARY_BATCH_WIDTH],
        masks: vec![0; indiv_ct * BINARY_BATCH_WIDTH],
        missing_bits: vec![0; indiv_ct],
    };
    for indiv in 0..indiv_ct {
        for column in 0..BINARY_BATCH_WIDTH {
            let cell = indiv * BINARY_BATCH_WIDTH + column;
            if rng.gen_bool(missing_rate) {
                batch.missing_bits[indiv] |= 1 << column;
            } else {
                batch.dosages[cell] = rng.gen_range(0.0..=2.0);
                batch.masks[cell] = u64::MAX;
            }
        }
    }
    batch
}

fn bench_binary_kernel(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary_batch");
    group.sample_size(10);
    for &indiv_ct in &INDIVIDUAL_COUNTS {
        let pairs = indiv_ct * (indiv_ct - 1) / 2;
        group.throughput(Throughput::Elements((pairs * BINARY_BATCH_WIDTH) as u64));
        for &missing_rate in &MISSING_RATES {
            let batch = random_batch(indiv_ct, missing_rate);
            let view = BinaryBatchView::new(&batch.dosages, &batch.masks, &batch.missing_bits)
                .expect("batch shape");
            let mut distances = vec![0.0; pairs];
            for (name, strategy) in [("scalar", KernelStrategy::Scalar), ("simd", KernelStrategy::Simd)] {
                let id = BenchmarkId::new(name, format!("n{indiv_ct}_miss{missing_rate}"));
                group.bench_with_input(id, &strategy, |b, &strategy| {
                    b.iter(|| {
                        accumulate_binary(strategy, 0..indiv_ct, black_box(&view), &mut distances);
                    })
                });
            }
            black_box(&distances);
        }
    }
    group.finish();
}

criterion_group!(benches, bench_binary_kernel);
criterion_main!(benches);
