//! Per-block cost of the ingestion hot path

use audiotrigger::audio::spectrum::SpectrumReporter;
use audiotrigger::config::SpectrumConfig;
use audiotrigger::{AudioBlock, Calibrator, LevelEstimator};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const SR: u32 = 48000;
const BLOCK: usize = 12000;

fn noise_block(seq: u64) -> AudioBlock {
    // Deterministic LCG noise
    let mut state = 0x2545_f491_u32.wrapping_add(seq as u32);
    let samples = (0..BLOCK)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
        })
        .collect();
    AudioBlock::new(seq, chrono::Utc::now(), samples)
}

fn bench_levels(c: &mut Criterion) {
    let block = noise_block(0);
    let mut estimator = LevelEstimator::new(SR, 80.0, 160.0).unwrap();
    c.bench_function("level_estimator_block", |b| {
        b.iter(|| estimator.update(black_box(&block)))
    });

    let calibrator = Calibrator::identity();
    c.bench_function("calibrate_block", |b| {
        b.iter(|| calibrator.calibrate(black_box(&block)))
    });
}

fn bench_spectrum(c: &mut Criterion) {
    let block = noise_block(1);
    let config = SpectrumConfig {
        interval: BLOCK as f64 / SR as f64,
        ..SpectrumConfig::default()
    };
    let mut reporter = SpectrumReporter::new(&config, SR, &Calibrator::identity());
    c.bench_function("spectrum_report_16k", |b| {
        b.iter(|| reporter.push(black_box(&block)))
    });
}

criterion_group!(benches, bench_levels, bench_spectrum);
criterion_main!(benches);
