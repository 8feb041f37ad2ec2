use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use weigh_core::config::{FilterCfg, SmoothingCfg};
use weigh_core::{FilterPipeline, RawSample};

// Sine plus xorshift noise, one sample every 50 ms.
fn synth_trace(n: usize, noise_amp: f64, seed: u32) -> Vec<RawSample> {
    let mut state = seed.max(1);
    let mut next = || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        f64::from(state) / (f64::from(u32::MAX) + 1.0)
    };
    let t0 = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default();
    let m0 = Instant::now();
    (0..n)
        .map(|i| {
            RawSample::new(
                5000.0 + 2000.0 * (i as f64 / 200.0).sin() + (next() * 2.0 - 1.0) * noise_amp,
                t0 + chrono::Duration::milliseconds(i as i64 * 50),
                m0 + Duration::from_millis(i as u64 * 50),
            )
        })
        .collect()
}

fn bench_pipeline(c: &mut Criterion) {
    let trace = synth_trace(10_000, 3.0, 0xC0FFEE);
    for (name, smoothing) in [
        ("ma_only", SmoothingCfg::None),
        ("ma_ema", SmoothingCfg::Ema { alpha: 0.3 }),
        ("ma_kalman", SmoothingCfg::Kalman { q: 1e-3, r: 1e-2 }),
    ] {
        let cfg = FilterCfg {
            smoothing,
            ..FilterCfg::default()
        };
        c.bench_function(&format!("filter_{name}_10k"), |b| {
            b.iter_batched(
                || FilterPipeline::new(cfg.clone()),
                |mut f| {
                    let mut published = 0usize;
                    for s in &trace {
                        if f.process(black_box(*s)).is_some() {
                            published += 1;
                        }
                    }
                    black_box(published)
                },
                BatchSize::SmallInput,
            );
        });
    }
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
