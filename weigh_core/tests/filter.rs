use chrono::{DateTime, Utc};
use proptest::prelude::*;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use weigh_core::config::{FilterCfg, SmoothingCfg};
use weigh_core::{FilterPipeline, FilteredReading, RawSample};

fn base() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp")
}

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Sample `ms` after a fixed origin on both the wall and the monotonic clock.
fn at(ms: i64, value: f64) -> RawSample {
    let mono_ms = u64::try_from(ms).expect("non-negative offset");
    RawSample::new(
        value,
        base() + chrono::Duration::milliseconds(ms),
        *EPOCH + Duration::from_millis(mono_ms),
    )
}

/// Every stage but the one under test reduced to pass-through.
fn passthrough() -> FilterCfg {
    FilterCfg {
        outlier_delta: None,
        ma_window: 1,
        smoothing: SmoothingCfg::None,
        stability_window: 1,
        stability_threshold: f64::MAX,
        stability_min_duration: Duration::ZERO,
        throttle: Duration::ZERO,
        min_delta: 0.0,
        ..FilterCfg::default()
    }
}

#[test]
fn linear_transform_applies_factor_then_offset() {
    let mut f = FilterPipeline::new(FilterCfg {
        scale_factor: 0.5,
        scale_offset: -2.0,
        ..passthrough()
    });
    let r = f.process(at(0, 10.0)).expect("first reading passes");
    assert_eq!(r.value, 3.0);
}

#[test]
fn outlier_is_dropped_without_touching_the_average() {
    let mut f = FilterPipeline::new(FilterCfg {
        outlier_delta: Some(50.0),
        ma_window: 3,
        ..passthrough()
    });
    assert_eq!(f.process(at(0, 100.0)).map(|r| r.value), Some(100.0));
    assert!(f.process(at(100, 200.0)).is_none());
    assert_eq!(f.stats().outliers, 1);
    // Window holds [100, 130]; a leaked 200 would give 143.3.
    assert_eq!(f.process(at(200, 130.0)).map(|r| r.value), Some(115.0));
}

#[test]
fn stability_needs_full_window_and_narrow_range() {
    let mut f = FilterPipeline::new(FilterCfg {
        stability_window: 3,
        stability_threshold: 0.5,
        stability_min_duration: Duration::ZERO,
        ..passthrough()
    });
    let flags: Vec<bool> = [(0, 10.0), (1000, 10.1), (2000, 10.05), (3000, 15.0)]
        .into_iter()
        .map(|(t, v)| f.process(at(t, v)).expect("gate open").stable)
        .collect();
    assert_eq!(flags, vec![false, false, true, false]);
}

#[test]
fn stability_respects_minimum_duration() {
    let mut f = FilterPipeline::new(FilterCfg {
        stability_window: 3,
        stability_threshold: 0.5,
        stability_min_duration: Duration::from_millis(500),
        ..passthrough()
    });
    f.process(at(0, 10.0));
    f.process(at(100, 10.0));
    assert!(!f.process(at(200, 10.0)).expect("reading").stable);
    assert!(f.process(at(700, 10.0)).expect("reading").stable);
}

#[test]
fn publish_only_stable_suppresses_unstable_readings() {
    let mut f = FilterPipeline::new(FilterCfg {
        stability_window: 2,
        stability_threshold: 0.1,
        publish_only_stable: true,
        ..passthrough()
    });
    assert!(f.process(at(0, 5.0)).is_none());
    let r = f.process(at(10, 5.0)).expect("stable now");
    assert!(r.stable);
    assert!(f.process(at(20, 9.0)).is_none());
}

#[test]
fn wall_clock_step_back_does_not_close_the_gate() {
    let cfg = FilterCfg {
        throttle: Duration::from_millis(200),
        min_delta: 0.5,
        ..passthrough()
    };
    let mut f = FilterPipeline::new(cfg);
    let t0 = *EPOCH;
    assert!(f.process(RawSample::new(100.0, base() + chrono::Duration::seconds(60), t0)).is_some());
    // NTP moved the wall clock a minute back; monotonic time keeps going.
    let published = (1..=200u64)
        .filter(|&i| {
            let wall = base() + chrono::Duration::milliseconds(i as i64 * 250);
            let mono = t0 + Duration::from_millis(i * 250);
            f.process(RawSample::new(100.0 + 5.0 * i as f64, wall, mono)).is_some()
        })
        .count();
    assert_eq!(published, 200);
}

#[test]
fn stability_span_uses_monotonic_time() {
    let cfg = FilterCfg {
        stability_window: 3,
        stability_threshold: 0.5,
        stability_min_duration: Duration::from_millis(500),
        ..passthrough()
    };
    let mut f = FilterPipeline::new(cfg);
    let t0 = *EPOCH;
    // Wall time runs backwards across the window while 600 ms pass monotonically.
    let stable: Vec<bool> = [0u64, 300, 600]
        .iter()
        .enumerate()
        .map(|(i, &ms)| {
            let wall = base() - chrono::Duration::seconds(i as i64 * 10);
            f.process(RawSample::new(10.0, wall, t0 + Duration::from_millis(ms)))
                .expect("gate open")
                .stable
        })
        .collect();
    assert_eq!(stable, vec![false, false, true]);
}

#[test]
fn non_finite_samples_are_dropped() {
    let mut f = FilterPipeline::new(passthrough());
    assert!(f.process(at(0, f64::NAN)).is_none());
    assert!(f.process(at(1, f64::INFINITY)).is_none());
    assert_eq!(f.stats().invalid, 2);
    assert!(f.process(at(2, 1.0)).is_some());
}

#[test]
fn kalman_stage_runs_after_moving_average() {
    let mut f = FilterPipeline::new(FilterCfg {
        smoothing: SmoothingCfg::Kalman { q: 1e-3, r: 1e-2 },
        ..passthrough()
    });
    assert_eq!(f.process(at(0, 50.0)).map(|r| r.value), Some(50.0));
    let second = f.process(at(1, 60.0)).expect("reading").value;
    assert!(second > 50.0 && second < 60.0);
}

#[test]
fn sinks_receive_every_published_reading() {
    use std::sync::{Arc, Mutex};
    let seen: Arc<Mutex<Vec<FilteredReading>>> = Arc::default();
    let sink = seen.clone();
    let mut f = FilterPipeline::new(FilterCfg {
        throttle: Duration::from_millis(100),
        ..passthrough()
    })
    .with_decimals(1);
    f.add_sink(move |r: &FilteredReading| sink.lock().expect("lock").push(*r));
    f.push(at(0, 1.04));
    f.push(at(50, 2.0));
    f.push(at(150, 3.0));
    let values: Vec<f64> = seen.lock().expect("lock").iter().map(|r| r.value).collect();
    assert_eq!(values, vec![1.0, 3.0]);
}

proptest! {
    #[test]
    fn throttle_gate_never_publishes_close_small_changes(
        steps in prop::collection::vec((0i64..400, -20.0f64..20.0), 1..200),
        throttle_ms in 0u64..300,
        min_delta in 0.0f64..10.0,
    ) {
        let cfg = FilterCfg {
            throttle: Duration::from_millis(throttle_ms),
            min_delta,
            ..passthrough()
        };
        let mut f = FilterPipeline::new(cfg);
        let mut t = 0i64;
        let mut v = 1000.0;
        let mut published = Vec::new();
        for (i, (dt, dv)) in steps.iter().enumerate() {
            t += dt;
            v += dv;
            if let Some(r) = f.process(at(t, v)) {
                published.push((i, r));
            }
        }
        prop_assert_eq!(published.first().map(|(i, _)| *i), Some(0));
        for pair in published.windows(2) {
            let (a, b) = (pair[0].1, pair[1].1);
            let gap = (b.captured_at - a.captured_at).num_milliseconds();
            prop_assert!(gap >= throttle_ms as i64 || (b.value - a.value).abs() >= min_delta);
        }
    }
}
