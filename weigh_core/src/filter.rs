//! Signal conditioning: transform, outlier rejection, smoothing, stability
//! classification and the publish gate, applied in that order per sample.
//!
//! All timing decisions use the sample's monotonic capture instant, so the
//! pipeline is deterministic for a given input sequence and unaffected by
//! wall-clock steps.
use crate::config::{FilterCfg, SmoothingCfg};
use crate::types::{FilteredReading, RawSample};
use crate::util::round_to;
use std::collections::VecDeque;
use std::time::Instant;

/// Downstream consumer of published readings. Implementations should
/// enqueue and return; the pipeline calls them synchronously.
pub trait ReadingSink: Send {
    fn on_reading(&self, reading: &FilteredReading);
}

impl<F> ReadingSink for F
where
    F: Fn(&FilteredReading) + Send,
{
    fn on_reading(&self, reading: &FilteredReading) {
        self(reading);
    }
}

/// Scalar Kalman filter, initialized lazily from the first measurement.
#[derive(Debug, Clone)]
pub struct Kalman {
    q: f64,
    r: f64,
    x: f64,
    p: f64,
    initialized: bool,
}

impl Kalman {
    pub fn new(q: f64, r: f64) -> Self {
        Self {
            q,
            r,
            x: 0.0,
            p: 1.0,
            initialized: false,
        }
    }

    pub fn update(&mut self, z: f64) -> f64 {
        if !self.initialized {
            self.x = z;
            self.p = 1.0;
            self.initialized = true;
            return z;
        }
        self.p += self.q;
        let k = self.p / (self.p + self.r);
        self.x += k * (z - self.x);
        self.p *= 1.0 - k;
        self.x
    }
}

#[derive(Debug, Clone)]
enum Smoother {
    None,
    Ema { alpha: f64, value: Option<f64> },
    Kalman(Kalman),
}

impl Smoother {
    fn from_cfg(cfg: SmoothingCfg) -> Self {
        match cfg {
            SmoothingCfg::None => Self::None,
            SmoothingCfg::Ema { alpha } => Self::Ema { alpha, value: None },
            SmoothingCfg::Kalman { q, r } => Self::Kalman(Kalman::new(q, r)),
        }
    }

    fn apply(&mut self, v: f64) -> f64 {
        match self {
            Self::None => v,
            Self::Ema { alpha, value } => {
                let next = match *value {
                    Some(prev) => prev + *alpha * (v - prev),
                    None => v,
                };
                *value = Some(next);
                next
            }
            Self::Kalman(k) => k.update(v),
        }
    }
}

/// Counters for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub received: u64,
    pub invalid: u64,
    pub outliers: u64,
    pub suppressed: u64,
    pub published: u64,
}

pub struct FilterPipeline {
    cfg: FilterCfg,
    last_accepted: Option<f64>,
    window: VecDeque<f64>,
    smoother: Smoother,
    stability: VecDeque<(Instant, f64)>,
    last_published: Option<(f64, Instant)>,
    sinks: Vec<Box<dyn ReadingSink>>,
    stats: FilterStats,
    decimals: Option<u32>,
}

impl FilterPipeline {
    pub fn new(cfg: FilterCfg) -> Self {
        let smoother = Smoother::from_cfg(cfg.smoothing);
        Self {
            window: VecDeque::with_capacity(cfg.ma_window.max(1)),
            stability: VecDeque::with_capacity(cfg.stability_window.max(1)),
            cfg,
            last_accepted: None,
            smoother,
            last_published: None,
            sinks: Vec::new(),
            stats: FilterStats::default(),
            decimals: None,
        }
    }

    /// Round published values to `decimals` places. Gate state keeps full precision.
    pub fn with_decimals(mut self, decimals: u32) -> Self {
        self.decimals = Some(decimals);
        self
    }

    pub fn add_sink(&mut self, sink: impl ReadingSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    pub fn stats(&self) -> FilterStats {
        self.stats
    }

    /// Run one sample through every stage and fan a passing reading out to
    /// all sinks.
    pub fn push(&mut self, sample: RawSample) -> Option<FilteredReading> {
        let reading = self.process(sample)?;
        for sink in &self.sinks {
            sink.on_reading(&reading);
        }
        Some(reading)
    }

    /// Stages only; no sink delivery.
    pub fn process(&mut self, sample: RawSample) -> Option<FilteredReading> {
        self.stats.received += 1;
        if !sample.value.is_finite() {
            self.stats.invalid += 1;
            tracing::warn!(value = sample.value, "dropping non-finite sample");
            return None;
        }

        let v = sample.value * self.cfg.scale_factor + self.cfg.scale_offset;
        if !v.is_finite() {
            self.stats.invalid += 1;
            tracing::warn!(raw = sample.value, "transform produced a non-finite value");
            return None;
        }

        if let (Some(limit), Some(prev)) = (self.cfg.outlier_delta, self.last_accepted)
            && (v - prev).abs() > limit
        {
            self.stats.outliers += 1;
            tracing::debug!(value = v, previous = prev, limit, "outlier rejected");
            return None;
        }
        self.last_accepted = Some(v);

        while self.window.len() >= self.cfg.ma_window.max(1) {
            self.window.pop_front();
        }
        self.window.push_back(v);
        let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
        let smoothed = self.smoother.apply(mean);

        let stable = self.classify(sample.monotonic, smoothed);
        if self.cfg.publish_only_stable && !stable {
            self.stats.suppressed += 1;
            return None;
        }

        if !self.gate(smoothed, sample.monotonic) {
            self.stats.suppressed += 1;
            return None;
        }
        self.last_published = Some((smoothed, sample.monotonic));
        self.stats.published += 1;
        Some(FilteredReading {
            value: self.decimals.map_or(smoothed, |d| round_to(smoothed, d)),
            stable,
            captured_at: sample.captured_at,
        })
    }

    fn classify(&mut self, at: Instant, value: f64) -> bool {
        while self.stability.len() >= self.cfg.stability_window.max(1) {
            self.stability.pop_front();
        }
        self.stability.push_back((at, value));
        self.is_stable()
    }

    /// Stability of the current window contents.
    pub fn is_stable(&self) -> bool {
        if self.stability.len() < self.cfg.stability_window.max(1) {
            return false;
        }
        let (lo, hi) = self
            .stability
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(_, v)| {
                (lo.min(v), hi.max(v))
            });
        if hi - lo > self.cfg.stability_threshold {
            return false;
        }
        match (self.stability.front(), self.stability.back()) {
            (Some(&(first, _)), Some(&(last, _))) => {
                last.saturating_duration_since(first) >= self.cfg.stability_min_duration
            }
            _ => false,
        }
    }

    fn gate(&self, value: f64, at: Instant) -> bool {
        let Some((last_v, last_t)) = self.last_published else {
            return true;
        };
        at.saturating_duration_since(last_t) >= self.cfg.throttle
            && (value - last_v).abs() >= self.cfg.min_delta
    }
}
