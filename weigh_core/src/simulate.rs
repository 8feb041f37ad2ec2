//! Simulated scale generators.

use crate::config::{GeneratorKind, SimCfg};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;
use std::sync::{Arc, Mutex};

/// Externally settable value for the `manual` generator.
#[derive(Debug, Clone)]
pub struct ManualSetpoint(Arc<Mutex<f64>>);

impl ManualSetpoint {
    pub fn new(v: f64) -> Self {
        Self(Arc::new(Mutex::new(v)))
    }

    pub fn set(&self, v: f64) {
        if let Ok(mut g) = self.0.lock() {
            *g = v;
        }
    }

    pub fn get(&self) -> f64 {
        self.0.lock().map(|g| *g).unwrap_or(0.0)
    }
}

pub struct Generator {
    kind: GeneratorKind,
    min: f64,
    max: f64,
    period_s: f64,
    noise: f64,
    step: f64,
    step_state: f64,
    manual: ManualSetpoint,
    rng: StdRng,
}

impl Generator {
    pub fn new(cfg: &SimCfg, manual: ManualSetpoint) -> Self {
        let rng = match cfg.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            kind: cfg.generator,
            min: cfg.min,
            max: cfg.max.max(cfg.min),
            period_s: if cfg.hz > 0.0 { 1.0 / cfg.hz } else { 5.0 },
            noise: cfg.noise.max(0.0),
            step: cfg.step,
            step_state: cfg.min,
            manual,
            rng,
        }
    }

    /// Value for one tick at `t_s` seconds since the source started.
    pub fn next(&mut self, t_s: f64) -> f64 {
        let (lo, hi) = (self.min, self.max);
        let base = match self.kind {
            GeneratorKind::Sine => {
                let mid = (lo + hi) / 2.0;
                let amp = (hi - lo) / 2.0;
                mid + amp * (TAU * t_s / self.period_s).sin()
            }
            GeneratorKind::Random => {
                if hi > lo {
                    self.rng.gen_range(lo..=hi)
                } else {
                    lo
                }
            }
            GeneratorKind::Saw => {
                let phase = (t_s % self.period_s) / self.period_s;
                lo + phase * (hi - lo)
            }
            GeneratorKind::Step => {
                let v = self.step_state.clamp(lo, hi);
                self.step_state += self.step;
                if self.step_state > hi {
                    self.step_state = lo;
                }
                v
            }
            GeneratorKind::Manual => self.manual.get(),
        };
        base + self.noise_sample()
    }

    fn noise_sample(&mut self) -> f64 {
        if self.noise > 0.0 {
            self.rng.gen_range(-self.noise..=self.noise)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim(kind: GeneratorKind) -> SimCfg {
        SimCfg {
            generator: kind,
            min: 0.0,
            max: 100.0,
            hz: 1.0,
            noise: 0.0,
            step: 40.0,
            manual_value: 7.0,
            seed: Some(42),
            ..SimCfg::default()
        }
    }

    #[test]
    fn step_wraps_to_min_after_exceeding_max() {
        let mut g = Generator::new(&sim(GeneratorKind::Step), ManualSetpoint::new(0.0));
        let vals: Vec<f64> = (0..5).map(|i| g.next(i as f64)).collect();
        assert_eq!(vals, vec![0.0, 40.0, 80.0, 0.0, 40.0]);
    }

    #[test]
    fn saw_ramps_and_wraps() {
        let mut g = Generator::new(&sim(GeneratorKind::Saw), ManualSetpoint::new(0.0));
        assert_eq!(g.next(0.0), 0.0);
        assert!((g.next(0.5) - 50.0).abs() < 1e-9);
        assert!((g.next(1.25) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn sine_stays_in_range_and_peaks_at_quarter_period() {
        let mut g = Generator::new(&sim(GeneratorKind::Sine), ManualSetpoint::new(0.0));
        assert!((g.next(0.25) - 100.0).abs() < 1e-9);
        for i in 0..100 {
            let v = g.next(i as f64 * 0.037);
            assert!((0.0..=100.0).contains(&v));
        }
    }

    #[test]
    fn random_is_bounded_and_seeded() {
        let mut a = Generator::new(&sim(GeneratorKind::Random), ManualSetpoint::new(0.0));
        let mut b = Generator::new(&sim(GeneratorKind::Random), ManualSetpoint::new(0.0));
        for _ in 0..50 {
            let (x, y) = (a.next(0.0), b.next(0.0));
            assert_eq!(x, y);
            assert!((0.0..=100.0).contains(&x));
        }
    }

    #[test]
    fn manual_follows_setpoint() {
        let sp = ManualSetpoint::new(7.0);
        let mut g = Generator::new(&sim(GeneratorKind::Manual), sp.clone());
        assert_eq!(g.next(0.0), 7.0);
        sp.set(99.5);
        assert_eq!(g.next(1.0), 99.5);
    }
}
