//! Sample ingestion: a transport read loop or a simulated generator.
//!
//! The source owns one background thread while started. Every accepted
//! value is rounded and handed to the injected callback; a panicking
//! callback is caught and logged so the read loop keeps running. A
//! transport that stays silent past `stale_after` is flagged stale until
//! the next value arrives.
use crate::config::{SimCfg, SourceCfg, TransportCfg};
use crate::framing::{FrameDecoder, ValueParser};
use crate::simulate::{Generator, ManualSetpoint};
use crate::types::{ConnectionState, RawSample, StateCell};
use crate::util::round_to;
use crate::worker::{StopSignal, Worker};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use weigh_traits::TransportOpener;

pub type SampleCallback = Arc<dyn Fn(RawSample) + Send + Sync>;

pub enum SourceMode {
    Transport {
        opener: Box<dyn TransportOpener>,
        cfg: TransportCfg,
    },
    Simulated(SimCfg),
}

enum Mode {
    Transport {
        opener: Arc<Mutex<Box<dyn TransportOpener>>>,
        cfg: TransportCfg,
    },
    Simulated(SimCfg),
}

pub struct SampleSource {
    cfg: SourceCfg,
    mode: Mode,
    callback: SampleCallback,
    state: Arc<StateCell>,
    stale: Arc<AtomicBool>,
    manual: ManualSetpoint,
    worker: Option<Worker>,
}

impl SampleSource {
    pub fn new(cfg: SourceCfg, mode: SourceMode, callback: SampleCallback) -> Self {
        let (mode, manual) = match mode {
            SourceMode::Transport { opener, cfg } => (
                Mode::Transport {
                    opener: Arc::new(Mutex::new(opener)),
                    cfg,
                },
                ManualSetpoint::new(0.0),
            ),
            SourceMode::Simulated(sim) => {
                let manual = ManualSetpoint::new(sim.manual_value);
                (Mode::Simulated(sim), manual)
            }
        };
        Self {
            cfg,
            mode,
            callback,
            state: Arc::new(StateCell::default()),
            stale: Arc::new(AtomicBool::new(false)),
            manual,
            worker: None,
        }
    }

    /// Transport connection state; a simulated source reports `Connected` while running.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(Worker::is_running)
    }

    /// True while the transport has been silent longer than `stale_after`.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Relaxed)
    }

    /// Setpoint of the `manual` generator; ignored by other modes.
    pub fn set_manual_weight(&self, v: f64) {
        self.manual.set(v);
    }

    pub fn start(&mut self) -> std::io::Result<()> {
        if self.is_running() {
            return Ok(());
        }
        // A loop that exited on its own still needs joining before restart.
        if let Some(mut old) = self.worker.take() {
            old.stop();
        }
        let emit = Emitter {
            callback: self.callback.clone(),
            decimals: self.cfg.decimals,
        };
        let state = self.state.clone();
        let worker = match &self.mode {
            Mode::Transport { opener, cfg } => {
                let opener = opener.clone();
                let cfg = cfg.clone();
                let mut watch = StaleWatch::new(cfg.stale_after, self.stale.clone());
                Worker::spawn("weigh-source", self.cfg.stop_timeout, move |stop| {
                    run_transport(&opener, &cfg, &emit, &state, &mut watch, &stop);
                })?
            }
            Mode::Simulated(sim) => {
                let sim = sim.clone();
                let manual = self.manual.clone();
                Worker::spawn("weigh-source", self.cfg.stop_timeout, move |stop| {
                    run_simulated(&sim, manual, &emit, &state, &stop);
                })?
            }
        };
        self.worker = Some(worker);
        Ok(())
    }

    /// Returns once the loop has exited and released the transport, or the
    /// stop timeout elapsed (logged).
    pub fn stop(&mut self) {
        if let Some(mut w) = self.worker.take() {
            w.stop();
        }
        self.state.set(ConnectionState::Disconnected);
        self.stale.store(false, Ordering::Relaxed);
    }
}

impl Drop for SampleSource {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Emitter {
    callback: SampleCallback,
    decimals: u32,
}

impl Emitter {
    fn emit(&self, v: f64) {
        let sample = RawSample::now(round_to(v, self.decimals));
        if let Err(p) = catch_unwind(AssertUnwindSafe(|| (self.callback)(sample))) {
            let msg = p
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| p.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            tracing::error!(panic = %msg, "sample callback panicked");
        }
    }
}

/// Stale-data watchdog. Warns once per silent stretch and clears on the next value.
struct StaleWatch {
    after: Option<Duration>,
    last_value: Instant,
    flag: Arc<AtomicBool>,
}

impl StaleWatch {
    fn new(after: Option<Duration>, flag: Arc<AtomicBool>) -> Self {
        Self {
            after,
            last_value: Instant::now(),
            flag,
        }
    }

    fn value_seen(&mut self) {
        self.last_value = Instant::now();
        if self.flag.swap(false, Ordering::Relaxed) {
            tracing::info!("readings resumed");
        }
    }

    fn check(&self) {
        let Some(after) = self.after else {
            return;
        };
        let silent = self.last_value.elapsed();
        if silent >= after && !self.flag.swap(true, Ordering::Relaxed) {
            tracing::warn!(silent_s = silent.as_secs(), "stale data: no readings from the scale");
        }
    }
}

fn run_simulated(
    sim: &SimCfg,
    manual: ManualSetpoint,
    emit: &Emitter,
    state: &StateCell,
    stop: &StopSignal,
) {
    tracing::info!(generator = ?sim.generator, interval_ms = sim.interval.as_millis() as u64, "source running in simulated mode");
    let mut generator = Generator::new(sim, manual);
    let epoch = Instant::now();
    state.set(ConnectionState::Connected);
    loop {
        emit.emit(generator.next(epoch.elapsed().as_secs_f64()));
        if stop.wait(sim.interval) {
            break;
        }
    }
    state.set(ConnectionState::Disconnected);
    tracing::trace!("simulated source exiting cleanly");
}

fn run_transport(
    opener: &Mutex<Box<dyn TransportOpener>>,
    cfg: &TransportCfg,
    emit: &Emitter,
    state: &StateCell,
    watch: &mut StaleWatch,
    stop: &StopSignal,
) {
    let parser = ValueParser::new(&cfg.framing);
    let mut chunk = [0u8; 512];
    let mut failures: u64 = 0;

    'session: while !stop.is_stopped() {
        state.set(ConnectionState::Connecting);
        let opened = match opener.lock() {
            Ok(mut o) => o.open().map(|t| (t, o.describe())),
            Err(_) => {
                tracing::error!("transport opener lock poisoned; source stops");
                break;
            }
        };
        let (mut transport, endpoint) = match opened {
            Ok(v) => v,
            Err(e) => {
                watch.check();
                failures += 1;
                state.set(ConnectionState::Error);
                tracing::warn!(error = %e, failures, "transport open failed; retrying");
                if stop.wait(cfg.reopen_delay) {
                    break;
                }
                continue;
            }
        };
        failures = 0;
        state.set(ConnectionState::Connected);
        tracing::info!(%endpoint, "transport opened");

        let mut decoder = FrameDecoder::new(&cfg.framing);
        let mut last_poll: Option<Instant> = None;
        loop {
            if stop.is_stopped() {
                break 'session;
            }
            if let Some(every) = cfg.poll_interval
                && last_poll.is_none_or(|t| t.elapsed() >= every)
            {
                if let Err(e) = transport.write_all(&cfg.poll_command) {
                    tracing::debug!(error = %e, "poll write failed");
                }
                last_poll = Some(Instant::now());
            }
            match transport.read(&mut chunk) {
                Ok(0) => {}
                Ok(n) => {
                    for frame in decoder.push(&chunk[..n]) {
                        match parser.parse(&frame) {
                            Some(v) => {
                                watch.value_seen();
                                emit.emit(v);
                            }
                            None => tracing::trace!(len = frame.len(), "frame without value"),
                        }
                    }
                }
                Err(e) => {
                    state.set(ConnectionState::Error);
                    tracing::warn!(%endpoint, error = %e, "transport read failed; reopening");
                    break;
                }
            }
            watch.check();
        }
        drop(transport);
        state.set(ConnectionState::Disconnected);
        if stop.wait(cfg.reopen_delay) {
            break;
        }
    }
    state.set(ConnectionState::Disconnected);
    tracing::trace!("transport source exiting cleanly");
}
