//! Backend event pusher: bounded queue, single delivery worker, scheduled retries.
//!
//! `push*` never blocks. The worker takes one event at a time, so an event
//! has at most one POST in flight. A failed event is handed to a
//! [`DelayQueue`] and re-enters the queue after `retry_schedule[attempt-1]`;
//! once the schedule is exhausted it is dropped at error level.
use crate::config::PusherCfg;
use crate::delay_queue::DelayQueue;
use crate::filter::ReadingSink;
use crate::types::{AgentStatus, EventKind, FilteredReading, OutboundEvent};
use crate::worker::{StopSignal, Worker};
use crossbeam_channel as xch;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use weigh_traits::{Clock, EventTransport, MonotonicClock};

type SharedTransport = Arc<Mutex<Box<dyn EventTransport>>>;

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushStats {
    pub delivered: u64,
    pub failed_attempts: u64,
    /// Queue-full drops plus events that ran out of retries.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct ReadingThrottle {
    last_at: Option<Instant>,
    last_value: Option<f64>,
}

/// Cloneable, non-blocking producer side of the backend queue.
#[derive(Clone)]
pub struct PushHandle {
    cfg: Arc<PusherCfg>,
    tx: xch::Sender<OutboundEvent>,
    clock: Arc<dyn Clock>,
    throttle: Arc<Mutex<ReadingThrottle>>,
    counters: Arc<Counters>,
}

impl PushHandle {
    /// Enqueue without blocking; a full queue drops the new event.
    pub fn push(&self, event: OutboundEvent) {
        if !self.cfg.enabled {
            return;
        }
        if let Err(e) = self.tx.try_send(event) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            let kind = e.into_inner().kind.wire_name();
            tracing::warn!(kind, capacity = self.cfg.queue_capacity, "backend queue full; dropping event");
        }
    }

    fn event(&self, kind: EventKind, key: &str, value: Value) -> OutboundEvent {
        let mut payload = Map::new();
        payload.insert(key.to_string(), value);
        OutboundEvent::new(kind, payload, self.cfg.machine_id.clone())
    }

    /// Returns true when the reading passed the throttle and was queued.
    pub fn push_reading(&self, value: f64) -> bool {
        if !self.cfg.enabled {
            return false;
        }
        let now = self.clock.now();
        {
            let mut t = lock(&self.throttle);
            if let Some(last_at) = t.last_at {
                let dt = now.saturating_duration_since(last_at);
                let small_change = t
                    .last_value
                    .is_some_and(|last| (value - last).abs() < self.cfg.delta_threshold);
                if small_change && dt < self.cfg.min_interval {
                    return false;
                }
                if dt < self.cfg.min_interval / 2 {
                    return false;
                }
            }
            t.last_at = Some(now);
            t.last_value = Some(value);
        }
        self.push(self.event(EventKind::Reading, "weight", Value::from(value)));
        true
    }

    pub fn push_status(&self, status: AgentStatus) {
        self.push(self.event(EventKind::Status, "status", Value::from(status.as_str())));
    }

    /// `result` is `OK` or the error text.
    pub fn push_print(&self, result: &str) {
        self.push(self.event(EventKind::PrintResult, "result", Value::from(result)));
    }
}

impl ReadingSink for PushHandle {
    fn on_reading(&self, reading: &FilteredReading) {
        self.push_reading(reading.value);
    }
}

pub struct EventPusher {
    handle: PushHandle,
    transport: SharedTransport,
    rx: xch::Receiver<OutboundEvent>,
    worker: Option<Worker>,
}

impl EventPusher {
    pub fn new(cfg: PusherCfg, transport: Box<dyn EventTransport>) -> Self {
        Self::with_clock(cfg, transport, Arc::new(MonotonicClock))
    }

    /// `clock` drives only the reading throttle.
    pub fn with_clock(cfg: PusherCfg, transport: Box<dyn EventTransport>, clock: Arc<dyn Clock>) -> Self {
        let (tx, rx) = xch::bounded(cfg.queue_capacity.max(1));
        Self {
            handle: PushHandle {
                cfg: Arc::new(cfg),
                tx,
                clock,
                throttle: Arc::new(Mutex::new(ReadingThrottle::default())),
                counters: Arc::new(Counters::default()),
            },
            transport: Arc::new(Mutex::new(transport)),
            rx,
            worker: None,
        }
    }

    pub fn handle(&self) -> PushHandle {
        self.handle.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.handle.cfg.enabled
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(Worker::is_running)
    }

    pub fn queue_len(&self) -> usize {
        self.rx.len()
    }

    pub fn stats(&self) -> PushStats {
        let c = &self.handle.counters;
        PushStats {
            delivered: c.delivered.load(Ordering::Relaxed),
            failed_attempts: c.failed_attempts.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn push(&self, event: OutboundEvent) {
        self.handle.push(event);
    }

    pub fn push_reading(&self, value: f64) -> bool {
        self.handle.push_reading(value)
    }

    pub fn push_status(&self, status: AgentStatus) {
        self.handle.push_status(status);
    }

    pub fn push_print(&self, result: &str) {
        self.handle.push_print(result);
    }

    /// Start the delivery worker. Idempotent; no-op when disabled.
    pub fn start(&mut self) -> std::io::Result<()> {
        let cfg = self.handle.cfg.clone();
        if !cfg.enabled || self.is_running() {
            return Ok(());
        }
        if let Some(mut old) = self.worker.take() {
            old.stop();
        }
        let ctx = Delivery {
            transport: self.transport.clone(),
            rx: self.rx.clone(),
            requeue: self.handle.tx.clone(),
            counters: self.handle.counters.clone(),
            schedule: cfg.retry_schedule.clone(),
            flush_budget: cfg.stop_timeout / 2,
            stop_timeout: cfg.stop_timeout,
        };
        let worker = Worker::spawn("weigh-backend", cfg.stop_timeout, move |stop| ctx.run(&stop))?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Stops the retry timers, makes one final pass over queued events and joins.
    pub fn stop(&mut self) {
        if let Some(mut w) = self.worker.take() {
            w.stop();
        }
    }
}

impl Drop for EventPusher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Delivery {
    transport: SharedTransport,
    rx: xch::Receiver<OutboundEvent>,
    requeue: xch::Sender<OutboundEvent>,
    counters: Arc<Counters>,
    schedule: Vec<Duration>,
    flush_budget: Duration,
    stop_timeout: Duration,
}

impl Delivery {
    fn run(self, stop: &StopSignal) {
        let requeue = self.requeue.clone();
        let counters = self.counters.clone();
        let mut retries = match DelayQueue::start("weigh-backend-retry", self.stop_timeout, move |evt: OutboundEvent| {
            if requeue.try_send(evt).is_err() {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("backend queue full; dropping retried event");
            }
        }) {
            Ok(q) => Some(q),
            Err(e) => {
                tracing::error!(error = %e, "cannot start retry scheduler; failed events will be dropped");
                None
            }
        };

        loop {
            xch::select! {
                recv(self.rx) -> evt => match evt {
                    Ok(evt) => self.deliver(evt, retries.as_ref()),
                    Err(_) => break,
                },
                recv(stop.receiver()) -> _ => break,
            }
        }

        if let Some(q) = retries.as_mut() {
            q.stop();
        }
        self.flush();
    }

    fn post(&self, evt: &OutboundEvent) -> Result<(), weigh_traits::BoxError> {
        let body = serde_json::to_vec(&evt.to_json())?;
        lock(&self.transport).post(&body)
    }

    fn deliver(&self, mut evt: OutboundEvent, retries: Option<&DelayQueue<OutboundEvent>>) {
        let kind = evt.kind.wire_name();
        match self.post(&evt) {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(kind, attempt = evt.attempt, "event delivered");
            }
            Err(e) => {
                self.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
                evt.attempt += 1;
                let attempt = evt.attempt;
                let delay = self.schedule.get(attempt as usize - 1).copied();
                match (delay, retries) {
                    (Some(delay), Some(q)) => {
                        tracing::warn!(kind, attempt, error = %e, delay_ms = delay.as_millis() as u64, "backend push failed; retry scheduled");
                        if !q.schedule(evt, delay) {
                            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    _ => {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(kind, attempt, error = %e, "backend push dropped after retries");
                    }
                }
            }
        }
    }

    /// One attempt per remaining event, bounded by the flush budget.
    fn flush(&self) {
        let deadline = Instant::now() + self.flush_budget;
        let mut flushed = 0usize;
        while Instant::now() < deadline {
            let Ok(evt) = self.rx.try_recv() else {
                break;
            };
            match self.post(&evt) {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    flushed += 1;
                }
                Err(e) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(kind = evt.kind.wire_name(), error = %e, "final delivery failed; dropping event");
                }
            }
        }
        let left = self.rx.len();
        if flushed > 0 || left > 0 {
            tracing::info!(flushed, left, "backend queue flushed on stop");
        }
    }
}
