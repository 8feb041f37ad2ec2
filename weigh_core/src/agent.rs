//! The orchestrator: wires source, filter, publisher, pusher and print
//! bridge together and owns their lifecycle.
//!
//! Start order is publisher, source, pusher, then `ONLINE` on both
//! channels, then the heartbeat and print workers. Stop silences the
//! heartbeat and the source, announces `OFFLINE`, then tears down the
//! pusher and finally the publisher, which owns the broker session.
use crate::builder::AgentBuilder;
use crate::config::AgentCfg;
use crate::error::{AgentError, Result};
use crate::filter::{FilterPipeline, FilterStats};
use crate::print_bridge::PrintBridge;
use crate::publisher::{ControlCallback, ControlMessage, PublishHandle, Publisher};
use crate::pusher::{EventPusher, PushHandle, PushStats};
use crate::source::{SampleCallback, SampleSource, SourceMode};
use crate::types::{AgentStatus, ConnectionState, FilteredReading};
use chrono::{DateTime, Utc};
use crate::worker::{StopSignal, Worker};
use crossbeam_channel as xch;
use eyre::WrapErr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use weigh_traits::{BrokerConnector, Clock, DocumentFetcher, EventTransport, Printer, TransportOpener};

/// Print commands waiting for the print worker.
const PRINT_QUEUE: usize = 8;

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Point-in-time view for health reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub machine_id: String,
    pub running: bool,
    pub broker: ConnectionState,
    pub transport: ConnectionState,
    pub latest: Option<FilteredReading>,
    /// Wall-clock time of the newest raw sample, published or not.
    pub last_sample_at: Option<DateTime<Utc>>,
    /// Monotonic age of that sample at report time.
    pub sample_age: Option<Duration>,
    /// The transport has been silent past its stale threshold.
    pub stale: bool,
    pub backend_queue: usize,
    pub offline_buffered: usize,
    pub pending_publishes: usize,
    pub filter: FilterStats,
    pub backend: PushStats,
}

pub struct Agent {
    machine_id: String,
    heartbeat_every: Option<Duration>,
    worker_timeout: Duration,
    publisher: Publisher,
    pusher: EventPusher,
    source: SampleSource,
    pipeline: Arc<Mutex<FilterPipeline>>,
    latest: Arc<Mutex<Option<FilteredReading>>>,
    last_sample: Arc<Mutex<Option<(DateTime<Utc>, Instant)>>>,
    bridge: Arc<PrintBridge>,
    print_rx: xch::Receiver<ControlMessage>,
    heartbeat: Option<Worker>,
    print_worker: Option<Worker>,
    running: bool,
}

impl Agent {
    pub fn builder(cfg: AgentCfg) -> AgentBuilder {
        AgentBuilder::new(cfg)
    }

    pub(crate) fn assemble(
        cfg: AgentCfg,
        opener: Option<Box<dyn TransportOpener>>,
        broker: Box<dyn BrokerConnector>,
        events: Box<dyn EventTransport>,
        printer: Arc<dyn Printer>,
        fetcher: Option<Arc<dyn DocumentFetcher>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (print_tx, print_rx) = xch::bounded::<ControlMessage>(PRINT_QUEUE);
        let print_topic = format!("weigh/{}/print", cfg.machine_id);
        let on_control: ControlCallback = Arc::new(move |msg: ControlMessage| {
            let relevant = match &msg {
                ControlMessage::Print(_) => true,
                ControlMessage::Unknown { topic, .. } => *topic == print_topic,
            };
            if !relevant {
                return;
            }
            if print_tx.try_send(msg).is_err() {
                tracing::warn!("print queue full; dropping print command");
            }
        });

        let publisher = Publisher::new(cfg.publisher.clone(), broker, on_control);
        let pusher = EventPusher::with_clock(cfg.pusher.clone(), events, clock);

        let latest = Arc::new(Mutex::new(None));
        let mut pipeline = FilterPipeline::new(cfg.filter.clone()).with_decimals(cfg.source.decimals);
        let last = latest.clone();
        pipeline.add_sink(move |r: &FilteredReading| {
            *lock(&last) = Some(*r);
        });
        pipeline.add_sink(publisher.handle());
        pipeline.add_sink(pusher.handle());
        let pipeline = Arc::new(Mutex::new(pipeline));

        let feed = pipeline.clone();
        let last_sample = Arc::new(Mutex::new(None));
        let seen = last_sample.clone();
        let callback: SampleCallback = Arc::new(move |sample| {
            *lock(&seen) = Some((sample.captured_at, sample.monotonic));
            lock(&feed).push(sample);
        });
        let mode = match opener {
            Some(opener) => SourceMode::Transport {
                opener,
                cfg: cfg.transport.clone(),
            },
            None => SourceMode::Simulated(cfg.simulate.clone()),
        };
        let source = SampleSource::new(cfg.source.clone(), mode, callback);

        Self {
            machine_id: cfg.machine_id.clone(),
            heartbeat_every: cfg.heartbeat,
            worker_timeout: cfg.source.stop_timeout,
            publisher,
            pusher,
            source,
            pipeline,
            latest,
            last_sample,
            bridge: Arc::new(PrintBridge::new(cfg.print, printer, fetcher)),
            print_rx,
            heartbeat: None,
            print_worker: None,
            running: false,
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn latest_reading(&self) -> Option<FilteredReading> {
        *lock(&self.latest)
    }

    pub fn publisher(&self) -> PublishHandle {
        self.publisher.handle()
    }

    pub fn pusher(&self) -> PushHandle {
        self.pusher.handle()
    }

    /// Setpoint for the `manual` simulator.
    pub fn set_manual_weight(&self, value: f64) {
        self.source.set_manual_weight(value);
    }

    pub fn status(&self) -> StatusReport {
        let last_sample = *lock(&self.last_sample);
        StatusReport {
            machine_id: self.machine_id.clone(),
            running: self.running,
            broker: self.publisher.state(),
            transport: self.source.state(),
            latest: self.latest_reading(),
            last_sample_at: last_sample.map(|(at, _)| at),
            sample_age: last_sample.map(|(_, mono)| mono.elapsed()),
            stale: self.source.is_stale(),
            backend_queue: self.pusher.queue_len(),
            offline_buffered: self.publisher.buffered_len(),
            pending_publishes: self.publisher.pending_len(),
            filter: lock(&self.pipeline).stats(),
            backend: self.pusher.stats(),
        }
    }

    /// Bring every component up. Idempotent.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        if let Err(e) = self.start_components() {
            self.teardown();
            return Err(e);
        }
        self.running = true;
        tracing::info!(machine_id = %self.machine_id, "agent started");
        Ok(())
    }

    fn start_components(&mut self) -> Result<()> {
        self.publisher.start().wrap_err("starting broker publisher")?;
        self.source.start().wrap_err("starting sample source")?;
        self.pusher.start().wrap_err("starting backend pusher")?;

        self.publisher.publish_status(AgentStatus::Online);
        self.pusher.push_status(AgentStatus::Online);

        if let Some(every) = self.heartbeat_every {
            let handle = self.publisher.handle();
            self.heartbeat = Some(
                Worker::spawn("weigh-heartbeat", self.worker_timeout, move |stop| {
                    while !stop.wait(every) {
                        handle.publish_status(AgentStatus::Online);
                    }
                })
                .wrap_err("starting heartbeat")?,
            );
        }

        let ctx = PrintWorker {
            bridge: self.bridge.clone(),
            rx: self.print_rx.clone(),
            publisher: self.publisher.handle(),
            pusher: self.pusher.handle(),
        };
        self.print_worker = Some(
            Worker::spawn("weigh-print", self.worker_timeout, move |stop| ctx.run(&stop))
                .wrap_err("starting print worker")?,
        );
        Ok(())
    }

    /// Silence the heartbeat and the source, announce `OFFLINE`, then stop
    /// the remaining components. Idempotent.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        if let Some(mut w) = self.heartbeat.take() {
            w.stop();
        }
        // No reading may follow OFFLINE on either channel.
        self.source.stop();
        self.publisher.publish_status(AgentStatus::Offline);
        self.pusher.push_status(AgentStatus::Offline);
        self.teardown();
        self.running = false;
        tracing::info!(machine_id = %self.machine_id, "agent stopped");
    }

    fn teardown(&mut self) {
        if let Some(mut w) = self.heartbeat.take() {
            w.stop();
        }
        if let Some(mut w) = self.print_worker.take() {
            w.stop();
        }
        self.source.stop();
        // The pusher flushes before the broker session closes; the publisher
        // goes last so its Last-Will stays registered until the end.
        self.pusher.stop();
        self.publisher.stop();
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PrintWorker {
    bridge: Arc<PrintBridge>,
    rx: xch::Receiver<ControlMessage>,
    publisher: PublishHandle,
    pusher: PushHandle,
}

impl PrintWorker {
    fn run(&self, stop: &StopSignal) {
        loop {
            xch::select! {
                recv(self.rx) -> msg => match msg {
                    Ok(msg) => self.handle(msg),
                    Err(_) => break,
                },
                recv(stop.receiver()) -> _ => break,
            }
        }
    }

    fn handle(&self, msg: ControlMessage) {
        let outcome = match msg {
            ControlMessage::Print(cmd) => self.bridge.handle(&cmd),
            ControlMessage::Unknown { payload, .. } => Err(AgentError::Rejected(format!(
                "malformed print payload ({} bytes)",
                payload.len()
            ))),
        };
        match outcome {
            Ok(()) => {
                self.publisher.publish_status(AgentStatus::PrintOk);
                self.pusher.push_print("OK");
            }
            Err(e) => {
                match &e {
                    AgentError::Rejected(reason) => tracing::warn!(%reason, "print rejected"),
                    other => tracing::error!(error = %other, "print failed"),
                }
                self.publisher.publish_status(AgentStatus::PrintError);
                self.pusher.push_print(&e.to_string());
            }
        }
    }
}
