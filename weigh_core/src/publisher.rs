//! Broker publisher: a background network loop that owns the session and
//! the offline buffer.
//!
//! Callers hand messages to a bounded channel and return immediately. The
//! loop publishes them while connected, buffers them while not, and drains
//! the buffer in FIFO order on every successful connect before touching new
//! traffic. A fresh Last-Will (`OFFLINE`) is registered on every attempt.
use crate::buffer::OfflineBuffer;
use crate::config::PublisherCfg;
use crate::filter::ReadingSink;
use crate::types::{AgentStatus, ConnectionState, FilteredReading, StateCell, iso_utc};
use crate::worker::{StopSignal, Worker};
use crossbeam_channel as xch;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use weigh_traits::{BoxError, BrokerConnector, BrokerMessage, BrokerSession, ConnectRequest};

/// Slice of time the loop spends in `BrokerSession::poll` between outbound drains.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Topic names for one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub reading: String,
    pub status: String,
    pub print: String,
}

impl Topics {
    pub fn new(machine_id: &str) -> Self {
        Self {
            reading: format!("weigh/{machine_id}/reading"),
            status: format!("weigh/{machine_id}/status"),
            print: format!("weigh/{machine_id}/print"),
        }
    }
}

/// Print request received on the control topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrintCommand {
    pub secret: Option<String>,
    pub pdf_base64: Option<String>,
    pub pdf_url: Option<String>,
    /// Extra request headers for `pdf_url`.
    pub headers: BTreeMap<String, String>,
    pub printer: Option<String>,
}

/// Inbound control traffic, classified once at the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Print(PrintCommand),
    /// Anything not recognized, including malformed print payloads.
    Unknown { topic: String, payload: Vec<u8> },
}

impl ControlMessage {
    pub fn classify(topics: &Topics, msg: BrokerMessage) -> Self {
        if msg.topic == topics.print
            && let Ok(cmd) = serde_json::from_slice::<PrintCommand>(&msg.payload)
        {
            return Self::Print(cmd);
        }
        Self::Unknown {
            topic: msg.topic,
            payload: msg.payload,
        }
    }
}

pub type ControlCallback = Arc<dyn Fn(ControlMessage) + Send + Sync>;

type SharedConnector = Arc<Mutex<Box<dyn BrokerConnector>>>;

/// Cloneable, non-blocking entry point for publishing from any thread.
#[derive(Clone)]
pub struct PublishHandle {
    cfg: Arc<PublisherCfg>,
    topics: Arc<Topics>,
    tx: xch::Sender<BrokerMessage>,
}

impl PublishHandle {
    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Queue a message. Never blocks; a full outbound channel drops the message.
    pub fn publish(&self, msg: BrokerMessage) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(xch::TrySendError::Full(msg)) => {
                tracing::warn!(topic = %msg.topic, "outbound channel full; dropping publish");
            }
            Err(xch::TrySendError::Disconnected(msg)) => {
                tracing::warn!(topic = %msg.topic, "publisher channel closed; dropping publish");
            }
        }
    }

    pub fn publish_status(&self, status: AgentStatus) {
        self.publish(BrokerMessage::new(
            self.topics.status.clone(),
            status.as_str(),
            self.cfg.status_qos,
            self.cfg.status_retain,
        ));
    }

    pub fn publish_reading(&self, reading: &FilteredReading) {
        let payload = if self.cfg.reading_json {
            serde_json::json!({
                "machineId": self.cfg.machine_id,
                "weight": reading.value,
                "stable": reading.stable,
                "timestamp": iso_utc(reading.captured_at),
            })
            .to_string()
        } else {
            reading.value.to_string()
        };
        self.publish(BrokerMessage::new(
            self.topics.reading.clone(),
            payload,
            self.cfg.reading_qos,
            self.cfg.reading_retain,
        ));
    }
}

impl ReadingSink for PublishHandle {
    fn on_reading(&self, reading: &FilteredReading) {
        self.publish_reading(reading);
    }
}

pub struct Publisher {
    handle: PublishHandle,
    connector: SharedConnector,
    on_control: ControlCallback,
    rx: xch::Receiver<BrokerMessage>,
    state: Arc<StateCell>,
    buffered: Arc<AtomicUsize>,
    /// Parked here while the loop is not running.
    buffer: Arc<Mutex<Option<OfflineBuffer>>>,
    worker: Option<Worker>,
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Publisher {
    pub fn new(cfg: PublisherCfg, connector: Box<dyn BrokerConnector>, on_control: ControlCallback) -> Self {
        let (tx, rx) = xch::bounded(cfg.outbound_capacity.max(1));
        let handle = PublishHandle {
            topics: Arc::new(Topics::new(&cfg.machine_id)),
            cfg: Arc::new(cfg),
            tx,
        };
        Self {
            handle,
            connector: Arc::new(Mutex::new(connector)),
            on_control,
            rx,
            state: Arc::new(StateCell::default()),
            buffered: Arc::new(AtomicUsize::new(0)),
            buffer: Arc::new(Mutex::new(None)),
            worker: None,
        }
    }

    pub fn handle(&self) -> PublishHandle {
        self.handle.clone()
    }

    pub fn topics(&self) -> &Topics {
        self.handle.topics()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(Worker::is_running)
    }

    /// Messages held by the offline buffer.
    pub fn buffered_len(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Messages accepted but not yet seen by the network loop.
    pub fn pending_len(&self) -> usize {
        self.rx.len()
    }

    pub fn publish(&self, msg: BrokerMessage) {
        self.handle.publish(msg);
    }

    pub fn publish_status(&self, status: AgentStatus) {
        self.handle.publish_status(status);
    }

    pub fn publish_reading(&self, reading: &FilteredReading) {
        self.handle.publish_reading(reading);
    }

    /// Start the network loop. Idempotent.
    pub fn start(&mut self) -> std::io::Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if let Some(mut old) = self.worker.take() {
            old.stop();
        }
        let cfg = self.handle.cfg.clone();
        let topics = self.handle.topics.clone();
        let buffer = match lock(&self.buffer).take() {
            Some(b) => Some(b),
            None => cfg.buffer.as_ref().map(|bc| {
                OfflineBuffer::open(bc).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "cannot open offline buffer directory; buffering in memory only");
                    OfflineBuffer::in_memory(bc.max_items)
                })
            }),
        };
        if let Some(b) = &buffer {
            self.buffered.store(b.len(), Ordering::Relaxed);
        }
        let mut net = NetLoop {
            connector: self.connector.clone(),
            rx: self.rx.clone(),
            on_control: self.on_control.clone(),
            state: self.state.clone(),
            buffered: self.buffered.clone(),
            topics: (*topics).clone(),
            buffer,
            request: ConnectRequest {
                last_will: BrokerMessage::new(
                    topics.status.clone(),
                    AgentStatus::Offline.as_str(),
                    cfg.status_qos,
                    cfg.status_retain,
                ),
                subscribe: topics.print.clone(),
                timeout: cfg.connect_timeout,
            },
            reconnect_delay: cfg.reconnect_delay,
        };
        let slot = self.buffer.clone();
        let worker = Worker::spawn("weigh-mqtt", cfg.stop_timeout, move |stop| {
            net.run(&stop);
            if let Some(mut b) = net.buffer.take() {
                b.compact();
                *lock(&slot) = Some(b);
            }
        })?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Flush, disconnect cleanly and join the loop.
    pub fn stop(&mut self) {
        if let Some(mut w) = self.worker.take() {
            w.stop();
        }
        self.state.set(ConnectionState::Disconnected);
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.stop();
    }
}

enum SessionEnd {
    Stopped,
    Lost(BoxError),
}

struct NetLoop {
    connector: SharedConnector,
    rx: xch::Receiver<BrokerMessage>,
    on_control: ControlCallback,
    state: Arc<StateCell>,
    buffered: Arc<AtomicUsize>,
    topics: Topics,
    buffer: Option<OfflineBuffer>,
    request: ConnectRequest,
    reconnect_delay: Duration,
}

impl NetLoop {
    fn run(&mut self, stop: &StopSignal) {
        while !stop.is_stopped() {
            self.state.set(ConnectionState::Connecting);
            let connected = lock(&self.connector).connect(&self.request);
            let mut session = match connected {
                Ok(s) => s,
                Err(e) => {
                    self.state.set(ConnectionState::Disconnected);
                    tracing::warn!(error = %e, "broker connect failed");
                    if self.absorb_for(self.reconnect_delay, stop) {
                        break;
                    }
                    continue;
                }
            };
            self.state.set(ConnectionState::Connected);
            tracing::info!(subscribe = %self.request.subscribe, "broker connected");

            let end = match self.drain_buffer(session.as_mut()) {
                Ok(()) => self.serve(session.as_mut(), stop),
                Err(e) => SessionEnd::Lost(e),
            };
            match end {
                SessionEnd::Stopped => {
                    session.disconnect();
                    self.reclaim(session.as_mut());
                    break;
                }
                SessionEnd::Lost(e) => {
                    self.state.set(ConnectionState::Disconnected);
                    tracing::warn!(error = %e, "broker connection lost");
                    self.reclaim(session.as_mut());
                    drop(session);
                    if self.absorb_for(self.reconnect_delay, stop) {
                        break;
                    }
                }
            }
        }
        // Whatever is still queued is kept for the next session.
        while let Ok(msg) = self.rx.try_recv() {
            self.store(msg);
        }
        self.state.set(ConnectionState::Disconnected);
    }

    fn store(&mut self, msg: BrokerMessage) {
        match self.buffer.as_mut() {
            Some(b) => {
                b.push(msg);
                self.buffered.store(b.len(), Ordering::Relaxed);
            }
            None => tracing::warn!(topic = %msg.topic, "not connected and buffering disabled; dropping publish"),
        }
    }

    /// Move messages the ended session never confirmed back to the head of
    /// the buffer, ahead of anything queued after them.
    fn reclaim(&mut self, session: &mut dyn BrokerSession) {
        let unconfirmed = session.take_unconfirmed();
        if unconfirmed.is_empty() {
            return;
        }
        match self.buffer.as_mut() {
            Some(b) => {
                tracing::info!(items = unconfirmed.len(), "requeueing unconfirmed publishes");
                b.requeue_unconfirmed(unconfirmed);
                self.buffered.store(b.len(), Ordering::Relaxed);
            }
            None => {
                tracing::warn!(items = unconfirmed.len(), "buffering disabled; unconfirmed publishes lost")
            }
        }
    }

    /// Buffer outbound traffic for `d` or until stopped. Returns true when stopped.
    fn absorb_for(&mut self, d: Duration, stop: &StopSignal) -> bool {
        let deadline = Instant::now() + d;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            xch::select! {
                recv(self.rx) -> msg => {
                    if let Ok(msg) = msg {
                        self.store(msg);
                    }
                }
                recv(stop.receiver()) -> _ => return true,
                default(remaining) => return false,
            }
        }
    }

    fn drain_buffer(&mut self, session: &mut dyn BrokerSession) -> Result<(), BoxError> {
        let Some(buf) = self.buffer.as_mut() else {
            return Ok(());
        };
        if buf.is_empty() {
            return Ok(());
        }
        let total = buf.len();
        let mut result = Ok(());
        while let Some(msg) = buf.pop_front() {
            if let Err(e) = session.publish(&msg) {
                buf.requeue_front(msg);
                result = Err(e);
                break;
            }
        }
        buf.compact();
        self.buffered.store(buf.len(), Ordering::Relaxed);
        match &result {
            Ok(()) => tracing::info!(items = total, "offline buffer drained"),
            Err(_) => tracing::warn!(remaining = buf.len(), "offline buffer drain interrupted"),
        }
        result
    }

    fn serve(&mut self, session: &mut dyn BrokerSession, stop: &StopSignal) -> SessionEnd {
        loop {
            while let Ok(msg) = self.rx.try_recv() {
                if let Err(e) = session.publish(&msg) {
                    self.store(msg);
                    return SessionEnd::Lost(e);
                }
            }
            if stop.is_stopped() {
                return SessionEnd::Stopped;
            }
            match session.poll(POLL_SLICE) {
                Ok(Some(inbound)) => self.dispatch(inbound),
                Ok(None) => {}
                Err(e) => return SessionEnd::Lost(e),
            }
        }
    }

    fn dispatch(&self, inbound: BrokerMessage) {
        let msg = ControlMessage::classify(&self.topics, inbound);
        if let ControlMessage::Unknown { topic, payload } = &msg {
            tracing::debug!(%topic, bytes = payload.len(), "unrecognized control message");
        }
        let cb = self.on_control.clone();
        if catch_unwind(AssertUnwindSafe(|| cb(msg))).is_err() {
            tracing::error!("control callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_machine_id() {
        let t = Topics::new("m7");
        assert_eq!(t.reading, "weigh/m7/reading");
        assert_eq!(t.status, "weigh/m7/status");
        assert_eq!(t.print, "weigh/m7/print");
    }

    #[test]
    fn print_payload_is_classified() {
        let t = Topics::new("m1");
        let raw = br#"{"secret":"s","pdfUrl":"http://x/doc.pdf","headers":{"Authorization":"Bearer t"},"printer":"P1"}"#;
        let msg = ControlMessage::classify(&t, BrokerMessage::new(t.print.clone(), raw.to_vec(), 1, false));
        let ControlMessage::Print(cmd) = msg else {
            panic!("expected print command, got {msg:?}");
        };
        assert_eq!(cmd.secret.as_deref(), Some("s"));
        assert_eq!(cmd.pdf_url.as_deref(), Some("http://x/doc.pdf"));
        assert_eq!(cmd.headers.get("Authorization").map(String::as_str), Some("Bearer t"));
        assert_eq!(cmd.printer.as_deref(), Some("P1"));
    }

    #[test]
    fn malformed_print_payload_falls_back_to_unknown() {
        let t = Topics::new("m1");
        let msg = ControlMessage::classify(&t, BrokerMessage::new(t.print.clone(), b"not json".to_vec(), 0, false));
        assert_eq!(
            msg,
            ControlMessage::Unknown {
                topic: "weigh/m1/print".into(),
                payload: b"not json".to_vec()
            }
        );
    }
}
