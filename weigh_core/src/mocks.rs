//! In-memory implementations of every seam, for tests and demos.
//!
//! Each mock is a cheap `Clone` around shared state: hand one clone to the
//! component under test and keep another to script and inspect it.
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use weigh_traits::{
    BoxError, BrokerConnector, BrokerMessage, BrokerSession, ByteTransport, ConnectRequest,
    DocumentFetcher, EventTransport, Printer, TransportOpener,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Poll `cond` every few milliseconds until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

enum ReadStep {
    Data(Vec<u8>),
    Fail,
}

#[derive(Default)]
struct ScriptState {
    reads: Mutex<VecDeque<ReadStep>>,
    writes: Mutex<Vec<Vec<u8>>>,
    failing_opens: AtomicUsize,
    opens: AtomicUsize,
    live: AtomicUsize,
}

/// Scripted byte transport. Doubles as its own opener.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<ScriptState>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for a future read.
    pub fn feed(&self, bytes: impl Into<Vec<u8>>) {
        lock(&self.state.reads).push_back(ReadStep::Data(bytes.into()));
    }

    /// Queue a read error; the source must reopen afterwards.
    pub fn fail_read(&self) {
        lock(&self.state.reads).push_back(ReadStep::Fail);
    }

    /// Make the next `n` opens fail.
    pub fn fail_opens(&self, n: usize) {
        self.state.failing_opens.store(n, Ordering::SeqCst);
    }

    /// Successful opens so far.
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Handles currently open (not yet dropped).
    pub fn live_handles(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state.writes).clone()
    }
}

impl TransportOpener for ScriptedTransport {
    fn open(&mut self) -> Result<Box<dyn ByteTransport>, BoxError> {
        let failing = self.state.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.state.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err("scripted open failure".into());
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        self.state.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedHandle {
            state: self.state.clone(),
        }))
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

struct ScriptedHandle {
    state: Arc<ScriptState>,
}

impl ByteTransport for ScriptedHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BoxError> {
        let step = lock(&self.state.reads).pop_front();
        match step {
            Some(ReadStep::Data(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    let rest = bytes.split_off(n);
                    lock(&self.state.reads).push_front(ReadStep::Data(rest));
                }
                Ok(n)
            }
            Some(ReadStep::Fail) => Err("scripted read failure".into()),
            None => {
                std::thread::sleep(Duration::from_millis(5));
                Ok(0)
            }
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), BoxError> {
        lock(&self.state.writes).push(bytes.to_vec());
        Ok(())
    }
}

impl Drop for ScriptedHandle {
    fn drop(&mut self) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Broker ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct BrokerInner {
    online: bool,
    generation: u64,
    connects: usize,
    clean_disconnects: usize,
    wills: Vec<BrokerMessage>,
    subscriptions: Vec<String>,
    published: Vec<BrokerMessage>,
    inbound: VecDeque<BrokerMessage>,
    unresponsive: bool,
    swallowed: usize,
}

/// In-memory broker. Starts online; taking it offline kills live sessions.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner {
                online: true,
                ..BrokerInner::default()
            })),
        }
    }

    pub fn offline() -> Self {
        let b = Self::new();
        b.set_online(false);
        b
    }

    pub fn set_online(&self, online: bool) {
        let mut g = lock(&self.inner);
        if g.online && !online {
            g.generation += 1;
        }
        g.online = online;
    }

    /// Accept publishes without ever confirming them. Sessions hold the
    /// swallowed messages in their unconfirmed ledger.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        lock(&self.inner).unresponsive = unresponsive;
    }

    /// Publishes accepted while unresponsive.
    pub fn swallowed(&self) -> usize {
        lock(&self.inner).swallowed
    }

    /// Deliver a message to the current session's next poll.
    pub fn inject(&self, msg: BrokerMessage) {
        lock(&self.inner).inbound.push_back(msg);
    }

    pub fn connects(&self) -> usize {
        lock(&self.inner).connects
    }

    pub fn clean_disconnects(&self) -> usize {
        lock(&self.inner).clean_disconnects
    }

    /// Last-Will registered on each successful connect, in order.
    pub fn wills(&self) -> Vec<BrokerMessage> {
        lock(&self.inner).wills.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.inner).subscriptions.clone()
    }

    pub fn published(&self) -> Vec<BrokerMessage> {
        lock(&self.inner).published.clone()
    }

    /// Payloads published on `topic`, as UTF-8 text.
    pub fn payloads_on(&self, topic: &str) -> Vec<String> {
        lock(&self.inner)
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect()
    }
}

impl BrokerConnector for MemoryBroker {
    fn connect(&mut self, req: &ConnectRequest) -> Result<Box<dyn BrokerSession>, BoxError> {
        let mut g = lock(&self.inner);
        if !g.online {
            return Err("broker unreachable".into());
        }
        g.connects += 1;
        g.wills.push(req.last_will.clone());
        g.subscriptions.push(req.subscribe.clone());
        Ok(Box::new(MemorySession {
            inner: self.inner.clone(),
            generation: g.generation,
            unconfirmed: Vec::new(),
        }))
    }
}

struct MemorySession {
    inner: Arc<Mutex<BrokerInner>>,
    generation: u64,
    unconfirmed: Vec<BrokerMessage>,
}

impl MemorySession {
    fn alive(&self, g: &BrokerInner) -> Result<(), BoxError> {
        if g.online && g.generation == self.generation {
            Ok(())
        } else {
            Err("connection lost".into())
        }
    }
}

impl BrokerSession for MemorySession {
    fn publish(&mut self, msg: &BrokerMessage) -> Result<(), BoxError> {
        let mut g = lock(&self.inner);
        self.alive(&g)?;
        if g.unresponsive {
            g.swallowed += 1;
            self.unconfirmed.push(msg.clone());
        } else {
            g.published.push(msg.clone());
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<BrokerMessage>, BoxError> {
        {
            let mut g = lock(&self.inner);
            self.alive(&g)?;
            if let Some(m) = g.inbound.pop_front() {
                return Ok(Some(m));
            }
        }
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(None)
    }

    fn disconnect(&mut self) {
        lock(&self.inner).clean_disconnects += 1;
    }

    fn take_unconfirmed(&mut self) -> Vec<BrokerMessage> {
        std::mem::take(&mut self.unconfirmed)
    }
}

// ── Backend ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    Never,
    Always,
    /// Fail the first `n` posts, then succeed.
    FirstN(usize),
}

struct EventsInner {
    mode: FailMode,
    attempts: Vec<(Instant, Value)>,
    delivered: Vec<Value>,
}

/// Records every POST body; fails according to its `FailMode`.
#[derive(Clone)]
pub struct RecordingEvents {
    inner: Arc<Mutex<EventsInner>>,
}

impl RecordingEvents {
    pub fn new(mode: FailMode) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventsInner {
                mode,
                attempts: Vec::new(),
                delivered: Vec::new(),
            })),
        }
    }

    pub fn set_mode(&self, mode: FailMode) {
        lock(&self.inner).mode = mode;
    }

    /// Every POST, successful or not, with the time it was made.
    pub fn attempts(&self) -> Vec<(Instant, Value)> {
        lock(&self.inner).attempts.clone()
    }

    pub fn delivered(&self) -> Vec<Value> {
        lock(&self.inner).delivered.clone()
    }
}

impl EventTransport for RecordingEvents {
    fn post(&mut self, body: &[u8]) -> Result<(), BoxError> {
        let value: Value = serde_json::from_slice(body)?;
        let mut g = lock(&self.inner);
        g.attempts.push((Instant::now(), value.clone()));
        let fail = match g.mode {
            FailMode::Never => false,
            FailMode::Always => true,
            FailMode::FirstN(n) => {
                g.mode = FailMode::FirstN(n.saturating_sub(1));
                n > 0
            }
        };
        if fail {
            return Err("backend answered 503".into());
        }
        g.delivered.push(value);
        Ok(())
    }
}

// ── Printing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintJob {
    pub document: Vec<u8>,
    pub printer: Option<String>,
}

#[derive(Clone, Default)]
pub struct RecordingPrinter {
    jobs: Arc<Mutex<Vec<PrintJob>>>,
    fail: Arc<Mutex<Option<String>>>,
}

impl RecordingPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every job with `msg`.
    pub fn failing(msg: &str) -> Self {
        let p = Self::default();
        *lock(&p.fail) = Some(msg.to_string());
        p
    }

    pub fn jobs(&self) -> Vec<PrintJob> {
        lock(&self.jobs).clone()
    }
}

impl Printer for RecordingPrinter {
    fn print(&self, document: &[u8], printer: Option<&str>) -> Result<(), BoxError> {
        if let Some(msg) = lock(&self.fail).clone() {
            return Err(msg.into());
        }
        lock(&self.jobs).push(PrintJob {
            document: document.to_vec(),
            printer: printer.map(str::to_string),
        });
        Ok(())
    }
}

/// Serves fixed documents by URL and records the headers it was asked with.
#[derive(Clone, Default)]
pub struct StaticFetcher {
    docs: Arc<HashMap<String, Vec<u8>>>,
    requests: Arc<Mutex<Vec<(String, Vec<(String, String)>)>>>,
}

impl StaticFetcher {
    pub fn new(docs: impl IntoIterator<Item = (String, Vec<u8>)>) -> Self {
        Self {
            docs: Arc::new(docs.into_iter().collect()),
            requests: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<(String, Vec<(String, String)>)> {
        lock(&self.requests).clone()
    }
}

impl DocumentFetcher for StaticFetcher {
    fn fetch(&self, url: &str, headers: &[(String, String)]) -> Result<Vec<u8>, BoxError> {
        lock(&self.requests).push((url.to_string(), headers.to_vec()));
        self.docs
            .get(url)
            .cloned()
            .ok_or_else(|| format!("404 for {url}").into())
    }
}
