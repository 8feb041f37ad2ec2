//! Hardware and network seams shared by the weigh agent crates.
//!
//! Every boundary that touches a device or a remote service is a trait here,
//! so the core pipeline can be driven by real adapters (`weigh_io`) or by the
//! in-memory mocks in `weigh_core::mocks`.
pub mod clock;

pub use clock::{Clock, MonotonicClock};

use std::time::Duration;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Byte-stream handle to a scale (serial-like).
pub trait ByteTransport: Send {
    /// Read available bytes into `buf`. Returns `Ok(0)` when the read timed out
    /// without data; any `Err` means the handle is unusable.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BoxError>;
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), BoxError>;
}

/// Opens a fresh transport handle; called again after every failure.
pub trait TransportOpener: Send {
    fn open(&mut self) -> Result<Box<dyn ByteTransport>, BoxError>;
    /// Human-readable endpoint name for logs (e.g. `/dev/ttyUSB0 @ 9600`).
    fn describe(&self) -> String;
}

/// A message travelling to or from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: u8, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }
}

/// Connection parameters handed to the connector on every attempt.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Registered with the broker before the session is established.
    pub last_will: BrokerMessage,
    /// Control topic subscribed as part of the connect.
    pub subscribe: String,
    pub timeout: Duration,
}

pub trait BrokerConnector: Send {
    /// Establish a session. Blocks at most `req.timeout`.
    fn connect(&mut self, req: &ConnectRequest) -> Result<Box<dyn BrokerSession>, BoxError>;
}

pub trait BrokerSession: Send {
    /// Hand a message to the session. `Ok` means accepted for sending, not
    /// delivered; see `take_unconfirmed`.
    fn publish(&mut self, msg: &BrokerMessage) -> Result<(), BoxError>;
    /// Drive network I/O for up to `timeout`. Returns an inbound message if one
    /// arrived; `Err` means the session is gone.
    fn poll(&mut self, timeout: Duration) -> Result<Option<BrokerMessage>, BoxError>;
    /// Clean disconnect (no Last-Will).
    fn disconnect(&mut self);
    /// Accepted messages the broker has not confirmed yet, in send order.
    /// Drains the ledger; called once the session has ended.
    fn take_unconfirmed(&mut self) -> Vec<BrokerMessage> {
        Vec::new()
    }
}

/// Delivers one JSON-encoded event to the backend. `Ok` only on a 2xx answer.
pub trait EventTransport: Send {
    fn post(&mut self, body: &[u8]) -> Result<(), BoxError>;
}

/// Fetches a document referenced by URL for printing.
pub trait DocumentFetcher: Send + Sync {
    fn fetch(&self, url: &str, headers: &[(String, String)]) -> Result<Vec<u8>, BoxError>;
}

pub trait Printer: Send + Sync {
    fn print(&self, document: &[u8], printer: Option<&str>) -> Result<(), BoxError>;
}
