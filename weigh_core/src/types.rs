//! Data model shared by the pipeline stages.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

/// One weight value straight from the source, before filtering.
///
/// `captured_at` is wall time for payloads only; every interval the
/// pipeline measures uses `monotonic`, which never steps backwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub value: f64,
    pub captured_at: DateTime<Utc>,
    pub monotonic: Instant,
}

impl RawSample {
    pub fn now(value: f64) -> Self {
        Self::new(value, Utc::now(), Instant::now())
    }

    pub fn new(value: f64, captured_at: DateTime<Utc>, monotonic: Instant) -> Self {
        Self {
            value,
            captured_at,
            monotonic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilteredReading {
    pub value: f64,
    pub stable: bool,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnectionState {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Error = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Error,
            _ => Self::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

/// Connection state written by its owning loop and read by status queries.
#[derive(Debug, Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Returns the previous state.
    pub fn set(&self, s: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(s as u8, Ordering::AcqRel))
    }
}

/// Agent status words published on the status topic and pushed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Online,
    Offline,
    PrintOk,
    PrintError,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::PrintOk => "PRINT_OK",
            Self::PrintError => "PRINT_ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Reading,
    Status,
    PrintResult,
}

impl EventKind {
    /// Value of the `type` field on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Reading => "reading",
            Self::Status => "status",
            Self::PrintResult => "print",
        }
    }
}

/// An event bound for the HTTP backend.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub kind: EventKind,
    pub payload: Map<String, Value>,
    pub machine_id: String,
    pub created_at: DateTime<Utc>,
    /// Failed deliveries so far.
    pub attempt: u32,
}

impl OutboundEvent {
    pub fn new(kind: EventKind, payload: Map<String, Value>, machine_id: impl Into<String>) -> Self {
        Self {
            kind,
            payload,
            machine_id: machine_id.into(),
            created_at: Utc::now(),
            attempt: 0,
        }
    }

    /// `{type, machineId, timestamp, attempt, ...payload}`.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::with_capacity(self.payload.len() + 4);
        obj.insert("type".into(), Value::from(self.kind.wire_name()));
        obj.insert("machineId".into(), Value::from(self.machine_id.clone()));
        obj.insert("timestamp".into(), Value::from(iso_utc(self.created_at)));
        obj.insert("attempt".into(), Value::from(self.attempt));
        for (k, v) in &self.payload {
            obj.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Value::Object(obj)
    }
}

/// ISO-8601 UTC with millisecond precision and a `Z` suffix.
pub fn iso_utc(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}
