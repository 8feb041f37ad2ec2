//! Runtime configuration types for the pipeline components.
//!
//! These are the immutable values each component is constructed with. They
//! are separate from the TOML-deserialized schema in `weigh_config`; see
//! `conversions` for the mapping.

use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
pub use weigh_config::{GeneratorKind, TextEncoding};

/// Frame extraction and value parsing for transport mode.
#[derive(Debug, Clone)]
pub struct FramingCfg {
    pub start_marker: Option<u8>,
    pub end_marker: Option<u8>,
    /// Hard cap on buffered bytes; on overflow only the newest half is kept.
    pub buffer_cap: usize,
    pub encoding: TextEncoding,
    pub regex: Regex,
    pub parse_divisor: f64,
    pub zero_threshold: f64,
}

impl Default for FramingCfg {
    fn default() -> Self {
        Self {
            start_marker: Some(0x02),
            end_marker: Some(0x03),
            buffer_cap: 4096,
            encoding: TextEncoding::Ascii,
            regex: default_regex(),
            parse_divisor: 1.0,
            zero_threshold: 0.0,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
fn default_regex() -> Regex {
    // Constant pattern; covered by unit tests.
    Regex::new(r"(?P<weight>[+-]?\d+(?:\.\d+)?)").expect("default weight regex")
}

#[derive(Debug, Clone)]
pub struct TransportCfg {
    pub framing: FramingCfg,
    pub poll_command: Vec<u8>,
    /// `None` disables polling.
    pub poll_interval: Option<Duration>,
    pub reopen_delay: Duration,
    /// Silence after which the source reports stale data. `None` disables.
    pub stale_after: Option<Duration>,
}

impl Default for TransportCfg {
    fn default() -> Self {
        Self {
            framing: FramingCfg::default(),
            poll_command: Vec::new(),
            poll_interval: None,
            reopen_delay: Duration::from_secs(2),
            stale_after: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimCfg {
    pub generator: GeneratorKind,
    pub min: f64,
    pub max: f64,
    pub hz: f64,
    pub noise: f64,
    pub step: f64,
    pub manual_value: f64,
    pub seed: Option<u64>,
    pub interval: Duration,
}

impl Default for SimCfg {
    fn default() -> Self {
        Self {
            generator: GeneratorKind::Sine,
            min: 1000.0,
            max: 30000.0,
            hz: 0.2,
            noise: 5.0,
            step: 250.0,
            manual_value: 1234.0,
            seed: None,
            interval: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceCfg {
    pub decimals: u32,
    pub stop_timeout: Duration,
}

impl Default for SourceCfg {
    fn default() -> Self {
        Self {
            decimals: 3,
            stop_timeout: Duration::from_secs(2),
        }
    }
}

/// Second smoothing stage, after the moving average.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SmoothingCfg {
    None,
    Ema { alpha: f64 },
    Kalman { q: f64, r: f64 },
}

#[derive(Debug, Clone)]
pub struct FilterCfg {
    pub scale_factor: f64,
    pub scale_offset: f64,
    /// `None` disables outlier rejection.
    pub outlier_delta: Option<f64>,
    pub ma_window: usize,
    pub smoothing: SmoothingCfg,
    pub stability_window: usize,
    pub stability_threshold: f64,
    pub stability_min_duration: Duration,
    pub publish_only_stable: bool,
    pub throttle: Duration,
    pub min_delta: f64,
}

impl Default for FilterCfg {
    fn default() -> Self {
        Self {
            scale_factor: 1.0,
            scale_offset: 0.0,
            outlier_delta: Some(2000.0),
            ma_window: 5,
            smoothing: SmoothingCfg::None,
            stability_window: 8,
            stability_threshold: 0.5,
            stability_min_duration: Duration::from_millis(400),
            publish_only_stable: false,
            throttle: Duration::from_millis(300),
            min_delta: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferCfg {
    pub max_items: usize,
    /// Memory-only when `None`.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PublisherCfg {
    pub machine_id: String,
    pub reading_qos: u8,
    pub reading_retain: bool,
    pub reading_json: bool,
    pub status_qos: u8,
    pub status_retain: bool,
    /// `None` drops publishes made while disconnected.
    pub buffer: Option<BufferCfg>,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub stop_timeout: Duration,
    /// Capacity of the caller -> network thread channel.
    pub outbound_capacity: usize,
}

impl Default for PublisherCfg {
    fn default() -> Self {
        Self {
            machine_id: "weigh1".to_string(),
            reading_qos: 0,
            reading_retain: false,
            reading_json: false,
            status_qos: 1,
            status_retain: false,
            buffer: Some(BufferCfg {
                max_items: 2000,
                dir: None,
            }),
            connect_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(2),
            outbound_capacity: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PusherCfg {
    pub enabled: bool,
    pub machine_id: String,
    pub queue_capacity: usize,
    /// Delay before retry n is `retry_schedule[n-1]`; the length is the retry budget.
    pub retry_schedule: Vec<Duration>,
    pub min_interval: Duration,
    pub delta_threshold: f64,
    pub stop_timeout: Duration,
}

impl Default for PusherCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            machine_id: "weigh1".to_string(),
            queue_capacity: 1000,
            retry_schedule: [1u64, 2, 5, 10].map(Duration::from_secs).to_vec(),
            min_interval: Duration::from_millis(500),
            delta_threshold: 5.0,
            stop_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrintCfg {
    pub secret: String,
    pub default_printer: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentCfg {
    pub machine_id: String,
    pub source: SourceCfg,
    pub transport: TransportCfg,
    pub simulate: SimCfg,
    pub filter: FilterCfg,
    pub publisher: PublisherCfg,
    pub pusher: PusherCfg,
    pub print: PrintCfg,
    /// `None` disables the heartbeat.
    pub heartbeat: Option<Duration>,
}
