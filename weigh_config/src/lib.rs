#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schema for the weigh agent.
//!
//! - `AgentConfig` and its sections are deserialized from TOML and validated.
//! - Every section has defaults, so a minimal file needs only `machine_id`.
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable consulted when `backend.api_key` is empty.
pub const API_KEY_ENV: &str = "WEIGH_API_KEY";

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    #[default]
    Serial,
    Simulated,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SourceSection {
    pub mode: SourceMode,
    /// Tick interval of the simulated generators (ms).
    pub interval_ms: u64,
    /// Decimal places kept on every emitted sample.
    pub decimals: u32,
    /// Bounded join for the read loop on stop (ms).
    pub stop_timeout_ms: u64,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            mode: SourceMode::Serial,
            interval_ms: 300,
            decimals: 3,
            stop_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum Parity {
    #[default]
    N,
    E,
    O,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    #[default]
    Ascii,
    #[serde(alias = "utf-8")]
    Utf8,
    #[serde(alias = "latin-1", alias = "iso-8859-1")]
    Latin1,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SerialSection {
    /// Device name, or `"auto"` to take the first COM*, ttyUSB* or ttyACM* port found.
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    pub flow_control: FlowControl,
    pub dtr_on_open: bool,
    pub rts_on_open: bool,
    pub encoding: TextEncoding,
    /// Must expose a capture group; `(?P<weight>...)` wins when present.
    pub regex: String,
    pub parse_divisor: f64,
    /// |value| <= zero_threshold snaps to 0.0 (0 disables).
    pub zero_threshold: f64,
    /// Frame delimiters; defaults are STX/ETX. Set both to `None` for line-only devices.
    pub start_marker: Option<u8>,
    pub end_marker: Option<u8>,
    /// Bytes written periodically to request a frame; supports `\r`, `\n`, `\xNN`.
    pub poll_command: String,
    /// 0 disables polling.
    pub poll_interval_ms: u64,
    pub reopen_delay_ms: u64,
    pub read_timeout_ms: u64,
    pub buffer_cap: usize,
    /// Warn when no value has arrived for this long; 0 disables.
    pub stale_data_s: u64,
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::N,
            stop_bits: 1,
            flow_control: FlowControl::None,
            dtr_on_open: false,
            rts_on_open: false,
            encoding: TextEncoding::Ascii,
            regex: r"(?P<weight>[+-]?\d+(?:\.\d+)?)".to_string(),
            parse_divisor: 1.0,
            zero_threshold: 0.0,
            start_marker: Some(0x02),
            end_marker: Some(0x03),
            poll_command: String::new(),
            poll_interval_ms: 0,
            reopen_delay_ms: 2000,
            read_timeout_ms: 200,
            buffer_cap: 4096,
            stale_data_s: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    #[default]
    Sine,
    Random,
    Saw,
    Step,
    Manual,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimulateSection {
    pub generator: GeneratorKind,
    pub min: f64,
    pub max: f64,
    pub hz: f64,
    /// Uniform noise amplitude added to every generated value.
    pub noise: f64,
    pub step: f64,
    pub manual_value: f64,
    /// Fixed RNG seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for SimulateSection {
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
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Smoothing {
    #[default]
    None,
    Ema,
    Kalman,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FilterSection {
    pub scale_factor: f64,
    pub scale_offset: f64,
    /// Reject a sample jumping further than this from the previous accepted one (0 disables).
    pub outlier_delta: f64,
    pub ma_window: usize,
    /// Second smoothing stage applied after the moving average.
    pub smoothing: Smoothing,
    pub ema_alpha: f64,
    pub kalman_q: f64,
    pub kalman_r: f64,
    pub stability_window: usize,
    pub stability_threshold: f64,
    pub stability_min_duration_ms: u64,
    pub publish_only_stable: bool,
    pub throttle_ms: u64,
    pub min_delta: f64,
}

impl Default for FilterSection {
    fn default() -> Self {
        Self {
            scale_factor: 1.0,
            scale_offset: 0.0,
            outlier_delta: 2000.0,
            ma_window: 5,
            smoothing: Smoothing::None,
            ema_alpha: 0.3,
            kalman_q: 1e-3,
            kalman_r: 1e-2,
            stability_window: 8,
            stability_threshold: 0.5,
            stability_min_duration_ms: 400,
            publish_only_stable: false,
            throttle_ms: 300,
            min_delta: 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub keepalive_s: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub reading_qos: u8,
    pub reading_retain: bool,
    /// Publish readings as JSON objects instead of bare numbers.
    pub reading_json: bool,
    pub status_qos: u8,
    pub status_retain: bool,
    pub buffer_enabled: bool,
    pub buffer_max_items: usize,
    /// Directory for `offline.jsonl`; memory-only buffer when unset.
    pub buffer_dir: Option<PathBuf>,
    pub stop_timeout_ms: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            keepalive_s: 30,
            connect_timeout_ms: 5000,
            reconnect_delay_ms: 2000,
            reading_qos: 0,
            reading_retain: false,
            reading_json: false,
            status_qos: 1,
            status_retain: false,
            buffer_enabled: true,
            buffer_max_items: 2000,
            buffer_dir: None,
            stop_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BackendSection {
    pub enabled: bool,
    pub base_url: String,
    pub events_endpoint: String,
    pub api_key: String,
    pub timeout_ms: u64,
    pub queue_capacity: usize,
    /// Delay before each retry; its length is the retry budget.
    pub retry_schedule_ms: Vec<u64>,
    pub min_interval_ms: u64,
    pub delta_threshold: f64,
    pub stop_timeout_ms: u64,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            events_endpoint: "/api/events".to_string(),
            api_key: String::new(),
            timeout_ms: 10_000,
            queue_capacity: 1000,
            retry_schedule_ms: vec![1000, 2000, 5000, 10_000],
            min_interval_ms: 500,
            delta_threshold: 5.0,
            stop_timeout_ms: 3000,
        }
    }
}

impl BackendSection {
    /// `base_url` + `events_endpoint`, joined with exactly one slash.
    pub fn events_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let ep = self.events_endpoint.trim_start_matches('/');
        format!("{base}/{ep}")
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PrintSection {
    pub secret: String,
    pub printer: Option<String>,
    pub command: String,
    /// `{file}` is replaced by the spooled document path.
    pub args: Vec<String>,
    /// Prepended to `args` when a printer name is known; `{printer}` is replaced.
    pub printer_args: Vec<String>,
    pub fetch_timeout_ms: u64,
}

impl Default for PrintSection {
    fn default() -> Self {
        Self {
            secret: String::new(),
            printer: None,
            command: "lp".to_string(),
            args: vec!["{file}".to_string()],
            printer_args: vec!["-d".to_string(), "{printer}".to_string()],
            fetch_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HeartbeatSection {
    /// 0 disables the heartbeat.
    pub interval_s: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self { interval_s: 30 }
    }
}

/// Health snapshot written by `run` and read back by `health`.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HealthSection {
    /// JSON snapshot path; `None` disables the snapshot.
    pub file: Option<PathBuf>,
    pub interval_s: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            file: None,
            interval_s: 10,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub machine_id: String,
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub serial: SerialSection,
    #[serde(default)]
    pub simulate: SimulateSection,
    #[serde(default)]
    pub filter: FilterSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub print: PrintSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub logging: Logging,
}

pub fn load_toml(s: &str) -> Result<AgentConfig, toml::de::Error> {
    toml::from_str::<AgentConfig>(s)
}

/// Read, parse and env-resolve a config file. Validation is left to the caller.
pub fn load_file(path: &Path) -> eyre::Result<AgentConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("read config {}: {}", path.display(), e))?;
    let mut cfg =
        load_toml(&text).map_err(|e| eyre::eyre!("parse config {}: {}", path.display(), e))?;
    cfg.resolve_env();
    Ok(cfg)
}

fn check_qos(name: &str, qos: u8) -> eyre::Result<()> {
    if qos > 2 {
        eyre::bail!("{name} must be 0, 1 or 2");
    }
    Ok(())
}

impl AgentConfig {
    /// Fill values the file leaves empty from the environment.
    pub fn resolve_env(&mut self) {
        if self.backend.api_key.is_empty()
            && let Ok(key) = std::env::var(API_KEY_ENV)
        {
            self.backend.api_key = key;
        }
    }

    pub fn validate(&self) -> eyre::Result<()> {
        if self.machine_id.trim().is_empty() {
            eyre::bail!("machine_id must not be empty");
        }
        if self.machine_id.contains(['/', '+', '#']) {
            eyre::bail!("machine_id must not contain MQTT topic characters (/ + #)");
        }

        // Source
        if self.source.mode == SourceMode::Simulated && self.source.interval_ms == 0 {
            eyre::bail!("source.interval_ms must be >= 1");
        }
        if self.source.decimals > 9 {
            eyre::bail!("source.decimals must be <= 9");
        }

        // Serial
        if self.source.mode == SourceMode::Serial {
            if self.serial.port.trim().is_empty() {
                eyre::bail!("serial.port must not be empty");
            }
            if self.serial.baud_rate == 0 {
                eyre::bail!("serial.baud_rate must be > 0");
            }
            if !(5..=8).contains(&self.serial.data_bits) {
                eyre::bail!("serial.data_bits must be in 5..=8");
            }
            if !(1..=2).contains(&self.serial.stop_bits) {
                eyre::bail!("serial.stop_bits must be 1 or 2");
            }
        }
        let re = regex::Regex::new(&self.serial.regex)
            .map_err(|e| eyre::eyre!("serial.regex does not compile: {e}"))?;
        if re.captures_len() < 2 {
            eyre::bail!("serial.regex must expose a capture group for the value");
        }
        if !(self.serial.parse_divisor.is_finite() && self.serial.parse_divisor > 0.0) {
            eyre::bail!("serial.parse_divisor must be > 0");
        }
        if self.serial.zero_threshold < 0.0 {
            eyre::bail!("serial.zero_threshold must be >= 0");
        }
        if self.serial.start_marker.is_some() != self.serial.end_marker.is_some() {
            eyre::bail!("serial.start_marker and serial.end_marker must be set together");
        }
        if self.serial.buffer_cap < 64 {
            eyre::bail!("serial.buffer_cap must be >= 64");
        }
        if self.health.file.is_some() && self.health.interval_s == 0 {
            eyre::bail!("health.interval_s must be >= 1 when health.file is set");
        }

        // Simulator
        if self.simulate.min > self.simulate.max {
            eyre::bail!("simulate.min must be <= simulate.max");
        }
        if self.simulate.noise < 0.0 || self.simulate.hz < 0.0 {
            eyre::bail!("simulate.noise and simulate.hz must be >= 0");
        }

        // Filter
        if self.filter.ma_window == 0 {
            eyre::bail!("filter.ma_window must be >= 1");
        }
        if self.filter.stability_window == 0 {
            eyre::bail!("filter.stability_window must be >= 1");
        }
        if self.filter.outlier_delta < 0.0
            || self.filter.stability_threshold < 0.0
            || self.filter.min_delta < 0.0
        {
            eyre::bail!("filter thresholds must be >= 0");
        }
        if !(self.filter.scale_factor.is_finite() && self.filter.scale_offset.is_finite()) {
            eyre::bail!("filter.scale_factor and filter.scale_offset must be finite");
        }
        match self.filter.smoothing {
            Smoothing::Ema if !(self.filter.ema_alpha > 0.0 && self.filter.ema_alpha <= 1.0) => {
                eyre::bail!("filter.ema_alpha must be in (0.0, 1.0]");
            }
            Smoothing::Kalman if !(self.filter.kalman_q > 0.0 && self.filter.kalman_r > 0.0) => {
                eyre::bail!("filter.kalman_q and filter.kalman_r must be > 0");
            }
            _ => {}
        }

        // MQTT
        if self.mqtt.host.trim().is_empty() {
            eyre::bail!("mqtt.host must not be empty");
        }
        check_qos("mqtt.reading_qos", self.mqtt.reading_qos)?;
        check_qos("mqtt.status_qos", self.mqtt.status_qos)?;
        if self.mqtt.reconnect_delay_ms == 0 {
            eyre::bail!("mqtt.reconnect_delay_ms must be >= 1");
        }
        if self.mqtt.buffer_enabled && self.mqtt.buffer_max_items == 0 {
            eyre::bail!("mqtt.buffer_max_items must be >= 1 when the buffer is enabled");
        }

        // Backend
        if self.backend.enabled {
            let url = self.backend.base_url.trim();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                eyre::bail!("backend.base_url must be an http(s) URL when backend.enabled");
            }
        }
        if self.backend.queue_capacity == 0 {
            eyre::bail!("backend.queue_capacity must be >= 1");
        }
        if self.backend.timeout_ms == 0 {
            eyre::bail!("backend.timeout_ms must be >= 1");
        }
        if self.backend.delta_threshold < 0.0 {
            eyre::bail!("backend.delta_threshold must be >= 0");
        }

        // Print: an empty secret would accept any unauthenticated command
        if self.print.secret.is_empty() {
            eyre::bail!("print.secret must not be empty");
        }
        if self.print.command.trim().is_empty() {
            eyre::bail!("print.command must not be empty");
        }

        Ok(())
    }
}

/// Expand `\r`, `\n`, `\t`, `\\` and `\xNN` escapes into raw bytes.
/// Unknown escapes are kept verbatim.
pub fn decode_escapes(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b != b'\\' || i + 1 >= bytes.len() {
            out.push(b);
            i += 1;
            continue;
        }
        match bytes[i + 1] {
            b'r' => out.push(b'\r'),
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'\\' => out.push(b'\\'),
            b'x' if i + 4 <= bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 2..i + 4]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(v) => {
                        out.push(v);
                        i += 4;
                        continue;
                    }
                    None => out.extend_from_slice(&bytes[i..i + 2]),
                }
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
        i += 2;
    }
    out
}
