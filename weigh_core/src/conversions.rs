//! Conversions from the TOML schema (`weigh_config`) into runtime configs.

use crate::config::{
    AgentCfg, BufferCfg, FilterCfg, FramingCfg, PrintCfg, PublisherCfg, PusherCfg, SimCfg,
    SmoothingCfg, SourceCfg, TransportCfg,
};
use crate::error::BuildError;
use std::time::Duration;
use weigh_config as wc;

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn non_zero_ms(v: u64) -> Option<Duration> {
    (v > 0).then(|| ms(v))
}

impl TryFrom<&wc::SerialSection> for FramingCfg {
    type Error = BuildError;
    fn try_from(s: &wc::SerialSection) -> Result<Self, Self::Error> {
        let regex = regex::Regex::new(&s.regex)
            .map_err(|e| BuildError::InvalidConfig(format!("serial.regex: {e}")))?;
        Ok(Self {
            start_marker: s.start_marker,
            end_marker: s.end_marker,
            buffer_cap: s.buffer_cap.max(64),
            encoding: s.encoding,
            regex,
            parse_divisor: s.parse_divisor,
            zero_threshold: s.zero_threshold,
        })
    }
}

impl TryFrom<&wc::SerialSection> for TransportCfg {
    type Error = BuildError;
    fn try_from(s: &wc::SerialSection) -> Result<Self, Self::Error> {
        let poll_command = wc::decode_escapes(&s.poll_command);
        let poll_interval = if poll_command.is_empty() {
            None
        } else {
            non_zero_ms(s.poll_interval_ms)
        };
        Ok(Self {
            framing: FramingCfg::try_from(s)?,
            poll_command,
            poll_interval,
            reopen_delay: ms(s.reopen_delay_ms.max(1)),
            stale_after: (s.stale_data_s > 0).then(|| Duration::from_secs(s.stale_data_s)),
        })
    }
}

impl SimCfg {
    pub fn from_sections(sim: &wc::SimulateSection, source: &wc::SourceSection) -> Self {
        Self {
            generator: sim.generator,
            min: sim.min,
            max: sim.max,
            hz: sim.hz,
            noise: sim.noise,
            step: sim.step,
            manual_value: sim.manual_value,
            seed: sim.seed,
            interval: ms(source.interval_ms.max(1)),
        }
    }
}

impl From<&wc::SourceSection> for SourceCfg {
    fn from(s: &wc::SourceSection) -> Self {
        Self {
            decimals: s.decimals,
            stop_timeout: ms(s.stop_timeout_ms),
        }
    }
}

impl From<&wc::FilterSection> for FilterCfg {
    fn from(f: &wc::FilterSection) -> Self {
        let smoothing = match f.smoothing {
            wc::Smoothing::None => SmoothingCfg::None,
            wc::Smoothing::Ema => SmoothingCfg::Ema { alpha: f.ema_alpha },
            wc::Smoothing::Kalman => SmoothingCfg::Kalman {
                q: f.kalman_q,
                r: f.kalman_r,
            },
        };
        Self {
            scale_factor: f.scale_factor,
            scale_offset: f.scale_offset,
            outlier_delta: (f.outlier_delta > 0.0).then_some(f.outlier_delta),
            ma_window: f.ma_window.max(1),
            smoothing,
            stability_window: f.stability_window.max(1),
            stability_threshold: f.stability_threshold,
            stability_min_duration: ms(f.stability_min_duration_ms),
            publish_only_stable: f.publish_only_stable,
            throttle: ms(f.throttle_ms),
            min_delta: f.min_delta,
        }
    }
}

impl PublisherCfg {
    pub fn from_section(m: &wc::MqttSection, machine_id: &str) -> Self {
        let buffer = m.buffer_enabled.then(|| BufferCfg {
            max_items: m.buffer_max_items.max(1),
            dir: m.buffer_dir.clone(),
        });
        Self {
            machine_id: machine_id.to_string(),
            reading_qos: m.reading_qos.min(2),
            reading_retain: m.reading_retain,
            reading_json: m.reading_json,
            status_qos: m.status_qos.min(2),
            status_retain: m.status_retain,
            buffer,
            connect_timeout: ms(m.connect_timeout_ms.max(1)),
            reconnect_delay: ms(m.reconnect_delay_ms.max(1)),
            stop_timeout: ms(m.stop_timeout_ms),
            ..Self::default()
        }
    }
}

impl PusherCfg {
    pub fn from_section(b: &wc::BackendSection, machine_id: &str) -> Self {
        Self {
            enabled: b.enabled,
            machine_id: machine_id.to_string(),
            queue_capacity: b.queue_capacity.max(1),
            retry_schedule: b.retry_schedule_ms.iter().copied().map(ms).collect(),
            min_interval: ms(b.min_interval_ms),
            delta_threshold: b.delta_threshold,
            stop_timeout: ms(b.stop_timeout_ms),
        }
    }
}

impl From<&wc::PrintSection> for PrintCfg {
    fn from(p: &wc::PrintSection) -> Self {
        Self {
            secret: p.secret.clone(),
            default_printer: p.printer.clone().filter(|s| !s.trim().is_empty()),
        }
    }
}

impl TryFrom<&wc::AgentConfig> for AgentCfg {
    type Error = BuildError;
    fn try_from(c: &wc::AgentConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            machine_id: c.machine_id.clone(),
            source: (&c.source).into(),
            transport: TransportCfg::try_from(&c.serial)?,
            simulate: SimCfg::from_sections(&c.simulate, &c.source),
            filter: (&c.filter).into(),
            publisher: PublisherCfg::from_section(&c.mqtt, &c.machine_id),
            pusher: PusherCfg::from_section(&c.backend, &c.machine_id),
            print: (&c.print).into(),
            heartbeat: (c.heartbeat.interval_s > 0)
                .then(|| Duration::from_secs(c.heartbeat.interval_s)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_full_config() {
        let toml = r#"
machine_id = "m7"
[serial]
poll_command = "SI\r\n"
poll_interval_ms = 500
stale_data_s = 0
[filter]
outlier_delta = 0.0
smoothing = "kalman"
[backend]
retry_schedule_ms = [10, 20]
[heartbeat]
interval_s = 0
[print]
secret = "k"
"#;
        let c = weigh_config::load_toml(toml).expect("parse");
        let cfg = AgentCfg::try_from(&c).expect("convert");
        assert_eq!(cfg.publisher.machine_id, "m7");
        assert_eq!(cfg.transport.poll_command, b"SI\r\n".to_vec());
        assert_eq!(cfg.transport.poll_interval, Some(Duration::from_millis(500)));
        assert_eq!(cfg.filter.outlier_delta, None);
        assert!(matches!(cfg.filter.smoothing, SmoothingCfg::Kalman { .. }));
        assert_eq!(
            cfg.pusher.retry_schedule,
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
        assert!(cfg.heartbeat.is_none());
        assert_eq!(cfg.transport.stale_after, None);
    }

    #[test]
    fn stale_watchdog_defaults_to_a_minute() {
        let c = weigh_config::load_toml("machine_id = \"m\"\n[print]\nsecret = \"k\"").expect("parse");
        let cfg = AgentCfg::try_from(&c).expect("convert");
        assert_eq!(cfg.transport.stale_after, Some(Duration::from_secs(60)));
    }
}
