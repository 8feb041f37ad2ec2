//! Health snapshot: the [`StatusReport`] as a JSON document that a running
//! agent rewrites periodically and a separate process can judge.
//!
//! Timestamps are RFC 3339 strings. `ageSec` is the sample age when the
//! snapshot was written; [`HealthSnapshot::assess`] recomputes it against
//! the reader's clock.
use crate::agent::StatusReport;
use crate::buffer::write_atomic;
use crate::types::iso_utc;
use crate::util::round_to;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Stale,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub machine_id: String,
    pub written_at: String,
    pub broker: String,
    pub transport: String,
    pub last_weight: Option<f64>,
    pub last_weight_ts: Option<String>,
    pub age_sec: Option<f64>,
    pub offline_buffered: usize,
    pub backend_queue: usize,
}

/// Result of judging a snapshot at read time.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub healthy: bool,
    /// Sample age against the reader's clock.
    pub age_sec: Option<f64>,
    pub reason: Option<String>,
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

fn secs_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    round_to((later - earlier).num_milliseconds().max(0) as f64 / 1000.0, 3)
}

impl HealthSnapshot {
    pub fn from_report(r: &StatusReport, now: DateTime<Utc>) -> Self {
        let status = match (r.running, r.stale) {
            (false, _) => HealthStatus::Stopped,
            (true, true) => HealthStatus::Stale,
            (true, false) => HealthStatus::Ok,
        };
        Self {
            status,
            machine_id: r.machine_id.clone(),
            written_at: iso_utc(now),
            broker: r.broker.as_str().to_string(),
            transport: r.transport.as_str().to_string(),
            last_weight: r.latest.map(|l| l.value),
            last_weight_ts: r.last_sample_at.map(iso_utc),
            age_sec: r.sample_age.map(|d| round_to(d.as_secs_f64(), 3)),
            offline_buffered: r.offline_buffered,
            backend_queue: r.backend_queue,
        }
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let bytes = serde_json::to_vec(self).map_err(std::io::Error::other)?;
        write_atomic(path, &bytes)
    }

    pub fn read(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Unhealthy when the snapshot itself is older than `max_snapshot_age`,
    /// the agent reported itself stopped or stale, or the last sample is
    /// older than `max_silence`.
    pub fn assess(&self, now: DateTime<Utc>, max_silence: Option<Duration>, max_snapshot_age: Duration) -> Assessment {
        let age_sec = self
            .last_weight_ts
            .as_deref()
            .and_then(parse_ts)
            .map(|t| secs_between(t, now));
        let unhealthy = |reason: String| Assessment {
            healthy: false,
            age_sec,
            reason: Some(reason),
        };

        let Some(written) = parse_ts(&self.written_at) else {
            return unhealthy(format!("unreadable snapshot timestamp {:?}", self.written_at));
        };
        let snapshot_age = secs_between(written, now);
        if snapshot_age > max_snapshot_age.as_secs_f64() {
            return unhealthy(format!("snapshot is {snapshot_age:.0}s old; agent not running"));
        }
        match self.status {
            HealthStatus::Stopped => return unhealthy("agent stopped".into()),
            HealthStatus::Stale => return unhealthy("agent reports stale data".into()),
            HealthStatus::Ok => {}
        }
        if let Some(limit) = max_silence
            && age_sec.is_some_and(|a| a > limit.as_secs_f64())
        {
            return unhealthy(format!("no reading for over {}s", limit.as_secs()));
        }
        Assessment {
            healthy: true,
            age_sec,
            reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterStats;
    use crate::pusher::PushStats;
    use crate::types::{ConnectionState, FilteredReading};

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap_or_default()
    }

    fn report(running: bool, stale: bool, sample: Option<i64>) -> StatusReport {
        StatusReport {
            machine_id: "m1".into(),
            running,
            broker: ConnectionState::Connected,
            transport: ConnectionState::Connected,
            latest: sample.map(|s| FilteredReading {
                value: 12.5,
                stable: true,
                captured_at: t(s),
            }),
            last_sample_at: sample.map(t),
            sample_age: sample.map(|_| Duration::from_millis(250)),
            stale,
            backend_queue: 0,
            offline_buffered: 2,
            pending_publishes: 0,
            filter: FilterStats::default(),
            backend: PushStats::default(),
        }
    }

    #[test]
    fn snapshot_uses_camel_case_wire_names() {
        let snap = HealthSnapshot::from_report(&report(true, false, Some(0)), t(1));
        let v = serde_json::to_value(&snap).expect("serialize");
        assert_eq!(v["status"], "ok");
        assert_eq!(v["machineId"], "m1");
        assert_eq!(v["lastWeight"], 12.5);
        assert_eq!(v["lastWeightTs"], "2023-11-14T22:13:20.000Z");
        assert_eq!(v["ageSec"], 0.25);
        assert_eq!(v["offlineBuffered"], 2);
    }

    #[test]
    fn age_is_recomputed_at_read_time() {
        let snap = HealthSnapshot::from_report(&report(true, false, Some(0)), t(5));
        let a = snap.assess(t(20), Some(Duration::from_secs(60)), Duration::from_secs(30));
        assert!(a.healthy, "{a:?}");
        assert_eq!(a.age_sec, Some(20.0));

        let a = snap.assess(t(20), Some(Duration::from_secs(10)), Duration::from_secs(30));
        assert!(!a.healthy);
        assert!(a.reason.is_some_and(|r| r.contains("no reading")));
    }

    #[test]
    fn old_snapshot_or_reported_state_is_unhealthy() {
        let snap = HealthSnapshot::from_report(&report(true, false, None), t(0));
        let a = snap.assess(t(100), None, Duration::from_secs(30));
        assert!(a.reason.is_some_and(|r| r.contains("not running")));

        for (running, stale, needle) in [(false, false, "stopped"), (true, true, "stale")] {
            let snap = HealthSnapshot::from_report(&report(running, stale, Some(0)), t(0));
            let a = snap.assess(t(1), None, Duration::from_secs(30));
            assert!(!a.healthy);
            assert!(a.reason.is_some_and(|r| r.contains(needle)));
        }
    }

    #[test]
    fn snapshot_survives_a_file_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("health.json");
        let snap = HealthSnapshot::from_report(&report(true, false, Some(3)), t(4));
        snap.write(&path).expect("write");
        assert_eq!(HealthSnapshot::read(&path).expect("read"), snap);
    }
}
