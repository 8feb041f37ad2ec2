//! Subcommand implementations.
use crate::cli::json_mode;
use chrono::Utc;
use eyre::WrapErr;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use weigh_config::{AgentConfig, SourceMode, decode_escapes};
use weigh_core::config::{AgentCfg, FramingCfg};
use weigh_core::framing::{FrameDecoder, ValueParser};
use weigh_core::{Agent, HealthSnapshot, StatusReport};
use weigh_io::{CommandPrinter, HttpEventTransport, HttpFetcher, MqttConnector, SerialOpener};

/// How often the run loop checks the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);
/// How often the run loop logs a status line.
const STATUS_EVERY: Duration = Duration::from_secs(60);

pub fn build_agent(cfg: &AgentConfig, simulate: bool) -> eyre::Result<Agent> {
    let runtime = AgentCfg::try_from(cfg)?;
    let mut builder = Agent::builder(runtime)
        .broker(MqttConnector::from_section(&cfg.mqtt, &cfg.machine_id))
        .printer(Arc::new(CommandPrinter::from_section(&cfg.print)))
        .fetcher(Arc::new(
            HttpFetcher::from_section(&cfg.print).wrap_err("init print fetcher")?,
        ));
    builder = if simulate || cfg.source.mode == SourceMode::Simulated {
        builder.simulated()
    } else {
        builder.transport(SerialOpener::from_section(&cfg.serial).wrap_err("serial settings")?)
    };
    if cfg.backend.enabled {
        builder = builder.events(HttpEventTransport::from_section(&cfg.backend).wrap_err("init backend client")?);
    }
    builder.build()
}

fn status_line(s: &StatusReport) {
    tracing::info!(
        machine_id = %s.machine_id,
        broker = s.broker.as_str(),
        transport = s.transport.as_str(),
        weight = s.latest.as_ref().map(|r| r.value),
        sample_age_s = s.sample_age.map(|d| d.as_secs()),
        stale = s.stale,
        backend_queue = s.backend_queue,
        offline_buffered = s.offline_buffered,
        published = s.filter.published,
        "status"
    );
}

pub fn run(cfg: &AgentConfig, simulate: bool) -> eyre::Result<()> {
    cfg.validate()?;
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let flag = shutdown.clone();
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .wrap_err("install ctrl-c handler")?;
    }

    let mut agent = build_agent(cfg, simulate)?;
    agent.start()?;
    tracing::info!(machine_id = %cfg.machine_id, "agent running; ctrl-c to stop");

    let health_every = Duration::from_secs(cfg.health.interval_s.max(1));
    let mut since_status = Duration::ZERO;
    let mut since_health = health_every;
    while !shutdown.load(Ordering::SeqCst) {
        if since_health >= health_every {
            since_health = Duration::ZERO;
            write_health(cfg, &agent.status());
        }
        std::thread::sleep(SHUTDOWN_POLL);
        since_status += SHUTDOWN_POLL;
        since_health += SHUTDOWN_POLL;
        if since_status >= STATUS_EVERY {
            since_status = Duration::ZERO;
            status_line(&agent.status());
        }
    }

    tracing::info!("shutdown requested");
    agent.stop();
    write_health(cfg, &agent.status());
    Ok(())
}

/// Rewrite the health snapshot when one is configured. Failures are logged only.
fn write_health(cfg: &AgentConfig, status: &StatusReport) {
    let Some(path) = &cfg.health.file else {
        return;
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty())
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        tracing::warn!(dir = %dir.display(), error = %e, "cannot create health snapshot directory");
        return;
    }
    if let Err(e) = HealthSnapshot::from_report(status, Utc::now()).write(path) {
        tracing::warn!(path = %path.display(), error = %e, "health snapshot write failed");
    }
}

pub fn health(cfg: &AgentConfig) -> eyre::Result<()> {
    let Some(path) = &cfg.health.file else {
        eyre::bail!("health.file must be set to read a health snapshot");
    };
    let snap = HealthSnapshot::read(path).wrap_err_with(|| format!("read health snapshot {}", path.display()))?;
    let max_silence = (cfg.serial.stale_data_s > 0).then(|| Duration::from_secs(cfg.serial.stale_data_s));
    // Three missed rewrites mean the writer is gone.
    let max_snapshot_age = Duration::from_secs(cfg.health.interval_s.max(1) * 3);
    let verdict = snap.assess(Utc::now(), max_silence, max_snapshot_age);
    if json_mode() {
        let mut out = serde_json::to_value(&snap)?;
        out["ageSec"] = json!(verdict.age_sec);
        out["healthy"] = json!(verdict.healthy);
        out["reason"] = json!(verdict.reason);
        println!("{out}");
    } else {
        let age = verdict
            .age_sec
            .map_or_else(|| "never".to_string(), |a| format!("{a:.1}s ago"));
        println!("machine {}: {:?}, last reading {age}", snap.machine_id, snap.status);
        println!("  broker:    {}", snap.broker);
        println!("  transport: {}", snap.transport);
    }
    match verdict.reason {
        Some(reason) if !verdict.healthy => eyre::bail!("unhealthy: {reason}"),
        _ => Ok(()),
    }
}

pub fn check_config(cfg: &AgentConfig) -> eyre::Result<()> {
    cfg.validate()?;
    let runtime = AgentCfg::try_from(cfg)?;
    let topics = weigh_core::Topics::new(&cfg.machine_id);
    if json_mode() {
        let summary = json!({
            "ok": true,
            "machineId": cfg.machine_id,
            "source": format!("{:?}", cfg.source.mode).to_ascii_lowercase(),
            "broker": format!("{}:{}", cfg.mqtt.host, cfg.mqtt.port),
            "topics": [topics.reading, topics.status, topics.print],
            "backend": cfg.backend.enabled.then(|| cfg.backend.events_url()),
            "heartbeatS": runtime.heartbeat.map(|d| d.as_secs()),
        });
        println!("{summary}");
    } else {
        println!("config ok: machine {}", cfg.machine_id);
        println!("  source:  {:?}", cfg.source.mode);
        println!("  broker:  {}:{}", cfg.mqtt.host, cfg.mqtt.port);
        println!("  topics:  {} | {} | {}", topics.reading, topics.status, topics.print);
        match cfg.backend.enabled {
            true => println!("  backend: {}", cfg.backend.events_url()),
            false => println!("  backend: disabled"),
        }
    }
    Ok(())
}

/// Values parsed from `frame` with the configured delimiters and regex.
pub fn parse_frames(cfg: &AgentConfig, frame: &str) -> eyre::Result<Vec<Option<f64>>> {
    let framing = FramingCfg::try_from(&cfg.serial)?;
    let mut decoder = FrameDecoder::new(&framing);
    let parser = ValueParser::new(&framing);
    let mut bytes = decode_escapes(frame);
    // A trailing newline flushes line-delimited input.
    if !bytes.ends_with(b"\n") {
        bytes.push(b'\n');
    }
    Ok(decoder
        .push(&bytes)
        .iter()
        .filter(|f| !f.is_empty())
        .map(|f| parser.parse(f))
        .collect())
}

pub fn parse(cfg: &AgentConfig, frame: &str) -> eyre::Result<()> {
    let values = parse_frames(cfg, frame)?;
    if values.is_empty() {
        eyre::bail!("no complete frame found in input");
    }
    if json_mode() {
        println!("{}", json!({ "values": values }));
    } else {
        for (i, v) in values.iter().enumerate() {
            match v {
                Some(v) => println!("frame {i}: {v}"),
                None => println!("frame {i}: no match"),
            }
        }
    }
    Ok(())
}
