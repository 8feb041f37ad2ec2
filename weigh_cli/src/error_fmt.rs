//! Human-readable error descriptions and structured JSON error formatting.

use weigh_core::{AgentError, BuildError};

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingSource => {
                "What happened: No sample source was configured.\nLikely causes: Neither a serial transport nor the simulator was selected.\nHow to fix: Set source.mode in the config or pass `run --simulate`.".to_string()
            }
            BuildError::MissingBroker => {
                "What happened: No MQTT connector was provided to the agent.\nLikely causes: The broker adapter failed to initialize.\nHow to fix: Check the [mqtt] section.".to_string()
            }
            BuildError::MissingEvents => {
                "What happened: The backend is enabled but no HTTP client exists.\nLikely causes: backend.enabled = true with the client failing to build.\nHow to fix: Check [backend] base_url, or set backend.enabled = false.".to_string()
            }
            BuildError::MissingPrinter => {
                "What happened: No printer was provided to the agent.\nHow to fix: Check the [print] section (command, args).".to_string()
            }
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then run `weigh check-config`."
            ),
        };
    }

    if let Some(ae) = err.downcast_ref::<AgentError>() {
        return match ae {
            AgentError::Transport(m) => format!(
                "What happened: The scale transport failed ({m}).\nLikely causes: Wrong serial.port, the device is unplugged, or the port is held by another process.\nHow to fix: Verify the port name and permissions (dialout group on Linux), or run with --simulate."
            ),
            AgentError::Broker(m) => format!(
                "What happened: The MQTT broker is unreachable ({m}).\nLikely causes: Wrong mqtt.host/port or bad credentials.\nHow to fix: Check the broker address and mqtt.username/password."
            ),
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    // String-based heuristics for errors coming from config loading
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.starts_with("read config") {
        return format!(
            "What happened: The config file could not be read ({msg}).\nHow to fix: Pass --config <FILE> pointing at an existing TOML file."
        );
    }
    if lower.starts_with("parse config") {
        return format!(
            "What happened: The config file is not valid TOML for this agent ({msg}).\nLikely causes: A typo in a key or a value of the wrong type; machine_id is required.\nHow to fix: Fix the reported line and run `weigh check-config`."
        );
    }
    if lower.starts_with("unhealthy") {
        return format!(
            "What happened: The agent is {msg}.\nLikely causes: The scale is unplugged or silent, or `weigh run` is not running.\nHow to fix: Check the agent logs and the serial cable; see serial.stale_data_s and [health]."
        );
    }
    if lower.contains("must") {
        return format!(
            "What happened: Configuration is invalid ({msg}).\nHow to fix: Edit the TOML config and run `weigh check-config`."
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes: 2 for configuration problems, 1 otherwise.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    let config = matches!(err.downcast_ref::<BuildError>(), Some(BuildError::InvalidConfig(_)))
        || matches!(err.downcast_ref::<AgentError>(), Some(AgentError::Config(_)));
    let msg = err.to_string();
    if config || msg.starts_with("parse config") || msg.contains("must") {
        2
    } else {
        1
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    serde_json::json!({
        "reason": if exit_code_for_error(err) == 2 { "Config" } else { "Error" },
        "message": humanize(err),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_errors_get_hints() {
        let e = eyre::Report::new(BuildError::InvalidConfig("filter windows must be >= 1".into()));
        assert!(humanize(&e).contains("filter windows"));
        assert_eq!(exit_code_for_error(&e), 2);
    }

    #[test]
    fn broker_errors_mention_mqtt_section() {
        let e = eyre::Report::new(AgentError::Broker("connection refused".into()));
        assert!(humanize(&e).contains("mqtt.host"));
        assert_eq!(exit_code_for_error(&e), 1);
    }

    #[test]
    fn unhealthy_agent_is_a_runtime_failure() {
        let e = eyre::eyre!("unhealthy: agent reports stale data");
        assert!(humanize(&e).contains("stale_data_s"));
        assert_eq!(exit_code_for_error(&e), 1);
    }

    #[test]
    fn json_errors_are_objects() {
        let e = eyre::eyre!("machine_id must not be empty");
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&e)).unwrap();
        assert_eq!(v["reason"], "Config");
    }
}
