//! tracing subscriber setup: console plus an optional rolling JSON file.
use crate::cli::FILE_GUARD;
use eyre::WrapErr;
use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};
use weigh_config::Logging;

pub fn rotation(name: Option<&str>) -> eyre::Result<Rotation> {
    match name.map(str::to_ascii_lowercase).as_deref() {
        None | Some("never") => Ok(Rotation::NEVER),
        Some("daily") => Ok(Rotation::DAILY),
        Some("hourly") => Ok(Rotation::HOURLY),
        Some(other) => eyre::bail!("logging.rotation must be never, daily or hourly (got {other})"),
    }
}

/// `RUST_LOG` wins; otherwise the CLI level, then `logging.level`, then `info`.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

pub fn init(cli_level: Option<&str>, json: bool, cfg: &Logging) -> eyre::Result<()> {
    let level = cli_level.or(cfg.level.as_deref()).unwrap_or("info");
    let json = json || cfg.json;

    let console = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let file = match cfg.file.as_deref() {
        Some(path) => {
            let path = Path::new(path);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| eyre::eyre!("logging.file has no file name: {}", path.display()))?;
            std::fs::create_dir_all(dir).wrap_err_with(|| format!("create log dir {}", dir.display()))?;
            let appender = RollingFileAppender::new(rotation(cfg.rotation.as_deref())?, dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(fmt::layer().json().with_ansi(false).with_writer(writer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| eyre::eyre!("init tracing: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_names() {
        assert_eq!(rotation(None).unwrap(), Rotation::NEVER);
        assert_eq!(rotation(Some("Daily")).unwrap(), Rotation::DAILY);
        assert_eq!(rotation(Some("hourly")).unwrap(), Rotation::HOURLY);
        assert!(rotation(Some("weekly")).is_err());
    }
}
