//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise `netdeploy=info`, or `netdeploy=debug`
//! with `--verbose`. Console output goes to stderr. With a log directory,
//! a second JSON layer writes daily-rotated files through a non-blocking
//! writer whose guard must be held until exit.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogFormat;

pub const LOG_FILE_PREFIX: &str = "netdeploy.log";

/// Filter from an explicit directive string (normally `RUST_LOG`), falling
/// back to the crate default when it is absent or invalid.
pub fn build_filter(verbose: bool, directives: Option<&str>) -> EnvFilter {
    if let Some(directives) = directives
        && let Ok(filter) = EnvFilter::try_new(directives)
    {
        return filter;
    }
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::new(format!("netdeploy={level},tower_http=info"))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(
    format: LogFormat,
    verbose: bool,
    dir: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = build_filter(verbose, rust_log.as_deref());

    let console = match format {
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        LogFormat::Pretty => fmt::layer().with_writer(std::io::stderr).boxed(),
    };

    let (file, guard) = match dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_targets_crate() {
        let filter = build_filter(false, None).to_string();
        assert!(filter.contains("netdeploy=info"));
        assert!(filter.contains("tower_http=info"));
        assert!(build_filter(true, None).to_string().contains("netdeploy=debug"));
    }

    #[test]
    fn test_explicit_directives_win() {
        assert_eq!(build_filter(true, Some("warn")).to_string(), "warn");
    }

    #[test]
    fn test_invalid_directives_fall_back() {
        let filter = build_filter(false, Some("netdeploy=notalevel"));
        assert!(filter.to_string().contains("netdeploy=info"));
    }
}
