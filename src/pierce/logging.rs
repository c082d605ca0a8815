use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::pierce::config::LoggingConfig;

/// Keeps the non-blocking log writer alive; dropping it flushes and stops
/// the background worker.
#[derive(Debug)]
pub struct LogGuard {
    _guard: WorkerGuard,
}

/// Install the global subscriber. `RUST_LOG` overrides the configured
/// level when set.
pub fn init(logging: &LoggingConfig) -> anyhow::Result<LogGuard> {
    let level = match logging.level.trim().to_ascii_lowercase().as_str() {
        l @ ("trace" | "debug" | "info" | "warn" | "error") => l.to_string(),
        _ => "info".to_string(),
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&level))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(logging.output.trim())?;

    let json = logging.format.trim().eq_ignore_ascii_case("json");
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(!json)
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);
    let fmt = if json { fmt.json().boxed() } else { fmt.boxed() };

    tracing_subscriber::registry().with(filter).with(fmt).init();

    Ok(LogGuard { _guard: guard })
}

fn make_writer(output: &str) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    match output {
        "" | "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        path => {
            let path = Path::new(path);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("logging: open {}", path.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}
