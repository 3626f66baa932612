//! Logging bootstrap for STTP services and tools
//!
//! Console output plus an optional daily log file, both driven by a single
//! `RUST_LOG`-compatible filter. Aged log files are gzipped in a background
//! task so long-running publishers do not fill the disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Log level rendered with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter producing `timestamp [LEVEL] message`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

// Keeps the non-blocking writer alive for the process lifetime
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name used in log file names (e.g., "pulse", "publisher")
    pub service_name: String,
    /// Directory for log files; `None` disables file logging
    pub log_dir: Option<PathBuf>,
    /// Default filter when `RUST_LOG` is unset (e.g., "info")
    pub default_filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "sttp".to_string(),
            log_dir: None,
            default_filter: "info".to_string(),
        }
    }
}

/// Initialize the tracing subscriber with console and optional file output.
///
/// `RUST_LOG` overrides `default_filter` when set. Safe to call once per
/// process; subsequent calls return an error from the subscriber registry.
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter.clone()));

    let console_layer = fmt::layer()
        .with_ansi(true)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(
                dir,
                format!("{}.log", config.service_name),
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
            match guards.lock() {
                Ok(mut guards) => guards.push(guard),
                Err(poisoned) => poisoned.into_inner().push(guard),
            }

            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(dir) = config.log_dir {
        tracing::info!("Logging: {} @ {:?}", config.service_name, dir);
        start_log_compression_task(dir, config.service_name);
    }

    Ok(())
}

/// Initialize with a bare filter string and console-only output
pub fn init(filter: &str) -> Result<(), Box<dyn std::error::Error>> {
    init_with_config(LogConfig {
        default_filter: filter.to_string(),
        ..Default::default()
    })
}

// ==================== Log Compression Support ====================

use tokio::time::{interval, Duration};

/// Start the background task that gzips logs older than 7 days and deletes
/// compressed logs older than 365 days.
pub fn start_log_compression_task(log_dir: PathBuf, service_name: String) {
    tokio::spawn(async move {
        // Let the service finish starting before the first sweep
        tokio::time::sleep(Duration::from_secs(60)).await;

        let mut interval = interval(Duration::from_secs(86400));
        loop {
            interval.tick().await;
            if let Err(e) = compress_old_logs(&log_dir, &service_name).await {
                tracing::error!("Log compression error for {}: {}", service_name, e);
            }
        }
    });
}

async fn compress_old_logs(
    log_dir: &Path,
    service_name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    use std::time::{Duration, SystemTime};

    let mut entries = tokio::fs::read_dir(log_dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let file_name = match path.file_name() {
            Some(name) => name.to_string_lossy().to_string(),
            None => continue,
        };

        if !file_name.contains(service_name) {
            continue;
        }
        if !file_name.contains(".log") {
            continue;
        }

        let metadata = tokio::fs::metadata(&path).await?;
        let modified = metadata.modified()?;
        let age = SystemTime::now().duration_since(modified)?;

        if !file_name.ends_with(".gz") {
            if age > Duration::from_secs(7 * 86400) {
                compress_file(&path).await?;
                tokio::fs::remove_file(&path).await?;
                tracing::debug!("Compressed: {}", file_name);
            }
        } else if age > Duration::from_secs(365 * 86400) {
            tokio::fs::remove_file(&path).await?;
            tracing::debug!("Deleted: {}", file_name);
        }
    }

    Ok(())
}

async fn compress_file(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    use std::io::Write;
    use tokio::io::AsyncReadExt;

    let mut input = tokio::fs::File::open(path).await?;
    let mut buffer = Vec::new();
    input.read_to_end(&mut buffer).await?;

    let output_path = format!("{}.gz", path.display());
    let output = std::fs::File::create(&output_path)?;
    let mut encoder = GzEncoder::new(output, Compression::best());
    encoder.write_all(&buffer)?;
    encoder.finish()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn compresses_and_removes_aged_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("20200101_demo.log");
        std::fs::write(&path, b"old log line\n").expect("write");

        // Backdate the file well past the 7-day threshold
        let old = std::time::SystemTime::now() - std::time::Duration::from_secs(30 * 86400);
        let file = std::fs::File::options().append(true).open(&path).expect("open");
        file.set_modified(old).expect("set mtime");
        drop(file);

        compress_old_logs(dir.path(), "demo").await.expect("sweep");

        assert!(!path.exists());
        assert!(dir.path().join("20200101_demo.log.gz").exists());
    }
}
