use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::metadata::LevelFilter;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{ENV_LOG, FileLoggingConfig, LogFormat, LogRotation, LoggingConfig};

const LOG_FILE_PREFIX: &str = "entity-replication.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub verbosity: u8,
    pub logging: LoggingConfig,
}

impl TelemetryConfig {
    pub fn new(verbosity: u8, logging: LoggingConfig) -> Self {
        Self { verbosity, logging }
    }
}

/// Flushes the file writer on drop; hold it for the life of the process.
pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

/// Installs the global subscriber. A second call in the same process keeps
/// the first subscriber.
pub fn init(config: TelemetryConfig) -> TelemetryGuard {
    let filter = build_filter(config.verbosity, config.logging.filter.as_deref());

    let mut guards = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();
    if config.logging.stdout {
        layers.push(build_stdout_layer(config.logging.stdout_format));
    }

    let mut pruned = None;
    let mut file_setup_error = None;
    if config.logging.file.enabled {
        let file = &config.logging.file;
        match fs::create_dir_all(&file.dir) {
            Ok(()) => {
                if let Some(max_files) = file.retention_max_files {
                    match prune_logs(&file.dir, LOG_FILE_PREFIX, max_files) {
                        Ok(removed) => pruned = Some(removed),
                        Err(err) => file_setup_error = Some(format!("log retention failed: {err}")),
                    }
                }
                let (layer, guard) = build_file_layer(file);
                layers.push(layer);
                guards.push(guard);
            }
            Err(err) => {
                file_setup_error = Some(format!(
                    "log dir init failed for {}: {err}",
                    file.dir.display()
                ));
            }
        }
    }
    layers.push(Box::new(filter));

    if Registry::default().with(layers).try_init().is_err() {
        tracing::debug!("global subscriber already installed");
    }
    if let Some(removed) = pruned
        && removed > 0
    {
        tracing::info!(removed, "log retention applied");
    }
    if let Some(error) = file_setup_error {
        tracing::warn!("{error}");
    }

    TelemetryGuard { _guards: guards }
}

/// Explicit directives win; otherwise `ENTITY_REPL_LOG`, then verbosity.
fn build_filter(verbosity: u8, directives: Option<&str>) -> EnvFilter {
    let builder = EnvFilter::builder().with_default_directive(level_from_verbosity(verbosity).into());
    match directives {
        Some(directives) => builder.parse_lossy(directives),
        None => builder.with_env_var(ENV_LOG).from_env_lossy(),
    }
}

fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn build_stdout_layer(format: LogFormat) -> BoxedLayer {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true);
    match format {
        LogFormat::Pretty => Box::new(layer.pretty()),
        LogFormat::Compact => Box::new(layer.compact()),
        LogFormat::Json => Box::new(layer.json().with_current_span(true)),
    }
}

fn build_file_layer(
    config: &FileLoggingConfig,
) -> (BoxedLayer, tracing_appender::non_blocking::WorkerGuard) {
    let rotation = match config.rotation {
        LogRotation::Daily => tracing_appender::rolling::Rotation::DAILY,
        LogRotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
        LogRotation::Never => tracing_appender::rolling::Rotation::NEVER,
    };
    let appender =
        tracing_appender::rolling::RollingFileAppender::new(rotation, &config.dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true);
    let layer: BoxedLayer = match config.format {
        LogFormat::Pretty => Box::new(layer.pretty()),
        LogFormat::Compact => Box::new(layer.compact()),
        LogFormat::Json => Box::new(layer.json().with_current_span(true)),
    };
    (layer, guard)
}

/// Removes the oldest rotated files beyond `max_files`. Returns how many.
fn prune_logs(dir: &Path, prefix: &str, max_files: usize) -> std::io::Result<usize> {
    let mut entries: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        entries.push((meta.modified().unwrap_or(SystemTime::UNIX_EPOCH), path));
    }
    Ok(oldest_beyond(entries, max_files)
        .into_iter()
        .filter(|path| fs::remove_file(path).is_ok())
        .count())
}

fn oldest_beyond(mut entries: Vec<(SystemTime, PathBuf)>, max_files: usize) -> Vec<PathBuf> {
    if entries.len() <= max_files {
        return Vec::new();
    }
    entries.sort_by_key(|(modified, _)| *modified);
    let excess = entries.len() - max_files;
    entries.into_iter().take(excess).map(|(_, path)| path).collect()
}
