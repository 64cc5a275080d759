//! Log sinks: stdout plus two daily-rotated files selected by target,
//! named `<stream>.log.<YYYY-MM-DD>`.
//! `activity` carries repository and command events, `connectivity`
//! carries probe results.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub const LOG_ENV: &str = "RPR_LOG";
pub const STREAMS: [&str; 2] = ["activity", "connectivity"];

pub struct LogGuard {
    _guards: Vec<WorkerGuard>,
}

pub struct LogOptions<'a> {
    /// Default stdout directive when `RPR_LOG` is unset.
    pub stdout_level: &'a str,
    /// Write the activity/connectivity files. Off for read-only commands.
    pub files: Option<&'a Path>,
    pub retention_days: usize,
}

pub(crate) fn stream_appender(dir: &Path, stream: &str, keep: usize) -> Result<RollingFileAppender, String> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(format!("{stream}.log"))
        .max_log_files(keep.max(1))
        .build(dir)
        .map_err(|e| format!("cannot open {} log in {}: {}", stream, dir.display(), e))
}

pub fn init(opts: LogOptions<'_>) -> LogGuard {
    let filter = EnvFilter::builder().parse_lossy(
            std::env::var(LOG_ENV)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| opts.stdout_level.to_string()),
        );

    let mut guards = Vec::new();
    let mut setup_errors = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![Box::new(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(filter),
    )];

    if let Some(dir) = opts.files {
        match std::fs::create_dir_all(dir) {
            Ok(()) => {
                for stream in STREAMS {
                    match stream_appender(dir, stream, opts.retention_days) {
                        Ok(appender) => {
                            let (writer, guard) = tracing_appender::non_blocking(appender);
                            guards.push(guard);
                            layers.push(Box::new(
                                tracing_subscriber::fmt::layer()
                                    .with_writer(writer)
                                    .with_ansi(false)
                                    .with_target(false)
                                    .with_filter(
                                        Targets::new().with_target(stream, LevelFilter::INFO),
                                    ),
                            ));
                        }
                        Err(e) => setup_errors.push(e),
                    }
                }
            }
            Err(e) => setup_errors.push(format!("log dir init failed for {}: {e}", dir.display())),
        }
    }

    Registry::default().with(layers).init();

    for error in setup_errors {
        tracing::warn!("{error}");
    }
    LogGuard { _guards: guards }
}
