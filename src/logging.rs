use anyhow::{bail, Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

#[derive(Debug, Clone)]
pub struct FileLog {
    pub dir: String,
    pub filename: String,
    /// daily, hourly or never
    pub rotate: String,
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub level: String,
    pub file: Option<FileLog>,
}

fn rotation(s: &str) -> Result<Rotation> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "daily" => Rotation::DAILY,
        "hourly" => Rotation::HOURLY,
        "never" => Rotation::NEVER,
        other => bail!("Unknown log rotation '{}' (expected daily, hourly or never)", other),
    })
}

/// Install the global subscriber. Stdout carries protocol frames, so console
/// output goes to stderr. Keep the returned guard alive to flush the file writer.
pub fn init(opts: &LogOptions) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => EnvFilter::try_new(&opts.level)
            .with_context(|| format!("Invalid log level '{}'", opts.level))?,
    };

    let (file_layer, guard) = match &opts.file {
        Some(file) => {
            let appender = RollingFileAppender::new(rotation(&file.rotate)?, &file.dir, &file.filename);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber).context("Failed to install tracing subscriber")?;
    LogTracer::init().context("Failed to bridge log records into tracing")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation() {
        assert!(rotation("Daily").is_ok());
        assert!(rotation("never").is_ok());
        assert!(rotation("weekly").is_err());
    }
}
