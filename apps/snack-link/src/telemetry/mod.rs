//! Tracing setup for the `snack-link` binary and the per-channel span the
//! library's workers run in.

use tracing::Span;

/// Span entered by every task that works on one channel (transport driver,
/// session worker), so their records carry the channel and the local device.
pub fn channel_span(channel: &str, device: &str) -> Span {
    tracing::info_span!(target: "snack::channel", "channel", channel = %channel, device = %device)
}

pub mod logging {
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    /// Overrides the level-derived directives entirely.
    pub const FILTER_ENV: &str = "SNACK_LOG_FILTER";

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        /// `snack::*` targets follow the level; everything else (hyper,
        /// rustls, tungstenite) stays at warn until `trace`.
        pub fn directives(self) -> String {
            match self {
                LogLevel::Error => "error".into(),
                LogLevel::Warn => "warn".into(),
                LogLevel::Info => "warn,snack=info".into(),
                LogLevel::Debug => "warn,snack=debug".into(),
                LogLevel::Trace => "info,snack=trace".into(),
            }
        }
    }

    /// How often `--log-file` output starts a new file.
    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
    pub enum LogRotation {
        #[default]
        Never,
        Hourly,
        Daily,
    }

    impl From<LogRotation> for Rotation {
        fn from(rotation: LogRotation) -> Self {
            match rotation {
                LogRotation::Never => Rotation::NEVER,
                LogRotation::Hourly => Rotation::HOURLY,
                LogRotation::Daily => Rotation::DAILY,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
        pub rotation: LogRotation,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("log file path {0:?} has no file name")]
        NoFileName(PathBuf),
        #[error("failed to create log directory {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to open log file: {0}")]
        Appender(String),
        #[error("invalid {FILTER_ENV}: {0}")]
        Filter(String),
        #[error("failed to install subscriber: {0}")]
        Install(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }
        let filter = build_filter(config.level, std::env::var(FILTER_ENV).ok().as_deref())?;

        let (writer, guard) = match &config.file {
            Some(path) => {
                let (dir, file_name) = split_log_path(path)?;
                std::fs::create_dir_all(&dir).map_err(|source| InitError::Io {
                    path: dir.clone(),
                    source,
                })?;
                let appender = RollingFileAppender::builder()
                    .rotation(config.rotation.into())
                    .filename_prefix(file_name)
                    .build(&dir)
                    .map_err(|err| InitError::Appender(err.to_string()))?;
                tracing_appender::non_blocking(appender)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let layer = fmt::layer()
            .with_writer(writer)
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.file.is_none());
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
            .map_err(|err| InitError::Install(err.to_string()))?;

        let _ = GUARD.set(guard);
        Ok(())
    }

    fn build_filter(level: LogLevel, env_override: Option<&str>) -> Result<EnvFilter, InitError> {
        match env_override {
            Some(directives) if !directives.trim().is_empty() => {
                EnvFilter::try_new(directives).map_err(|err| InitError::Filter(err.to_string()))
            }
            _ => EnvFilter::try_new(level.directives())
                .map_err(|err| InitError::Filter(err.to_string())),
        }
    }

    /// `logs/snack.log` becomes (`logs`, `snack.log`); a bare name logs into
    /// the working directory.
    fn split_log_path(path: &Path) -> Result<(PathBuf, String), InitError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| InitError::NoFileName(path.to_path_buf()))?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok((dir, file_name.to_string()))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn only_crate_targets_get_chatty_below_trace() {
            assert_eq!(LogLevel::Warn.directives(), "warn");
            assert_eq!(LogLevel::Debug.directives(), "warn,snack=debug");
            assert!(LogLevel::Trace.directives().starts_with("info,"));
        }

        #[test]
        fn env_override_wins_unless_blank() {
            let filter = build_filter(LogLevel::Warn, Some("snack::relay=trace")).expect("filter");
            assert!(filter.to_string().contains("snack::relay=trace"));

            let filter = build_filter(LogLevel::Debug, Some("  ")).expect("filter");
            assert!(filter.to_string().contains("snack=debug"));
        }

        #[test]
        fn malformed_override_is_reported() {
            let err = build_filter(LogLevel::Warn, Some("snack=loud")).expect_err("bad level");
            assert!(matches!(err, InitError::Filter(_)));
        }

        #[test]
        fn log_paths_split_into_directory_and_prefix() {
            let (dir, name) = split_log_path(Path::new("logs/snack.log")).expect("split");
            assert_eq!(dir, PathBuf::from("logs"));
            assert_eq!(name, "snack.log");

            let (dir, name) = split_log_path(Path::new("snack.log")).expect("split");
            assert_eq!(dir, PathBuf::from("."));
            assert_eq!(name, "snack.log");

            assert!(matches!(
                split_log_path(Path::new("/")),
                Err(InitError::NoFileName(_))
            ));
        }

        #[test]
        fn rotation_maps_onto_appender_rotation() {
            assert_eq!(Rotation::from(LogRotation::Daily), Rotation::DAILY);
            assert_eq!(Rotation::from(LogRotation::Never), Rotation::NEVER);
        }
    }
}
