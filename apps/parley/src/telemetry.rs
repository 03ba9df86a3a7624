//! Process-wide logging setup for the `parley` binary.

pub mod logging {
    use std::fmt;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    /// Overrides the computed filter entirely.
    pub const FILTER_ENV: &str = "PARLEY_LOG_FILTER";
    /// Lets chatty dependencies log at trace level too.
    pub const TRACE_DEPS_ENV: &str = "PARLEY_TRACE_DEPS";

    /// Targets raised to the requested level at debug and trace.
    const OWN_TARGETS: &[&str] = &["parley_client_core", "parley"];

    // webrtc-rs and tungstenite are unreadable at trace level.
    const NOISY_TARGETS: &[&str] = &[
        "tokio_tungstenite",
        "tungstenite",
        "webrtc",
        "webrtc_ice",
        "webrtc_sctp",
        "webrtc_dtls",
        "webrtc_mdns",
        "mio",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl From<LogLevel> for LevelFilter {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    impl fmt::Display for LogLevel {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let name = match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            };
            f.write_str(name)
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Log to this file instead of stderr.
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to install subscriber: {0}")]
        Install(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Calls after the first are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let directives = match std::env::var(FILTER_ENV) {
            Ok(custom) => custom,
            Err(_) => default_directives(config.level, env_flag(TRACE_DEPS_ENV)),
        };

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let verbose = config.level >= LogLevel::Debug;
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(&directives))
            .with_target(verbose)
            .with_thread_ids(config.level == LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .try_init()
            .map_err(|err| InitError::Install(err.to_string()))?;

        let _ = GUARD.set(guard);
        tracing::debug!(filter = %directives, "logging initialized");
        Ok(())
    }

    fn env_flag(var: &str) -> bool {
        std::env::var(var).is_ok_and(|value| !value.is_empty() && value != "0")
    }

    /// Dependencies stay at `info` below debug; our own crates follow the
    /// requested level. At trace, noisy dependencies are capped at `info`
    /// unless `trace_deps` is set.
    pub(crate) fn default_directives(level: LogLevel, trace_deps: bool) -> String {
        if !matches!(level, LogLevel::Debug | LogLevel::Trace) {
            return level.to_string();
        }
        let mut directives = vec!["info".to_string()];
        directives.extend(OWN_TARGETS.iter().map(|target| format!("{target}={level}")));
        if level == LogLevel::Trace && !trace_deps {
            directives.extend(NOISY_TARGETS.iter().map(|target| format!("{target}=info")));
        }
        directives.join(",")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn quiet_levels_apply_globally() {
            assert_eq!(default_directives(LogLevel::Warn, false), "warn");
            assert_eq!(default_directives(LogLevel::Info, true), "info");
        }

        #[test]
        fn debug_raises_own_crates_only() {
            assert_eq!(
                default_directives(LogLevel::Debug, false),
                "info,parley_client_core=debug,parley=debug"
            );
        }

        #[test]
        fn trace_caps_noisy_dependencies_unless_asked() {
            let capped = default_directives(LogLevel::Trace, false);
            assert!(capped.starts_with("info,parley_client_core=trace"));
            assert!(capped.contains("webrtc_ice=info"));

            let open = default_directives(LogLevel::Trace, true);
            assert!(!open.contains("webrtc_ice"));
        }

        #[test]
        fn cli_names_parse_back() {
            for level in LogLevel::value_variants() {
                let name = level.to_possible_value().unwrap();
                assert_eq!(LogLevel::from_str(name.get_name(), true).unwrap(), *level);
            }
        }
    }
}
