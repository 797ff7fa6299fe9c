pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    /// Full `EnvFilter` directive; replaces the level-derived default.
    pub const FILTER_ENV: &str = "MAPMO_LOG_FILTER";

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
        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let filter = match std::env::var(FILTER_ENV) {
            Ok(directive) => directive,
            Err(_) => default_filter_for(config.level.to_filter()),
        };

        // The chat screen owns stdout, so logs never go there.
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

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;
        let _ = GUARD.set(guard);
        Ok(())
    }

    /// Transport crates stay at info even when the client traces.
    const QUIET_DEPENDENCIES: &[&str] = &["hyper", "reqwest", "rustls", "tokio_tungstenite", "tungstenite"];

    pub(crate) fn default_filter_for(level: LevelFilter) -> String {
        match level {
            LevelFilter::TRACE | LevelFilter::DEBUG => {
                let level = level.to_string().to_lowercase();
                let mut filter = format!("info,mapmo={level},mapmo_client={level},mapmo_proto={level}");
                for target in QUIET_DEPENDENCIES {
                    filter.push_str(&format!(",{target}=info"));
                }
                filter
            }
            other => other.to_string().to_lowercase(),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn verbose_levels_scope_to_the_client() {
            let filter = default_filter_for(LevelFilter::TRACE);
            assert!(filter.starts_with("info,mapmo=trace,mapmo_client=trace"));
            assert!(filter.ends_with(",tungstenite=info"));
            assert!(default_filter_for(LevelFilter::DEBUG).contains("mapmo_proto=debug"));
        }

        #[test]
        fn quieter_levels_pass_through() {
            assert_eq!(default_filter_for(LevelFilter::WARN), "warn");
            assert_eq!(default_filter_for(LevelFilter::ERROR), "error");
            assert_eq!(default_filter_for(LevelFilter::OFF), "off");
            assert!(LogLevel::Trace > LogLevel::Info);
        }
    }
}
