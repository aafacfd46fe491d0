use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
    Critical,
}

impl LogLevel {
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Fatal | LogLevel::Critical => "error",
        }
    }
}

/// `RUST_LOG` wins over `level`; the MQTT client stays quiet unless it warns.
pub fn init_tracing(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{},rumqttc=warn", level.directive())))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_style_levels_map_to_tracing_directives() {
        assert_eq!(LogLevel::Warning.directive(), "warn");
        assert_eq!(LogLevel::Critical.directive(), "error");
        assert_eq!(LogLevel::Debug.directive(), "debug");
    }
}
