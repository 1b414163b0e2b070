use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Targets that log one line per device record.
const RECORD_TARGETS: [&str; 2] = ["hidmux_frame::reader", "hidmux_frame::writer"];

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Per-target filter. Record-level tracing stays off unless `wire` is set,
/// since it logs every 65-byte record including idle keepalives.
pub fn log_filter(level: LogLevel, wire: bool) -> Targets {
    let level = level.as_filter();
    let records = if wire {
        LevelFilter::TRACE
    } else {
        level.min(LevelFilter::DEBUG)
    };
    RECORD_TARGETS
        .iter()
        .fold(Targets::new().with_default(level), |targets, target| {
            targets.with_target(*target, records)
        })
}

/// Install the stderr subscriber. Thread names are included because every
/// link, transport and process reader runs on its own named thread.
pub fn init_logging(format: LogFormat, level: LogLevel, wire: bool) {
    let filter = log_filter(level, wire);
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(wire)
        .with_thread_names(true);

    match format {
        LogFormat::Text => {
            let _ = tracing_subscriber::registry()
                .with(layer)
                .with(filter)
                .try_init();
        }
        LogFormat::Json => {
            let _ = tracing_subscriber::registry()
                .with(layer.json())
                .with(filter)
                .try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing::Level;

    use super::*;

    #[test]
    fn record_tracing_needs_wire_flag() {
        let quiet = log_filter(LogLevel::Trace, false);
        assert!(quiet.would_enable("hidmux_peer::engine", &Level::TRACE));
        assert!(!quiet.would_enable("hidmux_frame::reader", &Level::TRACE));
        assert!(quiet.would_enable("hidmux_frame::writer", &Level::DEBUG));

        let wire = log_filter(LogLevel::Info, true);
        assert!(wire.would_enable("hidmux_frame::reader", &Level::TRACE));
        assert!(!wire.would_enable("hidmux_peer::engine", &Level::DEBUG));
    }

    #[test]
    fn record_targets_follow_a_quieter_level() {
        let filter = log_filter(LogLevel::Warn, false);
        assert!(!filter.would_enable("hidmux_frame::writer", &Level::INFO));
        assert!(filter.would_enable("hidmux_frame::link", &Level::WARN));
    }
}
