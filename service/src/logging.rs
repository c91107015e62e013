use crate::config::Config;
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

/// Transport-layer crates that are only logged at Trace level.
const NOISY_CRATES: &[&str] = &["tower", "tower_http", "hyper", "h2", "axum", "tokio"];

/// Installs the terminal logger at the configured level.
pub fn init(config: &Config) {
    let level = config.log_level_filter;
    if let Err(e) = TermLogger::init(
        level,
        log_config(level),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ) {
        eprintln!("Logger was already initialized: {e}");
    }
}

fn log_config(level: LevelFilter) -> simplelog::Config {
    let mut builder = ConfigBuilder::new();
    builder.set_time_format_rfc3339();
    if level < LevelFilter::Trace {
        for name in NOISY_CRATES {
            builder.add_filter_ignore_str(name);
        }
    }
    builder.build()
}
