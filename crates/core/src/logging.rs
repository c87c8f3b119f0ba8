use tracing_subscriber::EnvFilter;

use crate::config::{LoggingConfig, VALID_LOG_LEVELS};
use crate::error::ParleyError;

/// Build the filter for a logging config. `RUST_LOG` wins over the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive(&config.level)))
}

fn directive(level: &str) -> String {
    if VALID_LOG_LEVELS.contains(&level) {
        format!("parley={level},parley_core={level},parley_gateway={level},parley_sync={level},warn")
    } else {
        "info".to_string()
    }
}

/// Install the global fmt subscriber. Fails if one is already installed.
pub fn init(config: &LoggingConfig) -> Result<(), ParleyError> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(config.with_target)
        .try_init()
        .map_err(|e| ParleyError::LoggingSetup(e.to_string()))
}

/// Debug-level subscriber writing through the test harness. Safe to call repeatedly.
pub fn init_for_tests() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}
