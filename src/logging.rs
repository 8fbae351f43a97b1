//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured level when set. Output goes to stderr
//! so command output on stdout stays machine readable.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggingConfig;

/// Installs the global subscriber. Calling it twice is harmless.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,geotag={}", config.level)));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    // A subscriber may already be installed by tests or an embedding host
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig {
            level: "debug".to_string(),
        };
        init(&config);
        init(&config);
        tracing::debug!("logging initialised twice without panicking");
    }
}
