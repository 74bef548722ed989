//! Tracing subscriber setup.

use objbus_types::config::BusConfig;
use tracing_subscriber::EnvFilter;

/// The filter to use: `RUST_LOG` when set, else the configured level.
pub fn env_filter(config: &BusConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}

/// Install a stderr `fmt` subscriber. Does nothing if a global subscriber
/// is already set.
pub fn init_tracing(config: &BusConfig) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        let config = BusConfig {
            log_level: "objbus_core=debug".into(),
            ..Default::default()
        };
        assert!(!env_filter(&config).to_string().is_empty());
        init_tracing(&config);
        init_tracing(&config);
        tracing::debug!("subscriber installed");
    }
}
