//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Setup tracing subscriber for the detector
///
/// `RUST_LOG` takes precedence over `default_level`. Thread names are
/// included in every line since events hop between the source, dispatch,
/// and query threads.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_rejected() {
        // An explicit RUST_LOG would win over the bad default
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let result = setup_logging("detection=notalevel");
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }
}
