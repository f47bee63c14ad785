//! Logging setup.

use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "offline_dl=info";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Build the filter from `directive`, then `RUST_LOG`, then [`DEFAULT_LOG_FILTER`].
pub fn build_filter(directive: Option<&str>) -> Result<EnvFilter> {
    match directive {
        Some(directive) => EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("invalid log filter '{}': {}", directive, e))),
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(format: LogFormat, directive: Option<&str>) -> Result<()> {
    let filter = build_filter(directive)?;

    let fmt_layer = match format {
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to initialise logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_explicit_directive() {
        let filter = build_filter(Some("offline_dl=debug,process_utils=warn")).unwrap();
        assert!(filter.to_string().contains("offline_dl=debug"));
    }

    #[test]
    fn test_invalid_directive_is_configuration_error() {
        let err = build_filter(Some("offline_dl=loud")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
