//! Errors raised while persisting the session configuration.

/// Errors from loading, saving or parsing `config.ron`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read config: {0}")]
    ReadError(#[source] std::io::Error),

    /// The config directory or file could not be written.
    #[error("failed to write config: {0}")]
    WriteError(#[source] std::io::Error),

    /// The file is not valid RON for the network, reliability and debug
    /// sections (e.g. a negative window or an unknown type for a timeout).
    #[error("failed to parse config: {0}")]
    ParseError(#[source] ron::error::SpannedError),

    /// The in-memory config could not be turned back into RON.
    #[error("failed to serialize config: {0}")]
    SerializeError(#[source] ron::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_names_cause() {
        let err = ron::from_str::<crate::Config>("(reliability: (initial_window: \"many\"))")
            .map_err(ConfigError::ParseError)
            .unwrap_err();
        assert!(err.to_string().starts_with("failed to parse config:"));
    }
}
