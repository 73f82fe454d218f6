use thiserror::Error;

/// Errors that can occur while bridging speed samples to the ANT+ broadcast
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Radio transport failure (device busy, channel refused, send failed)
    #[error("Radio transport error: {0}")]
    Radio(String),

    /// Channel configuration was rejected by the transport
    #[error("Invalid channel configuration: {0}")]
    ChannelConfig(String),

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Request body was not valid JSON
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// Request body was valid JSON but lacked a required field
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// Invalid parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Check if this error was caused by a bad client request
    ///
    /// These are answered with a 4xx response and never mutate shared state.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidJson(_) | Self::MissingField(_) | Self::Json(_)
        )
    }

    /// Check if this error came from the radio transport
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Radio(_) | Self::ChannelConfig(_) | Self::Timeout { .. }
        )
    }

    /// Check if this error is recoverable
    ///
    /// Nothing in the bridge is process-fatal; transport errors are retried on
    /// the next `START` command, client errors only affect one request.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        self.is_client_error() || self.is_transport_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let radio_error = BridgeError::Radio("usb busy".to_string());
        assert!(radio_error.is_transport_error());
        assert!(!radio_error.is_client_error());
        assert!(radio_error.is_recoverable());

        let json_error = BridgeError::InvalidJson("eof".to_string());
        assert!(json_error.is_client_error());
        assert!(!json_error.is_transport_error());

        let missing = BridgeError::MissingField("speed");
        assert!(missing.is_client_error());

        let io_error = BridgeError::Io(std::io::Error::other("closed"));
        assert!(!io_error.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = BridgeError::Timeout { timeout_ms: 2000 };
        let error_string = format!("{error}");
        assert!(error_string.contains("timed out"));
        assert!(error_string.contains("2000"));

        let error = BridgeError::MissingField("speed");
        assert_eq!(format!("{error}"), "Missing field: speed");
    }
}
