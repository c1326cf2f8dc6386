use thiserror::Error;

/// Errors that can occur when controlling a smart window or talking to its backend
#[derive(Error, Debug)]
pub enum SmartWindowError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// One or more required OS permissions were refused
    #[error("Bluetooth permission denied: {}", missing.join(", "))]
    PermissionDenied {
        /// Capabilities the user refused
        missing: Vec<String>,
    },

    /// No advertisement matched the target name before the scan timed out
    #[error("Device '{target}' not found within {timeout_ms}ms")]
    ScanTimeout {
        /// Advertised name that was searched for
        target: String,
        /// Scan window in milliseconds
        timeout_ms: u64,
    },

    /// Another scan is already running
    #[error("A scan is already in progress")]
    ScanInProgress,

    /// The scan was stopped before a match was found
    #[error("Scan cancelled")]
    ScanCancelled,

    /// The connect attempt was superseded by a blur or disconnect
    #[error("Connection attempt cancelled")]
    ConnectCancelled,

    /// A peripheral link already exists
    #[error("Already connected to {device_id}")]
    AlreadyConnected {
        /// Identifier of the connected peripheral
        device_id: String,
    },

    /// Connecting or service discovery failed
    #[error("Failed to connect to device: {0}")]
    ConnectFailed(String),

    /// The OS reported the link as lost
    #[error("Connection lost")]
    ConnectionLost,

    /// An operation needed a connected peripheral
    #[error("No window device connected")]
    NotConnected,

    /// Write-without-response was rejected by the local BLE stack
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The backend rejected the access token and it could not be renewed
    #[error("Unauthorized")]
    Unauthorized,

    /// The refresh token was rejected; the local session has been cleared
    #[error("Session expired - login required")]
    SessionExpired,

    /// An authenticated operation was attempted without a session
    #[error("Not logged in")]
    NotLoggedIn,

    /// The backend answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Server-provided message, or a generic one
        message: String,
    },

    /// Transport-level network failure
    #[error("Network error: {0}")]
    Network(String),

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persistent store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for smart window operations
pub type Result<T> = std::result::Result<T, SmartWindowError>;

impl From<reqwest::Error> for SmartWindowError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout { timeout_ms: 0 };
        }
        match err.status() {
            Some(status) => Self::Http {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => Self::Network(err.to_string()),
        }
    }
}

impl SmartWindowError {
    /// Check if this error indicates a BLE connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectFailed(_)
                | Self::ConnectionLost
                | Self::NotConnected
                | Self::ScanTimeout { .. }
        )
    }

    /// Check if the user can simply try again
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ScanTimeout { .. }
                | Self::ScanCancelled
                | Self::ConnectCancelled
                | Self::ConnectFailed(_)
                | Self::ConnectionLost
                | Self::Timeout { .. }
                | Self::Network(_)
        )
    }

    /// Check if this error should route the user back to login
    #[must_use]
    pub const fn requires_login(&self) -> bool {
        matches!(
            self,
            Self::SessionExpired | Self::Unauthorized | Self::NotLoggedIn
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connect_error = SmartWindowError::ConnectFailed("test".to_string());
        assert!(connect_error.is_connection_error());
        assert!(connect_error.is_recoverable());
        assert!(!connect_error.requires_login());

        let denied = SmartWindowError::PermissionDenied {
            missing: vec!["bluetooth_scan".to_string()],
        };
        assert!(!denied.is_connection_error());
        assert!(!denied.is_recoverable());

        let cancelled = SmartWindowError::ConnectCancelled;
        assert!(cancelled.is_recoverable());
        assert!(!cancelled.is_connection_error());

        let expired = SmartWindowError::SessionExpired;
        assert!(!expired.is_recoverable());
        assert!(expired.requires_login());
    }

    #[test]
    fn test_error_display() {
        let error = SmartWindowError::ScanTimeout {
            target: "CLWM-B07".to_string(),
            timeout_ms: 10_000,
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("CLWM-B07"));
        assert!(error_string.contains("10000ms"));

        let denied = SmartWindowError::PermissionDenied {
            missing: vec!["bluetooth_scan".to_string(), "location".to_string()],
        };
        assert_eq!(
            denied.to_string(),
            "Bluetooth permission denied: bluetooth_scan, location"
        );
    }
}
