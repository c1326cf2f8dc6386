use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{DEFAULT_TARGET_NAME, DEV_API_BASE_URL, PROD_API_BASE_URL};

/// Link state of a single window peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link
    Disconnected,
    /// Looking for the peripheral
    Scanning,
    /// Link being established
    Connecting,
    /// Link up and GATT discovered
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Phase of the window controller state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    /// Nothing in flight
    Idle,
    /// Direct connect to the persisted device
    Reconnecting,
    /// Scanning for the target advertisement
    Scanning,
    /// Connecting to a discovered device
    Connecting,
    /// Ready for writes
    Connected,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// User-visible status line of the open/close screen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerStatus {
    /// Nothing happened yet
    Ready,
    /// Trying the persisted device
    Reconnecting,
    /// Scanning for the named device
    Searching {
        /// Advertised name searched for
        target: String,
    },
    /// Collecting nearby windows for manual selection
    Discovering,
    /// Link established
    Connected {
        /// Advertised name, if known
        name: Option<String>,
    },
    /// Scan window elapsed without a match
    NotFound {
        /// Advertised name searched for
        target: String,
    },
    /// Connection attempt failed
    ConnectFailed,
    /// Scan reported an error
    ScanError,
    /// Required OS permissions are missing
    PermissionDenied,
    /// Link dropped or closed
    Disconnected,
}

impl fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::Reconnecting => write!(f, "Reconnecting to saved device..."),
            Self::Searching { target } => write!(f, "Scanning for '{target}'..."),
            Self::Discovering => write!(f, "Searching for nearby windows..."),
            Self::Connected { name } => write!(
                f,
                "Connected to '{}'",
                name.as_deref().unwrap_or("unknown device")
            ),
            Self::NotFound { target } => {
                write!(f, "'{target}' not found. Try searching manually.")
            }
            Self::ConnectFailed => write!(f, "Connection failed"),
            Self::ScanError => write!(f, "Error while scanning"),
            Self::PermissionDenied => write!(f, "Bluetooth permissions are required to scan"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Authentication phase of the session manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No access token
    LoggedOut,
    /// Access token present
    LoggedIn,
    /// Access token being renewed
    Reissuing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => write!(f, "Logged out"),
            Self::LoggedIn => write!(f, "Logged in"),
            Self::Reissuing => write!(f, "Reissuing"),
        }
    }
}

/// Open state of the window pane, clamped to `[0, 100]`
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(from = "f64")]
pub struct OpenPercentage(f64);

impl OpenPercentage {
    /// Fully closed
    pub const CLOSED: Self = Self(0.0);
    /// Fully open
    pub const OPEN: Self = Self(100.0);

    /// Create a percentage, clamping into range. `NaN` is treated as closed.
    #[must_use]
    pub fn new(value: f64) -> Self {
        if value.is_nan() {
            return Self::CLOSED;
        }
        Self(value.clamp(0.0, 100.0))
    }

    /// Raw (possibly fractional) value
    #[must_use]
    pub const fn value(self) -> f64 {
        self.0
    }

    /// Nearest integer percentage, as sent to the peripheral
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn as_byte(self) -> u8 {
        // in range after clamping, so the cast cannot wrap
        self.0.round() as u8
    }
}

impl From<f64> for OpenPercentage {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

impl From<u8> for OpenPercentage {
    fn from(value: u8) -> Self {
        Self::new(f64::from(value))
    }
}

impl fmt::Display for OpenPercentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.as_byte())
    }
}

/// A discovered or connected window peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleWindowDevice {
    /// Platform-assigned identifier
    pub id: String,
    /// Advertised local name
    pub advertised_name: Option<String>,
    /// Current link state
    pub connection_state: ConnectionState,
}

impl BleWindowDevice {
    /// Create a device record in the disconnected state
    #[must_use]
    pub fn new(id: impl Into<String>, advertised_name: Option<String>) -> Self {
        Self {
            id: id.into(),
            advertised_name,
            connection_state: ConnectionState::Disconnected,
        }
    }
}

/// A single advertisement seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform-assigned identifier
    pub id: String,
    /// Advertised local name, if any
    pub name: Option<String>,
    /// Signal strength
    pub rssi: Option<i16>,
}

impl Advertisement {
    /// Whether this advertisement carries exactly the given name
    #[must_use]
    pub fn matches(&self, target_name: &str) -> bool {
        self.name.as_deref() == Some(target_name)
    }
}

/// BLE connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    /// Advertised name of the window peripheral
    pub target_name: String,
    /// Scan timeout in milliseconds
    pub scan_timeout_ms: u64,
    /// Connect + discovery timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Width of the sliding pane in gesture units (pixels on screen)
    pub pane_width: f64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            target_name: DEFAULT_TARGET_NAME.to_string(),
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 15_000,
            pane_width: 160.0,
        }
    }
}

/// Backend API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL all request paths are appended to
    pub base_url: String,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
}

impl ApiConfig {
    /// Configuration pointing at a local development backend
    #[must_use]
    pub fn development() -> Self {
        Self {
            base_url: DEV_API_BASE_URL.to_string(),
            ..Self::default()
        }
    }

    /// Join a request path onto the base URL
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: PROD_API_BASE_URL.to_string(),
            timeout_ms: 10_000,
        }
    }
}
