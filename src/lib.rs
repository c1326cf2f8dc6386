#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # smartwindow
//!
//! Client core for motorized smart windows: open/close control over Bluetooth Low
//! Energy and an authenticated session against the smart-window backend.
//!
//! ## BLE control
//!
//! The window controller board advertises as `CLWM-B07` and exposes a single
//! write-only characteristic. Every command is a 6-byte frame carrying an absolute
//! open percentage:
//!
//! ```text
//! 2A 17 10 00 00 <percentage 0-100>
//! ```
//!
//! The board never answers, so writes are fire-and-forget. [`WindowController`]
//! reconnects to the last device it saw, falls back to a name scan, and turns drag or
//! slider gestures into exactly one write per release.
//!
//! ## Backend session
//!
//! [`ApiClient`] attaches the bearer token to every request. When the backend answers
//! 401 it renews the token once through the refresh token and replays the request.
//! Concurrent failures share a single renewal. Tokens persist in a [`KeyValueStore`]
//! so a restart can resume with [`ApiClient::validate_on_startup`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use smartwindow::{
//!     BtleplugTransport, ConnectionParams, FileStore, LiveDeviceState, StaticPermissions,
//!     WindowController,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let controller = WindowController::new(
//!         Arc::new(BtleplugTransport::new().await?),
//!         Arc::new(StaticPermissions::granted()),
//!         Arc::new(FileStore::open_default().await?),
//!         Arc::new(LiveDeviceState::new()),
//!         ConnectionParams::default(),
//!     );
//!
//!     // Reconnect to the saved window or scan for CLWM-B07
//!     controller.on_focus().await?;
//!
//!     // Open halfway
//!     controller.slider_commit(50.0).await;
//!
//!     controller.disconnect().await?;
//!     Ok(())
//! }
//! ```

/// Backend REST client and typed endpoints
pub mod api;
/// Bluetooth Low Energy transport
pub mod ble;
/// Window connection state machine and gesture handling
pub mod controller;
/// Error types and handling
pub mod error;
/// Drag and slider reconciliation
pub mod gesture;
/// Shared live device state
pub mod live;
/// OS permission requests
pub mod permission;
/// Open/close command frames
pub mod protocol;
/// Auth token lifecycle
pub mod session;
/// Persistent key-value storage
pub mod store;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use api::{
    ApiClient, DeviceDetail, DeviceMode, DeviceModeStatus, DeviceStatus, HttpTransport,
    ReqwestTransport, StartupRoute, UserInfo,
};
pub use ble::{BleTransport, BtleplugTransport};
pub use controller::{WindowController, WriteOutcome};
pub use error::{Result, SmartWindowError};
pub use live::{DeviceStateSink, LiveDeviceState};
pub use permission::{Permission, PermissionProvider, StaticPermissions};
pub use protocol::OpenCommand;
pub use session::{AuthSession, SessionManager};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use types::{
    ApiConfig, BleWindowDevice, ConnectionParams, ConnectionState, ControllerState,
    ControllerStatus, OpenPercentage, SessionState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// GATT service exposed by the window controller board
pub const WINDOW_SERVICE_UUID: &str = "2b8d0001-6828-46af-98aa-557761b15400";

/// Write-without-response characteristic receiving open/close frames
pub const WINDOW_WRITE_CHAR_UUID: &str = "2b8d0002-6828-46af-98aa-557761b15400";

/// Advertised local name of the window controller board
pub const DEFAULT_TARGET_NAME: &str = "CLWM-B07";

/// Production backend
pub const PROD_API_BASE_URL: &str = "https://k13c101.p.ssafy.io/api/v1";

/// Local development backend
pub const DEV_API_BASE_URL: &str = "http://localhost:8080/api/v1";
