use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SmartWindowError;

/// OS capability needed before scanning for or connecting to the window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// Discover nearby peripherals
    BluetoothScan,
    /// Open GATT connections
    BluetoothConnect,
    /// Precise location, required for BLE scanning on some platforms
    FineLocation,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BluetoothScan => write!(f, "bluetooth_scan"),
            Self::BluetoothConnect => write!(f, "bluetooth_connect"),
            Self::FineLocation => write!(f, "fine_location"),
        }
    }
}

/// Every permission the open/close flow needs
pub const REQUIRED_PERMISSIONS: [Permission; 3] = [
    Permission::BluetoothScan,
    Permission::BluetoothConnect,
    Permission::FineLocation,
];

/// Outcome of a permission request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionStatus {
    /// Everything requested was granted
    Granted,
    /// The listed permissions were refused
    Denied(Vec<Permission>),
}

impl PermissionStatus {
    /// Convert into a result, failing with [`SmartWindowError::PermissionDenied`]
    ///
    /// # Errors
    ///
    /// Returns [`SmartWindowError::PermissionDenied`] when any permission was refused.
    pub fn into_result(self) -> crate::Result<()> {
        match self {
            Self::Granted => Ok(()),
            Self::Denied(missing) => Err(SmartWindowError::PermissionDenied {
                missing: missing.iter().map(ToString::to_string).collect(),
            }),
        }
    }
}

/// Platform hook that asks the user for OS permissions
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Request the given permissions, returning which (if any) were refused
    async fn request(&self, permissions: &[Permission]) -> PermissionStatus;
}

/// Fixed answer provider
///
/// Desktop stacks prompt on first use and need no explicit request, so
/// [`StaticPermissions::granted`] is the default there.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    denied: Vec<Permission>,
}

impl StaticPermissions {
    /// Grant everything
    #[must_use]
    pub const fn granted() -> Self {
        Self { denied: Vec::new() }
    }

    /// Refuse the given permissions
    #[must_use]
    pub const fn denying(denied: Vec<Permission>) -> Self {
        Self { denied }
    }
}

#[async_trait]
impl PermissionProvider for StaticPermissions {
    async fn request(&self, permissions: &[Permission]) -> PermissionStatus {
        let refused: Vec<Permission> = permissions
            .iter()
            .copied()
            .filter(|p| self.denied.contains(p))
            .collect();

        if refused.is_empty() {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied(refused)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_granted_provider() {
        let provider = StaticPermissions::granted();
        let status = provider.request(&REQUIRED_PERMISSIONS).await;
        assert_eq!(status, PermissionStatus::Granted);
        assert_ok!(status.into_result());
    }

    #[tokio::test]
    async fn test_denied_only_reports_requested() {
        let provider = StaticPermissions::denying(vec![Permission::FineLocation]);

        let status = provider.request(&[Permission::BluetoothScan]).await;
        assert_eq!(status, PermissionStatus::Granted);

        let status = provider.request(&REQUIRED_PERMISSIONS).await;
        assert_eq!(
            status,
            PermissionStatus::Denied(vec![Permission::FineLocation])
        );

        let err = assert_err!(status.into_result());
        assert!(err.to_string().contains("fine_location"));
    }
}
