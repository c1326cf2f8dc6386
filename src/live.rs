use tokio::sync::watch;

use crate::types::OpenPercentage;

/// Receives committed window state so other views can show it without talking to
/// the peripheral
pub trait DeviceStateSink: Send + Sync {
    /// Publish the latest committed open percentage; `None` means no live value
    fn publish_open_percentage(&self, percentage: Option<OpenPercentage>);
}

/// Snapshot of the shared device state
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceSnapshot {
    /// Last committed open percentage, `None` until a device reports one
    pub open_percentage: Option<OpenPercentage>,
    /// Backend id of the window the user is looking at
    pub selected_device_id: Option<i64>,
}

/// Cross-screen device state backed by a watch channel
#[derive(Debug)]
pub struct LiveDeviceState {
    sender: watch::Sender<DeviceSnapshot>,
}

impl LiveDeviceState {
    /// Create an empty state
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(DeviceSnapshot::default());
        Self { sender }
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> DeviceSnapshot {
        *self.sender.borrow()
    }

    /// Last committed open percentage
    #[must_use]
    pub fn open_percentage(&self) -> Option<OpenPercentage> {
        self.sender.borrow().open_percentage
    }

    /// Select the backend device shown by status views
    pub fn set_selected_device(&self, device_id: Option<i64>) {
        self.sender
            .send_modify(|snapshot| snapshot.selected_device_id = device_id);
    }

    /// Watch for changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.sender.subscribe()
    }
}

impl Default for LiveDeviceState {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStateSink for LiveDeviceState {
    fn publish_open_percentage(&self, percentage: Option<OpenPercentage>) {
        self.sender
            .send_modify(|snapshot| snapshot.open_percentage = percentage);
    }
}
