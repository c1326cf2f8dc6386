use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    ble::BleTransport,
    error::{Result, SmartWindowError},
    gesture::GestureTracker,
    live::DeviceStateSink,
    permission::{PermissionProvider, REQUIRED_PERMISSIONS},
    protocol::OpenCommand,
    store::{KeyValueStore, LAST_DEVICE_KEY},
    types::{
        Advertisement, BleWindowDevice, ConnectionParams, ConnectionState, ControllerState,
        ControllerStatus, OpenPercentage,
    },
};

/// What happened to a single percentage write
///
/// Writes are fire-and-forget; the outcome is reported for observability only and is
/// never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Handed to the BLE stack
    Sent,
    /// No device connected; nothing written
    NotConnected,
    /// The BLE stack rejected the write
    Failed,
}

#[derive(Debug)]
struct ControllerInner {
    state: ControllerState,
    status: ControllerStatus,
    device: Option<BleWindowDevice>,
    /// Bumped by blur and disconnect; attempts started under an older epoch are void
    epoch: u64,
}

/// Keeps a link to one smart-window peripheral and turns user input into open/close
/// commands
///
/// The controller drives the state machine
/// `Idle -> Reconnecting | Scanning -> Connecting -> Connected` from screen lifecycle
/// events ([`WindowController::on_focus`], [`WindowController::on_blur`]) and OS link
/// events. Every committed gesture is published to the [`DeviceStateSink`] and
/// written to the peripheral exactly once.
///
/// # Examples
///
/// ```no_run
/// use smartwindow::{
///     BtleplugTransport, ConnectionParams, LiveDeviceState, MemoryStore, StaticPermissions,
///     WindowController,
/// };
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let controller = Arc::new(WindowController::new(
///         Arc::new(BtleplugTransport::new().await?),
///         Arc::new(StaticPermissions::granted()),
///         Arc::new(MemoryStore::new()),
///         Arc::new(LiveDeviceState::new()),
///         ConnectionParams::default(),
///     ));
///
///     controller.spawn_connection_watch().await?;
///     controller.on_focus().await?;
///     controller.slider_commit(73.0).await;
///
///     controller.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct WindowController {
    transport: Arc<dyn BleTransport>,
    permissions: Arc<dyn PermissionProvider>,
    store: Arc<dyn KeyValueStore>,
    sink: Arc<dyn DeviceStateSink>,
    params: ConnectionParams,
    inner: RwLock<ControllerInner>,
    gesture: Mutex<GestureTracker>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl WindowController {
    /// Create an idle controller
    #[must_use]
    pub fn new(
        transport: Arc<dyn BleTransport>,
        permissions: Arc<dyn PermissionProvider>,
        store: Arc<dyn KeyValueStore>,
        sink: Arc<dyn DeviceStateSink>,
        params: ConnectionParams,
    ) -> Self {
        let gesture = GestureTracker::new(params.pane_width);

        Self {
            transport,
            permissions,
            store,
            sink,
            params,
            inner: RwLock::new(ControllerInner {
                state: ControllerState::Idle,
                status: ControllerStatus::Ready,
                device: None,
                epoch: 0,
            }),
            gesture: Mutex::new(gesture),
            watch_task: Mutex::new(None),
        }
    }

    /// Connection parameters in use
    #[must_use]
    pub const fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Current state machine phase
    pub async fn state(&self) -> ControllerState {
        self.inner.read().await.state
    }

    /// User-visible status line
    pub async fn status(&self) -> ControllerStatus {
        self.inner.read().await.status.clone()
    }

    /// The connected device, if any
    pub async fn connected_device(&self) -> Option<BleWindowDevice> {
        self.inner.read().await.device.clone()
    }

    /// Percentage currently shown by the gesture surface
    pub async fn percentage(&self) -> OpenPercentage {
        self.gesture.lock().await.visual()
    }

    async fn set_status(&self, status: ControllerStatus) {
        self.inner.write().await.status = status;
    }

    /// Return to `Idle` with `status` unless a blur or disconnect superseded `epoch`
    async fn settle(&self, epoch: u64, status: ControllerStatus) -> bool {
        let mut inner = self.inner.write().await;
        if inner.epoch != epoch {
            return false;
        }

        inner.state = ControllerState::Idle;
        inner.status = status;
        inner.device = None;
        true
    }

    /// Move from `Idle` into `next`, refusing while busy or connected. Returns the
    /// epoch the new attempt runs under.
    async fn begin(&self, next: ControllerState, status: ControllerStatus) -> Result<u64> {
        self.begin_at(None, next, status).await
    }

    /// Like [`Self::begin`], but also fails with `ScanCancelled` if `epoch` is stale
    async fn begin_at(
        &self,
        epoch: Option<u64>,
        next: ControllerState,
        status: ControllerStatus,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;

        if epoch.is_some_and(|epoch| epoch != inner.epoch) {
            return Err(SmartWindowError::ScanCancelled);
        }

        match inner.state {
            ControllerState::Idle => {}
            ControllerState::Connected => {
                let device_id = inner
                    .device
                    .as_ref()
                    .map(|d| d.id.clone())
                    .unwrap_or_default();
                return Err(SmartWindowError::AlreadyConnected { device_id });
            }
            _ => return Err(SmartWindowError::ScanInProgress),
        }

        debug!("Controller {} -> {}", inner.state, next);
        inner.state = next;
        inner.status = status;
        Ok(inner.epoch)
    }

    /// Ask for the scan, connect and location capabilities
    ///
    /// # Errors
    ///
    /// Returns [`SmartWindowError::PermissionDenied`] listing the refused permissions.
    pub async fn request_permissions(&self) -> Result<()> {
        let outcome = self
            .permissions
            .request(&REQUIRED_PERMISSIONS)
            .await
            .into_result();

        if let Err(e) = &outcome {
            warn!("{}", e);
            self.set_status(ControllerStatus::PermissionDenied).await;
        }
        outcome
    }

    /// Screen gained focus: reconnect to the saved device, or scan for the target
    ///
    /// Returns the connected device. A no-op when already connected.
    ///
    /// # Errors
    ///
    /// - [`SmartWindowError::PermissionDenied`] if permissions are refused.
    /// - [`SmartWindowError::ScanInProgress`] if a scan or connect is already running.
    /// - [`SmartWindowError::ConnectCancelled`] or [`SmartWindowError::ScanCancelled`]
    ///   if the screen lost focus meanwhile.
    /// - Any error from [`WindowController::scan_for_target`] when the fallback scan
    ///   fails.
    pub async fn on_focus(&self) -> Result<BleWindowDevice> {
        if let Some(device) = self.connected_device().await {
            debug!("Focus while connected to {}", device.id);
            return Ok(device);
        }

        self.request_permissions().await?;

        let binding = match self.store.get(LAST_DEVICE_KEY).await {
            Ok(binding) => binding,
            Err(e) => {
                warn!("Could not read saved device: {}", e);
                None
            }
        };

        let target = self.params.target_name.clone();
        let searching = ControllerStatus::Searching {
            target: target.clone(),
        };
        let scan_timeout = Duration::from_millis(self.params.scan_timeout_ms);

        let epoch = if let Some(device_id) = binding {
            info!("Reconnecting to saved device {}", device_id);
            let epoch = self
                .begin(ControllerState::Reconnecting, ControllerStatus::Reconnecting)
                .await?;

            match self.establish(epoch, &device_id, None).await {
                Ok(device) => return Ok(device),
                Err(SmartWindowError::ConnectCancelled) => {
                    info!("Reconnect to {} abandoned", device_id);
                    return Err(SmartWindowError::ConnectCancelled);
                }
                Err(e) => {
                    warn!("Saved device {} unavailable ({}), scanning instead", device_id, e);
                    if let Err(e) = self.store.remove(LAST_DEVICE_KEY).await {
                        warn!("Failed to forget saved device: {}", e);
                    }
                }
            }

            self.begin_at(Some(epoch), ControllerState::Scanning, searching)
                .await?
        } else {
            self.begin(ControllerState::Scanning, searching).await?
        };

        self.run_scan(epoch, &target, scan_timeout).await
    }

    /// Screen lost focus: stop scanning, abandon any connect in flight and drop the
    /// link, keeping the saved device
    pub async fn on_blur(&self) {
        let (state, device) = {
            let mut inner = self.inner.write().await;
            inner.epoch = inner.epoch.wrapping_add(1);

            let state = inner.state;
            match state {
                ControllerState::Idle => {}
                ControllerState::Connected => {
                    inner.state = ControllerState::Idle;
                    inner.status = ControllerStatus::Disconnected;
                }
                _ => {
                    inner.state = ControllerState::Idle;
                    inner.status = ControllerStatus::Ready;
                }
            }
            (state, inner.device.take())
        };

        match state {
            ControllerState::Scanning => {
                info!("Blur while scanning, stopping scan");
                if let Err(e) = self.transport.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
            }
            ControllerState::Reconnecting | ControllerState::Connecting => {
                // the attempt closes its own link once it sees the new epoch
                info!("Blur while connecting, abandoning attempt");
            }
            ControllerState::Connected => {
                if let Some(device) = device {
                    info!("Blur while connected, closing link to {}", device.id);
                    if let Err(e) = self.transport.cancel_connection(&device.id).await {
                        warn!("Failed to close link: {}", e);
                    }
                }
            }
            ControllerState::Idle => debug!("Blur while idle"),
        }
    }

    /// Scan for a device advertising exactly `target_name` and connect to the first
    /// match
    ///
    /// # Errors
    ///
    /// - [`SmartWindowError::PermissionDenied`] if permissions are refused.
    /// - [`SmartWindowError::ScanInProgress`] / [`SmartWindowError::AlreadyConnected`]
    ///   when not idle.
    /// - [`SmartWindowError::ScanTimeout`] if nothing matched in time.
    /// - [`SmartWindowError::ScanCancelled`] if the scan was stopped by a blur.
    /// - [`SmartWindowError::ConnectFailed`] if the matched device refused the link.
    pub async fn scan_for_target(
        &self,
        target_name: &str,
        scan_timeout: Duration,
    ) -> Result<BleWindowDevice> {
        self.request_permissions().await?;

        let epoch = self
            .begin(
                ControllerState::Scanning,
                ControllerStatus::Searching {
                    target: target_name.to_string(),
                },
            )
            .await?;
        self.run_scan(epoch, target_name, scan_timeout).await
    }

    /// Collect every named window advertising nearby, for manual selection
    ///
    /// Runs for the whole of `scan_timeout` and returns the devices seen, first
    /// sighting first, one entry per id. Pass an entry's id to
    /// [`WindowController::connect`].
    ///
    /// # Errors
    ///
    /// - [`SmartWindowError::PermissionDenied`] if permissions are refused.
    /// - [`SmartWindowError::ScanInProgress`] / [`SmartWindowError::AlreadyConnected`]
    ///   when not idle.
    /// - [`SmartWindowError::ScanCancelled`] if the scan was stopped by a blur.
    pub async fn discover_devices(&self, scan_timeout: Duration) -> Result<Vec<BleWindowDevice>> {
        self.request_permissions().await?;

        let epoch = self
            .begin(ControllerState::Scanning, ControllerStatus::Discovering)
            .await?;

        info!("Discovering nearby windows for {:?}", scan_timeout);
        let mut advertisements = self.open_scan(epoch).await?;

        let mut found: Vec<BleWindowDevice> = Vec::new();
        let closed = timeout(scan_timeout, async {
            while let Some(advertisement) = advertisements.recv().await {
                let Some(name) = advertisement.name else {
                    continue;
                };
                if found.iter().any(|d| d.id == advertisement.id) {
                    continue;
                }

                debug!("Discovered '{}' at {}", name, advertisement.id);
                found.push(BleWindowDevice::new(advertisement.id, Some(name)));
            }
        })
        .await
        .is_ok();

        if closed {
            info!("Discovery cancelled");
            self.settle(epoch, ControllerStatus::Ready).await;
            return Err(SmartWindowError::ScanCancelled);
        }

        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        if !self.settle(epoch, ControllerStatus::Ready).await {
            return Err(SmartWindowError::ScanCancelled);
        }

        info!("Discovered {} window(s)", found.len());
        Ok(found)
    }

    /// Start the platform scan for an attempt already in `Scanning`
    async fn open_scan(&self, epoch: u64) -> Result<mpsc::UnboundedReceiver<Advertisement>> {
        let receiver = match self.transport.start_scan().await {
            Ok(receiver) => receiver,
            Err(e) => {
                error!("Failed to start scan: {}", e);
                self.settle(epoch, ControllerStatus::ScanError).await;
                return Err(e);
            }
        };

        // a blur that landed while the scan was starting had nothing to stop yet
        if self.inner.read().await.epoch != epoch {
            if let Err(e) = self.transport.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
            return Err(SmartWindowError::ScanCancelled);
        }
        Ok(receiver)
    }

    async fn run_scan(
        &self,
        epoch: u64,
        target_name: &str,
        scan_timeout: Duration,
    ) -> Result<BleWindowDevice> {
        info!("Scanning for '{}'", target_name);
        let mut advertisements = self.open_scan(epoch).await?;

        let matched = timeout(scan_timeout, async {
            while let Some(advertisement) = advertisements.recv().await {
                if advertisement.matches(target_name) {
                    return Some(advertisement);
                }
            }
            None
        })
        .await;

        match matched {
            Ok(Some(advertisement)) => {
                info!(
                    "Found '{}' at {} (rssi {:?})",
                    target_name, advertisement.id, advertisement.rssi
                );
                if let Err(e) = self.transport.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }

                {
                    let mut inner = self.inner.write().await;
                    if inner.epoch != epoch {
                        return Err(SmartWindowError::ScanCancelled);
                    }
                    inner.state = ControllerState::Connecting;
                }

                self.establish(epoch, &advertisement.id, advertisement.name)
                    .await
            }
            Ok(None) => {
                info!("Scan for '{}' cancelled", target_name);
                self.settle(epoch, ControllerStatus::Ready).await;
                Err(SmartWindowError::ScanCancelled)
            }
            Err(_) => {
                warn!("'{}' not found within {:?}", target_name, scan_timeout);
                if let Err(e) = self.transport.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }

                let not_found = ControllerStatus::NotFound {
                    target: target_name.to_string(),
                };
                if !self.settle(epoch, not_found).await {
                    return Err(SmartWindowError::ScanCancelled);
                }

                Err(SmartWindowError::ScanTimeout {
                    target: target_name.to_string(),
                    timeout_ms: u64::try_from(scan_timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Connect directly to a known device id
    ///
    /// # Errors
    ///
    /// - [`SmartWindowError::ScanInProgress`] / [`SmartWindowError::AlreadyConnected`]
    ///   when not idle.
    /// - [`SmartWindowError::ConnectFailed`] if the link or discovery fails.
    /// - [`SmartWindowError::ConnectCancelled`] if a blur or disconnect arrived first.
    pub async fn connect(&self, device_id: &str) -> Result<BleWindowDevice> {
        let epoch = self
            .begin(ControllerState::Connecting, ControllerStatus::Ready)
            .await?;
        self.establish(epoch, device_id, None).await
    }

    /// Link up and discover, then mark connected and persist the binding
    ///
    /// Commits only while `epoch` is current; a superseded attempt closes the link it
    /// opened and reports `ConnectCancelled`.
    async fn establish(
        &self,
        epoch: u64,
        device_id: &str,
        advertised_name: Option<String>,
    ) -> Result<BleWindowDevice> {
        let connect_timeout = Duration::from_millis(self.params.connect_timeout_ms);

        let linked = timeout(connect_timeout, async {
            self.transport.connect(device_id).await?;
            self.transport.discover_services(device_id).await
        })
        .await
        .unwrap_or_else(|_| {
            Err(SmartWindowError::ConnectFailed(format!(
                "timed out after {}ms",
                self.params.connect_timeout_ms
            )))
        });

        if let Err(e) = linked {
            error!("Connection to {} failed: {}", device_id, e);
            if let Err(cancel_err) = self.transport.cancel_connection(device_id).await {
                debug!("Cleanup after failed connect: {}", cancel_err);
            }
            if !self.settle(epoch, ControllerStatus::ConnectFailed).await {
                return Err(SmartWindowError::ConnectCancelled);
            }

            return Err(match e {
                SmartWindowError::ConnectFailed(_) => e,
                other => SmartWindowError::ConnectFailed(other.to_string()),
            });
        }

        let mut device = BleWindowDevice::new(device_id, advertised_name);
        device.connection_state = ConnectionState::Connected;

        let mut inner = self.inner.write().await;
        if inner.epoch != epoch {
            drop(inner);
            info!("Connection to {} superseded, closing link", device_id);
            if let Err(e) = self.transport.cancel_connection(device_id).await {
                warn!("Failed to close link to {}: {}", device_id, e);
            }
            return Err(SmartWindowError::ConnectCancelled);
        }

        inner.state = ControllerState::Connected;
        inner.status = ControllerStatus::Connected {
            name: device.advertised_name.clone(),
        };
        inner.device = Some(device.clone());

        // saved under the lock so a disconnect cannot slip in before the binding lands
        if let Err(e) = self.store.set(LAST_DEVICE_KEY, device_id).await {
            warn!("Failed to remember device {}: {}", device_id, e);
        }
        drop(inner);

        info!("Connected to window {}", device_id);
        Ok(device)
    }

    /// Close the link and forget the saved device
    ///
    /// Any scan or connect in flight is abandoned. Local percentage resets to closed
    /// and the sink is told there is no live value.
    ///
    /// # Errors
    ///
    /// Returns store errors if the saved device cannot be removed. The link is closed
    /// and local state reset regardless.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting window");

        let device = {
            let mut inner = self.inner.write().await;
            inner.epoch = inner.epoch.wrapping_add(1);
            inner.state = ControllerState::Idle;
            inner.status = ControllerStatus::Disconnected;
            inner.device.take()
        };

        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        if let Some(device) = device {
            if let Err(e) = self.transport.cancel_connection(&device.id).await {
                warn!("Failed to close link to {}: {}", device.id, e);
            }
        }

        self.gesture.lock().await.reset();
        self.sink.publish_open_percentage(None);

        self.store.remove(LAST_DEVICE_KEY).await
    }

    /// Send an open percentage to the connected window
    ///
    /// The value is rounded and clamped to an integer in `[0, 100]`. Failures are
    /// logged and swallowed.
    pub async fn write_percentage(&self, value: f64) -> WriteOutcome {
        let device_id = {
            let inner = self.inner.read().await;
            match (&inner.state, &inner.device) {
                (ControllerState::Connected, Some(device)) => device.id.clone(),
                _ => {
                    debug!("Skipping write of {:.0}%, no device connected", value);
                    return WriteOutcome::NotConnected;
                }
            }
        };

        let command = OpenCommand::from_value(value);
        debug!(
            "Writing {}% to {} ({})",
            command.percentage(),
            device_id,
            command.to_base64()
        );

        match self
            .transport
            .write_without_response(&device_id, &command.to_bytes())
            .await
        {
            Ok(()) => WriteOutcome::Sent,
            Err(e) => {
                warn!("Write of {}% failed: {}", command.percentage(), e);
                WriteOutcome::Failed
            }
        }
    }

    async fn commit(&self, percentage: OpenPercentage) -> WriteOutcome {
        self.sink.publish_open_percentage(Some(percentage));
        self.write_percentage(percentage.value()).await
    }

    /// Drag moved by `dx` since the gesture began. Updates the visual only.
    pub async fn drag_move(&self, dx: f64) -> OpenPercentage {
        self.gesture.lock().await.drag_move(dx)
    }

    /// Drag released after moving `dx`; commits the resulting position
    pub async fn drag_release(&self, dx: f64) -> WriteOutcome {
        let committed = self.gesture.lock().await.drag_release(dx);
        self.commit(committed).await
    }

    /// Slider moved to `value`. Updates the visual only.
    pub async fn slider_change(&self, value: f64) -> OpenPercentage {
        self.gesture.lock().await.slider_change(value)
    }

    /// Slider released at `value`; commits it
    pub async fn slider_commit(&self, value: f64) -> WriteOutcome {
        let committed = self.gesture.lock().await.slider_commit(value);
        self.commit(committed).await
    }

    /// The OS reported the link to `device_id` dropped
    ///
    /// Returns to idle and keeps the saved device so the next focus reconnects.
    /// Returns whether `device_id` was the connected device.
    pub async fn handle_connection_lost(&self, device_id: &str) -> bool {
        let mut inner = self.inner.write().await;

        let is_current = inner.device.as_ref().is_some_and(|d| d.id == device_id);
        if !is_current {
            debug!("Ignoring disconnect from {}", device_id);
            return false;
        }

        warn!("Connection to {} lost", device_id);
        inner.state = ControllerState::Idle;
        inner.status = ControllerStatus::Disconnected;
        inner.device = None;
        true
    }

    /// Start a background task feeding OS disconnect events into
    /// [`WindowController::handle_connection_lost`]
    ///
    /// The task ends when the controller is dropped. Calling this again replaces the
    /// previous task.
    ///
    /// # Errors
    ///
    /// Returns transport errors if the disconnect stream cannot be opened.
    pub async fn spawn_connection_watch(self: &Arc<Self>) -> Result<()> {
        let mut disconnections = self.transport.disconnections().await?;
        let controller: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            info!("Connection watch started");

            while let Some(device_id) = disconnections.recv().await {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.handle_connection_lost(&device_id).await;
            }

            info!("Connection watch stopped");
        });

        if let Some(previous) = self.watch_task.lock().await.replace(task) {
            previous.abort();
        }
        Ok(())
    }
}

impl Drop for WindowController {
    fn drop(&mut self) {
        if let Some(task) = self.watch_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ble::testing::MockTransport,
        live::LiveDeviceState,
        permission::{Permission, StaticPermissions},
        store::MemoryStore,
    };
    use tokio_test::assert_err;

    const SAVED_ID: &str = "AA:BB:CC:DD:EE:FF";
    const WINDOW_ID: &str = "11:22:33:44:55:66";

    struct Harness {
        transport: Arc<MockTransport>,
        store: Arc<MemoryStore>,
        live: Arc<LiveDeviceState>,
        controller: Arc<WindowController>,
    }

    fn harness_with(permissions: StaticPermissions, params: ConnectionParams) -> Harness {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        let live = Arc::new(LiveDeviceState::new());
        let controller = Arc::new(WindowController::new(
            transport.clone(),
            Arc::new(permissions),
            store.clone(),
            live.clone(),
            params,
        ));

        Harness {
            transport,
            store,
            live,
            controller,
        }
    }

    fn harness() -> Harness {
        let params = ConnectionParams {
            scan_timeout_ms: 100,
            connect_timeout_ms: 1_000,
            pane_width: 200.0,
            ..ConnectionParams::default()
        };
        harness_with(StaticPermissions::granted(), params)
    }

    async fn connected() -> Harness {
        let h = harness();
        h.transport.make_reachable(WINDOW_ID);
        h.controller.connect(WINDOW_ID).await.unwrap();
        h
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        timeout(Duration::from_secs(2), async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stale_binding_falls_back_to_scan() {
        let h = harness();
        h.store.set(LAST_DEVICE_KEY, SAVED_ID).await.unwrap();
        h.transport.advertise("99:99:99:99:99:99", "Other");
        h.transport.advertise(WINDOW_ID, "CLWM-B07");
        h.transport.make_reachable(WINDOW_ID);

        let device = h.controller.on_focus().await.unwrap();

        assert_eq!(device.id, WINDOW_ID);
        assert_eq!(device.advertised_name.as_deref(), Some("CLWM-B07"));
        assert_eq!(device.connection_state, ConnectionState::Connected);
        assert_eq!(h.controller.state().await, ControllerState::Connected);
        assert_eq!(
            h.controller.status().await,
            ControllerStatus::Connected {
                name: Some("CLWM-B07".to_string())
            }
        );
        assert_eq!(
            *h.transport.connects.lock().unwrap(),
            vec![SAVED_ID.to_string(), WINDOW_ID.to_string()]
        );
        assert_eq!(*h.transport.scans_started.lock().unwrap(), 1);
        assert!(!h.transport.scan_active());
        assert_eq!(
            h.store.get(LAST_DEVICE_KEY).await.unwrap().as_deref(),
            Some(WINDOW_ID)
        );
    }

    #[tokio::test]
    async fn test_saved_device_reconnects_without_scanning() {
        let h = harness();
        h.store.set(LAST_DEVICE_KEY, WINDOW_ID).await.unwrap();
        h.transport.make_reachable(WINDOW_ID);

        let device = h.controller.on_focus().await.unwrap();
        assert_eq!(device.id, WINDOW_ID);
        assert_eq!(*h.transport.scans_started.lock().unwrap(), 0);
        assert_eq!(*h.transport.discovered.lock().unwrap(), vec![WINDOW_ID]);

        // focus again is a no-op
        h.controller.on_focus().await.unwrap();
        assert_eq!(h.transport.connects.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_slider_commit_writes_once() {
        let h = connected().await;

        assert_eq!(h.controller.slider_change(20.0).await.as_byte(), 20);
        assert_eq!(h.controller.slider_change(55.5).await.as_byte(), 56);
        assert!(h.transport.written().is_empty());

        let outcome = h.controller.slider_commit(73.0).await;
        assert_eq!(outcome, WriteOutcome::Sent);
        assert_eq!(
            h.transport.written(),
            vec![vec![0x2A, 0x17, 0x10, 0x00, 0x00, 0x49]]
        );
        assert_eq!(h.live.open_percentage(), Some(OpenPercentage::from(73)));
    }

    #[tokio::test]
    async fn test_drag_writes_only_on_release() {
        let h = connected().await;

        h.controller.drag_move(40.0).await;
        h.controller.drag_move(400.0).await;
        assert_eq!(h.controller.percentage().await, OpenPercentage::OPEN);
        h.controller.drag_move(100.0).await;
        assert!(h.transport.written().is_empty());

        h.controller.drag_release(100.0).await;
        assert_eq!(h.transport.written(), vec![vec![0x2A, 0x17, 0x10, 0x00, 0x00, 50]]);
        assert_eq!(h.live.open_percentage(), Some(OpenPercentage::from(50)));
    }

    #[tokio::test]
    async fn test_scan_timeout_reports_not_found() {
        let h = harness();
        h.transport.advertise("99:99:99:99:99:99", "CLWM-B08");

        let err = assert_err!(
            h.controller
                .scan_for_target("CLWM-B07", Duration::from_millis(50))
                .await
        );
        assert!(matches!(err, SmartWindowError::ScanTimeout { .. }));
        assert!(err.is_recoverable());
        assert_eq!(h.controller.state().await, ControllerState::Idle);
        assert_eq!(
            h.controller.status().await,
            ControllerStatus::NotFound {
                target: "CLWM-B07".to_string()
            }
        );
        assert!(!h.transport.scan_active());
        assert!(h.transport.connects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blur_cancels_scan() {
        let h = harness();
        let controller = h.controller.clone();
        let scan = tokio::spawn(async move {
            controller
                .scan_for_target("CLWM-B07", Duration::from_secs(5))
                .await
        });

        let transport = h.transport.clone();
        wait_until(|| {
            let transport = transport.clone();
            async move { transport.scan_active() }
        })
        .await;

        h.controller.on_blur().await;

        let result = scan.await.unwrap();
        assert!(matches!(result, Err(SmartWindowError::ScanCancelled)));
        assert_eq!(h.controller.state().await, ControllerState::Idle);
        assert!(!h.transport.scan_active());
    }

    #[tokio::test]
    async fn test_second_scan_is_refused() {
        let h = harness();
        let controller = h.controller.clone();
        let first = tokio::spawn(async move {
            controller
                .scan_for_target("CLWM-B07", Duration::from_secs(5))
                .await
        });

        let transport = h.transport.clone();
        wait_until(|| {
            let transport = transport.clone();
            async move { transport.scan_active() }
        })
        .await;

        let err = assert_err!(
            h.controller
                .scan_for_target("CLWM-B07", Duration::from_secs(5))
                .await
        );
        assert!(matches!(err, SmartWindowError::ScanInProgress));
        assert_eq!(*h.transport.scans_started.lock().unwrap(), 1);

        h.controller.on_blur().await;
        assert!(first.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_permission_denied_blocks_scan() {
        let h = harness_with(
            StaticPermissions::denying(vec![Permission::FineLocation]),
            ConnectionParams::default(),
        );

        let err = assert_err!(h.controller.on_focus().await);
        match err {
            SmartWindowError::PermissionDenied { missing } => {
                assert_eq!(missing, vec!["fine_location".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(
            h.controller.status().await,
            ControllerStatus::PermissionDenied
        );
        assert_eq!(*h.transport.scans_started.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_cancels_half_open_link() {
        let h = harness();

        let err = assert_err!(h.controller.connect(SAVED_ID).await);
        assert!(matches!(err, SmartWindowError::ConnectFailed(_)));
        assert_eq!(*h.transport.cancelled.lock().unwrap(), vec![SAVED_ID]);
        assert_eq!(h.controller.state().await, ControllerState::Idle);
        assert_eq!(h.controller.status().await, ControllerStatus::ConnectFailed);
        assert!(h.transport.discovered.lock().unwrap().is_empty());
        assert_eq!(h.store.get(LAST_DEVICE_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_failures_are_swallowed() {
        let h = connected().await;
        *h.transport.fail_writes.lock().unwrap() = true;

        assert_eq!(h.controller.slider_commit(30.0).await, WriteOutcome::Failed);
        assert_eq!(h.live.open_percentage(), Some(OpenPercentage::from(30)));
        assert_eq!(h.controller.state().await, ControllerState::Connected);
    }

    #[tokio::test]
    async fn test_write_without_connection() {
        let h = harness();

        assert_eq!(
            h.controller.write_percentage(50.0).await,
            WriteOutcome::NotConnected
        );
        assert_eq!(
            h.controller.slider_commit(50.0).await,
            WriteOutcome::NotConnected
        );
        assert!(h.transport.written().is_empty());
        assert_eq!(h.live.open_percentage(), Some(OpenPercentage::from(50)));
    }

    #[tokio::test]
    async fn test_write_clamps_and_rounds() {
        let h = connected().await;

        h.controller.write_percentage(150.0).await;
        h.controller.write_percentage(-3.0).await;
        h.controller.write_percentage(72.6).await;

        let last_bytes: Vec<u8> = h.transport.written().iter().map(|w| w[5]).collect();
        assert_eq!(last_bytes, vec![100, 0, 73]);
    }

    #[tokio::test]
    async fn test_connection_loss_keeps_binding() {
        let h = connected().await;
        h.controller.spawn_connection_watch().await.unwrap();

        h.transport.drop_link("00:00:00:00:00:00");
        h.transport.drop_link(WINDOW_ID);

        let controller = h.controller.clone();
        wait_until(|| {
            let controller = controller.clone();
            async move { controller.state().await == ControllerState::Idle }
        })
        .await;

        assert_eq!(h.controller.status().await, ControllerStatus::Disconnected);
        assert_eq!(h.controller.connected_device().await, None);
        assert_eq!(
            h.store.get(LAST_DEVICE_KEY).await.unwrap().as_deref(),
            Some(WINDOW_ID)
        );
        assert_eq!(
            h.controller.write_percentage(10.0).await,
            WriteOutcome::NotConnected
        );
    }

    #[tokio::test]
    async fn test_blur_closes_link_but_keeps_binding() {
        let h = connected().await;

        h.controller.on_blur().await;

        assert_eq!(h.controller.state().await, ControllerState::Idle);
        assert_eq!(*h.transport.cancelled.lock().unwrap(), vec![WINDOW_ID]);
        assert_eq!(
            h.store.get(LAST_DEVICE_KEY).await.unwrap().as_deref(),
            Some(WINDOW_ID)
        );
    }

    #[tokio::test]
    async fn test_disconnect_forgets_device() {
        let h = connected().await;
        h.controller.slider_commit(80.0).await;

        h.controller.disconnect().await.unwrap();

        assert_eq!(h.controller.state().await, ControllerState::Idle);
        assert_eq!(h.controller.status().await, ControllerStatus::Disconnected);
        assert_eq!(h.controller.percentage().await, OpenPercentage::CLOSED);
        assert_eq!(h.live.open_percentage(), None);
        assert_eq!(h.store.get(LAST_DEVICE_KEY).await.unwrap(), None);
        assert_eq!(*h.transport.cancelled.lock().unwrap(), vec![WINDOW_ID]);

        let err = assert_err!(h.controller.scan_for_target("CLWM-B07", Duration::from_millis(20)).await);
        assert!(matches!(err, SmartWindowError::ScanTimeout { .. }));
    }

    #[tokio::test]
    async fn test_scan_refused_while_connected() {
        let h = connected().await;

        let err = assert_err!(
            h.controller
                .scan_for_target("CLWM-B07", Duration::from_millis(20))
                .await
        );
        assert!(matches!(
            err,
            SmartWindowError::AlreadyConnected { ref device_id } if device_id == WINDOW_ID
        ));
    }

    #[tokio::test]
    async fn test_blur_abandons_slow_reconnect() {
        let h = harness();
        h.store.set(LAST_DEVICE_KEY, SAVED_ID).await.unwrap();
        h.transport.advertise(WINDOW_ID, "CLWM-B07");
        *h.transport.connect_delay.lock().unwrap() = Some(Duration::from_millis(80));

        let controller = h.controller.clone();
        let focus = tokio::spawn(async move { controller.on_focus().await });

        let controller = h.controller.clone();
        wait_until(|| {
            let controller = controller.clone();
            async move { controller.state().await == ControllerState::Reconnecting }
        })
        .await;
        h.controller.on_blur().await;

        let result = focus.await.unwrap();
        assert!(matches!(result, Err(SmartWindowError::ConnectCancelled)));
        assert_eq!(*h.transport.scans_started.lock().unwrap(), 0);
        assert!(!h.transport.scan_active());
        assert_eq!(h.controller.state().await, ControllerState::Idle);
        assert_eq!(h.controller.status().await, ControllerStatus::Ready);
        assert_eq!(*h.transport.cancelled.lock().unwrap(), vec![SAVED_ID]);
        assert_eq!(
            h.store.get(LAST_DEVICE_KEY).await.unwrap().as_deref(),
            Some(SAVED_ID)
        );
    }

    #[tokio::test]
    async fn test_blur_closes_link_opened_after_it() {
        let h = harness();
        h.store.set(LAST_DEVICE_KEY, WINDOW_ID).await.unwrap();
        h.transport.make_reachable(WINDOW_ID);
        *h.transport.connect_delay.lock().unwrap() = Some(Duration::from_millis(80));

        let controller = h.controller.clone();
        let focus = tokio::spawn(async move { controller.on_focus().await });

        let transport = h.transport.clone();
        wait_until(|| {
            let transport = transport.clone();
            async move { !transport.connects.lock().unwrap().is_empty() }
        })
        .await;
        h.controller.on_blur().await;

        let result = focus.await.unwrap();
        assert!(matches!(result, Err(SmartWindowError::ConnectCancelled)));
        assert_eq!(h.controller.state().await, ControllerState::Idle);
        assert_eq!(h.controller.connected_device().await, None);
        assert_eq!(*h.transport.cancelled.lock().unwrap(), vec![WINDOW_ID]);
        assert_eq!(
            h.controller.write_percentage(40.0).await,
            WriteOutcome::NotConnected
        );

        // next focus takes the direct path again
        *h.transport.connect_delay.lock().unwrap() = None;
        let device = h.controller.on_focus().await.unwrap();
        assert_eq!(device.id, WINDOW_ID);
        assert_eq!(*h.transport.scans_started.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_connect_wins() {
        let h = harness();
        h.transport.make_reachable(WINDOW_ID);
        *h.transport.connect_delay.lock().unwrap() = Some(Duration::from_millis(80));

        let controller = h.controller.clone();
        let connect = tokio::spawn(async move { controller.connect(WINDOW_ID).await });

        let transport = h.transport.clone();
        wait_until(|| {
            let transport = transport.clone();
            async move { !transport.connects.lock().unwrap().is_empty() }
        })
        .await;
        h.controller.disconnect().await.unwrap();

        let result = connect.await.unwrap();
        assert!(matches!(result, Err(SmartWindowError::ConnectCancelled)));
        assert_eq!(h.controller.state().await, ControllerState::Idle);
        assert_eq!(h.controller.status().await, ControllerStatus::Disconnected);
        assert_eq!(h.controller.connected_device().await, None);
        assert_eq!(h.store.get(LAST_DEVICE_KEY).await.unwrap(), None);
        assert_eq!(*h.transport.cancelled.lock().unwrap(), vec![WINDOW_ID]);
    }

    #[tokio::test]
    async fn test_discover_lists_named_devices_once() {
        let h = harness();
        h.transport.advertise(WINDOW_ID, "CLWM-B07");
        h.transport.advertise_anonymous("77:77:77:77:77:77");
        h.transport.advertise("99:99:99:99:99:99", "CLWM-B08");
        h.transport.advertise(WINDOW_ID, "CLWM-B07");

        let devices = h
            .controller
            .discover_devices(Duration::from_millis(50))
            .await
            .unwrap();

        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec![WINDOW_ID, "99:99:99:99:99:99"]);
        assert_eq!(devices[1].advertised_name.as_deref(), Some("CLWM-B08"));
        assert!(devices
            .iter()
            .all(|d| d.connection_state == ConnectionState::Disconnected));
        assert_eq!(h.controller.state().await, ControllerState::Idle);
        assert_eq!(h.controller.status().await, ControllerStatus::Ready);
        assert!(!h.transport.scan_active());
        assert!(h.transport.connects.lock().unwrap().is_empty());

        // picking an entry connects to it
        h.transport.make_reachable(WINDOW_ID);
        let device = h.controller.connect(&devices[0].id).await.unwrap();
        assert_eq!(device.id, WINDOW_ID);
        assert_eq!(h.controller.state().await, ControllerState::Connected);
        assert_eq!(
            h.store.get(LAST_DEVICE_KEY).await.unwrap().as_deref(),
            Some(WINDOW_ID)
        );
    }

    #[tokio::test]
    async fn test_blur_cancels_discovery() {
        let h = harness();
        h.transport.advertise(WINDOW_ID, "CLWM-B07");

        let controller = h.controller.clone();
        let discovery =
            tokio::spawn(async move { controller.discover_devices(Duration::from_secs(5)).await });

        let transport = h.transport.clone();
        wait_until(|| {
            let transport = transport.clone();
            async move { transport.scan_active() }
        })
        .await;
        assert_eq!(h.controller.status().await, ControllerStatus::Discovering);

        h.controller.on_blur().await;

        let result = discovery.await.unwrap();
        assert!(matches!(result, Err(SmartWindowError::ScanCancelled)));
        assert_eq!(h.controller.state().await, ControllerState::Idle);
        assert!(!h.transport.scan_active());
    }

    #[tokio::test]
    async fn test_discover_refused_while_busy() {
        let h = connected().await;
        let err = assert_err!(
            h.controller
                .discover_devices(Duration::from_millis(20))
                .await
        );
        assert!(matches!(err, SmartWindowError::AlreadyConnected { .. }));

        let denied = harness_with(
            StaticPermissions::denying(vec![Permission::BluetoothScan]),
            ConnectionParams::default(),
        );
        let err = assert_err!(
            denied
                .controller
                .discover_devices(Duration::from_millis(20))
                .await
        );
        assert!(matches!(err, SmartWindowError::PermissionDenied { .. }));
        assert_eq!(*denied.transport.scans_started.lock().unwrap(), 0);
    }
}
