use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, SmartWindowError},
    types::Advertisement,
    WINDOW_SERVICE_UUID, WINDOW_WRITE_CHAR_UUID,
};

/// Link-layer operations the window controller needs from a BLE stack
///
/// Device identifiers are opaque strings chosen by the implementation; the same id
/// must be accepted by [`BleTransport::connect`] in a later session.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Start an unfiltered scan. Advertisements arrive on the returned channel until
    /// [`BleTransport::stop_scan`] is called, which closes it.
    async fn start_scan(&self) -> Result<mpsc::UnboundedReceiver<Advertisement>>;

    /// Stop scanning. Calling this without an active scan is a no-op.
    async fn stop_scan(&self) -> Result<()>;

    /// Open a link to the device
    async fn connect(&self, device_id: &str) -> Result<()>;

    /// Discover services and locate the window write characteristic
    async fn discover_services(&self, device_id: &str) -> Result<()>;

    /// Write without waiting for a peripheral acknowledgment
    async fn write_without_response(&self, device_id: &str, data: &[u8]) -> Result<()>;

    /// Drop the link to the device
    async fn cancel_connection(&self, device_id: &str) -> Result<()>;

    /// Stream of ids whose link was dropped by the OS
    async fn disconnections(&self) -> Result<mpsc::UnboundedReceiver<String>>;
}

/// [`BleTransport`] backed by the host Bluetooth adapter through btleplug
///
/// Device ids are Bluetooth addresses in `XX:XX:XX:XX:XX:XX` form.
pub struct BtleplugTransport {
    central: Adapter,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
    write_chars: Mutex<HashMap<String, Characteristic>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    service_uuid: Uuid,
    write_char_uuid: Uuid,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`SmartWindowError::Ble`] if the adapter cannot be initialized or none
    /// is present, or [`SmartWindowError::Protocol`] for malformed GATT UUIDs.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(btleplug::Error::DeviceNotFound)?;

        let service_uuid = Uuid::parse_str(WINDOW_SERVICE_UUID)
            .map_err(|e| SmartWindowError::Protocol(format!("Invalid service UUID: {e}")))?;
        let write_char_uuid = Uuid::parse_str(WINDOW_WRITE_CHAR_UUID).map_err(|e| {
            SmartWindowError::Protocol(format!("Invalid write characteristic UUID: {e}"))
        })?;

        info!("Bluetooth adapter ready");

        Ok(Self {
            central,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            write_chars: Mutex::new(HashMap::new()),
            scan_task: Mutex::new(None),
            service_uuid,
            write_char_uuid,
        })
    }

    /// Find a peripheral by id, falling back to the adapter's known devices so a
    /// persisted id can be reconnected without scanning
    async fn find_peripheral(&self, device_id: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.lock().await.get(device_id) {
            return Ok(peripheral.clone());
        }

        let known = self.central.peripherals().await?;
        let peripheral = known
            .into_iter()
            .find(|p| p.address().to_string() == device_id)
            .ok_or_else(|| {
                SmartWindowError::ConnectFailed(format!("Unknown device {device_id}"))
            })?;

        self.peripherals
            .lock()
            .await
            .insert(device_id.to_string(), peripheral.clone());

        Ok(peripheral)
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn start_scan(&self) -> Result<mpsc::UnboundedReceiver<Advertisement>> {
        let mut events = self.central.events().await?;
        self.central.start_scan(ScanFilter::default()).await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let central = self.central.clone();
        let peripherals = self.peripherals.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };

                let Ok(peripheral) = central.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };

                let device_id = peripheral.address().to_string();
                peripherals
                    .lock()
                    .await
                    .insert(device_id.clone(), peripheral);

                let advertisement = Advertisement {
                    id: device_id,
                    name: properties.local_name,
                    rssi: properties.rssi,
                };

                if sender.send(advertisement).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.scan_task.lock().await.replace(task) {
            previous.abort();
        }

        debug!("Scan started");
        Ok(receiver)
    }

    async fn stop_scan(&self) -> Result<()> {
        let task = self.scan_task.lock().await.take();
        if let Some(task) = task {
            task.abort();
            self.central.stop_scan().await?;
            debug!("Scan stopped");
        }
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<()> {
        let peripheral = self.find_peripheral(device_id).await?;

        peripheral
            .connect()
            .await
            .map_err(|e| SmartWindowError::ConnectFailed(e.to_string()))?;

        info!("Link up with {}", device_id);
        Ok(())
    }

    async fn discover_services(&self, device_id: &str) -> Result<()> {
        let peripheral = self.find_peripheral(device_id).await?;
        peripheral.discover_services().await?;

        let write_char = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == self.service_uuid && c.uuid == self.write_char_uuid)
            .ok_or_else(|| {
                SmartWindowError::Protocol("Window write characteristic not found".to_string())
            })?;

        self.write_chars
            .lock()
            .await
            .insert(device_id.to_string(), write_char);

        debug!("Discovered window service on {}", device_id);
        Ok(())
    }

    async fn write_without_response(&self, device_id: &str, data: &[u8]) -> Result<()> {
        let write_char = self
            .write_chars
            .lock()
            .await
            .get(device_id)
            .cloned()
            .ok_or(SmartWindowError::NotConnected)?;
        let peripheral = self.find_peripheral(device_id).await?;

        peripheral
            .write(&write_char, data, WriteType::WithoutResponse)
            .await
            .map_err(|e| SmartWindowError::WriteFailed(e.to_string()))
    }

    async fn cancel_connection(&self, device_id: &str) -> Result<()> {
        self.write_chars.lock().await.remove(device_id);

        let peripheral = self.find_peripheral(device_id).await?;
        if peripheral.is_connected().await.unwrap_or(false) {
            peripheral.disconnect().await?;
        }

        info!("Link closed with {}", device_id);
        Ok(())
    }

    async fn disconnections(&self) -> Result<mpsc::UnboundedReceiver<String>> {
        let mut events = self.central.events().await?;
        let central = self.central.clone();
        let (sender, receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    match central.peripheral(&id).await {
                        Ok(peripheral) => {
                            if sender.send(peripheral.address().to_string()).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Disconnect from unknown peripheral: {}", e),
                    }
                }
            }
        });

        Ok(receiver)
    }
}
