//! BLE provider contract and the btleplug-backed implementation.
//!
//! The orchestrator only ever talks to the [`BleConnector`] / [`BleSession`]
//! / [`BleService`] / [`BleCharacteristic`] traits, so it can be driven by
//! the real stack or by the [`crate::mock`] implementations in tests. The
//! [`BtleplugConnector`] adapts the system Bluetooth stack to the contract:
//! scanning with name-prefix filters takes the place of a user-visible
//! device picker.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
        ScanFilter, Service, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, WalkPadError};

/// Property flags of a GATT characteristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProps {
    /// Supports unacknowledged server-initiated updates
    pub notify: bool,
    /// Supports acknowledged server-initiated updates
    pub indicate: bool,
    /// Supports write-with-response
    pub write: bool,
    /// Supports write-without-response
    pub write_without_response: bool,
}

impl CharProps {
    /// Whether the characteristic accepts writes of either kind
    #[must_use]
    pub const fn writable(&self) -> bool {
        self.write || self.write_without_response
    }
}

/// Callback invoked with a freshly owned copy of each notification payload
pub type NotificationHandler = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// Callback invoked when the peer drops the connection
pub type DisconnectListener = Box<dyn Fn() + Send + Sync>;

/// Thunk removing a listener registration
pub type Teardown = Box<dyn FnOnce() + Send>;

/// An individually addressed GATT characteristic
#[async_trait]
pub trait BleCharacteristic: Send + Sync {
    /// The characteristic UUID in long string form
    fn uuid(&self) -> String;

    /// Property flags of the characteristic
    fn properties(&self) -> CharProps;

    /// Write the payload with response.
    async fn write_with_response(&self, payload: &[u8]) -> Result<()>;

    /// Enable notifications; each inbound value is copied into an owned
    /// buffer and dispatched to `handler` in delivery order. Empty payloads
    /// are dropped before dispatch.
    async fn start_notifications(&self, handler: NotificationHandler) -> Result<()>;

    /// Disable notifications and drop the handler.
    async fn stop_notifications(&self) -> Result<()>;
}

/// A primary GATT service
#[async_trait]
pub trait BleService: Send + Sync {
    /// The service UUID in long string form
    fn uuid(&self) -> String;

    /// List the service's characteristics.
    async fn characteristics(&self) -> Result<Vec<Arc<dyn BleCharacteristic>>>;
}

/// A live GATT connection to one peer
#[async_trait]
pub trait BleSession: Send + Sync {
    /// Stable identifier of the connected device, usable for reconnecting
    fn device_id(&self) -> String;

    /// List the peer's primary services.
    async fn primary_services(&self) -> Result<Vec<Arc<dyn BleService>>>;

    /// Drop the connection.
    async fn disconnect(&self) -> Result<()>;

    /// Register a listener for unsolicited peer disconnects.
    ///
    /// Returns `Ok(None)` when the stack cannot observe peer disconnects;
    /// otherwise the teardown removes the listener.
    async fn on_disconnect(&self, listener: DisconnectListener) -> Result<Option<Teardown>> {
        let _ = listener;
        Ok(None)
    }
}

/// Criteria used to pick a device during scanning
#[derive(Debug, Clone, Default)]
pub struct ScanSelector {
    /// Device name prefixes that qualify a peer for selection
    pub name_prefixes: Vec<String>,
    /// Long-form service UUIDs the scanner advertises interest in
    pub optional_services: Vec<String>,
    /// Previously remembered device id; when present it wins over any
    /// name-prefix candidate
    pub remembered_id: Option<String>,
}

/// Entry point into a BLE stack
#[async_trait]
pub trait BleConnector: Send + Sync {
    /// Scan for and connect to the best matching device.
    async fn connect(&self, selector: &ScanSelector) -> Result<Arc<dyn BleSession>>;

    /// Whether [`BleConnector::reconnect`] can do anything useful
    fn supports_reconnect(&self) -> bool {
        false
    }

    /// Reconnect to a previously remembered device.
    ///
    /// Returns `Ok(None)` when the device cannot be found.
    async fn reconnect(&self, device_id: &str) -> Result<Option<Arc<dyn BleSession>>> {
        let _ = device_id;
        Ok(None)
    }
}

/// How long the scanner listens for advertisements before picking a device
const SCAN_WINDOW: Duration = Duration::from_secs(5);

/// [`BleConnector`] backed by the system Bluetooth stack via btleplug
pub struct BtleplugConnector {
    manager: Manager,
    scan_window: Duration,
}

impl BtleplugConnector {
    /// Create a connector over the system Bluetooth stack.
    ///
    /// # Errors
    ///
    /// Returns [`WalkPadError::Ble`] if the Bluetooth manager cannot be
    /// initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        Ok(Self {
            manager,
            scan_window: SCAN_WINDOW,
        })
    }

    /// Override the advertisement listening window used before device selection.
    #[must_use]
    pub fn with_scan_window(mut self, window: Duration) -> Self {
        self.scan_window = window;
        self
    }

    async fn adapter(&self) -> Result<Adapter> {
        let adapters = self.manager.adapters().await?;
        adapters
            .into_iter()
            .next()
            .ok_or_else(|| WalkPadError::Discovery("no Bluetooth adapter available".to_string()))
    }

    async fn scan(&self, adapter: &Adapter, selector: &ScanSelector) -> Result<()> {
        let services: Vec<Uuid> = selector
            .optional_services
            .iter()
            .filter_map(|s| Uuid::parse_str(s).ok())
            .collect();
        adapter.start_scan(ScanFilter { services }).await?;
        tokio::time::sleep(self.scan_window).await;
        adapter.stop_scan().await?;
        Ok(())
    }

    async fn pick_peripheral(
        &self,
        adapter: &Adapter,
        selector: &ScanSelector,
    ) -> Result<Peripheral> {
        let mut candidates: Vec<(i32, Peripheral)> = Vec::new();
        for peripheral in adapter.peripherals().await? {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            let address = peripheral.address().to_string();
            if selector.remembered_id.as_deref() == Some(address.as_str()) {
                candidates.push((i32::MAX, peripheral));
                continue;
            }
            let name_matches = props.local_name.as_ref().is_some_and(|name| {
                selector
                    .name_prefixes
                    .iter()
                    .any(|prefix| name.starts_with(prefix))
            });
            if name_matches || selector.name_prefixes.is_empty() {
                let rssi = props.rssi.map_or(i32::MIN, i32::from);
                candidates.push((rssi, peripheral));
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        candidates
            .into_iter()
            .next()
            .map(|(_, p)| p)
            .ok_or_else(|| WalkPadError::Discovery("no matching device found".to_string()))
    }
}

#[async_trait]
impl BleConnector for BtleplugConnector {
    async fn connect(&self, selector: &ScanSelector) -> Result<Arc<dyn BleSession>> {
        let adapter = self.adapter().await?;
        self.scan(&adapter, selector).await?;
        let peripheral = self.pick_peripheral(&adapter, selector).await?;
        debug!("connecting to {}", peripheral.address());
        peripheral.connect().await?;
        peripheral.discover_services().await?;
        Ok(Arc::new(BtleplugSession {
            adapter,
            peripheral,
        }))
    }

    fn supports_reconnect(&self) -> bool {
        true
    }

    async fn reconnect(&self, device_id: &str) -> Result<Option<Arc<dyn BleSession>>> {
        let adapter = self.adapter().await?;
        self.scan(&adapter, &ScanSelector::default()).await?;
        let peripheral = adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address().to_string() == device_id);
        let Some(peripheral) = peripheral else {
            return Ok(None);
        };
        debug!("reconnecting to {}", peripheral.address());
        peripheral.connect().await?;
        peripheral.discover_services().await?;
        Ok(Some(Arc::new(BtleplugSession {
            adapter,
            peripheral,
        })))
    }
}

struct BtleplugSession {
    adapter: Adapter,
    peripheral: Peripheral,
}

#[async_trait]
impl BleSession for BtleplugSession {
    fn device_id(&self) -> String {
        self.peripheral.address().to_string()
    }

    async fn primary_services(&self) -> Result<Vec<Arc<dyn BleService>>> {
        let services = self.peripheral.services();
        Ok(services
            .into_iter()
            .map(|service| {
                Arc::new(BtleplugService {
                    peripheral: self.peripheral.clone(),
                    service,
                }) as Arc<dyn BleService>
            })
            .collect())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn on_disconnect(&self, listener: DisconnectListener) -> Result<Option<Teardown>> {
        let mut events = self.adapter.events().await?;
        let id = self.peripheral.id();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(peer) = event {
                    if peer == id {
                        listener();
                    }
                }
            }
        });
        Ok(Some(Box::new(move || task.abort())))
    }
}

struct BtleplugService {
    peripheral: Peripheral,
    service: Service,
}

#[async_trait]
impl BleService for BtleplugService {
    fn uuid(&self) -> String {
        self.service.uuid.to_string()
    }

    async fn characteristics(&self) -> Result<Vec<Arc<dyn BleCharacteristic>>> {
        Ok(self
            .service
            .characteristics
            .iter()
            .cloned()
            .map(|characteristic| {
                Arc::new(BtleplugCharacteristic {
                    peripheral: self.peripheral.clone(),
                    characteristic,
                    notify_task: StdMutex::new(None),
                }) as Arc<dyn BleCharacteristic>
            })
            .collect())
    }
}

struct BtleplugCharacteristic {
    peripheral: Peripheral,
    characteristic: Characteristic,
    notify_task: StdMutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BleCharacteristic for BtleplugCharacteristic {
    fn uuid(&self) -> String {
        self.characteristic.uuid.to_string()
    }

    fn properties(&self) -> CharProps {
        let flags = self.characteristic.properties;
        CharProps {
            notify: flags.contains(CharPropFlags::NOTIFY),
            indicate: flags.contains(CharPropFlags::INDICATE),
            write: flags.contains(CharPropFlags::WRITE),
            write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        }
    }

    async fn write_with_response(&self, payload: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.characteristic, payload, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn start_notifications(&self, handler: NotificationHandler) -> Result<()> {
        self.peripheral.subscribe(&self.characteristic).await?;
        let mut stream = self.peripheral.notifications().await?;
        let uuid = self.characteristic.uuid;
        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                // hand out a fresh owned buffer per event, dropping empties
                if notification.uuid == uuid && !notification.value.is_empty() {
                    handler(notification.value);
                }
            }
        });
        let previous = self
            .notify_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_notifications(&self) -> Result<()> {
        let task = self
            .notify_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        if let Err(e) = self.peripheral.unsubscribe(&self.characteristic).await {
            warn!("failed to unsubscribe {}: {e}", self.characteristic.uuid);
            return Err(e.into());
        }
        Ok(())
    }
}
