//! BLE Connection Module
//!
//! btleplug-backed hub link: finds the peripheral, opens the LWP3
//! characteristic, writes commands and routes port value notifications to
//! per-port subscribers.

use crate::error::HubError;
use crate::infrastructure::bluetooth::protocol::{self, Frame};
use crate::infrastructure::bluetooth::scanner::default_adapter;
use crate::infrastructure::bluetooth::{BleLink, LinkFactory};
use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Interval between peripheral list checks while looking for the hub
const FIND_POLL_MS: u64 = 200;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fans port value notifications out to one subscriber per port.
#[derive(Clone, Default)]
pub struct PortRouter {
    subscribers: Arc<Mutex<HashMap<u8, mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl PortRouter {
    /// Replaces any earlier subscriber on `port`.
    pub fn subscribe(&self, port: u8) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).insert(port, tx);
        rx
    }

    pub fn clear(&self) {
        lock(&self.subscribers).clear();
    }

    /// Route every port value in a notification buffer. Returns how many
    /// values reached a subscriber.
    pub fn route(&self, buffer: &[u8]) -> Result<usize, HubError> {
        let mut delivered = 0;
        for frame in protocol::parse_frames(buffer)? {
            match frame {
                Frame::PortValue { port, value } => {
                    let subscribers = lock(&self.subscribers);
                    if let Some(tx) = subscribers.get(&port) {
                        if tx.send(value).is_ok() {
                            delivered += 1;
                        }
                    }
                }
                other => debug!("Unrouted frame {:?}", other),
            }
        }
        Ok(delivered)
    }

    /// Route notifications until `notifications` ends, then drop every
    /// subscriber and flag the link closed.
    pub async fn pump<S>(&self, mut notifications: S, closed: watch::Sender<bool>)
    where
        S: Stream<Item = Vec<u8>> + Unpin,
    {
        while let Some(buffer) = notifications.next().await {
            if let Err(e) = self.route(&buffer) {
                warn!("Dropping notification: {}", e);
            }
        }
        self.clear();
        closed.send_replace(true);
    }
}

/// Stops an adapter scan when dropped, including when the connect attempt
/// is cancelled mid-search.
struct ScanGuard {
    adapter: Adapter,
    scanning: bool,
}

impl ScanGuard {
    async fn start(adapter: Adapter) -> Result<Self, HubError> {
        adapter.start_scan(ScanFilter::default()).await?;
        Ok(Self {
            adapter,
            scanning: true,
        })
    }

    async fn stop(mut self) {
        self.scanning = false;
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop BLE scan: {}", e);
        }
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        if !self.scanning {
            return;
        }
        let adapter = self.adapter.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = adapter.stop_scan().await {
                    warn!("Failed to stop BLE scan: {}", e);
                }
            });
        }
    }
}

/// A peripheral this link has started connecting to. The characteristic and
/// reader are filled in as the connect steps succeed.
struct Connection {
    peripheral: Peripheral,
    characteristic: Option<Characteristic>,
    reader: Option<JoinHandle<()>>,
}

pub struct BtleplugLink {
    connection: tokio::sync::Mutex<Option<Connection>>,
    router: PortRouter,
    closed: watch::Sender<bool>,
}

impl Default for BtleplugLink {
    fn default() -> Self {
        Self::new()
    }
}

impl BtleplugLink {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            connection: tokio::sync::Mutex::new(None),
            router: PortRouter::default(),
            closed,
        }
    }

    /// Scan until a peripheral with `address` shows up. The caller bounds
    /// this with its connection timeout.
    async fn find_peripheral(address: &str) -> Result<Peripheral, HubError> {
        let scan = ScanGuard::start(default_adapter().await?).await?;

        let found = loop {
            if let Some(p) = scan
                .adapter
                .peripherals()
                .await?
                .into_iter()
                .find(|p| p.address().to_string().eq_ignore_ascii_case(address))
            {
                break p;
            }
            tokio::time::sleep(Duration::from_millis(FIND_POLL_MS)).await;
        };

        scan.stop().await;
        Ok(found)
    }

    fn hub_characteristic(peripheral: &Peripheral) -> Result<Characteristic, HubError> {
        let parse = |s: &str| Uuid::parse_str(s).map_err(|e| HubError::Protocol(e.to_string()));
        let service = parse(protocol::HUB_SERVICE_UUID)?;
        let uuid = parse(protocol::HUB_CHAR_UUID)?;
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid && c.service_uuid == service)
            .ok_or_else(|| HubError::Protocol("hub characteristic not found".to_string()))
    }
}

#[async_trait]
impl BleLink for BtleplugLink {
    async fn connect(&self, address: &str) -> Result<(), HubError> {
        info!("Connecting to Bluetooth device: {}", address);

        // Step 1: Find the peripheral and remember it before connecting, so
        // disconnect() can tear down a half-open link
        let peripheral = Self::find_peripheral(address).await?;
        *self.connection.lock().await = Some(Connection {
            peripheral: peripheral.clone(),
            characteristic: None,
            reader: None,
        });
        peripheral.connect().await?;

        // Step 2: Locate the LWP3 characteristic
        peripheral.discover_services().await?;
        let characteristic = Self::hub_characteristic(&peripheral)?;

        // Step 3: Enable notifications and start routing them
        peripheral.subscribe(&characteristic).await?;
        let char_uuid = characteristic.uuid;
        let notifications = peripheral
            .notifications()
            .await?
            .filter_map(move |n| async move { (n.uuid == char_uuid).then_some(n.value) })
            .boxed();
        self.closed.send_replace(false);
        let router = self.router.clone();
        let closed = self.closed.clone();
        let reader = tokio::spawn(async move { router.pump(notifications, closed).await });

        match self.connection.lock().await.as_mut() {
            Some(connection) => {
                connection.characteristic = Some(characteristic);
                connection.reader = Some(reader);
            }
            // disconnected while connecting
            None => {
                reader.abort();
                return Err(HubError::LinkDropped(address.to_string()));
            }
        }
        info!("Hub {} connected", address);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), HubError> {
        let Some(connection) = self.connection.lock().await.take() else {
            return Ok(());
        };
        if let Some(reader) = connection.reader {
            reader.abort();
        }
        self.router.clear();
        self.closed.send_replace(true);

        let peripheral = connection.peripheral;
        if peripheral.is_connected().await.unwrap_or(true) {
            peripheral.disconnect().await?;
        }
        info!("Disconnected from {}", peripheral.address());
        Ok(())
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), HubError> {
        let guard = self.connection.lock().await;
        let (peripheral, characteristic) = guard
            .as_ref()
            .and_then(|c| Some((&c.peripheral, c.characteristic.as_ref()?)))
            .ok_or_else(|| HubError::LinkDropped("not connected".to_string()))?;

        // the hub takes one LWP3 message per write
        for frame in protocol::split_frames(&payload)? {
            peripheral
                .write(characteristic, frame, WriteType::WithResponse)
                .await
                .map_err(|e| {
                    warn!("Write to {} failed: {}", peripheral.address(), e);
                    HubError::LinkDropped(peripheral.address().to_string())
                })?;
        }
        Ok(())
    }

    async fn subscribe(&self, port: u8) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, HubError> {
        Ok(self.router.subscribe(port))
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Hands out a fresh btleplug link per session.
#[derive(Default)]
pub struct BtleplugLinkFactory;

impl LinkFactory for BtleplugLinkFactory {
    fn create_link(&self) -> Arc<dyn BleLink> {
        Arc::new(BtleplugLink::new())
    }
}
