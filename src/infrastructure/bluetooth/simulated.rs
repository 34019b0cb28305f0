//! Simulated hubs
//!
//! An in-process stand-in for the BLE radio. Records every payload a session
//! writes, lets callers push sensor values and drop the link, and can replay
//! a timed script of sensor values. Backs the `--simulate` dry-run mode.

use crate::domain::models::ScannedDevice;
use crate::error::HubError;
use crate::infrastructure::bluetooth::connection::PortRouter;
use crate::infrastructure::bluetooth::protocol::{self, Frame};
use crate::infrastructure::bluetooth::{BleLink, BleScan, LinkFactory};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Timed sensor values a simulated hub plays back once subscribed.
#[derive(Debug, Clone, Default)]
pub struct SensorScript {
    pub port: u8,
    pub steps: Vec<(Duration, Vec<u8>)>,
}

/// How a simulated hub misbehaves.
#[derive(Debug, Clone, Default)]
struct Behavior {
    connect_failure: Option<String>,
    write_failure: Option<String>,
    connect_delay: Option<Duration>,
    script: Option<SensorScript>,
}

struct Inner {
    behavior: Behavior,
    address: Mutex<Option<String>>,
    connected: AtomicBool,
    disconnects: AtomicUsize,
    sent: Mutex<Vec<Vec<u8>>>,
    router: PortRouter,
    closed: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct SimulatedHub {
    inner: Arc<Inner>,
}

impl Default for SimulatedHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHub {
    pub fn new() -> Self {
        Self::build(Behavior::default())
    }

    /// A hub whose connection attempts always fail with `reason`.
    pub fn unreachable(reason: &str) -> Self {
        Self::build(Behavior {
            connect_failure: Some(reason.to_string()),
            ..Behavior::default()
        })
    }

    /// A hub that accepts the connection but rejects every write.
    pub fn rejecting_writes(reason: &str) -> Self {
        Self::build(Behavior {
            write_failure: Some(reason.to_string()),
            ..Behavior::default()
        })
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        Self::build(Behavior {
            connect_delay: Some(delay),
            ..self.inner.behavior.clone()
        })
    }

    pub fn with_script(self, script: SensorScript) -> Self {
        Self::build(Behavior {
            script: Some(script),
            ..self.inner.behavior.clone()
        })
    }

    fn build(behavior: Behavior) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                behavior,
                address: Mutex::new(None),
                connected: AtomicBool::new(false),
                disconnects: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
                router: PortRouter::default(),
                closed,
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// How many times a session asked this hub to disconnect.
    pub fn disconnects(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    /// Send a Port Value notification for `port`, as the hub would. Returns
    /// false if nothing is listening.
    pub fn notify(&self, port: u8, value: &[u8]) -> bool {
        self.inner
            .router
            .route(&protocol::encode_port_value(port, value))
            .is_ok_and(|delivered| delivered > 0)
    }

    /// Simulate the hub going out of range.
    pub fn drop_link(&self) {
        info!("Simulated link dropped");
        self.close();
    }

    fn close(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.router.clear();
        self.inner.closed.send_replace(true);
    }

    /// Every payload written, in order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        lock(&self.inner.sent).clone()
    }

    /// Parsed frames of each write, one entry per write.
    pub fn sent_commands(&self) -> Vec<Vec<Frame>> {
        self.sent()
            .iter()
            .filter_map(|payload| protocol::parse_frames(payload).ok())
            .collect()
    }

    /// All parsed frames, flattened.
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent_commands().into_iter().flatten().collect()
    }

    fn play_script(&self, script: SensorScript) {
        let hub = self.clone();
        tokio::spawn(async move {
            for (delay, value) in script.steps {
                tokio::time::sleep(delay).await;
                if !hub.notify(script.port, &value) {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl BleLink for SimulatedHub {
    async fn connect(&self, address: &str) -> Result<(), HubError> {
        if let Some(delay) = self.inner.behavior.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.inner.behavior.connect_failure {
            return Err(HubError::ConnectionFailed {
                identity: address.to_string(),
                reason: reason.clone(),
            });
        }
        *lock(&self.inner.address) = Some(address.to_string());
        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner.closed.send_replace(false);
        debug!("Simulated hub {} connected", address);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), HubError> {
        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        self.close();
        Ok(())
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), HubError> {
        let address = || lock(&self.inner.address).clone().unwrap_or_default();
        if !self.is_connected() {
            return Err(HubError::LinkDropped(address()));
        }
        if let Some(reason) = &self.inner.behavior.write_failure {
            return Err(HubError::Protocol(format!("{}: {}", address(), reason)));
        }
        debug!("Simulated write {:02X?}", payload);
        lock(&self.inner.sent).push(payload);
        Ok(())
    }

    async fn subscribe(&self, port: u8) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, HubError> {
        let rx = self.inner.router.subscribe(port);
        if let Some(script) = self.inner.behavior.script.as_ref().filter(|s| s.port == port) {
            self.play_script(script.clone());
        }
        Ok(rx)
    }

    async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// A set of simulated hubs that answers scans and hands out links.
#[derive(Clone, Default)]
pub struct SimulatedFleet {
    devices: Vec<ScannedDevice>,
    hubs: Arc<Mutex<HashMap<String, SimulatedHub>>>,
}

impl SimulatedFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise a peripheral. `hub` is what a session gets when it links to
    /// `address`.
    pub fn with_device(mut self, name: Option<&str>, address: &str, hub: SimulatedHub) -> Self {
        self.devices.push(ScannedDevice {
            name: name.map(str::to_string),
            address: address.to_string(),
        });
        lock(&self.hubs).insert(address.to_string(), hub);
        self
    }

    /// Demo fleet for dry runs: one train that sees green, yellow then blue.
    pub fn demo() -> Self {
        let script = SensorScript {
            port: 1,
            steps: vec![
                (Duration::from_secs(1), vec![6]),
                (Duration::from_secs(2), vec![7]),
                (Duration::from_secs(2), vec![6]),
                (Duration::from_secs(2), vec![3]),
            ],
        };
        Self::new().with_device(
            Some("Smart Hub"),
            "90:84:2B:00:00:01",
            SimulatedHub::new().with_script(script),
        )
    }

    pub fn hub(&self, address: &str) -> Option<SimulatedHub> {
        lock(&self.hubs).get(address).cloned()
    }
}

#[async_trait]
impl BleScan for SimulatedFleet {
    async fn discover(&self, timeout: Duration) -> Result<Vec<ScannedDevice>, HubError> {
        debug!("Simulated scan for {} ms", timeout.as_millis());
        Ok(self.devices.clone())
    }
}

impl LinkFactory for SimulatedFleet {
    fn create_link(&self) -> Arc<dyn BleLink> {
        Arc::new(FleetLink {
            fleet: self.clone(),
            active: Mutex::new(None),
        })
    }
}

/// Link handed out by a fleet; binds to the simulated hub on connect.
struct FleetLink {
    fleet: SimulatedFleet,
    active: Mutex<Option<SimulatedHub>>,
}

impl FleetLink {
    fn active(&self) -> Result<SimulatedHub, HubError> {
        lock(&self.active)
            .clone()
            .ok_or_else(|| HubError::LinkDropped("not connected".to_string()))
    }
}

#[async_trait]
impl BleLink for FleetLink {
    async fn connect(&self, address: &str) -> Result<(), HubError> {
        let hub = self
            .fleet
            .hub(address)
            .ok_or_else(|| HubError::ConnectionFailed {
                identity: address.to_string(),
                reason: "no such peripheral in range".to_string(),
            })?;
        hub.connect(address).await?;
        *lock(&self.active) = Some(hub);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), HubError> {
        let active = lock(&self.active).take();
        match active {
            Some(hub) => hub.disconnect().await,
            None => Ok(()),
        }
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), HubError> {
        self.active()?.send(payload).await
    }

    async fn subscribe(&self, port: u8) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, HubError> {
        self.active()?.subscribe(port).await
    }

    async fn closed(&self) {
        match self.active() {
            Ok(hub) => hub.closed().await,
            Err(_) => futures::future::pending::<()>().await,
        }
    }
}
