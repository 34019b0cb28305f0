//! BLE Scanner Module
//!
//! Handles Bluetooth LE discovery of Powered Up hubs.

use crate::domain::models::{DiscoveredHub, ScannedDevice};
use crate::error::HubError;
use crate::infrastructure::bluetooth::BleScan;
use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Extra time a backend gets beyond the requested scan window
const SCAN_GRACE: Duration = Duration::from_secs(2);

/// Filters raw BLE peripherals down to hubs.
pub struct DiscoveryScanner {
    backend: Arc<dyn BleScan>,
    name_signature: String,
}

impl DiscoveryScanner {
    pub fn new(backend: Arc<dyn BleScan>, name_signature: impl Into<String>) -> Self {
        Self {
            backend,
            name_signature: name_signature.into(),
        }
    }

    /// Scan for up to `timeout` and return matching hubs, deduplicated by
    /// address, in the order first seen. Finding nothing is not an error.
    pub async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveredHub>, HubError> {
        info!("Scanning for {}s...", self.name_signature);

        let devices =
            match tokio::time::timeout(timeout + SCAN_GRACE, self.backend.discover(timeout)).await
            {
                Ok(result) => result?,
                Err(_) => {
                    warn!(
                        "BLE scan did not finish within {} ms",
                        (timeout + SCAN_GRACE).as_millis()
                    );
                    Vec::new()
                }
            };

        let hubs = self.filter(devices);
        info!("{} hubs found", hubs.len());
        Ok(hubs)
    }

    fn filter(&self, devices: Vec<ScannedDevice>) -> Vec<DiscoveredHub> {
        let mut seen = HashSet::new();
        devices
            .into_iter()
            .filter_map(|device| {
                let name = device.name?;
                if !name.contains(&self.name_signature) {
                    debug!("Ignoring {} ({})", name, device.address);
                    return None;
                }
                if !seen.insert(device.address.clone()) {
                    return None;
                }
                Some(DiscoveredHub {
                    identity: device.address,
                    advertised_name: name,
                })
            })
            .collect()
    }
}

/// Get the default Bluetooth adapter
pub async fn default_adapter() -> Result<Adapter, HubError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| HubError::ConnectionFailed {
            identity: "adapter".to_string(),
            reason: "no Bluetooth adapter found".to_string(),
        })
}

/// Scan backend using the host Bluetooth adapter.
#[derive(Default)]
pub struct BtleplugScanner;

#[async_trait]
impl BleScan for BtleplugScanner {
    async fn discover(&self, timeout: Duration) -> Result<Vec<ScannedDevice>, HubError> {
        let adapter = default_adapter().await?;

        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(timeout).await;

        let peripherals = adapter.peripherals().await?;
        let mut devices = Vec::with_capacity(peripherals.len());
        for peripheral in peripherals {
            let name = match peripheral.properties().await {
                Ok(props) => props.and_then(|p| p.local_name),
                Err(e) => {
                    debug!("No properties for {}: {}", peripheral.address(), e);
                    None
                }
            };
            devices.push(ScannedDevice {
                name,
                address: peripheral.address().to_string(),
            });
        }

        if let Err(e) = adapter.stop_scan().await {
            warn!("Failed to stop BLE scan: {}", e);
        }
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedScan(Vec<ScannedDevice>);

    #[async_trait]
    impl BleScan for FixedScan {
        async fn discover(&self, _timeout: Duration) -> Result<Vec<ScannedDevice>, HubError> {
            Ok(self.0.clone())
        }
    }

    struct StuckScan;

    #[async_trait]
    impl BleScan for StuckScan {
        async fn discover(&self, _timeout: Duration) -> Result<Vec<ScannedDevice>, HubError> {
            futures::future::pending::<()>().await;
            Ok(Vec::new())
        }
    }

    fn device(name: Option<&str>, address: &str) -> ScannedDevice {
        ScannedDevice {
            name: name.map(str::to_string),
            address: address.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_filters_and_dedupes_in_order() {
        let scanner = DiscoveryScanner::new(
            Arc::new(FixedScan(vec![
                device(Some("Smart Hub"), "B"),
                device(None, "X"),
                device(Some("JBL Flip"), "Y"),
                device(Some("Smart Hub XYZ"), "A"),
                device(Some("Smart Hub"), "B"),
            ])),
            "Smart Hub",
        );

        let hubs = scanner.scan(Duration::from_secs(1)).await.unwrap();
        let ids: Vec<_> = hubs.iter().map(|h| h.identity.as_str()).collect();
        assert_eq!(ids, ["B", "A"]);
        assert_eq!(hubs[1].advertised_name, "Smart Hub XYZ");
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_found_is_ok() {
        let scanner = DiscoveryScanner::new(Arc::new(FixedScan(Vec::new())), "Smart Hub");
        assert!(scanner
            .scan(Duration::from_secs(1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_backend_is_bounded() {
        let scanner = DiscoveryScanner::new(Arc::new(StuckScan), "Smart Hub");
        assert!(scanner
            .scan(Duration::from_secs(1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_signature() {
        let scanner = DiscoveryScanner::new(
            Arc::new(FixedScan(vec![
                device(Some("Smart Hub"), "A"),
                device(Some("Technic Hub"), "B"),
            ])),
            "Technic Hub",
        );
        let hubs = scanner.scan(Duration::from_secs(1)).await.unwrap();
        assert_eq!(hubs.len(), 1);
        assert_eq!(hubs[0].identity, "B");
    }
}
