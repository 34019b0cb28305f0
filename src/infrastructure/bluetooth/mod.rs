//! Bluetooth Module
//!
//! Turns BLE peripherals into Powered Up hub sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐        ┌───────────────────────────────────┐
//! │ DiscoveryScanner │        │            HubSession             │
//! │ (name filter,    │        │ (state machine, capabilities,     │
//! │  dedupe)         │        │  motor commands, sensor dispatch) │
//! └────────┬─────────┘        └─────────────────┬─────────────────┘
//!          │ BleScan                            │ BleLink
//!          ▼                                    ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │   btleplug backend (connection, scanner) | simulated backend  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - LWP3 frame encoding and parsing
//! - [`scanner`] - hub discovery over any [`BleScan`] backend
//! - [`connection`] - btleplug implementation of [`BleLink`]
//! - [`capability`] - motor and vision sensor capability handles
//! - [`session`] - hub session lifecycle and command/event protocol
//! - [`simulated`] - in-process hub simulation

pub mod capability;
pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod session;
pub mod simulated;

use crate::domain::models::ScannedDevice;
use crate::error::HubError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use scanner::DiscoveryScanner;
pub use session::{HubControl, HubSession, MotorHandle, StopHandle};

/// Enumerates nearby BLE peripherals.
#[async_trait]
pub trait BleScan: Send + Sync {
    /// List peripherals seen within `timeout`.
    async fn discover(&self, timeout: Duration) -> Result<Vec<ScannedDevice>, HubError>;
}

/// A GATT connection to one hub.
#[async_trait]
pub trait BleLink: Send + Sync {
    async fn connect(&self, address: &str) -> Result<(), HubError>;

    async fn disconnect(&self) -> Result<(), HubError>;

    /// Write one command payload. Resolves once the link accepted it.
    async fn send(&self, payload: Vec<u8>) -> Result<(), HubError>;

    /// Raw value updates for the capability on `port`. The receiver closes
    /// when the link goes away.
    async fn subscribe(&self, port: u8) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, HubError>;

    /// Resolves once the link has dropped.
    async fn closed(&self);
}

/// Creates a fresh, unconnected link for each hub session.
pub trait LinkFactory: Send + Sync {
    fn create_link(&self) -> Arc<dyn BleLink>;
}
