//! Persisted hub registry.
//!
//! Maps stable BLE addresses to user-facing hub names. The file is a JSON
//! array in the same layout the discovery scripts always wrote, so an
//! existing `hub_mapping.json` keeps working.

use crate::domain::models::HubRecord;
use crate::error::HubError;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Result of a lenient load: the registry plus the problem that forced an
/// empty start, if any.
#[derive(Debug)]
pub struct RegistryLoad {
    pub registry: DeviceRegistry,
    pub recovered: Option<HubError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistry {
    path: PathBuf,
    records: Vec<HubRecord>,
}

impl DeviceRegistry {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Vec::new(),
        }
    }

    /// Load for the discovery path: missing or malformed storage yields an
    /// empty registry and the reason is handed back instead of raised.
    pub fn load(path: impl Into<PathBuf>) -> RegistryLoad {
        let path = path.into();
        match Self::load_strict(&path) {
            Ok(registry) => RegistryLoad {
                registry,
                recovered: None,
            },
            Err(err) => {
                warn!("{}; starting with an empty hub registry", err);
                RegistryLoad {
                    registry: Self::empty(path),
                    recovered: Some(err),
                }
            }
        }
    }

    /// Load for the run path: every storage problem is an error.
    pub fn load_strict(path: impl AsRef<Path>) -> Result<Self, HubError> {
        let path = path.as_ref();
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(HubError::RegistryMissing(path.to_path_buf()))
            }
            Err(e) => return Err(HubError::Io(e)),
        };

        let records: Vec<HubRecord> =
            serde_json::from_slice(&contents).map_err(|e| HubError::RegistryCorrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let mut registry = Self::empty(path);
        for record in records {
            if registry.get(&record.identity).is_some() {
                return Err(HubError::RegistryCorrupt {
                    path: path.to_path_buf(),
                    reason: format!("duplicate ble_id {}", record.identity),
                });
            }
            registry.records.push(record);
        }

        debug!("{} hubs loaded from {}", registry.len(), path.display());
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[HubRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, identity: &str) -> Option<&HubRecord> {
        self.records.iter().find(|r| r.identity == identity)
    }

    fn get_mut(&mut self, identity: &str) -> Result<&mut HubRecord, HubError> {
        self.records
            .iter_mut()
            .find(|r| r.identity == identity)
            .ok_or_else(|| HubError::NotFound(identity.to_string()))
    }

    /// Insert a newly seen hub. Returns `false` and changes nothing if the
    /// identity is already registered.
    pub fn upsert_discovered<F>(&mut self, identity: &str, default_name: F) -> bool
    where
        F: FnOnce(usize) -> String,
    {
        if self.get(identity).is_some() {
            return false;
        }
        let name = default_name(self.records.len());
        info!("Registering new hub {} as {}", identity, name);
        self.records.push(HubRecord::discovered(identity, name));
        true
    }

    pub fn confirm_name(&mut self, identity: &str, chosen_name: &str) -> Result<(), HubError> {
        let record = self.get_mut(identity)?;
        record.display_name = chosen_name.to_string();
        record.first_seen = false;
        Ok(())
    }

    pub fn touch_initiated(&mut self, identity: &str, now: NaiveDateTime) -> Result<(), HubError> {
        self.get_mut(identity)?.last_initiated = Some(now);
        Ok(())
    }

    /// Write the whole registry to a temporary file next to the target and
    /// rename it into place.
    pub fn save(&self) -> Result<(), HubError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.records
            .serialize(&mut ser)
            .map_err(|e| HubError::Io(e.into()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&buf)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| HubError::Io(e.error))?;

        debug!("{} hubs saved to {}", self.len(), self.path.display());
        Ok(())
    }
}

/// Placeholder name for the hub discovered when the registry already holds
/// `existing` entries.
pub fn default_hub_name(existing: usize) -> String {
    format!("train_{}", existing + 1)
}
