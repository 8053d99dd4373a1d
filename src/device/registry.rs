//! Static catalogue of known sensor nodes.
//!
//! Membership comes from configuration (a `devices.txt` file with one
//! `<address> <name>` pair per line). Only the online/offline status changes
//! at runtime, refreshed by [`DeviceRegistry::scan`].

use crate::device::transport::{Transport, TransportError};
use crate::device::types::{DeviceAddress, DeviceId};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

/// Known devices and their last observed reachability.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceId, DeviceAddress>,
    online: RwLock<BTreeMap<DeviceId, bool>>,
}

impl DeviceRegistry {
    /// Build a registry from `(name, address)` pairs. All devices start offline.
    pub fn new(
        entries: impl IntoIterator<Item = (DeviceId, DeviceAddress)>,
    ) -> Result<Self, RegistryError> {
        let mut devices = BTreeMap::new();
        let mut addresses = BTreeSet::new();
        for (id, address) in entries {
            if !addresses.insert(address.clone()) {
                return Err(RegistryError::DuplicateAddress(address));
            }
            if devices.insert(id.clone(), address).is_some() {
                return Err(RegistryError::DuplicateName(id));
            }
        }
        let online = devices.keys().map(|id| (id.clone(), false)).collect();

        Ok(Self {
            devices,
            online: RwLock::new(online),
        })
    }

    /// Parse the `devices.txt` format.
    pub fn parse(content: &str) -> Result<Self, RegistryError> {
        let mut entries = Vec::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(address), Some(name), None) => {
                    entries.push((DeviceId::new(name), DeviceAddress::new(address)));
                }
                _ => {
                    return Err(RegistryError::Parse {
                        line: index + 1,
                        content: line.to_string(),
                    })
                }
            }
        }
        Self::new(entries)
    }

    /// Load the registry file at `path`.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| RegistryError::Io(e.to_string()))?;
        Self::parse(&content)
    }

    pub fn lookup(&self, id: &DeviceId) -> Result<&DeviceAddress, RegistryError> {
        self.devices
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    /// Known devices, ordered by name.
    pub fn entries(&self) -> impl Iterator<Item = (&DeviceId, &DeviceAddress)> {
        self.devices.iter()
    }

    pub fn ids(&self) -> BTreeSet<DeviceId> {
        self.devices.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn is_online(&self, id: &DeviceId) -> bool {
        self.read_online().get(id).copied().unwrap_or(false)
    }

    /// Status as of the last scan.
    pub fn online_status(&self) -> BTreeMap<DeviceId, bool> {
        self.read_online().clone()
    }

    pub fn online_ids(&self) -> BTreeSet<DeviceId> {
        self.read_online()
            .iter()
            .filter(|(_, online)| **online)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Run a discovery pass and refresh the online status of every device.
    ///
    /// Devices not observed within `timeout` are reported offline. Observed
    /// addresses that are not in the registry are ignored.
    pub async fn scan<T: Transport>(
        &self,
        transport: &T,
        timeout: Duration,
    ) -> Result<BTreeMap<DeviceId, bool>, RegistryError> {
        tracing::info!(timeout_secs = timeout.as_secs_f64(), "scanning for sensor nodes");
        let observed = transport
            .discover(timeout)
            .await
            .map_err(RegistryError::Scan)?;

        let status: BTreeMap<DeviceId, bool> = self
            .devices
            .iter()
            .map(|(id, address)| (id.clone(), observed.contains(address)))
            .collect();

        *self.online.write().unwrap_or_else(|e| e.into_inner()) = status.clone();

        let online = status.values().filter(|v| **v).count();
        tracing::info!(online, known = status.len(), "scan complete");
        Ok(status)
    }

    /// Check that every requested device is known and was online at the last scan.
    pub fn ensure_selectable(&self, ids: &BTreeSet<DeviceId>) -> Result<(), RegistryError> {
        for id in ids {
            self.lookup(id)?;
            if !self.is_online(id) {
                return Err(RegistryError::Offline(id.clone()));
            }
        }
        Ok(())
    }

    fn read_online(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<DeviceId, bool>> {
        self.online.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryError {
    Io(String),
    Parse { line: usize, content: String },
    DuplicateName(DeviceId),
    DuplicateAddress(DeviceAddress),
    NotFound(DeviceId),
    Offline(DeviceId),
    Scan(TransportError),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Io(e) => write!(f, "IO error: {e}"),
            RegistryError::Parse { line, content } => {
                write!(f, "line {line}: expected '<address> <name>', got '{content}'")
            }
            RegistryError::DuplicateName(id) => write!(f, "device name listed twice: {id}"),
            RegistryError::DuplicateAddress(addr) => {
                write!(f, "device address listed twice: {addr}")
            }
            RegistryError::NotFound(id) => write!(f, "no such device: {id}"),
            RegistryError::Offline(id) => write!(f, "device is offline: {id}"),
            RegistryError::Scan(e) => write!(f, "scan failed: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{SimDevice, SimulatedTransport};

    const DEVICES_TXT: &str = "\
# address            name
AA:AA:AA:AA:AA:01 J
aa:aa:aa:aa:aa:02 K

AA:AA:AA:AA:AA:03 L
";

    #[test]
    fn test_parse_registry_file() {
        let registry = DeviceRegistry::parse(DEVICES_TXT).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.lookup(&DeviceId::new("K")).unwrap(),
            &DeviceAddress::new("AA:AA:AA:AA:AA:02")
        );
        assert_eq!(
            registry.lookup(&DeviceId::new("Z")).unwrap_err(),
            RegistryError::NotFound(DeviceId::new("Z"))
        );
        assert!(!registry.is_online(&DeviceId::new("J")));
    }

    #[test]
    fn test_parse_rejects_malformed_and_duplicates() {
        let err = DeviceRegistry::parse("AA:01 J extra").unwrap_err();
        assert!(matches!(err, RegistryError::Parse { line: 1, .. }));

        let err = DeviceRegistry::parse("AA:01 J\nAA:02 J").unwrap_err();
        assert_eq!(err, RegistryError::DuplicateName(DeviceId::new("J")));

        let err = DeviceRegistry::parse("AA:01 J\naa:01 K").unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateAddress(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.txt");
        std::fs::write(&path, DEVICES_TXT).unwrap();

        let registry = DeviceRegistry::load(&path).unwrap();
        assert_eq!(registry.len(), 3);

        let missing = DeviceRegistry::load(&dir.path().join("nope.txt")).unwrap_err();
        assert!(matches!(missing, RegistryError::Io(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_marks_observed_devices_online() {
        let registry = DeviceRegistry::parse(DEVICES_TXT).unwrap();
        let transport = SimulatedTransport::new(vec![
            SimDevice::new("AA:AA:AA:AA:AA:01", b'J'),
            SimDevice::new("AA:AA:AA:AA:AA:03", b'L').offline(),
            SimDevice::new("FF:FF:FF:FF:FF:FF", b'X'),
        ]);

        let status = registry
            .scan(&transport, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(status.len(), 3);
        assert!(status[&DeviceId::new("J")]);
        assert!(!status[&DeviceId::new("K")]);
        assert!(!status[&DeviceId::new("L")]);
        assert_eq!(registry.online_ids(), BTreeSet::from([DeviceId::new("J")]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_selectable() {
        let registry = DeviceRegistry::parse(DEVICES_TXT).unwrap();
        let transport = SimulatedTransport::new(vec![SimDevice::new("AA:AA:AA:AA:AA:01", b'J')]);
        registry
            .scan(&transport, Duration::from_secs(1))
            .await
            .unwrap();

        assert!(registry
            .ensure_selectable(&BTreeSet::from([DeviceId::new("J")]))
            .is_ok());
        assert_eq!(
            registry
                .ensure_selectable(&BTreeSet::from([DeviceId::new("K")]))
                .unwrap_err(),
            RegistryError::Offline(DeviceId::new("K"))
        );
        assert_eq!(
            registry
                .ensure_selectable(&BTreeSet::from([DeviceId::new("Q")]))
                .unwrap_err(),
            RegistryError::NotFound(DeviceId::new("Q"))
        );
    }
}
