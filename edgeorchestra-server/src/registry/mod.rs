//! The authoritative record of every known worker.
//!
//! Pure data layer over [`DeviceStorage`]: registration mints the id, all
//! later operations are keyed by it. Device names are display labels, not
//! keys; registering the same name twice yields two rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use edgeorchestra_core::{DeviceCapabilities, DeviceId, DeviceMetrics, DeviceStatus};

use crate::storage::{DeviceStorage, StorageResult};

/// A device row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub device_model: String,
    pub os_version: String,
    pub capabilities: DeviceCapabilities,
    pub status: DeviceStatus,
    pub last_metrics: DeviceMetrics,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// The fields a worker provides when registering.
#[derive(Debug, Clone)]
pub struct Registration {
    pub name: String,
    pub device_model: String,
    pub os_version: String,
    pub capabilities: DeviceCapabilities,
    pub initial_metrics: DeviceMetrics,
}

/// The device registry operations.
#[derive(Clone)]
pub struct DeviceRegistry<T> {
    store: T,
}

impl<T> DeviceRegistry<T>
where
    T: DeviceStorage,
{
    pub fn new(store: T) -> Self {
        Self { store }
    }

    /// Registers a new device, minting a fresh id. The row starts `online`.
    pub async fn register(&mut self, registration: Registration) -> StorageResult<Device> {
        let now = Utc::now();
        let device = Device {
            id: DeviceId::generate(),
            name: registration.name,
            device_model: registration.device_model,
            os_version: registration.os_version,
            capabilities: registration.capabilities,
            status: DeviceStatus::Online,
            last_metrics: registration.initial_metrics,
            registered_at: now,
            last_seen_at: now,
        };
        self.store.insert_device(&device).await?;
        info!(device_id = %device.id, name = %device.name, "device registered");
        Ok(device)
    }

    /// Transitions a device to `offline`, preserving its history. Returns
    /// whether the device exists.
    pub async fn unregister(&mut self, id: &DeviceId) -> StorageResult<bool> {
        let known = self
            .store
            .set_device_status(id, DeviceStatus::Offline)
            .await?;
        if known {
            info!(device_id = %id, "device unregistered");
        }
        Ok(known)
    }

    pub async fn get(&mut self, id: &DeviceId) -> StorageResult<Option<Device>> {
        self.store.device(id).await
    }

    pub async fn list(&mut self, status: Option<DeviceStatus>) -> StorageResult<Vec<Device>> {
        self.store.list_devices(status).await
    }

    /// Records a heartbeat observation on the device row.
    ///
    /// A device in `training` stays `training`; everything else becomes
    /// `online` again (a heartbeat proves the device is reachable). Returns
    /// the updated row, or `None` for an unknown id.
    pub async fn touch(
        &mut self,
        id: &DeviceId,
        metrics: &DeviceMetrics,
    ) -> StorageResult<Option<Device>> {
        let current = match self.store.device(id).await? {
            Some(device) => device,
            None => return Ok(None),
        };
        let status = match current.status {
            DeviceStatus::Training => DeviceStatus::Training,
            _ => DeviceStatus::Online,
        };
        let seen_at = Utc::now();
        self.store.touch_device(id, metrics, status, seen_at).await?;
        debug!(device_id = %id, status = %status, "device touched");
        Ok(Some(Device {
            status,
            last_metrics: metrics.clone(),
            last_seen_at: seen_at,
            ..current
        }))
    }

    /// Sets the status of a device row. Returns whether the row exists.
    pub async fn set_status(
        &mut self,
        id: &DeviceId,
        status: DeviceStatus,
    ) -> StorageResult<bool> {
        self.store.set_device_status(id, status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    fn registration(name: &str) -> Registration {
        Registration {
            name: name.to_string(),
            device_model: "iPhone15,2".into(),
            os_version: "17.4".into(),
            capabilities: DeviceCapabilities::default(),
            initial_metrics: DeviceMetrics::default(),
        }
    }

    #[tokio::test]
    async fn test_register_creates_online_row() {
        let mut registry = DeviceRegistry::new(InMemoryStore::new());
        let device = registry.register(registration("kitchen-ipad")).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);

        let row = registry.get(&device.id).await.unwrap().unwrap();
        assert_eq!(row, device);
    }

    #[tokio::test]
    async fn test_same_name_twice_yields_two_rows() {
        let mut registry = DeviceRegistry::new(InMemoryStore::new());
        let first = registry.register(registration("twin")).await.unwrap();
        let second = registry.register(registration("twin")).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(registry.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unregister_preserves_history() {
        let mut registry = DeviceRegistry::new(InMemoryStore::new());
        let device = registry.register(registration("old-phone")).await.unwrap();
        assert!(registry.unregister(&device.id).await.unwrap());

        let row = registry.get(&device.id).await.unwrap().unwrap();
        assert_eq!(row.status, DeviceStatus::Offline);
        assert!(!registry.unregister(&DeviceId::generate()).await.unwrap());
    }

    #[tokio::test]
    async fn test_touch_keeps_training_status() {
        let mut registry = DeviceRegistry::new(InMemoryStore::new());
        let device = registry.register(registration("busy")).await.unwrap();
        registry
            .set_status(&device.id, DeviceStatus::Training)
            .await
            .unwrap();

        let row = registry
            .touch(&device.id, &DeviceMetrics::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, DeviceStatus::Training);
    }

    #[tokio::test]
    async fn test_touch_revives_offline_device() {
        let mut registry = DeviceRegistry::new(InMemoryStore::new());
        let device = registry.register(registration("flaky")).await.unwrap();
        registry.unregister(&device.id).await.unwrap();

        let row = registry
            .touch(&device.id, &DeviceMetrics::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, DeviceStatus::Online);
        assert!(registry
            .touch(&DeviceId::generate(), &DeviceMetrics::default())
            .await
            .unwrap()
            .is_none());
    }
}
