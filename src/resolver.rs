//! Cache-backed translation of external device and zone keys to internal ids.
//!
//! Device keys are resolved through the store by their data topic; zone keys
//! are either a canonical UUID or a zone name (case-insensitive). Successful
//! lookups are cached for the life of the process. The cache never expires on
//! its own: callers that rename or re-home entities must invalidate explicitly.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tracing::debug;
use uuid::Uuid;

use crate::{error::StoreError, store::Store, transport::sensor_data_topic};

pub struct IdentityResolver {
    // ---
    store: Arc<dyn Store>,
    topic_prefix: String,
    devices: RwLock<HashMap<String, Uuid>>,
    zones: RwLock<HashMap<String, Uuid>>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn Store>, topic_prefix: impl Into<String>) -> Self {
        Self {
            store,
            topic_prefix: topic_prefix.into(),
            devices: RwLock::new(HashMap::new()),
            zones: RwLock::new(HashMap::new()),
        }
    }

    fn cached(cache: &RwLock<HashMap<String, Uuid>>, key: &str) -> Option<Uuid> {
        cache
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .copied()
    }

    fn remember(cache: &RwLock<HashMap<String, Uuid>>, key: &str, id: Uuid) {
        cache
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), id);
    }

    /// Internal id of the device publishing as `external_id`, or `None` when
    /// no device is registered on its data topic.
    pub async fn resolve_device(&self, external_id: &str) -> Result<Option<Uuid>, StoreError> {
        // ---
        if let Some(id) = Self::cached(&self.devices, external_id) {
            return Ok(Some(id));
        }

        let topic = sensor_data_topic(&self.topic_prefix, external_id);
        let Some(device) = self.store.get_device_by_topic(&topic).await? else {
            debug!(device = external_id, %topic, "Device not registered");
            return Ok(None);
        };

        Self::remember(&self.devices, external_id, device.id);
        debug!(device = external_id, id = %device.id, "Device resolved");
        Ok(Some(device.id))
    }

    /// Internal id of the zone named or identified by `external_id`.
    ///
    /// A key that parses as a UUID is taken as canonical and cached without a
    /// store round trip.
    pub async fn resolve_zone(&self, external_id: &str) -> Result<Option<Uuid>, StoreError> {
        // ---
        if let Some(id) = Self::cached(&self.zones, external_id) {
            return Ok(Some(id));
        }

        if let Ok(id) = Uuid::parse_str(external_id) {
            Self::remember(&self.zones, external_id, id);
            return Ok(Some(id));
        }

        let wanted = external_id.to_lowercase();
        let found = self
            .store
            .list_active_zones()
            .await?
            .into_iter()
            .find(|z| z.name.to_lowercase() == wanted);

        let Some(zone) = found else {
            debug!(zone = external_id, "Zone not found");
            return Ok(None);
        };

        Self::remember(&self.zones, external_id, zone.id);
        debug!(zone = external_id, id = %zone.id, "Zone resolved");
        Ok(Some(zone.id))
    }

    pub fn invalidate_device(&self, external_id: &str) {
        self.devices
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(external_id);
    }

    pub fn invalidate_zone(&self, external_id: &str) {
        self.zones
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(external_id);
    }

    /// Drop every cached zone key mapped to `id`, e.g. after a rename.
    pub fn invalidate_zone_id(&self, id: Uuid) {
        self.zones
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|_, cached| *cached != id);
    }

    pub fn clear(&self) {
        // ---
        self.devices.write().unwrap_or_else(|p| p.into_inner()).clear();
        self.zones.write().unwrap_or_else(|p| p.into_inner()).clear();
    }

    /// `(devices, zones)` currently cached.
    pub fn cache_sizes(&self) -> (usize, usize) {
        (
            self.devices.read().unwrap_or_else(|p| p.into_inner()).len(),
            self.zones.read().unwrap_or_else(|p| p.into_inner()).len(),
        )
    }
}
