//! The shared state store (spec.md §4.3).
//!
//! One `DeviceState` per configured device, indexed by device id, guarded by
//! a single shared readers-writer lock. Every lock scope is bounded to the
//! in-memory update; callers never hold the lock across an HTTP call. The
//! canonical pattern used throughout `sync` and `engine` is: acquire read
//! lock -> collect a snapshot/candidates -> release -> call the transport
//! client -> acquire write lock -> commit -> release.

use std::collections::HashMap;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::model::DeviceState;

pub struct StateStore {
    devices: RwLock<HashMap<String, DeviceState>>,
}

impl StateStore {
    pub fn new(device_ids: impl IntoIterator<Item = String>) -> Self {
        let devices = device_ids.into_iter().map(|id| (id.clone(), DeviceState::new(id))).collect();
        StateStore { devices: RwLock::new(devices) }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, HashMap<String, DeviceState>> {
        self.devices.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, DeviceState>> {
        self.devices.write().await
    }

    /// Snapshot a single device's state under the read lock. Returns `None`
    /// if the device id is unknown (should not happen for configured
    /// devices, but callers should handle it gracefully rather than panic).
    pub async fn snapshot(&self, device_id: &str) -> Option<DeviceState> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// Replace one device's state wholesale (used by the sync loop after a
    /// successful refresh) under the write lock.
    pub async fn commit(&self, device_id: &str, new_state: DeviceState) {
        self.devices.write().await.insert(device_id.to_string(), new_state);
    }

    /// Apply `mutate` to one device's state under the write lock. Used by
    /// the event engine to commit the effects of a successful action.
    pub async fn mutate(&self, device_id: &str, mutate: impl FnOnce(&mut DeviceState)) {
        if let Some(state) = self.devices.write().await.get_mut(device_id) {
            mutate(state);
        }
    }

    /// All configured device ids, in insertion order is not guaranteed
    /// (backed by a `HashMap`) — callers that need a stable order should
    /// sort.
    pub async fn device_ids(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }
}
