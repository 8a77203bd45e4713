//! Two-key peer directory.
//!
//! Client calls name a peer by its socket address; completion events only
//! carry the sender's instance id. Both indices point at connection ids in
//! the connection arena and are guarded by separate locks.
//!
//! One instance can hold an inbound and an outbound connection at once, so
//! the instance index keeps every id in insertion order and resolves to the
//! newest one still present.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::Mutex;

use crate::nic::InstanceId;

/// Stable id of a connection in the arena.
pub type ConnId = u64;

#[derive(Debug, Default)]
pub struct PeerDirectory {
    by_addr: Mutex<HashMap<SocketAddr, ConnId>>,
    by_instance: Mutex<HashMap<InstanceId, Vec<ConnId>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts under both keys.
    pub fn insert(&self, addr: SocketAddr, instance: InstanceId, id: ConnId) {
        self.by_addr.lock().insert(addr, id);
        let mut by_instance = self.by_instance.lock();
        let ids = by_instance.entry(instance).or_default();
        ids.retain(|&known| known != id);
        ids.push(id);
    }

    /// Removes both keys if they still map to `id`.
    pub fn remove(&self, addr: SocketAddr, instance: InstanceId, id: ConnId) {
        {
            let mut by_addr = self.by_addr.lock();
            if by_addr.get(&addr) == Some(&id) {
                by_addr.remove(&addr);
            }
        }
        let mut by_instance = self.by_instance.lock();
        if let Some(ids) = by_instance.get_mut(&instance) {
            ids.retain(|&known| known != id);
            if ids.is_empty() {
                by_instance.remove(&instance);
            }
        }
    }

    pub fn by_addr(&self, addr: &SocketAddr) -> Option<ConnId> {
        self.by_addr.lock().get(addr).copied()
    }

    pub fn by_instance(&self, instance: InstanceId) -> Option<ConnId> {
        self.by_instance
            .lock()
            .get(&instance)
            .and_then(|ids| ids.last())
            .copied()
    }

    pub fn len(&self) -> usize {
        self.by_addr.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.by_addr.lock().clear();
        self.by_instance.lock().clear();
    }
}
