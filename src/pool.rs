//! VM pool: internal IDs, UUIDs and display-port reservations
//!
//! Ports are probed by binding a TCP socket, scanned strictly ascending over
//! the configured range. A reserved port stays held until `remove` or
//! process exit.

use std::collections::HashMap;
use std::net::TcpListener;
use std::ops::RangeInclusive;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::store::{MetaStore, PoolRecord};
use crate::{Error, Result};

pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 5900..=6000;

#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub uuid: String,
    pub reserved_port: u16,
}

/// Allocates `(id, uuid, reserved_port)` tuples and persists them.
pub struct VmPool {
    store: MetaStore,
    port_range: RangeInclusive<u16>,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    next_id: u32,
    entries: HashMap<u32, PoolEntry>,
}

impl VmPool {
    pub fn new(store: MetaStore) -> Self {
        Self::with_port_range(store, DEFAULT_PORT_RANGE)
    }

    pub fn with_port_range(store: MetaStore, port_range: RangeInclusive<u16>) -> Self {
        Self {
            store,
            port_range,
            inner: Mutex::new(PoolInner {
                next_id: 1,
                entries: HashMap::new(),
            }),
        }
    }

    /// Reload persisted entries, e.g. after a restart. `next_id` continues
    /// above the highest recovered id.
    pub fn load(&self) -> Result<usize> {
        let records = self.store.all_pool_records()?;
        let mut inner = self.inner.lock();
        for (id, record) in &records {
            inner.entries.insert(
                *id,
                PoolEntry {
                    uuid: record.uuid.clone(),
                    reserved_port: record.reserved_port,
                },
            );
            if *id >= inner.next_id {
                inner.next_id = id + 1;
            }
        }
        Ok(records.len())
    }

    /// Atomically assign the next id, generate a UUID and reserve a free
    /// display port. On store failure the port reservation is released.
    pub fn allocate(&self, config_digest: &str) -> Result<u32> {
        let mut inner = self.inner.lock();

        let reserved: Vec<u16> = inner.entries.values().map(|e| e.reserved_port).collect();
        let port = find_available_port(self.port_range.clone(), &reserved)?;

        let id = inner.next_id;
        let uuid = Uuid::new_v4().to_string();

        let record = PoolRecord {
            uuid: uuid.clone(),
            reserved_port: port,
            config_digest: config_digest.to_string(),
        };
        if let Err(e) = self.store.put_pool_record(id, &record) {
            // nothing was inserted, so the port scan will hand this port out
            // again on the next call
            tracing::error!(id, port, error = %e, "Failed to persist pool record");
            return Err(e);
        }

        inner.next_id += 1;
        inner.entries.insert(
            id,
            PoolEntry {
                uuid,
                reserved_port: port,
            },
        );
        tracing::debug!(id, port, "Pool entry allocated");
        Ok(id)
    }

    /// UUID and reserved port for an id.
    pub fn meta(&self, id: u32) -> Option<(String, u16)> {
        self.inner
            .lock()
            .entries
            .get(&id)
            .map(|e| (e.uuid.clone(), e.reserved_port))
    }

    /// Free the entry and delete its persisted record.
    pub fn remove(&self, id: u32) -> bool {
        let existed = self.inner.lock().entries.remove(&id).is_some();
        if existed {
            if let Err(e) = self.store.delete_pool_record(id) {
                tracing::warn!(id, error = %e, "Failed to delete pool record");
            }
            tracing::debug!(id, "Pool entry removed");
        }
        existed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

/// Strictly ascending scan; a port counts as free when it is not reserved by
/// a live entry and a bind succeeds.
fn find_available_port(range: RangeInclusive<u16>, reserved: &[u16]) -> Result<u16> {
    for port in range.clone() {
        if reserved.contains(&port) {
            continue;
        }
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(Error::ResourceExhausted(format!(
        "no free display port in {}..={}",
        range.start(),
        range.end()
    )))
}
