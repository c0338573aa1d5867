//! Mount table and encryption key registry.
//!
//! Chunk lookup walks mounts in descending order; the first container
//! holding the chunk wins, so a higher-order mount shadows lower ones
//! for the ids they share. Equal orders resolve to the most recent
//! mount.

use iostore_container::{AesKey, ContainerReader, EncryptionKeyProvider};
use iostore_core::{ChunkId, ContainerId, Error, Result};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use uuid::Uuid;

/// AES keys by GUID; containers reference their key through the GUID in
/// the TOC header.
#[derive(Default)]
pub struct KeyRegistry {
    keys: RwLock<FxHashMap<Uuid, AesKey>>,
}

impl KeyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        KeyRegistry::default()
    }

    /// Register (or replace) the key for `guid`.
    pub fn register(&self, guid: Uuid, key: AesKey) {
        self.keys.write().insert(guid, key);
    }

    /// True when a key is registered for `guid`.
    pub fn contains(&self, guid: &Uuid) -> bool {
        self.keys.read().contains_key(guid)
    }
}

impl EncryptionKeyProvider for KeyRegistry {
    fn key_for(&self, guid: &Uuid) -> Option<AesKey> {
        self.keys.read().get(guid).copied()
    }
}

struct Mount {
    order: i32,
    name: String,
    reader: Arc<ContainerReader>,
}

/// Summary of one mounted container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedContainerInfo {
    /// Container id
    pub container_id: ContainerId,
    /// Name the container was mounted under
    pub name: String,
    /// Mount order (higher shadows lower)
    pub order: i32,
    /// Number of chunks the container holds
    pub chunk_count: usize,
}

/// Ordered set of mounted containers.
///
/// Readers stay alive through their `Arc` while in-flight requests hold
/// them, so unmounting never interrupts a read already dispatched.
#[derive(Default)]
pub struct MountTable {
    mounts: RwLock<Vec<Mount>>,
}

impl MountTable {
    /// An empty table.
    pub fn new() -> Self {
        MountTable::default()
    }

    /// Add a container at the given order. A container id can be mounted
    /// at most once.
    pub fn mount(&self, reader: Arc<ContainerReader>, order: i32) -> Result<()> {
        let container_id = reader.container_id();
        let mut mounts = self.mounts.write();
        if mounts.iter().any(|m| m.reader.container_id() == container_id) {
            return Err(Error::InvalidParameter(format!(
                "container {} is already mounted",
                container_id
            )));
        }
        // Descending by order; equal orders keep the newest first
        let at = mounts.partition_point(|m| m.order > order);
        mounts.insert(
            at,
            Mount {
                order,
                name: reader.name().to_string(),
                reader,
            },
        );
        Ok(())
    }

    /// Remove a container. Returns its reader so the caller can publish
    /// the unmount event.
    pub fn unmount(&self, container_id: ContainerId) -> Result<Arc<ContainerReader>> {
        let mut mounts = self.mounts.write();
        let at = mounts
            .iter()
            .position(|m| m.reader.container_id() == container_id)
            .ok_or_else(|| {
                Error::InvalidParameter(format!("container {} is not mounted", container_id))
            })?;
        Ok(mounts.remove(at).reader)
    }

    /// The highest-order container holding `chunk_id`.
    pub fn resolve(&self, chunk_id: ChunkId) -> Option<Arc<ContainerReader>> {
        self.mounts
            .read()
            .iter()
            .find(|m| m.reader.contains(chunk_id))
            .map(|m| Arc::clone(&m.reader))
    }

    /// The mounted container with the given id.
    pub fn find(&self, container_id: ContainerId) -> Option<Arc<ContainerReader>> {
        self.mounts
            .read()
            .iter()
            .find(|m| m.reader.container_id() == container_id)
            .map(|m| Arc::clone(&m.reader))
    }

    /// All mounts in lookup order.
    pub fn list(&self) -> Vec<MountedContainerInfo> {
        self.mounts
            .read()
            .iter()
            .map(|m| MountedContainerInfo {
                container_id: m.reader.container_id(),
                name: m.name.clone(),
                order: m.order,
                chunk_count: m.reader.chunk_count(),
            })
            .collect()
    }

    /// Number of mounted containers.
    pub fn len(&self) -> usize {
        self.mounts.read().len()
    }

    /// True when nothing is mounted.
    pub fn is_empty(&self) -> bool {
        self.mounts.read().is_empty()
    }
}
