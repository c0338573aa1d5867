//! Stable identifiers and integrity digests for stored blobs.
//!
//! - [`ChunkId`] - 12-byte identifier of one addressable blob
//! - [`ChunkType`] - kind discriminator carried inside the id
//! - [`ContainerId`] - 64-bit stable digest of a container name
//! - [`ChunkHash`] - SHA-1 of a chunk's plaintext, zero-padded to 32 bytes
//!
//! All of these are immutable value types. Encodings are frozen: readers
//! and writers of the on-disk format must agree on them byte for byte.

use sha1::{Digest, Sha1};
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

/// Kind of data a chunk holds.
///
/// The discriminant is stored verbatim inside [`ChunkId`] and on disk,
/// so values are frozen and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ChunkType {
    /// Placeholder for the all-zero invalid id
    Invalid = 0,
    /// Package install/build manifest
    Manifest = 1,
    /// Serialized export bundle data
    ExportBundleData = 2,
    /// Bulk payload data
    BulkData = 3,
    /// Optional (streamable) bulk payload data
    OptionalBulkData = 4,
    /// Bulk payload that must be memory-mappable
    MemoryMappedBulkData = 5,
    /// Loader global metadata
    LoaderMeta = 6,
    /// Loader name table
    LoaderNames = 7,
    /// Loader name hash table
    LoaderNameHashes = 8,
    /// Per-container header blob
    ContainerHeader = 9,
}

impl ChunkType {
    /// Decode a type byte. Unknown values are rejected so a corrupt TOC
    /// cannot smuggle an unhandled discriminant into the type system.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ChunkType::Invalid),
            1 => Some(ChunkType::Manifest),
            2 => Some(ChunkType::ExportBundleData),
            3 => Some(ChunkType::BulkData),
            4 => Some(ChunkType::OptionalBulkData),
            5 => Some(ChunkType::MemoryMappedBulkData),
            6 => Some(ChunkType::LoaderMeta),
            7 => Some(ChunkType::LoaderNames),
            8 => Some(ChunkType::LoaderNameHashes),
            9 => Some(ChunkType::ContainerHeader),
            _ => None,
        }
    }
}

/// Identifier of one addressable blob inside a container.
///
/// Layout is 12 bytes: `{package_id: u64 LE, index: u16 LE, type: u8,
/// reserved: u8 = 0}`. Equality, ordering, and hashing are byte-wise over
/// the 12 bytes, which is exactly the order used for the sorted id array
/// in the TOC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId([u8; 12]);

impl ChunkId {
    /// Number of bytes in the on-disk encoding
    pub const ENCODED_SIZE: usize = 12;

    /// The all-zero invalid id
    pub const INVALID: ChunkId = ChunkId([0; 12]);

    /// Build an id from its components.
    pub fn new(package_id: u64, index: u16, chunk_type: ChunkType) -> Self {
        let mut bytes = [0u8; 12];
        bytes[0..8].copy_from_slice(&package_id.to_le_bytes());
        bytes[8..10].copy_from_slice(&index.to_le_bytes());
        bytes[10] = chunk_type as u8;
        ChunkId(bytes)
    }

    /// Reconstruct an id from its 12-byte encoding.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        ChunkId(bytes)
    }

    /// The 12-byte on-disk encoding.
    pub fn to_bytes(self) -> [u8; 12] {
        self.0
    }

    /// Package id component.
    pub fn package_id(self) -> u64 {
        u64::from_le_bytes(self.0[0..8].try_into().unwrap())
    }

    /// Sub-index component.
    pub fn index(self) -> u16 {
        u16::from_le_bytes(self.0[8..10].try_into().unwrap())
    }

    /// Type component. `None` if the stored byte is not a known type.
    pub fn chunk_type(self) -> Option<ChunkType> {
        ChunkType::from_u8(self.0[10])
    }

    /// True unless this is the all-zero invalid id.
    pub fn is_valid(self) -> bool {
        self != ChunkId::INVALID
    }

    /// Stable 64-bit hash of the id bytes: multiplicative mix with seed
    /// 5381 and multiplier 33. Identical on every platform and run.
    pub fn stable_hash(self) -> u64 {
        let mut hash: u64 = 5381;
        for b in self.0 {
            hash = hash.wrapping_mul(33).wrapping_add(u64::from(b));
        }
        hash
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// 64-bit identifier of a container, derived from its name.
///
/// The derivation is a stable digest (xxh3-64 of the UTF-8 name) so the
/// same name yields the same id across runs and platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(u64);

impl ContainerId {
    /// The zero invalid id
    pub const INVALID: ContainerId = ContainerId(0);

    /// Derive the id from a container name.
    pub fn from_name(name: &str) -> Self {
        ContainerId(xxh3_64(name.as_bytes()))
    }

    /// Wrap a raw id value (as read from a TOC header).
    pub fn from_value(value: u64) -> Self {
        ContainerId(value)
    }

    /// The raw 64-bit value.
    pub fn value(self) -> u64 {
        self.0
    }

    /// True unless this is the zero invalid id.
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Integrity digest of a chunk's plaintext.
///
/// 32 bytes on disk: a 20-byte SHA-1 followed by 12 zero bytes of
/// padding. Computed once at write time and stored in the TOC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkHash([u8; 32]);

impl ChunkHash {
    /// Number of bytes in the on-disk encoding
    pub const ENCODED_SIZE: usize = 32;

    /// Digest the given plaintext.
    pub fn from_data(data: &[u8]) -> Self {
        let digest: [u8; 20] = Sha1::digest(data).into();
        Self::from_sha1(digest)
    }

    /// Wrap an existing SHA-1 digest, zero-padding to 32 bytes.
    pub fn from_sha1(digest: [u8; 20]) -> Self {
        let mut bytes = [0u8; 32];
        bytes[0..20].copy_from_slice(&digest);
        ChunkHash(bytes)
    }

    /// Reconstruct from the 32-byte encoding.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ChunkHash(bytes)
    }

    /// The full 32-byte encoding.
    pub fn to_bytes(self) -> [u8; 32] {
        self.0
    }

    /// The leading 20 SHA-1 bytes.
    pub fn sha1_bytes(self) -> [u8; 20] {
        self.0[0..20].try_into().unwrap()
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.sha1_bytes() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
