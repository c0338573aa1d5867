//! On-disk TOC layout (format version 1), parse and serialize.
//!
//! The TOC file holds all framing for a container. Sections are written
//! back to back with no inter-section padding, in this order:
//!
//! 1. Header (88 bytes, see [`TocHeader`])
//! 2. Sorted chunk id array (12 B per chunk)
//! 3. Offset-and-length array (32 B per chunk)
//! 4. Per-chunk metadata: hash + flags (33 B per chunk)
//! 5. Compression block array (25 B per block)
//! 6. Compression method name table (32 B per named method)
//! 7. If signed: per-block SHA-1 array, then length-prefixed RSA signature
//!    over SHA-1 of everything before the signature
//! 8. If indexed: directory index blob (encrypted when the container is)
//!
//! All integers are little-endian. The version byte selects the layout;
//! only version 1 exists.

use crate::crypto;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use iostore_core::{ChunkHash, ChunkId, ContainerId, Error, Result};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::io::{Cursor, Read, Write};
use uuid::Uuid;

/// Magic bytes at the start of every TOC file.
pub const TOC_MAGIC: [u8; 8] = *b"IOSTOC01";

/// Current (and only) TOC format version.
pub const TOC_VERSION: u32 = 1;

/// Serialized header size in bytes.
pub const TOC_HEADER_SIZE: usize = 88;

/// Serialized size of one offset-and-length entry.
pub const CHUNK_OFFSET_LENGTH_SIZE: usize = 32;

/// Serialized size of one per-chunk metadata entry.
pub const CHUNK_META_SIZE: usize = 33;

/// Serialized size of one compression block entry.
pub const COMPRESSION_BLOCK_SIZE: usize = 25;

/// Serialized size of one compression method name table entry.
pub const METHOD_NAME_SIZE: usize = 32;

/// Per-chunk flag: every block is stored raw; readers skip decompression.
pub const CHUNK_FLAG_FORCE_UNCOMPRESSED: u8 = 1;

/// Per-chunk flag: chunk is aligned for memory mapping.
pub const CHUNK_FLAG_MEMORY_MAPPED: u8 = 2;

/// Container feature flags stored in the TOC header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContainerFlags(u32);

impl ContainerFlags {
    const COMPRESSED: u32 = 1;
    const ENCRYPTED: u32 = 2;
    const SIGNED: u32 = 4;
    const INDEXED: u32 = 8;
    const ALL: u32 = 0xF;

    /// Flags from a raw header value. Unknown bits are rejected.
    pub fn from_bits(bits: u32) -> Option<Self> {
        (bits & !Self::ALL == 0).then_some(ContainerFlags(bits))
    }

    /// The raw header value.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// At least one chunk uses a compression codec.
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Blocks (and the directory index) are AES encrypted.
    pub fn is_encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    /// The TOC carries per-block digests and an RSA signature.
    pub fn is_signed(self) -> bool {
        self.0 & Self::SIGNED != 0
    }

    /// The TOC carries a directory index.
    pub fn is_indexed(self) -> bool {
        self.0 & Self::INDEXED != 0
    }

    /// Set the compressed bit.
    pub fn with_compressed(self) -> Self {
        ContainerFlags(self.0 | Self::COMPRESSED)
    }

    /// Set the encrypted bit.
    pub fn with_encrypted(self) -> Self {
        ContainerFlags(self.0 | Self::ENCRYPTED)
    }

    /// Set the signed bit.
    pub fn with_signed(self) -> Self {
        ContainerFlags(self.0 | Self::SIGNED)
    }

    /// Set the indexed bit.
    pub fn with_indexed(self) -> Self {
        ContainerFlags(self.0 | Self::INDEXED)
    }
}

/// Fixed-size TOC header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocHeader {
    /// Stable id derived from the container name
    pub container_id: ContainerId,
    /// Feature flags
    pub flags: ContainerFlags,
    /// Number of chunks in the container
    pub chunk_count: u32,
    /// Number of partition data files
    pub partition_count: u32,
    /// Maximum partition size configured at write time (0 = unlimited)
    pub partition_size: u64,
    /// Uncompressed block size used when splitting chunks
    pub compression_block_size: u32,
    /// Alignment of block starts within a partition (0 = packed)
    pub compression_block_alignment: u32,
    /// Alignment required for memory-mapped chunks
    pub memory_mapping_alignment: u32,
    /// Total number of compression blocks
    pub compression_block_count: u32,
    /// Number of named compression methods (codec 0 is implicit)
    pub compression_method_count: u32,
    /// Size in bytes of the trailing directory index blob
    pub directory_index_size: u32,
    /// GUID identifying the AES key for encrypted containers
    pub encryption_key_guid: Uuid,
}

impl TocHeader {
    fn serialize(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_all(&TOC_MAGIC)?;
        out.write_u32::<LittleEndian>(TOC_VERSION)?;
        out.write_u64::<LittleEndian>(self.container_id.value())?;
        out.write_u32::<LittleEndian>(self.flags.bits())?;
        out.write_u32::<LittleEndian>(self.chunk_count)?;
        out.write_u32::<LittleEndian>(self.partition_count)?;
        out.write_u64::<LittleEndian>(self.partition_size)?;
        out.write_u32::<LittleEndian>(self.compression_block_size)?;
        out.write_u32::<LittleEndian>(self.compression_block_alignment)?;
        out.write_u32::<LittleEndian>(self.memory_mapping_alignment)?;
        out.write_u32::<LittleEndian>(self.compression_block_count)?;
        out.write_u32::<LittleEndian>(self.compression_method_count)?;
        out.write_u32::<LittleEndian>(self.directory_index_size)?;
        out.write_all(self.encryption_key_guid.as_bytes())?;
        out.write_all(&[0u8; 8])?;
        Ok(())
    }

    fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut magic = [0u8; 8];
        read_exact(cursor, &mut magic, "header magic")?;
        if magic != TOC_MAGIC {
            return Err(Error::CorruptToc(format!("bad magic {:02x?}", magic)));
        }
        let version = read_u32(cursor, "header version")?;
        if version != TOC_VERSION {
            return Err(Error::CorruptToc(format!(
                "unsupported TOC version {}",
                version
            )));
        }
        let container_id = ContainerId::from_value(read_u64(cursor, "container id")?);
        let flags_bits = read_u32(cursor, "container flags")?;
        let flags = ContainerFlags::from_bits(flags_bits)
            .ok_or_else(|| Error::CorruptToc(format!("unknown flag bits {:#x}", flags_bits)))?;
        let chunk_count = read_u32(cursor, "chunk count")?;
        let partition_count = read_u32(cursor, "partition count")?;
        let partition_size = read_u64(cursor, "partition size")?;
        let compression_block_size = read_u32(cursor, "block size")?;
        let compression_block_alignment = read_u32(cursor, "block alignment")?;
        let memory_mapping_alignment = read_u32(cursor, "mapping alignment")?;
        let compression_block_count = read_u32(cursor, "block count")?;
        let compression_method_count = read_u32(cursor, "method count")?;
        let directory_index_size = read_u32(cursor, "index size")?;
        let mut guid = [0u8; 16];
        read_exact(cursor, &mut guid, "key guid")?;
        let mut reserved = [0u8; 8];
        read_exact(cursor, &mut reserved, "header reserved")?;

        if compression_block_size == 0 {
            return Err(Error::CorruptToc("zero compression block size".to_string()));
        }
        if partition_count == 0 {
            return Err(Error::CorruptToc("zero partition count".to_string()));
        }

        Ok(TocHeader {
            container_id,
            flags,
            chunk_count,
            partition_count,
            partition_size,
            compression_block_size,
            compression_block_alignment,
            memory_mapping_alignment,
            compression_block_count,
            compression_method_count,
            directory_index_size,
            encryption_key_guid: Uuid::from_bytes(guid),
        })
    }
}

/// Location and logical size of one chunk.
///
/// A chunk's blocks are contiguous on disk and never span partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOffsetLength {
    /// Partition file holding the chunk's blocks
    pub partition_index: u32,
    /// Offset of the first block within the partition
    pub offset: u64,
    /// Uncompressed chunk size in bytes
    pub uncompressed_size: u64,
    /// Index of the chunk's first entry in the block array
    pub first_block: u32,
    /// Number of blocks (0 for an empty chunk)
    pub block_count: u32,
}

/// Per-chunk integrity and behavior metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMeta {
    /// SHA-1 of the chunk's full plaintext, zero padded to 32 bytes
    pub hash: ChunkHash,
    /// `CHUNK_FLAG_*` bits
    pub flags: u8,
}

/// One fixed-size unit of compression and encryption within a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionBlockEntry {
    /// Offset of the stored bytes within the owning chunk's partition
    pub offset: u64,
    /// Compressed payload size before encryption padding
    pub compressed_size: u32,
    /// Plaintext size after decompression
    pub uncompressed_size: u32,
    /// 0 = uncompressed; k >= 1 refers to method name table entry k-1
    pub codec_index: u8,
}

impl CompressionBlockEntry {
    /// Bytes the block occupies on disk: compressed size, rounded up to
    /// the AES boundary when the container is encrypted.
    pub fn stored_size(&self, encrypted: bool) -> u64 {
        if encrypted {
            crypto::aligned_to_aes(self.compressed_size as usize) as u64
        } else {
            u64::from(self.compressed_size)
        }
    }
}

/// Signature section: one SHA-1 per block over the on-disk (post
/// encryption) bytes, plus an RSA signature over the rest of the TOC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocSignatures {
    /// Per-block digests, indexed like the block array
    pub block_hashes: Vec<[u8; 20]>,
    /// RSA PKCS#1 v1.5 signature bytes
    pub toc_signature: Vec<u8>,
}

/// Fully parsed (or about to be serialized) TOC.
#[derive(Debug, Clone)]
pub struct TocResource {
    /// Fixed header
    pub header: TocHeader,
    /// Sorted chunk id array
    pub chunk_ids: Vec<ChunkId>,
    /// Offset-and-length entries, parallel to `chunk_ids`
    pub offsets: Vec<ChunkOffsetLength>,
    /// Per-chunk metadata, parallel to `chunk_ids`
    pub metas: Vec<ChunkMeta>,
    /// Global block array; chunks reference ranges of it
    pub blocks: Vec<CompressionBlockEntry>,
    /// Named compression methods; codec index k >= 1 maps to `methods[k-1]`
    pub methods: Vec<String>,
    /// Signature section, present when the signed flag is set
    pub signatures: Option<TocSignatures>,
    /// Raw directory index blob (encrypted when the container is)
    pub directory_index: Vec<u8>,
}

impl TocResource {
    /// Binary search the sorted chunk id array.
    pub fn chunk_index(&self, chunk_id: ChunkId) -> Option<usize> {
        self.chunk_ids.binary_search(&chunk_id).ok()
    }

    /// Serialize the TOC, signing it when `signing_key` is provided and
    /// the signed flag is set. The signature covers SHA-1 of every byte
    /// before the signature itself (header, arrays, method table, and the
    /// per-block digest array).
    pub fn serialize(&self, signing_key: Option<&RsaPrivateKey>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.header.serialize(&mut out)?;

        for id in &self.chunk_ids {
            out.write_all(&id.to_bytes())?;
        }
        for entry in &self.offsets {
            out.write_u32::<LittleEndian>(entry.partition_index)?;
            out.write_u64::<LittleEndian>(entry.offset)?;
            out.write_u64::<LittleEndian>(entry.uncompressed_size)?;
            out.write_u32::<LittleEndian>(entry.first_block)?;
            out.write_u32::<LittleEndian>(entry.block_count)?;
            out.write_u32::<LittleEndian>(0)?;
        }
        for meta in &self.metas {
            out.write_all(&meta.hash.to_bytes())?;
            out.write_u8(meta.flags)?;
        }
        for block in &self.blocks {
            out.write_u64::<LittleEndian>(block.offset)?;
            out.write_u32::<LittleEndian>(block.compressed_size)?;
            out.write_u32::<LittleEndian>(block.uncompressed_size)?;
            out.write_u8(block.codec_index)?;
            out.write_all(&[0u8; 8])?;
        }
        for name in &self.methods {
            if name.len() >= METHOD_NAME_SIZE {
                return Err(Error::InvalidParameter(format!(
                    "compression method name '{}' too long",
                    name
                )));
            }
            let mut entry = [0u8; METHOD_NAME_SIZE];
            entry[..name.len()].copy_from_slice(name.as_bytes());
            out.write_all(&entry)?;
        }

        if self.header.flags.is_signed() {
            let signatures = self.signatures.as_ref().ok_or_else(|| {
                Error::InvalidParameter("signed flag set without signatures".to_string())
            })?;
            for hash in &signatures.block_hashes {
                out.write_all(hash)?;
            }
            let signature = match signing_key {
                Some(key) => crypto::sign_toc(key, &out),
                None => signatures.toc_signature.clone(),
            };
            out.write_u32::<LittleEndian>(signature.len() as u32)?;
            out.write_all(&signature)?;
        }

        out.write_all(&self.directory_index)?;
        Ok(out)
    }

    /// Parse and validate a TOC. When the container is signed and a
    /// public key is supplied, the RSA signature is verified;
    /// `container_name` only labels errors.
    pub fn parse(
        bytes: &[u8],
        container_name: &str,
        signature_key: Option<&RsaPublicKey>,
    ) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let header = TocHeader::parse(&mut cursor)?;
        let chunk_count = header.chunk_count as usize;
        let block_count = header.compression_block_count as usize;

        let mut chunk_ids = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            let mut id = [0u8; 12];
            read_exact(&mut cursor, &mut id, "chunk id array")?;
            chunk_ids.push(ChunkId::from_bytes(id));
        }
        if !chunk_ids.windows(2).all(|w| w[0] < w[1]) {
            return Err(Error::CorruptToc(
                "chunk id array is not strictly sorted".to_string(),
            ));
        }

        let mut offsets = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            let partition_index = read_u32(&mut cursor, "offset entry")?;
            let offset = read_u64(&mut cursor, "offset entry")?;
            let uncompressed_size = read_u64(&mut cursor, "offset entry")?;
            let first_block = read_u32(&mut cursor, "offset entry")?;
            let entry_block_count = read_u32(&mut cursor, "offset entry")?;
            let _reserved = read_u32(&mut cursor, "offset entry")?;

            if partition_index >= header.partition_count {
                return Err(Error::CorruptToc(format!(
                    "partition index {} out of range",
                    partition_index
                )));
            }
            let end = first_block
                .checked_add(entry_block_count)
                .ok_or_else(|| Error::CorruptToc("block range overflow".to_string()))?;
            if end as usize > block_count {
                return Err(Error::CorruptToc(format!(
                    "block range {}..{} exceeds block array of {}",
                    first_block, end, block_count
                )));
            }
            offsets.push(ChunkOffsetLength {
                partition_index,
                offset,
                uncompressed_size,
                first_block,
                block_count: entry_block_count,
            });
        }

        let mut metas = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            let mut hash = [0u8; 32];
            read_exact(&mut cursor, &mut hash, "chunk meta")?;
            let flags = read_u8(&mut cursor, "chunk meta")?;
            if flags & !(CHUNK_FLAG_FORCE_UNCOMPRESSED | CHUNK_FLAG_MEMORY_MAPPED) != 0 {
                return Err(Error::CorruptToc(format!(
                    "unknown chunk flags {:#x}",
                    flags
                )));
            }
            metas.push(ChunkMeta {
                hash: ChunkHash::from_bytes(hash),
                flags,
            });
        }

        let mut blocks = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            let offset = read_u64(&mut cursor, "block array")?;
            let compressed_size = read_u32(&mut cursor, "block array")?;
            let uncompressed_size = read_u32(&mut cursor, "block array")?;
            let codec_index = read_u8(&mut cursor, "block array")?;
            let mut reserved = [0u8; 8];
            read_exact(&mut cursor, &mut reserved, "block array")?;

            if uncompressed_size > header.compression_block_size {
                return Err(Error::CorruptToc(format!(
                    "block uncompressed size {} exceeds block size {}",
                    uncompressed_size, header.compression_block_size
                )));
            }
            if usize::from(codec_index) > header.compression_method_count as usize {
                return Err(Error::CorruptToc(format!(
                    "codec index {} out of range",
                    codec_index
                )));
            }
            blocks.push(CompressionBlockEntry {
                offset,
                compressed_size,
                uncompressed_size,
                codec_index,
            });
        }

        let mut methods = Vec::with_capacity(header.compression_method_count as usize);
        for _ in 0..header.compression_method_count {
            let mut entry = [0u8; METHOD_NAME_SIZE];
            read_exact(&mut cursor, &mut entry, "method name table")?;
            let len = entry.iter().position(|&b| b == 0).unwrap_or(entry.len());
            let name = std::str::from_utf8(&entry[..len])
                .map_err(|_| Error::CorruptToc("method name is not UTF-8".to_string()))?;
            if name.is_empty() {
                return Err(Error::CorruptToc("empty method name".to_string()));
            }
            methods.push(name.to_string());
        }

        let signatures = if header.flags.is_signed() {
            let mut block_hashes = Vec::with_capacity(block_count);
            for _ in 0..block_count {
                let mut hash = [0u8; 20];
                read_exact(&mut cursor, &mut hash, "block hash array")?;
                block_hashes.push(hash);
            }
            let signed_len = cursor.position() as usize;
            let signature_len = read_u32(&mut cursor, "signature length")? as usize;
            if signature_len > 4096 {
                return Err(Error::CorruptToc(format!(
                    "implausible signature length {}",
                    signature_len
                )));
            }
            let mut toc_signature = vec![0u8; signature_len];
            read_exact(&mut cursor, &mut toc_signature, "signature")?;

            if let Some(public_key) = signature_key {
                if !crypto::verify_toc(public_key, &bytes[..signed_len], &toc_signature) {
                    return Err(Error::TocSignatureInvalid(container_name.to_string()));
                }
            }
            Some(TocSignatures {
                block_hashes,
                toc_signature,
            })
        } else {
            None
        };

        let index_size = header.directory_index_size as usize;
        let mut directory_index = vec![0u8; index_size];
        read_exact(&mut cursor, &mut directory_index, "directory index")?;
        if header.flags.is_indexed() != (index_size > 0) {
            return Err(Error::CorruptToc(
                "indexed flag and directory index size disagree".to_string(),
            ));
        }
        if cursor.position() as usize != bytes.len() {
            return Err(Error::CorruptToc(format!(
                "{} trailing bytes after directory index",
                bytes.len() - cursor.position() as usize
            )));
        }

        Ok(TocResource {
            header,
            chunk_ids,
            offsets,
            metas,
            blocks,
            methods,
            signatures,
            directory_index,
        })
    }
}

fn read_exact(cursor: &mut Cursor<&[u8]>, buf: &mut [u8], what: &str) -> Result<()> {
    cursor
        .read_exact(buf)
        .map_err(|_| Error::CorruptToc(format!("truncated {}", what)))
}

fn read_u8(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<u8> {
    cursor
        .read_u8()
        .map_err(|_| Error::CorruptToc(format!("truncated {}", what)))
}

fn read_u32(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<u32> {
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::CorruptToc(format!("truncated {}", what)))
}

fn read_u64(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<u64> {
    cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| Error::CorruptToc(format!("truncated {}", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use iostore_core::ChunkType;

    fn sample_toc() -> TocResource {
        let ids = {
            let mut ids = vec![
                ChunkId::new(2, 0, ChunkType::BulkData),
                ChunkId::new(1, 0, ChunkType::Manifest),
            ];
            ids.sort();
            ids
        };
        TocResource {
            header: TocHeader {
                container_id: ContainerId::from_name("sample"),
                flags: ContainerFlags::default().with_compressed(),
                chunk_count: 2,
                partition_count: 1,
                partition_size: 0,
                compression_block_size: 4096,
                compression_block_alignment: 0,
                memory_mapping_alignment: 16384,
                compression_block_count: 3,
                compression_method_count: 1,
                directory_index_size: 0,
                encryption_key_guid: Uuid::nil(),
            },
            chunk_ids: ids,
            offsets: vec![
                ChunkOffsetLength {
                    partition_index: 0,
                    offset: 0,
                    uncompressed_size: 8192,
                    first_block: 0,
                    block_count: 2,
                },
                ChunkOffsetLength {
                    partition_index: 0,
                    offset: 8192,
                    uncompressed_size: 100,
                    first_block: 2,
                    block_count: 1,
                },
            ],
            metas: vec![
                ChunkMeta {
                    hash: ChunkHash::from_data(b"a"),
                    flags: 0,
                },
                ChunkMeta {
                    hash: ChunkHash::from_data(b"b"),
                    flags: CHUNK_FLAG_FORCE_UNCOMPRESSED,
                },
            ],
            blocks: vec![
                CompressionBlockEntry {
                    offset: 0,
                    compressed_size: 4096,
                    uncompressed_size: 4096,
                    codec_index: 1,
                },
                CompressionBlockEntry {
                    offset: 4096,
                    compressed_size: 4096,
                    uncompressed_size: 4096,
                    codec_index: 1,
                },
                CompressionBlockEntry {
                    offset: 8192,
                    compressed_size: 100,
                    uncompressed_size: 100,
                    codec_index: 0,
                },
            ],
            methods: vec!["Zlib".to_string()],
            signatures: None,
            directory_index: Vec::new(),
        }
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let toc = sample_toc();
        let bytes = toc.serialize(None).unwrap();
        let parsed = TocResource::parse(&bytes, "sample", None).unwrap();

        assert_eq!(parsed.header, toc.header);
        assert_eq!(parsed.chunk_ids, toc.chunk_ids);
        assert_eq!(parsed.offsets, toc.offsets);
        assert_eq!(parsed.metas, toc.metas);
        assert_eq!(parsed.blocks, toc.blocks);
        assert_eq!(parsed.methods, toc.methods);
        assert!(parsed.signatures.is_none());
    }

    #[test]
    fn test_header_is_fixed_size() {
        let toc = sample_toc();
        let mut out = Vec::new();
        toc.header.serialize(&mut out).unwrap();
        assert_eq!(out.len(), TOC_HEADER_SIZE);
    }

    #[test]
    fn test_chunk_lookup_by_binary_search() {
        let toc = sample_toc();
        for (i, id) in toc.chunk_ids.iter().enumerate() {
            assert_eq!(toc.chunk_index(*id), Some(i));
        }
        assert_eq!(toc.chunk_index(ChunkId::new(99, 0, ChunkType::BulkData)), None);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let toc = sample_toc();
        let mut bytes = toc.serialize(None).unwrap();
        bytes[0] ^= 0xFF;
        let err = TocResource::parse(&bytes, "sample", None).unwrap_err();
        assert!(matches!(err, Error::CorruptToc(_)));
    }

    #[test]
    fn test_truncated_toc_rejected() {
        let toc = sample_toc();
        let bytes = toc.serialize(None).unwrap();
        for cut in [4, TOC_HEADER_SIZE - 1, TOC_HEADER_SIZE + 5, bytes.len() - 1] {
            let err = TocResource::parse(&bytes[..cut], "sample", None).unwrap_err();
            assert!(matches!(err, Error::CorruptToc(_)), "cut at {}", cut);
        }
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let toc = sample_toc();
        let mut bytes = toc.serialize(None).unwrap();
        bytes.push(0);
        let err = TocResource::parse(&bytes, "sample", None).unwrap_err();
        assert!(matches!(err, Error::CorruptToc(_)));
    }

    #[test]
    fn test_unsorted_chunk_ids_rejected() {
        let mut toc = sample_toc();
        toc.chunk_ids.swap(0, 1);
        let bytes = toc.serialize(None).unwrap();
        let err = TocResource::parse(&bytes, "sample", None).unwrap_err();
        assert!(matches!(err, Error::CorruptToc(_)));
    }

    #[test]
    fn test_block_range_out_of_bounds_rejected() {
        let mut toc = sample_toc();
        toc.offsets[0].block_count = 99;
        let bytes = toc.serialize(None).unwrap();
        let err = TocResource::parse(&bytes, "sample", None).unwrap_err();
        assert!(matches!(err, Error::CorruptToc(_)));
    }

    #[test]
    fn test_signed_round_trip_and_tamper_detection() {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public_key = private_key.to_public_key();

        let mut toc = sample_toc();
        toc.header.flags = toc.header.flags.with_signed();
        toc.signatures = Some(TocSignatures {
            block_hashes: vec![[1u8; 20], [2u8; 20], [3u8; 20]],
            toc_signature: Vec::new(),
        });

        let bytes = toc.serialize(Some(&private_key)).unwrap();
        let parsed = TocResource::parse(&bytes, "sample", Some(&public_key)).unwrap();
        assert_eq!(
            parsed.signatures.as_ref().unwrap().block_hashes,
            vec![[1u8; 20], [2u8; 20], [3u8; 20]]
        );

        // Parsing without a key skips verification but keeps the bytes
        assert!(TocResource::parse(&bytes, "sample", None).is_ok());

        // Flip a byte inside the signed region
        let mut tampered = bytes.clone();
        tampered[TOC_HEADER_SIZE + 1] ^= 0x01;
        let err = TocResource::parse(&tampered, "sample", Some(&public_key)).unwrap_err();
        assert!(matches!(err, Error::TocSignatureInvalid(_)));
    }

    #[test]
    fn test_stored_size_accounts_for_aes_padding() {
        let block = CompressionBlockEntry {
            offset: 0,
            compressed_size: 100,
            uncompressed_size: 4096,
            codec_index: 1,
        };
        assert_eq!(block.stored_size(false), 100);
        assert_eq!(block.stored_size(true), 112);
    }
}
