//! Mount-side access to one on-disk container.
//!
//! `ContainerReader::open` parses and validates the TOC, verifies the RSA
//! signature when a public key is supplied, resolves the AES key for
//! encrypted containers, and decrypts the directory index. Partition
//! files are opened lazily on first read.
//!
//! Block digests from the signature section are verified lazily: each
//! block is checked the first time any read touches it, and the result is
//! remembered so verification happens once even under concurrent readers.

use crate::codec::CodecRegistry;
use crate::crypto::{self, AesKey, EncryptionKeyProvider};
use crate::file::{FileHandle, MappedRegion};
use crate::index::DirectoryIndexReader;
use crate::toc::{
    ContainerFlags, TocResource, CHUNK_FLAG_FORCE_UNCOMPRESSED, CHUNK_FLAG_MEMORY_MAPPED,
};
use iostore_core::{ChunkHash, ChunkId, ContainerId, Error, IoBuffer, Result};
use parking_lot::Mutex;
use rsa::RsaPublicKey;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Byte window and destination for one chunk read.
#[derive(Debug, Default)]
pub struct ReadOptions {
    /// Offset into the chunk's plaintext
    pub offset: u64,
    /// Bytes to read; clamped to the chunk size (`u64::MAX` = whole chunk)
    pub size: u64,
    /// Optional pre-supplied destination. Must be uniquely owned and at
    /// least the clamped read size, else `InvalidParameter`.
    pub target_buffer: Option<IoBuffer>,
}

impl ReadOptions {
    /// Read the whole chunk into a fresh buffer.
    pub fn whole() -> Self {
        ReadOptions {
            offset: 0,
            size: u64::MAX,
            target_buffer: None,
        }
    }

    /// Read `size` bytes starting at `offset`.
    pub fn range(offset: u64, size: u64) -> Self {
        ReadOptions {
            offset,
            size,
            target_buffer: None,
        }
    }
}

/// Summary of one chunk as recorded in the TOC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Chunk identifier
    pub id: ChunkId,
    /// Uncompressed size in bytes
    pub size: u64,
    /// `CHUNK_FLAG_*` bits
    pub flags: u8,
    /// Plaintext digest recorded at write time
    pub hash: ChunkHash,
}

/// Reader over one mounted container.
pub struct ContainerReader {
    name: String,
    directory: PathBuf,
    toc: TocResource,
    key: Option<AesKey>,
    codecs: Arc<CodecRegistry>,
    partitions: Mutex<Vec<Option<Arc<FileHandle>>>>,
    mappings: Mutex<Vec<Option<Arc<MappedRegion>>>>,
    verified: Option<Mutex<Vec<bool>>>,
    index: Option<DirectoryIndexReader>,
}

impl fmt::Debug for ContainerReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerReader")
            .field("name", &self.name)
            .field("container_id", &self.toc.header.container_id)
            .field("chunk_count", &self.toc.header.chunk_count)
            .finish_non_exhaustive()
    }
}

impl ContainerReader {
    /// Open `<directory>/<name>.toc` with the default codec registry.
    pub fn open(
        directory: &Path,
        name: &str,
        keys: &dyn EncryptionKeyProvider,
        signature_key: Option<&RsaPublicKey>,
    ) -> Result<Self> {
        Self::open_with_codecs(
            directory,
            name,
            keys,
            signature_key,
            Arc::new(CodecRegistry::default()),
        )
    }

    /// Open a container resolving codecs through the given registry.
    pub fn open_with_codecs(
        directory: &Path,
        name: &str,
        keys: &dyn EncryptionKeyProvider,
        signature_key: Option<&RsaPublicKey>,
        codecs: Arc<CodecRegistry>,
    ) -> Result<Self> {
        let toc_path = directory.join(format!("{}.toc", name));
        let bytes = std::fs::read(&toc_path)
            .map_err(|e| Error::FileOpenFailed(format!("{}: {}", toc_path.display(), e)))?;
        let toc = TocResource::parse(&bytes, name, signature_key)?;

        let key = if toc.header.flags.is_encrypted() {
            let guid = toc.header.encryption_key_guid;
            Some(
                keys.key_for(&guid)
                    .ok_or(Error::InvalidEncryptionKey { guid })?,
            )
        } else {
            None
        };

        let index = if toc.header.flags.is_indexed() {
            let blob = toc.directory_index.clone();
            let reader = match &key {
                Some(key) => {
                    DirectoryIndexReader::new_encrypted(blob, toc.header.container_id, key)?
                }
                None => DirectoryIndexReader::new(&blob)?,
            };
            Some(reader)
        } else {
            None
        };

        let partition_count = toc.header.partition_count as usize;
        let verified = toc
            .signatures
            .as_ref()
            .map(|s| Mutex::new(vec![false; s.block_hashes.len()]));

        tracing::debug!(
            container = name,
            container_id = %toc.header.container_id,
            chunks = toc.header.chunk_count,
            partitions = partition_count,
            "opened container"
        );

        Ok(ContainerReader {
            name: name.to_string(),
            directory: directory.to_path_buf(),
            toc,
            key,
            codecs,
            partitions: Mutex::new(vec![None; partition_count]),
            mappings: Mutex::new(vec![None; partition_count]),
            verified,
            index,
        })
    }

    /// Container name the reader was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Container id from the TOC header.
    pub fn container_id(&self) -> ContainerId {
        self.toc.header.container_id
    }

    /// Feature flags from the TOC header.
    pub fn flags(&self) -> ContainerFlags {
        self.toc.header.flags
    }

    /// Key GUID from the TOC header (nil when unencrypted).
    pub fn encryption_key_guid(&self) -> Uuid {
        self.toc.header.encryption_key_guid
    }

    /// Number of chunks in the container.
    pub fn chunk_count(&self) -> usize {
        self.toc.chunk_ids.len()
    }

    /// The parsed TOC, for diagnostics and the writer's dedup pass.
    pub fn toc(&self) -> &TocResource {
        &self.toc
    }

    /// The directory index, when the container carries one.
    pub fn directory_index(&self) -> Option<&DirectoryIndexReader> {
        self.index.as_ref()
    }

    /// True when the container holds the chunk.
    pub fn contains(&self, chunk_id: ChunkId) -> bool {
        self.toc.chunk_index(chunk_id).is_some()
    }

    /// Look up one chunk's TOC record.
    pub fn chunk_info(&self, chunk_id: ChunkId) -> Option<ChunkInfo> {
        let idx = self.toc.chunk_index(chunk_id)?;
        Some(ChunkInfo {
            id: chunk_id,
            size: self.toc.offsets[idx].uncompressed_size,
            flags: self.toc.metas[idx].flags,
            hash: self.toc.metas[idx].hash,
        })
    }

    /// All chunks in sorted id order.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkInfo> + '_ {
        self.toc.chunk_ids.iter().enumerate().map(|(idx, id)| ChunkInfo {
            id: *id,
            size: self.toc.offsets[idx].uncompressed_size,
            flags: self.toc.metas[idx].flags,
            hash: self.toc.metas[idx].hash,
        })
    }

    /// Read a byte window of a chunk.
    ///
    /// Zero-byte reads return an empty buffer; reads past the end of the
    /// chunk are clamped to the valid prefix.
    pub fn read(&self, chunk_id: ChunkId, options: ReadOptions) -> Result<IoBuffer> {
        self.read_cancellable(chunk_id, options, None)
    }

    /// Like [`read`](Self::read), re-checking `cancel` before each block.
    pub fn read_cancellable(
        &self,
        chunk_id: ChunkId,
        options: ReadOptions,
        cancel: Option<&AtomicBool>,
    ) -> Result<IoBuffer> {
        let idx = self
            .toc
            .chunk_index(chunk_id)
            .ok_or(Error::UnknownChunkId(chunk_id))?;
        let entry = self.toc.offsets[idx];
        let meta = self.toc.metas[idx];

        let chunk_size = entry.uncompressed_size;
        let start = options.offset.min(chunk_size);
        let len = options.size.min(chunk_size - start) as usize;
        if len == 0 {
            return Ok(IoBuffer::empty());
        }

        let encrypted = self.toc.header.flags.is_encrypted();
        let block_size = u64::from(self.toc.header.compression_block_size);
        let blocks = &self.toc.blocks
            [entry.first_block as usize..(entry.first_block + entry.block_count) as usize];
        let first_rel = (start / block_size) as usize;
        let last_rel = ((start + len as u64 - 1) / block_size) as usize;

        // One coalesced read covers every needed block; blocks of a chunk
        // are contiguous within their partition
        let span_start = blocks[first_rel].offset;
        let span_end = blocks[last_rel].offset + blocks[last_rel].stored_size(encrypted);
        let partition = self.partition(entry.partition_index)?;
        let span = partition.read_vec(span_start, (span_end - span_start) as usize)?;

        let mut dest = match options.target_buffer {
            Some(buffer) => {
                if buffer.len() < len {
                    return Err(Error::InvalidParameter(format!(
                        "target buffer of {} bytes is smaller than read of {}",
                        buffer.len(),
                        len
                    )));
                }
                buffer
            }
            None => IoBuffer::alloc(len),
        };
        let dst = dest.as_mut_slice().ok_or_else(|| {
            Error::InvalidParameter("target buffer must be uniquely owned".to_string())
        })?;

        let force_uncompressed = meta.flags & CHUNK_FLAG_FORCE_UNCOMPRESSED != 0;
        let mut written = 0usize;
        for rel in first_rel..=last_rel {
            if let Some(cancel) = cancel {
                if cancel.load(Ordering::Relaxed) {
                    return Err(Error::Cancelled);
                }
            }

            let block = blocks[rel];
            let global_index = entry.first_block as usize + rel;
            let stored_len = block.stored_size(encrypted) as usize;
            let span_offset = (block.offset - span_start) as usize;
            let stored = &span[span_offset..span_offset + stored_len];

            self.verify_block(global_index, stored)?;

            let uncompressed = block.uncompressed_size as usize;
            let block_plain: Vec<u8>;
            let plain: &[u8] = if block.codec_index == 0 && !encrypted {
                &stored[..uncompressed]
            } else {
                let mut work = stored.to_vec();
                if encrypted {
                    let key = self.key.as_ref().ok_or(Error::InvalidEncryptionKey {
                        guid: self.toc.header.encryption_key_guid,
                    })?;
                    let iv = crypto::derive_block_iv(
                        self.toc.header.container_id,
                        entry.partition_index,
                        block.offset,
                    );
                    crypto::decrypt_in_place(key, &iv, &mut work)?;
                    work.truncate(block.compressed_size as usize);
                }
                if block.codec_index > 0 && !force_uncompressed {
                    let method = &self.toc.methods[usize::from(block.codec_index) - 1];
                    let codec = self.codecs.get(method).ok_or_else(|| {
                        Error::CompressionError(format!("unknown codec '{}'", method))
                    })?;
                    let mut out = vec![0u8; uncompressed];
                    codec.decompress(&work, &mut out)?;
                    block_plain = out;
                } else {
                    block_plain = work;
                }
                &block_plain
            };

            // Copy the requested window of this block into the destination
            let block_start = rel as u64 * block_size;
            let copy_from = start.max(block_start);
            let copy_to = (start + len as u64).min(block_start + uncompressed as u64);
            let slice = &plain[(copy_from - block_start) as usize..(copy_to - block_start) as usize];
            dst[written..written + slice.len()].copy_from_slice(slice);
            written += slice.len();
        }
        debug_assert_eq!(written, len);

        if dest.len() != len {
            let result = dest.view(0, len)?;
            drop(dest);
            Ok(result)
        } else {
            Ok(dest)
        }
    }

    /// Map a chunk's bytes directly from its partition file.
    ///
    /// Only possible for chunks written with the memory-mapped option:
    /// stored uncompressed and unencrypted, contiguous, and aligned to the
    /// container's memory-mapping alignment. Anything else fails with
    /// `InvalidParameter`. The returned buffer holds the mapping alive and
    /// copies nothing.
    pub fn open_mapped(&self, chunk_id: ChunkId, offset: u64) -> Result<IoBuffer> {
        let idx = self
            .toc
            .chunk_index(chunk_id)
            .ok_or(Error::UnknownChunkId(chunk_id))?;
        let entry = self.toc.offsets[idx];

        if self.toc.metas[idx].flags & CHUNK_FLAG_MEMORY_MAPPED == 0 {
            return Err(Error::InvalidParameter(
                "chunk was not written for memory mapping".to_string(),
            ));
        }
        if self.toc.header.flags.is_encrypted() {
            return Err(Error::InvalidParameter(
                "encrypted chunks cannot be memory mapped".to_string(),
            ));
        }
        let blocks = &self.toc.blocks
            [entry.first_block as usize..(entry.first_block + entry.block_count) as usize];
        if blocks.iter().any(|b| b.codec_index != 0) {
            return Err(Error::InvalidParameter(
                "compressed chunks cannot be memory mapped".to_string(),
            ));
        }
        for pair in blocks.windows(2) {
            if pair[1].offset != pair[0].offset + u64::from(pair[0].compressed_size) {
                return Err(Error::InvalidParameter(
                    "chunk blocks are not contiguous".to_string(),
                ));
            }
        }
        let alignment = u64::from(self.toc.header.memory_mapping_alignment);
        if alignment != 0 && entry.offset % alignment != 0 {
            return Err(Error::InvalidParameter(format!(
                "chunk offset {} is not aligned to {}",
                entry.offset, alignment
            )));
        }

        let start = offset.min(entry.uncompressed_size);
        let len = entry.uncompressed_size - start;
        let mapping = self.mapping(entry.partition_index)?;
        IoBuffer::external(mapping, (entry.offset + start) as usize, len as usize)
    }

    /// Raw stored bytes of a whole chunk, exactly as they sit in the
    /// partition file. Used by the writer to reuse ciphertext blocks of a
    /// prior version.
    pub(crate) fn read_chunk_stored(&self, chunk_index: usize) -> Result<Vec<u8>> {
        let entry = self.toc.offsets[chunk_index];
        if entry.block_count == 0 {
            return Ok(Vec::new());
        }
        let encrypted = self.toc.header.flags.is_encrypted();
        let blocks = &self.toc.blocks
            [entry.first_block as usize..(entry.first_block + entry.block_count) as usize];
        let last = blocks[blocks.len() - 1];
        let span = last.offset + last.stored_size(encrypted) - entry.offset;
        let partition = self.partition(entry.partition_index)?;
        partition.read_vec(entry.offset, span as usize)
    }

    fn partition(&self, index: u32) -> Result<Arc<FileHandle>> {
        let mut guard = self.partitions.lock();
        if let Some(handle) = &guard[index as usize] {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(FileHandle::open(&self.partition_path(index))?);
        guard[index as usize] = Some(Arc::clone(&handle));
        Ok(handle)
    }

    fn mapping(&self, index: u32) -> Result<Arc<MappedRegion>> {
        let mut guard = self.mappings.lock();
        if let Some(region) = &guard[index as usize] {
            return Ok(Arc::clone(region));
        }
        let region = Arc::new(MappedRegion::map(&self.partition_path(index))?);
        guard[index as usize] = Some(Arc::clone(&region));
        Ok(region)
    }

    /// Path of one partition data file.
    pub fn partition_path(&self, index: u32) -> PathBuf {
        if index == 0 {
            self.directory.join(format!("{}.cas", self.name))
        } else {
            self.directory.join(format!("{}_{}.cas", self.name, index))
        }
    }

    fn verify_block(&self, global_index: usize, stored: &[u8]) -> Result<()> {
        let (signatures, verified) = match (&self.toc.signatures, &self.verified) {
            (Some(signatures), Some(verified)) => (signatures, verified),
            _ => return Ok(()),
        };
        // Lock held across hashing so each block is verified exactly once
        let mut guard = verified.lock();
        if guard[global_index] {
            return Ok(());
        }
        let actual = crypto::sha1_digest(stored);
        let expected = signatures.block_hashes[global_index];
        if actual != expected {
            tracing::warn!(
                container = %self.name,
                block_index = global_index,
                "block digest mismatch"
            );
            return Err(Error::BlockSignatureMismatch {
                container: self.name.clone(),
                block_index: global_index as u32,
                expected,
                actual,
            });
        }
        guard[global_index] = true;
        Ok(())
    }
}
