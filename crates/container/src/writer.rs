//! Container authoring.
//!
//! `ContainerWriter` collects chunks in memory, then `finish` lays them
//! out across partition files in insertion order, splits each chunk into
//! fixed-size blocks, compresses, encrypts, signs, and writes the TOC.
//!
//! Output is deterministic: the same chunks, options, and settings
//! produce byte-identical files. Encryption keeps this property because
//! block IVs derive from the write position rather than from randomness.
//!
//! Prior versions of the same container can be attached with
//! `add_prior_version`; chunks whose plaintext and storage parameters
//! match a prior copy are copied raw (ciphertext included) instead of
//! being recompressed, and are reported as unchanged in the result.

use crate::codec::CodecRegistry;
use crate::crypto::{self, AesKey};
use crate::index::DirectoryIndexBuilder;
use crate::reader::ContainerReader;
use crate::toc::{
    ChunkMeta, ChunkOffsetLength, CompressionBlockEntry, ContainerFlags, TocHeader, TocResource,
    TocSignatures, CHUNK_FLAG_FORCE_UNCOMPRESSED, CHUNK_FLAG_MEMORY_MAPPED,
};
use iostore_core::{ChunkHash, ChunkId, ContainerId, Error, IoBuffer, Result};
use rsa::RsaPrivateKey;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Default uncompressed block size (64 KiB).
pub const DEFAULT_COMPRESSION_BLOCK_SIZE: u32 = 64 * 1024;

/// Default alignment for memory-mapped chunks (16 KiB).
pub const DEFAULT_MEMORY_MAPPING_ALIGNMENT: u32 = 16 * 1024;

/// Write-time configuration for one container.
pub struct ContainerWriterSettings {
    /// Uncompressed block size used to split chunks
    pub compression_block_size: u32,
    /// Alignment of block starts within a partition (0 = packed)
    pub compression_block_alignment: u32,
    /// Alignment applied to chunks written with the memory-mapped option
    pub memory_mapping_alignment: u32,
    /// Partition rollover threshold in bytes (0 = single partition)
    pub max_partition_size: u64,
    /// Codec name for block compression (None = store everything raw)
    pub compression_method: Option<String>,
    /// Extra bytes a compressed block must save to be kept; blocks that
    /// fail the margin are stored raw
    pub compression_margin: u32,
    /// AES key and its GUID; enables encryption
    pub encryption: Option<(Uuid, AesKey)>,
    /// RSA key for TOC signing; enables per-block digests
    pub signing_key: Option<RsaPrivateKey>,
    /// Build a directory index from chunk file names
    pub build_directory_index: bool,
    /// Mount point recorded in the directory index
    pub mount_point: String,
    /// Codec registry used to resolve `compression_method`
    pub codecs: Arc<CodecRegistry>,
}

impl Default for ContainerWriterSettings {
    fn default() -> Self {
        ContainerWriterSettings {
            compression_block_size: DEFAULT_COMPRESSION_BLOCK_SIZE,
            compression_block_alignment: 0,
            memory_mapping_alignment: DEFAULT_MEMORY_MAPPING_ALIGNMENT,
            max_partition_size: 0,
            compression_method: None,
            compression_margin: 0,
            encryption: None,
            signing_key: None,
            build_directory_index: true,
            mount_point: "/".to_string(),
            codecs: Arc::new(CodecRegistry::default()),
        }
    }
}

/// Per-chunk write options.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Path under the mount point; feeds the directory index
    pub file_name: Option<String>,
    /// Opaque value stored with the directory index file entry
    pub user_data: u32,
    /// Store every block raw even when a codec is configured
    pub force_uncompressed: bool,
    /// Store raw, contiguous, and aligned for memory mapping
    pub memory_mapped: bool,
}

/// Statistics returned by [`ContainerWriter::finish`].
#[derive(Debug, Clone)]
pub struct WriterResult {
    /// Id of the written container
    pub container_id: ContainerId,
    /// Chunks absent from every prior version
    pub added_chunks: u64,
    /// Plaintext bytes of added chunks
    pub added_bytes: u64,
    /// Chunks present in a prior version with different content
    pub modified_chunks: u64,
    /// Plaintext bytes of modified chunks
    pub modified_bytes: u64,
    /// Chunks copied raw from a prior version
    pub unchanged_chunks: u64,
    /// Plaintext bytes of unchanged chunks
    pub unchanged_bytes: u64,
    /// Total plaintext bytes across all chunks
    pub uncompressed_bytes: u64,
    /// Total bytes written to partition files, padding included
    pub stored_bytes: u64,
    /// Alignment padding bytes within partitions
    pub padding_bytes: u64,
    /// Size of the TOC file
    pub toc_size: u64,
    /// Size of the directory index blob
    pub index_size: u64,
    /// Number of partition files written
    pub partition_count: u32,
    /// Codec the container was written with
    pub compression_method: Option<String>,
}

impl Default for WriterResult {
    fn default() -> Self {
        WriterResult {
            container_id: ContainerId::INVALID,
            added_chunks: 0,
            added_bytes: 0,
            modified_chunks: 0,
            modified_bytes: 0,
            unchanged_chunks: 0,
            unchanged_bytes: 0,
            uncompressed_bytes: 0,
            stored_bytes: 0,
            padding_bytes: 0,
            toc_size: 0,
            index_size: 0,
            partition_count: 0,
            compression_method: None,
        }
    }
}

impl WriterResult {
    /// Stored bytes as a fraction of plaintext bytes (1.0 = no saving).
    pub fn compression_ratio(&self) -> f64 {
        if self.uncompressed_bytes == 0 {
            1.0
        } else {
            self.stored_bytes as f64 / self.uncompressed_bytes as f64
        }
    }
}

struct PendingChunk {
    id: ChunkId,
    data: IoBuffer,
    options: WriteOptions,
}

/// Builder for one container.
pub struct ContainerWriter {
    name: String,
    settings: ContainerWriterSettings,
    priors: Vec<Arc<ContainerReader>>,
    pending: Vec<PendingChunk>,
    ids: BTreeSet<ChunkId>,
}

impl ContainerWriter {
    /// Writer for a container named `name` (file names derive from it).
    pub fn new(name: &str, settings: ContainerWriterSettings) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidParameter(
                "container name must not be empty".to_string(),
            ));
        }
        if settings.compression_block_size == 0 {
            return Err(Error::InvalidParameter(
                "compression block size must not be zero".to_string(),
            ));
        }
        if let Some(method) = &settings.compression_method {
            if settings.codecs.get(method).is_none() {
                return Err(Error::CompressionError(format!(
                    "compression method '{}' is not registered",
                    method
                )));
            }
        }
        Ok(ContainerWriter {
            name: name.to_string(),
            settings,
            priors: Vec::new(),
            pending: Vec::new(),
            ids: BTreeSet::new(),
        })
    }

    /// Attach a prior version as a dedup source. When several priors hold
    /// the same chunk, the earliest-added reader wins.
    pub fn add_prior_version(&mut self, reader: Arc<ContainerReader>) {
        self.priors.push(reader);
    }

    /// Queue one chunk. Ids must be valid and unique within the writer.
    pub fn append(&mut self, id: ChunkId, data: IoBuffer, options: WriteOptions) -> Result<()> {
        if !id.is_valid() {
            return Err(Error::InvalidParameter(format!("invalid chunk id {}", id)));
        }
        if !self.ids.insert(id) {
            return Err(Error::InvalidParameter(format!(
                "duplicate chunk id {}",
                id
            )));
        }
        self.pending.push(PendingChunk { id, data, options });
        Ok(())
    }

    /// Number of queued chunks.
    pub fn chunk_count(&self) -> usize {
        self.pending.len()
    }

    /// Lay out, compress, encrypt, sign, and write all files into
    /// `directory`.
    pub fn finish(self, directory: &Path) -> Result<WriterResult> {
        let container_id = ContainerId::from_name(&self.name);
        let encrypted = self.settings.encryption.is_some();
        let key_guid = self
            .settings
            .encryption
            .as_ref()
            .map(|(guid, _)| *guid)
            .unwrap_or(Uuid::nil());
        let methods: Vec<String> = self
            .settings
            .compression_method
            .iter()
            .cloned()
            .collect();

        let mut result = WriterResult {
            container_id,
            compression_method: self.settings.compression_method.clone(),
            ..WriterResult::default()
        };

        let mut sink = PartitionSink::new(directory, &self.name);
        let mut records: Vec<(ChunkId, ChunkOffsetLength, ChunkMeta)> =
            Vec::with_capacity(self.pending.len());
        let mut blocks: Vec<CompressionBlockEntry> = Vec::new();
        let mut block_hashes: Vec<[u8; 20]> = Vec::new();
        let signing = self.settings.signing_key.is_some();
        let mut any_compressed = false;
        let mut index_builder = self
            .settings
            .build_directory_index
            .then(|| DirectoryIndexBuilder::new(&self.settings.mount_point));

        for chunk in &self.pending {
            let plaintext = chunk.data.as_slice();
            let hash = ChunkHash::from_data(plaintext);
            result.uncompressed_bytes += plaintext.len() as u64;

            let stored = self.prepare_chunk(chunk, &hash, container_id)?;

            // Rollover happens between chunks only
            let total_stored: u64 = stored.total_span();
            if self.settings.max_partition_size > 0
                && sink.offset > 0
                && sink.offset + total_stored > self.settings.max_partition_size
            {
                sink.roll()?;
            }

            // Alignment padding precedes the chunk
            let alignment = if chunk.options.memory_mapped {
                u64::from(self.settings.memory_mapping_alignment)
            } else {
                0
            };
            if alignment > 1 && sink.offset % alignment != 0 {
                let pad = alignment - sink.offset % alignment;
                sink.pad(pad)?;
                result.padding_bytes += pad;
            }

            let chunk_offset = sink.offset;
            let first_block = blocks.len() as u32;
            let flags = storage_flags(&chunk.options);

            match stored {
                PreparedChunk::Fresh { blocks: fresh, reused } => {
                    for mut block in fresh {
                        // Inter-block alignment never applies to mapped
                        // chunks, which must stay contiguous
                        let block_alignment =
                            u64::from(self.settings.compression_block_alignment);
                        if !chunk.options.memory_mapped
                            && block_alignment > 1
                            && sink.offset % block_alignment != 0
                        {
                            let pad = block_alignment - sink.offset % block_alignment;
                            sink.pad(pad)?;
                            result.padding_bytes += pad;
                        }

                        let offset = sink.offset;
                        if encrypted {
                            let (_, key) = self.settings.encryption.as_ref().unwrap();
                            let padded = crypto::aligned_to_aes(block.payload.len());
                            block.payload.resize(padded, 0);
                            let iv =
                                crypto::derive_block_iv(container_id, sink.partition, offset);
                            crypto::encrypt_in_place(key, &iv, &mut block.payload)?;
                        }
                        if signing {
                            block_hashes.push(crypto::sha1_digest(&block.payload));
                        }
                        if block.codec_index != 0 {
                            any_compressed = true;
                        }
                        sink.write(&block.payload)?;
                        result.stored_bytes += block.payload.len() as u64;
                        blocks.push(CompressionBlockEntry {
                            offset,
                            compressed_size: block.compressed_size,
                            uncompressed_size: block.uncompressed_size,
                            codec_index: block.codec_index,
                        });
                    }
                    if reused {
                        result.modified_chunks += 1;
                        result.modified_bytes += plaintext.len() as u64;
                    } else {
                        result.added_chunks += 1;
                        result.added_bytes += plaintext.len() as u64;
                    }
                }
                PreparedChunk::Copied {
                    raw,
                    entries,
                    prior_offset,
                    prior_partition,
                } => {
                    let mut cursor = 0u64;
                    for entry in &entries {
                        let rel = entry.offset - prior_offset;
                        if rel > cursor {
                            // Preserve inter-block alignment gaps
                            sink.write(&raw[cursor as usize..rel as usize])?;
                        }
                        let len = entry.stored_size(encrypted) as usize;
                        let mut stored = raw[rel as usize..rel as usize + len].to_vec();
                        let new_offset = chunk_offset + rel;
                        if encrypted {
                            // Ciphertext is bound to its position through
                            // the IV; re-key blocks that moved
                            let (_, key) = self.settings.encryption.as_ref().unwrap();
                            let prior_iv = crypto::derive_block_iv(
                                container_id,
                                prior_partition,
                                entry.offset,
                            );
                            crypto::decrypt_in_place(key, &prior_iv, &mut stored)?;
                            let iv =
                                crypto::derive_block_iv(container_id, sink.partition, new_offset);
                            crypto::encrypt_in_place(key, &iv, &mut stored)?;
                        }
                        if signing {
                            block_hashes.push(crypto::sha1_digest(&stored));
                        }
                        if entry.codec_index != 0 {
                            any_compressed = true;
                        }
                        sink.write(&stored)?;
                        cursor = rel + len as u64;
                        blocks.push(CompressionBlockEntry {
                            offset: new_offset,
                            compressed_size: entry.compressed_size,
                            uncompressed_size: entry.uncompressed_size,
                            codec_index: entry.codec_index,
                        });
                    }
                    result.stored_bytes += cursor;
                    result.unchanged_chunks += 1;
                    result.unchanged_bytes += plaintext.len() as u64;
                }
            }

            records.push((
                chunk.id,
                ChunkOffsetLength {
                    partition_index: sink.partition,
                    offset: chunk_offset,
                    uncompressed_size: plaintext.len() as u64,
                    first_block,
                    block_count: blocks.len() as u32 - first_block,
                },
                ChunkMeta { hash, flags },
            ));

            if let (Some(builder), Some(file_name)) =
                (index_builder.as_mut(), chunk.options.file_name.as_deref())
            {
                builder.add_file(file_name, chunk.options.user_data)?;
            }
        }
        let partition_count = sink.finish()?;
        result.partition_count = partition_count;

        // TOC arrays are sorted by chunk id; block indices are global and
        // survive the reorder
        records.sort_by_key(|(id, _, _)| *id);
        let (chunk_ids, offsets, metas) = records.into_iter().fold(
            (Vec::new(), Vec::new(), Vec::new()),
            |(mut ids, mut offs, mut ms), (id, off, meta)| {
                ids.push(id);
                offs.push(off);
                ms.push(meta);
                (ids, offs, ms)
            },
        );

        let directory_index = match index_builder {
            Some(builder) => {
                let mut blob = builder.build()?;
                if !blob.is_empty() {
                    if let Some((_, key)) = &self.settings.encryption {
                        blob.resize(crypto::aligned_to_aes(blob.len()), 0);
                        let iv = crypto::derive_block_iv(
                            container_id,
                            crypto::DIRECTORY_INDEX_PARTITION,
                            0,
                        );
                        crypto::encrypt_in_place(key, &iv, &mut blob)?;
                    }
                }
                blob
            }
            None => Vec::new(),
        };
        result.index_size = directory_index.len() as u64;

        let mut flags = ContainerFlags::default();
        if any_compressed {
            flags = flags.with_compressed();
        }
        if encrypted {
            flags = flags.with_encrypted();
        }
        if signing {
            flags = flags.with_signed();
        }
        if !directory_index.is_empty() {
            flags = flags.with_indexed();
        }

        let toc = TocResource {
            header: TocHeader {
                container_id,
                flags,
                chunk_count: chunk_ids.len() as u32,
                partition_count,
                partition_size: self.settings.max_partition_size,
                compression_block_size: self.settings.compression_block_size,
                compression_block_alignment: self.settings.compression_block_alignment,
                memory_mapping_alignment: self.settings.memory_mapping_alignment,
                compression_block_count: blocks.len() as u32,
                compression_method_count: methods.len() as u32,
                directory_index_size: directory_index.len() as u32,
                encryption_key_guid: key_guid,
            },
            chunk_ids,
            offsets,
            metas,
            blocks,
            methods,
            signatures: signing.then_some(TocSignatures {
                block_hashes,
                toc_signature: Vec::new(),
            }),
            directory_index,
        };

        let toc_bytes = toc.serialize(self.settings.signing_key.as_ref())?;
        result.toc_size = toc_bytes.len() as u64;
        let toc_path = directory.join(format!("{}.toc", self.name));
        std::fs::write(&toc_path, &toc_bytes)
            .map_err(|e| Error::WriteError(format!("{}: {}", toc_path.display(), e)))?;

        tracing::info!(
            container = %self.name,
            container_id = %container_id,
            chunks = toc.header.chunk_count,
            partitions = partition_count,
            added = result.added_chunks,
            modified = result.modified_chunks,
            unchanged = result.unchanged_chunks,
            stored_bytes = result.stored_bytes,
            "container written"
        );
        Ok(result)
    }

    /// Compress (or dedup-copy) one chunk without committing any output.
    fn prepare_chunk(
        &self,
        chunk: &PendingChunk,
        hash: &ChunkHash,
        container_id: ContainerId,
    ) -> Result<PreparedChunk> {
        let plaintext = chunk.data.as_slice();
        let encrypted = self.settings.encryption.is_some();
        let mut in_prior = false;

        for prior in &self.priors {
            let toc = prior.toc();
            let idx = match toc.chunk_index(chunk.id) {
                Some(idx) => idx,
                None => continue,
            };
            in_prior = true;
            let entry = toc.offsets[idx];
            // A raw copy keeps the prior stored form, so the chunk flags
            // the new options ask for must match the prior ones
            if toc.metas[idx].hash != *hash
                || entry.uncompressed_size != plaintext.len() as u64
                || toc.header.compression_block_size != self.settings.compression_block_size
                || toc.header.flags.is_encrypted() != encrypted
                || toc.metas[idx].flags != storage_flags(&chunk.options)
            {
                continue;
            }
            if encrypted {
                // Copied ciphertext must decrypt with the prior position's
                // IV, which requires the same container id and key
                let (guid, _) = self.settings.encryption.as_ref().unwrap();
                if toc.header.container_id != container_id
                    || toc.header.encryption_key_guid != *guid
                {
                    continue;
                }
            }
            let prior_blocks =
                &toc.blocks[entry.first_block as usize..(entry.first_block + entry.block_count) as usize];
            let compatible = prior_blocks.iter().all(|b| {
                b.codec_index == 0
                    || self.settings.compression_method.as_deref()
                        == Some(toc.methods[usize::from(b.codec_index) - 1].as_str())
            });
            if !compatible {
                continue;
            }

            let raw = prior.read_chunk_stored(idx)?;
            // Codec indices collapse to 0 (raw) or 1 (the configured
            // method) in the new method table
            let entries: Vec<CompressionBlockEntry> = prior_blocks
                .iter()
                .map(|b| CompressionBlockEntry {
                    offset: b.offset,
                    compressed_size: b.compressed_size,
                    uncompressed_size: b.uncompressed_size,
                    codec_index: if b.codec_index == 0 { 0 } else { 1 },
                })
                .collect();
            return Ok(PreparedChunk::Copied {
                raw,
                entries,
                prior_offset: entry.offset,
                prior_partition: entry.partition_index,
            });
        }

        // Fresh compression path
        let block_size = self.settings.compression_block_size as usize;
        let codec = match (&self.settings.compression_method, chunk.options.force_uncompressed
            || chunk.options.memory_mapped)
        {
            (Some(method), false) => self.settings.codecs.get(method),
            _ => None,
        };
        let mut fresh = Vec::new();
        for piece in plaintext.chunks(block_size) {
            let (payload, codec_index) = match &codec {
                Some(codec) => {
                    let compressed = codec.compress(piece)?;
                    let margin = self.settings.compression_margin as usize;
                    if compressed.len() + margin < piece.len() {
                        (compressed, 1u8)
                    } else {
                        (piece.to_vec(), 0)
                    }
                }
                None => (piece.to_vec(), 0),
            };
            fresh.push(FreshBlock {
                compressed_size: payload.len() as u32,
                uncompressed_size: piece.len() as u32,
                codec_index,
                payload,
            });
        }
        Ok(PreparedChunk::Fresh {
            blocks: fresh,
            reused: in_prior,
        })
    }
}

/// Chunk-meta flags a chunk written with `options` will carry.
fn storage_flags(options: &WriteOptions) -> u8 {
    let mut flags = 0u8;
    if options.force_uncompressed || options.memory_mapped {
        flags |= CHUNK_FLAG_FORCE_UNCOMPRESSED;
    }
    if options.memory_mapped {
        flags |= CHUNK_FLAG_MEMORY_MAPPED;
    }
    flags
}

struct FreshBlock {
    payload: Vec<u8>,
    compressed_size: u32,
    uncompressed_size: u32,
    codec_index: u8,
}

enum PreparedChunk {
    Fresh {
        blocks: Vec<FreshBlock>,
        /// The id exists in a prior version with different content
        reused: bool,
    },
    Copied {
        raw: Vec<u8>,
        entries: Vec<CompressionBlockEntry>,
        prior_offset: u64,
        prior_partition: u32,
    },
}

impl PreparedChunk {
    fn total_span(&self) -> u64 {
        match self {
            PreparedChunk::Fresh { blocks, .. } => blocks
                .iter()
                .map(|b| crypto::aligned_to_aes(b.payload.len()) as u64)
                .sum(),
            PreparedChunk::Copied { raw, .. } => raw.len() as u64,
        }
    }
}

/// Streams partition data files, rolling to the next file on demand.
struct PartitionSink {
    directory: PathBuf,
    name: String,
    partition: u32,
    offset: u64,
    writer: Option<BufWriter<File>>,
}

impl PartitionSink {
    fn new(directory: &Path, name: &str) -> Self {
        PartitionSink {
            directory: directory.to_path_buf(),
            name: name.to_string(),
            partition: 0,
            offset: 0,
            writer: None,
        }
    }

    fn path(&self, index: u32) -> PathBuf {
        if index == 0 {
            self.directory.join(format!("{}.cas", self.name))
        } else {
            self.directory.join(format!("{}_{}.cas", self.name, index))
        }
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        if self.writer.is_none() {
            let path = self.path(self.partition);
            let file = File::create(&path)
                .map_err(|e| Error::WriteError(format!("{}: {}", path.display(), e)))?;
            self.writer = Some(BufWriter::new(file));
        }
        Ok(self.writer.as_mut().unwrap())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer()?
            .write_all(data)
            .map_err(|e| Error::WriteError(format!("partition write: {}", e)))?;
        self.offset += data.len() as u64;
        Ok(())
    }

    fn pad(&mut self, len: u64) -> Result<()> {
        const ZEROS: [u8; 4096] = [0u8; 4096];
        let mut remaining = len;
        while remaining > 0 {
            let step = remaining.min(ZEROS.len() as u64) as usize;
            self.write(&ZEROS[..step])?;
            remaining -= step as u64;
        }
        Ok(())
    }

    fn roll(&mut self) -> Result<()> {
        self.flush_current()?;
        self.partition += 1;
        self.offset = 0;
        Ok(())
    }

    /// Flush the last file and return the partition count. An empty
    /// container still gets one (empty) partition file so the header's
    /// partition count is never zero.
    fn finish(mut self) -> Result<u32> {
        self.writer()?;
        self.flush_current()?;
        Ok(self.partition + 1)
    }

    fn flush_current(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| Error::WriteError(format!("partition flush: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{NoKeys, StaticKeys};
    use crate::reader::ReadOptions;
    use iostore_core::ChunkType;
    use tempfile::tempdir;

    fn id(package: u64) -> ChunkId {
        ChunkId::new(package, 0, ChunkType::BulkData)
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_plain_round_trip() {
        let dir = tempdir().unwrap();
        let mut writer = ContainerWriter::new("plain", ContainerWriterSettings::default()).unwrap();
        writer
            .append(id(1), IoBuffer::from_vec(b"HELLO".to_vec()), WriteOptions::default())
            .unwrap();
        let result = writer.finish(dir.path()).unwrap();
        assert_eq!(result.added_chunks, 1);
        assert_eq!(result.partition_count, 1);

        let reader = ContainerReader::open(dir.path(), "plain", &NoKeys, None).unwrap();
        let buffer = reader.read(id(1), ReadOptions::whole()).unwrap();
        assert_eq!(buffer.as_slice(), b"HELLO");
        assert_eq!(reader.chunk_info(id(1)).unwrap().size, 5);
    }

    #[test]
    fn test_compressed_sub_range_read() {
        let dir = tempdir().unwrap();
        let settings = ContainerWriterSettings {
            compression_block_size: 4096,
            compression_method: Some("Zlib".to_string()),
            ..ContainerWriterSettings::default()
        };
        let mut writer = ContainerWriter::new("ranged", settings).unwrap();
        let payload = patterned(10_000);
        writer
            .append(id(7), IoBuffer::from_vec(payload.clone()), WriteOptions::default())
            .unwrap();
        writer.finish(dir.path()).unwrap();

        let reader = ContainerReader::open(dir.path(), "ranged", &NoKeys, None).unwrap();
        // Crosses the block boundary at 4096
        let buffer = reader.read(id(7), ReadOptions::range(4000, 200)).unwrap();
        assert_eq!(buffer.as_slice(), &payload[4000..4200]);

        // Clamped past the end
        let tail = reader.read(id(7), ReadOptions::range(9_990, 1_000)).unwrap();
        assert_eq!(tail.as_slice(), &payload[9_990..]);

        // Zero-size and out-of-range reads are empty, not errors
        assert!(reader.read(id(7), ReadOptions::range(3, 0)).unwrap().is_empty());
        assert!(reader
            .read(id(7), ReadOptions::range(1 << 40, 10))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_encrypted_signed_round_trip() {
        let dir = tempdir().unwrap();
        let guid = Uuid::new_v4();
        let key: AesKey = [0x5A; 32];
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let public_key = private_key.to_public_key();

        let settings = ContainerWriterSettings {
            compression_block_size: 4096,
            compression_method: Some("Zstd".to_string()),
            encryption: Some((guid, key)),
            signing_key: Some(private_key),
            ..ContainerWriterSettings::default()
        };
        let mut writer = ContainerWriter::new("sealed", settings).unwrap();
        let payload = patterned(9_000);
        writer
            .append(id(3), IoBuffer::from_vec(payload.clone()), WriteOptions::default())
            .unwrap();
        writer.finish(dir.path()).unwrap();

        // Without the key the container refuses to open
        let err = ContainerReader::open(dir.path(), "sealed", &NoKeys, None).unwrap_err();
        assert!(matches!(err, Error::InvalidEncryptionKey { .. }));

        let keys = StaticKeys::new(guid, key);
        let reader =
            ContainerReader::open(dir.path(), "sealed", &keys, Some(&public_key)).unwrap();
        assert!(reader.flags().is_encrypted());
        assert!(reader.flags().is_signed());
        let buffer = reader.read(id(3), ReadOptions::whole()).unwrap();
        assert_eq!(buffer.as_slice(), payload.as_slice());
    }

    #[test]
    fn test_block_tamper_is_detected() {
        let dir = tempdir().unwrap();
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let settings = ContainerWriterSettings {
            compression_block_size: 1024,
            signing_key: Some(private_key),
            ..ContainerWriterSettings::default()
        };
        let mut writer = ContainerWriter::new("tamper", settings).unwrap();
        writer
            .append(id(9), IoBuffer::from_vec(patterned(5_000)), WriteOptions::default())
            .unwrap();
        writer.finish(dir.path()).unwrap();

        // Corrupt one byte inside block 3 (offset 3 KiB)
        let cas = dir.path().join("tamper.cas");
        let mut bytes = std::fs::read(&cas).unwrap();
        bytes[3 * 1024 + 10] ^= 0xFF;
        std::fs::write(&cas, &bytes).unwrap();

        let reader = ContainerReader::open(dir.path(), "tamper", &NoKeys, None).unwrap();
        // Blocks 0..3 still verify
        assert!(reader.read(id(9), ReadOptions::range(0, 2048)).is_ok());
        let err = reader.read(id(9), ReadOptions::whole()).unwrap_err();
        match err {
            Error::BlockSignatureMismatch { block_index, .. } => assert_eq!(block_index, 3),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_directory_index_lookup() {
        let dir = tempdir().unwrap();
        let settings = ContainerWriterSettings {
            mount_point: "/game".to_string(),
            ..ContainerWriterSettings::default()
        };
        let mut writer = ContainerWriter::new("indexed", settings).unwrap();
        writer
            .append(
                id(1),
                IoBuffer::from_vec(vec![1]),
                WriteOptions {
                    file_name: Some("maps/level1.bin".to_string()),
                    user_data: 42,
                    ..WriteOptions::default()
                },
            )
            .unwrap();
        writer
            .append(
                id(2),
                IoBuffer::from_vec(vec![2]),
                WriteOptions {
                    file_name: Some("maps/level2.bin".to_string()),
                    user_data: 43,
                    ..WriteOptions::default()
                },
            )
            .unwrap();
        writer.finish(dir.path()).unwrap();

        let reader = ContainerReader::open(dir.path(), "indexed", &NoKeys, None).unwrap();
        let index = reader.directory_index().unwrap();
        assert_eq!(index.mount_point(), "/game");
        assert_eq!(index.find("maps/level1.bin"), Some(42));
        assert_eq!(index.find("maps/level2.bin"), Some(43));
        assert_eq!(index.find("maps/level3.bin"), None);
    }

    #[test]
    fn test_partition_rollover() {
        let dir = tempdir().unwrap();
        let settings = ContainerWriterSettings {
            compression_block_size: 1024,
            max_partition_size: 3000,
            build_directory_index: false,
            ..ContainerWriterSettings::default()
        };
        let mut writer = ContainerWriter::new("parts", settings).unwrap();
        for package in 1..=4u64 {
            writer
                .append(id(package), IoBuffer::from_vec(patterned(2_000)), WriteOptions::default())
                .unwrap();
        }
        let result = writer.finish(dir.path()).unwrap();
        assert!(result.partition_count > 1);
        assert!(dir.path().join("parts_1.cas").exists());

        let reader = ContainerReader::open(dir.path(), "parts", &NoKeys, None).unwrap();
        for package in 1..=4u64 {
            let buffer = reader.read(id(package), ReadOptions::whole()).unwrap();
            assert_eq!(buffer.as_slice(), patterned(2_000).as_slice());
        }
        // Chunks never span partitions
        for info in reader.chunks() {
            let idx = reader.toc().chunk_index(info.id).unwrap();
            assert!(reader.toc().offsets[idx].offset + info.size <= 3000);
        }
    }

    #[test]
    fn test_memory_mapped_chunk() {
        let dir = tempdir().unwrap();
        let settings = ContainerWriterSettings {
            compression_method: Some("Zlib".to_string()),
            memory_mapping_alignment: 4096,
            ..ContainerWriterSettings::default()
        };
        let mut writer = ContainerWriter::new("mapped", settings).unwrap();
        writer
            .append(id(1), IoBuffer::from_vec(patterned(100)), WriteOptions::default())
            .unwrap();
        writer
            .append(
                id(2),
                IoBuffer::from_vec(patterned(300)),
                WriteOptions {
                    memory_mapped: true,
                    ..WriteOptions::default()
                },
            )
            .unwrap();
        writer
            .append(
                id(3),
                IoBuffer::from_vec(patterned(200)),
                WriteOptions {
                    force_uncompressed: true,
                    ..WriteOptions::default()
                },
            )
            .unwrap();
        let result = writer.finish(dir.path()).unwrap();
        assert!(result.padding_bytes > 0);

        let reader = ContainerReader::open(dir.path(), "mapped", &NoKeys, None).unwrap();
        let mapped = reader.open_mapped(id(2), 0).unwrap();
        assert_eq!(mapped.as_slice(), patterned(300).as_slice());
        assert_eq!(reader.open_mapped(id(2), 100).unwrap().len(), 200);

        // Chunks not laid out for mapping are refused, raw storage or not
        assert!(matches!(
            reader.open_mapped(id(1), 0),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            reader.open_mapped(id(3), 0),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_dedup_against_prior_version() {
        let dir_v1 = tempdir().unwrap();
        let dir_v2 = tempdir().unwrap();
        let settings = || ContainerWriterSettings {
            compression_block_size: 1024,
            compression_method: Some("Zlib".to_string()),
            ..ContainerWriterSettings::default()
        };

        let mut writer = ContainerWriter::new("game", settings()).unwrap();
        writer
            .append(id(1), IoBuffer::from_vec(patterned(3_000)), WriteOptions::default())
            .unwrap();
        writer
            .append(id(2), IoBuffer::from_vec(patterned(500)), WriteOptions::default())
            .unwrap();
        writer.finish(dir_v1.path()).unwrap();

        let prior =
            Arc::new(ContainerReader::open(dir_v1.path(), "game", &NoKeys, None).unwrap());
        let mut writer = ContainerWriter::new("game", settings()).unwrap();
        writer.add_prior_version(Arc::clone(&prior));
        writer
            .append(id(1), IoBuffer::from_vec(patterned(3_000)), WriteOptions::default())
            .unwrap();
        writer
            .append(id(2), IoBuffer::from_vec(vec![9u8; 500]), WriteOptions::default())
            .unwrap();
        writer
            .append(id(3), IoBuffer::from_vec(patterned(100)), WriteOptions::default())
            .unwrap();
        let result = writer.finish(dir_v2.path()).unwrap();
        assert_eq!(result.unchanged_chunks, 1);
        assert_eq!(result.modified_chunks, 1);
        assert_eq!(result.added_chunks, 1);

        let reader = ContainerReader::open(dir_v2.path(), "game", &NoKeys, None).unwrap();
        assert_eq!(
            reader.read(id(1), ReadOptions::whole()).unwrap().as_slice(),
            patterned(3_000).as_slice()
        );
        assert_eq!(
            reader.read(id(2), ReadOptions::whole()).unwrap().as_slice(),
            vec![9u8; 500].as_slice()
        );
    }

    #[test]
    fn test_dedup_skipped_when_storage_options_change() {
        let dir_v1 = tempdir().unwrap();
        let dir_v2 = tempdir().unwrap();
        let settings = || ContainerWriterSettings {
            compression_block_size: 1024,
            compression_method: Some("Zlib".to_string()),
            ..ContainerWriterSettings::default()
        };

        let mut writer = ContainerWriter::new("opts", settings()).unwrap();
        writer
            .append(id(1), IoBuffer::from_vec(patterned(3_000)), WriteOptions::default())
            .unwrap();
        writer.finish(dir_v1.path()).unwrap();

        // The prior copy is compressed; asking for raw storage must
        // re-store the chunk instead of copying compressed blocks
        let prior =
            Arc::new(ContainerReader::open(dir_v1.path(), "opts", &NoKeys, None).unwrap());
        let mut writer = ContainerWriter::new("opts", settings()).unwrap();
        writer.add_prior_version(prior);
        writer
            .append(
                id(1),
                IoBuffer::from_vec(patterned(3_000)),
                WriteOptions {
                    force_uncompressed: true,
                    ..WriteOptions::default()
                },
            )
            .unwrap();
        let result = writer.finish(dir_v2.path()).unwrap();
        assert_eq!(result.unchanged_chunks, 0);
        assert_eq!(result.modified_chunks, 1);

        let reader = ContainerReader::open(dir_v2.path(), "opts", &NoKeys, None).unwrap();
        assert!(reader.toc().blocks.iter().all(|b| b.codec_index == 0));
        assert_eq!(
            reader.read(id(1), ReadOptions::whole()).unwrap().as_slice(),
            patterned(3_000).as_slice()
        );
    }

    #[test]
    fn test_deterministic_output() {
        let build = |dir: &Path| {
            let guid = Uuid::from_u128(7);
            let settings = ContainerWriterSettings {
                compression_block_size: 2048,
                compression_method: Some("Zstd".to_string()),
                encryption: Some((guid, [0x11; 32])),
                ..ContainerWriterSettings::default()
            };
            let mut writer = ContainerWriter::new("same", settings).unwrap();
            writer
                .append(
                    id(1),
                    IoBuffer::from_vec(patterned(5_000)),
                    WriteOptions {
                        file_name: Some("a.bin".to_string()),
                        ..WriteOptions::default()
                    },
                )
                .unwrap();
            writer
                .append(id(2), IoBuffer::from_vec(patterned(64)), WriteOptions::default())
                .unwrap();
            writer.finish(dir).unwrap();
        };

        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        build(dir_a.path());
        build(dir_b.path());

        for file in ["same.toc", "same.cas"] {
            assert_eq!(
                std::fs::read(dir_a.path().join(file)).unwrap(),
                std::fs::read(dir_b.path().join(file)).unwrap(),
                "{} differs between identical runs",
                file
            );
        }
    }

    #[test]
    fn test_append_rejects_bad_ids() {
        let mut writer =
            ContainerWriter::new("ids", ContainerWriterSettings::default()).unwrap();
        assert!(writer
            .append(ChunkId::INVALID, IoBuffer::empty(), WriteOptions::default())
            .is_err());
        writer
            .append(id(1), IoBuffer::empty(), WriteOptions::default())
            .unwrap();
        let err = writer
            .append(id(1), IoBuffer::empty(), WriteOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn test_empty_chunk_round_trip() {
        let dir = tempdir().unwrap();
        let mut writer =
            ContainerWriter::new("empty", ContainerWriterSettings::default()).unwrap();
        writer
            .append(id(5), IoBuffer::empty(), WriteOptions::default())
            .unwrap();
        writer.finish(dir.path()).unwrap();

        let reader = ContainerReader::open(dir.path(), "empty", &NoKeys, None).unwrap();
        assert_eq!(reader.chunk_info(id(5)).unwrap().size, 0);
        assert!(reader.read(id(5), ReadOptions::whole()).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_chunk_is_an_error() {
        let dir = tempdir().unwrap();
        let mut writer =
            ContainerWriter::new("missing", ContainerWriterSettings::default()).unwrap();
        writer
            .append(id(1), IoBuffer::from_vec(vec![1]), WriteOptions::default())
            .unwrap();
        writer.finish(dir.path()).unwrap();

        let reader = ContainerReader::open(dir.path(), "missing", &NoKeys, None).unwrap();
        let err = reader.read(id(404), ReadOptions::whole()).unwrap_err();
        assert!(matches!(err, Error::UnknownChunkId(_)));
    }

    #[test]
    fn test_incompressible_blocks_stored_raw() {
        let dir = tempdir().unwrap();
        let settings = ContainerWriterSettings {
            compression_method: Some("Zlib".to_string()),
            ..ContainerWriterSettings::default()
        };
        let mut writer = ContainerWriter::new("raw", settings).unwrap();
        // High-entropy payload the codec cannot shrink
        let mut state = 0x12345678u32;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect();
        writer
            .append(id(1), IoBuffer::from_vec(noise.clone()), WriteOptions::default())
            .unwrap();
        writer.finish(dir.path()).unwrap();

        let reader = ContainerReader::open(dir.path(), "raw", &NoKeys, None).unwrap();
        assert!(reader.toc().blocks.iter().all(|b| b.codec_index == 0));
        assert_eq!(
            reader.read(id(1), ReadOptions::whole()).unwrap().as_slice(),
            noise.as_slice()
        );
    }
}
