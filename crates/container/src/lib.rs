//! Container archive format: reader, writer, and supporting pieces.
//!
//! A container is one TOC file (`<name>.toc`) plus one or more partition
//! data files (`<name>.cas`, `<name>_1.cas`, ...). The TOC holds all
//! framing: the sorted chunk id array, per-chunk offsets and hashes, the
//! compression block array, codec names, optional signatures, and an
//! optional directory index. Partition files are raw concatenations of
//! (optionally encrypted) compression blocks with no per-block headers.
//!
//! Reader and writer live side by side in this crate because the writer
//! deduplicates blocks against readers of prior container versions.
//!
//! ## Module Structure
//!
//! - `toc`: on-disk TOC layout (format version 1), parse and serialize
//! - `index`: directory index builder and reader
//! - `codec`: compression codec registry (Zlib, Zstd)
//! - `crypto`: AES-256-CBC block encryption, SHA-1 digests, RSA signatures
//! - `file`: positional file handle and memory-mapped regions
//! - `reader`: [`ContainerReader`] - mount-side chunk access
//! - `writer`: [`ContainerWriter`] - offline producer of the format

pub mod codec;
pub mod crypto;
pub mod file;
pub mod index;
pub mod reader;
pub mod toc;
pub mod writer;

pub use codec::{CodecRegistry, CompressionCodec, ZlibCodec, ZstdCodec};
pub use crypto::{AesKey, EncryptionKeyProvider, NoKeys, StaticKeys, AES_BLOCK_SIZE};
pub use file::{FileHandle, MappedRegion};
pub use index::{DirectoryIndexBuilder, DirectoryIndexReader, INDEX_HANDLE_INVALID};
pub use reader::{ChunkInfo, ContainerReader, ReadOptions};
pub use toc::{
    ChunkMeta, ChunkOffsetLength, CompressionBlockEntry, ContainerFlags, TocHeader, TocResource,
    CHUNK_FLAG_FORCE_UNCOMPRESSED, CHUNK_FLAG_MEMORY_MAPPED, TOC_HEADER_SIZE, TOC_MAGIC,
    TOC_VERSION,
};
pub use writer::{
    ContainerWriter, ContainerWriterSettings, WriteOptions, WriterResult,
};
