//! # iostore
//!
//! Content-addressed package I/O: partitioned container archives with an
//! asynchronous, prioritized read dispatcher.
//!
//! A *container* is one table-of-contents file (`<name>.toc`) plus one or
//! more partition data files (`<name>.cas`, `<name>_1.cas`, ...). Chunks
//! are addressed by a stable 12-byte [`ChunkId`] and stored as fixed-size
//! compression blocks that can be individually compressed, encrypted, and
//! signed. The [`IoDispatcher`] mounts containers at runtime and serves
//! prioritized chunk reads from worker threads.
//!
//! ## Quick Start
//!
//! ```ignore
//! use iostore::prelude::*;
//!
//! // Produce a container
//! let mut writer = ContainerWriter::new("game", ContainerWriterSettings {
//!     compression_method: Some("Zlib".to_string()),
//!     ..ContainerWriterSettings::default()
//! })?;
//! writer.append(chunk_id, IoBuffer::from_vec(bytes), WriteOptions::default())?;
//! writer.finish(&out_dir)?;
//!
//! // Serve reads from it
//! let dispatcher = IoDispatcher::new(DispatcherConfig::default())?;
//! dispatcher.mount(&out_dir, "game", 0)?;
//! let data = dispatcher.read_chunk(chunk_id, IoPriority::HIGH)?;
//! ```
//!
//! ## Layers
//!
//! - [`iostore_core`](iostore_core) - identifiers, buffers, errors
//! - [`iostore_container`](iostore_container) - the on-disk format:
//!   [`ContainerReader`], [`ContainerWriter`], codecs, crypto
//! - [`iostore_dispatch`](iostore_dispatch) - [`IoDispatcher`], mount
//!   table, request batches, completion events

#![warn(missing_docs)]

pub mod prelude;

// Identifiers, buffers, and the error taxonomy
pub use iostore_core::{
    ChunkHash, ChunkId, ChunkType, ContainerId, Error, ExternalBytes, IoBuffer, IoErrorCode,
    IoPriority, RequestStatus, Result,
};

// Container format
pub use iostore_container::{
    AesKey, ChunkInfo, CodecRegistry, CompressionCodec, ContainerFlags, ContainerReader,
    ContainerWriter, ContainerWriterSettings, DirectoryIndexReader, EncryptionKeyProvider,
    ReadOptions, WriteOptions, WriterResult, ZlibCodec, ZstdCodec,
};

// Dispatcher
pub use iostore_dispatch::{
    CompletionToken, DispatcherConfig, IoBatch, IoDispatcher, IoEvent, IoRequest, KeyRegistry,
    MountChange, MountEvent, MountedContainerInfo, SignatureErrorEvent,
};

// Key GUIDs in the public API are plain `uuid::Uuid`s
pub use uuid::Uuid;
