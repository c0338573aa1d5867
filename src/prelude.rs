//! Convenient imports for iostore.
//!
//! Re-exports the types most programs touch so one import is enough:
//!
//! ```ignore
//! use iostore::prelude::*;
//!
//! let dispatcher = IoDispatcher::new(DispatcherConfig::default())?;
//! dispatcher.mount(&dir, "game", 0)?;
//! ```

// Identifiers and buffers
pub use iostore_core::{ChunkHash, ChunkId, ChunkType, ContainerId, IoBuffer, IoPriority};

// Error handling
pub use iostore_core::{Error, IoErrorCode, RequestStatus, Result};

// Writing containers
pub use iostore_container::{
    ContainerWriter, ContainerWriterSettings, WriteOptions, WriterResult,
};

// Reading containers directly (without a dispatcher)
pub use iostore_container::{ChunkInfo, ContainerReader, ReadOptions};

// Dispatching
pub use iostore_dispatch::{
    DispatcherConfig, IoBatch, IoDispatcher, IoEvent, IoRequest,
};

// Key GUIDs
pub use uuid::Uuid;
