//! Core value types for the iostore container format and dispatcher.
//!
//! This crate holds the leaf types shared by every other layer:
//!
//! - [`ChunkId`], [`ChunkType`], [`ContainerId`], [`ChunkHash`] - stable
//!   identifiers and integrity digests for stored blobs
//! - [`IoBuffer`] - reference-counted byte buffer handed to callers
//! - [`Error`], [`IoErrorCode`], [`RequestStatus`] - the error taxonomy
//!   shared by readers, writers, and the dispatcher
//! - [`IoPriority`] - signed scheduling priority with named anchors
//!
//! Nothing in this crate touches the filesystem; it is pure data.

pub mod buffer;
pub mod identity;
pub mod priority;
pub mod status;

pub use buffer::{ExternalBytes, IoBuffer};
pub use identity::{ChunkHash, ChunkId, ChunkType, ContainerId};
pub use priority::IoPriority;
pub use status::{Error, IoErrorCode, RequestStatus, Result};
