//! Asynchronous, prioritized chunk read dispatching.
//!
//! [`IoDispatcher`] owns a mount table of open containers and a pool of
//! worker threads draining a priority queue of read requests. Callers
//! stage requests individually or in batches; completion is observable
//! by polling, per-request callbacks, one-shot events, or chained
//! completion tokens.
//!
//! ## Module Structure
//!
//! - `dispatcher`: [`IoDispatcher`], [`IoBatch`], the queue and workers
//! - `request`: [`IoRequest`] handles and batch countdown state
//! - `mounts`: [`MountTable`] ordering/shadowing and [`KeyRegistry`]
//! - `events`: [`IoEvent`], [`CompletionToken`], multicast payloads

pub mod dispatcher;
pub mod events;
pub mod mounts;
pub mod request;

pub use dispatcher::{DispatcherConfig, IoBatch, IoDispatcher};
pub use events::{CompletionToken, IoEvent, MountChange, MountEvent, SignatureErrorEvent};
pub use mounts::{KeyRegistry, MountTable, MountedContainerInfo};
pub use request::IoRequest;
