//! Reference-counted byte buffer handed to read callers.
//!
//! An [`IoBuffer`] is a `(storage, offset, len)` triple. Storage is either
//! owned heap memory or an external region (a memory-mapped file) kept
//! alive through a shared handle. Views share the storage of their outer
//! buffer, so the outer allocation outlives every view cut from it.
//!
//! Cloning an `IoBuffer` is cheap (bumps the storage refcount); use
//! [`IoBuffer::clone_from_slice`] for a deep copy into fresh owned
//! storage.

use crate::status::{Error, Result};
use std::sync::Arc;

/// Byte storage that lives outside the buffer's own allocation, such as a
/// memory-mapped file region. The implementor guarantees the bytes stay
/// valid and immutable for its own lifetime.
pub trait ExternalBytes: Send + Sync {
    /// The full byte region backing buffers that wrap this storage.
    fn bytes(&self) -> &[u8];
}

enum Storage {
    Owned(Box<[u8]>),
    External(Arc<dyn ExternalBytes>),
}

impl Storage {
    fn bytes(&self) -> &[u8] {
        match self {
            Storage::Owned(bytes) => bytes,
            Storage::External(ext) => ext.bytes(),
        }
    }
}

/// Reference-counted byte buffer with owned and wrapped storage modes.
#[derive(Clone)]
pub struct IoBuffer {
    storage: Arc<Storage>,
    offset: usize,
    len: usize,
}

impl IoBuffer {
    /// Allocate `len` bytes of zeroed owned storage.
    pub fn alloc(len: usize) -> Self {
        IoBuffer {
            storage: Arc::new(Storage::Owned(vec![0u8; len].into_boxed_slice())),
            offset: 0,
            len,
        }
    }

    /// Take ownership of an existing allocation.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        IoBuffer {
            storage: Arc::new(Storage::Owned(bytes.into_boxed_slice())),
            offset: 0,
            len,
        }
    }

    /// Deep-clone a byte range into fresh owned storage.
    pub fn clone_from_slice(bytes: &[u8]) -> Self {
        Self::from_vec(bytes.to_vec())
    }

    /// Wrap a range of external storage without copying. The buffer holds
    /// the storage handle, so the region stays alive while any buffer or
    /// view references it.
    pub fn external(storage: Arc<dyn ExternalBytes>, offset: usize, len: usize) -> Result<Self> {
        let total = storage.bytes().len();
        if offset.checked_add(len).map_or(true, |end| end > total) {
            return Err(Error::InvalidParameter(format!(
                "external range {}..{} exceeds storage of {} bytes",
                offset,
                offset + len,
                total
            )));
        }
        Ok(IoBuffer {
            storage: Arc::new(Storage::External(storage)),
            offset,
            len,
        })
    }

    /// An empty owned buffer.
    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Cut a view out of this buffer. The view shares storage with its
    /// outer buffer and keeps the outer allocation alive.
    pub fn view(&self, offset: usize, len: usize) -> Result<Self> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(Error::InvalidParameter(format!(
                "view range {}..{} exceeds buffer of {} bytes",
                offset,
                offset + len,
                self.len
            )));
        }
        Ok(IoBuffer {
            storage: Arc::clone(&self.storage),
            offset: self.offset + offset,
            len,
        })
    }

    /// Number of visible bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The visible bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.storage.bytes()[self.offset..self.offset + self.len]
    }

    /// Mutable access to the visible bytes. Only possible while the
    /// storage is owned and not shared with any other buffer or view.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let (offset, len) = (self.offset, self.len);
        match Arc::get_mut(&mut self.storage)? {
            Storage::Owned(bytes) => Some(&mut bytes[offset..offset + len]),
            Storage::External(_) => None,
        }
    }

    /// Release the underlying allocation to the caller.
    ///
    /// Succeeds only when the buffer owns its storage exclusively; views,
    /// external storage, and shared buffers fail with `InvalidParameter`.
    pub fn into_vec(self) -> Result<Vec<u8>> {
        let (offset, len) = (self.offset, self.len);
        match Arc::try_unwrap(self.storage) {
            Ok(Storage::Owned(bytes)) => {
                let mut vec = bytes.into_vec();
                if offset != 0 || len != vec.len() {
                    vec = vec[offset..offset + len].to_vec();
                }
                Ok(vec)
            }
            Ok(Storage::External(_)) => Err(Error::InvalidParameter(
                "buffer does not own its storage".to_string(),
            )),
            Err(shared) => {
                drop(shared);
                Err(Error::InvalidParameter(
                    "buffer storage is shared".to_string(),
                ))
            }
        }
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl AsRef<[u8]> for IoBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedBytes(Vec<u8>);

    impl ExternalBytes for FixedBytes {
        fn bytes(&self) -> &[u8] {
            &self.0
        }
    }

    #[test]
    fn test_alloc_is_zeroed() {
        let buf = IoBuffer::alloc(16);
        assert_eq!(buf.len(), 16);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_clone_from_slice_is_deep() {
        let src = b"HELLO".to_vec();
        let buf = IoBuffer::clone_from_slice(&src);
        assert_eq!(buf.as_slice(), b"HELLO");
        assert_ne!(buf.as_slice().as_ptr(), src.as_ptr());
        // Clone owns its storage and can release it
        assert_eq!(buf.into_vec().unwrap(), src);
    }

    #[test]
    fn test_view_shares_storage_and_keeps_it_alive() {
        let outer = IoBuffer::from_vec((0u8..64).collect());
        let view = outer.view(8, 16).unwrap();
        drop(outer);
        // View still reads valid bytes after the outer handle is gone
        assert_eq!(view.as_slice(), &(8u8..24).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn test_view_out_of_range() {
        let buf = IoBuffer::alloc(8);
        assert!(buf.view(4, 8).is_err());
        assert!(buf.view(9, 0).is_err());
        assert!(buf.view(0, 8).is_ok());
    }

    #[test]
    fn test_into_vec_fails_for_views_and_shared() {
        let buf = IoBuffer::from_vec(vec![1, 2, 3, 4]);
        let view = buf.view(0, 2).unwrap();
        // Storage is shared between buf and view
        assert!(view.into_vec().is_err());

        let clone = buf.clone();
        assert!(clone.into_vec().is_err());
        // After dropping the only other handle, release succeeds
        assert_eq!(buf.into_vec().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_into_vec_of_subrange_view_when_unique() {
        let buf = IoBuffer::from_vec(vec![1, 2, 3, 4, 5, 6]);
        let view = buf.view(2, 3).unwrap();
        drop(buf);
        // View is now the sole owner; release copies out the visible range
        assert_eq!(view.into_vec().unwrap(), vec![3, 4, 5]);
    }

    #[test]
    fn test_external_storage_cannot_be_released_or_mutated() {
        let storage: Arc<dyn ExternalBytes> = Arc::new(FixedBytes(vec![9u8; 32]));
        let mut buf = IoBuffer::external(storage, 4, 8).unwrap();
        assert_eq!(buf.as_slice(), &[9u8; 8]);
        assert!(buf.as_mut_slice().is_none());
        assert!(buf.into_vec().is_err());
    }

    #[test]
    fn test_external_range_validation() {
        let storage: Arc<dyn ExternalBytes> = Arc::new(FixedBytes(vec![0u8; 8]));
        assert!(IoBuffer::external(Arc::clone(&storage), 4, 8).is_err());
        assert!(IoBuffer::external(storage, 0, 8).is_ok());
    }

    #[test]
    fn test_as_mut_slice_requires_unique_ownership() {
        let mut buf = IoBuffer::alloc(4);
        buf.as_mut_slice().unwrap().copy_from_slice(b"abcd");
        assert_eq!(buf.as_slice(), b"abcd");

        let other = buf.clone();
        assert!(buf.as_mut_slice().is_none());
        drop(other);
        assert!(buf.as_mut_slice().is_some());
    }

    #[test]
    fn test_zero_byte_buffer() {
        let buf = IoBuffer::empty();
        assert!(buf.is_empty());
        assert_eq!(buf.as_slice(), b"");
    }
}
