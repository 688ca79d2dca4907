use std::cell::RefCell;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::rc::Rc;

use crate::buffer::BackingStore;
use crate::error::raise;

/// A realm-local byte buffer that may be transferred to another realm.
///
/// Clones are handles to the same buffer. Transferring the buffer
/// [detaches] it: every handle in the sending realm then sees an empty,
/// unusable buffer while the storage moves to the receiver untouched.
///
/// [detaches]: Self::detach
#[derive(Clone)]
pub struct ArrayBuffer {
  store: Rc<RefCell<Option<BackingStore>>>,
}

impl ArrayBuffer {
  /// Creates a zero-filled buffer of `len` bytes.
  #[inline]
  pub fn new(len: usize) -> Self {
    Self::from_store(BackingStore::zeroed(len))
  }

  /// Wraps an existing store without copying.
  #[inline]
  pub fn from_store(store: BackingStore) -> Self {
    Self {
      store: Rc::new(RefCell::new(Some(store))),
    }
  }

  /// Returns the buffer size in bytes, or `0` once detached.
  #[inline]
  pub fn byte_length(&self) -> usize {
    self.store.borrow().as_ref().map_or(0, BackingStore::len)
  }

  /// Returns `true` if the storage has been moved out of this buffer.
  #[inline]
  pub fn is_detached(&self) -> bool {
    self.store.borrow().is_none()
  }

  /// Calls `f` with the buffer contents (empty once detached).
  pub fn with_bytes<F, R>(&self, f: F) -> R
  where
    F: FnOnce(&[u8]) -> R,
  {
    match self.store.borrow().as_ref() {
      Some(store) => f(store.as_slice()),
      None => f(&[]),
    }
  }

  /// Returns a copy of the buffer contents.
  #[inline]
  pub fn to_vec(&self) -> Vec<u8> {
    self.with_bytes(<[u8]>::to_vec)
  }

  /// Copies `data` into the buffer starting at `offset`.
  ///
  /// # Panics
  ///
  /// Panics if the buffer is detached or the write is out of bounds.
  pub fn write(&self, offset: usize, data: &[u8]) {
    let mut store = self.store.borrow_mut();

    let Some(store) = store.as_mut() else {
      raise!(Error, BadArg, "cannot write to a detached ArrayBuffer");
    };

    let Some(target) = offset
      .checked_add(data.len())
      .and_then(|end| store.as_mut_slice().get_mut(offset..end))
    else {
      raise!(Error, BadArg, "write out of bounds");
    };

    target.copy_from_slice(data);
  }

  /// Moves the storage out of the buffer, leaving it detached.
  ///
  /// Returns `None` if the buffer was already detached.
  #[inline]
  pub fn detach(&self) -> Option<BackingStore> {
    self.store.borrow_mut().take()
  }

  /// Returns `true` if both handles refer to the same buffer.
  #[inline]
  pub fn ptr_eq(&self, other: &Self) -> bool {
    Rc::ptr_eq(&self.store, &other.store)
  }
}

impl From<&[u8]> for ArrayBuffer {
  #[inline]
  fn from(other: &[u8]) -> Self {
    Self::from_store(BackingStore::from_slice(other))
  }
}

impl From<Vec<u8>> for ArrayBuffer {
  #[inline]
  fn from(other: Vec<u8>) -> Self {
    Self::from(other.as_slice())
  }
}

impl Debug for ArrayBuffer {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    match self.store.borrow().as_ref() {
      Some(store) => write!(f, "ArrayBuffer({} bytes)", store.len()),
      None => f.write_str("ArrayBuffer(detached)"),
    }
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use std::panic;
  use std::panic::AssertUnwindSafe;

  use crate::buffer::ArrayBuffer;
  use crate::buffer::BackingStore;

  #[test]
  fn test_detach_neuters_all_handles() {
    let buffer: ArrayBuffer = ArrayBuffer::from(&b"payload"[..]);
    let alias: ArrayBuffer = buffer.clone();

    let store: BackingStore = buffer.detach().unwrap();

    assert_eq!(store.as_slice(), b"payload");
    assert!(alias.is_detached());
    assert_eq!(alias.byte_length(), 0);
    assert!(alias.to_vec().is_empty());
    assert!(buffer.detach().is_none());
  }

  #[test]
  fn test_write() {
    let buffer: ArrayBuffer = ArrayBuffer::new(4);

    buffer.write(1, &[7, 8]);

    assert_eq!(buffer.to_vec(), vec![0, 7, 8, 0]);
  }

  #[test]
  fn test_write_out_of_bounds() {
    let buffer: ArrayBuffer = ArrayBuffer::new(2);

    assert!(panic::catch_unwind(AssertUnwindSafe(|| buffer.write(1, &[1, 2]))).is_err());
  }

  #[test]
  fn test_identity() {
    let buffer: ArrayBuffer = ArrayBuffer::new(1);

    assert!(buffer.ptr_eq(&buffer.clone()));
    assert!(!buffer.ptr_eq(&ArrayBuffer::new(1)));
  }
}
