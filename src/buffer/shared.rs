use std::cell::RefCell;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::mem;
use std::rc::Rc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use crate::buffer::BackingStore;
use crate::buffer::SharedSegment;
use crate::error::MessageError;
use crate::error::raise;

enum Backing {
  /// Storage owned by this realm; not shared with anyone yet.
  Local(BackingStore),
  /// Storage externalized into a segment; this buffer holds one reference.
  Segment(SharedSegment),
  /// Storage owned by the embedder.
  Foreign(&'static [AtomicU8]),
  /// Placeholder while the backing is being swapped.
  Empty,
}

/// A realm-local view of memory that may be shared with other realms.
///
/// Sharing never copies: the first time the buffer is posted its storage is
/// externalized into a [`SharedSegment`], and every realm that receives it
/// gets a view over the same bytes. All access goes through byte-wise
/// relaxed atomics; coordinating concurrent readers and writers is up to
/// the application.
#[derive(Clone)]
pub struct SharedArrayBuffer {
  backing: Rc<RefCell<Backing>>,
}

impl SharedArrayBuffer {
  /// Creates a zero-filled shared buffer of `len` bytes.
  #[inline]
  pub fn new(len: usize) -> Self {
    Self::from_backing(Backing::Local(BackingStore::zeroed(len)))
  }

  /// Creates a view over memory owned by the embedder.
  ///
  /// Such a buffer can be used locally but never posted to another realm.
  #[inline]
  pub fn external(memory: &'static [AtomicU8]) -> Self {
    Self::from_backing(Backing::Foreign(memory))
  }

  #[inline]
  pub(crate) fn from_segment(segment: SharedSegment) -> Self {
    Self::from_backing(Backing::Segment(segment))
  }

  #[inline]
  fn from_backing(backing: Backing) -> Self {
    Self {
      backing: Rc::new(RefCell::new(backing)),
    }
  }

  /// Calls `f` with an atomic view of the bytes.
  fn with_atomic<F, R>(&self, f: F) -> R
  where
    F: FnOnce(&[AtomicU8]) -> R,
  {
    match &*self.backing.borrow() {
      Backing::Local(store) => f(store.as_atomic()),
      Backing::Segment(segment) => f(segment.as_atomic()),
      Backing::Foreign(memory) => f(memory),
      Backing::Empty => f(&[]),
    }
  }

  /// Returns the buffer size in bytes.
  #[inline]
  pub fn byte_length(&self) -> usize {
    self.with_atomic(<[AtomicU8]>::len)
  }

  /// Reads the byte at `index`.
  ///
  /// # Panics
  ///
  /// Panics if `index` is out of bounds.
  pub fn load(&self, index: usize) -> u8 {
    self.with_atomic(|bytes| match bytes.get(index) {
      Some(byte) => byte.load(Ordering::Relaxed),
      None => raise!(Error, BadArg, "index out of bounds"),
    })
  }

  /// Writes `value` at `index`.
  ///
  /// # Panics
  ///
  /// Panics if `index` is out of bounds.
  pub fn store(&self, index: usize, value: u8) {
    self.with_atomic(|bytes| match bytes.get(index) {
      Some(byte) => byte.store(value, Ordering::Relaxed),
      None => raise!(Error, BadArg, "index out of bounds"),
    })
  }

  /// Copies `data` into the buffer starting at `offset`.
  ///
  /// # Panics
  ///
  /// Panics if the write is out of bounds.
  pub fn write(&self, offset: usize, data: &[u8]) {
    self.with_atomic(|bytes| {
      let Some(target) = offset
        .checked_add(data.len())
        .and_then(|end| bytes.get(offset..end))
      else {
        raise!(Error, BadArg, "write out of bounds");
      };

      for (byte, value) in target.iter().zip(data) {
        byte.store(*value, Ordering::Relaxed);
      }
    })
  }

  /// Returns a snapshot of the buffer contents.
  pub fn to_vec(&self) -> Vec<u8> {
    self.with_atomic(|bytes| bytes.iter().map(|byte| byte.load(Ordering::Relaxed)).collect())
  }

  /// Returns the segment backing this buffer, if it has been shared.
  pub fn segment(&self) -> Option<SharedSegment> {
    match &*self.backing.borrow() {
      Backing::Segment(segment) => Some(segment.clone()),
      _ => None,
    }
  }

  /// Returns `true` if both handles refer to the same buffer.
  #[inline]
  pub fn ptr_eq(&self, other: &Self) -> bool {
    Rc::ptr_eq(&self.backing, &other.backing)
  }

  /// Returns a segment reference for this buffer, externalizing local
  /// storage on first use.
  pub(crate) fn externalize(&self) -> Result<SharedSegment, MessageError> {
    let mut backing = self.backing.borrow_mut();

    match &*backing {
      Backing::Segment(segment) => return Ok(segment.clone()),
      Backing::Foreign(_) => return Err(MessageError::ForeignExternalBuffer),
      Backing::Local(_) | Backing::Empty => {}
    }

    let Backing::Local(store) = mem::replace(&mut *backing, Backing::Empty) else {
      return Err(MessageError::DataClone("SharedArrayBuffer has no backing store"));
    };

    let segment: SharedSegment = SharedSegment::new(store);

    *backing = Backing::Segment(segment.clone());

    Ok(segment)
  }
}

impl From<&[u8]> for SharedArrayBuffer {
  #[inline]
  fn from(other: &[u8]) -> Self {
    Self::from_backing(Backing::Local(BackingStore::from_slice(other)))
  }
}

impl Debug for SharedArrayBuffer {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "SharedArrayBuffer({} bytes)", self.byte_length())
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
