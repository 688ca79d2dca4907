use crossbeam_utils::CachePadded;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU8;

use crate::buffer::BackingStore;
use crate::buffer::SharedArrayBuffer;
use crate::error::MessageError;
use crate::error::fatal;
use crate::loom::sync::atomic::AtomicUsize;
use crate::loom::sync::atomic::Ordering;
use crate::loom::sync::atomic::fence;

/// Upper bound on the refcount, far below the point of overflow.
const MAX_REFCOUNT: usize = isize::MAX as usize;

struct SegmentData {
  refs: CachePadded<AtomicUsize>,
  store: BackingStore,
}

// -----------------------------------------------------------------------------
// Shared Segment
// -----------------------------------------------------------------------------

/// A reference to memory shared by any number of realms on any threads.
///
/// Every `SharedSegment` value is one reference: cloning increments the
/// refcount and dropping decrements it. The storage is freed exactly once,
/// when the last reference anywhere is released.
pub struct SharedSegment {
  data: NonNull<SegmentData>,
}

// SAFETY: The refcount is atomic and the storage is only accessed through
//         atomic views once shared.
unsafe impl Send for SharedSegment {}

// SAFETY: See above.
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
  /// Creates a segment owning `store`, with a refcount of one.
  pub fn new(store: BackingStore) -> Self {
    let data: Box<SegmentData> = Box::new(SegmentData {
      refs: CachePadded::new(AtomicUsize::new(1)),
      store,
    });

    Self {
      data: NonNull::from(Box::leak(data)),
    }
  }

  /// Returns a segment reference for a realm-local shared buffer.
  ///
  /// If `buffer` is already backed by a segment, a new reference to that
  /// segment is returned. Otherwise the buffer's storage is externalized into
  /// a new segment and the buffer is re-tagged with it, so sharing the same
  /// buffer again yields the same segment.
  ///
  /// # Errors
  ///
  /// Returns [`MessageError::ForeignExternalBuffer`] if the buffer's memory
  /// is owned by something outside this crate.
  pub fn for_existing(buffer: &SharedArrayBuffer) -> Result<Self, MessageError> {
    buffer.externalize()
  }

  /// Creates a realm-local view of this segment.
  ///
  /// The view holds its own reference, released when the last handle to the
  /// view is dropped.
  #[inline]
  pub fn attach(&self) -> SharedArrayBuffer {
    SharedArrayBuffer::from_segment(self.clone())
  }

  #[inline]
  fn data(&self) -> &SegmentData {
    // SAFETY: `data` stays valid while any reference exists.
    unsafe { self.data.as_ref() }
  }

  /// Returns the size of the segment in bytes.
  #[inline]
  pub fn len(&self) -> usize {
    self.data().store.len()
  }

  /// Returns `true` if the segment holds no bytes.
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Returns the number of outstanding references.
  ///
  /// The value may be stale by the time it is observed if other threads hold
  /// references.
  #[inline]
  pub fn ref_count(&self) -> usize {
    self.data().refs.load(Ordering::Acquire)
  }

  /// Returns `true` if both references point to the same segment.
  #[inline]
  pub fn ptr_eq(&self, other: &Self) -> bool {
    self.data == other.data
  }

  #[inline]
  pub(crate) fn as_atomic(&self) -> &[AtomicU8] {
    self.data().store.as_atomic()
  }
}

impl Clone for SharedSegment {
  fn clone(&self) -> Self {
    let old: usize = self.data().refs.fetch_add(1, Ordering::Relaxed);

    if old > MAX_REFCOUNT {
      fatal!("shared segment refcount overflow");
    }

    Self { data: self.data }
  }
}

impl Drop for SharedSegment {
  fn drop(&mut self) {
    if self.data().refs.fetch_sub(1, Ordering::Release) != 1 {
      return;
    }

    fence(Ordering::Acquire);

    // SAFETY: This was the last reference; no other thread can observe
    //         `data` anymore.
    drop(unsafe { Box::from_raw(self.data.as_ptr()) });
  }
}

impl Debug for SharedSegment {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("SharedSegment")
      .field("len", &self.len())
      .field("refs", &self.ref_count())
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicU8;
  use std::thread;

  use crate::buffer::BackingStore;
  use crate::buffer::SharedArrayBuffer;
  use crate::buffer::SharedSegment;
  use crate::error::MessageError;

  #[test]
  fn test_clone_and_drop_track_refcount() {
    let segment: SharedSegment = SharedSegment::new(BackingStore::zeroed(8));
    let second: SharedSegment = segment.clone();

    assert_eq!(segment.ref_count(), 2);
    assert!(segment.ptr_eq(&second));

    drop(second);
    assert_eq!(segment.ref_count(), 1);
  }

  #[test]
  fn test_share_twice_creates_one_segment() {
    let buffer: SharedArrayBuffer = SharedArrayBuffer::from(&b"abcd"[..]);

    let first: SharedSegment = SharedSegment::for_existing(&buffer).unwrap();
    let again: SharedSegment = SharedSegment::for_existing(&buffer).unwrap();

    assert!(first.ptr_eq(&again));
    // buffer tag + two returned references
    assert_eq!(first.ref_count(), 3);
  }

  #[test]
  fn test_attach_and_release() {
    const VIEWS: usize = 5;

    let segment: SharedSegment = SharedSegment::new(BackingStore::from_slice(b"xyz"));
    let mut views: Vec<SharedArrayBuffer> = (0..VIEWS).map(|_| segment.attach()).collect();

    assert_eq!(segment.ref_count(), VIEWS + 1);

    for _ in 0..VIEWS - 1 {
      views.pop();
    }

    assert_eq!(segment.ref_count(), 2);
    assert_eq!(views[0].to_vec(), b"xyz");

    let view: SharedArrayBuffer = views.pop().unwrap();
    let again: SharedSegment = SharedSegment::for_existing(&view).unwrap();

    assert!(again.ptr_eq(&segment));
  }

  #[test]
  fn test_foreign_buffer_rejected() {
    let memory: Vec<AtomicU8> = (0..4).map(|_| AtomicU8::new(0)).collect();
    let memory: &'static [AtomicU8] = Box::leak(memory.into_boxed_slice());
    let buffer: SharedArrayBuffer = SharedArrayBuffer::external(memory);

    assert_eq!(
      SharedSegment::for_existing(&buffer).unwrap_err(),
      MessageError::ForeignExternalBuffer,
    );
  }

  #[test]
  fn test_cross_thread_writes_visible() {
    let buffer: SharedArrayBuffer = SharedArrayBuffer::new(4);
    let segment: SharedSegment = SharedSegment::for_existing(&buffer).unwrap();

    thread::spawn(move || {
      let view: SharedArrayBuffer = segment.attach();
      view.store(2, 9);
    })
    .join()
    .unwrap();

    assert_eq!(buffer.load(2), 9);
  }
}
