use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::ptr;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::AtomicU8;

use crate::loom::alloc::Layout;
use crate::loom::alloc::alloc;
use crate::loom::alloc::dealloc;

/// An owned, externalized byte allocation.
///
/// This is the raw storage behind every buffer. It can be moved between
/// threads, which is how a transferred buffer travels inside a [`Message`]
/// without copying, and how a shared segment owns its memory.
///
/// [`Message`]: crate::port::Message
pub struct BackingStore {
  ptr: NonNull<u8>,
  len: usize,
}

// SAFETY: `BackingStore` uniquely owns its allocation.
unsafe impl Send for BackingStore {}

// SAFETY: Shared access only hands out `&[u8]` or atomic views.
unsafe impl Sync for BackingStore {}

impl BackingStore {
  /// Allocates a zero-filled store of `len` bytes.
  pub fn zeroed(len: usize) -> Self {
    if len == 0 {
      return Self::empty();
    }

    let layout: Layout = Self::layout(len);

    // SAFETY: `layout` has a non-zero size.
    let raw: *mut u8 = unsafe { alloc(layout) };

    let Some(ptr) = NonNull::new(raw) else {
      std::alloc::handle_alloc_error(layout);
    };

    // SAFETY: `ptr` points to `len` freshly allocated bytes.
    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, len) };

    Self { ptr, len }
  }

  /// Allocates a store holding a copy of `data`.
  pub fn from_slice(data: &[u8]) -> Self {
    let mut this: Self = Self::zeroed(data.len());
    this.as_mut_slice().copy_from_slice(data);
    this
  }

  #[inline]
  const fn empty() -> Self {
    Self {
      ptr: NonNull::dangling(),
      len: 0,
    }
  }

  #[inline]
  fn layout(len: usize) -> Layout {
    match Layout::array::<u8>(len) {
      Ok(layout) => layout,
      Err(_) => std::alloc::handle_alloc_error(Layout::new::<u8>()),
    }
  }

  /// Returns the size of the store in bytes.
  #[inline]
  pub const fn len(&self) -> usize {
    self.len
  }

  /// Returns `true` if the store holds no bytes.
  #[inline]
  pub const fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[inline]
  pub fn as_slice(&self) -> &[u8] {
    // SAFETY: `ptr` is valid for `len` bytes for the lifetime of `self`.
    unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
  }

  #[inline]
  pub fn as_mut_slice(&mut self) -> &mut [u8] {
    // SAFETY: `ptr` is valid for `len` bytes and `self` is borrowed mutably.
    unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
  }

  /// Returns a view of the store that may be read and written concurrently.
  #[inline]
  pub(crate) fn as_atomic(&self) -> &[AtomicU8] {
    // SAFETY: `AtomicU8` has the same layout as `u8`, and once the store is
    //         shared every access goes through this atomic view.
    unsafe { slice::from_raw_parts(self.ptr.as_ptr().cast::<AtomicU8>(), self.len) }
  }
}

impl Drop for BackingStore {
  fn drop(&mut self) {
    if self.len != 0 {
      // SAFETY: `ptr` was allocated by `alloc` with this exact layout.
      unsafe { dealloc(self.ptr.as_ptr(), Self::layout(self.len)) }
    }
  }
}

impl Debug for BackingStore {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "BackingStore({} bytes)", self.len)
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
