use std::num::NonZeroU64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::error::fatal;

/// A source of process-wide unique, non-zero identifiers.
///
/// Each `static` counter hands out `1, 2, 3, ...` and never wraps.
#[repr(transparent)]
pub(crate) struct UniqueId {
  last: AtomicU64,
}

impl UniqueId {
  #[inline]
  pub(crate) const fn new() -> Self {
    Self {
      last: AtomicU64::new(0),
    }
  }

  /// Returns the next identifier of this counter.
  pub(crate) fn next(&self) -> NonZeroU64 {
    let mut last: u64 = self.last.load(Ordering::Relaxed);

    'next: loop {
      let Some(id) = last.checked_add(1) else {
        exhausted();
      };

      match self
        .last
        .compare_exchange_weak(last, id, Ordering::Relaxed, Ordering::Relaxed)
      {
        // SAFETY: `id` is derived from `last + 1` and `last` never wraps.
        Ok(_) => break 'next unsafe { NonZeroU64::new_unchecked(id) },
        Err(next) => last = next,
      }
    }
  }
}

#[cold]
fn exhausted() -> ! {
  fatal!("failed to generate unique ID: bitspace exhausted")
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
