use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use tokio::sync::Notify;
use triomphe::Arc;

struct LoopShared {
  stop: AtomicBool,
  terminate: AtomicBool,
  notify: Notify,
}

/// A thread-safe handle that interrupts a realm's event loop.
///
/// [`stop`] makes the current (or next) [`Realm::run`] return once; it is
/// cleared when `run` returns. [`terminate`] is sticky: the loop stops and
/// never runs again, which is how in-flight execution of a worker is
/// aborted from the parent thread.
///
/// [`stop`]: Self::stop
/// [`terminate`]: Self::terminate
/// [`Realm::run`]: crate::realm::Realm::run
#[derive(Clone)]
pub struct LoopHandle {
  shared: Arc<LoopShared>,
}

impl LoopHandle {
  pub(crate) fn new() -> Self {
    Self {
      shared: Arc::new(LoopShared {
        stop: AtomicBool::new(false),
        terminate: AtomicBool::new(false),
        notify: Notify::new(),
      }),
    }
  }

  /// Asks the loop to return from its current run.
  #[inline]
  pub fn stop(&self) {
    self.shared.stop.store(true, Ordering::Release);
    self.shared.notify.notify_one();
  }

  /// Asks the loop to stop for good.
  #[inline]
  pub fn terminate(&self) {
    self.shared.terminate.store(true, Ordering::Release);
    self.shared.notify.notify_one();
  }

  /// Returns `true` once [`terminate`] has been called.
  ///
  /// [`terminate`]: Self::terminate
  #[inline]
  pub fn is_terminating(&self) -> bool {
    self.shared.terminate.load(Ordering::Acquire)
  }

  #[inline]
  pub(crate) fn is_stopping(&self) -> bool {
    self.shared.stop.load(Ordering::Acquire) || self.is_terminating()
  }

  #[inline]
  pub(crate) fn clear_stop(&self) {
    self.shared.stop.store(false, Ordering::Release);
  }

  /// Completes once a stop or termination has been requested.
  pub(crate) async fn stopped(&self) {
    while !self.is_stopping() {
      self.shared.notify.notified().await;
    }
  }
}

impl Debug for LoopHandle {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("LoopHandle")
      .field("stopping", &self.is_stopping())
      .field("terminating", &self.is_terminating())
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
