use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::sync::Arc;

use crate::consts;
use crate::value::Value;
use crate::worker::DefaultFormatter;
use crate::worker::ErrorFormatter;

// -----------------------------------------------------------------------------
// Resource Limits
// -----------------------------------------------------------------------------

/// Limits applied to a worker's realm and thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
  /// Heap budget of the worker realm in bytes; `0` means unlimited.
  pub max_heap_size: usize,
  /// Stack size of the worker thread in bytes.
  pub stack_size: usize,
}

impl ResourceLimits {
  #[inline]
  pub const fn new() -> Self {
    Self {
      max_heap_size: consts::DEFAULT_HEAP_LIMIT,
      stack_size: consts::DEFAULT_THREAD_STACK_SIZE,
    }
  }
}

impl Default for ResourceLimits {
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

// -----------------------------------------------------------------------------
// Worker Options
// -----------------------------------------------------------------------------

/// Options used to construct a [`Worker`].
///
/// [`Worker`]: crate::worker::Worker
#[derive(Clone)]
pub struct WorkerOptions {
  pub limits: ResourceLimits,
  /// Value copied into the worker realm, see [`Realm::worker_data`].
  ///
  /// [`Realm::worker_data`]: crate::realm::Realm::worker_data
  pub worker_data: Value,
  /// Formats uncaught errors raised inside the worker for the parent.
  pub formatter: Arc<dyn ErrorFormatter>,
}

impl WorkerOptions {
  #[inline]
  pub fn new() -> Self {
    Self {
      limits: ResourceLimits::new(),
      worker_data: Value::Undefined,
      formatter: Arc::new(DefaultFormatter),
    }
  }

  #[inline]
  pub fn limits(mut self, limits: ResourceLimits) -> Self {
    self.limits = limits;
    self
  }

  #[inline]
  pub fn worker_data(mut self, value: impl Into<Value>) -> Self {
    self.worker_data = value.into();
    self
  }

  #[inline]
  pub fn formatter(mut self, formatter: impl ErrorFormatter + 'static) -> Self {
    self.formatter = Arc::new(formatter);
    self
  }
}

impl Default for WorkerOptions {
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

impl Debug for WorkerOptions {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("WorkerOptions")
      .field("limits", &self.limits)
      .field("worker_data", &self.worker_data)
      .finish_non_exhaustive()
  }
}
