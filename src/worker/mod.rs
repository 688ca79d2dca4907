//! Workers: realms running on dedicated threads.
//!
//! A [`Worker`] is created in a parent realm. It owns a privileged port
//! entangled with a channel half that the worker thread adopts when it
//! starts, so the parent may post messages before the thread exists.
//!
//! # Lifecycle
//!
//! ```text
//! Created --start_thread--> Started --exit / error / OOM / idle--> Stopping --join--> Stopped
//! ```
//!
//! Failures inside the worker never unwind into the parent. They travel back
//! as control messages and surface as [`WorkerError`] events, followed by
//! the exit event once the thread has torn its realm down.

mod formatter;
mod options;
mod thread;
mod worker;

pub use self::formatter::DefaultFormatter;
pub use self::formatter::ErrorFormatter;
pub use self::options::ResourceLimits;
pub use self::options::WorkerOptions;
pub use self::worker::Worker;

pub(crate) use self::worker::WorkerInner;

use std::error::Error;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;

// -----------------------------------------------------------------------------
// Worker Error
// -----------------------------------------------------------------------------

/// A failure reported by a worker thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerError {
  /// The worker realm exhausted its heap budget.
  OutOfMemory,
  /// An uncaught error, as rendered by the worker's [`ErrorFormatter`].
  Uncaught(Box<[u8]>),
  /// An uncaught error that the formatter could not render.
  Unserializable,
}

impl WorkerError {
  /// Returns the rendered report of an uncaught error, lossily decoded as
  /// UTF-8.
  pub fn message(&self) -> Option<String> {
    match self {
      Self::Uncaught(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
      Self::OutOfMemory | Self::Unserializable => None,
    }
  }
}

impl Display for WorkerError {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    match self {
      Self::OutOfMemory => f.write_str("worker terminated due to reaching memory limit"),
      Self::Uncaught(bytes) => {
        write!(f, "uncaught error in worker: {}", String::from_utf8_lossy(bytes))
      }
      Self::Unserializable => f.write_str("worker raised an error that could not be serialized"),
    }
  }
}

impl Error for WorkerError {}
