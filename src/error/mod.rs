//! Error types reported by the messaging and scheduling layers.
//!
//! Send-time failures are synchronous and local to the sender: they are
//! returned as [`MessageError`] before any resource has been moved. Failures
//! inside a worker thread never cross the thread boundary as Rust errors;
//! they arrive at the parent as [`WorkerError`] events.
//!
//! Misuse of the API (starting a worker twice, joining a worker from its own
//! thread, and similar) panics with a diagnostic instead of returning an
//! error, the same way invariant violations inside the crate abort.
//!
//! [`WorkerError`]: crate::worker::WorkerError

mod macros;

pub(crate) use self::macros::fatal;
pub(crate) use self::macros::raise;

use std::error::Error;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;

use crate::realm::RealmId;

// -----------------------------------------------------------------------------
// Message Error
// -----------------------------------------------------------------------------

/// An error produced while building or consuming a [`Message`].
///
/// [`Message`]: crate::port::Message
#[derive(Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MessageError {
  /// The value contains something that cannot be encoded or transferred.
  DataClone(&'static str),
  /// An entry of the transfer list is invalid.
  TransferList(&'static str),
  /// A shared buffer's memory is owned by something outside this crate.
  ForeignExternalBuffer,
  /// The message has already been deserialized once.
  DoubleConsumption,
  /// The encoded payload is corrupt.
  Malformed(&'static str),
}

impl MessageError {
  /// Returns the short error name, mirroring the exception classes reported
  /// to application code.
  #[inline]
  pub const fn name(&self) -> &'static str {
    match self {
      Self::DataClone(_) => "DataCloneError",
      Self::TransferList(_) => "TransferListError",
      Self::ForeignExternalBuffer => "ForeignExternalBufferError",
      Self::DoubleConsumption => "DoubleConsumptionError",
      Self::Malformed(_) => "MalformedMessageError",
    }
  }
}

impl Debug for MessageError {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    Display::fmt(self, f)
  }
}

impl Display for MessageError {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    match self {
      Self::DataClone(reason) => write!(f, "{}: {reason}", self.name()),
      Self::TransferList(reason) => write!(f, "{}: {reason}", self.name()),
      Self::ForeignExternalBuffer => write!(
        f,
        "{}: cannot serialize externalized SharedArrayBuffer",
        self.name(),
      ),
      Self::DoubleConsumption => {
        write!(f, "{}: message has already been deserialized", self.name())
      }
      Self::Malformed(reason) => write!(f, "{}: {reason}", self.name()),
    }
  }
}

impl Error for MessageError {}

// -----------------------------------------------------------------------------
// Scheduler Error
// -----------------------------------------------------------------------------

/// An error produced when posting work to the [`Scheduler`].
///
/// [`Scheduler`]: crate::sched::Scheduler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchedulerError {
  /// The target realm is not registered (or was already unregistered).
  UnknownRealm(RealmId),
  /// The scheduler has been shut down.
  Shutdown,
}

impl Display for SchedulerError {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    match self {
      Self::UnknownRealm(id) => write!(f, "realm {id} is not registered"),
      Self::Shutdown => f.write_str("scheduler has been shut down"),
    }
  }
}

impl Error for SchedulerError {}

// -----------------------------------------------------------------------------
// Out Of Memory
// -----------------------------------------------------------------------------

/// A heap reservation exceeded a realm's configured limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutOfMemory {
  /// Number of bytes that were requested.
  pub requested: usize,
  /// The realm's heap limit.
  pub limit: usize,
}

impl Display for OutOfMemory {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(
      f,
      "out of memory: failed to reserve {} bytes (limit {} bytes)",
      self.requested, self.limit,
    )
  }
}

impl Error for OutOfMemory {}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
