//! Process-wide initialization.
//!
//! Nothing here is required for realms or workers to function. It only
//! installs a global [`tracing`] subscriber so the events emitted under the
//! `strand` target become visible.

use std::error::Error;

/// Error returned when a global subscriber cannot be installed.
pub type InitError = Box<dyn Error + Send + Sync + 'static>;

// -----------------------------------------------------------------------------
// Tracing Config
// -----------------------------------------------------------------------------

/// Output options of the global tracing subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TracingConfig {
  /// Include the source file of each event.
  pub source_file: bool,
  /// Include the source line of each event.
  pub source_line: bool,
  /// Include the target of each event.
  pub source_name: bool,
  /// Include thread names and ids.
  pub thread_info: bool,
  /// Enable `DEBUG` events.
  pub verbose: bool,
  /// Enable `TRACE` events. Implies `verbose`.
  pub very_verbose: bool,
}

impl TracingConfig {
  #[inline]
  pub const fn new() -> Self {
    Self {
      source_file: false,
      source_line: false,
      source_name: true,
      thread_info: true,
      verbose: false,
      very_verbose: false,
    }
  }

  #[inline]
  pub const fn verbose(mut self, value: bool) -> Self {
    self.verbose = value;
    self
  }

  #[inline]
  pub const fn very_verbose(mut self, value: bool) -> Self {
    self.very_verbose = value;
    self
  }

  /// Returns the most verbose level that will be recorded.
  #[inline]
  pub const fn max_level(&self) -> tracing::Level {
    if self.very_verbose {
      tracing::Level::TRACE
    } else if self.verbose {
      tracing::Level::DEBUG
    } else {
      tracing::Level::INFO
    }
  }
}

impl Default for TracingConfig {
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

// -----------------------------------------------------------------------------
// Subscriber
// -----------------------------------------------------------------------------

/// Installs the global tracing subscriber.
///
/// Without the `tracing` feature this does nothing and always succeeds.
///
/// # Errors
///
/// Returns an error if a global subscriber has already been installed.
#[cfg(feature = "tracing")]
pub fn init_tracing(config: &TracingConfig) -> Result<(), InitError> {
  use tracing_subscriber::FmtSubscriber;
  use tracing_subscriber::fmt::format;
  use tracing_subscriber::util::SubscriberInitExt;

  FmtSubscriber::builder()
    .event_format(format().compact())
    .log_internal_errors(true)
    .with_ansi(true)
    .with_file(config.source_file)
    .with_level(true)
    .with_line_number(config.source_line)
    .with_max_level(config.max_level())
    .with_target(config.source_name)
    .with_thread_ids(config.thread_info)
    .with_thread_names(config.thread_info)
    .finish()
    .try_init()
    .map_err(InitError::from)
}

/// Installs the global tracing subscriber.
///
/// Without the `tracing` feature this does nothing and always succeeds.
#[cfg(not(feature = "tracing"))]
pub fn init_tracing(_config: &TracingConfig) -> Result<(), InitError> {
  Ok(())
}
