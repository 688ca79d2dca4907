//! Internal error handling macros.
//!
//! - [`fatal!`]: For unrecoverable bugs (invariant violations)
//! - [`raise!`]: For misuse of the public API

/// Displays a system error message and aborts the program.
///
/// Use this when the crate can no longer uphold its own invariants, such as
/// losing the ability to communicate with a worker thread. The program
/// prints a diagnostic message and immediately aborts without unwinding.
///
/// # Examples
///
/// ```ignore
/// let Some(channel) = state.child.take() else {
///   fatal!("worker child channel missing");
/// };
/// ```
macro_rules! fatal {
  ($error:expr) => {{
    ::std::eprintln!(
      "{}:{}: (SysInv) a system invariant has been broken: {}",
      ::std::file!(),
      ::std::line!(),
      $error,
    );

    ::std::process::abort();
  }};
}

/// Panics with a diagnostic describing how the caller misused the API.
///
/// Panics raised inside realm callbacks are caught and reported as uncaught
/// exceptions of that realm.
///
/// # Examples
///
/// ```ignore
/// if self.is_closed() {
///   raise!(Error, SysInv, "cannot start listening on a closed port");
/// }
/// ```
macro_rules! raise {
  (Error, BadArg, $error:expr) => {
    ::std::panic!(
      "{}:{}: (BadArg) errors were found with the given argument(s): {}",
      ::std::file!(),
      ::std::line!(),
      $error,
    )
  };
  (Error, SysCap, $error:expr) => {
    ::std::panic!(
      "{}:{}: (SysCap) a system limit has been reached: {}",
      ::std::file!(),
      ::std::line!(),
      $error,
    )
  };
  (Error, SysInv, $error:expr) => {
    ::std::panic!(
      "{}:{}: (SysInv) a system invariant has been broken: {}",
      ::std::file!(),
      ::std::line!(),
      $error,
    )
  };
}

pub(crate) use fatal;
pub(crate) use raise;
