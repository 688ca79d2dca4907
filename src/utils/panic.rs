use std::any::Any;

/// Returns a readable description of a panic payload.
///
/// Payloads produced by `panic!` are either `&'static str` or `String`; any
/// other payload is described generically.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&'static str>() {
    (*message).to_owned()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "Box<dyn Any>".to_owned()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
