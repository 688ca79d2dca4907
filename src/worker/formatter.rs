use crate::value::Value;

/// Renders an uncaught error of a worker realm for its parent.
///
/// Runs on the worker thread while the worker is failing. Returning `None`
/// reports the error as unserializable instead.
pub trait ErrorFormatter: Send + Sync {
  fn serialize_error(&self, error: &Value) -> Option<Vec<u8>>;
}

impl<F> ErrorFormatter for F
where
  F: Fn(&Value) -> Option<Vec<u8>> + Send + Sync,
{
  #[inline]
  fn serialize_error(&self, error: &Value) -> Option<Vec<u8>> {
    self(error)
  }
}

/// Strings are reported as-is; anything else by its debug representation.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultFormatter;

impl ErrorFormatter for DefaultFormatter {
  fn serialize_error(&self, error: &Value) -> Option<Vec<u8>> {
    match error.as_str() {
      Some(message) => Some(message.as_bytes().to_vec()),
      None => Some(format!("{error:?}").into_bytes()),
    }
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::value::Value;
  use crate::worker::DefaultFormatter;
  use crate::worker::ErrorFormatter;

  #[test]
  fn test_default_formatter() {
    assert_eq!(
      DefaultFormatter.serialize_error(&Value::from("boom")),
      Some(b"boom".to_vec()),
    );
    assert_eq!(
      DefaultFormatter.serialize_error(&Value::from(3)),
      Some(b"Int(3)".to_vec()),
    );
  }

  #[test]
  fn test_closure_formatter() {
    let formatter = |_: &Value| -> Option<Vec<u8>> { None };
    assert_eq!(formatter.serialize_error(&Value::Null), None);
  }
}
