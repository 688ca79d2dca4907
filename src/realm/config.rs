use crate::consts;

/// Configuration of a [`Realm`].
///
/// [`Realm`]: crate::realm::Realm
#[derive(Clone, Debug)]
pub struct RealmConfig {
  /// Maximum number of bytes the realm may reserve; `0` means unlimited.
  pub heap_limit: usize,
  /// Optional name, used in log output.
  pub name: Option<String>,
}

impl RealmConfig {
  #[inline]
  pub fn new() -> Self {
    Self {
      heap_limit: consts::DEFAULT_HEAP_LIMIT,
      name: None,
    }
  }

  /// Sets the heap limit.
  #[inline]
  pub fn heap_limit(mut self, bytes: usize) -> Self {
    self.heap_limit = bytes;
    self
  }

  /// Sets the realm name.
  #[inline]
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }
}

impl Default for RealmConfig {
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}
