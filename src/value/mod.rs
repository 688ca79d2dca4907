//! The value model exchanged between realms.
//!
//! A [`Value`] is a tree of plain data plus handles to realm-local resources
//! (buffers and ports). Plain data is copied when posted; handles are either
//! shared, transferred, or rejected depending on their kind and the
//! transfer list.

mod codec;

pub(crate) use self::codec::DecodeDelegate;
pub(crate) use self::codec::Decoder;
pub(crate) use self::codec::EncodeDelegate;
pub(crate) use self::codec::Encoder;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::rc::Rc;

use crate::buffer::ArrayBuffer;
use crate::buffer::SharedArrayBuffer;
use crate::port::Port;
use crate::utils::panic_message;

// -----------------------------------------------------------------------------
// Value
// -----------------------------------------------------------------------------

/// A value that can be posted through a [`Port`].
///
/// Equality is structural for plain data and by identity for handles.
#[derive(Clone, Debug, Default)]
pub enum Value {
  #[default]
  Undefined,
  Null,
  Bool(bool),
  Int(i64),
  Number(f64),
  String(String),
  Array(Vec<Value>),
  Object(BTreeMap<String, Value>),
  ArrayBuffer(ArrayBuffer),
  SharedArrayBuffer(SharedArrayBuffer),
  Port(Port),
  /// An opaque realm-local object that can never leave its realm.
  Host(HostObject),
}

impl Value {
  /// Builds an object from `(key, value)` pairs.
  pub fn object<K, I>(entries: I) -> Self
  where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
  {
    Self::Object(
      entries
        .into_iter()
        .map(|(key, value)| (key.into(), value))
        .collect(),
    )
  }

  /// Converts a panic payload into a value describing it.
  #[inline]
  pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
    Self::String(panic_message(&*payload))
  }

  /// Returns the property `key` of an object value.
  #[inline]
  pub fn get(&self, key: &str) -> Option<&Value> {
    match self {
      Self::Object(entries) => entries.get(key),
      _ => None,
    }
  }

  #[inline]
  pub fn as_str(&self) -> Option<&str> {
    match self {
      Self::String(value) => Some(value.as_str()),
      _ => None,
    }
  }

  #[inline]
  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Self::Int(value) => Some(*value),
      _ => None,
    }
  }

  #[inline]
  pub fn as_port(&self) -> Option<&Port> {
    match self {
      Self::Port(port) => Some(port),
      _ => None,
    }
  }

  #[inline]
  pub const fn is_undefined(&self) -> bool {
    matches!(self, Self::Undefined)
  }
}

impl PartialEq for Value {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Self::Undefined, Self::Undefined) => true,
      (Self::Null, Self::Null) => true,
      (Self::Bool(lhs), Self::Bool(rhs)) => lhs == rhs,
      (Self::Int(lhs), Self::Int(rhs)) => lhs == rhs,
      (Self::Number(lhs), Self::Number(rhs)) => lhs == rhs,
      (Self::String(lhs), Self::String(rhs)) => lhs == rhs,
      (Self::Array(lhs), Self::Array(rhs)) => lhs == rhs,
      (Self::Object(lhs), Self::Object(rhs)) => lhs == rhs,
      (Self::ArrayBuffer(lhs), Self::ArrayBuffer(rhs)) => lhs.ptr_eq(rhs),
      (Self::SharedArrayBuffer(lhs), Self::SharedArrayBuffer(rhs)) => lhs.ptr_eq(rhs),
      (Self::Port(lhs), Self::Port(rhs)) => lhs.ptr_eq(rhs),
      (Self::Host(lhs), Self::Host(rhs)) => Rc::ptr_eq(&lhs.class, &rhs.class),
      _ => false,
    }
  }
}

macro_rules! impl_from {
  ($($source:ty => $variant:ident),+ $(,)?) => {
    $(
      impl From<$source> for Value {
        #[inline]
        fn from(other: $source) -> Self {
          Self::$variant(other.into())
        }
      }
    )+
  };
}

impl_from! {
  bool => Bool,
  i32 => Int,
  i64 => Int,
  f64 => Number,
  &str => String,
  String => String,
  Vec<Value> => Array,
  ArrayBuffer => ArrayBuffer,
  SharedArrayBuffer => SharedArrayBuffer,
  Port => Port,
}

// -----------------------------------------------------------------------------
// Host Object
// -----------------------------------------------------------------------------

/// An opaque object bound to the realm that created it.
///
/// Host objects stand in for things like native functions or sockets: they
/// can be stored in values but any attempt to post them fails.
#[derive(Clone)]
pub struct HostObject {
  class: Rc<str>,
}

impl HostObject {
  #[inline]
  pub fn new(class: &str) -> Self {
    Self {
      class: Rc::from(class),
    }
  }

  #[inline]
  pub fn class(&self) -> &str {
    &self.class
  }
}

impl Debug for HostObject {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "[object {}]", self.class)
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::buffer::ArrayBuffer;
  use crate::value::HostObject;
  use crate::value::Value;

  #[test]
  fn test_object_access() {
    let value: Value = Value::object([("cmd", Value::from("ping")), ("n", Value::from(3))]);

    assert_eq!(value.get("cmd").and_then(Value::as_str), Some("ping"));
    assert_eq!(value.get("n").and_then(Value::as_i64), Some(3));
    assert!(value.get("missing").is_none());
  }

  #[test]
  fn test_handle_equality_is_identity() {
    let buffer: ArrayBuffer = ArrayBuffer::from(&b"a"[..]);

    assert_eq!(Value::from(buffer.clone()), Value::from(buffer));
    assert_ne!(
      Value::from(ArrayBuffer::from(&b"a"[..])),
      Value::from(ArrayBuffer::from(&b"a"[..])),
    );

    let host: HostObject = HostObject::new("Function");
    assert_eq!(Value::Host(host.clone()), Value::Host(host));
  }

  #[test]
  fn test_from_panic() {
    let payload = std::panic::catch_unwind(|| panic!("bad input")).unwrap_err();
    assert_eq!(Value::from_panic(payload), Value::from("bad input"));
  }
}
