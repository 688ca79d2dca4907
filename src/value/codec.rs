//! Tagged binary encoding of [`Value`] trees.
//!
//! Plain data is written inline. Handles are delegated: the encoder asks an
//! [`EncodeDelegate`] for a side-table index and writes a placeholder, and
//! the decoder resolves placeholders through a [`DecodeDelegate`]. This is
//! how ports, transferred buffers and shared segments travel without being
//! copied into the payload.
//!
//! Layout: one version byte, then a single tagged value. Integers and
//! lengths are little-endian; lengths and indices are `u32`.

use std::collections::BTreeMap;

use crate::buffer::ArrayBuffer;
use crate::buffer::SharedArrayBuffer;
use crate::consts::MAX_DECODE_DEPTH;
use crate::consts::WIRE_FORMAT_VERSION;
use crate::error::MessageError;
use crate::value::Value;

const TAG_UNDEFINED: u8 = b'_';
const TAG_NULL: u8 = b'0';
const TAG_TRUE: u8 = b'T';
const TAG_FALSE: u8 = b'F';
const TAG_INT: u8 = b'I';
const TAG_NUMBER: u8 = b'N';
const TAG_STRING: u8 = b'S';
const TAG_ARRAY: u8 = b'A';
const TAG_OBJECT: u8 = b'o';
const TAG_BUFFER: u8 = b'B';
const TAG_BUFFER_TRANSFER: u8 = b't';
const TAG_SHARED_BUFFER: u8 = b'u';
const TAG_HOST_OBJECT: u8 = b'\\';

// -----------------------------------------------------------------------------
// Delegates
// -----------------------------------------------------------------------------

/// Host hooks consulted while encoding handles.
pub(crate) trait EncodeDelegate {
  /// Returns the transfer index of `buffer`, or `None` to copy it inline.
  fn array_buffer(&mut self, buffer: &ArrayBuffer) -> Result<Option<u32>, MessageError>;

  /// Returns the side-table index of `buffer`'s shared segment.
  fn shared_array_buffer(&mut self, buffer: &SharedArrayBuffer) -> Result<u32, MessageError>;

  /// Returns the index of a host object (a port or an opaque object).
  fn host_object(&mut self, value: &Value) -> Result<u32, MessageError>;
}

/// Host hooks consulted while decoding placeholders.
pub(crate) trait DecodeDelegate {
  fn transferred_buffer(&mut self, index: u32) -> Result<ArrayBuffer, MessageError>;

  fn shared_array_buffer(&mut self, index: u32) -> Result<SharedArrayBuffer, MessageError>;

  fn host_object(&mut self, index: u32) -> Result<Value, MessageError>;
}

// -----------------------------------------------------------------------------
// Encoder
// -----------------------------------------------------------------------------

pub(crate) struct Encoder<'a, D> {
  output: Vec<u8>,
  delegate: &'a mut D,
}

impl<'a, D> Encoder<'a, D>
where
  D: EncodeDelegate,
{
  pub(crate) fn new(delegate: &'a mut D) -> Self {
    Self {
      output: vec![WIRE_FORMAT_VERSION],
      delegate,
    }
  }

  /// Encodes `value` and returns the finished payload.
  pub(crate) fn encode(mut self, value: &Value) -> Result<Vec<u8>, MessageError> {
    self.write_value(value, 0)?;
    Ok(self.output)
  }

  fn write_value(&mut self, value: &Value, depth: usize) -> Result<(), MessageError> {
    if depth > MAX_DECODE_DEPTH {
      return Err(MessageError::DataClone("maximum nesting depth exceeded"));
    }

    match value {
      Value::Undefined => self.output.push(TAG_UNDEFINED),
      Value::Null => self.output.push(TAG_NULL),
      Value::Bool(true) => self.output.push(TAG_TRUE),
      Value::Bool(false) => self.output.push(TAG_FALSE),
      Value::Int(value) => {
        self.output.push(TAG_INT);
        self.output.extend_from_slice(&value.to_le_bytes());
      }
      Value::Number(value) => {
        self.output.push(TAG_NUMBER);
        self.output.extend_from_slice(&value.to_le_bytes());
      }
      Value::String(value) => {
        self.output.push(TAG_STRING);
        self.write_bytes(value.as_bytes())?;
      }
      Value::Array(items) => {
        self.output.push(TAG_ARRAY);
        self.write_len(items.len())?;

        for item in items {
          self.write_value(item, depth + 1)?;
        }
      }
      Value::Object(entries) => {
        self.output.push(TAG_OBJECT);
        self.write_len(entries.len())?;

        for (key, item) in entries {
          self.write_bytes(key.as_bytes())?;
          self.write_value(item, depth + 1)?;
        }
      }
      Value::ArrayBuffer(buffer) => match self.delegate.array_buffer(buffer)? {
        Some(index) => {
          self.output.push(TAG_BUFFER_TRANSFER);
          self.output.extend_from_slice(&index.to_le_bytes());
        }
        None => {
          self.output.push(TAG_BUFFER);
          buffer.with_bytes(|bytes| self.write_bytes(bytes))?;
        }
      },
      Value::SharedArrayBuffer(buffer) => {
        let index: u32 = self.delegate.shared_array_buffer(buffer)?;

        self.output.push(TAG_SHARED_BUFFER);
        self.output.extend_from_slice(&index.to_le_bytes());
      }
      Value::Port(_) | Value::Host(_) => {
        let index: u32 = self.delegate.host_object(value)?;

        self.output.push(TAG_HOST_OBJECT);
        self.output.extend_from_slice(&index.to_le_bytes());
      }
    }

    Ok(())
  }

  fn write_len(&mut self, len: usize) -> Result<(), MessageError> {
    let Ok(len) = u32::try_from(len) else {
      return Err(MessageError::DataClone("value is too large to serialize"));
    };

    self.output.extend_from_slice(&len.to_le_bytes());

    Ok(())
  }

  fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), MessageError> {
    self.write_len(bytes.len())?;
    self.output.extend_from_slice(bytes);
    Ok(())
  }
}

// -----------------------------------------------------------------------------
// Decoder
// -----------------------------------------------------------------------------

pub(crate) struct Decoder<'a, D> {
  input: &'a [u8],
  delegate: &'a mut D,
}

impl<'a, D> Decoder<'a, D>
where
  D: DecodeDelegate,
{
  pub(crate) fn new(input: &'a [u8], delegate: &'a mut D) -> Self {
    Self { input, delegate }
  }

  /// Decodes a complete payload.
  pub(crate) fn decode(mut self) -> Result<Value, MessageError> {
    match self.read_u8()? {
      WIRE_FORMAT_VERSION => {}
      _ => return Err(MessageError::Malformed("unsupported format version")),
    }

    let value: Value = self.read_value(0)?;

    if !self.input.is_empty() {
      return Err(MessageError::Malformed("trailing bytes after value"));
    }

    Ok(value)
  }

  fn read_value(&mut self, depth: usize) -> Result<Value, MessageError> {
    if depth > MAX_DECODE_DEPTH {
      return Err(MessageError::Malformed("maximum nesting depth exceeded"));
    }

    let value: Value = match self.read_u8()? {
      TAG_UNDEFINED => Value::Undefined,
      TAG_NULL => Value::Null,
      TAG_TRUE => Value::Bool(true),
      TAG_FALSE => Value::Bool(false),
      TAG_INT => Value::Int(i64::from_le_bytes(self.read_array()?)),
      TAG_NUMBER => Value::Number(f64::from_le_bytes(self.read_array()?)),
      TAG_STRING => Value::String(self.read_string()?),
      TAG_ARRAY => {
        let len: usize = self.read_len()?;
        let mut items: Vec<Value> = Vec::with_capacity(len.min(self.input.len()));

        for _ in 0..len {
          items.push(self.read_value(depth + 1)?);
        }

        Value::Array(items)
      }
      TAG_OBJECT => {
        let len: usize = self.read_len()?;
        let mut entries: BTreeMap<String, Value> = BTreeMap::new();

        for _ in 0..len {
          let key: String = self.read_string()?;
          let item: Value = self.read_value(depth + 1)?;

          entries.insert(key, item);
        }

        Value::Object(entries)
      }
      TAG_BUFFER => Value::ArrayBuffer(ArrayBuffer::from(self.read_bytes()?)),
      TAG_BUFFER_TRANSFER => {
        let index: u32 = u32::from_le_bytes(self.read_array()?);
        Value::ArrayBuffer(self.delegate.transferred_buffer(index)?)
      }
      TAG_SHARED_BUFFER => {
        let index: u32 = u32::from_le_bytes(self.read_array()?);
        Value::SharedArrayBuffer(self.delegate.shared_array_buffer(index)?)
      }
      TAG_HOST_OBJECT => {
        let index: u32 = u32::from_le_bytes(self.read_array()?);
        self.delegate.host_object(index)?
      }
      _ => return Err(MessageError::Malformed("unknown value tag")),
    };

    Ok(value)
  }

  fn read_u8(&mut self) -> Result<u8, MessageError> {
    let [byte] = self.read_array::<1>()?;
    Ok(byte)
  }

  fn read_array<const N: usize>(&mut self) -> Result<[u8; N], MessageError> {
    let Some((head, tail)) = self.input.split_first_chunk::<N>() else {
      return Err(MessageError::Malformed("unexpected end of payload"));
    };

    self.input = tail;

    Ok(*head)
  }

  fn read_len(&mut self) -> Result<usize, MessageError> {
    Ok(u32::from_le_bytes(self.read_array()?) as usize)
  }

  fn read_bytes(&mut self) -> Result<&'a [u8], MessageError> {
    let len: usize = self.read_len()?;

    let Some((head, tail)) = self.input.split_at_checked(len) else {
      return Err(MessageError::Malformed("unexpected end of payload"));
    };

    self.input = tail;

    Ok(head)
  }

  fn read_string(&mut self) -> Result<String, MessageError> {
    match std::str::from_utf8(self.read_bytes()?) {
      Ok(value) => Ok(value.to_owned()),
      Err(_) => Err(MessageError::Malformed("invalid utf-8 in string")),
    }
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::buffer::ArrayBuffer;
  use crate::buffer::SharedArrayBuffer;
  use crate::error::MessageError;
  use crate::value::DecodeDelegate;
  use crate::value::Decoder;
  use crate::value::EncodeDelegate;
  use crate::value::Encoder;
  use crate::value::HostObject;
  use crate::value::Value;

  /// Rejects every handle, like a realm-less clone would.
  struct Plain;

  impl EncodeDelegate for Plain {
    fn array_buffer(&mut self, _: &ArrayBuffer) -> Result<Option<u32>, MessageError> {
      Ok(None)
    }

    fn shared_array_buffer(&mut self, _: &SharedArrayBuffer) -> Result<u32, MessageError> {
      Err(MessageError::DataClone("shared memory is not supported"))
    }

    fn host_object(&mut self, _: &Value) -> Result<u32, MessageError> {
      Err(MessageError::DataClone("host objects are not supported"))
    }
  }

  impl DecodeDelegate for Plain {
    fn transferred_buffer(&mut self, _: u32) -> Result<ArrayBuffer, MessageError> {
      Err(MessageError::Malformed("no transferred buffers"))
    }

    fn shared_array_buffer(&mut self, _: u32) -> Result<SharedArrayBuffer, MessageError> {
      Err(MessageError::Malformed("no shared buffers"))
    }

    fn host_object(&mut self, _: u32) -> Result<Value, MessageError> {
      Err(MessageError::Malformed("no host objects"))
    }
  }

  fn round_trip(value: &Value) -> Result<Value, MessageError> {
    let bytes: Vec<u8> = Encoder::new(&mut Plain).encode(value)?;
    Decoder::new(&bytes, &mut Plain).decode()
  }

  #[test]
  fn test_round_trip_plain_values() {
    let value: Value = Value::object([
      ("undefined", Value::Undefined),
      ("null", Value::Null),
      ("flag", Value::from(true)),
      ("int", Value::from(-42_i64)),
      ("float", Value::from(1.5)),
      ("text", Value::from("héllo")),
      (
        "list",
        Value::from(vec![Value::from(1), Value::from("two"), Value::Array(Vec::new())]),
      ),
      ("nested", Value::object([("inner", Value::from(false))])),
    ]);

    assert_eq!(round_trip(&value).unwrap(), value);
  }

  #[test]
  fn test_buffer_copy_is_independent() {
    let buffer: ArrayBuffer = ArrayBuffer::from(&b"bytes"[..]);
    let decoded: Value = round_trip(&Value::from(buffer.clone())).unwrap();

    let Value::ArrayBuffer(copy) = decoded else {
      panic!("expected an ArrayBuffer");
    };

    assert!(!copy.ptr_eq(&buffer));
    assert_eq!(copy.to_vec(), b"bytes");
    assert!(!buffer.is_detached());
  }

  #[test]
  fn test_host_object_rejected() {
    let value: Value = Value::from(vec![Value::Host(HostObject::new("Function"))]);

    assert_eq!(
      round_trip(&value).unwrap_err(),
      MessageError::DataClone("host objects are not supported"),
    );
  }

  #[test]
  fn test_truncated_payload() {
    let bytes: Vec<u8> = Encoder::new(&mut Plain)
      .encode(&Value::from("truncate me"))
      .unwrap();

    let result: Result<Value, MessageError> =
      Decoder::new(&bytes[..bytes.len() - 3], &mut Plain).decode();

    assert_eq!(
      result.unwrap_err(),
      MessageError::Malformed("unexpected end of payload"),
    );
  }

  #[test]
  fn test_unknown_tag() {
    let bytes: [u8; 2] = [crate::consts::WIRE_FORMAT_VERSION, b'?'];
    let result: Result<Value, MessageError> = Decoder::new(&bytes, &mut Plain).decode();

    assert_eq!(result.unwrap_err(), MessageError::Malformed("unknown value tag"));
  }

  #[test]
  fn test_depth_limit() {
    let mut value: Value = Value::Null;

    for _ in 0..=crate::consts::MAX_DECODE_DEPTH + 1 {
      value = Value::Array(vec![value]);
    }

    assert_eq!(
      round_trip(&value).unwrap_err(),
      MessageError::DataClone("maximum nesting depth exceeded"),
    );
  }
}
