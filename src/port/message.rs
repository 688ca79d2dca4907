use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::sync::Arc;

use crate::buffer::ArrayBuffer;
use crate::buffer::BackingStore;
use crate::buffer::SharedArrayBuffer;
use crate::buffer::SharedSegment;
use crate::error::MessageError;
use crate::error::fatal;
use crate::error::raise;
use crate::port::Channel;
use crate::port::Port;
use crate::realm::Realm;
use crate::value::DecodeDelegate;
use crate::value::Decoder;
use crate::value::EncodeDelegate;
use crate::value::Encoder;
use crate::value::Value;

// -----------------------------------------------------------------------------
// Message Flag
// -----------------------------------------------------------------------------

/// Distinguishes application messages from internal signals.
///
/// Only [`MessageFlag::None`] is meaningful to application code; every other
/// value is a private convention between a worker and its parent.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageFlag {
  #[default]
  None = 0,
  StopThread = 1,
  ThreadStopped = 2,
  OutOfMemory = 3,
  ErrorMessage = 4,
  CouldNotSerializeError = 5,
  Online = 6,
}

impl MessageFlag {
  /// Returns the flag with the given numeric value.
  pub const fn from_raw(value: i32) -> Option<Self> {
    match value {
      0 => Some(Self::None),
      1 => Some(Self::StopThread),
      2 => Some(Self::ThreadStopped),
      3 => Some(Self::OutOfMemory),
      4 => Some(Self::ErrorMessage),
      5 => Some(Self::CouldNotSerializeError),
      6 => Some(Self::Online),
      _ => None,
    }
  }

  #[inline]
  pub const fn as_raw(self) -> i32 {
    self as i32
  }

  /// Returns `true` for internal signals.
  #[inline]
  pub const fn is_control(self) -> bool {
    !matches!(self, Self::None)
  }
}

// -----------------------------------------------------------------------------
// Control Message
// -----------------------------------------------------------------------------

/// Typed view of a message carrying an internal signal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
  /// The parent asks the worker to stop.
  StopThread,
  /// The worker thread has finished tearing down.
  ThreadStopped,
  /// The worker ran out of memory.
  OutOfMemory,
  /// The worker hit an uncaught error; carries the formatted report.
  ErrorMessage(Box<[u8]>),
  /// The worker hit an uncaught error that could not be formatted.
  CouldNotSerializeError,
  /// The worker's side of the channel is ready.
  Online,
}

impl ControlMessage {
  #[inline]
  pub const fn flag(&self) -> MessageFlag {
    match self {
      Self::StopThread => MessageFlag::StopThread,
      Self::ThreadStopped => MessageFlag::ThreadStopped,
      Self::OutOfMemory => MessageFlag::OutOfMemory,
      Self::ErrorMessage(_) => MessageFlag::ErrorMessage,
      Self::CouldNotSerializeError => MessageFlag::CouldNotSerializeError,
      Self::Online => MessageFlag::Online,
    }
  }
}

// -----------------------------------------------------------------------------
// Message
// -----------------------------------------------------------------------------

/// One unit of transport between two realms.
///
/// A message owns everything it carries: the encoded payload, the storage of
/// transferred buffers, references to shared segments and the channels of
/// transferred ports. All of it moves to the receiving realm when the message
/// is deserialized. A message dropped undelivered releases its resources;
/// transferred ports it carried end up closed.
pub struct Message {
  flag: MessageFlag,
  payload: Vec<u8>,
  buffers: Vec<BackingStore>,
  segments: Vec<SharedSegment>,
  channels: Vec<Arc<Channel>>,
  consumed: bool,
}

impl Message {
  #[inline]
  fn empty(flag: MessageFlag) -> Self {
    Self {
      flag,
      payload: Vec::new(),
      buffers: Vec::new(),
      segments: Vec::new(),
      channels: Vec::new(),
      consumed: false,
    }
  }

  /// Creates a control message carrying at most one raw buffer.
  ///
  /// # Panics
  ///
  /// Panics if `flag` is [`MessageFlag::None`].
  pub fn control(flag: MessageFlag, data: Option<&[u8]>) -> Self {
    if !flag.is_control() {
      raise!(Error, BadArg, "control messages require a control flag");
    }

    let mut this: Self = Self::empty(flag);

    if let Some(data) = data {
      this.buffers.push(BackingStore::from_slice(data));
    }

    this
  }

  /// Serializes `value`, moving every entry of `transfer` into the message.
  ///
  /// The transfer list may contain [`ArrayBuffer`]s and [`Port`]s. Nothing is
  /// moved unless the whole value encodes successfully: on error every
  /// buffer and port in `transfer` is still usable.
  ///
  /// # Errors
  ///
  /// - [`MessageError::TransferList`] if an entry is of the wrong type,
  ///   detached, closed, not transferable, or listed twice.
  /// - [`MessageError::DataClone`] if the value contains a port that is not
  ///   in the transfer list or an opaque host object.
  /// - [`MessageError::ForeignExternalBuffer`] if the value contains a shared
  ///   buffer whose memory is owned by the embedder.
  pub fn serialize(value: &Value, transfer: &[Value]) -> Result<Self, MessageError> {
    let mut delegate: SerializeDelegate = SerializeDelegate::new(transfer)?;
    let payload: Vec<u8> = Encoder::new(&mut delegate).encode(value)?;

    // Commit. Validation guarantees every entry is still attached and open.
    let mut this: Self = Self::empty(MessageFlag::None);

    this.payload = payload;
    this.segments = delegate.segments;

    for buffer in delegate.buffers {
      let Some(store) = buffer.detach() else {
        fatal!("transferred buffer detached during serialization");
      };

      this.buffers.push(store);
    }

    for port in delegate.ports {
      let Some(channel) = port.detach_for_transfer() else {
        fatal!("transferred port closed during serialization");
      };

      this.channels.push(channel);
    }

    Ok(this)
  }

  #[inline]
  pub fn flag(&self) -> MessageFlag {
    self.flag
  }

  /// Returns `true` if this message carries an internal signal.
  #[inline]
  pub fn is_control(&self) -> bool {
    self.flag.is_control()
  }

  /// Returns the number of ports carried by this message.
  #[inline]
  pub fn port_count(&self) -> usize {
    self.channels.len()
  }

  /// Returns `true` once the message has been deserialized.
  #[inline]
  pub fn is_consumed(&self) -> bool {
    self.consumed
  }

  /// Converts a control message into its typed view.
  ///
  /// Returns `None` for application messages.
  pub fn into_control(mut self) -> Option<ControlMessage> {
    let message: ControlMessage = match self.flag {
      MessageFlag::None => return None,
      MessageFlag::StopThread => ControlMessage::StopThread,
      MessageFlag::ThreadStopped => ControlMessage::ThreadStopped,
      MessageFlag::OutOfMemory => ControlMessage::OutOfMemory,
      MessageFlag::ErrorMessage => ControlMessage::ErrorMessage(
        self
          .buffers
          .pop()
          .map(|store| Box::from(store.as_slice()))
          .unwrap_or_default(),
      ),
      MessageFlag::CouldNotSerializeError => ControlMessage::CouldNotSerializeError,
      MessageFlag::Online => ControlMessage::Online,
    };

    Some(message)
  }

  /// Rebuilds the value inside `realm`, taking ownership of every resource
  /// the message carries.
  ///
  /// Transferred buffers are wrapped without copying, shared segments get a
  /// new view bound to `realm`, and transferred ports are adopted by `realm`.
  /// A control message yields its raw buffer (or `undefined`).
  ///
  /// # Errors
  ///
  /// Returns [`MessageError::DoubleConsumption`] if called more than once.
  pub fn deserialize(&mut self, realm: &Realm) -> Result<Value, MessageError> {
    if self.consumed {
      return Err(MessageError::DoubleConsumption);
    }

    self.consumed = true;

    if self.flag.is_control() {
      let value: Value = match self.buffers.pop() {
        Some(store) => Value::ArrayBuffer(ArrayBuffer::from_store(store)),
        None => Value::Undefined,
      };

      return Ok(value);
    }

    let mut delegate: DeserializeDelegate = DeserializeDelegate {
      ports: self
        .channels
        .drain(..)
        .map(|channel| Port::adopt(realm, channel))
        .collect(),
      buffers: self.buffers.drain(..).map(ArrayBuffer::from_store).collect(),
      shared: self.segments.drain(..).map(|segment| segment.attach()).collect(),
    };

    let payload: Vec<u8> = std::mem::take(&mut self.payload);

    Decoder::new(&payload, &mut delegate).decode()
  }
}

impl Debug for Message {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("Message")
      .field("flag", &self.flag)
      .field("payload", &self.payload.len())
      .field("buffers", &self.buffers.len())
      .field("segments", &self.segments.len())
      .field("ports", &self.channels.len())
      .field("consumed", &self.consumed)
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Serialize Delegate
// -----------------------------------------------------------------------------

struct SerializeDelegate {
  buffers: Vec<ArrayBuffer>,
  ports: Vec<Port>,
  seen: Vec<SharedArrayBuffer>,
  segments: Vec<SharedSegment>,
}

impl SerializeDelegate {
  /// Validates the transfer list without moving anything.
  fn new(transfer: &[Value]) -> Result<Self, MessageError> {
    let mut buffers: Vec<ArrayBuffer> = Vec::new();
    let mut ports: Vec<Port> = Vec::new();

    for entry in transfer {
      match entry {
        Value::ArrayBuffer(buffer) => {
          if buffer.is_detached() {
            return Err(MessageError::TransferList(
              "ArrayBuffer in transferList is detached",
            ));
          }

          if buffers.iter().any(|other| other.ptr_eq(buffer)) {
            return Err(MessageError::TransferList(
              "ArrayBuffer is listed in transferList twice",
            ));
          }

          buffers.push(buffer.clone());
        }
        Value::Port(port) => {
          if port.is_closed() {
            return Err(MessageError::TransferList(
              "MessagePort in transferList is closed",
            ));
          }

          if !port.is_transferable() {
            return Err(MessageError::TransferList(
              "MessagePort in transferList is not transferable",
            ));
          }

          if ports.iter().any(|other| other.ptr_eq(port)) {
            return Err(MessageError::TransferList(
              "MessagePort is listed in transferList twice",
            ));
          }

          ports.push(port.clone());
        }
        _ => {
          return Err(MessageError::TransferList(
            "Found invalid object in transferList",
          ));
        }
      }
    }

    Ok(Self {
      buffers,
      ports,
      seen: Vec::new(),
      segments: Vec::new(),
    })
  }
}

impl EncodeDelegate for SerializeDelegate {
  fn array_buffer(&mut self, buffer: &ArrayBuffer) -> Result<Option<u32>, MessageError> {
    if buffer.is_detached() {
      return Err(MessageError::DataClone("An ArrayBuffer is detached and could not be cloned"));
    }

    Ok(index_of(&self.buffers, |other| other.ptr_eq(buffer)))
  }

  fn shared_array_buffer(&mut self, buffer: &SharedArrayBuffer) -> Result<u32, MessageError> {
    if let Some(index) = index_of(&self.seen, |other| other.ptr_eq(buffer)) {
      return Ok(index);
    }

    let segment: SharedSegment = SharedSegment::for_existing(buffer)?;
    let index: u32 = table_index(self.segments.len())?;

    self.seen.push(buffer.clone());
    self.segments.push(segment);

    Ok(index)
  }

  fn host_object(&mut self, value: &Value) -> Result<u32, MessageError> {
    let Value::Port(port) = value else {
      return Err(MessageError::DataClone(
        "Cannot serialize unknown type of host object",
      ));
    };

    match index_of(&self.ports, |other| other.ptr_eq(port)) {
      Some(index) => Ok(index),
      None => Err(MessageError::DataClone(
        "MessagePort was not listed in transferList",
      )),
    }
  }
}

#[inline]
fn index_of<T, F>(items: &[T], f: F) -> Option<u32>
where
  F: FnMut(&T) -> bool,
{
  items
    .iter()
    .position(f)
    .and_then(|index| u32::try_from(index).ok())
}

#[inline]
fn table_index(len: usize) -> Result<u32, MessageError> {
  u32::try_from(len).map_err(|_| MessageError::DataClone("too many shared buffers"))
}

// -----------------------------------------------------------------------------
// Deserialize Delegate
// -----------------------------------------------------------------------------

struct DeserializeDelegate {
  ports: Vec<Port>,
  buffers: Vec<ArrayBuffer>,
  shared: Vec<SharedArrayBuffer>,
}

impl DecodeDelegate for DeserializeDelegate {
  fn transferred_buffer(&mut self, index: u32) -> Result<ArrayBuffer, MessageError> {
    match self.buffers.get(index as usize) {
      Some(buffer) => Ok(buffer.clone()),
      None => Err(MessageError::Malformed("transferred buffer index out of range")),
    }
  }

  fn shared_array_buffer(&mut self, index: u32) -> Result<SharedArrayBuffer, MessageError> {
    match self.shared.get(index as usize) {
      Some(buffer) => Ok(buffer.clone()),
      None => Err(MessageError::Malformed("shared buffer index out of range")),
    }
  }

  fn host_object(&mut self, index: u32) -> Result<Value, MessageError> {
    match self.ports.get(index as usize) {
      Some(port) => Ok(Value::Port(port.clone())),
      None => Err(MessageError::Malformed("port index out of range")),
    }
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
