//! Entangled message ports.
//!
//! # Contents
//!
//! - [`Channel`]: Thread-safe endpoint of an entangled pair
//! - [`Port`]: Realm-bound handle over one channel endpoint
//! - [`Message`]: One unit of transport, with its transferred resources
//!
//! # Delivery
//!
//! Posting on a port serializes the value into a [`Message`] and appends it
//! to the sibling channel's queue, from any thread. The append wakes the
//! realm that owns the sibling; that realm drains the queue on its own loop
//! and hands each message to the port's handler. Messages from one port
//! arrive in the order they were sent. Once a pair is severed, posting on
//! either side silently drops the message.

mod channel;
mod message;
mod port;

pub use self::channel::Channel;
pub use self::message::ControlMessage;
pub use self::message::Message;
pub use self::message::MessageFlag;
pub use self::port::Port;
pub use self::port::PortFlags;
pub use self::port::PortState;

pub(crate) use self::port::InternalListener;
pub(crate) use self::port::WeakPort;

use std::sync::Arc;

use crate::realm::Realm;

/// Creates two ports bound to `realm`, entangled with each other.
///
/// Both ports start out stopped and unreferenced; installing a message
/// handler starts delivery.
pub fn channel(realm: &Realm) -> (Port, Port) {
  let (a, b): (Arc<Channel>, Arc<Channel>) = Channel::pair();

  (Port::adopt(realm, a), Port::adopt(realm, b))
}
