use bitflags::bitflags;
use std::cell::Cell;
use std::cell::RefCell;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::trace;

use crate::error::MessageError;
use crate::error::raise;
use crate::port::Channel;
use crate::port::ControlMessage;
use crate::port::Message;
use crate::port::MessageFlag;
use crate::realm::Realm;
use crate::realm::WeakRealm;
use crate::value::Value;
use crate::worker::WorkerInner;

type MessageHandler = Rc<RefCell<dyn FnMut(Value)>>;
type CloseHandler = Box<dyn FnOnce()>;

// -----------------------------------------------------------------------------
// Port Flags
// -----------------------------------------------------------------------------

bitflags! {
  #[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
  pub struct PortFlags: u8 {
    /// Internal port: carries a control listener and is never transferable.
    const PRIVILEGED = 1 << 0;
    /// Close once the sibling is gone and every queued message is handled.
    const CLOSE_WHEN_SIBLING_CLOSES = 1 << 1;
  }
}

impl Default for PortFlags {
  #[inline]
  fn default() -> Self {
    Self::CLOSE_WHEN_SIBLING_CLOSES
  }
}

// -----------------------------------------------------------------------------
// Port State
// -----------------------------------------------------------------------------

/// Lifecycle of a [`Port`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum PortState {
  Initialized,
  Closing,
  Closed,
}

// -----------------------------------------------------------------------------
// Internal Listener
// -----------------------------------------------------------------------------

/// Receiver of control messages on a privileged port.
#[derive(Clone)]
pub(crate) enum InternalListener {
  /// The worker side of a worker's channel.
  Child,
  /// The parent side of a worker's channel.
  Parent(Weak<WorkerInner>),
}

// -----------------------------------------------------------------------------
// Port
// -----------------------------------------------------------------------------

/// A realm-bound handle over one endpoint of an entangled pair.
///
/// `Port` is a cheap handle; clones refer to the same port. Messages posted
/// on a port are delivered to its sibling's message handler, on the thread
/// of the sibling's realm.
#[derive(Clone)]
pub struct Port {
  inner: Rc<PortInner>,
}

/// A non-owning reference to a [`Port`].
#[derive(Clone)]
pub(crate) struct WeakPort {
  inner: Weak<PortInner>,
}

struct PortInner {
  realm: Realm,
  channel: RefCell<Option<Arc<Channel>>>,
  waker: Arc<Notify>,
  state: Cell<PortState>,
  flags: Cell<PortFlags>,
  listener: RefCell<Option<InternalListener>>,
  on_message: RefCell<Option<MessageHandler>>,
  on_close: RefCell<Option<CloseHandler>>,
  refed: Cell<bool>,
  counted: Cell<bool>,
}

impl Port {
  /// Binds `channel` to `realm`.
  ///
  /// The port starts out unreferenced. If the channel is already started and
  /// has queued messages, delivery is scheduled right away.
  pub fn adopt(realm: &Realm, channel: Arc<Channel>) -> Self {
    Self::with_flags(realm, channel, PortFlags::default(), None)
  }

  pub(crate) fn with_flags(
    realm: &Realm,
    channel: Arc<Channel>,
    flags: PortFlags,
    listener: Option<InternalListener>,
  ) -> Self {
    let waker: Arc<Notify> = Arc::new(Notify::new());

    channel.set_owner(&waker);

    let pending: bool = channel.is_started() && channel.queue_len() > 0;

    let this: Self = Self {
      inner: Rc::new(PortInner {
        realm: realm.clone(),
        channel: RefCell::new(Some(channel)),
        waker,
        state: Cell::new(PortState::Initialized),
        flags: Cell::new(flags),
        listener: RefCell::new(listener),
        on_message: RefCell::new(None),
        on_close: RefCell::new(None),
        refed: Cell::new(false),
        counted: Cell::new(false),
      }),
    };

    this.spawn_receiver();

    realm.register_port(this.downgrade());

    if pending {
      this.inner.waker.notify_one();
    }

    this
  }

  #[inline]
  pub(crate) fn downgrade(&self) -> WeakPort {
    WeakPort {
      inner: Rc::downgrade(&self.inner),
    }
  }

  /// Returns `true` if both handles refer to the same port.
  #[inline]
  pub fn ptr_eq(&self, other: &Self) -> bool {
    Rc::ptr_eq(&self.inner, &other.inner)
  }

  /// Returns the realm this port is bound to.
  #[inline]
  pub fn realm(&self) -> &Realm {
    &self.inner.realm
  }

  #[inline]
  pub fn state(&self) -> PortState {
    self.inner.state.get()
  }

  /// Returns `true` once the port is closing, closed or detached.
  #[inline]
  pub fn is_closed(&self) -> bool {
    self.inner.state.get() != PortState::Initialized
  }

  #[inline]
  pub fn flags(&self) -> PortFlags {
    self.inner.flags.get()
  }

  /// Returns `true` if the port may appear in a transfer list.
  #[inline]
  pub fn is_transferable(&self) -> bool {
    !self.inner.flags.get().contains(PortFlags::PRIVILEGED)
  }

  /// Controls whether the port closes itself once its sibling is gone.
  pub fn set_close_when_sibling_closes(&self, value: bool) {
    let mut flags: PortFlags = self.inner.flags.get();
    flags.set(PortFlags::CLOSE_WHEN_SIBLING_CLOSES, value);
    self.inner.flags.set(flags);
  }

  /// Returns `true` if nothing is listening on the other side anymore.
  pub fn is_sibling_closed(&self) -> bool {
    self.channel().is_none_or(|channel| channel.is_sibling_closed())
  }

  #[inline]
  fn channel(&self) -> Option<Arc<Channel>> {
    self.inner.channel.borrow().clone()
  }

  // ---------------------------------------------------------------------------
  // Sending
  // ---------------------------------------------------------------------------

  /// Posts `value` to the sibling port, moving every entry of `transfer`.
  ///
  /// Posting on a closed port does nothing. If the sibling is gone the
  /// message is dropped without error.
  ///
  /// # Errors
  ///
  /// Returns a [`MessageError`] if the value cannot be serialized or the
  /// transfer list is invalid, including when it contains this port or its
  /// sibling. Nothing is moved on error.
  pub fn post_message(&self, value: &Value, transfer: &[Value]) -> Result<(), MessageError> {
    let Some(channel) = self.channel() else {
      return Ok(());
    };

    let sibling: Option<Arc<Channel>> = channel.sibling();

    for port in transfer.iter().filter_map(Value::as_port) {
      if port.ptr_eq(self) {
        return Err(MessageError::TransferList(
          "Transfer list contains source port",
        ));
      }

      let is_sibling: bool = match (port.channel(), &sibling) {
        (Some(target), Some(sibling)) => Arc::ptr_eq(&target, sibling),
        _ => false,
      };

      if is_sibling {
        return Err(MessageError::TransferList(
          "Transfer list contains the sibling of the source port",
        ));
      }
    }

    drop(sibling);

    channel.send(Message::serialize(value, transfer)?);

    Ok(())
  }

  /// Posts a control message to the sibling.
  pub(crate) fn post_control(&self, flag: MessageFlag, data: Option<&[u8]>) -> bool {
    match self.channel() {
      Some(channel) => channel.send(Message::control(flag, data)),
      None => false,
    }
  }

  // ---------------------------------------------------------------------------
  // Receiving
  // ---------------------------------------------------------------------------

  /// Installs the message handler. Also starts and references the port.
  pub fn set_on_message<F>(&self, handler: F)
  where
    F: FnMut(Value) + 'static,
  {
    if self.is_closed() {
      return;
    }

    self.set_message_handler(handler);

    self.inner.refed.set(true);
    self.start();
  }

  /// Installs the message handler without touching delivery or references.
  pub(crate) fn set_message_handler<F>(&self, handler: F)
  where
    F: FnMut(Value) + 'static,
  {
    *self.inner.on_message.borrow_mut() = Some(Rc::new(RefCell::new(handler)));
  }

  /// Removes the message handler. Also stops and unreferences the port.
  pub fn clear_on_message(&self) {
    drop(self.inner.on_message.borrow_mut().take());

    self.inner.refed.set(false);
    self.stop();
  }

  /// Installs the handler called once the port has closed.
  pub fn set_on_close<F>(&self, handler: F)
  where
    F: FnOnce() + 'static,
  {
    *self.inner.on_close.borrow_mut() = Some(Box::new(handler));
  }

  /// Enables delivery of queued and future messages.
  ///
  /// # Panics
  ///
  /// Panics if the port is closed.
  pub fn start(&self) {
    let Some(channel) = self.channel() else {
      raise!(Error, BadArg, "cannot start a closed port");
    };

    channel.start();

    self.update_ref();
  }

  /// Pauses delivery. Queued messages are kept.
  pub fn stop(&self) {
    if let Some(channel) = self.channel() {
      channel.stop();
    }

    self.update_ref();
  }

  /// Lets the port keep its realm's loop alive while it is started.
  pub fn ref_(&self) {
    self.inner.refed.set(true);
    self.update_ref();
  }

  /// Stops the port from keeping its realm's loop alive.
  pub fn unref(&self) {
    self.inner.refed.set(false);
    self.update_ref();
  }

  /// Returns `true` if the port currently keeps its realm's loop alive.
  #[inline]
  pub fn has_ref(&self) -> bool {
    self.inner.counted.get()
  }

  fn update_ref(&self) {
    let inner: &PortInner = &self.inner;

    let wanted: bool = inner.refed.get()
      && inner.state.get() == PortState::Initialized
      && self.channel().is_some_and(|channel| channel.is_started());

    if wanted == inner.counted.get() {
      return;
    }

    inner.counted.set(wanted);

    if wanted {
      inner.realm.ref_handle();
    } else {
      inner.realm.unref_handle();
    }
  }

  fn spawn_receiver(&self) {
    let port: WeakPort = self.downgrade();
    let waker: Arc<Notify> = Arc::clone(&self.inner.waker);

    self.inner.realm.spawn_local(async move {
      loop {
        waker.notified().await;

        let Some(port) = port.upgrade() else {
          break;
        };

        if port.is_closed() {
          break;
        }

        port.on_wake();
      }
    });
  }

  /// Handles the messages queued when the wakeup fired.
  ///
  /// Messages that arrive while handling are left for the next wakeup.
  fn on_wake(&self) {
    let realm: &Realm = &self.inner.realm;

    let Some(channel) = self.channel() else {
      return;
    };

    if !realm.can_call_into_app() {
      let dropped: usize = channel.take_queue().len();

      if dropped > 0 {
        trace!(target: "strand", dropped, "messages discarded: realm is shutting down");
      }

      return;
    }

    let mut budget: usize = channel.queue_len();

    'drain: while budget > 0 {
      budget -= 1;

      let Some(channel) = self.channel() else {
        return;
      };

      let Some(mut message) = channel.receive() else {
        break 'drain;
      };

      if message.is_control() {
        let flag: MessageFlag = message.flag();

        if let Some(control) = message.into_control() {
          self.on_control(control);
        }

        if flag == MessageFlag::StopThread || !realm.can_call_into_app() {
          return;
        }

        continue 'drain;
      }

      let value: Value = match message.deserialize(realm) {
        Ok(value) => value,
        Err(error) => {
          realm.report_uncaught(Value::String(error.to_string()));
          continue 'drain;
        }
      };

      let handler: Option<MessageHandler> = self.inner.on_message.borrow().clone();

      let Some(handler) = handler else {
        trace!(target: "strand", "message dropped: no handler installed");
        continue 'drain;
      };

      if !realm.invoke(|| (*handler.borrow_mut())(value)) {
        // Keep going with the rest on the next turn.
        self.inner.waker.notify_one();
        return;
      }
    }

    let Some(channel) = self.channel() else {
      return;
    };

    if channel.is_started() && channel.queue_len() > 0 {
      self.inner.waker.notify_one();
      return;
    }

    if self.flags().contains(PortFlags::CLOSE_WHEN_SIBLING_CLOSES)
      && channel.is_sibling_closed()
      && channel.queue_len() == 0
    {
      self.close();
    }
  }

  fn on_control(&self, control: ControlMessage) {
    let listener: Option<InternalListener> = self.inner.listener.borrow().clone();

    match listener {
      Some(InternalListener::Child) => {
        if control == ControlMessage::StopThread {
          self.stop();
          self.inner.realm.stop();
        }
      }
      Some(InternalListener::Parent(worker)) => {
        if let Some(worker) = worker.upgrade() {
          WorkerInner::on_control(&worker, control);
        }
      }
      None => {
        trace!(target: "strand", flag = ?control.flag(), "control message dropped: no listener");
      }
    }
  }

  // ---------------------------------------------------------------------------
  // Teardown
  // ---------------------------------------------------------------------------

  /// Closes the port.
  ///
  /// The pair is severed immediately, so the sibling stops receiving and
  /// eventually closes too. The close handler runs on a later turn of the
  /// realm's loop, after which the port is [`PortState::Closed`].
  pub fn close(&self) {
    let inner: &PortInner = &self.inner;

    if inner.state.get() != PortState::Initialized {
      return;
    }

    inner.state.set(PortState::Closing);

    if let Some(channel) = inner.channel.borrow_mut().take() {
      channel.clear_owner();
      channel.disentangle();
    }

    self.update_ref();

    drop(inner.on_message.borrow_mut().take());
    drop(inner.listener.borrow_mut().take());

    let on_close: Option<CloseHandler> = inner.on_close.borrow_mut().take();
    let realm: WeakRealm = inner.realm.downgrade();
    let port: WeakPort = self.downgrade();

    trace!(target: "strand", "port closing");

    inner.realm.spawn_local(async move {
      if let Some(port) = port.upgrade() {
        port.inner.state.set(PortState::Closed);
      }

      if let (Some(handler), Some(realm)) = (on_close, realm.upgrade()) {
        realm.invoke(handler);
      }
    });

    // Let the receiver task observe the state change and exit.
    inner.waker.notify_one();
  }

  /// Unbinds the channel from this port so it can be adopted by another
  /// realm, possibly on another thread.
  ///
  /// The port becomes inert; its close handler does not run. Returns `None`
  /// if the port is already closed.
  ///
  /// # Panics
  ///
  /// Panics if the port is privileged.
  pub fn detach(&self) -> Option<Arc<Channel>> {
    if !self.is_transferable() {
      raise!(Error, BadArg, "cannot detach a privileged port");
    }

    let inner: &PortInner = &self.inner;

    if inner.state.get() != PortState::Initialized {
      return None;
    }

    let channel: Option<Arc<Channel>> = inner.channel.borrow_mut().take();

    if let Some(channel) = channel.as_deref() {
      channel.clear_owner();
    }

    inner.state.set(PortState::Closed);

    self.update_ref();

    drop(inner.on_message.borrow_mut().take());
    drop(inner.on_close.borrow_mut().take());

    inner.waker.notify_one();

    channel
  }

  /// Detaches the channel for a transfer. The receiving side starts out
  /// stopped, like a new port.
  pub(crate) fn detach_for_transfer(&self) -> Option<Arc<Channel>> {
    let channel: Arc<Channel> = self.detach()?;
    channel.stop();
    Some(channel)
  }
}

impl Debug for Port {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("Port")
      .field("state", &self.inner.state.get())
      .field("flags", &self.inner.flags.get())
      .field("refed", &self.inner.counted.get())
      .finish_non_exhaustive()
  }
}

impl Drop for PortInner {
  fn drop(&mut self) {
    if let Some(channel) = self.channel.get_mut().take() {
      channel.clear_owner();
      channel.disentangle();
    }

    if self.counted.replace(false) {
      self.realm.unref_handle();
    }

    self.waker.notify_one();
  }
}

impl WeakPort {
  #[inline]
  pub(crate) fn upgrade(&self) -> Option<Port> {
    self.inner.upgrade().map(|inner| Port { inner })
  }

  #[inline]
  pub(crate) fn is_alive(&self) -> bool {
    self.inner.strong_count() > 0
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
