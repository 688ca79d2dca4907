use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::mem;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use tokio::sync::Notify;
use tracing::trace;

use crate::consts::CAP_CHANNEL_QUEUE;
use crate::error::raise;
use crate::port::Message;

// -----------------------------------------------------------------------------
// Pair
// -----------------------------------------------------------------------------

/// State shared by the two ends of an entangled pair.
///
/// The lock guards the sibling links on both sides at once, so severing the
/// pair is a single critical section and the relation stays symmetric.
struct Pair {
  ends: Mutex<[Weak<Channel>; 2]>,
}

// -----------------------------------------------------------------------------
// Channel
// -----------------------------------------------------------------------------

struct ChannelState {
  started: bool,
  queue: VecDeque<Message>,
  owner: Option<Weak<Notify>>,
}

/// One endpoint of an entangled pair.
///
/// A channel is the thread-safe half of a [`Port`]: it owns the incoming
/// message queue and the link to its sibling. Any thread may enqueue into a
/// channel; only the owning realm drains it.
///
/// Lock order: pair lock, then a channel's own state lock. No application
/// code ever runs while either is held.
///
/// [`Port`]: crate::port::Port
pub struct Channel {
  state: Mutex<ChannelState>,
  pair: OnceLock<(Arc<Pair>, usize)>,
}

impl Channel {
  /// Creates an unentangled channel.
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      state: Mutex::new(ChannelState {
        started: false,
        queue: VecDeque::with_capacity(CAP_CHANNEL_QUEUE),
        owner: None,
      }),
      pair: OnceLock::new(),
    })
  }

  /// Creates two channels entangled with each other.
  pub fn pair() -> (Arc<Self>, Arc<Self>) {
    let a: Arc<Self> = Self::new();
    let b: Arc<Self> = Self::new();

    Self::entangle(&a, &b);

    (a, b)
  }

  /// Links `a` and `b` so that sending on one delivers to the other.
  ///
  /// # Panics
  ///
  /// Panics if either channel has already been entangled.
  pub fn entangle(a: &Arc<Self>, b: &Arc<Self>) {
    if Arc::ptr_eq(a, b) {
      raise!(Error, BadArg, "cannot entangle a channel with itself");
    }

    if a.pair.get().is_some() || b.pair.get().is_some() {
      raise!(Error, BadArg, "channel is already entangled");
    }

    let pair: Arc<Pair> = Arc::new(Pair {
      ends: Mutex::new([Arc::downgrade(a), Arc::downgrade(b)]),
    });

    if a.pair.set((Arc::clone(&pair), 0)).is_err() || b.pair.set((pair, 1)).is_err() {
      raise!(Error, SysInv, "channel was entangled concurrently");
    }
  }

  /// Returns the sibling channel, if the pair is still intact.
  pub fn sibling(&self) -> Option<Arc<Self>> {
    let (pair, side) = self.pair.get()?;
    let ends = pair.ends.lock();

    ends[side ^ 1].upgrade()
  }

  /// Returns `true` if both handles refer to the same channel.
  #[inline]
  pub fn ptr_eq(this: &Arc<Self>, other: &Arc<Self>) -> bool {
    Arc::ptr_eq(this, other)
  }

  /// Returns `true` if this channel has no sibling (never entangled,
  /// disentangled, or the other end is gone).
  pub fn is_sibling_closed(&self) -> bool {
    let Some((pair, side)) = self.pair.get() else {
      return true;
    };

    pair.ends.lock()[side ^ 1].strong_count() == 0
  }

  /// Appends `message` to this channel's queue and wakes its owner.
  ///
  /// Callable from any thread. Never blocks on the owner.
  pub fn add_to_queue(&self, message: Message) {
    let owner: Option<Arc<Notify>> = {
      let mut state = self.state.lock();

      state.queue.push_back(message);
      state.owner.as_ref().and_then(Weak::upgrade)
    };

    if let Some(owner) = owner {
      owner.notify_one();
    }
  }

  /// Delivers `message` to the sibling's queue.
  ///
  /// Returns `false` if there is no sibling; the message is dropped.
  pub fn send(&self, message: Message) -> bool {
    let Some((pair, side)) = self.pair.get() else {
      trace!(target: "strand", "message dropped: channel was never entangled");
      return false;
    };

    let mut rejected: Option<Message> = None;

    let ends = pair.ends.lock();
    let sibling: Option<Arc<Self>> = ends[side ^ 1].upgrade();

    match sibling.as_deref() {
      Some(sibling) => sibling.add_to_queue(message),
      None => rejected = Some(message),
    }

    drop(ends);

    // The last strong reference may be ours; dropping it disentangles, which
    // takes the pair lock again.
    drop(sibling);

    if let Some(message) = rejected {
      trace!(target: "strand", flag = ?message.flag(), "message dropped: sibling closed");
      drop(message);
      return false;
    }

    true
  }

  /// Severs the link to the sibling on both sides and wakes both owners.
  ///
  /// Idempotent. After this, sends from either side are silently dropped.
  pub fn disentangle(&self) {
    let Some((pair, _)) = self.pair.get() else {
      return;
    };

    let [a, b] = mem::take(&mut *pair.ends.lock());

    for end in [a, b].iter().filter_map(Weak::upgrade) {
      end.wake();
    }
  }

  // ---------------------------------------------------------------------------
  // Owner Side
  // ---------------------------------------------------------------------------

  /// Binds the wakeup primitive of the realm that owns this channel.
  pub(crate) fn set_owner(&self, owner: &Arc<Notify>) {
    self.state.lock().owner = Some(Arc::downgrade(owner));
  }

  /// Unbinds the owner; the channel can then be adopted elsewhere.
  pub(crate) fn clear_owner(&self) {
    self.state.lock().owner = None;
  }

  /// Triggers the owner's wakeup, if any.
  pub(crate) fn wake(&self) {
    let owner: Option<Arc<Notify>> = self.state.lock().owner.as_ref().and_then(Weak::upgrade);

    if let Some(owner) = owner {
      owner.notify_one();
    }
  }

  /// Enables delivery and wakes the owner if messages are waiting.
  pub fn start(&self) {
    let pending: bool = {
      let mut state = self.state.lock();
      state.started = true;
      !state.queue.is_empty()
    };

    if pending {
      self.wake();
    }
  }

  /// Pauses delivery. Queued messages stay queued.
  pub fn stop(&self) {
    self.state.lock().started = false;
  }

  #[inline]
  pub fn is_started(&self) -> bool {
    self.state.lock().started
  }

  /// Returns the number of queued messages.
  #[inline]
  pub fn queue_len(&self) -> usize {
    self.state.lock().queue.len()
  }

  /// Pops the next message if delivery is enabled.
  pub(crate) fn receive(&self) -> Option<Message> {
    let mut state = self.state.lock();

    if !state.started {
      return None;
    }

    state.queue.pop_front()
  }

  /// Removes every queued message regardless of the started flag.
  pub(crate) fn take_queue(&self) -> VecDeque<Message> {
    mem::take(&mut self.state.lock().queue)
  }
}

impl Drop for Channel {
  fn drop(&mut self) {
    self.disentangle();
  }
}

impl Debug for Channel {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    let state = self.state.lock();

    f.debug_struct("Channel")
      .field("started", &state.started)
      .field("queued", &state.queue.len())
      .field("owned", &state.owner.is_some())
      .finish_non_exhaustive()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
