//! Single-threaded runtime instances.
//!
//! A [`Realm`] owns an event loop, a heap budget and the hooks an embedder
//! uses to observe failures. Everything bound to a realm ([`Port`]s,
//! buffers, timers) lives on the realm's thread; realms talk to each other
//! only through channels and shared segments.
//!
//! [`Port`]: crate::port::Port

mod config;
mod event_loop;

pub use self::config::RealmConfig;
pub use self::event_loop::LoopHandle;

use std::cell::Cell;
use std::cell::RefCell;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::future::Future;
use std::io;
use std::mem;
use std::num::NonZeroU64;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Builder;
use tokio::runtime::Runtime as TokioRuntime;
use tokio::sync::Notify;
use tokio::task::LocalSet;
use tracing::Level;
use tracing::Span;
use tracing::debug;
use tracing::error;
use tracing::span;
use tracing::warn;

use crate::consts::E_CODE_FAILURE;
use crate::consts::E_CODE_SUCCESS;
use crate::error::OutOfMemory;
use crate::error::SchedulerError;
use crate::port::Port;
use crate::port::WeakPort;
use crate::sched::DelayedTask;
use crate::sched::ForegroundQueue;
use crate::sched::Scheduler;
use crate::sched::Task;
use crate::sched::run_task;
use crate::utils::UniqueId;
use crate::utils::panic_message;
use crate::value::Value;

type Hook = Rc<dyn Fn(&Realm)>;
type ErrorHook = Rc<dyn Fn(&Realm, Value)>;

// -----------------------------------------------------------------------------
// Realm Id
// -----------------------------------------------------------------------------

/// A process-wide unique identifier of a [`Realm`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RealmId(NonZeroU64);

impl RealmId {
  #[inline]
  pub(crate) fn next() -> Self {
    static IDS: UniqueId = UniqueId::new();
    Self(IDS.next())
  }

  #[inline]
  pub const fn get(&self) -> u64 {
    self.0.get()
  }
}

impl Display for RealmId {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    Display::fmt(&self.0, f)
  }
}

// -----------------------------------------------------------------------------
// Realm
// -----------------------------------------------------------------------------

/// A single-threaded runtime instance with its own event loop.
///
/// `Realm` is a cheap handle; clones refer to the same instance. It is not
/// `Send`: a realm and everything bound to it stays on the thread that
/// created it. Use [`loop_handle`] to interrupt it from another thread and
/// [`Scheduler::call_on_foreground_thread`] to send it work.
///
/// [`loop_handle`]: Self::loop_handle
#[derive(Clone)]
pub struct Realm {
  inner: Rc<RealmInner>,
}

/// A non-owning reference to a [`Realm`].
#[derive(Clone)]
pub(crate) struct WeakRealm {
  inner: Weak<RealmInner>,
}

impl WeakRealm {
  #[inline]
  pub(crate) fn upgrade(&self) -> Option<Realm> {
    self.inner.upgrade().map(|inner| Realm { inner })
  }
}

struct RealmInner {
  id: RealmId,
  name: Option<String>,
  // NOTE: Declared before `runtime` so pending tasks drop first.
  local: LocalSet,
  runtime: TokioRuntime,
  scheduler: Arc<Scheduler>,
  foreground: triomphe::Arc<ForegroundQueue>,
  control: LoopHandle,
  alive: Cell<usize>,
  idle: Notify,
  heap: Heap,
  hooks: Hooks,
  cleanup: RefCell<Vec<Box<dyn FnOnce()>>>,
  handles: RefCell<Vec<WeakPort>>,
  message_port: RefCell<Option<Port>>,
  worker_data: RefCell<Option<Value>>,
  exit_code: Cell<i32>,
  can_call_into_app: Cell<bool>,
  disposed: Cell<bool>,
}

struct Heap {
  limit: usize,
  used: Cell<usize>,
  exhausted: Cell<bool>,
}

#[derive(Default)]
struct Hooks {
  uncaught: RefCell<Option<ErrorHook>>,
  out_of_memory: RefCell<Option<Hook>>,
  memory_pressure: RefCell<Option<Hook>>,
  before_exit: RefCell<Option<Hook>>,
}

impl Realm {
  /// Creates a new realm registered with `scheduler`.
  pub fn new(scheduler: &Arc<Scheduler>, config: RealmConfig) -> io::Result<Self> {
    Self::with_loop(scheduler, config, LoopHandle::new())
  }

  pub(crate) fn with_loop(
    scheduler: &Arc<Scheduler>,
    config: RealmConfig,
    control: LoopHandle,
  ) -> io::Result<Self> {
    let runtime: TokioRuntime = Builder::new_current_thread().enable_time().build()?;
    let id: RealmId = RealmId::next();
    let foreground: triomphe::Arc<ForegroundQueue> = scheduler.register_realm(id);

    let inner: Rc<RealmInner> = Rc::new(RealmInner {
      id,
      name: config.name,
      local: LocalSet::new(),
      runtime,
      scheduler: Arc::clone(scheduler),
      foreground,
      control,
      alive: Cell::new(0),
      idle: Notify::new(),
      heap: Heap {
        limit: config.heap_limit,
        used: Cell::new(0),
        exhausted: Cell::new(false),
      },
      hooks: Hooks::default(),
      cleanup: RefCell::new(Vec::new()),
      handles: RefCell::new(Vec::new()),
      message_port: RefCell::new(None),
      worker_data: RefCell::new(None),
      exit_code: Cell::new(E_CODE_SUCCESS),
      can_call_into_app: Cell::new(true),
      disposed: Cell::new(false),
    });

    let this: Self = Self { inner };

    this.spawn_foreground_flush();

    debug!(
      target: "strand",
      realm = %id,
      name = this.inner.name.as_deref().unwrap_or(""),
      heap_limit = this.inner.heap.limit,
      "realm created",
    );

    Ok(this)
  }

  #[inline]
  pub fn id(&self) -> RealmId {
    self.inner.id
  }

  #[inline]
  pub fn name(&self) -> Option<&str> {
    self.inner.name.as_deref()
  }

  #[inline]
  pub fn scheduler(&self) -> &Arc<Scheduler> {
    &self.inner.scheduler
  }

  /// Returns a thread-safe handle that can stop this realm's loop.
  #[inline]
  pub fn loop_handle(&self) -> LoopHandle {
    self.inner.control.clone()
  }

  #[inline]
  pub(crate) fn downgrade(&self) -> WeakRealm {
    WeakRealm {
      inner: Rc::downgrade(&self.inner),
    }
  }

  /// Returns `true` if both handles refer to the same realm.
  #[inline]
  pub fn ptr_eq(&self, other: &Self) -> bool {
    Rc::ptr_eq(&self.inner, &other.inner)
  }

  // ---------------------------------------------------------------------------
  // Event Loop
  // ---------------------------------------------------------------------------

  /// Drives the event loop until no referenced handle is alive, or until the
  /// loop is stopped or terminated.
  ///
  /// # Panics
  ///
  /// Panics if called from inside a callback of this realm.
  pub fn run(&self) {
    let inner: &RealmInner = &self.inner;

    if inner.control.is_terminating() {
      return;
    }

    let span: Span = span!(target: "strand", Level::TRACE, "realm::run", realm = %inner.id);
    let _enter = span.enter();

    inner.local.block_on(&inner.runtime, async {
      tokio::select! {
        biased;
        () = inner.control.stopped() => {}
        () = self.wait_idle() => {}
      }
    });

    inner.control.clear_stop();
  }

  async fn wait_idle(&self) {
    'idle: loop {
      if self.inner.alive.get() == 0 {
        // Give tasks that were already woken a chance to run first.
        tokio::task::yield_now().await;

        if self.inner.alive.get() == 0 {
          break 'idle;
        }

        continue 'idle;
      }

      self.inner.idle.notified().await;
    }
  }

  /// Makes the current (or next) call to [`run`] return.
  ///
  /// [`run`]: Self::run
  #[inline]
  pub fn stop(&self) {
    self.inner.control.stop();
  }

  /// Returns `true` once the loop has been terminated.
  #[inline]
  pub fn is_terminating(&self) -> bool {
    self.inner.control.is_terminating()
  }

  /// Returns `true` while at least one referenced handle keeps the loop
  /// alive.
  #[inline]
  pub fn is_alive(&self) -> bool {
    self.inner.alive.get() > 0
  }

  #[inline]
  pub(crate) fn ref_handle(&self) {
    self.inner.alive.set(self.inner.alive.get() + 1);
  }

  pub(crate) fn unref_handle(&self) {
    let alive: usize = self.inner.alive.get().saturating_sub(1);

    self.inner.alive.set(alive);

    if alive == 0 {
      self.inner.idle.notify_one();
    }
  }

  /// Spawns a task on this realm's loop. The task does not keep the loop
  /// alive.
  #[inline]
  pub(crate) fn spawn_local<F>(&self, future: F)
  where
    F: Future<Output = ()> + 'static,
  {
    drop(self.inner.local.spawn_local(future));
  }

  /// Calls `callback` once `delay` has elapsed. The pending timer keeps the
  /// loop alive.
  pub fn set_timeout<F>(&self, delay: Duration, callback: F)
  where
    F: FnOnce() + 'static,
  {
    let realm: WeakRealm = self.downgrade();

    self.ref_handle();

    self.spawn_local(async move {
      tokio::time::sleep(delay).await;

      let Some(realm) = realm.upgrade() else {
        return;
      };

      if realm.can_call_into_app() {
        realm.invoke(callback);
      }

      realm.unref_handle();
    });
  }

  // ---------------------------------------------------------------------------
  // Foreground Tasks
  // ---------------------------------------------------------------------------

  /// Posts `task` to this realm through its scheduler.
  #[inline]
  pub fn post_task<F>(&self, task: F) -> Result<(), SchedulerError>
  where
    F: FnOnce() + Send + 'static,
  {
    self.inner.scheduler.call_on_foreground_thread(self.inner.id, task)
  }

  /// Posts `task` to this realm through its scheduler, to run after `delay`.
  #[inline]
  pub fn post_delayed_task<F>(&self, task: F, delay: Duration) -> Result<(), SchedulerError>
  where
    F: FnOnce() + Send + 'static,
  {
    self
      .inner
      .scheduler
      .call_delayed_on_foreground_thread(self.inner.id, task, delay)
  }

  /// Runs every pending foreground task now.
  ///
  /// Delayed tasks are turned into timers that do not keep the loop alive.
  /// A task that panics is reported as an uncaught exception of this realm.
  /// Returns the number of immediate tasks that ran.
  pub fn flush_foreground_tasks(&self) -> usize {
    let id: RealmId = self.inner.id;

    self.inner.foreground.flush_tasks(
      |task: Task| {
        self.invoke(task);
      },
      |delayed: DelayedTask| {
        let realm: WeakRealm = self.downgrade();

        self.spawn_local(async move {
          tokio::time::sleep(delayed.delay).await;

          match realm.upgrade() {
            Some(realm) => {
              realm.invoke(delayed.task);
            }
            None => run_task(id, delayed.task),
          }
        });
      },
    )
  }

  fn spawn_foreground_flush(&self) {
    let queue: triomphe::Arc<ForegroundQueue> = self.inner.foreground.clone();
    let realm: WeakRealm = self.downgrade();

    self.spawn_local(async move {
      loop {
        queue.flush_requested().await;

        let Some(realm) = realm.upgrade() else {
          break;
        };

        realm.flush_foreground_tasks();
      }
    });
  }

  // ---------------------------------------------------------------------------
  // Heap
  // ---------------------------------------------------------------------------

  /// Reserves `bytes` of the realm's heap budget.
  ///
  /// If the reservation does not fit, the memory-pressure handler runs once
  /// to give the embedder a chance to release memory. If it still does not
  /// fit, the realm is out of memory: the loop is terminated, the
  /// out-of-memory handler runs exactly once, and this and every later
  /// reservation fail without attempting to allocate.
  pub fn reserve_heap(&self, bytes: usize) -> Result<(), OutOfMemory> {
    let heap: &Heap = &self.inner.heap;

    let error: OutOfMemory = OutOfMemory {
      requested: bytes,
      limit: heap.limit,
    };

    if heap.exhausted.get() {
      return Err(error);
    }

    if !heap.fits(bytes) {
      if let Some(hook) = self.hook(&self.inner.hooks.memory_pressure) {
        self.invoke(|| hook(self));
      }

      if !heap.fits(bytes) {
        heap.exhausted.set(true);

        self.inner.can_call_into_app.set(false);
        self.inner.control.terminate();

        warn!(
          target: "strand",
          realm = %self.inner.id,
          requested = bytes,
          used = heap.used.get(),
          limit = heap.limit,
          "realm out of memory",
        );

        match self.hook(&self.inner.hooks.out_of_memory) {
          Some(hook) => hook(self),
          None => error!(target: "strand", realm = %self.inner.id, "{error}"),
        }

        return Err(error);
      }
    }

    heap.used.set(heap.used.get() + bytes);

    Ok(())
  }

  /// Returns `bytes` to the realm's heap budget.
  #[inline]
  pub fn release_heap(&self, bytes: usize) {
    let heap: &Heap = &self.inner.heap;
    heap.used.set(heap.used.get().saturating_sub(bytes));
  }

  /// Returns the number of reserved heap bytes.
  #[inline]
  pub fn heap_used(&self) -> usize {
    self.inner.heap.used.get()
  }

  /// Returns `true` once a reservation has failed.
  #[inline]
  pub fn is_out_of_memory(&self) -> bool {
    self.inner.heap.exhausted.get()
  }

  // ---------------------------------------------------------------------------
  // Hooks
  // ---------------------------------------------------------------------------

  /// Installs the handler for uncaught exceptions (including panics raised
  /// by callbacks of this realm).
  pub fn set_uncaught_exception_handler<F>(&self, handler: F)
  where
    F: Fn(&Realm, Value) + 'static,
  {
    *self.inner.hooks.uncaught.borrow_mut() = Some(Rc::new(handler));
  }

  /// Installs the handler invoked when the heap budget is exhausted.
  pub fn set_out_of_memory_handler<F>(&self, handler: F)
  where
    F: Fn(&Realm) + 'static,
  {
    *self.inner.hooks.out_of_memory.borrow_mut() = Some(Rc::new(handler));
  }

  /// Installs the handler invoked when a reservation would exceed the heap
  /// budget, before the realm is declared out of memory.
  pub fn set_memory_pressure_handler<F>(&self, handler: F)
  where
    F: Fn(&Realm) + 'static,
  {
    *self.inner.hooks.memory_pressure.borrow_mut() = Some(Rc::new(handler));
  }

  /// Installs the handler invoked when the loop becomes idle, before the
  /// owner decides whether to exit.
  pub fn set_before_exit_handler<F>(&self, handler: F)
  where
    F: Fn(&Realm) + 'static,
  {
    *self.inner.hooks.before_exit.borrow_mut() = Some(Rc::new(handler));
  }

  /// Registers a hook to run when the realm is disposed.
  ///
  /// Hooks run in reverse registration order.
  pub fn add_cleanup_hook<F>(&self, hook: F)
  where
    F: FnOnce() + 'static,
  {
    self.inner.cleanup.borrow_mut().push(Box::new(hook));
  }

  #[inline]
  fn hook<T>(&self, slot: &RefCell<Option<Rc<T>>>) -> Option<Rc<T>>
  where
    T: ?Sized,
  {
    slot.borrow().clone()
  }

  /// Runs the before-exit handler, if any.
  pub(crate) fn emit_before_exit(&self) {
    if let Some(hook) = self.hook(&self.inner.hooks.before_exit) {
      self.invoke(|| hook(self));
    }
  }

  /// Calls into application code, reporting a panic as an uncaught
  /// exception.
  ///
  /// Returns `false` if the callback panicked.
  pub(crate) fn invoke<F>(&self, callback: F) -> bool
  where
    F: FnOnce(),
  {
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
      Ok(()) => true,
      Err(payload) => {
        self.report_uncaught(Value::from_panic(payload));
        false
      }
    }
  }

  /// Reports `error` as an uncaught exception of this realm.
  ///
  /// Without a handler the error is logged, the exit code is set to
  /// [`E_CODE_FAILURE`] and the loop stops.
  pub fn report_uncaught(&self, error: Value) {
    let Some(hook) = self.hook(&self.inner.hooks.uncaught) else {
      error!(target: "strand", realm = %self.inner.id, error = ?error, "uncaught exception");

      self.set_exit_code(E_CODE_FAILURE);
      self.stop();

      return;
    };

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(self, error))) {
      error!(
        target: "strand",
        realm = %self.inner.id,
        error = panic_message(&*payload),
        "uncaught exception handler panicked",
      );

      self.stop();
    }
  }

  // ---------------------------------------------------------------------------
  // State
  // ---------------------------------------------------------------------------

  /// Returns `false` once application code may no longer run in this realm.
  #[inline]
  pub fn can_call_into_app(&self) -> bool {
    self.inner.can_call_into_app.get() && !self.inner.control.is_terminating()
  }

  #[inline]
  pub fn exit_code(&self) -> i32 {
    self.inner.exit_code.get()
  }

  #[inline]
  pub fn set_exit_code(&self, code: i32) {
    self.inner.exit_code.set(code);
  }

  /// Returns the port connected to the parent, inside a worker realm.
  #[inline]
  pub fn message_port(&self) -> Option<Port> {
    self.inner.message_port.borrow().clone()
  }

  #[inline]
  pub(crate) fn set_message_port(&self, port: Port) {
    *self.inner.message_port.borrow_mut() = Some(port);
  }

  /// Returns the data the parent passed to this worker realm.
  #[inline]
  pub fn worker_data(&self) -> Value {
    self.inner.worker_data.borrow().clone().unwrap_or_default()
  }

  #[inline]
  pub(crate) fn set_worker_data(&self, value: Value) {
    *self.inner.worker_data.borrow_mut() = Some(value);
  }

  /// Tracks a port so it is closed when the realm is disposed.
  pub(crate) fn register_port(&self, port: WeakPort) {
    let mut handles = self.inner.handles.borrow_mut();

    handles.retain(WeakPort::is_alive);
    handles.push(port);
  }

  // ---------------------------------------------------------------------------
  // Teardown
  // ---------------------------------------------------------------------------

  /// Tears the realm down.
  ///
  /// Application code is disabled, every open port is closed (their close
  /// handlers run), cleanup hooks run, and the realm is unregistered from
  /// its scheduler. Calling this more than once has no further effect.
  pub fn dispose(&self) {
    let inner: &RealmInner = &self.inner;

    if inner.disposed.replace(true) {
      return;
    }

    inner.can_call_into_app.set(false);

    let handles: Vec<WeakPort> = mem::take(&mut *inner.handles.borrow_mut());

    for port in handles.iter().filter_map(WeakPort::upgrade) {
      port.close();
    }

    drop(inner.message_port.borrow_mut().take());

    // One more turn so pending close handlers run.
    inner.local.block_on(&inner.runtime, tokio::task::yield_now());

    let hooks: Vec<Box<dyn FnOnce()>> = mem::take(&mut *inner.cleanup.borrow_mut());

    for hook in hooks.into_iter().rev() {
      if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(hook)) {
        error!(
          target: "strand",
          realm = %inner.id,
          error = panic_message(&*payload),
          "cleanup hook panicked",
        );
      }
    }

    // Hooks may hold handles that refer back to this realm.
    drop(inner.hooks.uncaught.borrow_mut().take());
    drop(inner.hooks.out_of_memory.borrow_mut().take());
    drop(inner.hooks.memory_pressure.borrow_mut().take());
    drop(inner.hooks.before_exit.borrow_mut().take());

    inner.scheduler.unregister_realm(inner.id);

    debug!(target: "strand", realm = %inner.id, "realm disposed");
  }
}

impl Heap {
  #[inline]
  fn fits(&self, bytes: usize) -> bool {
    self.limit == 0
      || self
        .used
        .get()
        .checked_add(bytes)
        .is_some_and(|total| total <= self.limit)
  }
}

impl Drop for RealmInner {
  fn drop(&mut self) {
    if !self.disposed.get() {
      self.scheduler.unregister_realm(self.id);
    }
  }
}

impl Debug for Realm {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("Realm")
      .field("id", &self.inner.id)
      .field("name", &self.inner.name)
      .field("alive", &self.inner.alive.get())
      .finish_non_exhaustive()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
