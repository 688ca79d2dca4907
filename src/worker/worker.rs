use parking_lot::Mutex;
use std::cell::Cell;
use std::cell::RefCell;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::io;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::trace;

use crate::consts::E_CODE_FAILURE;
use crate::consts::E_CODE_SUCCESS;
use crate::error::MessageError;
use crate::error::fatal;
use crate::error::raise;
use crate::port::Channel;
use crate::port::ControlMessage;
use crate::port::InternalListener;
use crate::port::Message;
use crate::port::MessageFlag;
use crate::port::Port;
use crate::port::PortFlags;
use crate::realm::LoopHandle;
use crate::realm::Realm;
use crate::utils::UniqueId;
use crate::utils::panic_message;
use crate::value::Value;
use crate::worker::ErrorFormatter;
use crate::worker::ResourceLimits;
use crate::worker::WorkerError;
use crate::worker::WorkerOptions;
use crate::worker::thread::ThreadContext;

static THREAD_IDS: UniqueId = UniqueId::new();

// -----------------------------------------------------------------------------
// Worker Shared
// -----------------------------------------------------------------------------

/// State shared between a worker's parent and its thread.
pub(crate) struct WorkerShared {
  state: Mutex<WorkerState>,
  /// The parent's channel half; the thread reports its exit straight into it.
  parent_channel: Arc<Channel>,
  /// Controls the loop of the worker realm from the parent.
  child_loop: LoopHandle,
}

struct WorkerState {
  stopped: bool,
  exit_code: i32,
  child_channel: Option<Arc<Channel>>,
}

impl WorkerShared {
  #[inline]
  pub(crate) fn child_loop(&self) -> &LoopHandle {
    &self.child_loop
  }

  #[inline]
  pub(crate) fn is_stopped(&self) -> bool {
    self.state.lock().stopped
  }

  pub(crate) fn take_child_channel(&self) -> Option<Arc<Channel>> {
    self.state.lock().child_channel.take()
  }

  /// Marks the worker stopped because of a failure.
  ///
  /// Returns `false` if it was already stopped, in which case nothing is
  /// reported.
  pub(crate) fn fail(&self) -> bool {
    let mut state = self.state.lock();

    if state.stopped {
      return false;
    }

    state.stopped = true;
    state.exit_code = E_CODE_FAILURE;

    true
  }

  /// Records the final exit code once the worker loop has finished.
  pub(crate) fn finish(&self, realm_exit_code: i32) -> i32 {
    let mut state = self.state.lock();

    if !state.stopped && state.exit_code == E_CODE_SUCCESS {
      state.exit_code = realm_exit_code;
    }

    state.exit_code
  }

  /// Marks the thread as done and tells the parent.
  pub(crate) fn report_stopped(&self) {
    self.state.lock().stopped = true;
    self
      .parent_channel
      .add_to_queue(Message::control(MessageFlag::ThreadStopped, None));
  }
}

// -----------------------------------------------------------------------------
// Worker
// -----------------------------------------------------------------------------

/// A realm running on its own thread, owned by a parent realm.
///
/// `Worker` is a cheap handle; clones refer to the same worker. Dropping the
/// last handle while the thread is still running terminates the thread with
/// exit code [`E_CODE_FAILURE`] and joins it.
#[derive(Clone)]
pub struct Worker {
  inner: Rc<WorkerInner>,
}

pub(crate) struct WorkerInner {
  thread_id: u64,
  realm: Realm,
  port: Port,
  shared: triomphe::Arc<WorkerShared>,
  setup: RefCell<Option<Setup>>,
  thread: RefCell<Option<JoinHandle<()>>>,
  joined: Cell<bool>,
  /// Whether the running thread should keep the parent loop alive.
  refed: Cell<bool>,
  handlers: Handlers,
}

/// Everything the thread needs, held until it is started.
struct Setup {
  limits: ResourceLimits,
  formatter: Arc<dyn ErrorFormatter>,
  worker_data: Message,
}

#[derive(Default)]
struct Handlers {
  on_online: RefCell<Option<Rc<dyn Fn()>>>,
  on_error: RefCell<Option<Rc<dyn Fn(WorkerError)>>>,
  on_exit: RefCell<Option<Box<dyn FnOnce(i32)>>>,
}

impl Worker {
  /// Creates a worker owned by `realm`. The thread is not started yet, but
  /// messages may already be posted to it.
  ///
  /// # Errors
  ///
  /// Returns [`MessageError`] if `options.worker_data` cannot be serialized.
  pub fn new(realm: &Realm, options: WorkerOptions) -> Result<Self, MessageError> {
    let worker_data: Message = Message::serialize(&options.worker_data, &[])?;
    let thread_id: u64 = THREAD_IDS.next().get();

    let (parent_channel, child_channel): (Arc<Channel>, Arc<Channel>) = Channel::pair();

    let shared: triomphe::Arc<WorkerShared> = triomphe::Arc::new(WorkerShared {
      state: Mutex::new(WorkerState {
        stopped: true,
        exit_code: E_CODE_SUCCESS,
        child_channel: Some(child_channel),
      }),
      parent_channel: Arc::clone(&parent_channel),
      child_loop: LoopHandle::new(),
    });

    let inner: Rc<WorkerInner> = Rc::new_cyclic(|this: &Weak<WorkerInner>| WorkerInner {
      thread_id,
      realm: realm.clone(),
      port: Port::with_flags(
        realm,
        parent_channel,
        PortFlags::PRIVILEGED,
        Some(InternalListener::Parent(this.clone())),
      ),
      shared,
      setup: RefCell::new(Some(Setup {
        limits: options.limits,
        formatter: options.formatter,
        worker_data,
      })),
      thread: RefCell::new(None),
      joined: Cell::new(false),
      refed: Cell::new(true),
      handlers: Handlers::default(),
    });

    // Delivery is enabled now; the loop is only kept alive once started.
    inner.port.start();

    // Sub-workers never outlive the realm that owns them.
    realm.add_cleanup_hook({
      let worker: Weak<WorkerInner> = Rc::downgrade(&inner);
      move || {
        if let Some(worker) = worker.upgrade() {
          worker.stop_thread();
        }
      }
    });

    debug!(target: "strand", thread_id, realm = %realm.id(), "worker created");

    Ok(Self { inner })
  }

  /// Returns the process-wide identifier of this worker.
  #[inline]
  pub fn thread_id(&self) -> u64 {
    self.inner.thread_id
  }

  /// Spawns the worker thread.
  ///
  /// The thread builds the worker realm, announces itself to the parent and
  /// calls `entry` with the realm and the port connected to the parent. The
  /// realm's loop then runs until it is idle, the worker is told to exit, or
  /// it fails.
  ///
  /// # Panics
  ///
  /// Panics if the thread was already started.
  pub fn start_thread<F>(&self, entry: F)
  where
    F: FnOnce(&Realm, Port) + Send + 'static,
  {
    let context: ThreadContext = self.inner.prepare_thread();
    let stack_size: usize = context.limits.stack_size;

    let result: io::Result<JoinHandle<()>> = thread::Builder::new()
      .name(format!("strand-worker-{:0>2}", self.inner.thread_id))
      .stack_size(stack_size)
      .spawn(move || context.run(entry));

    match result {
      Ok(handle) => {
        *self.inner.thread.borrow_mut() = Some(handle);
        self.inner.joined.set(false);
      }
      Err(error) => fatal!(format!("failed to spawn worker thread: {error}")),
    }
  }

  /// Asks the worker to stop with `code`.
  ///
  /// Running code inside the worker is interrupted as soon as it yields to
  /// its loop. Completion is only certain once the exit event fired or
  /// [`join_thread`] returned. Has no effect if the worker already stopped.
  ///
  /// [`join_thread`]: Self::join_thread
  #[inline]
  pub fn exit(&self, code: i32) {
    self.inner.exit(code);
  }

  /// Blocks until the worker thread has exited. Idempotent.
  ///
  /// # Panics
  ///
  /// Panics if called from the worker's own thread.
  #[inline]
  pub fn join_thread(&self) {
    self.inner.join_thread();
  }

  /// Terminates the worker with exit code [`E_CODE_FAILURE`] and waits for
  /// its thread to exit.
  #[inline]
  pub fn stop_thread(&self) {
    self.inner.stop_thread();
  }

  /// Returns `true` while the worker has not been told to stop (or has not
  /// been started).
  #[inline]
  pub fn is_running(&self) -> bool {
    !self.inner.shared.is_stopped()
  }

  /// Posts `value` to the worker realm's message port.
  #[inline]
  pub fn post_message(&self, value: &Value, transfer: &[Value]) -> Result<(), MessageError> {
    self.inner.port.post_message(value, transfer)
  }

  /// Installs the handler for messages posted by the worker.
  #[inline]
  pub fn set_on_message<F>(&self, handler: F)
  where
    F: FnMut(Value) + 'static,
  {
    self.inner.port.set_message_handler(handler);
  }

  /// Installs the handler called once the worker realm is ready.
  pub fn set_on_online<F>(&self, handler: F)
  where
    F: Fn() + 'static,
  {
    *self.inner.handlers.on_online.borrow_mut() = Some(Rc::new(handler));
  }

  /// Installs the handler for failures of the worker.
  ///
  /// Without a handler, failures are reported as uncaught exceptions of the
  /// parent realm.
  pub fn set_on_error<F>(&self, handler: F)
  where
    F: Fn(WorkerError) + 'static,
  {
    *self.inner.handlers.on_error.borrow_mut() = Some(Rc::new(handler));
  }

  /// Installs the handler called with the exit code once the thread has
  /// stopped.
  pub fn set_on_exit<F>(&self, handler: F)
  where
    F: FnOnce(i32) + 'static,
  {
    *self.inner.handlers.on_exit.borrow_mut() = Some(Box::new(handler));
  }

  /// Lets the worker keep the parent realm's loop alive once its thread
  /// is started (the default).
  pub fn ref_(&self) {
    self.inner.refed.set(true);

    if self.inner.setup.borrow().is_none() {
      self.inner.port.ref_();
    }
  }

  /// Stops the worker from keeping the parent realm's loop alive.
  pub fn unref(&self) {
    self.inner.refed.set(false);
    self.inner.port.unref();
  }
}

impl Debug for Worker {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("Worker")
      .field("thread_id", &self.inner.thread_id)
      .field("running", &self.is_running())
      .field("joined", &self.inner.joined.get())
      .finish_non_exhaustive()
  }
}

impl WorkerInner {
  /// Marks the worker running and hands out what its thread needs.
  ///
  /// # Panics
  ///
  /// Panics if the thread was already started.
  fn prepare_thread(&self) -> ThreadContext {
    let Some(setup) = self.setup.borrow_mut().take() else {
      raise!(Error, BadArg, "worker thread already started");
    };

    self.shared.state.lock().stopped = false;

    if self.refed.get() {
      self.port.ref_();
    }

    ThreadContext {
      thread_id: self.thread_id,
      scheduler: Arc::clone(self.realm.scheduler()),
      shared: triomphe::Arc::clone(&self.shared),
      limits: setup.limits,
      formatter: setup.formatter,
      worker_data: setup.worker_data,
    }
  }

  fn exit(&self, code: i32) {
    {
      let mut state = self.shared.state.lock();

      if state.stopped {
        return;
      }

      state.stopped = true;
      state.exit_code = code;
    }

    debug!(target: "strand", thread_id = self.thread_id, code, "worker exit requested");

    self.port.post_control(MessageFlag::StopThread, None);
    self.shared.child_loop.terminate();
  }

  fn join_thread(&self) {
    if self.joined.get() {
      return;
    }

    let Some(handle) = self.thread.borrow_mut().take() else {
      return;
    };

    if handle.thread().id() == thread::current().id() {
      raise!(Error, SysInv, "a worker cannot join its own thread");
    }

    if let Err(payload) = handle.join() {
      error!(
        target: "strand",
        thread_id = self.thread_id,
        error = panic_message(&*payload),
        "worker thread panicked",
      );
    }

    self.joined.set(true);

    debug!(target: "strand", thread_id = self.thread_id, "worker joined");
  }

  fn stop_thread(&self) {
    self.exit(E_CODE_FAILURE);
    self.join_thread();
  }

  /// Handles a control message sent by the worker thread.
  pub(crate) fn on_control(this: &Rc<Self>, control: ControlMessage) {
    match control {
      ControlMessage::ThreadStopped => this.on_thread_stopped(),
      ControlMessage::Online => {
        let handler: Option<Rc<dyn Fn()>> = this.handlers.on_online.borrow().clone();

        if let Some(handler) = handler {
          this.realm.invoke(|| handler());
        }
      }
      ControlMessage::OutOfMemory => this.on_error(WorkerError::OutOfMemory),
      ControlMessage::ErrorMessage(report) => this.on_error(WorkerError::Uncaught(report)),
      ControlMessage::CouldNotSerializeError => this.on_error(WorkerError::Unserializable),
      ControlMessage::StopThread => {
        trace!(target: "strand", thread_id = this.thread_id, "unexpected stop order from worker");
      }
    }
  }

  fn on_error(&self, error: WorkerError) {
    let handler: Option<Rc<dyn Fn(WorkerError)>> = self.handlers.on_error.borrow().clone();

    match handler {
      Some(handler) => {
        self.realm.invoke(|| handler(error));
      }
      None => self.realm.report_uncaught(Value::String(error.to_string())),
    }
  }

  fn on_thread_stopped(&self) {
    let exit_code: i32 = {
      let state = self.shared.state.lock();

      if !state.stopped {
        fatal!("worker reported stopped while still running");
      }

      state.exit_code
    };

    self.port.close();
    self.join_thread();

    debug!(target: "strand", thread_id = self.thread_id, exit_code, "worker stopped");

    let handler: Option<Box<dyn FnOnce(i32)>> = self.handlers.on_exit.borrow_mut().take();

    if let Some(handler) = handler {
      self.realm.invoke(|| handler(exit_code));
    }
  }
}

impl Drop for WorkerInner {
  fn drop(&mut self) {
    if self.thread.get_mut().is_some() {
      self.stop_thread();
    }
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use std::cell::Cell;
  use std::rc::Rc;
  use std::sync::Arc;
  use std::sync::atomic::AtomicBool;
  use std::sync::atomic::Ordering;
  use std::thread;

  use crate::realm::Realm;
  use crate::realm::RealmConfig;
  use crate::sched::Scheduler;
  use crate::sched::SchedulerConfig;
  use crate::worker::Worker;
  use crate::worker::WorkerOptions;
  use crate::worker::thread::ThreadContext;

  fn realm() -> Realm {
    let scheduler: Arc<Scheduler> = Scheduler::new(SchedulerConfig {
      background_threads: 1,
      ..SchedulerConfig::new()
    });

    Realm::new(&scheduler, RealmConfig::new()).unwrap()
  }

  #[test]
  fn test_exit_before_realm_is_built_skips_entry() {
    let realm: Realm = self::realm();
    let worker: Worker = Worker::new(&realm, WorkerOptions::new()).unwrap();
    let exit: Rc<Cell<Option<i32>>> = Rc::new(Cell::new(None));
    let entered: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

    worker.set_on_exit({
      let exit: Rc<Cell<Option<i32>>> = Rc::clone(&exit);
      move |code| exit.set(Some(code))
    });

    let context: ThreadContext = worker.inner.prepare_thread();

    // Lands before the thread has built its realm.
    worker.exit(5);

    thread::spawn({
      let entered: Arc<AtomicBool> = Arc::clone(&entered);
      move || context.run(move |_realm, _port| entered.store(true, Ordering::SeqCst))
    })
    .join()
    .unwrap();

    realm.run();

    assert!(!entered.load(Ordering::SeqCst));
    assert_eq!(exit.get(), Some(5));
  }

  #[test]
  fn test_unref_before_start_is_kept() {
    let realm: Realm = self::realm();
    let worker: Worker = Worker::new(&realm, WorkerOptions::new()).unwrap();

    worker.unref();

    let _context: ThreadContext = worker.inner.prepare_thread();

    assert!(!worker.inner.port.has_ref());

    worker.ref_();

    assert!(worker.inner.port.has_ref());
  }
}
