use hashbrown::HashMap;
use hashbrown::hash_map::Entry;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;
use tracing::Level;
use tracing::Span;
use tracing::debug;
use tracing::error;
use tracing::span;
use tracing::trace;

use crate::consts;
use crate::error::SchedulerError;
use crate::error::fatal;
use crate::realm::RealmId;
use crate::sched::ForegroundQueue;
use crate::sched::Task;
use crate::sched::TaskQueue;
use crate::utils::measure_fn;
use crate::utils::panic_message;

// -----------------------------------------------------------------------------
// Scheduler Config
// -----------------------------------------------------------------------------

/// Configuration of a [`Scheduler`].
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
  /// Number of threads servicing the background queue.
  pub background_threads: usize,
  /// Stack size (in bytes) of each background thread.
  pub thread_stack_size: usize,
}

impl SchedulerConfig {
  #[inline]
  pub fn new() -> Self {
    Self {
      background_threads: available_parallelism(),
      thread_stack_size: consts::DEFAULT_THREAD_STACK_SIZE,
    }
  }
}

impl Default for SchedulerConfig {
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

/// Returns the number of available CPU cores.
///
/// Falls back to [`DEFAULT_BACKGROUND_THREADS`] if CPU detection fails.
///
/// [`DEFAULT_BACKGROUND_THREADS`]: consts::DEFAULT_BACKGROUND_THREADS
fn available_parallelism() -> usize {
  match thread::available_parallelism() {
    Ok(count) => count.get(),
    Err(_) => consts::DEFAULT_BACKGROUND_THREADS,
  }
}

// -----------------------------------------------------------------------------
// Scheduler
// -----------------------------------------------------------------------------

/// Arbitrates foreground (realm-bound) and background (pool) work.
///
/// Background tasks run on a fixed pool of dedicated threads pulling from one
/// shared [`TaskQueue`]. Foreground tasks are posted to a specific realm and
/// only ever run on that realm's own thread, in push order.
///
/// Realms register on creation and unregister on disposal. Registration is
/// refcounted: the per-realm queues are torn down exactly once, after the
/// last owner unregisters.
pub struct Scheduler {
  background: Arc<TaskQueue<Task>>,
  threads: Mutex<Vec<JoinHandle<()>>>,
  thread_count: usize,
  registry: Mutex<HashMap<RealmId, Registration>>,
  origin: Instant,
}

struct Registration {
  refs: usize,
  queue: triomphe::Arc<ForegroundQueue>,
}

impl Scheduler {
  /// Creates a new scheduler and starts its background pool.
  pub fn new(config: SchedulerConfig) -> Arc<Self> {
    let span: Span = span!(target: "strand", Level::DEBUG, "scheduler");
    let background: Arc<TaskQueue<Task>> = Arc::new(TaskQueue::new());
    let thread_count: usize = config.background_threads.max(1);
    let mut threads: Vec<JoinHandle<()>> = Vec::with_capacity(thread_count);

    for index in 0..thread_count {
      let queue: Arc<TaskQueue<Task>> = Arc::clone(&background);
      let spawn: io::Result<JoinHandle<()>> = thread::Builder::new()
        .name(format!("strand-bg-{:0>2}", index + 1))
        .stack_size(config.thread_stack_size)
        .spawn(move || background_runner(queue));

      match spawn {
        Ok(handle) => threads.push(handle),
        Err(error) => fatal!(format!("failed to spawn background thread: {error}")),
      }
    }

    debug!(target: "strand", parent: &span, threads = thread_count, "background pool started");

    Arc::new(Self {
      background,
      threads: Mutex::new(threads),
      thread_count,
      registry: Mutex::new(HashMap::new()),
      origin: Instant::now(),
    })
  }

  // ---------------------------------------------------------------------------
  // Background Tasks
  // ---------------------------------------------------------------------------

  /// Posts `task` to the background pool.
  pub fn call_on_background_thread<F>(&self, task: F) -> Result<(), SchedulerError>
  where
    F: FnOnce() + Send + 'static,
  {
    if !self.background.push(Box::new(task)) {
      return Err(SchedulerError::Shutdown);
    }

    Ok(())
  }

  /// Blocks until every background task posted so far has run to completion.
  #[inline]
  pub fn drain_background_tasks(&self) {
    self.background.blocking_drain();
  }

  /// Returns the number of threads in the background pool.
  #[inline]
  pub fn background_threads(&self) -> usize {
    self.thread_count
  }

  // ---------------------------------------------------------------------------
  // Foreground Tasks
  // ---------------------------------------------------------------------------

  /// Posts `task` to run on the thread of the realm identified by `realm`.
  pub fn call_on_foreground_thread<F>(&self, realm: RealmId, task: F) -> Result<(), SchedulerError>
  where
    F: FnOnce() + Send + 'static,
  {
    self.foreground(realm)?.post_task(Box::new(task));
    Ok(())
  }

  /// Posts `task` to run on the thread of `realm` once `delay` has elapsed.
  ///
  /// Delayed tasks do not keep the realm's event loop alive.
  pub fn call_delayed_on_foreground_thread<F>(
    &self,
    realm: RealmId,
    task: F,
    delay: Duration,
  ) -> Result<(), SchedulerError>
  where
    F: FnOnce() + Send + 'static,
  {
    self.foreground(realm)?.post_delayed_task(Box::new(task), delay);
    Ok(())
  }

  fn foreground(&self, realm: RealmId) -> Result<triomphe::Arc<ForegroundQueue>, SchedulerError> {
    match self.registry.lock().get(&realm) {
      Some(registration) => Ok(registration.queue.clone()),
      None => Err(SchedulerError::UnknownRealm(realm)),
    }
  }

  // ---------------------------------------------------------------------------
  // Registration
  // ---------------------------------------------------------------------------

  /// Registers `realm`, returning its foreground queue.
  ///
  /// Registering an already registered realm increments its refcount and
  /// returns the existing queue.
  pub(crate) fn register_realm(&self, realm: RealmId) -> triomphe::Arc<ForegroundQueue> {
    match self.registry.lock().entry(realm) {
      Entry::Occupied(mut entry) => {
        entry.get_mut().refs += 1;
        entry.get().queue.clone()
      }
      Entry::Vacant(entry) => {
        let queue: triomphe::Arc<ForegroundQueue> = triomphe::Arc::new(ForegroundQueue::new(realm));

        entry.insert(Registration {
          refs: 1,
          queue: queue.clone(),
        });

        trace!(target: "strand", realm = %realm, "realm registered");

        queue
      }
    }
  }

  /// Drops one registration of `realm`.
  ///
  /// Returns `true` if this was the last owner, in which case remaining
  /// immediate foreground tasks run on the calling thread and delayed ones
  /// are discarded.
  pub(crate) fn unregister_realm(&self, realm: RealmId) -> bool {
    let removed: Option<triomphe::Arc<ForegroundQueue>> = {
      let mut registry = self.registry.lock();

      match registry.get_mut(&realm) {
        Some(registration) if registration.refs > 1 => {
          registration.refs -= 1;
          None
        }
        Some(_) => registry.remove(&realm).map(|registration| registration.queue),
        None => None,
      }
    };

    let Some(queue) = removed else {
      return false;
    };

    queue.dispose();

    trace!(target: "strand", realm = %realm, "realm unregistered");

    true
  }

  /// Returns `true` if `realm` is currently registered.
  #[inline]
  pub fn is_registered(&self, realm: RealmId) -> bool {
    self.registry.lock().contains_key(&realm)
  }

  // ---------------------------------------------------------------------------
  // Misc
  // ---------------------------------------------------------------------------

  /// Returns the time elapsed since this scheduler was created.
  #[inline]
  pub fn monotonic_time(&self) -> Duration {
    self.origin.elapsed()
  }

  /// Stops the background queue, joins the pool and drops every
  /// registration.
  ///
  /// Background tasks that no thread picked up are discarded without
  /// running, so a later [`drain_background_tasks`] returns immediately.
  ///
  /// [`drain_background_tasks`]: Self::drain_background_tasks
  ///
  /// Calling this more than once has no further effect.
  pub fn shutdown(&self) {
    let threads: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());

    if threads.is_empty() {
      return;
    }

    self.background.stop();

    let ((), elapsed): ((), Duration) = measure_fn(|| {
      for handle in threads {
        if handle.thread().id() == thread::current().id() {
          continue;
        }

        if handle.join().is_err() {
          error!(target: "strand", "background thread terminated abnormally");
        }
      }
    });

    let discarded: usize = self.background.take_all().len();

    self.registry.lock().clear();

    debug!(
      target: "strand",
      elapsed = ?elapsed,
      discarded,
      "background pool stopped",
    );
  }
}

impl Drop for Scheduler {
  fn drop(&mut self) {
    self.shutdown();
  }
}

fn background_runner(queue: Arc<TaskQueue<Task>>) {
  while let Some(task) = queue.blocking_pop() {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
      error!(
        target: "strand",
        error = panic_message(&*payload),
        "background task panicked",
      );
    }

    queue.notify_of_completion();
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
