use std::collections::VecDeque;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::error;
use tracing::trace;

use crate::realm::RealmId;
use crate::sched::TaskQueue;
use crate::utils::panic_message;

/// A unit of work posted to the [`Scheduler`].
///
/// [`Scheduler`]: crate::sched::Scheduler
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A foreground task that must wait `delay` before running.
pub(crate) struct DelayedTask {
  pub(crate) task: Task,
  pub(crate) delay: Duration,
}

// -----------------------------------------------------------------------------
// Foreground Queue
// -----------------------------------------------------------------------------

/// Tasks bound to one realm's thread.
///
/// Producers on any thread push work and signal `flush`; the owning realm
/// waits on `flush` from its event loop and runs the tasks in push order.
pub(crate) struct ForegroundQueue {
  realm: RealmId,
  tasks: TaskQueue<Task>,
  delayed: TaskQueue<DelayedTask>,
  flush: Notify,
}

impl ForegroundQueue {
  pub(crate) fn new(realm: RealmId) -> Self {
    Self {
      realm,
      tasks: TaskQueue::new(),
      delayed: TaskQueue::new(),
      flush: Notify::new(),
    }
  }

  #[inline]
  pub(crate) fn realm(&self) -> RealmId {
    self.realm
  }

  pub(crate) fn post_task(&self, task: Task) {
    self.tasks.push(task);
    self.flush.notify_one();
  }

  pub(crate) fn post_delayed_task(&self, task: Task, delay: Duration) {
    self.delayed.push(DelayedTask { task, delay });
    self.flush.notify_one();
  }

  /// Waits until a producer requests a flush.
  #[inline]
  pub(crate) async fn flush_requested(&self) {
    self.flush.notified().await;
  }

  /// Hands every queued immediate task to `run`, on the calling thread,
  /// and each delayed task to `schedule`, which turns it into a one-shot
  /// timer.
  ///
  /// Returns the number of immediate tasks that ran.
  pub(crate) fn flush_tasks<R, S>(&self, mut run: R, mut schedule: S) -> usize
  where
    R: FnMut(Task),
    S: FnMut(DelayedTask),
  {
    while let Some(delayed) = self.delayed.pop() {
      self.delayed.notify_of_completion();
      schedule(delayed);
    }

    let mut count: usize = 0;

    while let Some(task) = self.tasks.pop() {
      run(task);
      self.tasks.notify_of_completion();
      count += 1;
    }

    count
  }

  /// Drains the queues during teardown.
  ///
  /// Immediate tasks still run; delayed tasks are discarded.
  pub(crate) fn dispose(&self) {
    let delayed: VecDeque<DelayedTask> = self.delayed.take_all();

    if !delayed.is_empty() {
      trace!(
        target: "strand",
        realm = %self.realm,
        count = delayed.len(),
        "discarding delayed foreground tasks",
      );
    }

    for task in self.tasks.take_all() {
      run_task(self.realm, task);
    }
  }
}

/// Runs a scheduled task outside of any realm, logging any panic it raises.
pub(crate) fn run_task(realm: RealmId, task: Task) {
  if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
    error!(
      target: "strand",
      realm = %realm,
      error = panic_message(&*payload),
      "foreground task panicked",
    );
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use parking_lot::Mutex;
  use std::sync::Arc;
  use std::time::Duration;

  use crate::realm::RealmId;
  use crate::sched::foreground::DelayedTask;
  use crate::sched::foreground::ForegroundQueue;
  use crate::sched::foreground::Task;
  use crate::sched::foreground::run_task;

  #[test]
  fn test_flush_runs_in_push_order() {
    let queue: ForegroundQueue = ForegroundQueue::new(RealmId::next());
    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    for index in 0..4 {
      let seen: Arc<Mutex<Vec<u32>>> = Arc::clone(&seen);
      queue.post_task(Box::new(move || seen.lock().push(index)));
    }

    let count: usize = queue.flush_tasks(
      |task: Task| task(),
      |_| panic!("no delayed tasks expected"),
    );

    assert_eq!(count, 4);
    assert_eq!(*seen.lock(), vec![0, 1, 2, 3]);
  }

  #[test]
  fn test_flush_hands_off_delayed_tasks() {
    let queue: ForegroundQueue = ForegroundQueue::new(RealmId::next());
    let mut delays: Vec<Duration> = Vec::new();

    queue.post_delayed_task(Box::new(|| {}), Duration::from_millis(5));
    queue.post_delayed_task(Box::new(|| {}), Duration::from_millis(9));

    queue.flush_tasks(
      |_| panic!("no immediate tasks expected"),
      |delayed: DelayedTask| delays.push(delayed.delay),
    );

    assert_eq!(
      delays,
      vec![Duration::from_millis(5), Duration::from_millis(9)],
    );
  }

  #[test]
  fn test_panicking_task_is_contained() {
    let queue: ForegroundQueue = ForegroundQueue::new(RealmId::next());
    let seen: Arc<Mutex<bool>> = Arc::new(Mutex::new(false));

    queue.post_task(Box::new(|| panic!("task failure")));
    queue.post_task({
      let seen: Arc<Mutex<bool>> = Arc::clone(&seen);
      Box::new(move || *seen.lock() = true)
    });

    let realm: RealmId = queue.realm();

    assert_eq!(queue.flush_tasks(|task: Task| run_task(realm, task), |_| {}), 2);
    assert!(*seen.lock());
  }

  #[test]
  fn test_dispose_discards_delayed() {
    let queue: ForegroundQueue = ForegroundQueue::new(RealmId::next());
    let seen: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));

    queue.post_delayed_task(
      {
        let seen: Arc<Mutex<u32>> = Arc::clone(&seen);
        Box::new(move || *seen.lock() += 10)
      },
      Duration::from_secs(60),
    );
    queue.post_task({
      let seen: Arc<Mutex<u32>> = Arc::clone(&seen);
      Box::new(move || *seen.lock() += 1)
    });

    queue.dispose();

    assert_eq!(*seen.lock(), 1);
  }
}
