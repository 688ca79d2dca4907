use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::collections::VecDeque;

use crate::consts::CAP_TASK_QUEUE;

// -----------------------------------------------------------------------------
// Task Queue
// -----------------------------------------------------------------------------

/// A blocking multi-producer, multi-consumer FIFO queue.
///
/// Every pushed item is counted as *outstanding* until a consumer calls
/// [`notify_of_completion`], not merely until it is popped. This lets
/// [`blocking_drain`] wait for true completion of all work.
///
/// [`notify_of_completion`]: Self::notify_of_completion
/// [`blocking_drain`]: Self::blocking_drain
pub struct TaskQueue<T> {
  state: Mutex<QueueState<T>>,
  tasks_available: Condvar,
  tasks_drained: Condvar,
}

struct QueueState<T> {
  queue: VecDeque<T>,
  outstanding: usize,
  stopped: bool,
}

impl<T> TaskQueue<T> {
  /// Creates a new, empty `TaskQueue`.
  pub fn new() -> Self {
    Self {
      state: Mutex::new(QueueState {
        queue: VecDeque::with_capacity(CAP_TASK_QUEUE),
        outstanding: 0,
        stopped: false,
      }),
      tasks_available: Condvar::new(),
      tasks_drained: Condvar::new(),
    }
  }

  /// Appends `task` and wakes one blocked consumer.
  ///
  /// Returns `false`, dropping `task`, if the queue has been [stopped].
  ///
  /// [stopped]: Self::stop
  pub fn push(&self, task: T) -> bool {
    let mut state: MutexGuard<'_, QueueState<T>> = self.state.lock();

    if state.stopped {
      return false;
    }

    state.outstanding += 1;
    state.queue.push_back(task);

    self.tasks_available.notify_one();

    true
  }

  /// Removes the task at the front of the queue without blocking.
  pub fn pop(&self) -> Option<T> {
    self.state.lock().queue.pop_front()
  }

  /// Removes the task at the front of the queue, waiting for one if the
  /// queue is empty.
  ///
  /// Returns `None` once the queue has been [stopped].
  ///
  /// [stopped]: Self::stop
  pub fn blocking_pop(&self) -> Option<T> {
    let mut state: MutexGuard<'_, QueueState<T>> = self.state.lock();

    'wait: loop {
      if state.stopped {
        break 'wait None;
      }

      if let Some(task) = state.queue.pop_front() {
        break 'wait Some(task);
      }

      self.tasks_available.wait(&mut state);
    }
  }

  /// Signals that a previously popped task has finished running.
  pub fn notify_of_completion(&self) {
    let mut state: MutexGuard<'_, QueueState<T>> = self.state.lock();

    let Some(outstanding) = state.outstanding.checked_sub(1) else {
      return;
    };

    state.outstanding = outstanding;

    if outstanding == 0 {
      self.tasks_drained.notify_all();
    }
  }

  /// Blocks until every pushed task has signalled completion.
  pub fn blocking_drain(&self) {
    let mut state: MutexGuard<'_, QueueState<T>> = self.state.lock();

    while state.outstanding > 0 {
      self.tasks_drained.wait(&mut state);
    }
  }

  /// Stops the queue, waking every blocked consumer.
  ///
  /// Later pushes are rejected. Tasks still in the queue are kept; [`pop`]
  /// continues to return them and [`take_all`] discards them.
  ///
  /// [`pop`]: Self::pop
  /// [`take_all`]: Self::take_all
  pub fn stop(&self) {
    let mut state: MutexGuard<'_, QueueState<T>> = self.state.lock();

    state.stopped = true;

    self.tasks_available.notify_all();
  }

  /// Returns `true` if the queue has been stopped.
  #[inline]
  pub fn is_stopped(&self) -> bool {
    self.state.lock().stopped
  }

  /// Returns the number of tasks waiting to be popped.
  #[inline]
  pub fn len(&self) -> usize {
    self.state.lock().queue.len()
  }

  /// Returns `true` if no task is waiting to be popped.
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Returns the number of tasks that have not yet signalled completion.
  #[inline]
  pub fn outstanding(&self) -> usize {
    self.state.lock().outstanding
  }

  /// Removes every queued task, treating each as completed.
  pub(crate) fn take_all(&self) -> VecDeque<T> {
    let mut state: MutexGuard<'_, QueueState<T>> = self.state.lock();
    let tasks: VecDeque<T> = std::mem::take(&mut state.queue);

    state.outstanding = state.outstanding.saturating_sub(tasks.len());

    if state.outstanding == 0 {
      self.tasks_drained.notify_all();
    }

    tasks
  }
}

impl<T> Default for TaskQueue<T> {
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;
  use std::thread;
  use std::thread::JoinHandle;
  use std::time::Duration;

  use crate::sched::TaskQueue;

  #[test]
  fn test_fifo_order() {
    let queue: TaskQueue<u32> = TaskQueue::new();

    for value in 0..5 {
      queue.push(value);
    }

    assert_eq!(queue.len(), 5);
    assert_eq!(
      (0..5).filter_map(|_| queue.pop()).collect::<Vec<u32>>(),
      vec![0, 1, 2, 3, 4],
    );
    assert!(queue.pop().is_none());
  }

  #[test]
  fn test_outstanding_until_completion() {
    let queue: TaskQueue<u32> = TaskQueue::new();

    queue.push(1);
    queue.push(2);

    assert_eq!(queue.pop(), Some(1));
    assert_eq!(queue.outstanding(), 2);

    queue.notify_of_completion();
    assert_eq!(queue.outstanding(), 1);

    assert_eq!(queue.pop(), Some(2));
    queue.notify_of_completion();
    assert_eq!(queue.outstanding(), 0);

    // extra completions are ignored
    queue.notify_of_completion();
    assert_eq!(queue.outstanding(), 0);
  }

  #[test]
  fn test_blocking_pop_wakes_on_stop() {
    let queue: Arc<TaskQueue<u32>> = Arc::new(TaskQueue::new());

    let handle: JoinHandle<Option<u32>> = {
      let queue: Arc<TaskQueue<u32>> = Arc::clone(&queue);
      thread::spawn(move || queue.blocking_pop())
    };

    thread::sleep(Duration::from_millis(20));
    queue.stop();

    assert_eq!(handle.join().unwrap(), None);
    assert!(queue.is_stopped());
  }

  #[test]
  fn test_blocking_pop_wakes_on_push() {
    let queue: Arc<TaskQueue<u32>> = Arc::new(TaskQueue::new());

    let handle: JoinHandle<Option<u32>> = {
      let queue: Arc<TaskQueue<u32>> = Arc::clone(&queue);
      thread::spawn(move || queue.blocking_pop())
    };

    thread::sleep(Duration::from_millis(20));
    queue.push(42);

    assert_eq!(handle.join().unwrap(), Some(42));
  }

  #[test]
  fn test_blocking_drain_waits_for_completion() {
    const TASKS: usize = 16;

    let queue: Arc<TaskQueue<usize>> = Arc::new(TaskQueue::new());
    let done: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    for task in 0..TASKS {
      queue.push(task);
    }

    let workers: Vec<JoinHandle<()>> = (0..3)
      .map(|_| {
        let queue: Arc<TaskQueue<usize>> = Arc::clone(&queue);
        let done: Arc<AtomicUsize> = Arc::clone(&done);

        thread::spawn(move || {
          while let Some(_task) = queue.blocking_pop() {
            thread::sleep(Duration::from_millis(2));
            done.fetch_add(1, Ordering::SeqCst);
            queue.notify_of_completion();
          }
        })
      })
      .collect();

    queue.blocking_drain();
    assert_eq!(done.load(Ordering::SeqCst), TASKS);

    queue.stop();

    for worker in workers {
      worker.join().unwrap();
    }
  }

  #[test]
  fn test_take_all_releases_drain() {
    let queue: TaskQueue<u32> = TaskQueue::new();

    queue.push(1);
    queue.push(2);

    assert_eq!(queue.take_all().len(), 2);
    assert_eq!(queue.outstanding(), 0);

    queue.blocking_drain();
  }

  #[test]
  fn test_push_after_stop_is_rejected() {
    let queue: TaskQueue<u32> = TaskQueue::new();

    assert!(queue.push(1));

    queue.stop();

    assert!(!queue.push(2));
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.outstanding(), 1);

    assert_eq!(queue.take_all(), [1]);
    assert_eq!(queue.outstanding(), 0);
  }
}
