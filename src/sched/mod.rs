//! Foreground and background task scheduling.
//!
//! # Contents
//!
//! - [`TaskQueue`]: Blocking FIFO with a completion barrier
//! - [`Scheduler`]: Background pool plus a registry of per-realm queues

mod foreground;
mod scheduler;
mod task_queue;

pub(crate) use self::foreground::DelayedTask;
pub(crate) use self::foreground::ForegroundQueue;
pub(crate) use self::foreground::run_task;

pub use self::foreground::Task;
pub use self::scheduler::Scheduler;
pub use self::scheduler::SchedulerConfig;
pub use self::task_queue::TaskQueue;
