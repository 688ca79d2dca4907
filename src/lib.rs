//! Strand - isolated realms talking over entangled message ports.
//!
//! A [`Realm`] is a single-threaded execution context with its own event
//! loop. Realms never share values; they exchange them through pairs of
//! entangled [`Port`]s. Posting a value serializes it into a [`Message`],
//! moving any listed array buffers and ports, and sharing any shared array
//! buffers. A [`Worker`] is a realm running on its own thread, connected to
//! the realm that created it by a privileged port pair.
//!
//! # Quick Start
//!
//! ```no_run
//! use strand::realm::Realm;
//! use strand::realm::RealmConfig;
//! use strand::sched::Scheduler;
//! use strand::sched::SchedulerConfig;
//! use strand::value::Value;
//! use strand::worker::Worker;
//! use strand::worker::WorkerOptions;
//!
//! let scheduler = Scheduler::new(SchedulerConfig::new());
//! let realm = Realm::new(&scheduler, RealmConfig::new()).unwrap();
//! let worker = Worker::new(&realm, WorkerOptions::new()).unwrap();
//!
//! worker.set_on_message(|value| println!("parent got {value:?}"));
//! worker.start_thread(|_realm, port| {
//!   port.post_message(&Value::from("hello"), &[]).unwrap();
//! });
//!
//! realm.run();
//! ```
//!
//! # Core Modules
//!
//! - [`realm`]: Realms, their event loop and lifecycle hooks
//! - [`port`]: Channels, ports and messages
//! - [`worker`]: Worker threads
//! - [`sched`]: Foreground and background task scheduling
//! - [`buffer`]: Array buffers and shared memory segments
//! - [`value`]: Values that can be posted
//! - [`init`]: Optional tracing setup
//!
//! [`Realm`]: crate::realm::Realm
//! [`Port`]: crate::port::Port
//! [`Message`]: crate::port::Message
//! [`Worker`]: crate::worker::Worker

mod loom;
mod utils;

pub mod buffer;
pub mod consts;
pub mod error;
pub mod init;
pub mod port;
pub mod realm;
pub mod sched;
pub mod value;
pub mod worker;
