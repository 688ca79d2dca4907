use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing::Span;
use tracing::debug;
use tracing::error;
use tracing::span;
use tracing::warn;

use crate::error::fatal;
use crate::port::InternalListener;
use crate::port::Message;
use crate::port::MessageFlag;
use crate::port::Port;
use crate::port::PortFlags;
use crate::realm::Realm;
use crate::realm::RealmConfig;
use crate::sched::Scheduler;
use crate::utils::measure_fn;
use crate::value::Value;
use crate::worker::ErrorFormatter;
use crate::worker::ResourceLimits;
use crate::worker::worker::WorkerShared;

/// Why a worker stops on its own.
enum Failure {
  OutOfMemory,
  Uncaught(Value),
}

/// Everything a worker thread owns when it starts.
pub(super) struct ThreadContext {
  pub(super) thread_id: u64,
  pub(super) scheduler: Arc<Scheduler>,
  pub(super) shared: triomphe::Arc<WorkerShared>,
  pub(super) limits: ResourceLimits,
  pub(super) formatter: Arc<dyn ErrorFormatter>,
  pub(super) worker_data: Message,
}

impl ThreadContext {
  /// Body of a worker thread.
  pub(super) fn run<F>(mut self, entry: F)
  where
    F: FnOnce(&Realm, Port),
  {
    let span: Span = span!(target: "strand", Level::DEBUG, "worker", thread_id = self.thread_id);
    let _enter = span.enter();

    debug!(target: "strand", parent: &span, "worker thread starting");

    let (exit_code, elapsed): (i32, Duration) = measure_fn(|| self.run_realm(entry));

    debug!(
      target: "strand",
      parent: &span,
      exit_code,
      elapsed = ?elapsed,
      "worker thread stopped",
    );

    self.shared.report_stopped();
  }

  fn run_realm<F>(&mut self, entry: F) -> i32
  where
    F: FnOnce(&Realm, Port),
  {
    let config: RealmConfig = RealmConfig::new()
      .heap_limit(self.limits.max_heap_size)
      .name(format!("worker-{}", self.thread_id));

    let realm: Realm =
      match Realm::with_loop(&self.scheduler, config, self.shared.child_loop().clone()) {
        Ok(realm) => realm,
        Err(error) => fatal!(format!("failed to build worker event loop: {error}")),
      };

    let Some(channel) = self.shared.take_child_channel() else {
      fatal!("worker child channel missing");
    };

    let port: Port = Port::with_flags(
      &realm,
      channel,
      PortFlags::PRIVILEGED,
      Some(InternalListener::Child),
    );

    port.start();
    realm.set_message_port(port.clone());

    self.install_hooks(&realm);

    match self.worker_data.deserialize(&realm) {
      Ok(value) => realm.set_worker_data(value),
      Err(error) => realm.report_uncaught(Value::String(error.to_string())),
    }

    port.post_control(MessageFlag::Online, None);

    // `exit` may have landed before the realm existed.
    if !self.shared.is_stopped() {
      realm.invoke(|| entry(&realm, port));
    }

    'run: loop {
      if self.shared.is_stopped() {
        break 'run;
      }

      realm.run();

      if self.shared.is_stopped() {
        break 'run;
      }

      realm.emit_before_exit();

      if !realm.is_alive() {
        break 'run;
      }
    }

    let exit_code: i32 = self.shared.finish(realm.exit_code());

    realm.dispose();

    exit_code
  }

  fn install_hooks(&self, realm: &Realm) {
    realm.set_out_of_memory_handler({
      let shared: triomphe::Arc<WorkerShared> = triomphe::Arc::clone(&self.shared);
      let formatter: Arc<dyn ErrorFormatter> = Arc::clone(&self.formatter);
      move |realm| report_failure(realm, &shared, &*formatter, Failure::OutOfMemory)
    });

    realm.set_uncaught_exception_handler({
      let shared: triomphe::Arc<WorkerShared> = triomphe::Arc::clone(&self.shared);
      let formatter: Arc<dyn ErrorFormatter> = Arc::clone(&self.formatter);
      move |realm, error| report_failure(realm, &shared, &*formatter, Failure::Uncaught(error))
    });
  }
}

/// Stops the worker realm and tells the parent why.
///
/// Only the first failure is reported. Nothing is sent if the parent side is
/// already gone.
fn report_failure(
  realm: &Realm,
  shared: &WorkerShared,
  formatter: &dyn ErrorFormatter,
  failure: Failure,
) {
  realm.loop_handle().terminate();

  if !shared.fail() {
    return;
  }

  let Some(port) = realm.message_port() else {
    return;
  };

  if port.is_sibling_closed() {
    return;
  }

  match failure {
    Failure::OutOfMemory => {
      warn!(target: "strand", realm = %realm.id(), "worker out of memory");
      port.post_control(MessageFlag::OutOfMemory, None);
    }
    Failure::Uncaught(value) => {
      error!(target: "strand", realm = %realm.id(), error = ?value, "uncaught error in worker");

      match formatter.serialize_error(&value) {
        Some(report) => port.post_control(MessageFlag::ErrorMessage, Some(&report)),
        None => port.post_control(MessageFlag::CouldNotSerializeError, None),
      };
    }
  }
}
