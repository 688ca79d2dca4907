use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use strand::buffer::ArrayBuffer;
use strand::realm::Realm;
use strand::realm::RealmConfig;
use strand::sched::Scheduler;
use strand::sched::SchedulerConfig;
use strand::value::Value;
use strand::worker::ResourceLimits;
use strand::worker::Worker;
use strand::worker::WorkerError;
use strand::worker::WorkerOptions;

fn realm() -> Realm {
  let scheduler: Arc<Scheduler> = Scheduler::new(SchedulerConfig {
    background_threads: 2,
    ..SchedulerConfig::new()
  });

  Realm::new(&scheduler, RealmConfig::new()).unwrap()
}

fn command(name: &str) -> Value {
  Value::object([("cmd", Value::from(name))])
}

fn is_command(value: &Value, name: &str) -> bool {
  value.get("cmd").and_then(Value::as_str) == Some(name)
}

fn record_exit(worker: &Worker) -> Rc<Cell<Option<i32>>> {
  let exit: Rc<Cell<Option<i32>>> = Rc::new(Cell::new(None));
  let sink: Rc<Cell<Option<i32>>> = Rc::clone(&exit);

  worker.set_on_exit(move |code| sink.set(Some(code)));

  exit
}

fn record_errors(worker: &Worker) -> Rc<RefCell<Vec<WorkerError>>> {
  let errors: Rc<RefCell<Vec<WorkerError>>> = Rc::new(RefCell::new(Vec::new()));
  let sink: Rc<RefCell<Vec<WorkerError>>> = Rc::clone(&errors);

  worker.set_on_error(move |error| sink.borrow_mut().push(error));

  errors
}

#[test]
fn test_ping_pong_then_exit() {
  let realm: Realm = realm();
  let worker: Worker = Worker::new(&realm, WorkerOptions::new()).unwrap();
  let exit: Rc<Cell<Option<i32>>> = record_exit(&worker);
  let pongs: Rc<Cell<usize>> = Rc::new(Cell::new(0));

  worker.set_on_message({
    let worker: Worker = worker.clone();
    let pongs: Rc<Cell<usize>> = Rc::clone(&pongs);

    move |value| {
      if is_command(&value, "pong") {
        pongs.set(pongs.get() + 1);
        worker.exit(7);
      }
    }
  });

  worker.start_thread(|_realm, port| {
    let reply = port.clone();

    port.set_on_message(move |value| {
      if is_command(&value, "ping") {
        reply.post_message(&command("pong"), &[]).unwrap();
      }
    });
  });

  worker.post_message(&command("ping"), &[]).unwrap();

  realm.run();
  worker.join_thread();

  assert_eq!(pongs.get(), 1);
  assert_eq!(exit.get(), Some(7));
  assert!(!worker.is_running());
}

#[test]
fn test_messages_posted_before_start_are_delivered() {
  let realm: Realm = realm();
  let worker: Worker = Worker::new(&realm, WorkerOptions::new()).unwrap();
  let exit: Rc<Cell<Option<i32>>> = record_exit(&worker);
  let replies: Rc<RefCell<Vec<Value>>> = Rc::new(RefCell::new(Vec::new()));

  for index in 0..10 {
    worker.post_message(&Value::from(index), &[]).unwrap();
  }

  worker.set_on_message({
    let replies: Rc<RefCell<Vec<Value>>> = Rc::clone(&replies);
    move |value| replies.borrow_mut().push(value)
  });

  worker.start_thread(|_realm, port| {
    let reply = port.clone();
    let mut seen: i64 = 0;

    port.set_on_message(move |value| {
      reply.post_message(&value, &[]).unwrap();
      seen += 1;

      if seen == 10 {
        reply.clear_on_message();
      }
    });
  });

  realm.run();

  let expected: Vec<Value> = (0..10).map(Value::from).collect();

  assert_eq!(*replies.borrow(), expected);
  assert_eq!(exit.get(), Some(0));
}

#[test]
fn test_idle_worker_exits_with_success() {
  let realm: Realm = realm();
  let worker: Worker = Worker::new(&realm, WorkerOptions::new()).unwrap();
  let exit: Rc<Cell<Option<i32>>> = record_exit(&worker);
  let errors: Rc<RefCell<Vec<WorkerError>>> = record_errors(&worker);

  worker.start_thread(|_realm, _port| {});

  realm.run();

  assert_eq!(exit.get(), Some(0));
  assert!(errors.borrow().is_empty());
  assert_eq!(realm.exit_code(), 0);
}

#[test]
fn test_before_exit_can_schedule_more_work() {
  let realm: Realm = realm();
  let worker: Worker = Worker::new(&realm, WorkerOptions::new()).unwrap();
  let exit: Rc<Cell<Option<i32>>> = record_exit(&worker);
  let replies: Rc<RefCell<Vec<Value>>> = Rc::new(RefCell::new(Vec::new()));

  worker.set_on_message({
    let replies: Rc<RefCell<Vec<Value>>> = Rc::clone(&replies);
    move |value| replies.borrow_mut().push(value)
  });

  worker.start_thread(|realm, port| {
    let fired: Cell<bool> = Cell::new(false);

    realm.set_before_exit_handler(move |realm| {
      if fired.replace(true) {
        return;
      }

      let port = port.clone();

      realm.set_timeout(Duration::from_millis(1), move || {
        port.post_message(&Value::from("late"), &[]).unwrap();
      });
    });
  });

  realm.run();

  assert_eq!(*replies.borrow(), vec![Value::from("late")]);
  assert_eq!(exit.get(), Some(0));
}

#[test]
fn test_online_then_worker_data() {
  let realm: Realm = realm();
  let options: WorkerOptions = WorkerOptions::new().worker_data(command("init"));
  let worker: Worker = Worker::new(&realm, options).unwrap();
  let events: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

  worker.set_on_online({
    let events: Rc<RefCell<Vec<String>>> = Rc::clone(&events);
    move || events.borrow_mut().push("online".to_owned())
  });

  worker.set_on_message({
    let events: Rc<RefCell<Vec<String>>> = Rc::clone(&events);
    move |value| {
      if is_command(&value, "init") {
        events.borrow_mut().push("data".to_owned());
      }
    }
  });

  worker.start_thread(|realm, port| {
    port.post_message(&realm.worker_data(), &[]).unwrap();
  });

  realm.run();

  assert_eq!(*events.borrow(), ["online", "data"]);
}

#[test]
fn test_transfer_buffer_to_worker() {
  let realm: Realm = realm();
  let worker: Worker = Worker::new(&realm, WorkerOptions::new()).unwrap();
  let length: Rc<Cell<Option<i64>>> = Rc::new(Cell::new(None));
  let buffer: ArrayBuffer = ArrayBuffer::new(8);

  buffer.write(0, &[1, 2, 3, 4, 5, 6, 7, 8]);

  worker.set_on_message({
    let length: Rc<Cell<Option<i64>>> = Rc::clone(&length);
    move |value| length.set(value.as_i64())
  });

  worker.start_thread(|_realm, port| {
    let reply = port.clone();

    port.set_on_message(move |value| {
      if let Value::ArrayBuffer(buffer) = value {
        let sum: i64 = buffer.to_vec().iter().map(|byte| i64::from(*byte)).sum();
        reply.post_message(&Value::from(sum), &[]).unwrap();
      }

      reply.clear_on_message();
    });
  });

  let value: Value = Value::from(buffer.clone());

  worker.post_message(&value, &[value.clone()]).unwrap();

  assert!(buffer.is_detached());
  assert_eq!(buffer.byte_length(), 0);

  realm.run();

  assert_eq!(length.get(), Some(36));
}

#[test]
fn test_out_of_memory_reported_once() {
  let realm: Realm = realm();
  let limits: ResourceLimits = ResourceLimits {
    max_heap_size: 1024,
    ..ResourceLimits::new()
  };

  let options: WorkerOptions = WorkerOptions::new().limits(limits);
  let worker: Worker = Worker::new(&realm, options).unwrap();
  let exit: Rc<Cell<Option<i32>>> = record_exit(&worker);
  let errors: Rc<RefCell<Vec<WorkerError>>> = record_errors(&worker);

  worker.start_thread(|realm, port| {
    port.set_on_message(|_| {});

    assert!(realm.reserve_heap(512).is_ok());
    assert!(realm.reserve_heap(4096).is_err());
    assert!(realm.reserve_heap(4096).is_err());
    assert!(realm.is_out_of_memory());
  });

  realm.run();
  worker.join_thread();

  assert_eq!(*errors.borrow(), [WorkerError::OutOfMemory]);
  assert_eq!(exit.get(), Some(1));
}

#[test]
fn test_uncaught_error_reported_to_parent() {
  let realm: Realm = realm();
  let worker: Worker = Worker::new(&realm, WorkerOptions::new()).unwrap();
  let exit: Rc<Cell<Option<i32>>> = record_exit(&worker);
  let errors: Rc<RefCell<Vec<WorkerError>>> = record_errors(&worker);

  worker.start_thread(|_realm, _port| panic!("boom"));

  realm.run();

  assert_eq!(*errors.borrow(), [WorkerError::Uncaught(b"boom".to_vec().into_boxed_slice())]);
  assert_eq!(errors.borrow()[0].message().as_deref(), Some("boom"));
  assert_eq!(exit.get(), Some(1));
}

#[test]
fn test_unserializable_error() {
  let realm: Realm = realm();
  let options: WorkerOptions =
    WorkerOptions::new().formatter(|_: &Value| -> Option<Vec<u8>> { None });
  let worker: Worker = Worker::new(&realm, options).unwrap();
  let exit: Rc<Cell<Option<i32>>> = record_exit(&worker);
  let errors: Rc<RefCell<Vec<WorkerError>>> = record_errors(&worker);

  worker.start_thread(|realm, _port| realm.report_uncaught(Value::Null));

  realm.run();

  assert_eq!(*errors.borrow(), [WorkerError::Unserializable]);
  assert_eq!(exit.get(), Some(1));
}

#[test]
fn test_unhandled_worker_error_fails_parent() {
  let realm: Realm = realm();
  let worker: Worker = Worker::new(&realm, WorkerOptions::new()).unwrap();

  worker.start_thread(|_realm, _port| panic!("unhandled"));

  realm.run();
  worker.join_thread();

  assert_eq!(realm.exit_code(), 1);
}

#[test]
fn test_stop_thread_interrupts_busy_worker() {
  let realm: Realm = realm();
  let worker: Worker = Worker::new(&realm, WorkerOptions::new()).unwrap();
  let exit: Rc<Cell<Option<i32>>> = record_exit(&worker);

  // The handler keeps the worker realm alive forever.
  worker.start_thread(|_realm, port| port.set_on_message(|_| {}));
  worker.stop_thread();

  assert!(!worker.is_running());

  realm.run();

  assert_eq!(exit.get(), Some(1));
}

#[test]
fn test_exit_after_stop_is_ignored() {
  let realm: Realm = realm();
  let worker: Worker = Worker::new(&realm, WorkerOptions::new()).unwrap();
  let exit: Rc<Cell<Option<i32>>> = record_exit(&worker);

  worker.start_thread(|_realm, port| port.set_on_message(|_| {}));
  worker.exit(3);
  worker.exit(4);

  realm.run();

  assert_eq!(exit.get(), Some(3));
}

#[test]
fn test_dispose_stops_sub_workers() {
  let realm: Realm = realm();
  let worker: Worker = Worker::new(&realm, WorkerOptions::new()).unwrap();

  worker.start_thread(|_realm, port| port.set_on_message(|_| {}));

  realm.dispose();

  assert!(!worker.is_running());
}

#[test]
fn test_unstarted_worker_does_not_keep_parent_alive() {
  let realm: Realm = realm();
  let worker: Worker = Worker::new(&realm, WorkerOptions::new()).unwrap();

  worker.post_message(&command("ping"), &[]).unwrap();
  worker.set_on_message(|_| {});

  realm.run();

  assert!(!worker.is_running());
  assert_eq!(realm.exit_code(), 0);
}

#[test]
#[should_panic]
fn test_start_thread_twice() {
  let realm: Realm = realm();
  let worker: Worker = Worker::new(&realm, WorkerOptions::new()).unwrap();

  worker.start_thread(|_realm, _port| {});
  worker.start_thread(|_realm, _port| {});
}
