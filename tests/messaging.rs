use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use strand::buffer::ArrayBuffer;
use strand::buffer::SharedArrayBuffer;
use strand::error::MessageError;
use strand::port::Channel;
use strand::port::Port;
use strand::port::PortState;
use strand::port::channel;
use strand::realm::Realm;
use strand::realm::RealmConfig;
use strand::sched::Scheduler;
use strand::sched::SchedulerConfig;
use strand::value::HostObject;
use strand::value::Value;

fn realm() -> Realm {
  let scheduler: Arc<Scheduler> = Scheduler::new(SchedulerConfig {
    background_threads: 1,
    ..SchedulerConfig::new()
  });

  Realm::new(&scheduler, RealmConfig::new()).unwrap()
}

/// Runs `f` on a new thread, in a fresh realm owning `channel`.
fn spawn_realm<F, R>(channel: Arc<Channel>, f: F) -> JoinHandle<R>
where
  F: FnOnce(&Realm, Port) -> R + Send + 'static,
  R: Send + 'static,
{
  thread::spawn(move || {
    let realm: Realm = realm();
    let port: Port = Port::adopt(&realm, channel);
    let output: R = f(&realm, port);

    realm.run();
    realm.dispose();

    output
  })
}

#[test]
fn test_fifo_across_threads() {
  const COUNT: i64 = 500;

  let realm: Realm = realm();
  let (a, b) = channel(&realm);
  let seen: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));

  a.set_on_message({
    let seen: Rc<RefCell<Vec<i64>>> = Rc::clone(&seen);
    move |value| seen.borrow_mut().extend(value.as_i64())
  });

  let handle: JoinHandle<()> = spawn_realm(b.detach().unwrap(), |_realm, port| {
    for index in 0..COUNT {
      port.post_message(&Value::from(index), &[]).unwrap();
    }

    port.close();
  });

  // `a` closes on its own once the sibling is gone and the queue is drained.
  realm.run();
  handle.join().unwrap();

  assert_eq!(*seen.borrow(), (0..COUNT).collect::<Vec<i64>>());
  assert!(a.is_closed());
}

#[test]
fn test_dropping_remote_port_closes_local_port() {
  let realm: Realm = realm();
  let (a, b) = channel(&realm);
  let closed: Rc<Cell<bool>> = Rc::new(Cell::new(false));

  a.set_on_message(|_| {});
  a.set_on_close({
    let closed: Rc<Cell<bool>> = Rc::clone(&closed);
    move || closed.set(true)
  });

  spawn_realm(b.detach().unwrap(), |_realm, port| drop(port))
    .join()
    .unwrap();

  realm.run();

  assert!(closed.get());
  assert_eq!(a.state(), PortState::Closed);
  assert!(a.is_sibling_closed());
  assert_eq!(a.post_message(&Value::from(1), &[]), Ok(()));
}

#[test]
fn test_port_can_outlive_its_sibling() {
  let realm: Realm = realm();
  let (a, b) = channel(&realm);

  a.set_close_when_sibling_closes(false);
  a.start();

  drop(b);
  realm.run();

  assert!(a.is_sibling_closed());
  assert_eq!(a.state(), PortState::Initialized);
}

#[test]
fn test_transfer_buffer_across_threads() {
  let realm: Realm = realm();
  let (a, b) = channel(&realm);
  let buffer: ArrayBuffer = ArrayBuffer::new(4);

  buffer.write(0, b"abcd");

  let value: Value = Value::from(buffer.clone());

  a.post_message(&value, &[value.clone()]).unwrap();

  assert!(buffer.is_detached());
  assert_eq!(buffer.byte_length(), 0);

  let handle: JoinHandle<Option<Vec<u8>>> = spawn_realm(b.detach().unwrap(), |realm, port| {
    let received: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));

    port.set_on_message({
      let received: Rc<RefCell<Option<Vec<u8>>>> = Rc::clone(&received);
      let port: Port = port.clone();
      move |value| {
        if let Value::ArrayBuffer(buffer) = value {
          *received.borrow_mut() = Some(buffer.to_vec());
        }

        port.close();
      }
    });

    realm.run();

    received.borrow_mut().take()
  });

  assert_eq!(handle.join().unwrap().as_deref(), Some(&b"abcd"[..]));
}

#[test]
fn test_shared_buffer_visible_across_threads() {
  let realm: Realm = realm();
  let (a, b) = channel(&realm);
  let shared: SharedArrayBuffer = SharedArrayBuffer::new(4);
  let observed: Rc<Cell<Option<u8>>> = Rc::new(Cell::new(None));

  a.set_on_message({
    let shared: SharedArrayBuffer = shared.clone();
    let observed: Rc<Cell<Option<u8>>> = Rc::clone(&observed);
    move |value| {
      if value.as_str() == Some("stored") {
        observed.set(Some(shared.load(0)));
      }
    }
  });

  a.post_message(&Value::from(shared.clone()), &[]).unwrap();

  let handle: JoinHandle<()> = spawn_realm(b.detach().unwrap(), |_realm, port| {
    let reply: Port = port.clone();

    port.set_on_message(move |value| {
      if let Value::SharedArrayBuffer(memory) = value {
        memory.store(0, 42);
        reply.post_message(&Value::from("stored"), &[]).unwrap();
      }

      reply.close();
    });
  });

  realm.run();
  handle.join().unwrap();

  assert_eq!(observed.get(), Some(42));
  assert_eq!(shared.load(0), 42);
}

#[test]
fn test_transfer_port_to_another_thread() {
  let realm: Realm = realm();
  let (a, b) = channel(&realm);
  let (c, d) = channel(&realm);
  let seen: Rc<RefCell<Vec<Value>>> = Rc::new(RefCell::new(Vec::new()));

  d.set_on_message({
    let seen: Rc<RefCell<Vec<Value>>> = Rc::clone(&seen);
    let d: Port = d.clone();
    move |value| {
      seen.borrow_mut().push(value);
      d.close();
    }
  });

  a.post_message(&Value::from(c.clone()), &[Value::from(c.clone())])
    .unwrap();

  assert!(c.is_closed());

  let handle: JoinHandle<()> = spawn_realm(b.detach().unwrap(), |_realm, port| {
    let this: Port = port.clone();

    port.set_on_message(move |value| {
      if let Some(moved) = value.as_port() {
        moved.post_message(&Value::from("hello"), &[]).unwrap();
        moved.close();
      }

      this.close();
    });
  });

  realm.run();
  handle.join().unwrap();

  assert_eq!(*seen.borrow(), vec![Value::from("hello")]);
}

#[test]
fn test_round_trip_plain_values() {
  let realm: Realm = realm();
  let (a, b) = channel(&realm);
  let seen: Rc<RefCell<Option<Value>>> = Rc::new(RefCell::new(None));

  let value: Value = Value::object([
    ("null", Value::Null),
    ("flag", Value::from(true)),
    ("count", Value::from(-12)),
    ("ratio", Value::from(0.25)),
    ("name", Value::from("strand")),
    ("items", Value::from(vec![Value::from(1), Value::Undefined])),
  ]);

  b.set_on_message({
    let seen: Rc<RefCell<Option<Value>>> = Rc::clone(&seen);
    let b: Port = b.clone();
    move |value| {
      *seen.borrow_mut() = Some(value);
      b.close();
    }
  });

  a.post_message(&value, &[]).unwrap();
  realm.run();

  assert_eq!(seen.borrow().as_ref(), Some(&value));
}

#[test]
fn test_host_object_cannot_be_posted() {
  let realm: Realm = realm();
  let (a, _b) = channel(&realm);
  let value: Value = Value::Host(HostObject::new("Socket"));

  assert!(matches!(
    a.post_message(&value, &[]),
    Err(MessageError::DataClone(_)),
  ));
}
