use loom::thread;
use strand::buffer::BackingStore;
use strand::buffer::SharedArrayBuffer;
use strand::buffer::SharedSegment;

#[test]
fn clone_and_drop_across_threads() {
  loom::model(|| {
    let segment: SharedSegment = SharedSegment::new(BackingStore::from_slice(&[1, 2, 3, 4]));

    let threads: Vec<_> = (0..2)
      .map(|_| {
        let segment: SharedSegment = segment.clone();

        thread::spawn(move || {
          let copy: SharedSegment = segment.clone();
          assert_eq!(copy.len(), 4, "segment storage freed early!");
          drop(copy);
        })
      })
      .collect();

    drop(segment);

    for handle in threads {
      handle.join().unwrap();
    }
  });
}

#[test]
fn last_release_on_other_thread() {
  loom::model(|| {
    let segment: SharedSegment = SharedSegment::new(BackingStore::zeroed(8));
    let remote: SharedSegment = segment.clone();

    let handle = thread::spawn(move || {
      assert!(remote.ref_count() >= 1);
      drop(remote);
    });

    assert!(segment.ref_count() >= 1);
    drop(segment);

    handle.join().unwrap();
  });
}

#[test]
fn attached_views_keep_segment_alive() {
  loom::model(|| {
    let segment: SharedSegment = SharedSegment::new(BackingStore::zeroed(4));
    let remote: SharedSegment = segment.clone();

    let handle = thread::spawn(move || {
      let view: SharedArrayBuffer = remote.attach();

      drop(remote);

      view.store(0, 7);
      view.load(0)
    });

    drop(segment);

    assert_eq!(handle.join().unwrap(), 7, "view lost its storage!");
  });
}
