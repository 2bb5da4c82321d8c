//! End-to-end behaviour of the watcher over the in-memory backend
//!
//! The backend is driven by hand, so these tests are deterministic up to
//! thread scheduling and never depend on the host's notification API.

mod common;

use common::{manual_watcher, wait_until, Recorder};
use dirwatch::{Action, NotifiedEvent, RawKind, WatchError, WatchId, Watcher};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const WINDOW: Duration = Duration::from_millis(40);
const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn test_add_events_remove_scenario() {
    let temp_dir = TempDir::new().unwrap();
    let (watcher, backend) = manual_watcher(WINDOW);
    let recorder = Recorder::new();

    let id = watcher
        .add_watch(temp_dir.path(), false, recorder.callback())
        .unwrap();
    assert_eq!(id, WatchId::new(1));
    let root = watcher.lookup(id).unwrap().root;

    backend.emit(&root, "a.txt", RawKind::Added);
    backend.emit(&root, "a.txt", RawKind::Removed);
    assert!(recorder.wait_for_count(2, TIMEOUT));

    let events = recorder.events();
    assert_eq!(
        events,
        vec![
            NotifiedEvent::new(id, root.clone(), "a.txt", Action::Added),
            NotifiedEvent::new(id, root.clone(), "a.txt", Action::Removed),
        ]
    );

    watcher.remove_watch(id).unwrap();
    assert!(matches!(
        watcher.remove_watch(id),
        Err(WatchError::UnknownWatch(unknown)) if unknown == id
    ));
    assert!(watcher.watches().is_empty());
}

#[test]
fn test_watch_ids_are_never_reused() {
    let temp_dir = TempDir::new().unwrap();
    let (watcher, _backend) = manual_watcher(WINDOW);

    let mut issued = Vec::new();
    for _ in 0..20 {
        let id = watcher.add_watch(temp_dir.path(), false, |_| {}).unwrap();
        issued.push(id);
        watcher.remove_watch(id).unwrap();
    }

    let mut unique = issued.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), issued.len());
    assert!(issued.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn test_rename_pair_is_one_moved_event() {
    let temp_dir = TempDir::new().unwrap();
    let (watcher, backend) = manual_watcher(WINDOW);
    let recorder = Recorder::new();

    let id = watcher
        .add_watch(temp_dir.path(), false, recorder.callback())
        .unwrap();
    let root = watcher.lookup(id).unwrap().root;

    backend.emit_rename(&root, "a", "b", Some(7));
    assert!(recorder.wait_for_count(1, TIMEOUT));
    thread::sleep(WINDOW * 3);

    assert_eq!(
        recorder.events(),
        vec![NotifiedEvent::moved(id, root, "a", "b")]
    );
}

#[test]
fn test_lone_rename_half_degrades_exactly_once() {
    let temp_dir = TempDir::new().unwrap();
    let (watcher, backend) = manual_watcher(WINDOW);
    let recorder = Recorder::new();

    let id = watcher
        .add_watch(temp_dir.path(), false, recorder.callback())
        .unwrap();
    let root = watcher.lookup(id).unwrap().root;

    backend.emit_with(&root, "gone.txt", RawKind::RenamedFrom, Some(3), None);
    assert!(recorder.wait_for_count(1, TIMEOUT));
    thread::sleep(WINDOW * 4);

    assert_eq!(
        recorder.events(),
        vec![NotifiedEvent::new(id, root, "gone.txt", Action::Removed)]
    );
}

#[test]
fn test_stale_half_is_reported_before_newer_event() {
    let temp_dir = TempDir::new().unwrap();
    let (watcher, backend) = manual_watcher(WINDOW);
    let recorder = Recorder::new();

    let id = watcher
        .add_watch(temp_dir.path(), false, recorder.callback())
        .unwrap();
    let root = watcher.lookup(id).unwrap().root;

    // a.txt moved out of the watch, then a new a.txt appears
    backend.emit_with(&root, "a.txt", RawKind::RenamedFrom, Some(7), None);
    backend.emit(&root, "a.txt", RawKind::Added);
    assert!(recorder.wait_for_count(2, TIMEOUT));
    thread::sleep(WINDOW * 4);

    assert_eq!(
        recorder.events(),
        vec![
            NotifiedEvent::new(id, root.clone(), "a.txt", Action::Removed),
            NotifiedEvent::new(id, root, "a.txt", Action::Added),
        ]
    );
}

#[test]
fn test_flat_watch_sees_only_direct_children() {
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir(temp_dir.path().join("sub")).unwrap();
    let (watcher, backend) = manual_watcher(WINDOW);
    let recorder = Recorder::new();

    let id = watcher
        .add_watch(temp_dir.path(), false, recorder.callback())
        .unwrap();
    let root = watcher.lookup(id).unwrap().root;

    assert_eq!(backend.emit(&root.join("sub"), "nested.txt", RawKind::Added), 0);
    backend.emit(&root, "top.txt", RawKind::Added);
    assert!(recorder.wait_for_count(1, TIMEOUT));
    thread::sleep(Duration::from_millis(50));

    let names: Vec<_> = recorder.events().into_iter().map(|e| e.filename).collect();
    assert_eq!(names, vec!["top.txt".to_string()]);
}

#[test]
fn test_recursive_watch_converges_after_mkdir() {
    let temp_dir = TempDir::new().unwrap();
    let (watcher, backend) = manual_watcher(WINDOW);
    let recorder = Recorder::new();

    let id = watcher
        .add_watch(temp_dir.path(), true, recorder.callback())
        .unwrap();
    let root = watcher.lookup(id).unwrap().root;

    fs::create_dir_all(root.join("a/b/c")).unwrap();
    backend.emit(&root, "a", RawKind::Added);

    let expected = vec![
        root.clone(),
        root.join("a"),
        root.join("a/b"),
        root.join("a/b/c"),
    ];
    assert!(wait_until(TIMEOUT, || {
        watcher.lookup(id).unwrap().directories == expected
    }));

    backend.emit(&root.join("a/b/c"), "deep.txt", RawKind::Added);
    assert!(recorder.wait_for(TIMEOUT, |events| {
        events
            .iter()
            .any(|e| e.filename == "deep.txt" && e.directory == root.join("a/b/c"))
    }));

    // Entries that existed before their directory was subscribed are announced
    let events = recorder.events();
    assert!(events
        .iter()
        .any(|e| e.filename == "b" && e.directory == root.join("a")));
    assert!(events
        .iter()
        .any(|e| e.filename == "c" && e.directory == root.join("a/b")));
}

#[test]
fn test_directory_rename_moves_subscriptions() {
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir_all(temp_dir.path().join("old/inner")).unwrap();
    let (watcher, backend) = manual_watcher(WINDOW);
    let recorder = Recorder::new();

    let id = watcher
        .add_watch(temp_dir.path(), true, recorder.callback())
        .unwrap();
    let root = watcher.lookup(id).unwrap().root;

    fs::rename(root.join("old"), root.join("new")).unwrap();
    backend.emit_with(&root, "old", RawKind::RenamedFrom, Some(11), Some(true));
    backend.emit_with(&root, "new", RawKind::RenamedTo, Some(11), Some(true));

    let expected = vec![root.clone(), root.join("new"), root.join("new/inner")];
    assert!(wait_until(TIMEOUT, || {
        watcher.lookup(id).unwrap().directories == expected
    }));
    assert!(recorder.wait_for_count(1, TIMEOUT));
    assert_eq!(recorder.events()[0], NotifiedEvent::moved(id, root, "old", "new"));
}

#[test]
fn test_overlapping_watches_are_independent() {
    let temp_dir = TempDir::new().unwrap();
    let (watcher, backend) = manual_watcher(WINDOW);
    let first = Recorder::new();
    let second = Recorder::new();

    let a = watcher
        .add_watch(temp_dir.path(), false, first.callback())
        .unwrap();
    let b = watcher
        .add_watch(temp_dir.path(), true, second.callback())
        .unwrap();
    let root = watcher.lookup(a).unwrap().root;

    assert_eq!(backend.emit(&root, "shared", RawKind::Added), 2);
    assert!(first.wait_for_count(1, TIMEOUT));
    assert!(second.wait_for_count(1, TIMEOUT));
    assert_eq!(first.events()[0].watch_id, a);
    assert_eq!(second.events()[0].watch_id, b);

    watcher.remove_watch(a).unwrap();
    assert_eq!(backend.emit(&root, "after", RawKind::Added), 1);
    assert!(second.wait_for_count(2, TIMEOUT));
    assert_eq!(first.len(), 1);
}

#[test]
fn test_remove_watch_is_a_delivery_barrier() {
    let temp_dir = TempDir::new().unwrap();
    let (watcher, backend) = manual_watcher(WINDOW);
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();

    let id = watcher
        .add_watch(temp_dir.path(), false, move |_| {
            thread::sleep(Duration::from_millis(2));
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let root = watcher.lookup(id).unwrap().root;

    for i in 0..50 {
        backend.emit(&root, format!("f{}", i), RawKind::Added);
    }
    assert!(wait_until(TIMEOUT, || delivered.load(Ordering::SeqCst) > 0));

    watcher.remove_watch(id).unwrap();
    let at_return = delivered.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(delivered.load(Ordering::SeqCst), at_return);
}

#[test]
fn test_remove_from_own_callback() {
    let temp_dir = TempDir::new().unwrap();
    let (watcher, backend) = manual_watcher(WINDOW);
    let watcher = Arc::new(watcher);
    let handle = Arc::downgrade(&watcher);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let id = watcher
        .add_watch(temp_dir.path(), false, move |event: NotifiedEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(watcher) = handle.upgrade() {
                watcher.remove_watch(event.watch_id).unwrap();
            }
        })
        .unwrap();
    let root = watcher.lookup(id).unwrap().root;

    backend.emit(&root, "first", RawKind::Added);
    backend.emit(&root, "second", RawKind::Added);
    assert!(wait_until(TIMEOUT, || watcher.watches().is_empty()));
    thread::sleep(Duration::from_millis(50));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_panicking_callback_keeps_watch_alive() {
    let temp_dir = TempDir::new().unwrap();
    let (watcher, backend) = manual_watcher(WINDOW);
    let recorder = Recorder::new();
    let mut record = recorder.callback();

    let id = watcher
        .add_watch(temp_dir.path(), false, move |event: NotifiedEvent| {
            if event.filename == "boom" {
                panic!("callback failure");
            }
            record(event);
        })
        .unwrap();
    let root = watcher.lookup(id).unwrap().root;

    backend.emit(&root, "boom", RawKind::Added);
    backend.emit(&root, "fine", RawKind::Added);
    assert!(recorder.wait_for_count(1, TIMEOUT));
    assert_eq!(recorder.events()[0].filename, "fine");
    assert_eq!(watcher.watches(), vec![id]);
}

#[test]
fn test_capacity_exhaustion_during_tracking_is_published() {
    let temp_dir = TempDir::new().unwrap();
    let (watcher, backend) = manual_watcher(WINDOW);
    let errors = watcher.errors();

    let id = watcher.add_watch(temp_dir.path(), true, |_| {}).unwrap();
    let root = watcher.lookup(id).unwrap().root;

    backend.set_limit(Some(2));
    fs::create_dir_all(root.join("x/y/z")).unwrap();
    backend.emit(&root, "x", RawKind::Added);

    let (failed, err) = errors.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(failed, id);
    assert!(matches!(err, WatchError::BackendCapacity { .. }));
    assert_eq!(watcher.lookup(id).unwrap().directories.len(), 2);
}

#[test]
fn test_add_watch_surfaces_capacity_synchronously() {
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir_all(temp_dir.path().join("a/b")).unwrap();
    let (watcher, backend) = manual_watcher(WINDOW);
    backend.set_limit(Some(1));

    let err = watcher.add_watch(temp_dir.path(), true, |_| {}).unwrap_err();
    assert!(matches!(err, WatchError::BackendCapacity { .. }));
    assert!(watcher.watches().is_empty());
    assert_eq!(backend.subscription_count(), 0);
}

#[test]
fn test_tree_scoped_backend_splits_nested_paths() {
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir_all(temp_dir.path().join("a/b")).unwrap();

    let mut manual = None;
    let watcher = Watcher::with_backend(dirwatch::WatcherConfig::new(WINDOW), |sink| {
        let backend = dirwatch::ManualBackend::tree_scoped(sink);
        manual = Some(backend.clone());
        Ok(backend)
    })
    .unwrap();
    let backend = manual.unwrap();
    let recorder = Recorder::new();

    let id = watcher
        .add_watch(temp_dir.path(), true, recorder.callback())
        .unwrap();
    let info = watcher.lookup(id).unwrap();
    assert_eq!(info.directories, vec![info.root.clone()]);

    backend.emit(&info.root.join("a/b"), "leaf.txt", RawKind::Modified);
    assert!(recorder.wait_for_count(1, TIMEOUT));
    let event = &recorder.events()[0];
    assert_eq!(event.directory, info.root.join("a/b"));
    assert_eq!(event.filename, "leaf.txt");
    assert_eq!(event.action, Action::Modified);
}

#[tokio::test]
async fn test_channel_watch_streams_and_closes() {
    let temp_dir = TempDir::new().unwrap();
    let (watcher, backend) = manual_watcher(WINDOW);

    let (id, mut rx) = watcher
        .add_watch_channel(temp_dir.path(), false, 16)
        .unwrap();
    let root = watcher.lookup(id).unwrap().root;

    backend.emit(&root, "one", RawKind::Added);
    backend.emit(&root, "one", RawKind::Modified);

    let first = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.action, Action::Added);
    assert_eq!(second.action, Action::Modified);

    watcher.remove_watch(id).unwrap();
    let closed = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap();
    assert!(closed.is_none());
}

#[test]
fn test_full_channel_drops_instead_of_blocking() {
    let temp_dir = TempDir::new().unwrap();
    let (watcher, backend) = manual_watcher(WINDOW);

    let (id, mut rx) = watcher
        .add_watch_channel(temp_dir.path(), false, 2)
        .unwrap();
    let root = watcher.lookup(id).unwrap().root;

    for i in 0..10 {
        backend.emit(&root, format!("f{}", i), RawKind::Added);
    }
    // Removal drains the queue; it must not block on the full channel
    thread::sleep(Duration::from_millis(100));
    watcher.remove_watch(id).unwrap();

    let mut received = Vec::new();
    while let Ok(event) = rx.try_recv() {
        received.push(event.filename);
    }
    assert_eq!(received, vec!["f0".to_string(), "f1".to_string()]);
}
