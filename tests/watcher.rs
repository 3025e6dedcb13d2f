use std::time::{Duration, Instant};

#[cfg(target_os = "macos")]
#[test]
fn watcher_reports_new_bundle() {
    use app_sweep::watcher;
    let temp = tempfile::tempdir().expect("temp dir");
    let root = temp.path().canonicalize().expect("canonicalize");

    let handle = watcher::spawn(vec![root.clone()]).expect("spawn watcher");
    let events = handle.events.clone();

    std::thread::sleep(Duration::from_millis(500));
    let bundle = root.join("Fresh.app");
    std::fs::create_dir_all(bundle.join("Contents")).expect("create bundle");

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut saw_change = false;

    while Instant::now() < deadline {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => match event.kind {
                watcher::WatchEventKind::AppAdded | watcher::WatchEventKind::Rescan => {
                    saw_change = true;
                    break;
                }
                watcher::WatchEventKind::AppRemoved => {}
                watcher::WatchEventKind::Error(message) => {
                    panic!("watcher error: {message}");
                }
            },
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(err) => panic!("watch channel error: {err}"),
        }
    }

    assert!(saw_change, "expected watcher to report the new bundle");

    handle.stop();
}

#[cfg(not(target_os = "macos"))]
#[test]
fn watcher_reports_new_bundle() {
    eprintln!("watcher smoke test skipped: unsupported OS for automated verification");
}
