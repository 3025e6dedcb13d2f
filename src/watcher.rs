//! Sentinel over the application folders. Reports bundles appearing and
//! disappearing so the inventory can be reloaded without a restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, trace};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::{Result, SweepError};

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub notify_poll_interval: Duration,
    pub fallback_initial: Duration,
    pub fallback_max: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            notify_poll_interval: Duration::from_secs(2),
            fallback_initial: Duration::from_secs(5),
            fallback_max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEventKind {
    AppAdded,
    AppRemoved,
    /// Something changed that cannot be pinned on one bundle.
    Rescan,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
    pub timestamp: Instant,
}

impl WatchEvent {
    fn new(path: PathBuf, kind: WatchEventKind) -> Self {
        Self {
            path,
            kind,
            timestamp: Instant::now(),
        }
    }

    pub fn rescan(path: PathBuf) -> Self {
        Self::new(path, WatchEventKind::Rescan)
    }

    pub fn error(path: PathBuf, message: String) -> Self {
        Self::new(path, WatchEventKind::Error(message))
    }
}

pub struct WatchHandle {
    pub events: Receiver<WatchEvent>,
    shutdown: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl WatchHandle {
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

pub fn spawn(roots: Vec<PathBuf>) -> Result<WatchHandle> {
    spawn_with_config(roots, WatcherConfig::default())
}

pub fn spawn_with_config(roots: Vec<PathBuf>, config: WatcherConfig) -> Result<WatchHandle> {
    let (event_tx, event_rx) = unbounded();
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    let join = thread::Builder::new()
        .name("app-sweep-watcher".into())
        .spawn(move || {
            if let Err(err) = run_notify_loop(&roots, &shutdown_clone, &event_tx, &config) {
                debug!("app watcher falling back to polling: {err}");
                let anchor = roots.first().cloned().unwrap_or_default();
                let _ = event_tx.send(WatchEvent::error(anchor, err));
                run_polling_loop(&roots, &shutdown_clone, &event_tx, &config);
            }
        })
        .map_err(|err| SweepError::io("app-sweep-watcher", err))?;

    Ok(WatchHandle {
        events: event_rx,
        shutdown,
        join: Some(join),
    })
}

fn run_notify_loop(
    roots: &[PathBuf],
    shutdown: &AtomicBool,
    event_tx: &Sender<WatchEvent>,
    config: &WatcherConfig,
) -> std::result::Result<(), String> {
    let tx = event_tx.clone();
    let watched = roots.to_vec();
    let mut watcher = RecommendedWatcher::new(
        move |event: std::result::Result<Event, notify::Error>| match event {
            Ok(event) => {
                for path in &event.paths {
                    if let Some(ev) = map_event(&event.kind, path, &watched) {
                        trace!("app watcher event kind={:?} path={}", event.kind, path.display());
                        let _ = tx.send(ev);
                    }
                }
            }
            Err(err) => {
                let anchor = watched.first().cloned().unwrap_or_default();
                let _ = tx.send(WatchEvent::error(anchor, err.to_string()));
            }
        },
        Config::default()
            .with_poll_interval(config.notify_poll_interval)
            .with_compare_contents(false),
    )
    .map_err(|err| format!("failed to initialise watcher: {err}"))?;

    let mut watching = 0;
    for root in roots {
        match watcher.watch(root, RecursiveMode::Recursive) {
            Ok(()) => watching += 1,
            Err(err) => debug!("not watching {}: {err}", root.display()),
        }
    }
    if watching == 0 {
        return Err("no application folder could be watched".to_string());
    }

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(250));
    }

    Ok(())
}

fn run_polling_loop(
    roots: &[PathBuf],
    shutdown: &AtomicBool,
    event_tx: &Sender<WatchEvent>,
    config: &WatcherConfig,
) {
    let mut interval = config.fallback_initial;
    let max_interval = config.fallback_max;

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(interval);
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        trace!("app watcher polling tick interval={:?}", interval);
        for root in roots {
            let _ = event_tx.send(WatchEvent::rescan(root.clone()));
        }
        interval = (interval * 2).min(max_interval);
    }
}

/// Outermost `.app` directory on `path`, if any.
fn owning_bundle(path: &Path) -> Option<PathBuf> {
    let mut bundle = PathBuf::new();
    for component in path.components() {
        bundle.push(component);
        if bundle.extension().is_some_and(|ext| ext == "app") {
            return Some(bundle);
        }
    }
    None
}

fn map_event(kind: &EventKind, path: &Path, roots: &[PathBuf]) -> Option<WatchEvent> {
    let root = roots
        .iter()
        .find(|root| path.starts_with(root))
        .cloned()
        .unwrap_or_default();
    let bundle = owning_bundle(path);
    // Changes inside a bundle (updates, Info.plist rewrites) do not change the
    // set of installed bundles.
    let is_bundle_itself = bundle.as_deref() == Some(path);

    match kind {
        EventKind::Access(_) => None,
        EventKind::Create(_) if is_bundle_itself => {
            Some(WatchEvent::new(path.to_path_buf(), WatchEventKind::AppAdded))
        }
        EventKind::Remove(_) if is_bundle_itself => {
            Some(WatchEvent::new(path.to_path_buf(), WatchEventKind::AppRemoved))
        }
        EventKind::Modify(notify::event::ModifyKind::Name(_)) if is_bundle_itself => {
            let kind = if path.exists() {
                WatchEventKind::AppAdded
            } else {
                WatchEventKind::AppRemoved
            };
            Some(WatchEvent::new(path.to_path_buf(), kind))
        }
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(_) => {
            if bundle.is_some() {
                None
            } else {
                Some(WatchEvent::rescan(root))
            }
        }
        EventKind::Other | EventKind::Any => Some(WatchEvent::rescan(root)),
    }
}
