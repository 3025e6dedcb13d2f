//! Reverse search for leftover files: walk the per-application support
//! directories and keep whatever no installed application claims.
//!
//! Scans run on a dedicated worker thread and stream their findings over a
//! channel. Each request gets a job id; a newer request or [`OrphanScanner::cancel`]
//! retires the running job, which stops at its next directory or entry
//! boundary.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, info, trace};
use rayon::prelude::*;
use serde::Serialize;

use crate::categorize::{Categorizer, FileCategory};
use crate::error::{Result, SweepError};
use crate::exclusions::ExclusionList;
use crate::fs::{FileInspector, FileKind, FileSize};
use crate::matcher::{self, LiveIdentities, ReservedTokens};
use crate::model::OrphanFileEntry;

/// Everything one orphan scan needs, captured when the scan is requested.
#[derive(Debug, Clone, Default)]
pub struct OrphanScanRequest {
    pub directories: Vec<PathBuf>,
    pub live: LiveIdentities,
    pub exclusions: ExclusionList,
    /// Files linked to an installed application by hand.
    pub linked: BTreeSet<PathBuf>,
    pub reserved: ReservedTokens,
}

/// Why a candidate was or was not reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Orphan,
    Excluded,
    Linked,
    Reserved,
    KnownFile,
    Live,
}

/// Decide a single candidate. Exclusions and links win over whatever the
/// name heuristic would say.
pub fn classify(path: &Path, request: &OrphanScanRequest) -> Verdict {
    if request.exclusions.is_excluded(path) {
        return Verdict::Excluded;
    }
    if request.linked.contains(path) {
        return Verdict::Linked;
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    let token = matcher::candidate_token(&name);
    if token.is_empty() || request.reserved.is_reserved(&token) {
        return Verdict::Reserved;
    }
    if request.live.is_known_file(path) {
        return Verdict::KnownFile;
    }
    if matcher::matches(&token, request.live.tokens()) {
        return Verdict::Live;
    }
    Verdict::Orphan
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct OrphanScanStats {
    pub directories: u64,
    pub candidates: u64,
    pub orphans: u64,
    pub excluded: u64,
    pub linked: u64,
    pub reserved: u64,
    pub live: u64,
    pub fs_errors: u64,
}

impl OrphanScanStats {
    fn record(&mut self, verdict: Verdict) {
        self.candidates += 1;
        match verdict {
            Verdict::Orphan => self.orphans += 1,
            Verdict::Excluded => self.excluded += 1,
            Verdict::Linked => self.linked += 1,
            Verdict::Reserved => self.reserved += 1,
            Verdict::KnownFile | Verdict::Live => self.live += 1,
        }
    }

    fn merge(mut self, other: OrphanScanStats) -> Self {
        self.directories += other.directories;
        self.candidates += other.candidates;
        self.orphans += other.orphans;
        self.excluded += other.excluded;
        self.linked += other.linked;
        self.reserved += other.reserved;
        self.live += other.live;
        self.fs_errors += other.fs_errors;
        self
    }
}

#[derive(Debug)]
pub enum ScanMessage {
    Begin {
        job_id: u64,
    },
    Entry {
        job_id: u64,
        entry: OrphanFileEntry,
    },
    Error {
        job_id: u64,
        path: PathBuf,
        message: String,
    },
    Stats {
        job_id: u64,
        stats: OrphanScanStats,
    },
    Complete {
        job_id: u64,
        cancelled: bool,
    },
}

impl ScanMessage {
    pub fn job_id(&self) -> u64 {
        match self {
            ScanMessage::Begin { job_id }
            | ScanMessage::Entry { job_id, .. }
            | ScanMessage::Error { job_id, .. }
            | ScanMessage::Stats { job_id, .. }
            | ScanMessage::Complete { job_id, .. } => *job_id,
        }
    }
}

/// Serialises emission against cancellation.
///
/// Entries are sent while holding the lock and only if their job is still
/// current; `cancel` takes the same lock to retire the job. Once `cancel`
/// returns, nothing more from the retired job can reach the channel.
#[derive(Debug, Clone, Default)]
pub struct ScanGate {
    current: Arc<AtomicU64>,
    emit: Arc<Mutex<()>>,
}

impl ScanGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_job(&self) -> u64 {
        let _guard = self.emit.lock().unwrap_or_else(PoisonError::into_inner);
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, job_id: u64) -> bool {
        self.current.load(Ordering::SeqCst) == job_id
    }

    /// Run `send` only while `job_id` is current. Returns whether it ran.
    pub fn emit(&self, job_id: u64, send: impl FnOnce()) -> bool {
        let _guard = self.emit.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_current(job_id) {
            return false;
        }
        send();
        true
    }

    /// Retire whatever job is running.
    pub fn cancel(&self) {
        let _guard = self.emit.lock().unwrap_or_else(PoisonError::into_inner);
        self.current.fetch_add(1, Ordering::SeqCst);
    }
}

enum ScanCommand {
    Run {
        job_id: u64,
        request: Box<OrphanScanRequest>,
    },
}

pub struct OrphanScanner {
    cmd_tx: Sender<ScanCommand>,
    gate: ScanGate,
}

impl OrphanScanner {
    /// Queue a scan. Any scan still running is superseded.
    pub fn request_scan(&self, request: OrphanScanRequest) -> u64 {
        let job_id = self.gate.next_job();
        let _ = self.cmd_tx.send(ScanCommand::Run {
            job_id,
            request: Box::new(request),
        });
        job_id
    }

    /// Stop the running scan. Returns once no further entries can be sent.
    pub fn cancel(&self) {
        self.gate.cancel();
    }

    pub fn is_current(&self, job_id: u64) -> bool {
        self.gate.is_current(job_id)
    }
}

pub fn spawn(
    inspector: Arc<dyn FileInspector>,
    categorizer: Categorizer,
) -> Result<(OrphanScanner, Receiver<ScanMessage>)> {
    let (cmd_tx, cmd_rx) = unbounded();
    let (msg_tx, msg_rx) = unbounded();
    let gate = ScanGate::new();
    let worker_gate = gate.clone();

    thread::Builder::new()
        .name("app-sweep-orphans".into())
        .spawn(move || worker_loop(cmd_rx, msg_tx, worker_gate, inspector, categorizer))
        .map_err(|err| SweepError::io("app-sweep-orphans", err))?;

    Ok((OrphanScanner { cmd_tx, gate }, msg_rx))
}

fn worker_loop(
    cmd_rx: Receiver<ScanCommand>,
    msg_tx: Sender<ScanMessage>,
    gate: ScanGate,
    inspector: Arc<dyn FileInspector>,
    categorizer: Categorizer,
) {
    while let Ok(command) = cmd_rx.recv() {
        match command {
            ScanCommand::Run { job_id, request } => {
                if !gate.is_current(job_id) {
                    trace!("skipping superseded orphan job {job_id}");
                    let _ = msg_tx.send(ScanMessage::Complete {
                        job_id,
                        cancelled: true,
                    });
                    continue;
                }
                let _ = msg_tx.send(ScanMessage::Begin { job_id });
                let ctx = ScanContext {
                    job_id,
                    request: &request,
                    inspector: inspector.as_ref(),
                    categorizer: &categorizer,
                    gate: &gate,
                };
                let send_entry = |entry| {
                    let _ = msg_tx.send(ScanMessage::Entry { job_id, entry });
                };
                let send_error = |path, message| {
                    let _ = msg_tx.send(ScanMessage::Error {
                        job_id,
                        path,
                        message,
                    });
                };
                let stats = run_scan(&ctx, &send_entry, &send_error);
                let cancelled = !gate.is_current(job_id);
                let _ = msg_tx.send(ScanMessage::Stats { job_id, stats });
                let _ = msg_tx.send(ScanMessage::Complete { job_id, cancelled });
            }
        }
    }
}

struct ScanContext<'a> {
    job_id: u64,
    request: &'a OrphanScanRequest,
    inspector: &'a dyn FileInspector,
    categorizer: &'a Categorizer,
    gate: &'a ScanGate,
}

impl ScanContext<'_> {
    fn keep_going(&self) -> bool {
        self.gate.is_current(self.job_id)
    }
}

type EntrySink<'a> = dyn Fn(OrphanFileEntry) + Sync + 'a;
type ErrorSink<'a> = dyn Fn(PathBuf, String) + Sync + 'a;

/// Walk every directory concurrently and hand each orphan to `on_entry`
/// through the gate. Each directory root and each of its children is a
/// rayon task; per-task stats are merged on the way out.
fn run_scan(
    ctx: &ScanContext<'_>,
    on_entry: &EntrySink<'_>,
    on_error: &ErrorSink<'_>,
) -> OrphanScanStats {
    let started = Instant::now();
    let roots: BTreeSet<&PathBuf> = ctx.request.directories.iter().collect();

    let stats = roots
        .par_iter()
        .map(|root| scan_directory(ctx, root, on_entry, on_error))
        .reduce(OrphanScanStats::default, OrphanScanStats::merge);

    info!(
        "orphan scan job={} cancelled={} dirs={} candidates={} orphans={} excluded={} linked={} reserved={} live={} fs_errors={} elapsed={:?}",
        ctx.job_id,
        !ctx.keep_going(),
        stats.directories,
        stats.candidates,
        stats.orphans,
        stats.excluded,
        stats.linked,
        stats.reserved,
        stats.live,
        stats.fs_errors,
        started.elapsed(),
    );
    stats
}

fn scan_directory(
    ctx: &ScanContext<'_>,
    dir: &Path,
    on_entry: &EntrySink<'_>,
    on_error: &ErrorSink<'_>,
) -> OrphanScanStats {
    let mut stats = OrphanScanStats::default();
    if !ctx.keep_going() {
        return stats;
    }

    let children: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(read) => read.flatten().map(|entry| entry.path()).collect(),
        Err(err) => {
            // Missing directories are normal; most roots only exist on some systems.
            if err.kind() != std::io::ErrorKind::NotFound {
                stats.fs_errors += 1;
                on_error(dir.to_path_buf(), err.to_string());
            }
            return stats;
        }
    };
    stats.directories += 1;

    children
        .par_iter()
        .map(|path| {
            let mut local = OrphanScanStats::default();
            if !ctx.keep_going() {
                return local;
            }
            let verdict = classify(path, ctx.request);
            if verdict != Verdict::Orphan {
                local.record(verdict);
                return local;
            }
            match describe(ctx, path) {
                Some(entry) => {
                    local.record(verdict);
                    ctx.gate.emit(ctx.job_id, || on_entry(entry));
                }
                None => trace!("skipping {}", path.display()),
            }
            local
        })
        .reduce(OrphanScanStats::default, OrphanScanStats::merge)
        .merge(stats)
}

/// Size, categorize and iconify an orphan. `None` for symlinks, special
/// files, vanished paths and sizing interrupted by cancellation.
fn describe(ctx: &ScanContext<'_>, path: &Path) -> Option<OrphanFileEntry> {
    let metadata = fs::symlink_metadata(path).ok()?;
    let kind = if metadata.is_dir() {
        FileKind::Directory
    } else if metadata.is_file() {
        FileKind::File
    } else {
        return None;
    };

    let size = ctx
        .inspector
        .size_while(path, &|| ctx.keep_going())
        .or_else(|| ctx.keep_going().then(FileSize::default))?;

    Some(OrphanFileEntry {
        path: path.to_path_buf(),
        kind,
        real_size: size.real,
        logical_size: size.logical,
        icon: ctx.inspector.icon(path),
        category: ctx.categorizer.categorize(path),
    })
}

/// Orphans grouped by category, with per-category totals.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrphanReport {
    pub entries: Vec<OrphanFileEntry>,
    pub stats: OrphanScanStats,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryGroup<'a> {
    pub category: FileCategory,
    pub label: &'static str,
    pub real_size: u64,
    pub logical_size: u64,
    pub entries: Vec<&'a OrphanFileEntry>,
}

impl OrphanReport {
    pub fn total_real_size(&self) -> u64 {
        self.entries.iter().map(|e| e.real_size).sum()
    }

    pub fn by_category(&self) -> Vec<CategoryGroup<'_>> {
        let mut groups: BTreeMap<FileCategory, CategoryGroup<'_>> = BTreeMap::new();
        for entry in &self.entries {
            let group = groups.entry(entry.category).or_insert_with(|| CategoryGroup {
                category: entry.category,
                label: entry.category.label(),
                real_size: 0,
                logical_size: 0,
                entries: Vec::new(),
            });
            group.real_size += entry.real_size;
            group.logical_size += entry.logical_size;
            group.entries.push(entry);
        }
        groups.into_values().collect()
    }

    /// Drop an entry the user deleted, excluded or linked.
    pub fn forget(&mut self, path: &Path) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.path != path);
        self.entries.len() != before
    }
}

/// Run a scan on the calling thread and collect everything. Entries are
/// sorted by path.
pub fn scan_blocking(
    request: &OrphanScanRequest,
    inspector: &dyn FileInspector,
    categorizer: &Categorizer,
) -> OrphanReport {
    let gate = ScanGate::new();
    let job_id = gate.next_job();
    let collected = Mutex::new(Vec::new());
    let ctx = ScanContext {
        job_id,
        request,
        inspector,
        categorizer,
        gate: &gate,
    };

    let stats = run_scan(
        &ctx,
        &|entry| {
            collected
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(entry)
        },
        &|path, message| debug!("orphan scan: {}: {message}", path.display()),
    );

    let mut entries = collected.into_inner().unwrap_or_else(PoisonError::into_inner);
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    OrphanReport {
        entries,
        stats,
        cancelled: false,
    }
}

/// Drain one job's messages into a report, giving up after `timeout` of
/// silence.
pub fn collect(rx: &Receiver<ScanMessage>, job_id: u64, timeout: Duration) -> OrphanReport {
    let mut report = OrphanReport::default();
    while let Ok(message) = rx.recv_timeout(timeout) {
        if message.job_id() != job_id {
            continue;
        }
        match message {
            ScanMessage::Entry { entry, .. } => report.entries.push(entry),
            ScanMessage::Stats { stats, .. } => report.stats = stats,
            ScanMessage::Complete { cancelled, .. } => {
                report.cancelled = cancelled;
                break;
            }
            ScanMessage::Begin { .. } | ScanMessage::Error { .. } => {}
        }
    }
    report.entries.sort_by(|a, b| a.path.cmp(&b.path));
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ApplicationRecord;

    struct ZeroInspector;

    impl FileInspector for ZeroInspector {
        fn size(&self, _path: &Path) -> Option<FileSize> {
            Some(FileSize {
                real: 4096,
                logical: 10,
            })
        }

        fn icon(&self, _path: &Path) -> Option<Vec<u8>> {
            None
        }
    }

    fn request_with_app(name: &str, bundle_id: &str) -> OrphanScanRequest {
        let app = ApplicationRecord::new(
            PathBuf::from(format!("/Applications/{name}.app")),
            bundle_id.to_string(),
            name.to_string(),
        );
        OrphanScanRequest {
            live: LiveIdentities::from_apps([&app]),
            reserved: ReservedTokens::defaults(),
            ..Default::default()
        }
    }

    #[test]
    fn classify_orders_exclusion_link_and_name_checks() {
        let mut request = request_with_app("Transmit", "com.panic.Transmit");
        let leftover = Path::new("/Library/Caches/com.vendor.Gone");
        let live = Path::new("/Library/Caches/com.panic.Transmit");

        assert_eq!(classify(leftover, &request), Verdict::Orphan);
        assert_eq!(classify(live, &request), Verdict::Live);
        assert_eq!(
            classify(Path::new("/Library/Caches/com.apple.Safari"), &request),
            Verdict::Reserved
        );

        request.linked.insert(leftover.to_path_buf());
        assert_eq!(classify(leftover, &request), Verdict::Linked);

        request.exclusions.add(leftover.display().to_string()).expect("exclude");
        assert_eq!(classify(leftover, &request), Verdict::Excluded);
    }

    #[test]
    fn leftover_of_a_removed_app_is_orphaned_beside_its_vendor_sibling() {
        let request = request_with_app("Other", "com.vendor.Other");

        for name in ["com.vendor.App", "com.vendor.App.plist", "com.vendor.App.savedState"] {
            let path = PathBuf::from("/Library/Caches").join(name);
            assert_eq!(classify(&path, &request), Verdict::Orphan, "{name}");
        }
        assert_eq!(
            classify(Path::new("/Library/Preferences/com.vendor.Other.plist"), &request),
            Verdict::Live
        );
    }

    #[test]
    fn blocking_scan_reports_only_orphans() {
        let dir = tempfile::tempdir().expect("tempdir");
        let caches = dir.path().join("Library/Caches");
        fs::create_dir_all(caches.join("com.vendor.Gone")).expect("mkdir");
        fs::create_dir_all(caches.join("com.panic.Transmit")).expect("mkdir");
        fs::write(caches.join("com.vendor.Gone.plist"), b"x").expect("write");

        let mut request = request_with_app("Transmit", "com.panic.Transmit");
        request.directories = vec![caches.clone(), dir.path().join("missing")];

        let report = scan_blocking(&request, &ZeroInspector, &Categorizer::new(None));
        let paths: Vec<&Path> = report.entries.iter().map(|e| e.path.as_path()).collect();
        assert_eq!(
            paths,
            vec![
                caches.join("com.vendor.Gone").as_path(),
                caches.join("com.vendor.Gone.plist").as_path()
            ]
        );
        assert!(report.entries.iter().all(|e| e.category == FileCategory::Caches));
        assert_eq!(report.entries[0].kind, FileKind::Directory);
        assert_eq!(report.stats.orphans, 2);
        assert_eq!(report.stats.live, 1);
        assert_eq!(report.stats.fs_errors, 0);

        let groups = report.by_category();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].real_size, 8192);
        assert_eq!(groups[0].entries.len(), 2);
    }

    #[test]
    fn gate_refuses_emission_after_cancel() {
        let gate = ScanGate::new();
        let job = gate.next_job();
        let mut sent = 0;
        assert!(gate.emit(job, || sent += 1));
        gate.cancel();
        assert!(!gate.emit(job, || sent += 1));
        assert_eq!(sent, 1);
        assert!(!gate.is_current(job));
    }

    #[test]
    fn newer_request_supersedes_older_job() {
        let gate = ScanGate::new();
        let first = gate.next_job();
        let second = gate.next_job();
        assert!(!gate.is_current(first));
        assert!(gate.is_current(second));
    }

    #[test]
    fn report_forgets_handled_entries() {
        let mut report = OrphanReport {
            entries: vec![OrphanFileEntry {
                path: PathBuf::from("/Library/Logs/Gone"),
                kind: FileKind::Directory,
                real_size: 1,
                logical_size: 1,
                icon: None,
                category: FileCategory::Logs,
            }],
            ..Default::default()
        };
        assert!(report.forget(Path::new("/Library/Logs/Gone")));
        assert!(!report.forget(Path::new("/Library/Logs/Gone")));
        assert!(report.entries.is_empty());
    }
}
