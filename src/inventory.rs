//! Cache-accelerated list of installed applications.
//!
//! Each load walks the application folders (cheap), diffs the result against
//! the cached paths, drops what disappeared and builds records only for what
//! is new. Metadata cost therefore tracks what changed since the previous
//! load, not how many applications are installed.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Instant;

use log::{debug, info, warn};

use crate::builder::RecordBuilder;
use crate::cache::{self, MetadataCache};
use crate::error::{Result, SweepError};
use crate::model::{self, ApplicationRecord};
use crate::paths::PathScanner;

#[derive(Debug, Default)]
pub struct InventoryReport {
    /// Sorted by name.
    pub apps: Vec<ApplicationRecord>,
    pub added: BTreeSet<PathBuf>,
    pub removed: BTreeSet<PathBuf>,
    /// Number of paths handed to the record builder.
    pub fetched: usize,
    pub full_rescan: bool,
    /// Set when the records are valid but could not be written to the cache.
    pub persist_error: Option<SweepError>,
}

pub struct Inventory {
    scanner: PathScanner,
    builder: RecordBuilder,
    cache: Option<MetadataCache>,
}

impl Inventory {
    /// With `cache` set to `None` every load is a full scan that never
    /// touches the store.
    pub fn new(scanner: PathScanner, builder: RecordBuilder, cache: Option<MetadataCache>) -> Self {
        Self {
            scanner,
            builder,
            cache,
        }
    }

    /// Fails only when none of `roots` can be read.
    pub fn load(&self, roots: &[PathBuf]) -> Result<InventoryReport> {
        let started = Instant::now();
        let current = self.scanner.scan(roots)?;
        debug!("path scan finished in {:?}", started.elapsed());

        let mut report = match &self.cache {
            None => self.direct(&current),
            Some(cache) => match self.incremental(cache, &current) {
                Ok(report) => report,
                Err(err) => {
                    warn!("cache reconciliation failed, rebuilding: {err}");
                    self.full_rescan(cache, &current)
                }
            },
        };

        model::sort_by_name(&mut report.apps);
        info!(
            "loaded {} apps (added={} removed={} fetched={} full_rescan={}) in {:?}",
            report.apps.len(),
            report.added.len(),
            report.removed.len(),
            report.fetched,
            report.full_rescan,
            started.elapsed()
        );
        Ok(report)
    }

    fn direct(&self, current: &BTreeSet<PathBuf>) -> InventoryReport {
        let paths: Vec<PathBuf> = current.iter().cloned().collect();
        InventoryReport {
            apps: self.builder.build(&paths),
            added: current.clone(),
            fetched: paths.len(),
            full_rescan: true,
            ..Default::default()
        }
    }

    fn incremental(
        &self,
        cache: &MetadataCache,
        current: &BTreeSet<PathBuf>,
    ) -> Result<InventoryReport> {
        let cached = cache.cached_paths()?;
        let changes = cache::diff(current, &cached);

        let removed: Vec<PathBuf> = changes.removed.iter().cloned().collect();
        cache.remove(&removed)?;

        let new: Vec<PathBuf> = changes.new.iter().cloned().collect();
        let built = self.builder.build(&new);
        cache.add(&built)?;

        let snapshot = cache.try_load_snapshot()?;
        Ok(InventoryReport {
            apps: snapshot.records,
            added: changes.new,
            removed: changes.removed,
            fetched: new.len(),
            full_rescan: false,
            persist_error: None,
        })
    }

    /// Treat every current path as new and replace the store wholesale.
    fn full_rescan(&self, cache: &MetadataCache, current: &BTreeSet<PathBuf>) -> InventoryReport {
        let mut report = self.direct(current);
        if let Err(err) = cache.replace_all(&report.apps) {
            warn!("could not write cache {}: {err}", cache.path().display());
            report.persist_error = Some(err);
        }
        report
    }
}

/// Universal applications still owed a strip-savings estimate.
pub fn pending_strip_estimates(apps: &[ApplicationRecord]) -> Vec<&ApplicationRecord> {
    apps.iter().filter(|app| app.needs_strip_estimate()).collect()
}
