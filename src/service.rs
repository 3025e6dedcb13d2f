use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use log::{debug, info};

use crate::associations::AssociationStore;
use crate::builder::RecordBuilder;
use crate::cache::MetadataCache;
use crate::casks::CaskIndex;
use crate::categorize::Categorizer;
use crate::config::Settings;
use crate::error::Result;
use crate::fs::FileInspector;
use crate::inventory::{self, Inventory, InventoryReport};
use crate::matcher::LiveIdentities;
use crate::metadata::MetadataSource;
use crate::model::{ApplicationRecord, StripSavings};
use crate::orphans::{self, OrphanReport, OrphanScanRequest, OrphanScanner, ScanMessage};
use crate::paths::{PathScanner, Restrictions};

/// Owns the cache, the settings and the association links for one session.
/// Build one at startup and pass it to whatever needs it.
pub struct Sweeper {
    settings: Settings,
    settings_path: Option<PathBuf>,
    cache: MetadataCache,
    source: Arc<dyn MetadataSource>,
    inspector: Arc<dyn FileInspector>,
    categorizer: Categorizer,
    casks: CaskIndex,
    restrictions: Restrictions,
    associations: AssociationStore,
    /// Exclusions added by `link_file_to_app` rather than by the user.
    link_exclusions: BTreeSet<PathBuf>,
    apps: Vec<ApplicationRecord>,
}

impl Sweeper {
    pub fn new(
        settings: Settings,
        cache: MetadataCache,
        source: Arc<dyn MetadataSource>,
        inspector: Arc<dyn FileInspector>,
    ) -> Self {
        Self {
            settings,
            settings_path: None,
            cache,
            source,
            inspector,
            categorizer: Categorizer::for_current_user(),
            casks: CaskIndex::default(),
            restrictions: Restrictions::default(),
            associations: AssociationStore::new(),
            link_exclusions: BTreeSet::new(),
            apps: Vec::new(),
        }
    }

    /// Exclusion edits are saved to `path` as they happen.
    pub fn with_settings_path(mut self, path: PathBuf) -> Self {
        self.settings_path = Some(path);
        self
    }

    pub fn with_categorizer(mut self, categorizer: Categorizer) -> Self {
        self.categorizer = categorizer;
        self
    }

    pub fn with_casks(mut self, casks: CaskIndex) -> Self {
        self.casks = casks;
        self
    }

    pub fn with_restrictions(mut self, restrictions: Restrictions) -> Self {
        self.restrictions = restrictions;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    pub fn apps(&self) -> &[ApplicationRecord] {
        &self.apps
    }

    pub fn associations(&self) -> &AssociationStore {
        &self.associations
    }

    /// Reconcile the configured application folders against the cache and
    /// keep the result as the live application list.
    pub fn installed_applications(&mut self) -> Result<InventoryReport> {
        let scanner = PathScanner::new(self.settings.app_exclusion_list()?)
            .with_restrictions(self.restrictions.clone());
        let builder = RecordBuilder::new(self.source.clone(), self.inspector.clone())
            .with_casks(self.casks.clone());
        let cache = self.settings.cache_enabled.then(|| self.cache.clone());

        let report = Inventory::new(scanner, builder, cache).load(&self.settings.app_folder_paths())?;
        self.apps = report.apps.clone();
        Ok(report)
    }

    pub fn clear_cache(&self) -> Result<bool> {
        let cleared = self.cache.clear()?;
        info!("cache cleared: {cleared}");
        Ok(cleared)
    }

    /// Snapshot of everything an orphan scan needs, taken from the current
    /// application list, settings and links.
    pub fn orphan_request(&self) -> Result<OrphanScanRequest> {
        let mut live = LiveIdentities::from_apps(&self.apps);
        for file in self.associations.linked_files() {
            live.add_known_path(&file);
        }
        Ok(OrphanScanRequest {
            directories: self.settings.orphan_directory_paths(),
            live,
            exclusions: self.settings.orphan_exclusion_list()?,
            linked: self.associations.linked_files(),
            reserved: self.settings.reserved(),
        })
    }

    /// Run the orphan scan to completion on this thread.
    pub fn scan_for_orphans(&self) -> Result<OrphanReport> {
        let request = self.orphan_request()?;
        Ok(orphans::scan_blocking(
            &request,
            self.inspector.as_ref(),
            &self.categorizer,
        ))
    }

    /// Streaming scanner sharing this session's inspector and categorizer.
    /// Feed it [`Sweeper::orphan_request`].
    pub fn spawn_orphan_scanner(&self) -> Result<(OrphanScanner, Receiver<ScanMessage>)> {
        orphans::spawn(self.inspector.clone(), self.categorizer.clone())
    }

    /// Returns false when the path was already excluded. An exclusion made
    /// here is the user's and survives unlinking.
    pub fn exclude_path(&mut self, path: &Path) -> Result<bool> {
        self.link_exclusions.remove(path);
        self.add_exclusion(path)
    }

    pub fn unexclude_path(&mut self, path: &Path) -> Result<bool> {
        self.link_exclusions.remove(path);
        let removed = self.settings.remove_orphan_exclusion(path);
        if removed {
            self.save_settings()?;
        }
        Ok(removed)
    }

    fn add_exclusion(&mut self, path: &Path) -> Result<bool> {
        let added = self.settings.add_orphan_exclusion(path);
        if added {
            self.save_settings()?;
        }
        Ok(added)
    }

    /// Bind `file` to `app` and exclude it, so the correction outlives the
    /// in-memory link.
    pub fn link_file_to_app(&mut self, file: &Path, app: &Path) -> Result<bool> {
        let linked = self.associations.add_association(app, file);
        if self.add_exclusion(file)? {
            self.link_exclusions.insert(file.to_path_buf());
        }
        debug!("linked {} to {}", file.display(), app.display());
        Ok(linked)
    }

    /// Drop the link. The exclusion the link created goes with it once no
    /// application owns the file; one the user made stays.
    pub fn unlink_file(&mut self, file: &Path, app: &Path) -> Result<bool> {
        let unlinked = self.associations.remove_association(app, file);
        if unlinked {
            self.release_link_exclusion(file)?;
        }
        Ok(unlinked)
    }

    /// Unlink every file bound to `app`. Returns how many links were dropped.
    pub fn clear_associations(&mut self, app: &Path) -> Result<usize> {
        let files = self.associations.associated_files(app);
        let cleared = self.associations.clear_associations(app);
        for file in files {
            self.release_link_exclusion(&file)?;
        }
        Ok(cleared)
    }

    fn release_link_exclusion(&mut self, file: &Path) -> Result<()> {
        if self.associations.owners_of(file).is_empty() && self.link_exclusions.contains(file) {
            self.unexclude_path(file)?;
        }
        Ok(())
    }

    /// No-op without a settings path.
    pub fn save_settings(&self) -> Result<()> {
        if let Some(path) = &self.settings_path {
            self.settings.save(path)?;
            debug!("saved settings to {}", path.display());
        }
        Ok(())
    }

    pub fn pending_strip_estimates(&self) -> Vec<&ApplicationRecord> {
        inventory::pending_strip_estimates(&self.apps)
    }

    /// Store a strip-savings estimate in memory and in the cache.
    pub fn record_strip_savings(&mut self, app: &Path, bytes: u64) -> Result<bool> {
        let savings = StripSavings::Computed(bytes);
        let Some(record) = self.apps.iter_mut().find(|a| a.path == app) else {
            return Ok(false);
        };
        record.strip_savings = savings;
        if self.settings.cache_enabled {
            self.cache.update_strip_savings(app, savings)?;
        }
        Ok(true)
    }

    /// Fill the per-file size and icon maps for an application's bundle and
    /// linked files. Never cached.
    pub fn inspect_app_files(&mut self, app: &Path) -> Option<&ApplicationRecord> {
        let linked = self.associations.associated_files(app);
        let inspector = self.inspector.clone();
        let record = self.apps.iter_mut().find(|a| a.path == app)?;

        let files = std::iter::once(record.path.clone()).chain(linked);
        for file in files {
            let size = inspector.size(&file).unwrap_or_default();
            record.file_icons.insert(file.clone(), inspector.icon(&file));
            record.file_sizes.insert(file, size);
        }
        Some(record)
    }
}
