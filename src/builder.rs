//! Turns newly discovered bundle paths into application records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, trace};
use rayon::prelude::*;

use crate::casks::CaskIndex;
use crate::fs::FileInspector;
use crate::metadata::{self, BundleMetadata, MetadataSource};
use crate::model::{ApplicationRecord, StripSavings};

pub struct RecordBuilder {
    source: Arc<dyn MetadataSource>,
    inspector: Arc<dyn FileInspector>,
    casks: CaskIndex,
    home: Option<PathBuf>,
}

impl RecordBuilder {
    pub fn new(source: Arc<dyn MetadataSource>, inspector: Arc<dyn FileInspector>) -> Self {
        Self {
            source,
            inspector,
            casks: CaskIndex::default(),
            home: dirs::home_dir(),
        }
    }

    pub fn with_casks(mut self, casks: CaskIndex) -> Self {
        self.casks = casks;
        self
    }

    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    /// One batched metadata query for all of `paths`, then per-bundle
    /// introspection for whatever the batch could not answer. Paths that
    /// neither can describe are left out of the result.
    pub fn build(&self, paths: &[PathBuf]) -> Vec<ApplicationRecord> {
        if paths.is_empty() {
            return Vec::new();
        }

        let batch = self.source.query_batch(paths);
        let records: Vec<ApplicationRecord> = paths
            .par_iter()
            .filter_map(|path| self.build_one(path, &batch))
            .collect();

        debug!(
            "built {} of {} records ({} from batch metadata)",
            records.len(),
            paths.len(),
            batch.values().filter(|m| m.is_complete()).count()
        );
        records
    }

    fn build_one(
        &self,
        path: &Path,
        batch: &HashMap<PathBuf, BundleMetadata>,
    ) -> Option<ApplicationRecord> {
        let mut record = match batch.get(path).filter(|m| m.is_complete()) {
            Some(found) => from_metadata(path, found),
            None => match from_bundle(path) {
                Some(record) => record,
                None => {
                    trace!("dropping {}: no usable metadata", path.display());
                    return None;
                }
            },
        };

        self.enrich(&mut record);
        Some(record)
    }

    fn enrich(&self, record: &mut ApplicationRecord) {
        let path = record.path.clone();

        if record.bundle_size == 0 {
            if let Some(size) = self.inspector.size(&path) {
                record.bundle_size = size.real;
                record.bundle_size_logical = Some(size.logical);
            }
        }
        record.icon = self.inspector.icon(&path);
        record.system = match &self.home {
            Some(home) => !path.starts_with(home),
            None => true,
        };
        record.steam = path
            .components()
            .any(|c| c.as_os_str().to_string_lossy().eq_ignore_ascii_case("steamapps"));
        record.homebrew_cask = self.casks.cask_for(&path).map(str::to_string);
        record.strip_savings = StripSavings::initial_for(record.architecture);
        record.entitlements = self.source.entitlements(&path);
    }
}

fn from_metadata(path: &Path, found: &BundleMetadata) -> ApplicationRecord {
    let mut record = ApplicationRecord::new(
        path.to_path_buf(),
        found.bundle_identifier.clone().unwrap_or_default(),
        found
            .display_name
            .as_deref()
            .map(|name| name.trim_end_matches(".app").to_string())
            .unwrap_or_default(),
    );
    record.version = found.version.clone().unwrap_or_default();
    record.architecture = found.architecture();
    record.wrapped = path.join("Wrapper").is_dir();
    record.bundle_size = found.physical_size.unwrap_or(0);
    record.bundle_size_logical = found.logical_size;
    record.created = found.created;
    record.modified = found.modified;
    record.last_used = found.last_used;

    // The index has no template flag or build number; the bundle does.
    if let Some(info) = metadata::bundle_info(path) {
        record.web_app = info.template_application;
        record.build_number = info.bundle_version;
    }
    record
}

fn from_bundle(path: &Path) -> Option<ApplicationRecord> {
    let found = metadata::introspect_bundle(path)?;
    let info = found.info;
    let mut record = ApplicationRecord::new(
        path.to_path_buf(),
        info.bundle_identifier.unwrap_or_default(),
        display_name_for(&found.bundle_path),
    );
    record.version = info
        .short_version
        .or_else(|| info.bundle_version.clone())
        .unwrap_or_default();
    record.build_number = info.bundle_version;
    record.web_app = info.template_application;
    record.wrapped = found.wrapped;
    record.architecture = found.architecture;
    record.created = found.created;
    record.modified = found.modified;
    Some(record)
}

/// Bundle file name without `.app`, first letter uppercased.
fn display_name_for(bundle: &Path) -> String {
    let stem = bundle
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut chars = stem.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => stem,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;

    use crate::fs::FileSize;
    use crate::model::Architecture;

    #[derive(Default)]
    struct FixedSource {
        answers: HashMap<PathBuf, BundleMetadata>,
        entitlements: Option<Vec<String>>,
        calls: Mutex<Vec<Vec<PathBuf>>>,
    }

    impl MetadataSource for FixedSource {
        fn query_batch(&self, paths: &[PathBuf]) -> HashMap<PathBuf, BundleMetadata> {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(paths.to_vec());
            paths
                .iter()
                .filter_map(|p| self.answers.get(p).map(|m| (p.clone(), m.clone())))
                .collect()
        }

        fn entitlements(&self, _bundle: &Path) -> Option<Vec<String>> {
            self.entitlements.clone()
        }
    }

    struct FixedInspector;

    impl FileInspector for FixedInspector {
        fn size(&self, _path: &Path) -> Option<FileSize> {
            Some(FileSize {
                real: 8192,
                logical: 8000,
            })
        }

        fn icon(&self, _path: &Path) -> Option<Vec<u8>> {
            None
        }
    }

    fn write_bundle(path: &Path, identifier: &str) {
        let contents = path.join("Contents");
        fs::create_dir_all(&contents).expect("mkdir");
        fs::write(
            contents.join("Info.plist"),
            format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <plist version=\"1.0\"><dict>\
                 <key>CFBundleIdentifier</key><string>{identifier}</string>\
                 <key>CFBundleShortVersionString</key><string>3.1</string>\
                 <key>CFBundleVersion</key><string>310</string>\
                 <key>LSTemplateApplication</key><true/>\
                 </dict></plist>"
            ),
        )
        .expect("plist");
    }

    fn builder(source: Arc<FixedSource>, home: &Path) -> RecordBuilder {
        RecordBuilder::new(source, Arc::new(FixedInspector)).with_home(Some(home.to_path_buf()))
    }

    #[test]
    fn batch_metadata_is_used_when_complete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("Fast.app");
        let mut source = FixedSource::default();
        source.answers.insert(
            path.clone(),
            BundleMetadata {
                bundle_identifier: Some("com.example.fast".into()),
                display_name: Some("Fast.app".into()),
                version: Some("9.0".into()),
                architectures: vec!["arm64".into(), "x86_64".into()],
                physical_size: Some(1000),
                ..Default::default()
            },
        );
        let source = Arc::new(source);

        let records = builder(source.clone(), dir.path()).build(&[path.clone()]);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.name, "Fast");
        assert_eq!(record.version, "9.0");
        assert_eq!(record.bundle_size, 1000);
        assert_eq!(record.architecture, Architecture::Universal);
        assert_eq!(record.strip_savings, StripSavings::NotComputed);
        assert!(!record.system, "bundle under home is a user app");
        assert_eq!(source.calls.lock().expect("calls").len(), 1);
    }

    #[test]
    fn complete_batch_still_reads_template_flag_and_build_number() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("Docs.app");
        write_bundle(&path, "com.example.docs");
        let mut source = FixedSource {
            entitlements: Some(vec!["com.apple.security.app-sandbox".into()]),
            ..Default::default()
        };
        source.answers.insert(
            path.clone(),
            BundleMetadata {
                bundle_identifier: Some("com.example.docs".into()),
                display_name: Some("Docs".into()),
                version: Some("3.1".into()),
                ..Default::default()
            },
        );

        let records = builder(Arc::new(source), dir.path()).build(&[path]);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.web_app);
        assert_eq!(record.build_number.as_deref(), Some("310"));
        assert_eq!(
            record.entitlements.as_deref(),
            Some(&["com.apple.security.app-sandbox".to_string()][..])
        );
    }

    #[test]
    fn incomplete_batch_falls_back_to_info_plist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("steamapps/common/slow game.app");
        write_bundle(&path, "com.example.slow");
        let mut source = FixedSource::default();
        source.answers.insert(
            path.clone(),
            BundleMetadata {
                display_name: Some("Slow".into()),
                ..Default::default()
            },
        );

        let records = builder(Arc::new(source), Path::new("/nonexistent-home")).build(&[path]);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.bundle_identifier, "com.example.slow");
        assert_eq!(record.name, "Slow game");
        assert_eq!(record.version, "3.1");
        assert_eq!(record.build_number.as_deref(), Some("310"));
        assert!(record.web_app);
        assert!(record.steam);
        assert!(record.system);
        assert_eq!(record.bundle_size, 8192);
        assert_eq!(record.bundle_size_logical, Some(8000));
        assert_eq!(record.strip_savings, StripSavings::Computed(0));
    }

    #[test]
    fn paths_without_any_metadata_are_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let empty = dir.path().join("Empty.app");
        fs::create_dir_all(&empty).expect("mkdir");
        let good = dir.path().join("Good.app");
        write_bundle(&good, "com.example.good");

        let records = builder(Arc::new(FixedSource::default()), dir.path())
            .build(&[empty, good.clone()]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, good);
    }

    #[test]
    fn empty_input_skips_the_query() {
        let source = Arc::new(FixedSource::default());
        assert!(builder(source.clone(), Path::new("/")).build(&[]).is_empty());
        assert!(source.calls.lock().expect("calls").is_empty());
    }
}
