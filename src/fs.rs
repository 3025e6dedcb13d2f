use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

/// Allocated ("real") and apparent ("logical") byte counts of a file or tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileSize {
    pub real: u64,
    pub logical: u64,
}

impl FileSize {
    pub fn add(&mut self, other: FileSize) {
        self.real += other.real;
        self.logical += other.logical;
    }
}

/// Size and icon lookups for arbitrary paths. Every answer is optional and a
/// missing answer never aborts the caller.
pub trait FileInspector: Send + Sync {
    fn size(&self, path: &Path) -> Option<FileSize>;

    fn icon(&self, path: &Path) -> Option<Vec<u8>>;

    /// Like [`FileInspector::size`] but gives up as soon as `keep_going`
    /// returns false.
    fn size_while(&self, path: &Path, keep_going: &dyn Fn() -> bool) -> Option<FileSize> {
        if keep_going() { self.size(path) } else { None }
    }
}

/// Inspector backed by the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskInspector;

impl FileInspector for DiskInspector {
    fn size(&self, path: &Path) -> Option<FileSize> {
        self.size_while(path, &|| true)
    }

    fn size_while(&self, path: &Path, keep_going: &dyn Fn() -> bool) -> Option<FileSize> {
        let root = fs::symlink_metadata(path).ok()?;
        if !root.is_dir() {
            return Some(entry_size(&root));
        }

        let mut total = FileSize::default();
        for entry in WalkDir::new(path).follow_links(false) {
            if !keep_going() {
                return None;
            }
            let Ok(entry) = entry else {
                continue;
            };
            if let Ok(metadata) = entry.metadata() {
                total.add(entry_size(&metadata));
            }
        }
        Some(total)
    }

    fn icon(&self, path: &Path) -> Option<Vec<u8>> {
        let icon_path = bundle_icon_path(path)?;
        fs::read(icon_path).ok()
    }
}

#[cfg(unix)]
fn entry_size(metadata: &fs::Metadata) -> FileSize {
    use std::os::unix::fs::MetadataExt;

    FileSize {
        real: metadata.blocks() * 512,
        logical: metadata.len(),
    }
}

#[cfg(not(unix))]
fn entry_size(metadata: &fs::Metadata) -> FileSize {
    FileSize {
        real: metadata.len(),
        logical: metadata.len(),
    }
}

/// Icon file declared by a bundle's Info.plist, if the path is a bundle.
fn bundle_icon_path(bundle: &Path) -> Option<PathBuf> {
    let contents = bundle.join("Contents");
    let info = metadata::read_info_plist(&contents.join("Info.plist"))?;
    let icon = info.icon_file?;
    let mut path = contents.join("Resources").join(&icon);
    if path.extension().is_none() {
        path.set_extension("icns");
    }
    path.exists().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_of_tree_sums_logical_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).expect("mkdir");
        fs::write(dir.path().join("a/one.bin"), vec![0u8; 100]).expect("write");
        fs::write(nested.join("two.bin"), vec![0u8; 50]).expect("write");

        let size = DiskInspector.size(dir.path()).expect("size");
        assert!(size.logical >= 150);
    }

    #[test]
    fn size_while_stops_when_told() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("file"), b"abc").expect("write");
        assert!(DiskInspector.size_while(dir.path(), &|| false).is_none());
    }

    #[test]
    fn missing_path_has_no_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(DiskInspector.size(&dir.path().join("nope")).is_none());
    }

    #[test]
    fn icon_is_read_from_bundle_resources() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bundle = dir.path().join("Thing.app");
        let resources = bundle.join("Contents/Resources");
        fs::create_dir_all(&resources).expect("mkdir");
        fs::write(
            bundle.join("Contents/Info.plist"),
            "<plist><dict><key>CFBundleIconFile</key><string>AppIcon</string></dict></plist>",
        )
        .expect("plist");
        fs::write(resources.join("AppIcon.icns"), b"icns-bytes").expect("icon");

        assert_eq!(DiskInspector.icon(&bundle), Some(b"icns-bytes".to_vec()));
        assert_eq!(DiskInspector.icon(&dir.path().join("plain.txt")), None);
    }
}
