//! Metadata-free discovery of `.app` bundles under the application folders.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, trace};
use rayon::prelude::*;

use crate::error::{Result, SweepError};
use crate::exclusions::ExclusionList;

const RESTRICTED_FRAGMENTS: &[&str] = &["/Applications/Safari", "/Applications/Utilities"];

/// Bundles that must never be offered for removal: Safari, the Utilities
/// folder and whatever bundle this executable itself lives in.
#[derive(Debug, Clone)]
pub struct Restrictions {
    fragments: Vec<String>,
    own_bundle: Option<PathBuf>,
}

impl Default for Restrictions {
    fn default() -> Self {
        Self {
            fragments: RESTRICTED_FRAGMENTS.iter().map(|f| f.to_string()).collect(),
            own_bundle: own_bundle(),
        }
    }
}

impl Restrictions {
    pub fn none() -> Self {
        Self {
            fragments: Vec::new(),
            own_bundle: None,
        }
    }

    pub fn is_restricted(&self, bundle: &Path) -> bool {
        if self.own_bundle.as_deref() == Some(bundle) {
            return true;
        }
        let text = bundle.to_string_lossy();
        self.fragments.iter().any(|f| text.contains(f.as_str()))
    }
}

fn own_bundle() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    exe.ancestors()
        .find(|p| p.extension().is_some_and(|ext| ext == "app"))
        .map(Path::to_path_buf)
}

#[derive(Debug, Clone, Default)]
pub struct PathScanner {
    exclusions: ExclusionList,
    restrictions: Restrictions,
}

impl PathScanner {
    pub fn new(exclusions: ExclusionList) -> Self {
        Self {
            exclusions,
            restrictions: Restrictions::default(),
        }
    }

    pub fn with_restrictions(mut self, restrictions: Restrictions) -> Self {
        self.restrictions = restrictions;
        self
    }

    /// Every bundle under `roots`. Each directory level fans out over the
    /// rayon pool and every subtree returns its own set; the sets are merged
    /// on the way back up, so the call only returns once every walk is done.
    ///
    /// Missing roots are skipped. Fails only when roots were given and none of
    /// them could be read.
    pub fn scan(&self, roots: &[PathBuf]) -> Result<BTreeSet<PathBuf>> {
        let readable: Vec<&PathBuf> = roots
            .iter()
            .filter(|root| !self.exclusions.is_excluded(root))
            .filter(|root| fs::read_dir(root).is_ok())
            .collect();

        if readable.is_empty() && !roots.is_empty() {
            return Err(SweepError::NoReadableRoot(roots.to_vec()));
        }

        let found = readable
            .par_iter()
            .map(|root| self.walk(root))
            .reduce(BTreeSet::new, merge);
        debug!("path scan found {} bundles under {} roots", found.len(), readable.len());
        Ok(found)
    }

    fn walk(&self, dir: &Path) -> BTreeSet<PathBuf> {
        let entries: Vec<PathBuf> = match fs::read_dir(dir) {
            Ok(read) => read.flatten().map(|entry| entry.path()).collect(),
            Err(err) => {
                trace!("skipping {}: {err}", dir.display());
                return BTreeSet::new();
            }
        };

        entries
            .par_iter()
            .map(|path| self.visit(path))
            .reduce(BTreeSet::new, merge)
    }

    fn visit(&self, path: &Path) -> BTreeSet<PathBuf> {
        // symlink_metadata never reports a link as a directory.
        let Ok(metadata) = fs::symlink_metadata(path) else {
            return BTreeSet::new();
        };
        if !metadata.is_dir() || self.exclusions.is_excluded(path) {
            return BTreeSet::new();
        }

        if path.extension().is_some_and(|ext| ext == "app") {
            if self.restrictions.is_restricted(path) {
                return BTreeSet::new();
            }
            return BTreeSet::from([path.to_path_buf()]);
        }

        self.walk(path)
    }
}

fn merge(mut left: BTreeSet<PathBuf>, mut right: BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
    if left.len() < right.len() {
        std::mem::swap(&mut left, &mut right);
    }
    left.extend(right);
    left
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(root: &Path, rel: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.join("Contents")).expect("mkdir bundle");
        path
    }

    fn scanner() -> PathScanner {
        PathScanner::default().with_restrictions(Restrictions::none())
    }

    #[test]
    fn finds_nested_bundles_without_descending_into_them() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        let top = bundle(root, "Top.app");
        let nested = bundle(root, "Vendor/Suite/Tool.app");
        bundle(root, "Top.app/Contents/Helpers/Helper.app");
        fs::write(root.join("notes.app"), b"not a dir").expect("write");

        let found = scanner().scan(&[root.to_path_buf()]).expect("scan");
        assert_eq!(found, BTreeSet::from([top, nested]));
    }

    #[test]
    fn excluded_and_restricted_paths_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        bundle(root, "Hidden/Secret.app");
        let kept = bundle(root, "Kept.app");
        bundle(root, "Safari.app");

        let exclusions =
            ExclusionList::new([root.join("Hidden").display().to_string()]).expect("list");
        let restrictions = Restrictions {
            fragments: vec!["/Safari".into()],
            own_bundle: None,
        };
        let scanner = PathScanner::new(exclusions).with_restrictions(restrictions);

        let found = scanner.scan(&[root.to_path_buf()]).expect("scan");
        assert_eq!(found, BTreeSet::from([kept]));
    }

    #[test]
    fn missing_roots_are_ignored_unless_all_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = bundle(dir.path(), "A.app");
        let missing = dir.path().join("nope");

        let found = scanner()
            .scan(&[missing.clone(), dir.path().to_path_buf()])
            .expect("scan");
        assert_eq!(found, BTreeSet::from([app]));

        let err = scanner().scan(&[missing]).expect_err("no readable root");
        assert!(matches!(err, SweepError::NoReadableRoot(_)));
        assert!(scanner().scan(&[]).expect("empty").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_are_not_followed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outside = tempfile::tempdir().expect("outside");
        bundle(outside.path(), "Elsewhere.app");
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).expect("symlink");
        std::os::unix::fs::symlink(
            outside.path().join("Elsewhere.app"),
            dir.path().join("Alias.app"),
        )
        .expect("symlink app");

        let found = scanner().scan(&[dir.path().to_path_buf()]).expect("scan");
        assert!(found.is_empty());
    }
}
