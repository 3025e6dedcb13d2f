use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Manual links between leftover files and the application that owns them.
///
/// Lives for the process lifetime only. Linked files are dropped from orphan
/// results; they are still walked.
#[derive(Debug, Clone, Default)]
pub struct AssociationStore {
    links: HashMap<PathBuf, BTreeSet<PathBuf>>,
}

impl AssociationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the link already existed.
    pub fn add_association(&mut self, app: &Path, file: &Path) -> bool {
        self.links
            .entry(app.to_path_buf())
            .or_default()
            .insert(file.to_path_buf())
    }

    pub fn remove_association(&mut self, app: &Path, file: &Path) -> bool {
        let Some(files) = self.links.get_mut(app) else {
            return false;
        };
        let removed = files.remove(file);
        if files.is_empty() {
            self.links.remove(app);
        }
        removed
    }

    pub fn associated_files(&self, app: &Path) -> BTreeSet<PathBuf> {
        self.links.get(app).cloned().unwrap_or_default()
    }

    /// Applications the file is linked to, sorted.
    pub fn owners_of(&self, file: &Path) -> Vec<PathBuf> {
        let mut owners: Vec<PathBuf> = self
            .links
            .iter()
            .filter(|(_, files)| files.contains(file))
            .map(|(app, _)| app.clone())
            .collect();
        owners.sort();
        owners
    }

    pub fn clear_associations(&mut self, app: &Path) -> usize {
        self.links.remove(app).map_or(0, |files| files.len())
    }

    /// Every linked file across all applications.
    pub fn linked_files(&self) -> BTreeSet<PathBuf> {
        self.links.values().flatten().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_many_to_many() {
        let mut store = AssociationStore::new();
        let a = Path::new("/Applications/A.app");
        let b = Path::new("/Applications/B.app");
        let shared = Path::new("/Library/Caches/shared");

        assert!(store.add_association(a, shared));
        assert!(!store.add_association(a, shared));
        assert!(store.add_association(b, shared));
        assert!(store.add_association(a, Path::new("/Library/Logs/A")));

        assert_eq!(store.associated_files(a).len(), 2);
        assert_eq!(store.owners_of(shared), vec![a.to_path_buf(), b.to_path_buf()]);
        assert_eq!(store.linked_files().len(), 2);
    }

    #[test]
    fn removing_last_link_clears_the_app() {
        let mut store = AssociationStore::new();
        let app = Path::new("/Applications/A.app");
        let file = Path::new("/Library/Caches/a");
        store.add_association(app, file);

        assert!(store.remove_association(app, file));
        assert!(!store.remove_association(app, file));
        assert!(store.owners_of(file).is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn clear_drops_every_file_of_one_app() {
        let mut store = AssociationStore::new();
        let app = Path::new("/Applications/A.app");
        let other = Path::new("/Applications/B.app");
        store.add_association(app, Path::new("/x"));
        store.add_association(app, Path::new("/y"));
        store.add_association(other, Path::new("/z"));

        assert_eq!(store.clear_associations(app), 2);
        assert!(store.associated_files(app).is_empty());
        assert_eq!(store.owners_of(Path::new("/z")), vec![other.to_path_buf()]);
        assert_eq!(store.clear_associations(app), 0);
    }
}
