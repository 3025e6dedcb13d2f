use std::path::{Path, PathBuf};

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::{Result, SweepError};

/// User-maintained paths that scans must skip.
///
/// Plain entries exclude the path itself and everything below it. Entries
/// containing glob metacharacters are matched against the full path with
/// `*` stopping at separators (`**` crosses them).
#[derive(Debug, Clone)]
pub struct ExclusionList {
    entries: Vec<String>,
    plain: Vec<PathBuf>,
    globs: GlobSet,
}

impl Default for ExclusionList {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            plain: Vec::new(),
            globs: GlobSet::empty(),
        }
    }
}

impl ExclusionList {
    pub fn new<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self::default();
        for entry in entries {
            let entry = entry.into();
            if !entry.trim().is_empty() && !list.entries.contains(&entry) {
                list.entries.push(entry);
            }
        }
        list.rebuild()?;
        Ok(list)
    }

    /// Returns false when the entry was already present.
    pub fn add(&mut self, entry: impl Into<String>) -> Result<bool> {
        let entry = entry.into();
        if entry.trim().is_empty() || self.entries.contains(&entry) {
            return Ok(false);
        }
        self.entries.push(entry);
        if let Err(err) = self.rebuild() {
            self.entries.pop();
            return Err(err);
        }
        Ok(true)
    }

    pub fn remove(&mut self, entry: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e != entry);
        if self.entries.len() == before {
            return false;
        }
        // Every remaining entry compiled before, so this cannot fail.
        let _ = self.rebuild();
        true
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.plain.iter().any(|excluded| path.starts_with(excluded)) {
            return true;
        }
        !self.globs.is_empty() && self.globs.is_match(path)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn rebuild(&mut self) -> Result<()> {
        let mut plain = Vec::new();
        let mut builder = GlobSetBuilder::new();
        for entry in &self.entries {
            if is_pattern(entry) {
                builder.add(build_glob(entry)?);
            } else {
                plain.push(PathBuf::from(entry.trim_end_matches('/')));
            }
        }
        self.globs = builder.build().map_err(|err| SweepError::Pattern {
            pattern: self.entries.join(", "),
            message: err.to_string(),
        })?;
        self.plain = plain;
        Ok(())
    }
}

const GLOB_META: [char; 6] = ['*', '?', '[', ']', '{', '}'];

fn is_pattern(entry: &str) -> bool {
    entry.contains(['*', '?', '[', '{'])
}

/// Entry that matches exactly `path`, even when its name contains glob
/// metacharacters. Ordinary paths come back unchanged.
pub fn literal_entry(path: &Path) -> String {
    let raw = path.display().to_string();
    if !is_pattern(&raw) {
        return raw;
    }
    let mut escaped = String::with_capacity(raw.len() + 8);
    for c in raw.chars() {
        if GLOB_META.contains(&c) {
            escaped.push('[');
            escaped.push(c);
            escaped.push(']');
        } else {
            escaped.push(c);
        }
    }
    escaped
}

fn build_glob(pattern: &str) -> Result<Glob> {
    let mut builder = GlobBuilder::new(pattern);
    builder.literal_separator(true);
    builder.build().map_err(|err| SweepError::Pattern {
        pattern: pattern.to_string(),
        message: err.kind().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_entries_cover_descendants() {
        let list = ExclusionList::new(["/Library/Caches/com.vendor.App/"]).expect("list");
        assert!(list.is_excluded(Path::new("/Library/Caches/com.vendor.App")));
        assert!(list.is_excluded(Path::new("/Library/Caches/com.vendor.App/data")));
        assert!(!list.is_excluded(Path::new("/Library/Caches/com.vendor.AppHelper")));
    }

    #[test]
    fn glob_entries_respect_separators() {
        let list = ExclusionList::new(["/Library/Logs/*.log", "/opt/**/keep"]).expect("list");
        assert!(list.is_excluded(Path::new("/Library/Logs/tool.log")));
        assert!(!list.is_excluded(Path::new("/Library/Logs/sub/tool.log")));
        assert!(list.is_excluded(Path::new("/opt/a/b/keep")));
    }

    #[test]
    fn add_and_remove_round_trip() {
        let mut list = ExclusionList::default();
        assert!(list.add("/tmp/x").expect("add"));
        assert!(!list.add("/tmp/x").expect("add again"));
        assert!(list.is_excluded(Path::new("/tmp/x")));
        assert!(list.remove("/tmp/x"));
        assert!(!list.remove("/tmp/x"));
        assert!(!list.is_excluded(Path::new("/tmp/x")));
        assert!(list.is_empty());
    }

    #[test]
    fn literal_entries_escape_metacharacters() {
        let odd = Path::new("/Library/Caches/{1A2B}[x]*");
        assert_eq!(literal_entry(Path::new("/plain/path")), "/plain/path");

        let list = ExclusionList::new([literal_entry(odd)]).expect("list");
        assert!(list.is_excluded(odd));
        assert!(!list.is_excluded(Path::new("/Library/Caches/{1A2B}[x]-other")));
    }

    #[test]
    fn invalid_pattern_is_rejected_and_list_unchanged() {
        let mut list = ExclusionList::new(["/tmp/keep"]).expect("list");
        let err = list.add("/tmp/[oops").expect_err("bad glob");
        assert!(matches!(err, SweepError::Pattern { .. }));
        assert_eq!(list.entries(), ["/tmp/keep".to_string()]);
        assert!(list.is_excluded(Path::new("/tmp/keep")));
    }
}
