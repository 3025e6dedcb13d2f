use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SweepError};
use crate::exclusions::{self, ExclusionList};
use crate::matcher::{DEFAULT_RESERVED_TOKENS, ReservedTokens};

const DEFAULT_APP_FOLDERS: &[&str] = &["/Applications", "~/Applications"];

const DEFAULT_ORPHAN_DIRECTORIES: &[&str] = &[
    "~/Library/Application Scripts",
    "~/Library/Application Support",
    "~/Library/Application Support/Caches",
    "~/Library/Containers",
    "~/Library/Group Containers",
    "~/Library/Caches",
    "~/Library/HTTPStorages",
    "~/Library/Internet Plug-Ins",
    "~/Library/LaunchAgents",
    "~/Library/Logs",
    "~/Library/Preferences",
    "~/Library/Preferences/ByHost",
    "~/Library/Saved Application State",
    "~/Library/WebKit",
    "/Users/Shared/Library/Application Support",
    "/Library/Application Support",
    "/Library/Caches",
    "/Library/Internet Plug-Ins",
    "/Library/LaunchAgents",
    "/Library/LaunchDaemons",
    "/Library/Logs",
    "/Library/Preferences",
    "/Library/PrivilegedHelperTools",
];

/// User settings, stored as JSON. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app_folders: Vec<String>,
    /// Coarse list applied while discovering applications.
    pub app_exclusions: Vec<String>,
    /// Fine-grained list applied to leftover files.
    pub orphan_exclusions: Vec<String>,
    pub orphan_directories: Vec<String>,
    pub reserved_tokens: Vec<String>,
    pub cache_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_folders: to_strings(DEFAULT_APP_FOLDERS),
            app_exclusions: Vec::new(),
            orphan_exclusions: Vec::new(),
            orphan_directories: to_strings(DEFAULT_ORPHAN_DIRECTORIES),
            reserved_tokens: to_strings(DEFAULT_RESERVED_TOKENS),
            cache_enabled: true,
        }
    }
}

impl Settings {
    pub fn default_path() -> PathBuf {
        let mut base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        base.push("app-sweep");
        base.push("settings.json");
        base
    }

    /// Defaults when the file is missing; defaults and a warning when it
    /// cannot be read or parsed.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::try_load(path) {
            Ok(settings) => settings,
            Err(err) => {
                warn!("using default settings: {err}");
                Self::default()
            }
        }
    }

    pub fn try_load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| SweepError::io(path, err))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write to a temporary file beside `path`, then rename it into place.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|err| SweepError::io(dir, err))?;

        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|err| SweepError::io(dir, err))?;
        serde_json::to_writer_pretty(&mut temp, self)?;
        temp.write_all(b"\n")
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|err| SweepError::io(temp.path(), err))?;
        temp.persist(path)
            .map_err(|err| SweepError::io(path, err.error))?;
        Ok(())
    }

    pub fn app_folder_paths(&self) -> Vec<PathBuf> {
        self.app_folders.iter().map(|raw| expand_path(raw)).collect()
    }

    pub fn orphan_directory_paths(&self) -> Vec<PathBuf> {
        self.orphan_directories
            .iter()
            .map(|raw| expand_path(raw))
            .collect()
    }

    pub fn app_exclusion_list(&self) -> Result<ExclusionList> {
        ExclusionList::new(self.app_exclusions.iter().map(|raw| expand(raw)))
    }

    /// Entries here are mostly literal paths saved by `exclude`, and a `$` in
    /// a file name is common, so only `~` is expanded.
    pub fn orphan_exclusion_list(&self) -> Result<ExclusionList> {
        ExclusionList::new(self.orphan_exclusions.iter().map(|raw| expand_tilde(raw)))
    }

    pub fn reserved(&self) -> ReservedTokens {
        ReservedTokens::new(&self.reserved_tokens)
    }

    /// Returns false when the path was already excluded.
    pub fn add_orphan_exclusion(&mut self, path: &Path) -> bool {
        let entry = exclusions::literal_entry(path);
        if self.orphan_exclusions.iter().any(|e| expand_tilde(e) == entry) {
            return false;
        }
        self.orphan_exclusions.push(entry);
        true
    }

    pub fn remove_orphan_exclusion(&mut self, path: &Path) -> bool {
        let entry = exclusions::literal_entry(path);
        let before = self.orphan_exclusions.len();
        self.orphan_exclusions.retain(|e| expand_tilde(e) != entry);
        self.orphan_exclusions.len() != before
    }
}

/// Expand `~` and environment variables. Entries that fail to expand (an
/// unset variable) are kept verbatim.
pub fn expand(raw: &str) -> String {
    match shellexpand::full(raw) {
        Ok(expanded) => expanded.into_owned(),
        Err(_) => shellexpand::tilde(raw).into_owned(),
    }
}

fn expand_tilde(raw: &str) -> String {
    shellexpand::tilde(raw).into_owned()
}

pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(expand(raw))
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"cache_enabled": false, "app_folders": ["/Apps"]}"#).expect("write");

        let settings = Settings::load(&path);
        assert!(!settings.cache_enabled);
        assert_eq!(settings.app_folders, vec!["/Apps".to_string()]);
        assert_eq!(settings.orphan_directories, Settings::default().orphan_directories);
    }

    #[test]
    fn invalid_or_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        assert_eq!(Settings::load(&path), Settings::default());

        fs::write(&path, "{ not json").expect("write");
        assert!(Settings::try_load(&path).is_err());
        assert_eq!(Settings::load(&path), Settings::default());
    }

    #[test]
    fn save_then_load_preserves_edits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/settings.json");
        let mut settings = Settings::default();
        assert!(settings.add_orphan_exclusion(Path::new("/Library/Caches/com.vendor.App")));
        assert!(!settings.add_orphan_exclusion(Path::new("/Library/Caches/com.vendor.App")));
        settings.save(&path).expect("save");

        let loaded = Settings::try_load(&path).expect("load");
        assert_eq!(loaded, settings);
        let exclusions = loaded.orphan_exclusion_list().expect("list");
        assert!(exclusions.is_excluded(Path::new("/Library/Caches/com.vendor.App")));
    }

    #[test]
    fn dollar_in_an_excluded_path_is_kept_literally() {
        let odd = Path::new("/Library/Caches/$HOME-backup");
        let mut settings = Settings::default();
        assert!(settings.add_orphan_exclusion(odd));
        assert!(!settings.add_orphan_exclusion(odd));
        assert_eq!(settings.orphan_exclusions, vec![odd.display().to_string()]);

        let list = settings.orphan_exclusion_list().expect("list");
        assert!(list.is_excluded(odd));

        assert!(settings.remove_orphan_exclusion(odd));
        assert!(settings.orphan_exclusions.is_empty());
    }

    #[test]
    fn tilde_entries_expand_to_home() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        assert_eq!(expand_path("~/Library/Logs"), home.join("Library/Logs"));
        assert_eq!(expand("$APP_SWEEP_SURELY_UNSET_VAR/x"), "$APP_SWEEP_SURELY_UNSET_VAR/x");
    }
}
