use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, trace};
use serde_json::Value;

const CASKROOMS: &[&str] = &["/opt/homebrew/Caskroom", "/usr/local/Caskroom"];

/// Maps lowercased application names (bundle file stem) to the Homebrew cask
/// that installed them.
#[derive(Debug, Clone, Default)]
pub struct CaskIndex {
    by_app: HashMap<String, String>,
}

impl CaskIndex {
    /// Index the first Caskroom that exists; empty when Homebrew is absent.
    pub fn discover() -> Self {
        CASKROOMS
            .iter()
            .map(Path::new)
            .find(|p| p.is_dir())
            .map(Self::from_caskroom)
            .unwrap_or_default()
    }

    pub fn from_caskroom(caskroom: &Path) -> Self {
        let mut by_app = HashMap::new();
        let Ok(entries) = fs::read_dir(caskroom) else {
            debug!("caskroom {} unreadable", caskroom.display());
            return Self { by_app };
        };

        for entry in entries.flatten() {
            let cask = entry.file_name().to_string_lossy().into_owned();
            if cask.starts_with('.') {
                continue;
            }
            let cask_dir = entry.path();
            let apps = receipt_apps(&cask_dir).unwrap_or_else(|| versioned_apps(&cask_dir));
            for app in apps {
                by_app.insert(app, cask.clone());
            }
        }
        trace!("indexed {} cask applications", by_app.len());
        Self { by_app }
    }

    pub fn cask_for(&self, bundle: &Path) -> Option<&str> {
        let stem = bundle.file_stem()?.to_string_lossy().to_lowercase();
        self.by_app.get(&stem).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_app.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_app.is_empty()
    }
}

/// App names from `.metadata/INSTALL_RECEIPT.json`, if it can be read.
fn receipt_apps(cask_dir: &Path) -> Option<Vec<String>> {
    let raw = fs::read_to_string(cask_dir.join(".metadata/INSTALL_RECEIPT.json")).ok()?;
    let receipt: Value = serde_json::from_str(&raw).ok()?;
    let artifacts = receipt.get("uninstall_artifacts")?.as_array()?;

    let apps = artifacts
        .iter()
        .filter_map(|artifact| artifact.get("app")?.as_array())
        .flatten()
        .filter_map(Value::as_str)
        .map(app_key)
        .collect();
    Some(apps)
}

/// Older casks without a receipt: bundles inside the first version folder.
fn versioned_apps(cask_dir: &Path) -> Vec<String> {
    let Some(version_dir) = visible_children(cask_dir).into_iter().find(|p| p.is_dir()) else {
        return Vec::new();
    };
    visible_children(&version_dir)
        .into_iter()
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .filter(|name| name.ends_with(".app") && !name.to_lowercase().contains("uninstall"))
        .map(|name| app_key(&name))
        .collect()
}

fn visible_children(dir: &Path) -> Vec<PathBuf> {
    let mut children: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
                .map(|e| e.path())
                .collect()
        })
        .unwrap_or_default();
    children.sort();
    children
}

fn app_key(name: &str) -> String {
    name.trim_end_matches(".app").to_lowercase()
}
