use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::categorize::FileCategory;
use crate::fs::{FileKind, FileSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Arm,
    Intel,
    Universal,
    #[default]
    Unknown,
}

impl Architecture {
    pub fn from_slices(has_arm: bool, has_intel: bool) -> Self {
        match (has_arm, has_intel) {
            (true, true) => Architecture::Universal,
            (true, false) => Architecture::Arm,
            (false, true) => Architecture::Intel,
            (false, false) => Architecture::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Architecture::Arm => "arm",
            Architecture::Intel => "intel",
            Architecture::Universal => "universal",
            Architecture::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "arm" => Architecture::Arm,
            "intel" => Architecture::Intel,
            "universal" => Architecture::Universal,
            _ => Architecture::Unknown,
        }
    }
}

/// Bytes that stripping unused architecture slices would reclaim.
///
/// `NotComputed` and `Computed(0)` are different answers: the first means a
/// background estimate is still owed, the second that there is nothing to gain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "bytes", rename_all = "snake_case")]
pub enum StripSavings {
    NotComputed,
    Computed(u64),
}

impl StripSavings {
    pub fn initial_for(arch: Architecture) -> Self {
        if arch == Architecture::Universal {
            StripSavings::NotComputed
        } else {
            StripSavings::Computed(0)
        }
    }

    pub fn to_column(self) -> Option<i64> {
        match self {
            StripSavings::NotComputed => None,
            StripSavings::Computed(bytes) => Some(bytes as i64),
        }
    }

    pub fn from_column(value: Option<i64>) -> Self {
        match value {
            None => StripSavings::NotComputed,
            Some(bytes) => StripSavings::Computed(bytes.max(0) as u64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationRecord {
    pub path: PathBuf,
    pub bundle_identifier: String,
    pub name: String,
    pub version: String,
    pub build_number: Option<String>,
    #[serde(skip)]
    pub icon: Option<Vec<u8>>,
    pub architecture: Architecture,
    pub web_app: bool,
    pub wrapped: bool,
    pub system: bool,
    pub steam: bool,
    pub homebrew_cask: Option<String>,
    pub bundle_size: u64,
    pub bundle_size_logical: Option<u64>,
    pub strip_savings: StripSavings,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub entitlements: Option<Vec<String>>,
    /// Filled on demand when the user inspects the app's files; never cached.
    #[serde(skip)]
    pub file_sizes: BTreeMap<PathBuf, FileSize>,
    #[serde(skip)]
    pub file_icons: BTreeMap<PathBuf, Option<Vec<u8>>>,
}

impl ApplicationRecord {
    pub fn new(path: PathBuf, bundle_identifier: String, name: String) -> Self {
        Self {
            path,
            bundle_identifier,
            name,
            version: String::new(),
            build_number: None,
            icon: None,
            architecture: Architecture::Unknown,
            web_app: false,
            wrapped: false,
            system: false,
            steam: false,
            homebrew_cask: None,
            bundle_size: 0,
            bundle_size_logical: None,
            strip_savings: StripSavings::Computed(0),
            created: None,
            modified: None,
            last_used: None,
            entitlements: None,
            file_sizes: BTreeMap::new(),
            file_icons: BTreeMap::new(),
        }
    }

    pub fn needs_strip_estimate(&self) -> bool {
        self.architecture == Architecture::Universal
            && self.strip_savings == StripSavings::NotComputed
    }

    /// Sum of the real sizes of every inspected file.
    pub fn inspected_size(&self) -> u64 {
        self.file_sizes.values().map(|size| size.real).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanFileEntry {
    pub path: PathBuf,
    pub kind: FileKind,
    pub real_size: u64,
    pub logical_size: u64,
    #[serde(skip)]
    pub icon: Option<Vec<u8>>,
    pub category: FileCategory,
}

pub fn sort_by_name(apps: &mut [ApplicationRecord]) {
    apps.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.path.cmp(&b.path))
    });
}
