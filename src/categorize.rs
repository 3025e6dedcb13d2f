use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Application,
    Preferences,
    Caches,
    ApplicationSupport,
    Containers,
    Logs,
    LaunchAgents,
    SavedState,
    InternetPlugins,
    ApplicationScripts,
    SystemFiles,
    UserFiles,
    Other,
}

impl FileCategory {
    pub const ALL: [FileCategory; 13] = [
        FileCategory::Application,
        FileCategory::Preferences,
        FileCategory::Caches,
        FileCategory::ApplicationSupport,
        FileCategory::Containers,
        FileCategory::Logs,
        FileCategory::LaunchAgents,
        FileCategory::SavedState,
        FileCategory::InternetPlugins,
        FileCategory::ApplicationScripts,
        FileCategory::SystemFiles,
        FileCategory::UserFiles,
        FileCategory::Other,
    ];

    pub fn label(self) -> &'static str {
        match self {
            FileCategory::Application => "Application Bundles",
            FileCategory::Preferences => "Preferences",
            FileCategory::Caches => "Caches",
            FileCategory::ApplicationSupport => "Application Support",
            FileCategory::Containers => "Containers",
            FileCategory::Logs => "Logs",
            FileCategory::LaunchAgents => "Launch Agents & Daemons",
            FileCategory::SavedState => "Saved Application State",
            FileCategory::InternetPlugins => "Internet Plug-Ins",
            FileCategory::ApplicationScripts => "Application Scripts",
            FileCategory::SystemFiles => "System Files",
            FileCategory::UserFiles => "User Files",
            FileCategory::Other => "Other",
        }
    }
}

type Rule = (FileCategory, &'static [&'static str]);

// First match wins.
const RULES: &[Rule] = &[
    (FileCategory::Preferences, &["/Library/Preferences"]),
    (FileCategory::Caches, &["/Library/Caches"]),
    (FileCategory::ApplicationSupport, &["/Library/Application Support"]),
    (
        FileCategory::Containers,
        &["/Library/Containers", "/Library/Group Containers"],
    ),
    (FileCategory::Logs, &["/Library/Logs"]),
    (FileCategory::LaunchAgents, &["/LaunchAgents", "/LaunchDaemons"]),
    (FileCategory::SavedState, &["/Saved Application State"]),
    (FileCategory::InternetPlugins, &["/Internet Plug-Ins"]),
    (FileCategory::ApplicationScripts, &["/Application Scripts"]),
    (
        FileCategory::SystemFiles,
        &[
            "/Library/Extensions",
            "/Library/PrivilegedHelperTools",
            "/private/var/db/receipts",
            "/HTTPStorages",
            "/Library/WebKit",
        ],
    ),
];

/// Path-rule classifier. The home directory is captured once at
/// construction so classification itself never touches the environment.
#[derive(Debug, Clone, Default)]
pub struct Categorizer {
    home: Option<PathBuf>,
}

impl Categorizer {
    pub fn new(home: Option<PathBuf>) -> Self {
        Self { home }
    }

    pub fn for_current_user() -> Self {
        Self::new(dirs::home_dir())
    }

    pub fn categorize(&self, path: &Path) -> FileCategory {
        categorize(path, self.home.as_deref())
    }
}

pub fn categorize(path: &Path, home: Option<&Path>) -> FileCategory {
    if path.extension().is_some_and(|ext| ext == "app") {
        return FileCategory::Application;
    }

    let text = path.to_string_lossy();
    for (category, needles) in RULES {
        if needles.iter().any(|needle| text.contains(needle)) {
            return *category;
        }
    }

    if let Some(home) = home {
        if path.starts_with(home) && !path.starts_with(home.join("Applications")) {
            return FileCategory::UserFiles;
        }
    }

    FileCategory::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home() -> PathBuf {
        PathBuf::from("/Users/dana")
    }

    fn check(path: &str) -> FileCategory {
        categorize(Path::new(path), Some(&home()))
    }

    #[test]
    fn library_folders_map_to_their_category() {
        assert_eq!(
            check("/Users/dana/Library/Preferences/com.vendor.App.plist"),
            FileCategory::Preferences
        );
        assert_eq!(check("/Library/Caches/com.vendor.App"), FileCategory::Caches);
        assert_eq!(
            check("/Users/dana/Library/Group Containers/ABC.com.vendor"),
            FileCategory::Containers
        );
        assert_eq!(
            check("/Library/LaunchDaemons/com.vendor.helper.plist"),
            FileCategory::LaunchAgents
        );
        assert_eq!(
            check("/Users/dana/Library/HTTPStorages/com.vendor.App"),
            FileCategory::SystemFiles
        );
    }

    #[test]
    fn bundle_extension_beats_location() {
        assert_eq!(
            check("/Users/dana/Library/Application Support/Helper.app"),
            FileCategory::Application
        );
    }

    #[test]
    fn earlier_rules_take_precedence() {
        // Only /Library/Caches counts as Caches.
        assert_eq!(
            check("/Users/dana/Library/Application Support/Caches/thing"),
            FileCategory::ApplicationSupport
        );
        assert_eq!(
            check("/Users/dana/Library/Preferences/ByHost/com.x.plist"),
            FileCategory::Preferences
        );
    }

    #[test]
    fn home_fallback_excludes_user_applications() {
        assert_eq!(check("/Users/dana/.config/tool"), FileCategory::UserFiles);
        assert_eq!(check("/Users/dana/Applications/Notes"), FileCategory::Other);
        assert_eq!(check("/opt/thing"), FileCategory::Other);
        assert_eq!(categorize(Path::new("/Users/dana/x"), None), FileCategory::Other);
    }

    #[test]
    fn classification_is_stable_across_calls() {
        let categorizer = Categorizer::new(Some(home()));
        let path = Path::new("/Users/dana/Library/Logs/Tool");
        let first = categorizer.categorize(path);
        for _ in 0..5 {
            categorizer.categorize(Path::new("/Library/Caches/other"));
            assert_eq!(categorizer.categorize(path), first);
        }
        assert_eq!(first, FileCategory::Logs);
    }

    #[test]
    fn labels_follow_display_order() {
        assert_eq!(FileCategory::ALL[0].label(), "Application Bundles");
        assert!(FileCategory::Application < FileCategory::Other);
    }
}
