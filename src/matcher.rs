//! Name heuristics that decide whether a leftover-looking file still belongs
//! to an installed application.
//!
//! There is no manifest of what an uninstalled app left behind, so this is
//! guesswork: names are normalized and compared by containment. Everything
//! that decides "is this live?" goes through [`matches`] so the heuristic can
//! change without touching the scan itself.

use std::collections::HashSet;
use std::path::Path;

use crate::model::ApplicationRecord;

/// Live tokens shorter than this only match exactly.
const MIN_CONTAINMENT_LEN: usize = 4;

/// File extensions peeled off a leftover's name before matching.
const FILE_EXTENSIONS: &[&str] = &[
    ".plist",
    ".savedstate",
    ".binarycookies",
    ".log",
    ".db",
    ".sqlite",
    ".lockfile",
    ".shipit",
];

/// Bundle-like suffixes. Reverse-DNS names end in these too
/// (`com.vendor.agent`), so they only come off a plain name.
const BUNDLE_SUFFIXES: &[&str] = &[".app", ".helper", ".daemon", ".agent"];

/// Vendor and system names that appear in many unrelated support folders.
pub const DEFAULT_RESERVED_TOKENS: &[&str] = &[
    "apple", "temporary", "btserver", "proapps", "scripteditor", "ilife", "livefsd", "siritoday",
    "addressbook", "animoji", "appstore", "askpermission", "callhistory", "clouddocs",
    "diskimages", "dock", "facetime", "fileprovider", "instruments", "knowledge", "mobilesync",
    "syncservices", "homeenergyd", "icloud", "icdd", "networkserviceproxy", "familycircle",
    "geoservices", "installation", "passkit", "sharedimagecache", "desktop", "mbuseragent",
    "swiftpm", "baseband", "coresimulator", "photoslegacyupgrade", "photosupgrade", "siritts",
    "ipod", "globalpreferences", "apmanalytics", "apmexperiment", "avatarcache", "byhost",
    "contextstoreagent", "mobilemeaccounts", "intentbuilderc", "loginwindow", "momc", "replayd",
    "sharedfilelistd", "clang", "audiocomponent", "csexattrcryptoservice",
    "livetranscriptionagent", "sandboxhelper", "statuskitagent", "betaenrollmentd",
    "contentlinkingd", "diagnosticextensionsd", "gamed", "heard", "homed", "itunescloudd", "lldb",
    "mds", "mediaanalysisd", "metrickitd", "mobiletimerd", "proactived", "ptpcamerad", "studentd",
    "talagent", "watchlistd", "apptranslocation", "xcrun", "dsstore", "caches", "crashreporter",
    "trash", "appsweep", "amsdatamigratortool", "arfilecache", "assistant", "chromium",
    "cloudkit", "webkit", "databases", "diagnostic", "cache", "gamekit", "homebrew", "logi",
    "microsoft", "mozilla", "sync", "google", "sentinel", "hexnode", "sentry", "tvappservices",
];

/// Lowercase and keep only letters and digits.
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Token for a file found in a support directory. One file extension is
/// peeled off before normalizing, so `com.vendor.App.plist` and
/// `com.vendor.App` agree. A bundle suffix is peeled only when no dotted
/// prefix remains: `Thing.app` becomes `thing`, `com.vendor.App` keeps `app`.
pub fn candidate_token(file_name: &str) -> String {
    let lowered = file_name.to_lowercase();
    let name = strip_one(&lowered, FILE_EXTENSIONS);
    let name = match strip_one(name, BUNDLE_SUFFIXES) {
        stem if !stem.contains('.') => stem,
        _ => name,
    };
    normalize(name)
}

fn strip_one<'a>(name: &'a str, suffixes: &[&str]) -> &'a str {
    suffixes
        .iter()
        .find_map(|suffix| name.strip_suffix(*suffix).filter(|stem| !stem.is_empty()))
        .unwrap_or(name)
}

/// Matchable strings derived from the installed applications.
#[derive(Debug, Clone, Default)]
pub struct LiveIdentities {
    tokens: HashSet<String>,
    known_paths: HashSet<String>,
    known_names: HashSet<String>,
}

impl LiveIdentities {
    pub fn from_apps<'a>(apps: impl IntoIterator<Item = &'a ApplicationRecord>) -> Self {
        let mut identities = Self::default();
        for app in apps {
            identities.add_token(&app.name);
            identities.add_token(&app.bundle_identifier);
            if let Some(stem) = app.path.file_stem().and_then(|s| s.to_str()) {
                identities.add_token(stem);
            }
            for file in app.file_sizes.keys() {
                identities.add_known_path(file);
            }
        }
        identities
    }

    pub fn add_token(&mut self, raw: &str) {
        let token = normalize(raw);
        if !token.is_empty() {
            self.tokens.insert(token);
        }
    }

    /// Register a file already attributed to an installed app.
    pub fn add_known_path(&mut self, path: &Path) {
        self.known_paths.insert(normalize(&path.to_string_lossy()));
        if let Some(name) = path.file_name() {
            self.known_names.insert(normalize(&name.to_string_lossy()));
        }
    }

    pub fn tokens(&self) -> &HashSet<String> {
        &self.tokens
    }

    pub fn is_known_file(&self, path: &Path) -> bool {
        if self.known_paths.contains(&normalize(&path.to_string_lossy())) {
            return true;
        }
        path.file_name()
            .is_some_and(|name| self.known_names.contains(&normalize(&name.to_string_lossy())))
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty() && self.known_paths.is_empty()
    }
}

/// Whether `candidate` plausibly belongs to one of the live tokens.
///
/// Equal tokens match. Otherwise, if the shorter of the two is at least
/// [`MIN_CONTAINMENT_LEN`] long, containment in either direction matches:
/// `comvendorapp` contains `vendorapp`, and `zoom` is inside `uszoomvideo`.
pub fn matches(candidate: &str, live: &HashSet<String>) -> bool {
    if candidate.is_empty() {
        return false;
    }
    if live.contains(candidate) {
        return true;
    }
    live.iter().any(|token| {
        let shorter = token.len().min(candidate.len());
        shorter >= MIN_CONTAINMENT_LEN && (candidate.contains(token.as_str()) || token.contains(candidate))
    })
}

#[derive(Debug, Clone, Default)]
pub struct ReservedTokens {
    tokens: Vec<String>,
}

impl ReservedTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(|t| normalize(t.as_ref()))
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    pub fn defaults() -> Self {
        Self::new(DEFAULT_RESERVED_TOKENS.iter().copied())
    }

    pub fn is_reserved(&self, candidate: &str) -> bool {
        self.tokens.iter().any(|t| candidate.contains(t.as_str()))
    }
}
