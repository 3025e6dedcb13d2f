//! Typed boundary around the system metadata index and bundle introspection.
//!
//! The batched query (`mdls`) answers for many bundles in one process launch.
//! Anything it cannot answer is recovered by reading the bundle directly:
//! `Contents/Info.plist` for identity and version, and the Mach-O header of
//! the main executable for the architecture.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use log::{debug, trace};
use object::macho::{CPU_TYPE_ARM64, CPU_TYPE_X86_64, MachHeader32, MachHeader64};
use object::read::macho::{FatArch, MachHeader, MachOFatFile32, MachOFatFile64};
use object::{Endianness, FileKind};
use plist::{Dictionary, Value};
use rayon::prelude::*;

use crate::model::Architecture;

const MDLS_BATCH: usize = 40;
const MDLS_NULL: &str = "(null)";
const MDLS_ATTRIBUTES: [&str; 9] = [
    "kMDItemCFBundleIdentifier",
    "kMDItemDisplayName",
    "kMDItemVersion",
    "kMDItemExecutableArchitectures",
    "kMDItemPhysicalSize",
    "kMDItemLogicalSize",
    "kMDItemContentCreationDate",
    "kMDItemContentModificationDate",
    "kMDItemLastUsedDate",
];

/// Only the start of an executable is read; fat tables and Mach-O headers
/// sit well inside it.
const HEADER_PROBE_LEN: usize = 4096;

/// Metadata known about one bundle. Every field is optional; callers decide
/// what counts as complete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BundleMetadata {
    pub bundle_identifier: Option<String>,
    pub display_name: Option<String>,
    pub version: Option<String>,
    pub architectures: Vec<String>,
    pub physical_size: Option<u64>,
    pub logical_size: Option<u64>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

impl BundleMetadata {
    pub fn is_complete(&self) -> bool {
        self.bundle_identifier.as_deref().is_some_and(|id| !id.is_empty())
            && self.display_name.as_deref().is_some_and(|name| !name.is_empty())
    }

    pub fn architecture(&self) -> Architecture {
        let has_arm = self.architectures.iter().any(|a| a.starts_with("arm64"));
        let has_intel = self.architectures.iter().any(|a| a == "x86_64");
        Architecture::from_slices(has_arm, has_intel)
    }
}

/// Batched metadata lookup. Paths missing from the returned map are treated
/// as unavailable and recovered one by one.
pub trait MetadataSource: Send + Sync {
    fn query_batch(&self, paths: &[PathBuf]) -> HashMap<PathBuf, BundleMetadata>;

    /// Entitlement keys the bundle is signed with. `None` when unknown.
    fn entitlements(&self, _bundle: &Path) -> Option<Vec<String>> {
        None
    }
}

/// Spotlight metadata through `mdls -raw`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MdlsSource;

impl MetadataSource for MdlsSource {
    fn query_batch(&self, paths: &[PathBuf]) -> HashMap<PathBuf, BundleMetadata> {
        paths
            .par_chunks(MDLS_BATCH)
            .map(query_mdls_chunk)
            .reduce(HashMap::new, |mut acc, part| {
                acc.extend(part);
                acc
            })
    }

    fn entitlements(&self, bundle: &Path) -> Option<Vec<String>> {
        read_entitlements(bundle)
    }
}

fn query_mdls_chunk(paths: &[PathBuf]) -> HashMap<PathBuf, BundleMetadata> {
    let mut command = Command::new("mdls");
    command.arg("-raw").arg("-nullMarker").arg(MDLS_NULL);
    for attribute in MDLS_ATTRIBUTES {
        command.arg("-name").arg(attribute);
    }
    command.args(paths);

    let output = match command.output() {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            debug!("mdls exited with {} for {} paths", output.status, paths.len());
            return HashMap::new();
        }
        Err(err) => {
            debug!("mdls unavailable: {err}");
            return HashMap::new();
        }
    };

    let raw = String::from_utf8_lossy(&output.stdout);
    parse_mdls_raw(&raw, paths)
}

/// Split `mdls -raw` output (NUL separated, one value per requested
/// attribute per path, in request order) into per-path records. A value count
/// that does not line up with the request yields an empty map.
pub fn parse_mdls_raw(raw: &str, paths: &[PathBuf]) -> HashMap<PathBuf, BundleMetadata> {
    let values: Vec<&str> = raw.split('\0').collect();
    let expected = paths.len() * MDLS_ATTRIBUTES.len();
    let values = match values.len() {
        n if n == expected => &values[..],
        n if n == expected + 1 && values[expected].trim().is_empty() => &values[..expected],
        n => {
            debug!("mdls returned {n} values, expected {expected}");
            return HashMap::new();
        }
    };

    paths
        .iter()
        .zip(values.chunks(MDLS_ATTRIBUTES.len()))
        .map(|(path, chunk)| {
            let value = |index: usize| {
                let v = chunk[index].trim();
                (!v.is_empty() && v != MDLS_NULL).then_some(v)
            };
            let metadata = BundleMetadata {
                bundle_identifier: value(0).map(unquote),
                display_name: value(1).map(|name| strip_app_suffix(&unquote(name))),
                version: value(2).map(unquote),
                architectures: value(3).map(parse_mdls_array).unwrap_or_default(),
                physical_size: value(4).and_then(|v| v.parse().ok()),
                logical_size: value(5).and_then(|v| v.parse().ok()),
                created: value(6).and_then(parse_mdls_date),
                modified: value(7).and_then(parse_mdls_date),
                last_used: value(8).and_then(parse_mdls_date),
            };
            (path.clone(), metadata)
        })
        .collect()
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches('"').to_string()
}

fn strip_app_suffix(name: &str) -> String {
    name.strip_suffix(".app").unwrap_or(name).to_string()
}

fn parse_mdls_array(value: &str) -> Vec<String> {
    value
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split([',', '\n'])
        .map(unquote)
        .filter(|item| !item.is_empty())
        .collect()
}

fn parse_mdls_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value.trim(), "%Y-%m-%d %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Signing entitlements through `codesign`. An unsigned bundle, or a
/// `codesign` that is missing or too old for `--xml`, gives `None`.
pub fn read_entitlements(bundle: &Path) -> Option<Vec<String>> {
    let output = Command::new("codesign")
        .args(["-d", "--entitlements", "-", "--xml"])
        .arg(bundle)
        .output()
        .map_err(|err| debug!("codesign unavailable: {err}"))
        .ok()?;
    if !output.status.success() {
        trace!("codesign exited with {} for {}", output.status, bundle.display());
        return None;
    }
    parse_entitlements(&output.stdout)
}

/// Keys of an entitlements property list, sorted. A signed bundle without
/// entitlements prints nothing, which reads as an empty list.
pub fn parse_entitlements(raw: &[u8]) -> Option<Vec<String>> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Some(Vec::new());
    }
    let value = Value::from_reader(Cursor::new(raw)).ok()?;
    let mut keys: Vec<String> = value.as_dictionary()?.keys().cloned().collect();
    keys.sort();
    Some(keys)
}

/// Values read from an `Info.plist`, XML or binary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfoPlist {
    pub bundle_identifier: Option<String>,
    pub bundle_name: Option<String>,
    pub display_name: Option<String>,
    pub short_version: Option<String>,
    pub bundle_version: Option<String>,
    pub executable: Option<String>,
    pub icon_file: Option<String>,
    pub template_application: bool,
}

pub fn read_info_plist(path: &Path) -> Option<InfoPlist> {
    let content = fs::read(path).ok()?;
    parse_info_plist(&content)
}

/// `None` unless the top level is a dictionary.
pub fn parse_info_plist(content: &[u8]) -> Option<InfoPlist> {
    let value = Value::from_reader(Cursor::new(content))
        .map_err(|err| trace!("unreadable property list: {err}"))
        .ok()?;
    let dict = value.as_dictionary()?;

    Some(InfoPlist {
        bundle_identifier: plist_string(dict, "CFBundleIdentifier"),
        bundle_name: plist_string(dict, "CFBundleName"),
        display_name: plist_string(dict, "CFBundleDisplayName"),
        short_version: plist_string(dict, "CFBundleShortVersionString"),
        bundle_version: plist_string(dict, "CFBundleVersion"),
        executable: plist_string(dict, "CFBundleExecutable"),
        icon_file: plist_string(dict, "CFBundleIconFile"),
        template_application: dict
            .get("LSTemplateApplication")
            .and_then(Value::as_boolean)
            .unwrap_or(false),
    })
}

fn plist_string(dict: &Dictionary, key: &str) -> Option<String> {
    dict.get(key)
        .and_then(Value::as_string)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Info.plist of a bundle on disk, following `Wrapper/` and flat iOS
/// layouts the same way introspection does.
pub fn bundle_info(path: &Path) -> Option<InfoPlist> {
    let bundle = wrapped_bundle(path).unwrap_or_else(|| path.to_path_buf());
    read_info_plist(&bundle.join("Contents/Info.plist"))
        .or_else(|| read_info_plist(&bundle.join("Info.plist")))
}

fn wrapped_bundle(path: &Path) -> Option<PathBuf> {
    fs::read_dir(path.join("Wrapper"))
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .find(|p| p.extension().is_some_and(|ext| ext == "app"))
}

/// Everything a bundle says about itself, without the metadata index.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleIntrospection {
    pub bundle_path: PathBuf,
    pub info: InfoPlist,
    pub architecture: Architecture,
    pub wrapped: bool,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

/// Read a bundle from disk. iOS apps installed on a Mac keep their real
/// bundle under `Wrapper/`; those are followed and flagged.
pub fn introspect_bundle(path: &Path) -> Option<BundleIntrospection> {
    let wrapper = path.join("Wrapper");
    if wrapper.is_dir() {
        let Some(inner) = wrapped_bundle(path) else {
            debug!("no bundle inside {}", wrapper.display());
            return None;
        };
        let mut found = introspect_plain_bundle(&inner)?;
        found.wrapped = true;
        return Some(found);
    }
    introspect_plain_bundle(path)
}

fn introspect_plain_bundle(path: &Path) -> Option<BundleIntrospection> {
    let contents = path.join("Contents");
    let (info, executable_dir) = match read_info_plist(&contents.join("Info.plist")) {
        Some(info) => (info, contents.join("MacOS")),
        // iOS bundles are flat.
        None => (read_info_plist(&path.join("Info.plist"))?, path.to_path_buf()),
    };
    info.bundle_identifier.as_ref()?;

    let architecture = info
        .executable
        .as_ref()
        .map(|exe| probe_architecture(&executable_dir.join(exe)))
        .unwrap_or_default();

    let metadata = fs::metadata(path).ok();
    let created = metadata
        .as_ref()
        .and_then(|m| m.created().ok())
        .map(DateTime::<Utc>::from);
    let modified = metadata
        .as_ref()
        .and_then(|m| m.modified().ok())
        .map(DateTime::<Utc>::from);

    trace!("introspected {} ({:?})", path.display(), architecture);
    Some(BundleIntrospection {
        bundle_path: path.to_path_buf(),
        info,
        architecture,
        wrapped: false,
        created,
        modified,
    })
}

/// Classify a Mach-O executable by the CPU slices it carries.
pub fn probe_architecture(executable: &Path) -> Architecture {
    let mut header = [0u8; HEADER_PROBE_LEN];
    let read = match File::open(executable).and_then(|mut file| file.read(&mut header)) {
        Ok(read) => read,
        Err(_) => return Architecture::Unknown,
    };
    architecture_from_header(&header[..read])
}

pub fn architecture_from_header(data: &[u8]) -> Architecture {
    let Ok(kind) = FileKind::parse(data) else {
        return Architecture::Unknown;
    };

    match kind {
        FileKind::MachO32 => thin_architecture::<MachHeader32<Endianness>>(data),
        FileKind::MachO64 => thin_architecture::<MachHeader64<Endianness>>(data),
        FileKind::MachOFat32 => MachOFatFile32::parse(data)
            .map(|fat| fat_architecture(fat.arches()))
            .unwrap_or_default(),
        FileKind::MachOFat64 => MachOFatFile64::parse(data)
            .map(|fat| fat_architecture(fat.arches()))
            .unwrap_or_default(),
        _ => Architecture::Unknown,
    }
}

fn thin_architecture<Mach: MachHeader>(data: &[u8]) -> Architecture {
    let Ok(header) = Mach::parse(data, 0) else {
        return Architecture::Unknown;
    };
    let Ok(endian) = header.endian() else {
        return Architecture::Unknown;
    };
    match header.cputype(endian) {
        CPU_TYPE_ARM64 => Architecture::Arm,
        CPU_TYPE_X86_64 => Architecture::Intel,
        _ => Architecture::Unknown,
    }
}

fn fat_architecture<Arch: FatArch>(arches: &[Arch]) -> Architecture {
    let has_arm = arches.iter().any(|arch| arch.cputype() == CPU_TYPE_ARM64);
    let has_intel = arches.iter().any(|arch| arch.cputype() == CPU_TYPE_X86_64);
    Architecture::from_slices(has_arm, has_intel)
}
