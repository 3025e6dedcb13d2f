use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use dirs::cache_dir;
use log::{debug, warn};
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::error::{Result, SweepError};
use crate::model::{ApplicationRecord, Architecture, StripSavings};

pub const CACHE_USER_VERSION: i32 = 1;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS apps (
        path TEXT PRIMARY KEY NOT NULL,
        bundle_identifier TEXT NOT NULL,
        name TEXT NOT NULL,
        version TEXT NOT NULL,
        build_number TEXT,
        architecture TEXT NOT NULL,
        web_app INTEGER NOT NULL DEFAULT 0,
        wrapped INTEGER NOT NULL DEFAULT 0,
        system INTEGER NOT NULL DEFAULT 0,
        steam INTEGER NOT NULL DEFAULT 0,
        homebrew_cask TEXT,
        bundle_size INTEGER NOT NULL,
        bundle_size_logical INTEGER,
        strip_savings INTEGER,
        created_utc TEXT,
        modified_utc TEXT,
        last_used_utc TEXT,
        entitlements_json TEXT,
        icon BLOB,
        cached_utc INTEGER NOT NULL
    );
"#;

const SELECT_COLUMNS: &str = "path, bundle_identifier, name, version, build_number, architecture, \
     web_app, wrapped, system, steam, homebrew_cask, bundle_size, bundle_size_logical, \
     strip_savings, created_utc, modified_utc, last_used_utc, entitlements_json, icon";

/// Every cached record plus the schema version they were read with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSnapshot {
    pub version: i32,
    pub records: Vec<ApplicationRecord>,
}

impl CacheSnapshot {
    pub fn paths(&self) -> BTreeSet<PathBuf> {
        self.records.iter().map(|r| r.path.clone()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheDiff {
    pub new: BTreeSet<PathBuf>,
    pub removed: BTreeSet<PathBuf>,
}

impl CacheDiff {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.removed.is_empty()
    }
}

/// `new = current - cached`, `removed = cached - current`.
pub fn diff(current: &BTreeSet<PathBuf>, cached: &BTreeSet<PathBuf>) -> CacheDiff {
    CacheDiff {
        new: current.difference(cached).cloned().collect(),
        removed: cached.difference(current).cloned().collect(),
    }
}

/// Application records keyed by bundle path, in one SQLite file.
///
/// The store runs with a rollback journal so the database stays a single
/// file, and every mutation is one transaction. Full rebuilds are written to a
/// temporary file in the same directory and renamed over the old one.
/// Connections are opened per call; nothing holds the file between calls.
#[derive(Clone, Debug)]
pub struct MetadataCache {
    db_path: PathBuf,
}

impl MetadataCache {
    pub fn open() -> Result<Self> {
        Self::open_in_path(default_path())
    }

    /// Points the cache at `db_path`, creating the parent directory. The file
    /// itself is only touched by the first read or write.
    pub fn open_in_path(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| SweepError::io(parent, err))?;
            }
        }
        Ok(Self { db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Decode failures of any kind come back as an empty snapshot.
    pub fn load_snapshot(&self) -> CacheSnapshot {
        match self.try_load_snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("ignoring unreadable cache {}: {err}", self.db_path.display());
                CacheSnapshot::default()
            }
        }
    }

    pub fn try_load_snapshot(&self) -> Result<CacheSnapshot> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM apps ORDER BY path"))?;
        let rows = stmt.query_map([], map_record)?;

        let mut records = Vec::new();
        for record in rows {
            records.push(record?);
        }
        Ok(CacheSnapshot {
            version: CACHE_USER_VERSION,
            records,
        })
    }

    pub fn record(&self, path: &Path) -> Result<Option<ApplicationRecord>> {
        let conn = self.connection()?;
        let record = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM apps WHERE path = ?1"),
                params![path_key(path)],
                map_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Path-only projection, enough to diff without decoding records.
    pub fn cached_paths(&self) -> Result<BTreeSet<PathBuf>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT path FROM apps")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut paths = BTreeSet::new();
        for path in rows {
            paths.insert(PathBuf::from(path?));
        }
        Ok(paths)
    }

    /// Insert or replace records in one transaction.
    pub fn add(&self, records: &[ApplicationRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        upsert_records(&tx, records)?;
        tx.commit()?;
        debug!("cached {} records", records.len());
        Ok(())
    }

    pub fn remove(&self, paths: &[PathBuf]) -> Result<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM apps WHERE path = ?1")?;
            for path in paths {
                removed += stmt.execute(params![path_key(path)])?;
            }
        }
        tx.commit()?;
        debug!("removed {removed} cached records");
        Ok(removed)
    }

    /// Rebuild the store from scratch with exactly `records`.
    ///
    /// Works on a fresh temporary database next to the real one and renames
    /// it into place, so a corrupt or foreign file is simply replaced.
    pub fn replace_all(&self, records: &[ApplicationRecord]) -> Result<()> {
        let dir = self
            .db_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp = tempfile::Builder::new()
            .prefix(".apps-")
            .suffix(".sqlite")
            .tempfile_in(dir)
            .map_err(|err| SweepError::io(dir, err))?;

        {
            let mut conn = Connection::open(temp.path())?;
            configure_connection(&conn)?;
            initialize_schema(&conn)?;
            let tx = conn.transaction()?;
            upsert_records(&tx, records)?;
            tx.commit()?;
        }

        remove_if_exists(&journal_path(&self.db_path))?;
        temp.persist(&self.db_path)
            .map_err(|err| SweepError::io(&self.db_path, err.error))?;
        debug!("rebuilt cache with {} records", records.len());
        Ok(())
    }

    /// Returns false when no record exists for `path`.
    pub fn update_strip_savings(&self, path: &Path, savings: StripSavings) -> Result<bool> {
        let conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE apps SET strip_savings = ?1 WHERE path = ?2",
            params![savings.to_column(), path_key(path)],
        )?;
        Ok(updated > 0)
    }

    pub fn update_bundle_size(&self, path: &Path, real: u64, logical: Option<u64>) -> Result<bool> {
        let conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE apps SET bundle_size = ?1, bundle_size_logical = ?2 WHERE path = ?3",
            params![real as i64, logical.map(|v| v as i64), path_key(path)],
        )?;
        Ok(updated > 0)
    }

    /// Delete the store. Connections never outlive a call, so no handle is
    /// open while the file goes away.
    pub fn clear(&self) -> Result<bool> {
        let existed = remove_if_exists(&self.db_path)?;
        remove_if_exists(&journal_path(&self.db_path))?;
        Ok(existed)
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        configure_connection(&conn)?;
        initialize_schema(&conn)?;
        Ok(conn)
    }
}

pub fn default_path() -> PathBuf {
    let mut base = cache_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push("app-sweep");
    base.push("apps.sqlite");
    base
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA journal_mode=DELETE; PRAGMA synchronous=FULL;")
}

/// Creates the schema on an empty file. A file written by another schema
/// version is refused rather than migrated.
fn initialize_schema(conn: &Connection) -> Result<()> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    match version {
        0 => {
            conn.execute_batch(SCHEMA)?;
            conn.pragma_update(None, "user_version", CACHE_USER_VERSION)?;
            Ok(())
        }
        CACHE_USER_VERSION => Ok(()),
        found => Err(SweepError::SchemaMismatch {
            found,
            expected: CACHE_USER_VERSION,
        }),
    }
}

fn upsert_records(tx: &Transaction<'_>, records: &[ApplicationRecord]) -> Result<()> {
    let now = Utc::now().timestamp();
    let mut stmt = tx.prepare(
        "INSERT INTO apps (
            path, bundle_identifier, name, version, build_number, architecture,
            web_app, wrapped, system, steam, homebrew_cask, bundle_size, bundle_size_logical,
            strip_savings, created_utc, modified_utc, last_used_utc, entitlements_json, icon,
            cached_utc
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
        ON CONFLICT(path) DO UPDATE SET
            bundle_identifier = excluded.bundle_identifier,
            name = excluded.name,
            version = excluded.version,
            build_number = excluded.build_number,
            architecture = excluded.architecture,
            web_app = excluded.web_app,
            wrapped = excluded.wrapped,
            system = excluded.system,
            steam = excluded.steam,
            homebrew_cask = excluded.homebrew_cask,
            bundle_size = excluded.bundle_size,
            bundle_size_logical = excluded.bundle_size_logical,
            strip_savings = excluded.strip_savings,
            created_utc = excluded.created_utc,
            modified_utc = excluded.modified_utc,
            last_used_utc = excluded.last_used_utc,
            entitlements_json = excluded.entitlements_json,
            icon = excluded.icon,
            cached_utc = excluded.cached_utc",
    )?;

    for record in records {
        let entitlements = record
            .entitlements
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        stmt.execute(params![
            path_key(&record.path),
            record.bundle_identifier,
            record.name,
            record.version,
            record.build_number,
            record.architecture.as_str(),
            record.web_app,
            record.wrapped,
            record.system,
            record.steam,
            record.homebrew_cask,
            record.bundle_size as i64,
            record.bundle_size_logical.map(|v| v as i64),
            record.strip_savings.to_column(),
            encode_time(record.created),
            encode_time(record.modified),
            encode_time(record.last_used),
            entitlements,
            record.icon,
            now,
        ])?;
    }
    Ok(())
}

fn map_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApplicationRecord> {
    let path: String = row.get(0)?;
    let architecture: String = row.get(5)?;
    let bundle_size: i64 = row.get(11)?;
    let bundle_size_logical: Option<i64> = row.get(12)?;
    let entitlements: Option<String> = row.get(17)?;

    let mut record = ApplicationRecord::new(PathBuf::from(path), row.get(1)?, row.get(2)?);
    record.version = row.get(3)?;
    record.build_number = row.get(4)?;
    record.architecture = Architecture::parse(&architecture);
    record.web_app = row.get(6)?;
    record.wrapped = row.get(7)?;
    record.system = row.get(8)?;
    record.steam = row.get(9)?;
    record.homebrew_cask = row.get(10)?;
    record.bundle_size = bundle_size.max(0) as u64;
    record.bundle_size_logical = bundle_size_logical.map(|v| v.max(0) as u64);
    record.strip_savings = StripSavings::from_column(row.get(13)?);
    record.created = decode_time(row.get(14)?);
    record.modified = decode_time(row.get(15)?);
    record.last_used = decode_time(row.get(16)?);
    record.entitlements = entitlements.and_then(|json| serde_json::from_str(&json).ok());
    // A missing or unreadable icon is just no icon.
    record.icon = row.get::<_, Option<Vec<u8>>>(18).ok().flatten();
    Ok(record)
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn encode_time(time: Option<DateTime<Utc>>) -> Option<String> {
    time.map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

fn decode_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn journal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push("-journal");
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(SweepError::io(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn temp_cache() -> (MetadataCache, TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("apps.sqlite");
        let cache = MetadataCache::open_in_path(db_path).expect("open cache");
        (cache, dir)
    }

    fn record(path: &str, name: &str) -> ApplicationRecord {
        let mut record = ApplicationRecord::new(
            PathBuf::from(path),
            format!("com.example.{name}"),
            name.to_string(),
        );
        record.version = "1.2.3".into();
        record.bundle_size = 4096;
        record
    }

    fn set(paths: &[&str]) -> BTreeSet<PathBuf> {
        paths.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn diff_is_set_difference_both_ways() {
        let current = set(&["/A.app", "/B.app", "/C.app"]);
        let cached = set(&["/B.app", "/D.app"]);

        let result = diff(&current, &cached);
        assert_eq!(result.new, set(&["/A.app", "/C.app"]));
        assert_eq!(result.removed, set(&["/D.app"]));

        assert!(diff(&current, &current).is_empty());
        assert_eq!(diff(&BTreeSet::new(), &cached).removed, cached);
    }

    #[test]
    fn records_round_trip_every_persisted_field() {
        let (cache, _dir) = temp_cache();
        let mut full = record("/Applications/Full.app", "Full");
        full.build_number = Some("42".into());
        full.icon = Some(vec![1, 2, 3]);
        full.architecture = Architecture::Universal;
        full.web_app = true;
        full.wrapped = true;
        full.system = true;
        full.steam = true;
        full.homebrew_cask = Some("full".into());
        full.bundle_size_logical = Some(3000);
        full.strip_savings = StripSavings::NotComputed;
        full.created = Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
        full.last_used = Some(Utc::now());
        full.entitlements = Some(vec!["com.apple.security.app-sandbox".into()]);

        let zero = record("/Applications/Zero.app", "Zero");
        cache.add(&[full.clone(), zero.clone()]).expect("add");

        let snapshot = cache.load_snapshot();
        assert_eq!(snapshot.version, CACHE_USER_VERSION);
        assert_eq!(snapshot.records, vec![full, zero]);
        assert_eq!(
            snapshot.records[1].strip_savings,
            StripSavings::Computed(0),
            "computed zero must not collapse into not computed"
        );
    }

    #[test]
    fn add_remove_and_cached_paths() {
        let (cache, _dir) = temp_cache();
        assert!(cache.cached_paths().expect("paths").is_empty());

        cache
            .add(&[record("/A.app", "A"), record("/B.app", "B")])
            .expect("add");
        assert_eq!(cache.cached_paths().expect("paths"), set(&["/A.app", "/B.app"]));

        let mut renamed = record("/A.app", "Renamed");
        renamed.version = "2.0".into();
        cache.add(&[renamed]).expect("upsert");
        let a = cache.record(Path::new("/A.app")).expect("read").expect("present");
        assert_eq!(a.name, "Renamed");

        let removed = cache
            .remove(&[PathBuf::from("/B.app"), PathBuf::from("/Z.app")])
            .expect("remove");
        assert_eq!(removed, 1);
        assert_eq!(cache.cached_paths().expect("paths"), set(&["/A.app"]));
    }

    #[test]
    fn corrupt_file_loads_as_empty_and_can_be_rebuilt() {
        let (cache, _dir) = temp_cache();
        fs::write(cache.path(), vec![0xabu8; 4096]).expect("write garbage");

        assert!(cache.try_load_snapshot().is_err());
        assert!(cache.load_snapshot().records.is_empty());

        cache.replace_all(&[record("/A.app", "A")]).expect("rebuild");
        assert_eq!(cache.cached_paths().expect("paths"), set(&["/A.app"]));
    }

    #[test]
    fn foreign_schema_version_is_refused() {
        let (cache, _dir) = temp_cache();
        {
            let conn = Connection::open(cache.path()).expect("open raw");
            conn.pragma_update(None, "user_version", 99).expect("set version");
        }

        match cache.cached_paths() {
            Err(SweepError::SchemaMismatch { found, expected }) => {
                assert_eq!(found, 99);
                assert_eq!(expected, CACHE_USER_VERSION);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn strip_savings_updates_single_record() {
        let (cache, _dir) = temp_cache();
        let mut universal = record("/U.app", "U");
        universal.architecture = Architecture::Universal;
        universal.strip_savings = StripSavings::NotComputed;
        cache.add(&[universal]).expect("add");

        assert!(cache
            .update_strip_savings(Path::new("/U.app"), StripSavings::Computed(1234))
            .expect("update"));
        assert!(!cache
            .update_strip_savings(Path::new("/Missing.app"), StripSavings::Computed(1))
            .expect("update missing"));

        let stored = cache.record(Path::new("/U.app")).expect("read").expect("present");
        assert_eq!(stored.strip_savings, StripSavings::Computed(1234));
    }

    #[test]
    fn clear_removes_the_file() {
        let (cache, _dir) = temp_cache();
        cache.add(&[record("/A.app", "A")]).expect("add");
        assert!(cache.path().exists());

        assert!(cache.clear().expect("clear"));
        assert!(!cache.path().exists());
        assert!(!cache.clear().expect("clear again"));
        assert!(cache.load_snapshot().records.is_empty());
    }
}
