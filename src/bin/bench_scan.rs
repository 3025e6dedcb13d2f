use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use app_sweep::builder::RecordBuilder;
use app_sweep::categorize::Categorizer;
use app_sweep::config::{self, Settings};
use app_sweep::fs::DiskInspector;
use app_sweep::matcher::LiveIdentities;
use app_sweep::metadata::MdlsSource;
use app_sweep::orphans::{self, OrphanScanRequest, OrphanScanStats};
use app_sweep::paths::PathScanner;
use pico_args::Arguments;
use serde::Serialize;

#[derive(Serialize)]
struct Snapshot {
    roots: Vec<String>,
    bundles_found: usize,
    records_built: usize,
    orphans_found: usize,
    orphan_bytes: u64,
    orphan_stats: OrphanScanStats,
    path_scan_ms: u128,
    build_ms: u128,
    orphan_scan_ms: u128,
}

fn main() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_secs()
        .try_init();

    if let Err(err) = run() {
        eprintln!("bench_scan: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut args = Arguments::from_env();
    let snapshot_path: Option<PathBuf> = args
        .opt_value_from_str("--snapshot")
        .map_err(|e| e.to_string())?;
    let settings_path: Option<String> = args
        .opt_value_from_str("--settings")
        .map_err(|e| e.to_string())?;
    let skip_build = args.contains("--no-metadata");

    let mut root_args: Vec<String> = Vec::new();
    while let Some(raw) = args.opt_free_from_str::<String>().map_err(|e| e.to_string())? {
        root_args.push(raw);
    }
    let leftover = args.finish();
    if !leftover.is_empty() {
        return Err("unexpected arguments".into());
    }

    let settings = match settings_path {
        Some(raw) => Settings::load(&config::expand_path(&raw)),
        None => Settings::default(),
    };
    let roots: Vec<PathBuf> = if root_args.is_empty() {
        settings.app_folder_paths()
    } else {
        root_args.iter().map(|raw| config::expand_path(raw)).collect()
    };

    let exclusions = settings.app_exclusion_list().map_err(|err| err.to_string())?;
    let start = Instant::now();
    let bundles = PathScanner::new(exclusions)
        .scan(&roots)
        .map_err(|err| err.to_string())?;
    let path_scan = start.elapsed();
    println!("Path scan: {} bundles in {:?}", bundles.len(), path_scan);

    let start = Instant::now();
    let paths: Vec<PathBuf> = bundles.iter().cloned().collect();
    let apps = if skip_build {
        Vec::new()
    } else {
        RecordBuilder::new(Arc::new(MdlsSource), Arc::new(DiskInspector)).build(&paths)
    };
    let build = start.elapsed();
    println!("Record build: {} records in {:?}", apps.len(), build);

    let mut live = LiveIdentities::from_apps(&apps);
    for bundle in &bundles {
        if let Some(stem) = bundle.file_stem() {
            live.add_token(&stem.to_string_lossy());
        }
    }
    let request = OrphanScanRequest {
        directories: settings.orphan_directory_paths(),
        live,
        exclusions: settings
            .orphan_exclusion_list()
            .map_err(|err| err.to_string())?,
        linked: Default::default(),
        reserved: settings.reserved(),
    };

    let start = Instant::now();
    let report = orphans::scan_blocking(&request, &DiskInspector, &Categorizer::for_current_user());
    let orphan_scan = start.elapsed();
    println!(
        "Orphan scan: {} leftovers ({} bytes), {} candidates, {} errors in {:?}",
        report.entries.len(),
        report.total_real_size(),
        report.stats.candidates,
        report.stats.fs_errors,
        orphan_scan,
    );

    if let Some(path) = snapshot_path {
        let snapshot = Snapshot {
            roots: roots.iter().map(|r| r.display().to_string()).collect(),
            bundles_found: bundles.len(),
            records_built: apps.len(),
            orphans_found: report.entries.len(),
            orphan_bytes: report.total_real_size(),
            orphan_stats: report.stats,
            path_scan_ms: path_scan.as_millis(),
            build_ms: build.as_millis(),
            orphan_scan_ms: orphan_scan.as_millis(),
        };
        let json = serde_json::to_string_pretty(&snapshot).map_err(|err| err.to_string())?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| err.to_string())?;
            }
        }
        std::fs::write(&path, json).map_err(|err| err.to_string())?;
        println!("Snapshot written to {}", path.display());
    }

    Ok(())
}
