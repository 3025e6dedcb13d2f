use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use app_sweep::cache::{self, MetadataCache};
use app_sweep::casks::CaskIndex;
use app_sweep::config::{self, Settings};
use app_sweep::fs::DiskInspector;
use app_sweep::metadata::MdlsSource;
use app_sweep::model::ApplicationRecord;
use app_sweep::orphans::OrphanReport;
use app_sweep::watcher::{self, WatchEventKind};
use app_sweep::{Sweeper, util};
use env_logger::Env;
use log::warn;
use pico_args::Arguments;

const USAGE: &str = "\
usage: sweep [--settings FILE] [--cache FILE] [--json] COMMAND

commands:
  apps               list installed applications
  orphans            list files left behind by removed applications
  inspect APP        show the files of one application and their sizes
  exclude PATH       never report PATH as an orphan
  unexclude PATH     undo `exclude`
  clear-cache        delete the application metadata cache
  watch              reload the application list whenever it changes
                     [--watch-poll SECS] [--watch-max-poll SECS]";

enum Command {
    Apps,
    Orphans,
    Inspect(PathBuf),
    Exclude(PathBuf),
    Unexclude(PathBuf),
    ClearCache,
    Watch,
}

struct Options {
    settings_path: PathBuf,
    cache_path: PathBuf,
    json: bool,
    watcher_config: watcher::WatcherConfig,
    command: Command,
}

fn main() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .format_timestamp_secs()
        .try_init();

    let options = match parse_args() {
        Ok(options) => options,
        Err(err) => {
            eprintln!("sweep: {err}");
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    if let Err(err) = run(options) {
        eprintln!("sweep: {err}");
        process::exit(1);
    }
}

fn parse_args() -> Result<Options, String> {
    let mut args = Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        println!("{USAGE}");
        process::exit(0);
    }

    let settings_path = args
        .opt_value_from_str::<_, String>("--settings")
        .map_err(|err| err.to_string())?
        .map(|raw| config::expand_path(&raw))
        .unwrap_or_else(Settings::default_path);
    let cache_path = args
        .opt_value_from_str::<_, String>("--cache")
        .map_err(|err| err.to_string())?
        .map(|raw| config::expand_path(&raw))
        .unwrap_or_else(cache::default_path);
    let json = args.contains("--json");

    let watch_poll_secs = args
        .opt_value_from_str::<_, u64>("--watch-poll")
        .map_err(|err| err.to_string())?;
    let watch_max_secs = args
        .opt_value_from_str::<_, u64>("--watch-max-poll")
        .map_err(|err| err.to_string())?;

    let mut watcher_config = watcher::WatcherConfig::default();
    if let Some(secs) = watch_poll_secs {
        let duration = Duration::from_secs(secs.max(1));
        watcher_config.notify_poll_interval = duration;
        watcher_config.fallback_initial = duration;
    }
    if let Some(secs) = watch_max_secs {
        watcher_config.fallback_max = Duration::from_secs(secs.max(1));
    }
    if watcher_config.fallback_initial > watcher_config.fallback_max {
        watcher_config.fallback_initial = watcher_config.fallback_max;
    }

    let name: String = args
        .free_from_str()
        .map_err(|_| "missing command".to_string())?;
    let command = match name.as_str() {
        "apps" => Command::Apps,
        "orphans" => Command::Orphans,
        "inspect" => {
            let raw: String = args
                .free_from_str()
                .map_err(|_| "inspect needs an APP path".to_string())?;
            Command::Inspect(config::expand_path(&raw))
        }
        "exclude" | "unexclude" => {
            let raw: String = args
                .free_from_str()
                .map_err(|_| format!("{name} needs a PATH"))?;
            let path = config::expand_path(&raw);
            if name == "exclude" {
                Command::Exclude(path)
            } else {
                Command::Unexclude(path)
            }
        }
        "clear-cache" => Command::ClearCache,
        "watch" => Command::Watch,
        other => return Err(format!("unknown command `{other}`")),
    };

    let leftover = args.finish();
    if !leftover.is_empty() {
        let extras: Vec<String> = leftover
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        return Err(format!("unexpected arguments: {}", extras.join(" ")));
    }

    Ok(Options {
        settings_path,
        cache_path,
        json,
        watcher_config,
        command,
    })
}

fn run(options: Options) -> app_sweep::Result<()> {
    let settings = Settings::load(&options.settings_path);
    let cache = MetadataCache::open_in_path(options.cache_path.clone())?;
    let mut sweeper = Sweeper::new(
        settings,
        cache,
        Arc::new(MdlsSource),
        Arc::new(DiskInspector),
    )
    .with_settings_path(options.settings_path.clone())
    .with_casks(CaskIndex::discover());

    match options.command {
        Command::Apps => {
            let report = sweeper.installed_applications()?;
            if let Some(err) = &report.persist_error {
                warn!("application list not cached: {err}");
            }
            print_apps(&report.apps, options.json)?;
        }
        Command::Orphans => {
            sweeper.installed_applications()?;
            let report = sweeper.scan_for_orphans()?;
            print_orphans(&report, options.json)?;
        }
        Command::Inspect(app) => {
            sweeper.installed_applications()?;
            match sweeper.inspect_app_files(&app) {
                Some(record) => print_inspection(record, options.json)?,
                None => println!("{} is not an installed application", app.display()),
            }
        }
        Command::Exclude(path) => {
            if sweeper.exclude_path(&path)? {
                println!("Excluded {}", path.display());
            } else {
                println!("{} was already excluded", path.display());
            }
        }
        Command::Unexclude(path) => {
            if sweeper.unexclude_path(&path)? {
                println!("Removed exclusion for {}", path.display());
            } else {
                println!("{} was not excluded", path.display());
            }
        }
        Command::ClearCache => {
            if sweeper.clear_cache()? {
                println!("Cleared cache at {}", sweeper.cache().path().display());
            } else {
                println!("No cache at {}", sweeper.cache().path().display());
            }
        }
        Command::Watch => watch(&mut sweeper, options.watcher_config)?,
    }
    Ok(())
}

fn watch(sweeper: &mut Sweeper, config: watcher::WatcherConfig) -> app_sweep::Result<()> {
    let report = sweeper.installed_applications()?;
    println!("Watching {} applications", report.apps.len());

    let handle = watcher::spawn_with_config(sweeper.settings().app_folder_paths(), config)?;
    while let Ok(event) = handle.events.recv() {
        match &event.kind {
            WatchEventKind::AppAdded => println!("+ {}", event.path.display()),
            WatchEventKind::AppRemoved => println!("- {}", event.path.display()),
            WatchEventKind::Rescan => {}
            WatchEventKind::Error(message) => {
                warn!("watcher: {message}");
                continue;
            }
        }
        // Bursts (an installer dropping many files) collapse into one reload.
        while handle.events.recv_timeout(Duration::from_millis(500)).is_ok() {}

        match sweeper.installed_applications() {
            Ok(report) if !report.added.is_empty() || !report.removed.is_empty() => println!(
                "Reloaded: {} applications ({} added, {} removed)",
                report.apps.len(),
                report.added.len(),
                report.removed.len()
            ),
            Ok(_) => {}
            Err(err) => warn!("reload failed: {err}"),
        }
    }
    Ok(())
}

fn print_apps(apps: &[ApplicationRecord], json: bool) -> app_sweep::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(apps)?);
        return Ok(());
    }
    for app in apps {
        println!(
            "{:<32} {:<12} {:<10} {:>10}  {:<16} {}",
            app.name,
            app.version,
            app.architecture.as_str(),
            util::format_size(app.bundle_size),
            util::format_date(app.last_used),
            util::describe_flags(app),
        );
    }
    println!("{} applications", apps.len());
    Ok(())
}

fn print_inspection(app: &ApplicationRecord, json: bool) -> app_sweep::Result<()> {
    if json {
        let files: Vec<_> = app
            .file_sizes
            .iter()
            .map(|(path, size)| serde_json::json!({ "path": path, "real_size": size.real }))
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "app": app,
                "files": files,
                "total_real_size": app.inspected_size(),
            }))?
        );
        return Ok(());
    }
    println!("{} {} ({})", app.name, app.version, app.bundle_identifier);
    for (path, size) in &app.file_sizes {
        println!("  {:>10}  {}", util::format_size(size.real), path.display());
    }
    println!("{} total", util::format_size(app.inspected_size()));
    Ok(())
}

fn print_orphans(report: &OrphanReport, json: bool) -> app_sweep::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for group in report.by_category() {
        println!("{} ({})", group.label, util::format_size(group.real_size));
        for entry in &group.entries {
            println!(
                "  {:>10}  {}",
                util::format_size(entry.real_size),
                entry.path.display()
            );
        }
    }
    println!(
        "{} leftover items, {} total",
        report.entries.len(),
        util::format_size(report.total_real_size())
    );
    Ok(())
}
