use chrono::{DateTime, Local, Utc};

use crate::model::{ApplicationRecord, StripSavings};

pub fn format_size(bytes: u64) -> String {
    let units: [(&str, f64); 6] = [
        ("B", 1.0),
        ("KiB", 1024.0),
        ("MiB", 1024.0f64.powi(2)),
        ("GiB", 1024.0f64.powi(3)),
        ("TiB", 1024.0f64.powi(4)),
        ("PiB", 1024.0f64.powi(5)),
    ];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f64 = bytes as f64;
    let mut unit = units[0];
    for candidate in units.iter() {
        unit = *candidate;
        if bytes_f64 < candidate.1 * 1024.0 {
            break;
        }
    }

    let value = bytes_f64 / unit.1;
    if unit.0 == "B" {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", unit.0)
    }
}

/// Local-time rendering, `-` when unknown.
pub fn format_date(time: Option<DateTime<Utc>>) -> String {
    match time {
        Some(time) => time
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M")
            .to_string(),
        None => "-".to_string(),
    }
}

pub fn format_strip_savings(savings: StripSavings) -> String {
    match savings {
        StripSavings::NotComputed => "pending".to_string(),
        StripSavings::Computed(0) => "-".to_string(),
        StripSavings::Computed(bytes) => format_size(bytes),
    }
}

/// Short tags for the flags set on a record, e.g. `system,cask:firefox`.
pub fn describe_flags(app: &ApplicationRecord) -> String {
    let mut flags = Vec::new();
    if app.system {
        flags.push("system".to_string());
    }
    if app.web_app {
        flags.push("web".to_string());
    }
    if app.wrapped {
        flags.push("wrapped".to_string());
    }
    if app.steam {
        flags.push("steam".to_string());
    }
    if let Some(cask) = &app.homebrew_cask {
        flags.push(format!("cask:{cask}"));
    }
    flags.join(",")
}
