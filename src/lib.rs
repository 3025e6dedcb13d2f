//! Discovery of installed macOS applications and of the files they leave
//! behind once removed.

pub mod associations;
pub mod builder;
pub mod cache;
pub mod casks;
pub mod categorize;
pub mod config;
pub mod error;
pub mod exclusions;
pub mod fs;
pub mod inventory;
pub mod matcher;
pub mod metadata;
pub mod model;
pub mod orphans;
pub mod paths;
pub mod service;
pub mod util;
pub mod watcher;

pub use error::{Result, SweepError};
pub use service::Sweeper;
