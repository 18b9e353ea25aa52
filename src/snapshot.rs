use crate::ElogError;
use chrono::{DateTime, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::info;

pub const DB_PREFIX: &str = "elog_";

/// `elog_YYYY_MMDD_HHMM.db`
pub static DB_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^elog_(\d{4})_(\d{4})_(\d{4})\.db$").expect("static pattern"));

/// Snapshot file name for a creation time, to the minute.
pub fn generate_db_name<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}{}.db", DB_PREFIX, now.format("%Y_%m%d_%H%M"))
}

pub fn is_snapshot_name(name: &str) -> bool {
    DB_PATTERN.is_match(name)
}

/// Most recently modified snapshot in `dir`, if any.
pub fn find_latest_database(dir: &Path) -> Result<Option<PathBuf>, ElogError> {
    if !dir.exists() {
        return Ok(None);
    }

    let mut latest: Option<(PathBuf, SystemTime)> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(is_snapshot_name)
            .unwrap_or(false);
        if !matches || !path.is_file() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        match &latest {
            Some((_, best)) if *best >= modified => {}
            _ => latest = Some((path, modified)),
        }
    }

    Ok(latest.map(|(path, _)| path))
}

/// Where a new snapshot starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseMode {
    Fresh,
    Latest,
    Explicit(PathBuf),
}

impl BaseMode {
    /// Incremental runs delete each experiment before re-inserting it.
    pub fn is_incremental(&self) -> bool {
        !matches!(self, BaseMode::Fresh)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTarget {
    pub path: PathBuf,
    pub base: Option<PathBuf>,
}

/// Decide the new snapshot path and, for incremental runs, copy the base
/// snapshot into it. When no base exists the store is created empty on open.
pub fn prepare_target<Tz: TimeZone>(
    dir: &Path,
    mode: &BaseMode,
    now: &DateTime<Tz>,
) -> Result<PreparedTarget, ElogError>
where
    Tz::Offset: std::fmt::Display,
{
    fs::create_dir_all(dir)?;
    let path = dir.join(generate_db_name(now));

    let base = match mode {
        BaseMode::Fresh => None,
        BaseMode::Latest => find_latest_database(dir)?,
        BaseMode::Explicit(base) => {
            if !base.exists() {
                return Err(ElogError::Config(format!("Base database not found: {}", base.display())));
            }
            Some(base.clone())
        }
    };

    match &base {
        Some(base) if same_file(base, &path) => {
            info!(path = %path.display(), "incremental mode: updating snapshot in place");
        }
        Some(base) => {
            info!(base = %base.display(), target = %path.display(), "incremental mode: copying base snapshot");
            fs::copy(base, &path)?;
        }
        None if mode.is_incremental() => {
            info!("no existing database found, creating fresh database");
        }
        None => {}
    }

    Ok(PreparedTarget { path, base })
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
