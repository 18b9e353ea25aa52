use crate::client::{DEFAULT_BASE_URL, DEFAULT_KERBEROS_PRINCIPAL};
use crate::ElogError;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const ENV_PREFIX: &str = "FETCH_ELOG_";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub hours_lookback: f64,
    pub exclude_patterns: Vec<String>,
    pub parallel_jobs: usize,
    pub database_dir: Option<PathBuf>,
    pub queue_size: usize,
    pub batch_commit_size: usize,
    pub base_url: String,
    pub kerberos_principal: String,
    /// Pre-negotiated `Authorization` header value for the Kerberos endpoints.
    pub auth_header: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hours_lookback: 168.0,
            exclude_patterns: Vec::new(),
            parallel_jobs: 10,
            database_dir: None,
            queue_size: 100,
            batch_commit_size: 50,
            base_url: DEFAULT_BASE_URL.to_string(),
            kerberos_principal: DEFAULT_KERBEROS_PRINCIPAL.to_string(),
            auth_header: None,
        }
    }
}

/// Keys read from the YAML config file. Absent keys keep their value and
/// unknown keys (such as the retired `lock_timeout`) are ignored.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    hours_lookback: Option<f64>,
    exclude_patterns: Option<Vec<String>>,
    parallel_jobs: Option<usize>,
    database_dir: Option<String>,
    queue_size: Option<usize>,
    batch_commit_size: Option<usize>,
    base_url: Option<String>,
    kerberos_principal: Option<String>,
}

/// Values given on the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliOverrides {
    pub hours: Option<f64>,
    pub exclude: Vec<String>,
    pub parallel_jobs: Option<usize>,
    pub database_dir: Option<PathBuf>,
    pub queue_size: Option<usize>,
    pub batch_commit_size: Option<usize>,
}

impl Config {
    /// CLI > `FETCH_ELOG_*` environment > YAML file > defaults.
    pub fn load(config_file: Option<&Path>, cli: &CliOverrides) -> Result<Self, ElogError> {
        let mut config = Self::default();
        if let Some(path) = config_file.filter(|p| p.exists()) {
            config = config.merge_yaml(path)?;
        }
        Ok(config.merge_env(|key| std::env::var(key).ok())?.merge_cli(cli))
    }

    pub fn merge_yaml(self, path: &Path) -> Result<Self, ElogError> {
        let raw = fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(self);
        }
        let file: Option<FileConfig> = serde_yaml::from_str(&raw)?;
        Ok(self.apply_file(file.unwrap_or_default()))
    }

    fn apply_file(mut self, file: FileConfig) -> Self {
        if let Some(v) = file.hours_lookback {
            self.hours_lookback = v;
        }
        if let Some(v) = file.exclude_patterns {
            self.exclude_patterns = v;
        }
        if let Some(v) = file.parallel_jobs {
            self.parallel_jobs = v;
        }
        if let Some(v) = file.database_dir {
            self.database_dir = Some(expand_home(&v));
        }
        if let Some(v) = file.queue_size {
            self.queue_size = v;
        }
        if let Some(v) = file.batch_commit_size {
            self.batch_commit_size = v;
        }
        if let Some(v) = file.base_url {
            self.base_url = v;
        }
        if let Some(v) = file.kerberos_principal {
            self.kerberos_principal = v;
        }
        self
    }

    /// Apply environment overrides read through `lookup`. Empty values are
    /// ignored; unparsable numbers are an error.
    pub fn merge_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ElogError> {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.is_empty());

        if let Some(v) = get("HOURS_LOOKBACK") {
            self.hours_lookback = parse_env("HOURS_LOOKBACK", &v)?;
        }
        if let Some(v) = get("PARALLEL_JOBS") {
            self.parallel_jobs = parse_env("PARALLEL_JOBS", &v)?;
        }
        if let Some(v) = get("QUEUE_SIZE") {
            self.queue_size = parse_env("QUEUE_SIZE", &v)?;
        }
        if let Some(v) = get("BATCH_SIZE") {
            self.batch_commit_size = parse_env("BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("DATABASE_DIR") {
            self.database_dir = Some(expand_home(&v));
        }
        if let Some(v) = get("BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = get("KERBEROS_PRINCIPAL") {
            self.kerberos_principal = v;
        }
        if let Some(v) = get("AUTH_HEADER") {
            self.auth_header = Some(v);
        }
        Ok(self)
    }

    pub fn merge_cli(mut self, cli: &CliOverrides) -> Self {
        if let Some(v) = cli.hours {
            self.hours_lookback = v;
        }
        if !cli.exclude.is_empty() {
            self.exclude_patterns = cli.exclude.clone();
        }
        if let Some(v) = cli.parallel_jobs {
            self.parallel_jobs = v;
        }
        if let Some(v) = &cli.database_dir {
            self.database_dir = Some(expand_home(&v.to_string_lossy()));
        }
        if let Some(v) = cli.queue_size {
            self.queue_size = v;
        }
        if let Some(v) = cli.batch_commit_size {
            self.batch_commit_size = v;
        }
        self
    }

    /// The snapshot directory, defaulting to the working directory.
    pub fn database_dir(&self) -> Result<PathBuf, ElogError> {
        match &self.database_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }

    pub fn lookback_secs(&self) -> u64 {
        (self.hours_lookback * 3600.0).max(0.0) as u64
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T, ElogError>
where
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ElogError::Config(format!("invalid {}{}={:?}: {}", ENV_PREFIX, name, value, e)))
}

pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with('/') => {
            PathBuf::from(home).join(rest.trim_start_matches('/'))
        }
        _ => PathBuf::from(path),
    }
}
