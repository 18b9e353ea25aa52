use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use elogfetch::client::{AuthProvider, ElogClient, KerberosAuth};
use elogfetch::config::{CliOverrides, Config};
use elogfetch::fetchers::ElogSource;
use elogfetch::lock::DirLock;
use elogfetch::pipeline::{self, UpdateOptions, UpdateSummary, FAILED_EXPERIMENTS_FILE};
use elogfetch::snapshot::{find_latest_database, prepare_target, BaseMode};
use elogfetch::store::ElogStore;
use elogfetch::ElogError;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::error;

const DRY_RUN_PREVIEW: usize = 20;

#[derive(Parser)]
#[command(name = "elogfetch")]
#[command(about = "Fetch LCLS experiment data from the electronic logbook into SQLite", long_about = None)]
struct Cli {
    /// YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
    /// Errors only
    #[arg(short, long)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Update the local database with recently changed experiments
    Update {
        #[arg(short = 'H', long)]
        hours: Option<f64>,
        /// Shell-style pattern to exclude, e.g. -e 'txi*'
        #[arg(short, long)]
        exclude: Vec<String>,
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// List what would be fetched and stop
        #[arg(long)]
        dry_run: bool,
        #[arg(short, long)]
        parallel: Option<usize>,
        /// Start from an existing snapshot: the latest one, or the given path
        #[arg(short, long, num_args = 0..=1, default_missing_value = "AUTO", value_name = "BASE")]
        incremental: Option<String>,
        #[arg(long)]
        queue_size: Option<usize>,
        /// Experiments per commit
        #[arg(short, long)]
        batch_size: Option<usize>,
    },
    /// Fetch one experiment into the latest database
    Fetch {
        experiment_id: String,
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
    /// Show the latest database and its contents
    Status {
        #[arg(short, long)]
        database_dir: Option<PathBuf>,
    },
    /// List recently updated experiments
    ListExperiments {
        #[arg(short = 'H', long)]
        hours: Option<f64>,
        #[arg(short, long)]
        exclude: Vec<String>,
    },
    /// Re-fetch the experiments recorded in failed_experiments.json
    Retry {
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        #[arg(short, long)]
        parallel: Option<usize>,
    },
}

fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();
    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    elogfetch::init_tracing("elogfetch", level);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("[elogfetch] Error: {}", e);
            if matches!(e, ElogError::Authentication(_)) {
                eprintln!("[elogfetch] Please run 'kinit' to authenticate.");
            }
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<(), ElogError> {
    let config_file = cli.config.as_deref();
    match cli.command {
        Commands::Update { hours, exclude, output_dir, dry_run, parallel, incremental, queue_size, batch_size } => {
            let overrides = CliOverrides {
                hours,
                exclude,
                parallel_jobs: parallel,
                database_dir: output_dir,
                queue_size,
                batch_commit_size: batch_size,
            };
            let config = Config::load(config_file, &overrides)?;
            update(&config, dry_run, incremental.as_deref())
        }
        Commands::Fetch { experiment_id, output_dir } => {
            let overrides = CliOverrides { database_dir: output_dir, ..Default::default() };
            let config = Config::load(config_file, &overrides)?;
            fetch(&config, &experiment_id)
        }
        Commands::Status { database_dir } => {
            let overrides = CliOverrides { database_dir, ..Default::default() };
            let config = Config::load(config_file, &overrides)?;
            status(&config.database_dir()?)
        }
        Commands::ListExperiments { hours, exclude } => {
            let overrides = CliOverrides { hours, exclude, ..Default::default() };
            let config = Config::load(config_file, &overrides)?;
            list_experiments(&config)
        }
        Commands::Retry { file, output_dir, parallel } => {
            let overrides = CliOverrides { parallel_jobs: parallel, database_dir: output_dir, ..Default::default() };
            let config = Config::load(config_file, &overrides)?;
            retry(&config, file)
        }
    }
}

/// With `preflight`, credentials are checked before any experiment is fetched
/// so an authentication problem aborts the run up front.
fn make_source(config: &Config, preflight: bool) -> Result<ElogSource<ElogClient>, ElogError> {
    let auth = KerberosAuth::new(&config.kerberos_principal, config.auth_header.clone());
    if preflight {
        auth.headers()?;
    }
    Ok(ElogSource::new(ElogClient::new(&config.base_url, Box::new(auth))?))
}

fn base_mode(incremental: Option<&str>) -> BaseMode {
    match incremental {
        None => BaseMode::Fresh,
        Some(base) if base.eq_ignore_ascii_case("auto") => BaseMode::Latest,
        Some(base) => BaseMode::Explicit(PathBuf::from(base)),
    }
}

fn update_options(config: &Config, mode: &BaseMode) -> UpdateOptions {
    UpdateOptions {
        parallel_jobs: config.parallel_jobs,
        queue_size: config.queue_size,
        batch_commit_size: config.batch_commit_size,
        hours_lookback: config.hours_lookback,
        incremental: mode.is_incremental(),
    }
}

fn update(config: &Config, dry_run: bool, incremental: Option<&str>) -> Result<(), ElogError> {
    let db_dir = config.database_dir()?;
    fs::create_dir_all(&db_dir)?;
    println!("[elogfetch] Looking back {} hours", config.hours_lookback);

    let source = make_source(config, !dry_run)?;
    let experiments = source.updated_experiments(config.lookback_secs(), &config.exclude_patterns)?;
    if experiments.is_empty() {
        println!("[elogfetch] No experiments to update.");
        return Ok(());
    }

    if dry_run {
        println!("\nWould fetch data for {} experiments:", experiments.len());
        for exp in experiments.iter().take(DRY_RUN_PREVIEW) {
            println!("  - {}", exp);
        }
        if experiments.len() > DRY_RUN_PREVIEW {
            println!("  ... and {} more", experiments.len() - DRY_RUN_PREVIEW);
        }
        return Ok(());
    }

    let _lock = DirLock::acquire(&db_dir)?;
    let mode = base_mode(incremental);
    let target = prepare_target(&db_dir, &mode, &Local::now())?;
    println!("[elogfetch] Using database: {}", target.path.display());
    let summary = pipeline::run_update(&source, &experiments, &target, &update_options(config, &mode))?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &UpdateSummary) {
    println!(
        "[elogfetch] Update complete: {} succeeded, {} failed",
        summary.succeeded,
        summary.failed.len()
    );
    println!("[elogfetch] Database saved to: {}", summary.db_path.display());
    if !summary.failed.is_empty() {
        println!("[elogfetch] Failed experiments recorded in {}", FAILED_EXPERIMENTS_FILE);
    }
}

fn fetch(config: &Config, experiment_id: &str) -> Result<(), ElogError> {
    let db_dir = config.database_dir()?;
    let source = make_source(config, true)?;
    let _lock = DirLock::acquire(&db_dir)?;
    let path = pipeline::fetch_single(&source, experiment_id, &db_dir)?;
    println!("[elogfetch] Data saved to: {}", path.display());
    Ok(())
}

fn status(db_dir: &Path) -> Result<(), ElogError> {
    let Some(db_path) = find_latest_database(db_dir)? else {
        println!("No database found.");
        println!("Run 'elogfetch update' to create one.");
        return Ok(());
    };

    let meta = fs::metadata(&db_path)?;
    let modified: DateTime<Local> = meta.modified()?.into();
    println!("Database: {}", db_path.display());
    println!("Size: {:.1} KB", meta.len() as f64 / 1024.0);
    println!("Modified: {}", modified.format("%Y-%m-%d %H:%M:%S"));

    let store = ElogStore::open(&db_path)?;
    if let Some(last_update) = store.get_metadata("last_update")? {
        println!("Last update: {}", last_update);
    }
    if let Some(hours) = store.get_metadata("hours_lookback")? {
        println!("Hours lookback: {}", hours);
    }
    println!();
    println!("Statistics:");
    for (table, count) in store.stats()? {
        println!("  {}: {}", table, count);
    }
    Ok(())
}

fn list_experiments(config: &Config) -> Result<(), ElogError> {
    let source = make_source(config, false)?;
    let mut experiments = source.updated_experiments(config.lookback_secs(), &config.exclude_patterns)?;
    if experiments.is_empty() {
        println!("No experiments found.");
        return Ok(());
    }
    experiments.sort();
    println!(
        "Found {} experiments updated in last {} hours:",
        experiments.len(),
        config.hours_lookback
    );
    for exp in &experiments {
        println!("  {}", exp);
    }
    Ok(())
}

fn retry(config: &Config, file: Option<PathBuf>) -> Result<(), ElogError> {
    let db_dir = config.database_dir()?;
    let failed_file = file.unwrap_or_else(|| db_dir.join(FAILED_EXPERIMENTS_FILE));
    if !failed_file.exists() {
        return Err(ElogError::Config(format!(
            "Failed experiments file not found: {}",
            failed_file.display()
        )));
    }

    let experiments: Vec<String> = pipeline::read_failed_experiments(&failed_file)?
        .into_iter()
        .map(|f| f.experiment_id)
        .collect();
    if experiments.is_empty() {
        println!("[elogfetch] No failed experiments to retry.");
        return Ok(());
    }
    println!("[elogfetch] Retrying {} failed experiments...", experiments.len());

    let source = make_source(config, true)?;
    let _lock = DirLock::acquire(&db_dir)?;
    let mode = BaseMode::Latest;
    let target = prepare_target(&db_dir, &mode, &Local::now())?;
    let summary = pipeline::run_update(&source, &experiments, &target, &update_options(config, &mode))?;
    print_summary(&summary);
    Ok(())
}
