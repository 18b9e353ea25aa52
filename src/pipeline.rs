//! Fetch pool -> bounded staging channel -> single writer.

use crate::fetchers::ExperimentSource;
use crate::model::{ExperimentRecord, FailedExperiment, FetchOutcome};
use crate::snapshot::{find_latest_database, generate_db_name, PreparedTarget};
use crate::store::ElogStore;
use crate::ElogError;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const FAILED_EXPERIMENTS_FILE: &str = "failed_experiments.json";
pub const WRITER_POLL: Duration = Duration::from_millis(500);
pub const WRITER_WAIT: Duration = Duration::from_secs(300);

/// What travels through the staging channel. `Done` is sent exactly once,
/// after every producer has finished.
#[derive(Debug)]
pub enum StagedItem {
    Work(FetchOutcome),
    Done,
}

/// Fixed-capacity FIFO between fetch workers and the writer.
pub struct StagingChannel {
    sender: Sender<StagedItem>,
    receiver: Receiver<StagedItem>,
}

impl StagingChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self { sender, receiver }
    }

    pub fn split(self) -> (Sender<StagedItem>, Receiver<StagedItem>) {
        (self.sender, self.receiver)
    }
}

/// All six facets for one experiment. Any error fails the whole experiment.
pub fn fetch_experiment<S: ExperimentSource + ?Sized>(source: &S, experiment_id: &str) -> FetchOutcome {
    let assemble = || -> Result<ExperimentRecord, ElogError> {
        let mut record = ExperimentRecord::new(experiment_id);
        record.info = source.info(experiment_id)?;
        record.logbook = source.logbook(experiment_id)?;
        record.run_table = source.run_table(experiment_id)?;
        record.file_aggregate = source.file_aggregate(experiment_id)?;
        record.questionnaire = source.questionnaire(experiment_id)?;
        record.workflow = source.workflow(experiment_id)?;
        Ok(record)
    };

    match assemble() {
        Ok(record) => FetchOutcome::Fetched(Box::new(record)),
        Err(e) => {
            warn!(experiment = experiment_id, "fetch failed: {}", e);
            FetchOutcome::Failed { experiment_id: experiment_id.to_string(), error: e.to_string() }
        }
    }
}

/// Fetch every id with `parallel` workers, pushing each outcome to `sender`.
/// Returns early if the writer has gone away.
pub fn run_fetch_pool<S: ExperimentSource + ?Sized>(
    source: &S,
    experiment_ids: &[String],
    parallel: usize,
    sender: &Sender<StagedItem>,
) -> Result<(), ElogError> {
    let total = experiment_ids.len();
    let completed = AtomicUsize::new(0);
    let writer_gone = AtomicBool::new(false);

    let fetch_one = |experiment_id: &str| -> bool {
        let outcome = fetch_experiment(source, experiment_id);
        if sender.send(StagedItem::Work(outcome)).is_err() {
            writer_gone.store(true, Ordering::SeqCst);
            return false;
        }
        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(experiment = experiment_id, "staged {}/{}", done, total);
        true
    };

    if parallel <= 1 {
        for experiment_id in experiment_ids {
            if !fetch_one(experiment_id) {
                break;
            }
        }
    } else {
        let (work_tx, work_rx) = unbounded::<&str>();
        for experiment_id in experiment_ids {
            // Receiver is alive in this scope.
            let _ = work_tx.send(experiment_id.as_str());
        }
        drop(work_tx);

        let workers = parallel.min(total.max(1));
        thread::scope(|scope| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let fetch_one = &fetch_one;
                scope.spawn(move || {
                    for experiment_id in work_rx.iter() {
                        if !fetch_one(experiment_id) {
                            break;
                        }
                    }
                });
            }
        });
    }

    if writer_gone.load(Ordering::SeqCst) {
        return Err(ElogError::Other("writer stopped before all experiments were staged".to_string()));
    }
    info!("fetched {}/{} experiments", completed.load(Ordering::SeqCst), total);
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOptions {
    /// Delete each experiment's existing rows before inserting it.
    pub incremental: bool,
    pub batch_commit_size: usize,
    pub hours_lookback: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriterReport {
    pub succeeded: usize,
    pub failed: Vec<FailedExperiment>,
    pub commits: usize,
}

/// The single writer. Owns the store for the whole run.
pub struct MergeEngine {
    store: ElogStore,
    options: MergeOptions,
    stop: Arc<AtomicBool>,
    report: WriterReport,
    batch_count: usize,
}

impl MergeEngine {
    pub fn new(store: ElogStore, options: MergeOptions) -> Self {
        Self::with_stop_flag(store, options, Arc::new(AtomicBool::new(false)))
    }

    pub fn with_stop_flag(store: ElogStore, options: MergeOptions, stop: Arc<AtomicBool>) -> Self {
        Self { store, options, stop, report: WriterReport::default(), batch_count: 0 }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Apply one outcome. Write failures are recorded and isolated to the
    /// experiment. A failed batch commit or a lost transaction is returned.
    pub fn apply(&mut self, outcome: FetchOutcome) -> Result<(), ElogError> {
        let record = match outcome {
            FetchOutcome::Failed { experiment_id, error } => {
                self.report.failed.push(FailedExperiment::now(&experiment_id, &error));
                return Ok(());
            }
            FetchOutcome::Fetched(record) => record,
        };

        let incremental = self.options.incremental;
        let written = self.store.isolated(&record.experiment_id, |store| {
            if incremental {
                store.delete_experiment(&record.experiment_id)?;
            }
            store.insert_record(&record)
        });

        if let Err(e) = written {
            if e.is_fatal() {
                return Err(e);
            }
            error!(experiment = %record.experiment_id, "failed to write experiment: {}", e);
            self.report.failed.push(FailedExperiment::now(&record.experiment_id, &e.to_string()));
            return Ok(());
        }

        debug!(experiment = %record.experiment_id, "wrote experiment");
        self.report.succeeded += 1;
        self.batch_count += 1;
        if self.batch_count >= self.options.batch_commit_size.max(1) {
            self.commit_batch()?;
        }
        Ok(())
    }

    fn commit_batch(&mut self) -> Result<(), ElogError> {
        self.store.commit()?;
        self.report.commits += 1;
        info!(processed = self.report.succeeded, "committed batch of {}", self.batch_count);
        self.batch_count = 0;
        Ok(())
    }

    fn drain(&mut self, receiver: &Receiver<StagedItem>) -> Result<(), ElogError> {
        loop {
            match receiver.recv_timeout(WRITER_POLL) {
                Ok(StagedItem::Work(outcome)) => self.apply(outcome)?,
                Ok(StagedItem::Done) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ElogError::Other(
                        "staging channel closed without a completion marker".to_string(),
                    ));
                }
            }
        }
        if self.batch_count > 0 {
            self.commit_batch()?;
        }
        Ok(())
    }

    /// Drain until `Done`, then record run metadata and finalize the store.
    /// A drain failure is returned only after the store has been finalized.
    pub fn run(mut self, receiver: &Receiver<StagedItem>) -> Result<WriterReport, ElogError> {
        let drained = self.drain(receiver);
        if let Err(e) = &drained {
            error!("writer loop failed: {}", e);
        }

        let finished = self.finish();
        drained?;
        finished
    }

    fn finish(self) -> Result<WriterReport, ElogError> {
        let MergeEngine { mut store, options, report, .. } = self;
        store.set_metadata("last_update", &chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string())?;
        store.set_metadata("hours_lookback", &options.hours_lookback.to_string())?;
        let path = store.finalize()?;
        info!(path = %path.display(), succeeded = report.succeeded, failed = report.failed.len(), "writer finished");
        Ok(report)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOptions {
    pub parallel_jobs: usize,
    pub queue_size: usize,
    pub batch_commit_size: usize,
    pub hours_lookback: f64,
    pub incremental: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateSummary {
    pub db_path: PathBuf,
    pub succeeded: usize,
    pub failed: Vec<FailedExperiment>,
    pub commits: usize,
}

/// One ingestion run into `target`. The caller holds the directory lock.
pub fn run_update<S: ExperimentSource + ?Sized>(
    source: &S,
    experiment_ids: &[String],
    target: &PreparedTarget,
    options: &UpdateOptions,
) -> Result<UpdateSummary, ElogError> {
    info!(
        experiments = experiment_ids.len(),
        parallel = options.parallel_jobs,
        queue = options.queue_size,
        batch = options.batch_commit_size,
        "starting update into {}",
        target.path.display()
    );

    let (sender, receiver) = StagingChannel::new(options.queue_size).split();
    let stop = Arc::new(AtomicBool::new(false));
    let (report_tx, report_rx) = bounded::<Result<WriterReport, ElogError>>(1);

    let db_path = target.path.clone();
    let merge_options = MergeOptions {
        incremental: options.incremental,
        batch_commit_size: options.batch_commit_size,
        hours_lookback: options.hours_lookback,
    };
    let writer_stop = Arc::clone(&stop);
    let writer_path = db_path.clone();
    let writer = thread::Builder::new().name("elog-writer".to_string()).spawn(move || {
        let result = ElogStore::open(&writer_path).and_then(|store| {
            store.enable_wal_mode()?;
            MergeEngine::with_stop_flag(store, merge_options, writer_stop).run(&receiver)
        });
        let _ = report_tx.send(result);
    })?;

    let pool_result = run_fetch_pool(source, experiment_ids, options.parallel_jobs, &sender);
    let _ = sender.send(StagedItem::Done);
    stop.store(true, Ordering::SeqCst);
    drop(sender);

    let report = match report_rx.recv_timeout(WRITER_WAIT) {
        Ok(result) => {
            let _ = writer.join();
            result?
        }
        Err(_) => {
            return Err(ElogError::Other(format!(
                "writer did not finish within {} seconds",
                WRITER_WAIT.as_secs()
            )));
        }
    };
    pool_result?;

    if !report.failed.is_empty() {
        let dir = db_path.parent().unwrap_or_else(|| Path::new("."));
        let failed_path = write_failed_experiments(dir, &report.failed)?;
        warn!(count = report.failed.len(), "failed experiments saved to {}", failed_path.display());
    }

    Ok(UpdateSummary { db_path, succeeded: report.succeeded, failed: report.failed, commits: report.commits })
}

/// Write the failure list as pretty JSON next to the snapshots.
pub fn write_failed_experiments(dir: &Path, failed: &[FailedExperiment]) -> Result<PathBuf, ElogError> {
    let path = dir.join(FAILED_EXPERIMENTS_FILE);
    fs::write(&path, serde_json::to_string_pretty(failed)?)?;
    Ok(path)
}

pub fn read_failed_experiments(path: &Path) -> Result<Vec<FailedExperiment>, ElogError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Fetch one experiment into the latest snapshot in `dir` (or a new one),
/// merging over what is stored for it. The caller holds the directory lock.
pub fn fetch_single<S: ExperimentSource + ?Sized>(
    source: &S,
    experiment_id: &str,
    dir: &Path,
) -> Result<PathBuf, ElogError> {
    fs::create_dir_all(dir)?;
    let path = match find_latest_database(dir)? {
        Some(latest) => latest,
        None => dir.join(generate_db_name(&chrono::Local::now())),
    };

    let record = match fetch_experiment(source, experiment_id) {
        FetchOutcome::Fetched(record) => record,
        FetchOutcome::Failed { error, .. } => return Err(ElogError::Other(error)),
    };

    let mut store = ElogStore::open(&path)?;
    store.enable_wal_mode()?;
    // Each facet is committed as soon as it is written.
    let written = store.insert_record_with(&record, |store| store.commit());
    if let Err(e) = &written {
        error!(experiment = experiment_id, "fetch stopped part way: {}", e);
        store.rollback()?;
    }
    let path = store.finalize()?;
    written?;
    Ok(path)
}
