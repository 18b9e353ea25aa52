use elogfetch::fetchers::ExperimentSource;
use elogfetch::lock::DirLock;
use elogfetch::model::{
    ExperimentInfo, ExperimentRecord, FetchOutcome, FileAggregate, LogEntry, Questionnaire,
    QuestionnaireField, RunDetectors, RunFiles, RunProduction, RunTable, WorkflowDefinition, Workflows,
};
use elogfetch::pipeline::{
    fetch_single, read_failed_experiments, run_fetch_pool, run_update, MergeEngine, MergeOptions,
    StagedItem, StagingChannel, UpdateOptions, UpdateSummary, FAILED_EXPERIMENTS_FILE,
};
use elogfetch::snapshot::{prepare_target, BaseMode};
use elogfetch::store::ElogStore;
use elogfetch::ElogError;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

struct FakeSource {
    records: HashMap<String, ExperimentRecord>,
    failing: HashSet<String>,
    info_calls: AtomicUsize,
}

impl FakeSource {
    fn new(records: Vec<ExperimentRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.experiment_id.clone(), r)).collect(),
            failing: HashSet::new(),
            info_calls: AtomicUsize::new(0),
        }
    }

    fn failing(mut self, experiment_id: &str) -> Self {
        self.failing.insert(experiment_id.to_string());
        self
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.keys().chain(self.failing.iter()).cloned().collect();
        ids.sort();
        ids.dedup();
        ids
    }

    fn record(&self, experiment_id: &str) -> Result<&ExperimentRecord, ElogError> {
        if self.failing.contains(experiment_id) {
            return Err(ElogError::api("upstream unavailable"));
        }
        self.records
            .get(experiment_id)
            .ok_or_else(|| ElogError::Other(format!("unknown experiment {}", experiment_id)))
    }
}

impl ExperimentSource for FakeSource {
    fn info(&self, experiment_id: &str) -> Result<Option<ExperimentInfo>, ElogError> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.record(experiment_id)?.info.clone())
    }
    fn logbook(&self, experiment_id: &str) -> Result<Option<Vec<LogEntry>>, ElogError> {
        Ok(self.record(experiment_id)?.logbook.clone())
    }
    fn run_table(&self, experiment_id: &str) -> Result<Option<RunTable>, ElogError> {
        Ok(self.record(experiment_id)?.run_table.clone())
    }
    fn file_aggregate(&self, experiment_id: &str) -> Result<Option<FileAggregate>, ElogError> {
        Ok(self.record(experiment_id)?.file_aggregate.clone())
    }
    fn questionnaire(&self, experiment_id: &str) -> Result<Option<Questionnaire>, ElogError> {
        Ok(self.record(experiment_id)?.questionnaire.clone())
    }
    fn workflow(&self, experiment_id: &str) -> Result<Option<Workflows>, ElogError> {
        Ok(self.record(experiment_id)?.workflow.clone())
    }
}

fn full_record(experiment_id: &str) -> ExperimentRecord {
    let mut record = ExperimentRecord::new(experiment_id);
    record.info = Some(ExperimentInfo {
        experiment_id: experiment_id.to_string(),
        name: Some(experiment_id.to_string()),
        instrument: Some("MFX".to_string()),
        ..Default::default()
    });
    record.logbook = Some(vec![
        LogEntry {
            log_id: Some(format!("{}-l1", experiment_id)),
            experiment_id: experiment_id.to_string(),
            run_number: Some(1),
            timestamp: "2024-01-01T01:00:00".to_string(),
            content: Some("first run".to_string()),
            tags: Some("DAQ".to_string()),
            author: Some("operator".to_string()),
        },
        LogEntry {
            log_id: Some(format!("{}-l2", experiment_id)),
            experiment_id: experiment_id.to_string(),
            run_number: None,
            timestamp: "2024-01-01T00:00:00".to_string(),
            content: Some("setup".to_string()),
            tags: None,
            author: None,
        },
    ]);
    record.run_table = Some(RunTable {
        data_production: vec![
            RunProduction { run_number: 1, n_events: Some(100), ..Default::default() },
            RunProduction { run_number: 2, n_events: Some(200), ..Default::default() },
        ],
        detectors: vec![RunDetectors {
            run_number: 1,
            statuses: BTreeMap::from([("DAQ Detectors/epix".to_string(), "Checked".to_string())]),
        }],
    });
    record.file_aggregate = Some(FileAggregate {
        records: vec![RunFiles { run_number: 1, number_of_files: Some(3), total_size_bytes: Some(4096) }],
    });
    record.questionnaire = Some(Questionnaire {
        proposal: Some("L-1001".to_string()),
        fields: vec![QuestionnaireField {
            category: "pcdssetup".to_string(),
            field_id: "pcdssetup-motors".to_string(),
            field_name: Some("motors".to_string()),
            field_value: Some("3".to_string()),
            ..Default::default()
        }],
    });
    record.workflow = Some(Workflows {
        workflows: vec![WorkflowDefinition { name: "smd".to_string(), ..Default::default() }],
    });
    record
}

fn options(parallel_jobs: usize, batch_commit_size: usize, incremental: bool) -> UpdateOptions {
    UpdateOptions { parallel_jobs, queue_size: 4, batch_commit_size, hours_lookback: 24.0, incremental }
}

fn update(source: &FakeSource, dir: &Path, mode: BaseMode, opts: UpdateOptions) -> UpdateSummary {
    let _lock = DirLock::acquire(dir).unwrap();
    let target = prepare_target(dir, &mode, &chrono::Local::now()).unwrap();
    run_update(source, &source.ids(), &target, &opts).unwrap()
}

fn stats(path: &Path) -> Vec<(String, i64)> {
    ElogStore::open(path).unwrap().stats().unwrap()
}

fn count(path: &Path, table: &str) -> i64 {
    stats(path).into_iter().find(|(name, _)| name == table).map(|(_, n)| n).unwrap()
}

#[test]
fn test_experiment_rows_match_records_with_info() {
    let dir = tempfile::tempdir().unwrap();
    let mut no_info = full_record("exp_d");
    no_info.info = None;
    let source = FakeSource::new(vec![full_record("exp_a"), full_record("exp_b"), full_record("exp_c"), no_info])
        .failing("exp_e");

    let summary = update(&source, dir.path(), BaseMode::Fresh, options(3, 50, false));

    assert_eq!(summary.succeeded, 4);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].experiment_id, "exp_e");
    assert_eq!(count(&summary.db_path, "experiment"), 3);
}

#[test]
fn test_commit_count_is_ceiling_of_batches() {
    for (n, batch, expected) in [(7, 3, 3), (6, 3, 2), (1, 50, 1), (0, 5, 0)] {
        let dir = tempfile::tempdir().unwrap();
        let records = (0..n).map(|i| full_record(&format!("exp{:02}", i))).collect();
        let source = FakeSource::new(records);
        let summary = update(&source, dir.path(), BaseMode::Fresh, options(2, batch, false));
        assert_eq!(summary.succeeded, n);
        assert_eq!(summary.commits, expected, "n={} batch={}", n, batch);
    }
}

#[test]
fn test_failed_commits_do_not_count_toward_batches() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new(vec![full_record("a"), full_record("b")]).failing("c").failing("d");
    let summary = update(&source, dir.path(), BaseMode::Fresh, options(1, 2, false));
    assert_eq!(summary.commits, 1);
}

#[test]
fn test_incremental_update_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new(vec![full_record("exp_a"), full_record("exp_b")]);

    let first = update(&source, dir.path(), BaseMode::Fresh, options(2, 1, false));
    let first_stats = stats(&first.db_path);
    let second = update(&source, dir.path(), BaseMode::Latest, options(2, 1, true));
    let third = update(&source, dir.path(), BaseMode::Latest, options(2, 1, true));

    assert_eq!(stats(&second.db_path), first_stats);
    assert_eq!(stats(&third.db_path), first_stats);
    assert_eq!(count(&third.db_path, "logbook"), 4);
    assert_eq!(count(&third.db_path, "run"), 4);
}

#[test]
fn test_finalized_snapshot_is_self_contained() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new(vec![full_record("exp_a")]);
    let summary = update(&source, dir.path(), BaseMode::Fresh, options(1, 10, false));

    let wal = summary.db_path.with_extension("db-wal");
    assert!(!wal.exists() || std::fs::metadata(&wal).unwrap().len() == 0);
    let store = ElogStore::open(&summary.db_path).unwrap();
    assert_eq!(store.journal_mode().unwrap().to_lowercase(), "delete");
    assert_eq!(store.get_metadata("hours_lookback").unwrap().as_deref(), Some("24"));
    assert!(store.get_metadata("last_update").unwrap().is_some());
}

#[test]
fn test_backpressure_bounds_in_flight_items() {
    let records: Vec<_> = (0..20).map(|i| full_record(&format!("exp{:02}", i))).collect();
    let source = FakeSource::new(records);
    let ids = source.ids();
    let (capacity, workers) = (3, 2);
    let (tx, rx) = StagingChannel::new(capacity).split();

    let (in_flight, queued) = thread::scope(|scope| {
        let pool = scope.spawn(|| run_fetch_pool(&source, &ids, workers, &tx));
        thread::sleep(Duration::from_millis(500));
        let observed = (source.info_calls.load(Ordering::SeqCst), rx.len());
        for _ in 0..ids.len() {
            rx.recv().unwrap();
        }
        pool.join().unwrap().unwrap();
        observed
    });

    assert_eq!(queued, capacity);
    assert_eq!(in_flight, capacity + workers);
}

#[test]
fn test_write_failure_is_isolated_and_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("elog_2020_0101_0000.db");
    let store = ElogStore::open(&base).unwrap();
    store
        .connection()
        .execute_batch(
            "CREATE TRIGGER reject_poison BEFORE INSERT ON Experiment
             WHEN NEW.experiment_id = 'poison'
             BEGIN SELECT RAISE(ABORT, 'poisoned row'); END;",
        )
        .unwrap();
    store.finalize().unwrap();

    let source = FakeSource::new(vec![full_record("good_a"), full_record("poison"), full_record("good_b")]);
    let summary = update(&source, dir.path(), BaseMode::Latest, options(2, 1, true));

    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed.len(), 1);
    assert!(summary.failed[0].error.contains("poisoned row"));
    assert_eq!(count(&summary.db_path, "experiment"), 2);
    // Nothing of the rejected experiment survives the rollback.
    assert_eq!(count(&summary.db_path, "run"), 4);
    assert_eq!(count(&summary.db_path, "logbook"), 4);
}

#[test]
fn test_failure_sideband_drives_retry() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new(vec![full_record("ok")]).failing("flaky_1").failing("flaky_2");
    update(&source, dir.path(), BaseMode::Fresh, options(2, 10, false));

    let failed_path = dir.path().join(FAILED_EXPERIMENTS_FILE);
    let mut ids: Vec<String> = read_failed_experiments(&failed_path).unwrap().into_iter().map(|f| f.experiment_id).collect();
    ids.sort();
    assert_eq!(ids, vec!["flaky_1".to_string(), "flaky_2".to_string()]);

    let recovered = FakeSource::new(vec![full_record("ok"), full_record("flaky_1"), full_record("flaky_2")]);
    let _lock = DirLock::acquire(dir.path()).unwrap();
    let target = prepare_target(dir.path(), &BaseMode::Latest, &chrono::Local::now()).unwrap();
    let summary = run_update(&recovered, &ids, &target, &options(2, 10, true)).unwrap();

    assert_eq!(summary.succeeded, 2);
    assert!(summary.failed.is_empty());
    assert_eq!(count(&summary.db_path, "experiment"), 3);
}

#[test]
fn test_no_sideband_without_failures() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new(vec![full_record("ok")]);
    update(&source, dir.path(), BaseMode::Fresh, options(1, 10, false));
    assert!(!dir.path().join(FAILED_EXPERIMENTS_FILE).exists());
}

#[test]
fn test_second_run_is_rejected_while_locked() {
    let dir = tempfile::tempdir().unwrap();
    let _held = DirLock::acquire(dir.path()).unwrap();
    let err = DirLock::acquire(dir.path()).unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn test_production_data_coalesces_across_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coalesce.db");
    let store = ElogStore::open(&path).unwrap();
    let mut engine = MergeEngine::new(store, MergeOptions { incremental: false, batch_commit_size: 10, hours_lookback: 1.0 });

    let mut first = ExperimentRecord::new("exp");
    first.run_table = Some(RunTable {
        data_production: vec![RunProduction { run_number: 5, n_events: Some(100), n_damaged: None, ..Default::default() }],
        detectors: vec![],
    });
    let mut second = ExperimentRecord::new("exp");
    second.run_table = Some(RunTable {
        data_production: vec![RunProduction { run_number: 5, n_events: None, n_damaged: Some(5), ..Default::default() }],
        detectors: vec![],
    });

    engine.apply(FetchOutcome::Fetched(Box::new(first))).unwrap();
    engine.apply(FetchOutcome::Fetched(Box::new(second))).unwrap();
    let (_tx, rx) = StagingChannel::new(1).split();
    engine.stop_flag().store(true, Ordering::SeqCst);
    engine.run(&rx).unwrap();

    let store = ElogStore::open(&path).unwrap();
    let (events, damaged): (Option<i64>, Option<i64>) = store
        .connection()
        .query_row(
            "SELECT n_events, n_damaged FROM RunCompleteData WHERE experiment_id = 'exp' AND run_number = 5",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!((events, damaged), (Some(100), Some(5)));
}

/// A finalized base snapshot in `dir` carrying one extra trigger.
fn base_with_trigger(dir: &Path, trigger_sql: &str) {
    let store = ElogStore::open(&dir.join("elog_2020_0101_0000.db")).unwrap();
    store.connection().execute_batch(trigger_sql).unwrap();
    store.finalize().unwrap();
}

#[test]
fn test_record_without_info_is_written() {
    let dir = tempfile::tempdir().unwrap();
    let mut no_info = full_record("exp_x");
    no_info.info = None;
    let source = FakeSource::new(vec![no_info]);

    let fresh = update(&source, dir.path(), BaseMode::Fresh, options(1, 10, false));
    assert_eq!(fresh.succeeded, 1);
    assert!(fresh.failed.is_empty());
    assert_eq!(count(&fresh.db_path, "experiment"), 0);
    assert_eq!(count(&fresh.db_path, "run"), 2);
    assert_eq!(count(&fresh.db_path, "logbook"), 2);

    let again = update(&source, dir.path(), BaseMode::Latest, options(1, 10, true));
    assert_eq!(again.succeeded, 1);
    assert!(again.failed.is_empty());
    assert_eq!(count(&again.db_path, "run"), 2);
    assert_eq!(count(&again.db_path, "logbook"), 2);
}

#[test]
fn test_lost_transaction_stops_the_writer() {
    let dir = tempfile::tempdir().unwrap();
    base_with_trigger(
        dir.path(),
        "CREATE TRIGGER abort_all BEFORE INSERT ON Experiment
         WHEN NEW.experiment_id = 'poison'
         BEGIN SELECT RAISE(ROLLBACK, 'whole transaction rolled back'); END;",
    );
    let path = dir.path().join("elog_2020_0101_0000.db");
    let store = ElogStore::open(&path).unwrap();
    store.enable_wal_mode().unwrap();
    let engine = MergeEngine::new(store, MergeOptions { incremental: true, batch_commit_size: 10, hours_lookback: 2.0 });

    let (tx, rx) = StagingChannel::new(8).split();
    for id in ["good_a", "good_b", "poison", "good_c"] {
        tx.send(StagedItem::Work(FetchOutcome::Fetched(Box::new(full_record(id))))).unwrap();
    }
    tx.send(StagedItem::Done).unwrap();

    let err = engine.run(&rx).unwrap_err();
    assert!(matches!(err, ElogError::TransactionLost(_)));
    assert!(err.is_fatal());

    // The uncommitted batch is gone and the writer did not go on to good_c.
    assert_eq!(count(&path, "experiment"), 0);
    let store = ElogStore::open(&path).unwrap();
    assert_eq!(store.get_metadata("hours_lookback").unwrap().as_deref(), Some("2"));
}

#[test]
fn test_writer_finalizes_before_reporting_closed_channel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("closed.db");
    let store = ElogStore::open(&path).unwrap();
    store.enable_wal_mode().unwrap();
    let engine = MergeEngine::new(store, MergeOptions { incremental: false, batch_commit_size: 10, hours_lookback: 6.0 });

    let (tx, rx) = StagingChannel::new(4).split();
    tx.send(StagedItem::Work(FetchOutcome::Fetched(Box::new(full_record("exp_a"))))).unwrap();
    drop(tx);

    let err = engine.run(&rx).unwrap_err();
    assert!(err.to_string().contains("completion marker"));

    let store = ElogStore::open(&path).unwrap();
    assert_eq!(store.journal_mode().unwrap().to_lowercase(), "delete");
    assert!(store.get_metadata("last_update").unwrap().is_some());
    assert_eq!(store.get_metadata("hours_lookback").unwrap().as_deref(), Some("6"));
    assert_eq!(count(&path, "experiment"), 1);
}

#[test]
fn test_fetch_single_commits_each_facet() {
    let dir = tempfile::tempdir().unwrap();
    base_with_trigger(
        dir.path(),
        "CREATE TRIGGER reject_workflow BEFORE INSERT ON Workflow
         BEGIN SELECT RAISE(ABORT, 'workflow rejected'); END;",
    );
    let source = FakeSource::new(vec![full_record("exp_a")]);

    let err = fetch_single(&source, "exp_a", dir.path()).unwrap_err();
    assert!(err.to_string().contains("workflow rejected"));

    let path = dir.path().join("elog_2020_0101_0000.db");
    assert_eq!(count(&path, "experiment"), 1);
    assert_eq!(count(&path, "logbook"), 2);
    assert_eq!(count(&path, "questionnaire"), 1);
    assert_eq!(count(&path, "workflow"), 0);
    let store = ElogStore::open(&path).unwrap();
    assert_eq!(store.journal_mode().unwrap().to_lowercase(), "delete");
}
