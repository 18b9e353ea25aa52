use crate::model::{
    ExperimentInfo, ExperimentRecord, FileAggregate, LogEntry, Questionnaire, RunTable, Workflows,
};
use crate::ElogError;
use rusqlite::{params, Connection, OptionalExtension};
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS Experiment (
    experiment_id TEXT PRIMARY KEY,
    name TEXT,
    instrument TEXT,
    start_time DATETIME,
    end_time DATETIME,
    pi TEXT,
    pi_email TEXT,
    leader_account TEXT,
    description TEXT,
    slack_channels TEXT,
    analysis_queues TEXT,
    urawi_proposal TEXT
);

CREATE TABLE IF NOT EXISTS Questionnaire (
    questionnaire_id INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_id TEXT NOT NULL,
    proposal TEXT,
    category TEXT NOT NULL,
    field_id TEXT NOT NULL,
    field_name TEXT,
    field_value TEXT,
    modified_time DATETIME,
    modified_uid TEXT,
    created_time DATETIME DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(experiment_id, field_id),
    FOREIGN KEY (experiment_id) REFERENCES Experiment(experiment_id)
);

CREATE TABLE IF NOT EXISTS Workflow (
    workflow_id INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_id TEXT NOT NULL,
    mongo_id TEXT,
    name TEXT NOT NULL,
    executable TEXT,
    trigger TEXT,
    location TEXT,
    parameters TEXT,
    run_param_name TEXT,
    run_param_value TEXT,
    run_as_user TEXT,
    FOREIGN KEY (experiment_id) REFERENCES Experiment(experiment_id)
);

CREATE TABLE IF NOT EXISTS Run (
    run_id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_number INTEGER NOT NULL,
    experiment_id TEXT NOT NULL,
    start_time DATETIME,
    end_time DATETIME,
    UNIQUE(run_number, experiment_id),
    FOREIGN KEY (experiment_id) REFERENCES Experiment(experiment_id)
);

CREATE TABLE IF NOT EXISTS RunProductionData (
    run_data_id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL,
    n_events INTEGER,
    n_damaged INTEGER,
    n_dropped INTEGER,
    prod_start DATETIME,
    prod_end DATETIME,
    number_of_files INTEGER,
    total_size_bytes INTEGER,
    FOREIGN KEY (run_id) REFERENCES Run(run_id)
);

CREATE TABLE IF NOT EXISTS Detector (
    detector_id INTEGER PRIMARY KEY AUTOINCREMENT,
    detector_name TEXT NOT NULL,
    description TEXT,
    UNIQUE(detector_name)
);

CREATE TABLE IF NOT EXISTS RunDetector (
    run_detector_id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL,
    detector_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    UNIQUE(run_id, detector_id),
    FOREIGN KEY (run_id) REFERENCES Run(run_id),
    FOREIGN KEY (detector_id) REFERENCES Detector(detector_id)
);

CREATE TABLE IF NOT EXISTS Logbook (
    log_id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_log_id TEXT,
    experiment_id TEXT NOT NULL,
    run_id INTEGER,
    timestamp DATETIME NOT NULL,
    content TEXT,
    tags TEXT,
    author TEXT,
    FOREIGN KEY (experiment_id) REFERENCES Experiment(experiment_id),
    FOREIGN KEY (run_id) REFERENCES Run(run_id)
);

CREATE TABLE IF NOT EXISTS Metadata (
    key TEXT PRIMARY KEY,
    value TEXT
);

CREATE INDEX IF NOT EXISTS idx_questionnaire_experiment ON Questionnaire(experiment_id);
CREATE INDEX IF NOT EXISTS idx_questionnaire_category ON Questionnaire(category);
CREATE INDEX IF NOT EXISTS idx_questionnaire_proposal ON Questionnaire(proposal);
CREATE INDEX IF NOT EXISTS idx_run_experiment ON Run(experiment_id);
CREATE INDEX IF NOT EXISTS idx_logbook_experiment ON Logbook(experiment_id);
CREATE INDEX IF NOT EXISTS idx_logbook_run ON Logbook(run_id);

CREATE VIEW IF NOT EXISTS RunCompleteData AS
SELECT
    r.run_id,
    r.run_number,
    r.experiment_id,
    r.start_time,
    r.end_time,
    rpd.n_events,
    rpd.n_damaged,
    rpd.n_dropped,
    rpd.prod_start,
    rpd.prod_end,
    rpd.number_of_files,
    rpd.total_size_bytes
FROM Run r
LEFT JOIN RunProductionData rpd ON r.run_id = rpd.run_id;
"#;

/// Tables reported by `stats`, in display order.
pub const STAT_TABLES: [&str; 5] = ["Experiment", "Run", "Logbook", "Questionnaire", "Workflow"];

const EXPERIMENT_SAVEPOINT: &str = "experiment_write";

/// Relational snapshot of the elog. Owns the only write connection for a run;
/// writes open a transaction implicitly and stay uncommitted until `commit`.
pub struct ElogStore {
    conn: Connection,
    path: PathBuf,
    run_ids: FxHashMap<(String, i64), i64>,
    detector_ids: FxHashMap<String, i64>,
}

impl ElogStore {
    pub fn open(path: &Path) -> Result<Self, ElogError> {
        let conn = Connection::open(path)?;
        // Bundled builds enforce foreign keys by default. Ownership is kept by
        // deletion order, and a run may be referenced before its experiment row exists.
        conn.execute_batch("PRAGMA foreign_keys=OFF;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            run_ids: FxHashMap::default(),
            detector_ids: FxHashMap::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read access for queries outside the write API.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// WAL keeps readers unblocked while the writer batches commits.
    pub fn enable_wal_mode(&self) -> Result<(), ElogError> {
        let mode: String = self.conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        self.conn.execute_batch("PRAGMA synchronous=NORMAL; PRAGMA cache_size=-64000;")?;
        debug!(journal_mode = %mode, "enabled write-ahead logging");
        Ok(())
    }

    pub fn journal_mode(&self) -> Result<String, ElogError> {
        Ok(self.conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?)
    }

    fn ensure_transaction(&mut self) -> Result<(), ElogError> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    /// Make every pending write durable. A no-op when nothing is pending.
    pub fn commit(&mut self) -> Result<(), ElogError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    /// Discard every pending write.
    pub fn rollback(&mut self) -> Result<(), ElogError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        self.run_ids.clear();
        self.detector_ids.clear();
        Ok(())
    }

    /// Run `write` inside a savepoint so a failure leaves no partial rows for
    /// this experiment while earlier, uncommitted experiments survive.
    ///
    /// If SQLite rolled back the whole transaction (disk full, I/O error,
    /// `RAISE(ROLLBACK)`), the uncommitted batch is gone and
    /// `ElogError::TransactionLost` is returned instead of the write error.
    pub fn isolated<T>(
        &mut self,
        experiment_id: &str,
        write: impl FnOnce(&mut Self) -> Result<T, ElogError>,
    ) -> Result<T, ElogError> {
        self.ensure_transaction()?;
        self.conn.execute_batch(&format!("SAVEPOINT {}", EXPERIMENT_SAVEPOINT))?;
        match write(self) {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {}", EXPERIMENT_SAVEPOINT))?;
                Ok(value)
            }
            Err(err) => {
                if self.conn.is_autocommit() {
                    self.run_ids.clear();
                    self.detector_ids.clear();
                    return Err(ElogError::TransactionLost(format!(
                        "uncommitted batch discarded while writing {}: {}",
                        experiment_id, err
                    )));
                }
                self.conn.execute_batch(&format!(
                    "ROLLBACK TO {sp}; RELEASE {sp};",
                    sp = EXPERIMENT_SAVEPOINT
                ))?;
                // Ids handed out inside the savepoint no longer exist.
                self.forget_experiment(experiment_id);
                self.detector_ids.clear();
                Err(err)
            }
        }
    }

    fn forget_experiment(&mut self, experiment_id: &str) {
        self.run_ids.retain(|(exp, _), _| exp != experiment_id);
    }

    /// Look up the run, creating it on first reference.
    pub fn run_id(&mut self, experiment_id: &str, run_number: i64) -> Result<i64, ElogError> {
        let key = (experiment_id.to_string(), run_number);
        if let Some(id) = self.run_ids.get(&key) {
            return Ok(*id);
        }
        self.ensure_transaction()?;

        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT run_id FROM Run WHERE experiment_id = ?1 AND run_number = ?2",
                params![experiment_id, run_number],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => id,
            None => {
                self.conn.execute(
                    "INSERT INTO Run (experiment_id, run_number) VALUES (?1, ?2)",
                    params![experiment_id, run_number],
                )?;
                self.conn.last_insert_rowid()
            }
        };
        self.run_ids.insert(key, id);
        Ok(id)
    }

    pub fn detector_id(&mut self, detector_name: &str) -> Result<i64, ElogError> {
        if let Some(id) = self.detector_ids.get(detector_name) {
            return Ok(*id);
        }
        self.ensure_transaction()?;

        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT detector_id FROM Detector WHERE detector_name = ?1",
                params![detector_name],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => id,
            None => {
                self.conn.execute(
                    "INSERT INTO Detector (detector_name) VALUES (?1)",
                    params![detector_name],
                )?;
                self.conn.last_insert_rowid()
            }
        };
        self.detector_ids.insert(detector_name.to_string(), id);
        Ok(id)
    }

    pub fn upsert_experiment(&mut self, info: &ExperimentInfo) -> Result<(), ElogError> {
        self.ensure_transaction()?;
        self.conn.execute(
            "INSERT OR REPLACE INTO Experiment
             (experiment_id, name, instrument, start_time, end_time, pi, pi_email,
              leader_account, description, slack_channels, analysis_queues, urawi_proposal)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                info.experiment_id,
                info.name,
                info.instrument,
                info.start_time,
                info.end_time,
                info.pi,
                info.pi_email,
                info.leader_account,
                info.description,
                info.slack_channels,
                info.analysis_queues,
                info.urawi_proposal,
            ],
        )?;
        debug!(experiment = %info.experiment_id, "upserted experiment");
        Ok(())
    }

    /// Replace every logbook row of the experiment with `entries`.
    pub fn replace_logbook(&mut self, experiment_id: &str, entries: &[LogEntry]) -> Result<(), ElogError> {
        self.ensure_transaction()?;
        self.conn.execute("DELETE FROM Logbook WHERE experiment_id = ?1", params![experiment_id])?;

        for entry in entries {
            let run_id = match entry.run_number {
                Some(run_number) => Some(self.run_id(&entry.experiment_id, run_number)?),
                None => None,
            };
            self.conn.execute(
                "INSERT INTO Logbook
                 (source_log_id, experiment_id, run_id, timestamp, content, tags, author)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.log_id,
                    entry.experiment_id,
                    run_id,
                    entry.timestamp,
                    entry.content,
                    entry.tags,
                    entry.author,
                ],
            )?;
        }
        debug!(experiment = %experiment_id, entries = entries.len(), "replaced logbook");
        Ok(())
    }

    fn production_row_exists(&self, run_id: i64) -> Result<bool, ElogError> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT run_data_id FROM RunProductionData WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(existing.is_some())
    }

    /// Run times are overwritten; production counts only fill in (a null never
    /// replaces a known value).
    pub fn merge_run_table(&mut self, experiment_id: &str, table: &RunTable) -> Result<(), ElogError> {
        self.ensure_transaction()?;

        for run in &table.data_production {
            let run_id = self.run_id(experiment_id, run.run_number)?;
            self.conn.execute(
                "UPDATE Run SET start_time = ?1, end_time = ?2 WHERE run_id = ?3",
                params![run.start_time, run.end_time, run_id],
            )?;

            if self.production_row_exists(run_id)? {
                self.conn.execute(
                    "UPDATE RunProductionData
                     SET n_events = COALESCE(?1, n_events),
                         n_damaged = COALESCE(?2, n_damaged),
                         n_dropped = COALESCE(?3, n_dropped),
                         prod_start = COALESCE(?4, prod_start),
                         prod_end = COALESCE(?5, prod_end)
                     WHERE run_id = ?6",
                    params![run.n_events, run.n_damaged, run.n_dropped, run.prod_start, run.prod_end, run_id],
                )?;
            } else {
                self.conn.execute(
                    "INSERT INTO RunProductionData
                     (run_id, n_events, n_damaged, n_dropped, prod_start, prod_end)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![run_id, run.n_events, run.n_damaged, run.n_dropped, run.prod_start, run.prod_end],
                )?;
            }
        }

        for detectors in &table.detectors {
            let run_id = self.run_id(experiment_id, detectors.run_number)?;
            for (name, status) in &detectors.statuses {
                if name.trim().is_empty() {
                    continue;
                }
                let detector_id = self.detector_id(name)?;
                self.conn.execute(
                    "INSERT OR REPLACE INTO RunDetector (run_id, detector_id, status) VALUES (?1, ?2, ?3)",
                    params![run_id, detector_id, status],
                )?;
            }
        }
        debug!(experiment = %experiment_id, runs = table.data_production.len(), "merged run table");
        Ok(())
    }

    pub fn merge_file_aggregate(&mut self, experiment_id: &str, files: &FileAggregate) -> Result<(), ElogError> {
        self.ensure_transaction()?;

        for record in &files.records {
            let run_id = self.run_id(experiment_id, record.run_number)?;
            if self.production_row_exists(run_id)? {
                self.conn.execute(
                    "UPDATE RunProductionData
                     SET number_of_files = COALESCE(?1, number_of_files),
                         total_size_bytes = COALESCE(?2, total_size_bytes)
                     WHERE run_id = ?3",
                    params![record.number_of_files, record.total_size_bytes, run_id],
                )?;
            } else {
                self.conn.execute(
                    "INSERT INTO RunProductionData (run_id, number_of_files, total_size_bytes)
                     VALUES (?1, ?2, ?3)",
                    params![run_id, record.number_of_files, record.total_size_bytes],
                )?;
            }
        }
        debug!(experiment = %experiment_id, runs = files.records.len(), "merged file aggregate");
        Ok(())
    }

    pub fn replace_questionnaire(&mut self, experiment_id: &str, questionnaire: &Questionnaire) -> Result<(), ElogError> {
        self.ensure_transaction()?;
        self.conn.execute("DELETE FROM Questionnaire WHERE experiment_id = ?1", params![experiment_id])?;

        for field in &questionnaire.fields {
            self.conn.execute(
                "INSERT OR REPLACE INTO Questionnaire
                 (experiment_id, proposal, category, field_id, field_name,
                  field_value, modified_time, modified_uid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    experiment_id,
                    questionnaire.proposal,
                    field.category,
                    field.field_id,
                    field.field_name,
                    field.field_value,
                    field.modified_time,
                    field.modified_uid,
                ],
            )?;
        }
        debug!(experiment = %experiment_id, fields = questionnaire.fields.len(), "replaced questionnaire");
        Ok(())
    }

    pub fn replace_workflows(&mut self, experiment_id: &str, workflows: &Workflows) -> Result<(), ElogError> {
        self.ensure_transaction()?;
        self.conn.execute("DELETE FROM Workflow WHERE experiment_id = ?1", params![experiment_id])?;

        for workflow in &workflows.workflows {
            let parameters = serde_json::to_string(&workflow.parameters)?;
            self.conn.execute(
                "INSERT INTO Workflow
                 (experiment_id, mongo_id, name, executable, trigger, location,
                  parameters, run_param_name, run_param_value, run_as_user)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    experiment_id,
                    workflow.mongo_id,
                    workflow.name,
                    workflow.executable,
                    workflow.trigger,
                    workflow.location,
                    parameters,
                    workflow.run_param_name,
                    workflow.run_param_value,
                    workflow.run_as_user,
                ],
            )?;
        }
        debug!(experiment = %experiment_id, workflows = workflows.workflows.len(), "replaced workflows");
        Ok(())
    }

    /// Write every facet present in the record. Empty logbooks are skipped.
    pub fn insert_record(&mut self, record: &ExperimentRecord) -> Result<(), ElogError> {
        self.insert_record_with(record, |_| Ok(()))
    }

    /// Like `insert_record`, calling `after_facet` once each written facet
    /// is in place.
    pub fn insert_record_with(
        &mut self,
        record: &ExperimentRecord,
        mut after_facet: impl FnMut(&mut Self) -> Result<(), ElogError>,
    ) -> Result<(), ElogError> {
        let experiment_id = record.experiment_id.as_str();
        if let Some(info) = &record.info {
            self.upsert_experiment(info)?;
            after_facet(self)?;
        }
        if let Some(entries) = record.logbook.as_deref().filter(|e| !e.is_empty()) {
            self.replace_logbook(experiment_id, entries)?;
            after_facet(self)?;
        }
        if let Some(table) = &record.run_table {
            self.merge_run_table(experiment_id, table)?;
            after_facet(self)?;
        }
        if let Some(files) = &record.file_aggregate {
            self.merge_file_aggregate(experiment_id, files)?;
            after_facet(self)?;
        }
        if let Some(questionnaire) = &record.questionnaire {
            self.replace_questionnaire(experiment_id, questionnaire)?;
            after_facet(self)?;
        }
        if let Some(workflows) = &record.workflow {
            self.replace_workflows(experiment_id, workflows)?;
            after_facet(self)?;
        }
        Ok(())
    }

    /// Remove the experiment's whole entity graph, dependents first.
    pub fn delete_experiment(&mut self, experiment_id: &str) -> Result<(), ElogError> {
        self.ensure_transaction()?;
        self.conn.execute(
            "DELETE FROM RunDetector WHERE run_id IN (SELECT run_id FROM Run WHERE experiment_id = ?1)",
            params![experiment_id],
        )?;
        self.conn.execute(
            "DELETE FROM RunProductionData WHERE run_id IN (SELECT run_id FROM Run WHERE experiment_id = ?1)",
            params![experiment_id],
        )?;
        for table in ["Logbook", "Run", "Questionnaire", "Workflow", "Experiment"] {
            self.conn.execute(
                &format!("DELETE FROM {} WHERE experiment_id = ?1", table),
                params![experiment_id],
            )?;
        }
        self.forget_experiment(experiment_id);
        debug!(experiment = %experiment_id, "deleted experiment graph");
        Ok(())
    }

    pub fn set_metadata(&mut self, key: &str, value: &str) -> Result<(), ElogError> {
        self.ensure_transaction()?;
        self.conn.execute(
            "INSERT OR REPLACE INTO Metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>, ElogError> {
        Ok(self
            .conn
            .query_row("SELECT value FROM Metadata WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?)
    }

    /// Row counts for the main tables, keyed by lower-case table name.
    pub fn stats(&self) -> Result<Vec<(String, i64)>, ElogError> {
        STAT_TABLES
            .iter()
            .map(|table| {
                let count: i64 = self
                    .conn
                    .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
                Ok((table.to_lowercase(), count))
            })
            .collect()
    }

    /// Fold the write-ahead log back into the main file.
    pub fn checkpoint(&self) -> Result<(), ElogError> {
        self.conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    /// Commit anything pending, checkpoint, and switch back to a rollback
    /// journal so the file can be read without companion -wal/-shm files.
    pub fn finalize(mut self) -> Result<PathBuf, ElogError> {
        self.commit()?;
        self.checkpoint()?;
        let mode: String = self.conn.query_row("PRAGMA journal_mode=DELETE", [], |row| row.get(0))?;
        debug!(journal_mode = %mode, path = %self.path.display(), "finalized store");
        let path = self.path.clone();
        self.conn.close().map_err(|(_, err)| ElogError::from(err))?;
        Ok(path)
    }
}
