use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Experiment row, replaced wholesale on every fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentInfo {
    pub experiment_id: String,
    pub name: Option<String>,
    pub instrument: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub pi: Option<String>,
    pub pi_email: Option<String>,
    pub leader_account: Option<String>,
    pub description: Option<String>,
    pub slack_channels: Option<String>,
    pub analysis_queues: Option<String>,
    pub urawi_proposal: Option<String>,
}

/// A logbook entry with its run number already resolved (explicit or inferred).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub log_id: Option<String>,
    pub experiment_id: String,
    pub run_number: Option<i64>,
    pub timestamp: String,
    pub content: Option<String>,
    pub tags: Option<String>,
    pub author: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunProduction {
    pub run_number: i64,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub n_events: Option<i64>,
    pub n_damaged: Option<i64>,
    pub n_dropped: Option<i64>,
    pub prod_start: Option<String>,
    pub prod_end: Option<String>,
}

/// Detector name -> status for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDetectors {
    pub run_number: i64,
    pub statuses: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTable {
    pub data_production: Vec<RunProduction>,
    pub detectors: Vec<RunDetectors>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFiles {
    pub run_number: i64,
    pub number_of_files: Option<i64>,
    pub total_size_bytes: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileAggregate {
    pub records: Vec<RunFiles>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestionnaireField {
    pub category: String,
    pub field_id: String,
    pub field_name: Option<String>,
    pub field_value: Option<String>,
    pub modified_time: Option<String>,
    pub modified_uid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Questionnaire {
    pub proposal: Option<String>,
    pub fields: Vec<QuestionnaireField>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub mongo_id: Option<String>,
    pub name: String,
    pub executable: Option<String>,
    pub trigger: Option<String>,
    pub location: Option<String>,
    pub parameters: serde_json::Value,
    pub run_param_name: Option<String>,
    pub run_param_value: Option<String>,
    pub run_as_user: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflows {
    pub workflows: Vec<WorkflowDefinition>,
}

/// Every facet fetched for one experiment. A missing facet means there is
/// nothing to write for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub experiment_id: String,
    pub info: Option<ExperimentInfo>,
    pub logbook: Option<Vec<LogEntry>>,
    pub run_table: Option<RunTable>,
    pub file_aggregate: Option<FileAggregate>,
    pub questionnaire: Option<Questionnaire>,
    pub workflow: Option<Workflows>,
}

impl ExperimentRecord {
    pub fn new(experiment_id: &str) -> Self {
        Self { experiment_id: experiment_id.to_string(), ..Default::default() }
    }
}

/// What a fetch worker hands to the writer for one experiment.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fetched(Box<ExperimentRecord>),
    Failed { experiment_id: String, error: String },
}

impl FetchOutcome {
    pub fn experiment_id(&self) -> &str {
        match self {
            FetchOutcome::Fetched(record) => &record.experiment_id,
            FetchOutcome::Failed { experiment_id, .. } => experiment_id,
        }
    }
}

/// One entry of the failure sideband (`failed_experiments.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedExperiment {
    pub experiment_id: String,
    pub error: String,
    pub timestamp: String,
}

impl FailedExperiment {
    pub fn now(experiment_id: &str, error: &str) -> Self {
        Self {
            experiment_id: experiment_id.to_string(),
            error: error.to_string(),
            timestamp: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_experiment_id() {
        let ok = FetchOutcome::Fetched(Box::new(ExperimentRecord::new("mfxl1001021")));
        let failed = FetchOutcome::Failed { experiment_id: "xppx1003221".into(), error: "boom".into() };
        assert_eq!(ok.experiment_id(), "mfxl1001021");
        assert_eq!(failed.experiment_id(), "xppx1003221");
    }

    #[test]
    fn test_failed_experiment_json_shape() {
        let failed = FailedExperiment::now("cxil1005322", "API error: timeout");
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["experiment_id"], "cxil1005322");
        assert_eq!(value["error"], "API error: timeout");
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }
}
