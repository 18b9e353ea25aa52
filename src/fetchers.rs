//! Endpoint calls and response-to-record transforms, one per facet.
//!
//! A facet that cannot be fetched because of an API error (or a response with
//! `success: false`) is reported as absent; authentication failures and other
//! errors propagate and fail the whole experiment.

use crate::client::JsonApi;
use crate::model::{
    ExperimentInfo, FileAggregate, LogEntry, Questionnaire, QuestionnaireField, RunDetectors,
    RunFiles, RunProduction, RunTable, WorkflowDefinition, Workflows,
};
use crate::run_inference::{sort_chronologically, ElogEntry, RunNumberResolver};
use crate::ElogError;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info, warn};

/// Run parameters with this prefix name a DAQ detector.
pub const DETECTOR_PREFIX: &str = "DAQ Detectors/";

static CONTACT_INFO: Lazy<Regex> = Lazy::new(|| Regex::new(r"(.*?)\s*\((.*?)\)").expect("static pattern"));
static LCLS_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{2})$").expect("static pattern"));

/// The six per-experiment fetches the pipeline workers perform.
pub trait ExperimentSource: Send + Sync {
    fn info(&self, experiment_id: &str) -> Result<Option<ExperimentInfo>, ElogError>;
    fn logbook(&self, experiment_id: &str) -> Result<Option<Vec<LogEntry>>, ElogError>;
    fn run_table(&self, experiment_id: &str) -> Result<Option<RunTable>, ElogError>;
    fn file_aggregate(&self, experiment_id: &str) -> Result<Option<FileAggregate>, ElogError>;
    fn questionnaire(&self, experiment_id: &str) -> Result<Option<Questionnaire>, ElogError>;
    fn workflow(&self, experiment_id: &str) -> Result<Option<Workflows>, ElogError>;
}

/// `ExperimentSource` backed by the elog web service.
pub struct ElogSource<A: JsonApi> {
    api: A,
}

impl<A: JsonApi> ElogSource<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    pub fn updated_experiments(&self, offset_secs: u64, exclude: &[String]) -> Result<Vec<String>, ElogError> {
        fetch_updated_experiments(&self.api, offset_secs, exclude)
    }
}

impl<A: JsonApi> ExperimentSource for ElogSource<A> {
    fn info(&self, experiment_id: &str) -> Result<Option<ExperimentInfo>, ElogError> {
        absent_on_api_error(experiment_id, "info", fetch_experiment_info(&self.api, experiment_id))
    }

    fn logbook(&self, experiment_id: &str) -> Result<Option<Vec<LogEntry>>, ElogError> {
        absent_on_api_error(experiment_id, "logbook", fetch_logbook(&self.api, experiment_id))
    }

    fn run_table(&self, experiment_id: &str) -> Result<Option<RunTable>, ElogError> {
        absent_on_api_error(experiment_id, "runtable", fetch_run_table(&self.api, experiment_id))
    }

    fn file_aggregate(&self, experiment_id: &str) -> Result<Option<FileAggregate>, ElogError> {
        absent_on_api_error(experiment_id, "file manager", fetch_file_aggregate(&self.api, experiment_id))
    }

    fn questionnaire(&self, experiment_id: &str) -> Result<Option<Questionnaire>, ElogError> {
        absent_on_api_error(experiment_id, "questionnaire", fetch_questionnaire(&self.api, experiment_id))
    }

    fn workflow(&self, experiment_id: &str) -> Result<Option<Workflows>, ElogError> {
        absent_on_api_error(experiment_id, "workflow", fetch_workflow(&self.api, experiment_id))
    }
}

fn absent_on_api_error<T>(
    experiment_id: &str,
    facet: &str,
    result: Result<Option<T>, ElogError>,
) -> Result<Option<T>, ElogError> {
    match result {
        Err(e @ ElogError::Api { .. }) => {
            error!(experiment = experiment_id, "failed to fetch {}: {}", facet, e);
            Ok(None)
        }
        other => other,
    }
}

fn experiment_ws(experiment_id: &str) -> String {
    format!("/ws-kerb/lgbk/lgbk/{}/ws", experiment_id)
}

fn succeeded(data: &Value) -> bool {
    data.get("success").and_then(Value::as_bool).unwrap_or(false)
}

/// A field rendered as text; structured values are stored as JSON.
fn text(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

fn int(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

fn value_list(data: &Value) -> &[Value] {
    data.get("value").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}

/// Experiment ids updated within the window, minus excluded patterns.
pub fn fetch_updated_experiments<A: JsonApi + ?Sized>(
    api: &A,
    offset_secs: u64,
    exclude: &[String],
) -> Result<Vec<String>, ElogError> {
    info!("fetching experiments updated in last {} seconds", offset_secs);
    let offset = offset_secs.to_string();
    let data = api.get_public(
        "/ws/lgbk/lgbk/ws/experiment_names_updated_within",
        &[("offset_secs", offset.as_str())],
    )?;

    let names = match &data {
        Value::Object(map) => map.get("value").and_then(Value::as_array).cloned(),
        Value::Array(list) => Some(list.clone()),
        _ => None,
    };
    let Some(names) = names else {
        error!("unexpected response format for updated experiments");
        return Ok(Vec::new());
    };

    let experiments: Vec<String> = names.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
    info!("found {} experiments", experiments.len());
    if exclude.is_empty() {
        return Ok(experiments);
    }
    filter_experiments(experiments, exclude)
}

/// Drop ids matching any shell-style pattern (`*`, `?`), case-insensitively.
pub fn filter_experiments(experiments: Vec<String>, patterns: &[String]) -> Result<Vec<String>, ElogError> {
    let compiled = patterns
        .iter()
        .map(|p| {
            let body = regex::escape(p).replace(r"\*", ".*").replace(r"\?", ".");
            Regex::new(&format!("(?i)^{}$", body))
                .map_err(|e| ElogError::Config(format!("invalid exclude pattern {}: {}", p, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let before = experiments.len();
    let kept: Vec<String> = experiments
        .into_iter()
        .filter(|exp| !compiled.iter().any(|re| re.is_match(exp)))
        .collect();
    if kept.len() < before {
        info!("excluded {} experiments by patterns {:?}", before - kept.len(), patterns);
    }
    Ok(kept)
}

/// Split `"Name (email)"` into name and email.
pub fn parse_contact_info(contact_info: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(contact) = contact_info.filter(|c| !c.is_empty()) else {
        return (None, None);
    };
    match CONTACT_INFO.captures(contact) {
        Some(caps) => (
            Some(caps[1].trim().to_string()),
            Some(caps[2].trim().to_string()),
        ),
        None => (Some(contact.trim().to_string()), None),
    }
}

pub fn fetch_experiment_info<A: JsonApi + ?Sized>(api: &A, experiment_id: &str) -> Result<Option<ExperimentInfo>, ElogError> {
    let data = api.get(&format!("{}/info", experiment_ws(experiment_id)), &[], true)?;
    if !succeeded(&data) {
        error!(experiment = experiment_id, "API returned success=false for info");
        return Ok(None);
    }
    match data.get("value") {
        Some(raw) if truthy(Some(raw)) => Ok(Some(transform_info(experiment_id, raw))),
        _ => {
            error!(experiment = experiment_id, "no value in info response");
            Ok(None)
        }
    }
}

pub fn transform_info(experiment_id: &str, raw: &Value) -> ExperimentInfo {
    let contact = text(raw, "contact_info");
    let (pi, pi_email) = parse_contact_info(contact.as_deref());
    let params = raw.get("params").cloned().unwrap_or(Value::Null);

    ExperimentInfo {
        experiment_id: text(raw, "_id").filter(|s| !s.is_empty()).unwrap_or_else(|| experiment_id.to_string()),
        name: text(raw, "name"),
        instrument: text(raw, "instrument"),
        start_time: text(raw, "start_time"),
        end_time: text(raw, "end_time"),
        pi,
        pi_email,
        leader_account: text(raw, "leader_account"),
        description: text(raw, "description"),
        slack_channels: text(&params, "slack_channels"),
        analysis_queues: text(&params, "analysis_queues"),
        urawi_proposal: text(&params, "PNR"),
    }
}

pub fn fetch_logbook<A: JsonApi + ?Sized>(api: &A, experiment_id: &str) -> Result<Option<Vec<LogEntry>>, ElogError> {
    let data = api.get(&format!("{}/elog", experiment_ws(experiment_id)), &[], true)?;
    if !succeeded(&data) {
        error!(experiment = experiment_id, "API returned success=false for logbook");
        return Ok(None);
    }
    let raw = value_list(&data);
    info!(experiment = experiment_id, "fetched {} logbook entries", raw.len());
    Ok(Some(transform_logbook(experiment_id, raw, &RunNumberResolver::default())))
}

fn elog_entry(raw: &Value) -> ElogEntry {
    let tags = raw
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| tags.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    ElogEntry {
        id: text(raw, "_id"),
        insert_time: text(raw, "insert_time").unwrap_or_default(),
        run_num: int(raw, "run_num"),
        content: text(raw, "content"),
        tags,
        author: text(raw, "author"),
    }
}

/// Sort by time, attribute run numbers, and flatten tags.
pub fn transform_logbook(experiment_id: &str, raw: &[Value], resolver: &RunNumberResolver) -> Vec<LogEntry> {
    let mut entries: Vec<ElogEntry> = raw.iter().map(elog_entry).collect();
    sort_chronologically(&mut entries);
    let runs = resolver.resolve(&entries);

    entries
        .into_iter()
        .zip(runs)
        .map(|(entry, run_number)| LogEntry {
            log_id: entry.id,
            experiment_id: experiment_id.to_string(),
            run_number,
            timestamp: entry.insert_time,
            content: entry.content,
            tags: if entry.tags.is_empty() { None } else { Some(entry.tags.iter().join(",")) },
            author: entry.author,
        })
        .collect()
}

/// `2024-01-01T10:00:00+00:00` -> `2024-01-01 10:00:00`
pub fn format_run_time(time: Option<String>) -> Option<String> {
    let time = time.filter(|t| !t.is_empty())?;
    let replaced = time.replace('T', " ");
    Some(replaced.split('+').next().unwrap_or("").to_string())
}

pub fn fetch_run_table<A: JsonApi + ?Sized>(api: &A, experiment_id: &str) -> Result<Option<RunTable>, ElogError> {
    let base = experiment_ws(experiment_id);
    let runs_data = api.get(&format!("{}/runs", base), &[("includeParams", "false")], true)?;
    let runs = value_list(&runs_data);
    if runs.is_empty() {
        warn!(experiment = experiment_id, "no runs found");
        return Ok(None);
    }
    info!(experiment = experiment_id, "found {} runs", runs.len());

    let mut details: Vec<(i64, Value)> = Vec::new();
    let mut detector_keys = BTreeSet::new();
    for run in runs {
        let Some(run_num) = int(run, "num") else { continue };
        match api.get(&format!("{}/runs/{}", base, run_num), &[("includeParams", "true")], true) {
            Ok(detail) => {
                let detail = detail.get("value").cloned().unwrap_or(Value::Null);
                if let Some(params) = detail.get("params").and_then(Value::as_object) {
                    detector_keys.extend(params.keys().filter(|k| k.starts_with(DETECTOR_PREFIX)).cloned());
                }
                details.push((run_num, detail));
            }
            Err(e @ ElogError::Api { .. }) => {
                warn!(experiment = experiment_id, "failed to fetch run {} details: {}", run_num, e);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(Some(build_run_table(&details, &detector_keys)))
}

/// Production counts and detector check-states for each fetched run.
pub fn build_run_table(details: &[(i64, Value)], detector_keys: &BTreeSet<String>) -> RunTable {
    let mut table = RunTable::default();
    for (run_number, detail) in details {
        let params = detail.get("params").cloned().unwrap_or(Value::Null);
        table.data_production.push(RunProduction {
            run_number: *run_number,
            start_time: format_run_time(text(detail, "begin_time")),
            end_time: format_run_time(text(detail, "end_time")),
            n_events: int(&params, "DAQ Detector Totals/Events"),
            n_damaged: int(&params, "DAQ Detector Totals/Damaged"),
            n_dropped: int(&params, "N dropped Shots"),
            prod_start: text(&params, "Prod_start"),
            prod_end: text(&params, "Prod_end"),
        });

        let statuses: BTreeMap<String, String> = detector_keys
            .iter()
            .map(|key| {
                let status = if truthy(params.get(key)) { "Checked" } else { "Unchecked" };
                (key.clone(), status.to_string())
            })
            .collect();
        table.detectors.push(RunDetectors { run_number: *run_number, statuses });
    }
    table
}

pub fn fetch_file_aggregate<A: JsonApi + ?Sized>(api: &A, experiment_id: &str) -> Result<Option<FileAggregate>, ElogError> {
    let data = api.get(&format!("{}/files", experiment_ws(experiment_id)), &[], true)?;
    if !succeeded(&data) {
        error!(experiment = experiment_id, "API returned success=false for files");
        return Ok(None);
    }
    let files = value_list(&data);
    info!(experiment = experiment_id, "fetched {} files", files.len());
    Ok(Some(aggregate_files(files)))
}

/// File count and summed size per run; files without a run are ignored.
pub fn aggregate_files(files: &[Value]) -> FileAggregate {
    let mut per_run: BTreeMap<i64, (i64, i64)> = BTreeMap::new();
    for file in files {
        let Some(run_num) = int(file, "run_num") else { continue };
        let size = int(file, "size").unwrap_or(0);
        let slot = per_run.entry(run_num).or_insert((0, 0));
        slot.0 += 1;
        slot.1 += size;
    }
    FileAggregate {
        records: per_run
            .into_iter()
            .map(|(run_number, (count, size))| RunFiles {
                run_number,
                number_of_files: Some(count),
                total_size_bytes: Some(size),
            })
            .collect(),
    }
}

/// Last two digits of the experiment id, e.g. `tmol1039623` -> `23`.
pub fn extract_lcls_run(experiment_id: &str) -> Option<String> {
    LCLS_RUN.captures(experiment_id).map(|c| c[1].to_string())
}

pub fn fetch_questionnaire<A: JsonApi + ?Sized>(api: &A, experiment_id: &str) -> Result<Option<Questionnaire>, ElogError> {
    let info = api.get(&format!("{}/info", experiment_ws(experiment_id)), &[], true)?;
    if !succeeded(&info) {
        error!(experiment = experiment_id, "failed to get info for questionnaire");
        return Ok(None);
    }
    let params = info.get("value").and_then(|v| v.get("params")).cloned().unwrap_or(Value::Null);
    let Some(proposal) = text(&params, "PNR").filter(|p| !p.is_empty()) else {
        warn!(experiment = experiment_id, "no proposal number (PNR) found");
        return Ok(None);
    };
    let Some(lcls_run) = extract_lcls_run(experiment_id) else {
        warn!(experiment = experiment_id, "could not extract LCLS run");
        return Ok(None);
    };

    let endpoint = format!("/ws-kerb/questionnaire/ws/proposal/attribute/run{}/{}", lcls_run, proposal);
    let data = api.get(&endpoint, &[], true)?;
    let fields = parse_questionnaire_fields(&data);
    info!(experiment = experiment_id, "fetched {} questionnaire fields", fields.len());

    Ok(Some(Questionnaire { proposal: Some(proposal), fields }))
}

/// Flatten `{category: [{id, val, ...}]}` into fields; non-list categories
/// and entries without an id are skipped.
pub fn parse_questionnaire_fields(data: &Value) -> Vec<QuestionnaireField> {
    let Some(categories) = data.as_object() else {
        return Vec::new();
    };
    let mut fields = Vec::new();
    for (category, entries) in categories {
        let Some(entries) = entries.as_array() else { continue };
        for entry in entries.iter().filter(|e| e.is_object()) {
            let Some(field_id) = text(entry, "id").filter(|id| !id.is_empty()) else { continue };
            let field_name = field_id.replace(&format!("{}-", category), "");
            fields.push(QuestionnaireField {
                category: category.clone(),
                field_name: Some(field_name),
                field_id,
                field_value: text(entry, "val"),
                modified_time: text(entry, "modified_time"),
                modified_uid: text(entry, "modified_uid"),
            });
        }
    }
    fields
}

pub fn fetch_workflow<A: JsonApi + ?Sized>(api: &A, experiment_id: &str) -> Result<Option<Workflows>, ElogError> {
    let data = api.get(&format!("{}/workflow_definitions", experiment_ws(experiment_id)), &[], true)?;
    if !succeeded(&data) {
        error!(experiment = experiment_id, "API returned success=false for workflow");
        return Ok(None);
    }
    let raw = value_list(&data);
    info!(experiment = experiment_id, "fetched {} workflows", raw.len());
    Ok(Some(Workflows { workflows: raw.iter().map(transform_workflow).collect() }))
}

pub fn transform_workflow(raw: &Value) -> WorkflowDefinition {
    WorkflowDefinition {
        mongo_id: text(raw, "_id"),
        name: text(raw, "name").unwrap_or_default(),
        executable: text(raw, "executable"),
        trigger: text(raw, "trigger"),
        location: text(raw, "location"),
        parameters: raw.get("parameters").cloned().unwrap_or(Value::Null),
        run_param_name: text(raw, "run_param_name"),
        run_param_value: text(raw, "run_param_value"),
        run_as_user: text(raw, "run_as_user"),
    }
}
