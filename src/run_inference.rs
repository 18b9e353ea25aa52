//! Run-number attribution for logbook entries.
//!
//! Entries that carry a run number (or announce one in their text) become
//! boundary points on the experiment timeline; every other entry is assigned
//! the run of the latest boundary at or before its timestamp.

use std::collections::BTreeMap;
use std::ops::Bound;

/// A logbook entry as delivered by the elog service, before attribution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElogEntry {
    pub id: Option<String>,
    pub insert_time: String,
    pub run_num: Option<i64>,
    pub content: Option<String>,
    pub tags: Vec<String>,
    pub author: Option<String>,
}

/// Timestamp -> run number, ordered by timestamp.
pub type Boundaries = BTreeMap<String, i64>;

/// Something that can recognise a run boundary in a single entry.
pub trait BoundarySource: Send + Sync {
    fn boundary(&self, entry: &ElogEntry) -> Option<i64>;
}

/// The run number the service attached to the entry.
pub struct ExplicitRunNumber;

impl BoundarySource for ExplicitRunNumber {
    fn boundary(&self, entry: &ElogEntry) -> Option<i64> {
        entry.run_num
    }
}

/// DAQ narrative such as "Running run number 42: ...".
pub struct NarrativeRunNumber;

impl BoundarySource for NarrativeRunNumber {
    fn boundary(&self, entry: &ElogEntry) -> Option<i64> {
        parse_narrative_run(entry.content.as_deref()?)
    }
}

/// Parse the token after "number" in the text before the first colon.
/// Requires both "run number" and "running" to appear (case-insensitive).
pub fn parse_narrative_run(content: &str) -> Option<i64> {
    let lower = content.to_lowercase();
    if !(lower.contains("run number") && lower.contains("running")) {
        return None;
    }
    let head = lower.split(':').next().unwrap_or("");
    let parts: Vec<&str> = head.split_whitespace().collect();
    let idx = parts.iter().position(|p| *p == "number")?;
    parts.get(idx + 1)?.parse::<i64>().ok()
}

pub struct RunNumberResolver {
    sources: Vec<Box<dyn BoundarySource>>,
}

impl Default for RunNumberResolver {
    fn default() -> Self {
        Self::with_sources(vec![Box::new(ExplicitRunNumber), Box::new(NarrativeRunNumber)])
    }
}

impl RunNumberResolver {
    /// Sources are consulted in order; the first to recognise a boundary wins.
    pub fn with_sources(sources: Vec<Box<dyn BoundarySource>>) -> Self {
        Self { sources }
    }

    /// Only trust run numbers the service attached explicitly.
    pub fn explicit_only() -> Self {
        Self::with_sources(vec![Box::new(ExplicitRunNumber)])
    }

    /// Collect boundary points from chronologically sorted entries. A later
    /// entry with the same timestamp replaces an earlier one.
    pub fn identify_boundaries(&self, sorted: &[ElogEntry]) -> Boundaries {
        let mut boundaries = Boundaries::new();
        for entry in sorted {
            if let Some(run) = self.sources.iter().find_map(|s| s.boundary(entry)) {
                boundaries.insert(entry.insert_time.clone(), run);
            }
        }
        boundaries
    }

    /// Run number for every entry, in input order. Explicit run numbers are
    /// never overridden.
    pub fn resolve(&self, sorted: &[ElogEntry]) -> Vec<Option<i64>> {
        infer_run_numbers(sorted, &self.identify_boundaries(sorted))
    }
}

/// Run of the latest boundary at or before `timestamp`; `None` before the first.
pub fn infer_run_number(timestamp: &str, boundaries: &Boundaries) -> Option<i64> {
    boundaries
        .range::<str, _>((Bound::Unbounded, Bound::Included(timestamp)))
        .next_back()
        .map(|(_, run)| *run)
}

/// Per-entry run numbers from precomputed boundaries. Explicit values win.
pub fn infer_run_numbers(sorted: &[ElogEntry], boundaries: &Boundaries) -> Vec<Option<i64>> {
    sorted
        .iter()
        .map(|entry| entry.run_num.or_else(|| infer_run_number(&entry.insert_time, boundaries)))
        .collect()
}

/// Sort `entries` and attribute runs with the default boundary sources.
pub fn resolve_run_numbers(entries: &mut [ElogEntry]) -> Vec<Option<i64>> {
    sort_chronologically(entries);
    RunNumberResolver::default().resolve(entries)
}

/// Stable sort by insert time, ascending.
pub fn sort_chronologically(entries: &mut [ElogEntry]) {
    entries.sort_by(|a, b| a.insert_time.cmp(&b.insert_time));
}
