// Activity Tree
// Hierarchical status, progress and severity records for executing job nodes

use crate::error::EngineError;

use chrono::{DateTime, Local};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Traffic-light severity, ordered Green < Orange < Red
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    #[serde(alias = "Green", alias = "GREEN")]
    Green,
    #[serde(alias = "Orange", alias = "ORANGE")]
    Orange,
    #[serde(alias = "Red", alias = "RED")]
    Red,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Green => "green",
            Severity::Orange => "orange",
            Severity::Red => "red",
        };
        f.write_str(name)
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "green" => Ok(Severity::Green),
            "orange" => Ok(Severity::Orange),
            "red" => Ok(Severity::Red),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Lifecycle of an activity record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    #[default]
    Waiting,
    Running,
    Completed,
}

/// An error captured on a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityError {
    pub kind: String,
    pub message: String,
    pub at: DateTime<Local>,
}

#[derive(Debug, Default)]
struct ActivityState {
    status: ActivityStatus,
    progress: u8,
    severity: Severity,
    started: Option<DateTime<Local>>,
    ended: Option<DateTime<Local>>,
    description: Option<String>,
    inner_job_count: usize,
    result: Option<serde_json::Value>,
    errors: Vec<ActivityError>,
}

/// Shared by every record of one tree: name of the record whose result was kept
type ResultClaim = Arc<Mutex<Option<String>>>;

/// Status record for one job node's execution
#[derive(Debug)]
pub struct ActivityRecord {
    id: String,
    name: String,
    state: RwLock<ActivityState>,
    children: RwLock<Vec<Arc<ActivityRecord>>>,
    claim: RwLock<ResultClaim>,
}

impl ActivityRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            state: RwLock::new(ActivityState::default()),
            children: RwLock::new(Vec::new()),
            claim: RwLock::new(Arc::new(Mutex::new(None))),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_child(&self, child: Arc<ActivityRecord>) {
        let claim = self.claim.read().clone();
        child.adopt_claim(&claim);
        self.children.write().push(child);
    }

    /// Join a tree's result claim, carrying over a result this subtree already kept
    fn adopt_claim(&self, claim: &ResultClaim) {
        let previous = std::mem::replace(&mut *self.claim.write(), claim.clone());
        if !Arc::ptr_eq(&previous, claim) {
            if let Some(owner) = previous.lock().take() {
                let mut kept = claim.lock();
                match kept.as_ref() {
                    None => *kept = Some(owner),
                    Some(existing) => warn!(
                        activity = %self.name,
                        existing = %existing,
                        discarded = %owner,
                        "result conflict while attaching subtree"
                    ),
                }
            }
        }
        for child in self.children.read().iter() {
            child.adopt_claim(claim);
        }
    }

    pub fn children(&self) -> Vec<Arc<ActivityRecord>> {
        self.children.read().clone()
    }

    pub fn status(&self) -> ActivityStatus {
        self.state.read().status
    }

    /// Move to a new status, stamping start and end times
    pub fn set_status(&self, status: ActivityStatus) {
        let mut state = self.state.write();
        let now = Local::now();
        if status == ActivityStatus::Running && state.status != ActivityStatus::Running {
            state.started = Some(now);
            state.ended = None;
        }
        if state.status == ActivityStatus::Running && status != ActivityStatus::Running {
            state.ended = Some(now);
        }
        if status == ActivityStatus::Completed {
            state.progress = 100;
            state.description = None;
        }
        state.status = status;
    }

    /// Own severity, only ever raised
    pub fn raise_severity(&self, severity: Severity) {
        let mut state = self.state.write();
        if severity > state.severity {
            state.severity = severity;
        }
    }

    /// Maximum severity over this record and every descendant
    pub fn severity(&self) -> Severity {
        let own = self.state.read().severity;
        self.children
            .read()
            .iter()
            .map(|child| child.severity())
            .fold(own, Severity::max)
    }

    pub fn set_progress(&self, progress: u8) {
        self.state.write().progress = progress.min(100);
    }

    /// Observed progress, averaged over children when there are any
    pub fn progress(&self) -> u8 {
        let (own, declared, status) = {
            let state = self.state.read();
            (state.progress, state.inner_job_count, state.status)
        };
        if status == ActivityStatus::Completed {
            return 100;
        }

        let children = self.children.read();
        if children.is_empty() {
            return own;
        }
        let total: usize = children.iter().map(|c| c.progress() as usize).sum();
        let denominator = declared.max(children.len());
        (total / denominator) as u8
    }

    /// Number of inner jobs this record expects, used as the progress denominator
    pub fn set_inner_job_count(&self, count: usize) {
        self.state.write().inner_job_count = count;
    }

    pub fn inner_job_count(&self) -> usize {
        self.state.read().inner_job_count
    }

    pub fn set_description(&self, description: impl Into<String>) {
        self.state.write().description = Some(description.into());
    }

    pub fn description(&self) -> Option<String> {
        self.state.read().description.clone()
    }

    /// Store a result; the first one set anywhere in the record tree wins
    pub fn set_result(&self, value: serde_json::Value) -> bool {
        let claim = self.claim.read().clone();
        let mut owner = claim.lock();
        if let Some(existing) = owner.as_ref() {
            warn!(
                activity = %self.name,
                kept_from = %existing,
                discarded = %value,
                "result already set, discarding"
            );
            return false;
        }
        *owner = Some(self.name.clone());
        self.state.write().result = Some(value);
        true
    }

    /// Own result, else the first result found among descendants
    pub fn result(&self) -> Option<serde_json::Value> {
        if let Some(value) = self.state.read().result.clone() {
            return Some(value);
        }
        self.children.read().iter().find_map(|child| child.result())
    }

    pub fn add_error(&self, kind: impl Into<String>, message: impl Into<String>) {
        self.state.write().errors.push(ActivityError {
            kind: kind.into(),
            message: message.into(),
            at: Local::now(),
        });
    }

    /// Record a contained failure: Red severity plus the error itself
    pub fn fail(&self, error: &EngineError) {
        self.raise_severity(Severity::Red);
        self.add_error(error.kind(), error.to_string());
    }

    pub fn errors(&self) -> Vec<ActivityError> {
        self.state.read().errors.clone()
    }

    /// Errors captured on this record and every descendant
    pub fn error_count(&self) -> usize {
        let own = self.state.read().errors.len();
        own + self
            .children
            .read()
            .iter()
            .map(|c| c.error_count())
            .sum::<usize>()
    }

    pub fn started(&self) -> Option<DateTime<Local>> {
        self.state.read().started
    }

    pub fn ended(&self) -> Option<DateTime<Local>> {
        self.state.read().ended
    }

    /// Elapsed time; still growing while the record is running
    pub fn duration(&self) -> Option<Duration> {
        let state = self.state.read();
        let started = state.started?;
        let ended = state.ended.unwrap_or_else(Local::now);
        (ended - started).to_std().ok()
    }

    /// Pull a serializable copy of this subtree with aggregated values
    pub fn snapshot(&self) -> ActivitySnapshot {
        let children: Vec<ActivitySnapshot> =
            self.children.read().iter().map(|c| c.snapshot()).collect();
        let state = self.state.read();

        ActivitySnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            status: state.status,
            progress: if state.status == ActivityStatus::Completed {
                100
            } else if children.is_empty() {
                state.progress
            } else {
                let total: usize = children.iter().map(|c| c.progress as usize).sum();
                (total / state.inner_job_count.max(children.len())) as u8
            },
            severity: children
                .iter()
                .map(|c| c.severity)
                .fold(state.severity, Severity::max),
            started: state.started,
            ended: state.ended,
            duration_ms: match (state.started, state.ended) {
                (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
                _ => None,
            },
            description: state.description.clone(),
            result: state.result.clone(),
            errors: state.errors.clone(),
            children,
        }
    }
}

/// Serializable view of an activity subtree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub id: String,
    pub name: String,
    pub status: ActivityStatus,
    pub progress: u8,
    /// Aggregated over the subtree
    pub severity: Severity,
    pub started: Option<DateTime<Local>>,
    pub ended: Option<DateTime<Local>>,
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ActivityError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ActivitySnapshot>,
}

impl ActivitySnapshot {
    /// Errors in this subtree, depth first, with the owning record name
    pub fn all_errors(&self) -> Vec<(&str, &ActivityError)> {
        let mut out: Vec<(&str, &ActivityError)> =
            self.errors.iter().map(|e| (self.name.as_str(), e)).collect();
        for child in &self.children {
            out.extend(child.all_errors());
        }
        out
    }
}

/// In-process registry of records for jobs currently executing
#[derive(Debug, Default)]
pub struct ActivityRegistry {
    records: RwLock<HashMap<String, Arc<ActivityRecord>>>,
    sequence: AtomicU64,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record with an identifier namespaced by the run
    pub fn create(&self, run_id: &str, name: impl Into<String>) -> Arc<ActivityRecord> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        Arc::new(ActivityRecord::new(format!("{}:{}", run_id, seq), name))
    }

    pub fn register(&self, record: Arc<ActivityRecord>) {
        self.records.write().insert(record.id().to_string(), record);
    }

    pub fn release(&self, id: &str) -> Option<Arc<ActivityRecord>> {
        self.records.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ActivityRecord>> {
        self.records.read().get(id).cloned()
    }

    /// Records still registered, optionally restricted to one run
    pub fn active(&self, run_id: Option<&str>) -> Vec<Arc<ActivityRecord>> {
        let records = self.records.read();
        let mut active: Vec<Arc<ActivityRecord>> = records
            .values()
            .filter(|r| run_id.map_or(true, |run| r.id().starts_with(&format!("{}:", run))))
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id().cmp(b.id()));
        active
    }

    pub fn snapshot(&self, run_id: Option<&str>) -> Vec<ActivitySnapshot> {
        self.active(run_id).iter().map(|r| r.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
