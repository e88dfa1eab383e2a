//! Core data model: cron definitions, job state, running instances and the
//! command queue described by the shared state store.

pub mod error;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier for one firing of a cron, conventionally
/// `<name>:<counter>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(name: &str, counter: u64) -> Self {
        Self(format!("{name}:{counter}"))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque worker-host identifier, as returned by the external target
/// resolver. Never generated locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineId(pub String);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MachineId {
    fn from(s: &str) -> Self {
        MachineId(s.to_string())
    }
}

impl From<String> for MachineId {
    fn from(s: String) -> Self {
        MachineId(s)
    }
}

/// How a cron's target set is resolved to concrete machines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// `targets` is a literal list of machine ids.
    List,
    /// `targets` names an external grain/group to resolve via the target
    /// resolver (e.g. a Salt grain expression). Out of scope to resolve
    /// for real; the `TargetResolver` trait is the seam.
    Grain,
}

/// A cron definition as read from a config file. Immutable once parsed;
/// a reload always produces a fresh value rather than mutating in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronDefinition {
    pub name: String,
    #[serde(default)]
    pub sec: String,
    pub min: String,
    pub hour: String,
    pub dom: String,
    pub mon: String,
    pub dow: String,
    #[serde(default = "default_year")]
    pub year: String,
    pub command: String,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    pub user: String,
    pub targets: Vec<String>,
    pub target_type: TargetType,
    #[serde(default)]
    pub number_of_targets: usize,
    #[serde(default)]
    pub soft_timeout: u64,
    #[serde(default)]
    pub hard_timeout: u64,
    #[serde(default)]
    pub group: Option<String>,
    /// Which config file this definition came from; diagnostic only,
    /// never serialized to wire clients.
    #[serde(skip, default)]
    pub source_file: PathBuf,
}

fn default_year() -> String {
    "*".to_string()
}

fn default_cwd() -> String {
    "/".to_string()
}

impl CronDefinition {
    /// The full seven-field cron expression (`sec min hour dom mon dow year`)
    /// accepted by the `cron` crate.
    pub fn cron_expression(&self) -> String {
        let sec = if self.sec.is_empty() { "0" } else { &self.sec };
        format!(
            "{} {} {} {} {} {} {}",
            sec, self.min, self.hour, self.dom, self.mon, self.dow, self.year
        )
    }
}

/// Config snapshot: all known cron definitions plus a monotonically
/// increasing serial used by the UI to detect changes cheaply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub crons: HashMap<String, CronDefinition>,
    pub serial: u64,
}

/// One machine's accumulated result for the current instance of a cron.
/// Created on the first wrapper message for an instance, mutated until
/// `endtime` is set, then frozen until the next instance overwrites it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineResult {
    pub starttime: Option<DateTime<Utc>>,
    pub endtime: Option<DateTime<Utc>>,
    /// Accumulated stdout+stderr in arrival order.
    pub ret: String,
    pub retcode: Option<i32>,
    pub wrapper_version: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_output_seq: Option<u64>,
}

impl MachineResult {
    pub fn is_terminal(&self) -> bool {
        self.endtime.is_some()
    }
}

/// Reserved exit-code sentinels (§6).
pub const RETCODE_GRACE_KILLED: i32 = 143;
pub const RETCODE_WRAPPER_ERROR: i32 = 255;

pub const GRACE_KILLED_MARKER: &str =
    "\n[Job terminated by user request — grace period expired after 30s]\n";

/// Per-cron state, lifetime = process lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobState {
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: bool,
    pub group: Option<String>,
    pub results: HashMap<MachineId, MachineResult>,
}

/// One firing of a cron, spanning a fixed set of machines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningInstance {
    pub instance_id: InstanceId,
    pub name: String,
    pub started: DateTime<Utc>,
    pub machines: Vec<MachineId>,
    pub stop_signal: bool,
    /// Wall-clock deadlines for soft/hard timeout enforcement; `None` if
    /// the corresponding timeout is disabled (`0` in the cron definition).
    pub soft_deadline: Option<DateTime<Utc>>,
    pub hard_deadline: Option<DateTime<Utc>>,
}

/// Operator intents pulled from the UI endpoint (or any other caller) and
/// drained by the scheduler / machine endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    RunNow { cron: String },
    KillCron { cron: String },
    KillMachine {
        cron: String,
        machine: MachineId,
        instance: Option<InstanceId>,
    },
    GetTimeline { params: serde_json::Value },
}

/// Snapshot of the external timeline/log-search cache (§4.5). Log shipping
/// itself is out of scope; this is only the last-fetched snapshot plus a
/// change-detection id for the UI broadcast loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimelineSnapshot {
    pub id: u64,
    pub entries: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_expression_defaults_sec_to_zero() {
        let def = CronDefinition {
            name: "foo".into(),
            sec: "".into(),
            min: "*".into(),
            hour: "*".into(),
            dom: "*".into(),
            mon: "*".into(),
            dow: "*".into(),
            year: "*".into(),
            command: "echo hi".into(),
            cwd: "/".into(),
            user: "root".into(),
            targets: vec!["a".into()],
            target_type: TargetType::List,
            number_of_targets: 0,
            soft_timeout: 0,
            hard_timeout: 0,
            group: None,
            source_file: PathBuf::new(),
        };
        assert_eq!(def.cron_expression(), "0 * * * * * *");
    }

    #[test]
    fn machine_result_terminal_predicate() {
        let mut r = MachineResult::default();
        assert!(!r.is_terminal());
        r.endtime = Some(Utc::now());
        assert!(r.is_terminal());
    }

    #[test]
    fn instance_id_format_matches_convention() {
        let id = InstanceId::new("backup", 7);
        assert_eq!(id.to_string(), "backup:7");
    }
}
