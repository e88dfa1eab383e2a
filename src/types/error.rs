//! Layered error taxonomy shared by every component. No variant here is
//! ever allowed to become a fatal `panic!` from a running task — the task
//! supervisors log and continue (§7: "No error kind is fatal to the
//! controller process").

use thiserror::Error;

use super::MachineId;

/// Top-level aggregating error type.
#[derive(Error, Debug)]
pub enum SaltpeterError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Config-directory loading and parsing errors.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("config directory not found: {path}")]
    DirectoryNotFound { path: String },

    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("cron {name} in {path} is invalid: {reason}")]
    InvalidCron {
        name: String,
        path: String,
        reason: String,
    },
}

/// Scheduler / dispatcher errors (C4).
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("cron expression rejected for {name}: {reason}")]
    InvalidSchedule { name: String, reason: String },

    #[error("timezone rejected for {name}: {tz}")]
    InvalidTimezone { name: String, tz: String },

    #[error("spawn failed for {machine} running {name}: {reason}")]
    SpawnFailed {
        name: String,
        machine: MachineId,
        reason: String,
    },

    #[error("target resolution failed for {name}: {reason}")]
    TargetResolutionFailed { name: String, reason: String },

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Shared by the machine endpoint (C2) and the UI endpoint's wire
/// handling (C5) — both are JSON-message-driven connection protocols with
/// the same class of per-message failures.
#[derive(Error, Debug, Clone)]
pub enum EndpointError {
    #[error("unknown job_instance: {instance}")]
    UnknownInstance { instance: String },

    #[error("sequence gap for {machine}: expected {expected}, got {received}")]
    SequenceGap {
        machine: MachineId,
        expected: u64,
        received: u64,
    },

    #[error("malformed message: {reason}")]
    Malformed { reason: String },

    #[error("wrapper reported error: {reason}")]
    WrapperError { reason: String },

    #[error("connection closed")]
    ConnectionClosed,
}

/// Shared-state-store errors (C1) — rare, since most state operations are
/// infallible map/lock operations; reserved for lookups by name/id that
/// can legitimately miss.
#[derive(Error, Debug, Clone)]
pub enum StateError {
    #[error("unknown cron: {name}")]
    UnknownCron { name: String },

    #[error("unknown instance: {instance}")]
    UnknownInstance { instance: String },
}

pub type SaltpeterResult<T> = Result<T, SaltpeterError>;
