//! Shared state store (C1): in-memory maps for config, per-job state,
//! running instances, the command queue, the bad-cron set and the
//! timeline cache. Ownership rules (§3):
//!
//! - the scheduler exclusively creates/removes `running` entries and
//!   job-state skeletons;
//! - the machine endpoint exclusively writes into `MachineResult` fields;
//! - the UI endpoint is read-only on `state`/`running`/`config` and
//!   append-only on `commands`.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::Mutex as AsyncMutex;

use crate::types::{Command, ConfigSnapshot, InstanceId, JobState, RunningInstance, TimelineSnapshot};

/// A cron's state and the mutex that guards mutation of it. Bundling the
/// lock with the data (rather than a parallel `statelocks` map, as the
/// Python original does) makes it impossible to create state without a
/// lock or vice versa.
pub struct JobSlot {
    pub lock: AsyncMutex<()>,
    pub state: SyncRwLock<JobState>,
}

impl JobSlot {
    fn new(group: Option<String>) -> Self {
        Self {
            lock: AsyncMutex::new(()),
            state: SyncRwLock::new(JobState {
                group,
                ..Default::default()
            }),
        }
    }
}

/// The shared state store. Cheap to clone (all fields are `Arc`-backed);
/// every component holds a clone.
#[derive(Clone)]
pub struct SharedState {
    pub config: Arc<ArcSwap<ConfigSnapshot>>,
    pub running: Arc<SyncMutex<HashMap<InstanceId, RunningInstance>>>,
    pub jobs: Arc<DashMap<String, Arc<JobSlot>>>,
    pub commands: Arc<SyncMutex<Vec<Command>>>,
    pub bad_crons: Arc<DashMap<String, String>>,
    pub timeline: Arc<SyncRwLock<TimelineSnapshot>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            config: Arc::new(ArcSwap::from_pointee(ConfigSnapshot::default())),
            running: Arc::new(SyncMutex::new(HashMap::new())),
            jobs: Arc::new(DashMap::new()),
            commands: Arc::new(SyncMutex::new(Vec::new())),
            bad_crons: Arc::new(DashMap::new()),
            timeline: Arc::new(SyncRwLock::new(TimelineSnapshot::default())),
        }
    }

    /// Fetch the slot for `name`, creating an empty one on first
    /// appearance (§4.5: "statelocks[name]... created when the cron
    /// first appears").
    pub fn job_slot(&self, name: &str) -> Arc<JobSlot> {
        if let Some(slot) = self.jobs.get(name) {
            return slot.clone();
        }
        let group = self
            .config
            .load()
            .crons
            .get(name)
            .and_then(|c| c.group.clone());
        let slot = Arc::new(JobSlot::new(group));
        self.jobs.insert(name.to_string(), slot.clone());
        slot
    }

    pub fn push_command(&self, cmd: Command) {
        self.commands.lock().push(cmd);
    }

    /// Atomically drain every queued command for further processing.
    /// Callers that only want to act on a subset (e.g. the scheduler
    /// ignoring `killmachine`, which is C2's job) should push back the
    /// ones they didn't handle.
    pub fn drain_commands(&self) -> Vec<Command> {
        std::mem::take(&mut *self.commands.lock())
    }

    pub fn push_commands_back(&self, cmds: Vec<Command>) {
        self.commands.lock().extend(cmds);
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_slot_is_created_lazily_and_reused() {
        let state = SharedState::new();
        assert!(state.jobs.is_empty());
        let a = state.job_slot("foo");
        let b = state.job_slot("foo");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(state.jobs.len(), 1);
    }

    #[test]
    fn commands_drain_and_requeue() {
        let state = SharedState::new();
        state.push_command(Command::RunNow { cron: "foo".into() });
        state.push_command(Command::KillCron { cron: "bar".into() });
        let drained = state.drain_commands();
        assert_eq!(drained.len(), 2);
        assert!(state.drain_commands().is_empty());

        state.push_commands_back(drained);
        assert_eq!(state.drain_commands().len(), 2);
    }
}
