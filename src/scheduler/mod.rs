//! Scheduler / dispatcher (C4): computes next-fire instants, fires jobs,
//! creates instance records, spawns wrappers on the selected target set,
//! enforces soft/hard timeouts, and services `runnow`.
//!
//! `killcron`/`killmachine` are drained and acted on by the machine
//! endpoint's kill-management tick ([`crate::machine_endpoint::kill`]),
//! not here — the scheduler only observes the eventual terminal results
//! (§4.1, §4.2). See DESIGN.md for why this rewrite resolves the base
//! spec's apparent dual-ownership of `killcron` in favor of C2, matching
//! the original implementation.

pub mod cron;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::config;
use crate::state::SharedState;
use crate::types::error::SchedulerError;
use crate::types::{Command, ConfigSnapshot, CronDefinition, InstanceId, MachineId, MachineResult, RunningInstance, RETCODE_WRAPPER_ERROR};

pub const TICK_INTERVAL: Duration = Duration::from_millis(500);
const REFIRE_DEBOUNCE: chrono::Duration = chrono::Duration::seconds(1);
const TIMEOUT_EXTENSION: chrono::Duration = chrono::Duration::minutes(5);

/// Arguments passed to the external spawn capability (§4.1 fire
/// procedure). The real remote-execution primitive that delivers the
/// wrapper binary to `machine` is out of scope (§1); this struct is the
/// payload it would be given.
#[derive(Debug, Clone)]
pub struct SpawnArgs {
    pub endpoint_url: String,
    pub name: String,
    pub instance_id: InstanceId,
    pub machine: MachineId,
    pub command: String,
    pub cwd: String,
    pub user: String,
}

/// Resolves a cron's `{targets, target_type}` into concrete machine ids.
/// Out-of-scope target resolution backends (e.g. a Salt grain expression)
/// implement this trait; production wiring only needs to support
/// `target_type: list` since that is all the base spec's scenarios
/// exercise.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, def: &CronDefinition) -> Result<Vec<MachineId>, SchedulerError>;
}

/// Fire-and-forget spawn of the wrapper on a target machine.
#[async_trait]
pub trait WrapperSpawner: Send + Sync {
    async fn spawn(&self, machine: &MachineId, args: &SpawnArgs) -> Result<(), SchedulerError>;
}

/// Resolves `target_type: list` by taking the literal `targets` list;
/// fails on `target_type: grain` since no real grain backend is wired up.
pub struct ListTargetResolver;

#[async_trait]
impl TargetResolver for ListTargetResolver {
    async fn resolve(&self, def: &CronDefinition) -> Result<Vec<MachineId>, SchedulerError> {
        use crate::types::TargetType;
        match def.target_type {
            TargetType::List => Ok(def.targets.iter().cloned().map(MachineId).collect()),
            TargetType::Grain => Err(SchedulerError::TargetResolutionFailed {
                name: def.name.clone(),
                reason: "grain-based target resolution is an external collaborator; not implemented".into(),
            }),
        }
    }
}

pub struct SchedulerConfig {
    pub config_dir: std::path::PathBuf,
    pub endpoint_url: String,
    pub tick_interval: Duration,
}

impl SchedulerConfig {
    pub fn new(config_dir: impl Into<std::path::PathBuf>, endpoint_url: impl Into<String>) -> Self {
        Self {
            config_dir: config_dir.into(),
            endpoint_url: endpoint_url.into(),
            tick_interval: TICK_INTERVAL,
        }
    }
}

pub struct Scheduler {
    state: SharedState,
    config: SchedulerConfig,
    resolver: Arc<dyn TargetResolver>,
    spawner: Arc<dyn WrapperSpawner>,
    shutdown: Arc<Notify>,
    instance_counters: DashMap<String, AtomicU64>,
    config_fingerprint: parking_lot::Mutex<Option<u64>>,
}

impl Scheduler {
    pub fn new(
        state: SharedState,
        config: SchedulerConfig,
        resolver: Arc<dyn TargetResolver>,
        spawner: Arc<dyn WrapperSpawner>,
    ) -> Self {
        Self {
            state,
            config,
            resolver,
            spawner,
            shutdown: Arc::new(Notify::new()),
            instance_counters: DashMap::new(),
            config_fingerprint: parking_lot::Mutex::new(None),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Spawn the tick loop as a background task.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    _ = self.shutdown.notified() => {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn tick(&self) {
        self.reload_config_if_changed();
        self.fire_due_crons().await;
        self.drain_runnow().await;
        self.enforce_timeouts().await;
        self.reap_instances().await;
    }

    fn reload_config_if_changed(&self) {
        let fingerprint = match directory_fingerprint(&self.config.config_dir) {
            Some(f) => f,
            None => return,
        };
        let mut guard = self.config_fingerprint.lock();
        if *guard == Some(fingerprint) {
            return;
        }
        *guard = Some(fingerprint);
        drop(guard);

        let loaded = match config::load_dir(&self.config.config_dir) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "config reload failed; keeping previous snapshot");
                return;
            }
        };

        for (name, reason) in &loaded.bad {
            self.state.bad_crons.insert(name.clone(), reason.clone());
        }

        let previous = self.state.config.load();
        let mut crons = loaded.crons;
        for (name, def) in crons.iter_mut() {
            match cron::parse(name, &def.cron_expression()) {
                Ok(schedule) => {
                    // Job slots are created lazily (first touched by
                    // `fire_due_crons`'s `job_slot` call), so a cron seen
                    // for the first time here has no slot yet; `job_slot`
                    // creates it so the freshly computed `next_run` below
                    // always has somewhere to land.
                    let existed_before = previous.crons.contains_key(name);
                    let slot = self.state.job_slot(name);
                    let prior_next = if existed_before { slot.state.read().next_run } else { None };
                    let next = cron::next_run_after(&schedule, prior_next);
                    slot.state.write().next_run = next;
                }
                Err(e) => {
                    warn!(cron = %name, error = %e, "cron expression rejected at reload");
                    self.state.bad_crons.insert(name.clone(), e.to_string());
                }
            }
        }

        let serial = previous.serial + 1;
        self.state
            .config
            .store(Arc::new(ConfigSnapshot { crons, serial }));
        info!(serial, "config reloaded");
    }

    async fn fire_due_crons(&self) {
        let now = Utc::now();
        let snapshot = self.state.config.load_full();
        let running_names: std::collections::HashSet<String> = self
            .state
            .running
            .lock()
            .values()
            .map(|r| r.name.clone())
            .collect();

        for (name, def) in snapshot.crons.iter() {
            if running_names.contains(name) {
                continue;
            }
            let slot = self.state.job_slot(name);
            let (due, debounced) = {
                let st = slot.state.read();
                let due = st.next_run.map(|n| n <= now).unwrap_or(false);
                let debounced = st
                    .last_run
                    .map(|lr| now.signed_duration_since(lr) < REFIRE_DEBOUNCE)
                    .unwrap_or(false);
                (due, debounced)
            };
            if due && !debounced {
                self.fire(name, def).await;
            }
        }
    }

    async fn drain_runnow(&self) {
        let commands = self.state.drain_commands();
        let mut rest = Vec::with_capacity(commands.len());
        let snapshot = self.state.config.load_full();
        let running_names: std::collections::HashSet<String> = self
            .state
            .running
            .lock()
            .values()
            .map(|r| r.name.clone())
            .collect();

        for cmd in commands {
            match cmd {
                Command::RunNow { cron: name } => {
                    if running_names.contains(&name) {
                        warn!(cron = %name, "runnow ignored: already running");
                        continue;
                    }
                    if let Some(def) = snapshot.crons.get(&name) {
                        self.fire(&name, def).await;
                    } else {
                        warn!(cron = %name, "runnow for unknown cron");
                    }
                }
                other => rest.push(other),
            }
        }
        self.state.push_commands_back(rest);
    }

    /// Resolve targets, apply `number_of_targets` subsetting, allocate an
    /// instance id, spawn wrappers, and reset the job's results map.
    async fn fire(&self, name: &str, def: &CronDefinition) {
        let slot = self.state.job_slot(name);
        let _guard = slot.lock.lock().await;

        let mut machines = match self.resolver.resolve(def).await {
            Ok(m) => m,
            Err(e) => {
                warn!(cron = %name, error = %e, "target resolution failed; not firing");
                return;
            }
        };
        machines.sort();
        if def.number_of_targets > 0 && def.number_of_targets < machines.len() {
            machines.truncate(def.number_of_targets);
        }
        if machines.is_empty() {
            warn!(cron = %name, "no targets resolved; not firing");
            return;
        }

        let counter = self
            .instance_counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst);
        let instance_id = InstanceId::new(name, counter);
        let now = Utc::now();

        let running_instance = RunningInstance {
            instance_id: instance_id.clone(),
            name: name.to_string(),
            started: now,
            machines: machines.clone(),
            stop_signal: false,
            soft_deadline: (def.soft_timeout > 0)
                .then(|| now + chrono::Duration::seconds(def.soft_timeout as i64)),
            hard_deadline: (def.hard_timeout > 0)
                .then(|| now + chrono::Duration::seconds(def.hard_timeout as i64)),
        };
        self.state
            .running
            .lock()
            .insert(instance_id.clone(), running_instance);

        let next_run = match cron::parse(name, &def.cron_expression()) {
            Ok(schedule) => cron::next_run_after(&schedule, Some(now)),
            Err(e) => {
                warn!(cron = %name, error = %e, "failed to recompute next_run after fire");
                None
            }
        };
        {
            let mut st = slot.state.write();
            st.last_run = Some(now);
            st.next_run = next_run;
            st.results = machines
                .iter()
                .map(|m| (m.clone(), MachineResult::default()))
                .collect();
        }

        info!(cron = %name, instance = %instance_id, machines = machines.len(), "fired");

        for machine in &machines {
            let args = SpawnArgs {
                endpoint_url: self.config.endpoint_url.clone(),
                name: name.to_string(),
                instance_id: instance_id.clone(),
                machine: machine.clone(),
                command: def.command.clone(),
                cwd: def.cwd.clone(),
                user: def.user.clone(),
            };
            if let Err(e) = self.spawner.spawn(machine, &args).await {
                warn!(cron = %name, %machine, error = %e, "spawn failed");
                let now = Utc::now();
                let mut st = slot.state.write();
                if let Some(result) = st.results.get_mut(machine) {
                    result.starttime = Some(now);
                    result.endtime = Some(now);
                    result.retcode = Some(RETCODE_WRAPPER_ERROR);
                    result.ret = format!("spawn failed: {e}");
                }
            }
        }
    }

    async fn enforce_timeouts(&self) {
        let now = Utc::now();
        let mut extend_hard: Vec<InstanceId> = Vec::new();
        let mut extend_soft: Vec<InstanceId> = Vec::new();
        let mut to_kill: Vec<Command> = Vec::new();

        {
            let mut running = self.state.running.lock();
            for (id, inst) in running.iter_mut() {
                if let Some(deadline) = inst.soft_deadline {
                    if now >= deadline {
                        warn!(instance = %id, "soft timeout reached");
                        inst.soft_deadline = Some(deadline + TIMEOUT_EXTENSION);
                        extend_soft.push(id.clone());
                    }
                }
                if let Some(deadline) = inst.hard_deadline {
                    if now >= deadline {
                        warn!(instance = %id, "hard timeout reached; killing non-terminal machines");
                        inst.hard_deadline = Some(deadline + TIMEOUT_EXTENSION);
                        extend_hard.push(id.clone());

                        let slot = self.state.job_slot(&inst.name);
                        let st = slot.state.read();
                        for machine in &inst.machines {
                            let terminal = st
                                .results
                                .get(machine)
                                .map(|r| r.is_terminal())
                                .unwrap_or(false);
                            if !terminal {
                                to_kill.push(Command::KillMachine {
                                    cron: inst.name.clone(),
                                    machine: machine.clone(),
                                    instance: Some(id.clone()),
                                });
                            }
                        }
                    }
                }
            }
        }

        if !to_kill.is_empty() {
            self.state.push_commands_back(to_kill);
        }
    }

    /// Remove fully-terminal instances from `running` and freeze
    /// `last_success` (§3 invariant 5, §4.1 step 5, §8 "reap
    /// correctness").
    async fn reap_instances(&self) {
        let snapshot = self.state.config.load_full();
        let now = Utc::now();

        // Snapshot the candidates under `running` first so the per-cron
        // async lock (held below across the read-then-write) is never
        // acquired while still holding the sync `running` guard.
        let candidates: Vec<(InstanceId, RunningInstance)> = self
            .state
            .running
            .lock()
            .iter()
            .map(|(id, inst)| (id.clone(), inst.clone()))
            .collect();

        let mut reaped: Vec<InstanceId> = Vec::new();
        for (id, inst) in &candidates {
            let slot = self.state.job_slot(&inst.name);
            let _guard = slot.lock.lock().await;

            let st = slot.state.read();
            let all_terminal = inst.machines.iter().all(|m| {
                st.results
                    .get(m)
                    .map(|r| r.is_terminal())
                    .unwrap_or(false)
            });
            if !all_terminal {
                continue;
            }
            let last_success = inst
                .machines
                .iter()
                .all(|m| st.results.get(m).and_then(|r| r.retcode) == Some(0));
            drop(st);
            let mut st = slot.state.write();
            st.last_success = last_success;
            // Recompute next_run on reap so a finished instance's
            // cron fires again on its next scheduled tick instead of
            // re-firing every tick once the debounce window lapses
            // (§4.1 step 1).
            if let Some(def) = snapshot.crons.get(&inst.name) {
                match cron::parse(&inst.name, &def.cron_expression()) {
                    Ok(schedule) => st.next_run = cron::next_run_after(&schedule, Some(now)),
                    Err(e) => warn!(cron = %inst.name, error = %e, "failed to recompute next_run after reap"),
                }
            }
            drop(st);
            reaped.push(id.clone());
        }

        if !reaped.is_empty() {
            let mut running = self.state.running.lock();
            for id in &reaped {
                running.remove(id);
            }
        }
    }
}

/// Cheap proxy for "did the config directory change": sum of each
/// matching file's (mtime, len). Avoids re-parsing every tick (§4.1:
/// "if config on disk changed, reload").
fn directory_fingerprint(dir: &std::path::Path) -> Option<u64> {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    let entries = std::fs::read_dir(dir).ok()?;
    let mut files: Vec<_> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    files.sort();
    for path in files {
        if let Ok(meta) = std::fs::metadata(&path) {
            path.hash(&mut hasher);
            meta.len().hash(&mut hasher);
            if let Ok(modified) = meta.modified() {
                modified.hash(&mut hasher);
            }
        }
    }
    Some(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FixedResolver;

    #[async_trait]
    impl TargetResolver for FixedResolver {
        async fn resolve(&self, def: &CronDefinition) -> Result<Vec<MachineId>, SchedulerError> {
            Ok(def.targets.iter().cloned().map(MachineId).collect())
        }
    }

    struct RecordingSpawner {
        spawned: StdMutex<Vec<(MachineId, SpawnArgs)>>,
        fail_for: Vec<MachineId>,
    }

    impl RecordingSpawner {
        fn new(fail_for: Vec<MachineId>) -> Self {
            Self {
                spawned: StdMutex::new(Vec::new()),
                fail_for,
            }
        }
    }

    #[async_trait]
    impl WrapperSpawner for RecordingSpawner {
        async fn spawn(&self, machine: &MachineId, args: &SpawnArgs) -> Result<(), SchedulerError> {
            if self.fail_for.contains(machine) {
                return Err(SchedulerError::SpawnFailed {
                    name: args.name.clone(),
                    machine: machine.clone(),
                    reason: "simulated failure".into(),
                });
            }
            self.spawned.lock().unwrap().push((machine.clone(), args.clone()));
            Ok(())
        }
    }

    fn test_def(name: &str, targets: &[&str], number_of_targets: usize) -> CronDefinition {
        CronDefinition {
            name: name.to_string(),
            sec: "0".into(),
            min: "*".into(),
            hour: "*".into(),
            dom: "*".into(),
            mon: "*".into(),
            dow: "*".into(),
            year: "*".into(),
            command: "echo hi".into(),
            cwd: "/".into(),
            user: "root".into(),
            targets: targets.iter().map(|s| s.to_string()).collect(),
            target_type: crate::types::TargetType::List,
            number_of_targets,
            soft_timeout: 0,
            hard_timeout: 0,
            group: None,
            source_file: std::path::PathBuf::new(),
        }
    }

    #[tokio::test]
    async fn fire_resolves_targets_and_resets_results() {
        let state = SharedState::new();
        let scheduler = Scheduler::new(
            state.clone(),
            SchedulerConfig::new("/tmp", "ws://localhost:8889"),
            Arc::new(FixedResolver),
            Arc::new(RecordingSpawner::new(vec![])),
        );

        let def = test_def("foo", &["b", "a", "c"], 0);
        scheduler.fire("foo", &def).await;

        let running = state.running.lock();
        assert_eq!(running.len(), 1);
        let inst = running.values().next().unwrap();
        assert_eq!(
            inst.machines,
            vec![MachineId::from("a"), MachineId::from("b"), MachineId::from("c")]
        );

        let slot = state.job_slot("foo");
        let st = slot.state.read();
        assert_eq!(st.results.len(), 3);
        assert!(st.results.values().all(|r| !r.is_terminal()));
    }

    #[tokio::test]
    async fn number_of_targets_selects_lexicographic_subset() {
        let state = SharedState::new();
        let scheduler = Scheduler::new(
            state.clone(),
            SchedulerConfig::new("/tmp", "ws://localhost:8889"),
            Arc::new(FixedResolver),
            Arc::new(RecordingSpawner::new(vec![])),
        );
        let def = test_def("foo", &["z", "y", "a", "b"], 2);
        scheduler.fire("foo", &def).await;

        let running = state.running.lock();
        let inst = running.values().next().unwrap();
        assert_eq!(inst.machines, vec![MachineId::from("a"), MachineId::from("b")]);
    }

    #[tokio::test]
    async fn spawn_failure_synthesizes_terminal_result() {
        let state = SharedState::new();
        let scheduler = Scheduler::new(
            state.clone(),
            SchedulerConfig::new("/tmp", "ws://localhost:8889"),
            Arc::new(FixedResolver),
            Arc::new(RecordingSpawner::new(vec![MachineId::from("a")])),
        );
        let def = test_def("foo", &["a"], 0);
        scheduler.fire("foo", &def).await;

        let slot = state.job_slot("foo");
        let st = slot.state.read();
        let result = st.results.get(&MachineId::from("a")).unwrap();
        assert_eq!(result.retcode, Some(RETCODE_WRAPPER_ERROR));
        assert!(result.is_terminal());
    }

    #[tokio::test]
    async fn reap_requires_all_machines_terminal() {
        let state = SharedState::new();
        let scheduler = Scheduler::new(
            state.clone(),
            SchedulerConfig::new("/tmp", "ws://localhost:8889"),
            Arc::new(FixedResolver),
            Arc::new(RecordingSpawner::new(vec![])),
        );
        let def = test_def("foo", &["a", "b"], 0);
        scheduler.fire("foo", &def).await;

        scheduler.reap_instances().await;
        assert_eq!(state.running.lock().len(), 1, "not all machines terminal yet");

        let slot = state.job_slot("foo");
        {
            let mut st = slot.state.write();
            for result in st.results.values_mut() {
                result.endtime = Some(Utc::now());
                result.retcode = Some(0);
            }
        }
        scheduler.reap_instances().await;
        assert_eq!(state.running.lock().len(), 0);
        assert!(slot.state.read().last_success);
    }
}
