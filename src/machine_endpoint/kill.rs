//! Kill management: expands `killcron`/`killmachine` commands into
//! per-machine kill signals, tracks the grace period, and force-finalizes
//! machines that never acknowledge (§4.2 "Kill management").
//!
//! Ownership: the base spec's command table mentions killcron/killmachine
//! under both the scheduler and the machine endpoint. This implementation
//! follows the original wrapper-facing service (`machines_endpoint.py`'s
//! `check_commands`), which is the only component holding live
//! connections to send the wire-level `kill` message — the scheduler
//! never touches these two command variants.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::state::SharedState;
use crate::types::{Command, InstanceId, MachineId, RETCODE_GRACE_KILLED, GRACE_KILLED_MARKER};
use super::MachineEndpoint;
use super::protocol::OutboundMessage;

pub const GRACE_PERIOD: chrono::Duration = chrono::Duration::seconds(30);
const LOG_THROTTLE: StdDuration = StdDuration::from_secs(5);
const TICK_INTERVAL: StdDuration = StdDuration::from_millis(500);

/// One pending kill: the instant the kill was first requested, used to
/// measure the grace period before force-finalization.
type PendingKey = (String, String); // (cron, machine)

pub struct KillManager {
    state: SharedState,
    endpoint: Arc<MachineEndpoint>,
    pending: DashMap<PendingKey, chrono::DateTime<Utc>>,
    shutdown: Arc<Notify>,
}

impl KillManager {
    pub fn new(state: SharedState, endpoint: Arc<MachineEndpoint>) -> Arc<Self> {
        Arc::new(Self {
            state,
            endpoint,
            pending: DashMap::new(),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick(),
                    _ = self.shutdown.notified() => {
                        info!("kill manager shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn tick(&self) {
        self.expand_commands();
        self.process_pending();
    }

    /// Drain `killcron`/`killmachine` commands, fanning `killcron` out to
    /// every live machine of the cron's current instance. Anything else
    /// in the queue is pushed back for the scheduler to handle.
    fn expand_commands(&self) {
        let drained = self.state.drain_commands();
        let mut requeue = Vec::with_capacity(drained.len());

        for cmd in drained {
            match cmd {
                Command::KillCron { cron } => {
                    let machines = self.mark_stop_signal(&cron);
                    if machines.is_empty() {
                        warn!(cron = %cron, "killcron requested but no running instance found");
                        continue;
                    }
                    for machine in machines {
                        self.request_kill(&cron, &machine);
                    }
                }
                Command::KillMachine { cron, machine, .. } => {
                    self.request_kill(&cron, &machine);
                }
                other => requeue.push(other),
            }
        }

        self.state.push_commands_back(requeue);
    }

    /// Set `stop_signal` on the cron's running instance (§4.1 step 3, §4.2
    /// step 1) and return its machine set. The flag is purely informational
    /// for observers (e.g. a reconnecting wrapper could consult it); the
    /// actual kill delivery is the `request_kill` fan-out below.
    fn mark_stop_signal(&self, cron: &str) -> Vec<MachineId> {
        self.state
            .running
            .lock()
            .values_mut()
            .find(|inst| inst.name == cron)
            .map(|inst| {
                inst.stop_signal = true;
                inst.machines.clone()
            })
            .unwrap_or_default()
    }

    fn find_instance(&self, cron: &str) -> Option<InstanceId> {
        self.state
            .running
            .lock()
            .values()
            .find(|inst| inst.name == cron)
            .map(|inst| inst.instance_id.clone())
    }

    fn request_kill(&self, cron: &str, machine: &MachineId) {
        let key = (cron.to_string(), machine.0.clone());
        let first_request = !self.pending.contains_key(&key);
        self.pending.entry(key).or_insert_with(Utc::now);

        let Some(instance) = self.find_instance(cron) else {
            warn!(cron = %cron, machine = %machine.0, "kill requested for cron with no running instance");
            return;
        };

        if let Some(conn) = self.endpoint.connection(&instance.0, &machine.0) {
            let msg = OutboundMessage::Kill {
                job_name: cron.to_string(),
                job_instance: instance.0.clone(),
                machine: machine.0.clone(),
                timestamp: Utc::now(),
            };
            let sender = conn.sender.clone();
            tokio::spawn(async move {
                let _ = sender.send(msg).await;
            });
        } else if first_request {
            warn!(cron = %cron, machine = %machine.0, "kill requested but machine has no live connection");
        }
    }

    /// Check every pending kill: drop it once the machine's result is
    /// terminal (the wrapper completed on its own or acked the kill), or
    /// force-finalize it once the grace period elapses.
    fn process_pending(&self) {
        let now = Utc::now();
        let mut resolved = Vec::new();

        for entry in self.pending.iter() {
            let (cron, machine) = entry.key().clone();
            let requested_at = *entry.value();

            let slot = self.state.jobs.get(&cron).map(|s| s.clone());
            let Some(slot) = slot else {
                resolved.push((cron, machine));
                continue;
            };

            let already_terminal = slot
                .state
                .read()
                .results
                .get(&MachineId(machine.clone()))
                .map(|r| r.is_terminal())
                .unwrap_or(false);

            if already_terminal {
                resolved.push((cron, machine));
                continue;
            }

            if now - requested_at >= GRACE_PERIOD {
                let mut st = slot.state.write();
                let result = st.results.entry(MachineId(machine.clone())).or_default();
                if !result.is_terminal() {
                    if result.starttime.is_none() {
                        result.starttime = Some(requested_at);
                    }
                    result.endtime = Some(now);
                    result.retcode = Some(RETCODE_GRACE_KILLED);
                    result.ret.push_str(GRACE_KILLED_MARKER);
                    info!(cron = %cron, machine = %machine, "grace period expired; force-finalized kill");
                }
                resolved.push((cron, machine));
            } else if now.timestamp() % (LOG_THROTTLE.as_secs() as i64) == 0 {
                warn!(cron = %cron, machine = %machine, "kill pending, awaiting wrapper acknowledgment");
            }
        }

        for key in resolved {
            self.pending.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunningInstance;

    fn insert_running(state: &SharedState, cron: &str, machines: &[&str]) -> InstanceId {
        let id = InstanceId::new(cron, 0);
        state.running.lock().insert(
            id.clone(),
            RunningInstance {
                instance_id: id.clone(),
                name: cron.to_string(),
                started: Utc::now(),
                machines: machines.iter().map(|m| MachineId::from(*m)).collect(),
                stop_signal: false,
                soft_deadline: None,
                hard_deadline: None,
            },
        );
        id
    }

    #[tokio::test]
    async fn killcron_fans_out_to_every_running_machine() {
        let state = SharedState::new();
        insert_running(&state, "foo", &["a", "b"]);
        let endpoint = MachineEndpoint::new(state.clone());
        let manager = KillManager::new(state.clone(), endpoint);

        state.push_command(Command::KillCron { cron: "foo".into() });
        manager.expand_commands();

        assert!(manager.pending.contains_key(&("foo".to_string(), "a".to_string())));
        assert!(manager.pending.contains_key(&("foo".to_string(), "b".to_string())));
    }

    #[tokio::test]
    async fn already_terminal_machine_is_resolved_without_force_finalization() {
        let state = SharedState::new();
        insert_running(&state, "foo", &["a"]);
        let slot = state.job_slot("foo");
        {
            let mut st = slot.state.write();
            let result = st.results.entry(MachineId::from("a")).or_default();
            result.starttime = Some(Utc::now());
            result.endtime = Some(Utc::now());
            result.retcode = Some(0);
        }
        let endpoint = MachineEndpoint::new(state.clone());
        let manager = KillManager::new(state.clone(), endpoint);
        manager.pending.insert(("foo".to_string(), "a".to_string()), Utc::now());

        manager.process_pending();

        assert!(manager.pending.is_empty());
        let st = slot.state.read();
        assert_eq!(st.results.get(&MachineId::from("a")).unwrap().retcode, Some(0));
    }

    #[tokio::test]
    async fn grace_period_expiry_force_finalizes_with_grace_killed_retcode() {
        let state = SharedState::new();
        insert_running(&state, "foo", &["a"]);
        let slot = state.job_slot("foo");
        let endpoint = MachineEndpoint::new(state.clone());
        let manager = KillManager::new(state.clone(), endpoint);

        let long_ago = Utc::now() - GRACE_PERIOD - chrono::Duration::seconds(1);
        manager.pending.insert(("foo".to_string(), "a".to_string()), long_ago);

        manager.process_pending();

        assert!(manager.pending.is_empty());
        let st = slot.state.read();
        let result = st.results.get(&MachineId::from("a")).unwrap();
        assert_eq!(result.retcode, Some(RETCODE_GRACE_KILLED));
        assert!(result.ret.contains("grace period"));
    }
}
