//! Wire protocol for the UI endpoint (C5). Inbound messages are matched
//! ad hoc on a single discriminating key rather than a clean serde tag,
//! mirroring the loose single-key-object shape the original UI's
//! websocket client actually sends (`{"subscribe": "foo"}`,
//! `{"run": "foo"}`, ...) rather than inventing a tagged envelope the
//! original never had.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CronDefinition, MachineResult};

/// Accepts either a bare `"name"` or a `["name", ...]` list — the UI's
/// websocket client sends both shapes for `subscribe`/`unsubscribe`
/// depending on whether the operator is watching one cron or several.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawInbound {
    #[serde(default)]
    pub subscribe: Option<OneOrMany>,
    #[serde(default)]
    pub unsubscribe: Option<OneOrMany>,
    #[serde(default)]
    pub ack: Option<AckPayload>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default, rename = "killCron")]
    pub kill_cron: Option<String>,
    #[serde(default, rename = "killMachine")]
    pub kill_machine: Option<KillMachinePayload>,
    #[serde(default, rename = "getTimeline")]
    pub get_timeline: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AckPayload {
    pub cron: String,
    pub machine: String,
    pub position: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KillMachinePayload {
    pub cron: String,
    pub machine: String,
    #[serde(default)]
    pub instance: Option<String>,
}

/// The decoded inbound intent, after `RawInbound`'s ad-hoc fields are
/// resolved to exactly one variant (§5.2).
#[derive(Debug, Clone)]
pub enum UiCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Ack { cron: String, machine: String, position: usize },
    Run(String),
    KillCron(String),
    KillMachine { cron: String, machine: String, instance: Option<String> },
    GetTimeline(Value),
}

impl RawInbound {
    /// Resolve to the first recognized field, in a fixed precedence
    /// order (mirrors the original's sequential `if` chain).
    pub fn resolve(self) -> Option<UiCommand> {
        if let Some(crons) = self.subscribe {
            return Some(UiCommand::Subscribe(crons.into_vec()));
        }
        if let Some(crons) = self.unsubscribe {
            return Some(UiCommand::Unsubscribe(crons.into_vec()));
        }
        if let Some(ack) = self.ack {
            return Some(UiCommand::Ack {
                cron: ack.cron,
                machine: ack.machine,
                position: ack.position,
            });
        }
        if let Some(cron) = self.run {
            return Some(UiCommand::Run(cron));
        }
        if let Some(cron) = self.kill_cron {
            return Some(UiCommand::KillCron(cron));
        }
        if let Some(payload) = self.kill_machine {
            return Some(UiCommand::KillMachine {
                cron: payload.cron,
                machine: payload.machine,
                instance: payload.instance,
            });
        }
        if let Some(params) = self.get_timeline {
            return Some(UiCommand::GetTimeline(params));
        }
        None
    }
}

/// Per-cron status summary sent in the periodic broadcast (§5.2).
#[derive(Debug, Clone, Serialize)]
pub struct CronStatus {
    pub name: String,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: bool,
    pub running: bool,
    pub group: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Config {
        serial: u64,
        crons: Vec<CronDefinition>,
        bad: Vec<(String, String)>,
    },
    Status {
        serial: u64,
        crons: Vec<CronStatus>,
    },
    Details {
        cron: String,
        results: Vec<(String, MachineResult)>,
    },
    OutputChunk {
        cron: String,
        machine: String,
        position: usize,
        chunk: String,
        /// Length of the machine's full accumulated output as of this
        /// push — lets a client tell a short chunk from a short *total*
        /// without waiting for `is_complete` (§4.4 step 3).
        total_length: usize,
        /// Whether the machine's result was terminal (`endtime` set) at
        /// the moment this chunk was built.
        is_complete: bool,
        /// True when the stored output was shorter than the client's
        /// cursor (a new instance truncated it) and the cursor was reset
        /// to 0 (§4.4 step 3, §8 "UI cursor monotonicity").
        truncated: bool,
    },
    Timeline {
        id: u64,
        entries: Vec<Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_takes_precedence_and_resolves() {
        let raw: RawInbound = serde_json::from_str(r#"{"subscribe":"foo"}"#).unwrap();
        assert!(matches!(raw.resolve(), Some(UiCommand::Subscribe(c)) if c == vec!["foo".to_string()]));
    }

    #[test]
    fn subscribe_accepts_a_list_of_crons() {
        let raw: RawInbound = serde_json::from_str(r#"{"subscribe":["foo","bar"]}"#).unwrap();
        assert!(matches!(
            raw.resolve(),
            Some(UiCommand::Subscribe(c)) if c == vec!["foo".to_string(), "bar".to_string()]
        ));
    }

    #[test]
    fn kill_machine_resolves_with_optional_instance() {
        let raw: RawInbound =
            serde_json::from_str(r#"{"killMachine":{"cron":"foo","machine":"a","instance":"foo:3"}}"#).unwrap();
        match raw.resolve() {
            Some(UiCommand::KillMachine { cron, machine, instance }) => {
                assert_eq!(cron, "foo");
                assert_eq!(machine, "a");
                assert_eq!(instance.as_deref(), Some("foo:3"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn empty_object_resolves_to_none() {
        let raw: RawInbound = serde_json::from_str("{}").unwrap();
        assert!(raw.resolve().is_none());
    }
}
