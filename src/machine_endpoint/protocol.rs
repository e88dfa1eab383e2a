//! Wire protocol for the machine endpoint (C2 <-> C3), modeled as tagged
//! sum types per DESIGN NOTES §9 rather than open JSON maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fields common to every inbound message (§4.2, §6).
#[derive(Debug, Clone, Deserialize)]
pub struct Common {
    pub job_name: String,
    pub job_instance: String,
    pub machine: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Common {
    pub fn timestamp_or_now(&self) -> DateTime<Utc> {
        self.timestamp.unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Connect {
        #[serde(flatten)]
        common: Common,
    },
    Start {
        #[serde(flatten)]
        common: Common,
        pid: Option<u32>,
        version: Option<String>,
    },
    Heartbeat {
        #[serde(flatten)]
        common: Common,
    },
    Output {
        #[serde(flatten)]
        common: Common,
        seq: Option<u64>,
        #[serde(default)]
        stream: Option<String>,
        #[serde(default)]
        data: String,
    },
    SyncRequest {
        #[serde(flatten)]
        common: Common,
        #[serde(default = "default_last_acked")]
        last_acked_seq: i64,
        #[serde(default)]
        next_seq: u64,
    },
    Complete {
        #[serde(flatten)]
        common: Common,
        retcode: i32,
        seq: Option<u64>,
    },
    Killed {
        #[serde(flatten)]
        common: Common,
    },
    Error {
        #[serde(flatten)]
        common: Common,
        error: String,
    },
}

fn default_last_acked() -> i64 {
    -1
}

impl InboundMessage {
    pub fn common(&self) -> &Common {
        match self {
            InboundMessage::Connect { common }
            | InboundMessage::Start { common, .. }
            | InboundMessage::Heartbeat { common }
            | InboundMessage::Output { common, .. }
            | InboundMessage::SyncRequest { common, .. }
            | InboundMessage::Complete { common, .. }
            | InboundMessage::Killed { common }
            | InboundMessage::Error { common, .. } => common,
        }
    }

    /// Whether this message type ends the connection's lifetime from the
    /// endpoint's point of view (§4.2: "Drop the connection entry").
    pub fn ends_connection(&self) -> bool {
        matches!(self, InboundMessage::Complete { .. } | InboundMessage::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckType {
    Connect,
    Start,
    Output,
    Complete,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NackType {
    OutOfOrder,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Ack {
        ack_type: AckType,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    Nack {
        nack_type: NackType,
        expected_seq: u64,
        received_seq: u64,
        timestamp: DateTime<Utc>,
    },
    Kill {
        job_name: String,
        job_instance: String,
        machine: String,
        timestamp: DateTime<Utc>,
    },
    SyncResponse {
        last_seq: i64,
        timestamp: DateTime<Utc>,
    },
}

impl OutboundMessage {
    pub fn ack(ack_type: AckType, seq: Option<u64>) -> Self {
        OutboundMessage::Ack {
            ack_type,
            seq,
            timestamp: Utc::now(),
        }
    }

    pub fn nack_out_of_order(expected_seq: u64, received_seq: u64) -> Self {
        OutboundMessage::Nack {
            nack_type: NackType::OutOfOrder,
            expected_seq,
            received_seq,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_message_round_trips_common_fields() {
        let raw = r#"{"type":"connect","job_name":"foo","job_instance":"foo:1","machine":"a","timestamp":"2024-01-01T00:00:00Z"}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.common().job_name, "foo");
        assert!(matches!(msg, InboundMessage::Connect { .. }));
    }

    #[test]
    fn output_message_parses_seq_and_data() {
        let raw = r#"{"type":"output","job_name":"foo","job_instance":"foo:1","machine":"a","seq":0,"stream":"stdout","data":"hi\n"}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        match msg {
            InboundMessage::Output { seq, data, .. } => {
                assert_eq!(seq, Some(0));
                assert_eq!(data, "hi\n");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn complete_and_error_end_the_connection() {
        let raw = r#"{"type":"complete","job_name":"foo","job_instance":"foo:1","machine":"a","retcode":0,"seq":3}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.ends_connection());
    }

    #[test]
    fn ack_serializes_without_seq_field_when_absent() {
        let ack = OutboundMessage::ack(AckType::Connect, None);
        let json = serde_json::to_string(&ack).unwrap();
        assert!(!json.contains("\"seq\""));
        assert!(json.contains("\"ack_type\":\"connect\""));
    }
}
