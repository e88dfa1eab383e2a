//! Machine endpoint (C2): accepts one persistent bidirectional connection
//! per `(instance, machine)`, enforces output-sequence ordering, and
//! finalizes `MachineResult`s.

pub mod kill;
pub mod protocol;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::state::SharedState;
use crate::types::{InstanceId, MachineId, MachineResult, RETCODE_WRAPPER_ERROR};
use protocol::{AckType, InboundMessage, OutboundMessage};

/// Per-`(instance, machine)` connection bookkeeping (§4.2 "Connection
/// state").
pub struct ConnectionHandle {
    pub sender: mpsc::Sender<OutboundMessage>,
    pub last_seen: SyncMutex<DateTime<Utc>>,
    pub next_expected_seq: AtomicU64,
    pub last_acked_seq: AtomicI64,
}

impl ConnectionHandle {
    fn new(sender: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            sender,
            last_seen: SyncMutex::new(Utc::now()),
            next_expected_seq: AtomicU64::new(0),
            last_acked_seq: AtomicI64::new(-1),
        }
    }
}

/// Key identifying a live connection: `(job_instance, machine)`.
type ConnKey = (String, String);

pub struct MachineEndpoint {
    state: SharedState,
    connections: dashmap::DashMap<ConnKey, Arc<ConnectionHandle>>,
}

impl MachineEndpoint {
    pub fn new(state: SharedState) -> Arc<Self> {
        Arc::new(Self {
            state,
            connections: dashmap::DashMap::new(),
        })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self)
    }

    fn register(&self, key: &ConnKey, sender: mpsc::Sender<OutboundMessage>) -> Arc<ConnectionHandle> {
        self.connections
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ConnectionHandle::new(sender)))
            .clone()
    }

    fn deregister(&self, key: &ConnKey) {
        self.connections.remove(key);
    }

    /// Look up a live connection by `(job_instance, machine)`, used by
    /// the kill-management tick to transmit `kill` (§4.2).
    pub fn connection(&self, job_instance: &str, machine: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections
            .get(&(job_instance.to_string(), machine.to_string()))
            .map(|e| e.clone())
    }

    /// Process one inbound message under the per-cron lock, mutating
    /// shared state and the connection's sequence tracking, and return
    /// the reply (if any) to send back on the same socket.
    pub fn handle_message(&self, conn: &ConnectionHandle, msg: &InboundMessage) -> Option<OutboundMessage> {
        match msg {
            InboundMessage::Connect { common } => {
                *conn.last_seen.lock() = common.timestamp_or_now();
                Some(OutboundMessage::ack(AckType::Connect, None))
            }

            InboundMessage::Start { common, version, .. } => {
                let instance = InstanceId(common.job_instance.clone());
                let known = {
                    let running = self.state.running.lock();
                    match running.get(&instance) {
                        Some(inst) => inst.machines.contains(&MachineId(common.machine.clone())),
                        None => false,
                    }
                };
                if !known {
                    warn!(instance = %common.job_instance, machine = %common.machine, "start from unknown/unexpected instance; dropping");
                    return None;
                }
                let slot = self.state.job_slot(&common.job_name);
                let mut st = slot.state.write();
                let ts = common.timestamp_or_now();
                let result = st
                    .results
                    .entry(MachineId(common.machine.clone()))
                    .or_default();
                result.starttime = Some(ts);
                result.ret = String::new();
                result.retcode = None;
                result.endtime = None;
                result.wrapper_version = version.clone();
                Some(OutboundMessage::ack(AckType::Start, None))
            }

            InboundMessage::Heartbeat { common } => {
                *conn.last_seen.lock() = common.timestamp_or_now();
                let slot = self.state.job_slot(&common.job_name);
                let mut st = slot.state.write();
                if let Some(result) = st.results.get_mut(&MachineId(common.machine.clone())) {
                    result.last_heartbeat = Some(common.timestamp_or_now());
                }
                None
            }

            InboundMessage::Output { common, seq, data, .. } => {
                let instance = InstanceId(common.job_instance.clone());
                if !self.state.running.lock().contains_key(&instance) {
                    return None;
                }
                let Some(seq) = *seq else {
                    // No sequence number supplied: accept unconditionally,
                    // cannot enforce ordering. Dispatch the ack before the
                    // state write (§4.2: ack first, to minimize wrapper
                    // stall) since there's nothing left to order on.
                    let _ = conn.sender.try_send(OutboundMessage::ack(AckType::Output, None));
                    let slot = self.state.job_slot(&common.job_name);
                    let mut st = slot.state.write();
                    let result = st
                        .results
                        .entry(MachineId(common.machine.clone()))
                        .or_default();
                    result.ret.push_str(data);
                    return None;
                };

                let expected = conn.next_expected_seq.load(Ordering::SeqCst);
                if seq < expected {
                    return Some(OutboundMessage::ack(AckType::Output, Some(seq)));
                }
                if seq > expected {
                    return Some(OutboundMessage::nack_out_of_order(expected, seq));
                }

                conn.next_expected_seq.store(seq + 1, Ordering::SeqCst);
                conn.last_acked_seq.store(seq as i64, Ordering::SeqCst);

                // Ack before finalizing the state write (§4.2: "ack before
                // finalizing the write, to minimize wrapper stall") — the
                // wrapper only needs the ack to advance its send window; it
                // doesn't observe when the append lands in `results`.
                let _ = conn.sender.try_send(OutboundMessage::ack(AckType::Output, Some(seq)));

                let slot = self.state.job_slot(&common.job_name);
                let mut st = slot.state.write();
                let result = st
                    .results
                    .entry(MachineId(common.machine.clone()))
                    .or_default();
                result.ret.push_str(data);
                result.last_output_seq = Some(seq);
                None
            }

            InboundMessage::SyncRequest { .. } => Some(OutboundMessage::SyncResponse {
                last_seq: conn.last_acked_seq.load(Ordering::SeqCst),
                timestamp: Utc::now(),
            }),

            InboundMessage::Complete { common, retcode, seq } => {
                let slot = self.state.job_slot(&common.job_name);
                let mut st = slot.state.write();
                let result = st
                    .results
                    .entry(MachineId(common.machine.clone()))
                    .or_default();
                if result.is_terminal() {
                    warn!(
                        instance = %common.job_instance,
                        machine = %common.machine,
                        "terminal stickiness: dropping late complete after force-finalization"
                    );
                } else {
                    let ts = common.timestamp_or_now();
                    if result.starttime.is_none() {
                        result.starttime = Some(ts);
                    }
                    result.endtime = Some(ts);
                    result.retcode = Some(*retcode);
                }
                Some(OutboundMessage::ack(AckType::Complete, *seq))
            }

            InboundMessage::Killed { common } => {
                info!(instance = %common.job_instance, machine = %common.machine, "wrapper acknowledged kill");
                None
            }

            InboundMessage::Error { common, error } => {
                let slot = self.state.job_slot(&common.job_name);
                let mut st = slot.state.write();
                let result = st
                    .results
                    .entry(MachineId(common.machine.clone()))
                    .or_default();
                if !result.is_terminal() {
                    let ts = common.timestamp_or_now();
                    if result.starttime.is_none() {
                        result.starttime = Some(ts);
                    }
                    result.endtime = Some(ts);
                    result.retcode = Some(RETCODE_WRAPPER_ERROR);
                    result.ret = format!("Wrapper error: {error}");
                }
                None
            }
        }
    }
}

async fn ws_handler(
    State(endpoint): State<Arc<MachineEndpoint>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, endpoint))
}

async fn handle_socket(socket: WebSocket, endpoint: Arc<MachineEndpoint>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(64);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "failed to encode outbound machine-endpoint message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut current_key: Option<ConnKey> = None;

    while let Some(next) = stream.next().await {
        let msg = match next {
            Ok(m) => m,
            Err(_) => break,
        };
        match msg {
            Message::Text(text) => {
                let parsed: InboundMessage = match serde_json::from_str(&text) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "malformed machine-endpoint message; ignoring");
                        continue;
                    }
                };
                let key: ConnKey = (parsed.common().job_instance.clone(), parsed.common().machine.clone());
                let conn = endpoint.register(&key, tx.clone());
                let ends = parsed.ends_connection();
                if let Some(reply) = endpoint.handle_message(&conn, &parsed) {
                    let _ = conn.sender.send(reply).await;
                }
                if ends {
                    endpoint.deregister(&key);
                    current_key = None;
                } else {
                    current_key = Some(key);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(key) = current_key {
        endpoint.deregister(&key);
    }
    writer.abort();
}
