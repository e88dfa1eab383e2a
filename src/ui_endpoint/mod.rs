//! UI endpoint (C5): HTTP snapshot routes plus a per-connection
//! websocket that multiplexes config/status/output/timeline updates and
//! accepts operator intents (subscribe, run, kill, timeline queries).

pub mod protocol;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::state::SharedState;
use crate::types::{Command, InstanceId, MachineId};
use protocol::{CronStatus, OutboundMessage, RawInbound, UiCommand};

const BROADCAST_INTERVAL: Duration = Duration::from_secs(2);
const OUTPUT_CHUNK_CAP: usize = 64 * 1024;

/// Tunables mirroring the teacher's `HttpApiConfig` shape — broken out so
/// tests can use a faster broadcast cadence than production's 2 s (§4.4).
#[derive(Debug, Clone)]
pub struct UiEndpointConfig {
    pub broadcast_interval: Duration,
}

impl Default for UiEndpointConfig {
    fn default() -> Self {
        Self {
            broadcast_interval: BROADCAST_INTERVAL,
        }
    }
}

pub struct UiEndpoint {
    state: SharedState,
    config: UiEndpointConfig,
}

impl UiEndpoint {
    pub fn new(state: SharedState) -> Arc<Self> {
        Self::with_config(state, UiEndpointConfig::default())
    }

    pub fn with_config(state: SharedState, config: UiEndpointConfig) -> Arc<Self> {
        Arc::new(Self { state, config })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/version", get(version_handler))
            .route("/config", get(config_handler))
            .route("/running", get(running_handler))
            .route("/timeline", get(timeline_handler))
            .route("/ws", get(ws_handler))
            .layer(CorsLayer::permissive())
            .with_state(self)
    }
}

/// Largest byte index `<= index` that lands on a UTF-8 char boundary, so
/// output chunking never splits a multi-byte sequence (`str::floor_char_boundary`
/// is nightly-only as of this writing).
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

async fn version_handler() -> impl IntoResponse {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn config_handler(State(endpoint): State<Arc<UiEndpoint>>) -> impl IntoResponse {
    let snapshot = endpoint.state.config.load();
    let bad: Vec<(String, String)> = endpoint
        .state
        .bad_crons
        .iter()
        .map(|e| (e.key().clone(), e.value().clone()))
        .collect();
    Json(json!({
        "serial": snapshot.serial,
        "crons": snapshot.crons.values().cloned().collect::<Vec<_>>(),
        "bad": bad,
    }))
}

async fn running_handler(State(endpoint): State<Arc<UiEndpoint>>) -> impl IntoResponse {
    let running = endpoint.state.running.lock();
    Json(running.values().cloned().collect::<Vec<_>>())
}

async fn timeline_handler(State(endpoint): State<Arc<UiEndpoint>>) -> impl IntoResponse {
    let tml = endpoint.state.timeline.read();
    Json(json!({ "id": tml.id, "entries": tml.entries }))
}

struct ConnectionState {
    subscriptions: SyncMutex<HashSet<String>>,
    output_positions: SyncMutex<HashMap<(String, String), usize>>,
    last_cfg_serial: AtomicU64,
    last_tml_id: AtomicU64,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            subscriptions: SyncMutex::new(HashSet::new()),
            output_positions: SyncMutex::new(HashMap::new()),
            last_cfg_serial: AtomicU64::new(u64::MAX),
            last_tml_id: AtomicU64::new(u64::MAX),
        }
    }
}

async fn ws_handler(State(endpoint): State<Arc<UiEndpoint>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, endpoint))
}

async fn handle_socket(socket: WebSocket, endpoint: Arc<UiEndpoint>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(64);
    let conn = Arc::new(ConnectionState::new());

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "failed to encode outbound ui-endpoint message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut ticker = tokio::time::interval(endpoint.config.broadcast_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if broadcast(&endpoint, &conn, &tx).await.is_err() {
                    break;
                }
            }
            next = stream.next() => {
                match next {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&endpoint, &conn, &text);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    writer.abort();
}

/// Resolve an omitted `killMachine` instance to the cron's current
/// running instance, if any (§4.4: "resolve instance from running if
/// omitted").
fn resolve_instance(endpoint: &Arc<UiEndpoint>, cron: &str) -> Option<InstanceId> {
    endpoint
        .state
        .running
        .lock()
        .values()
        .find(|inst| inst.name == cron)
        .map(|inst| inst.instance_id.clone())
}

fn handle_inbound(endpoint: &Arc<UiEndpoint>, conn: &Arc<ConnectionState>, text: &str) {
    let raw: RawInbound = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "malformed ui-endpoint message; ignoring");
            return;
        }
    };
    let Some(cmd) = raw.resolve() else { return };

    match cmd {
        UiCommand::Subscribe(crons) => {
            let mut subs = conn.subscriptions.lock();
            subs.extend(crons);
        }
        UiCommand::Unsubscribe(crons) => {
            let mut subs = conn.subscriptions.lock();
            for cron in &crons {
                subs.remove(cron);
            }
        }
        UiCommand::Ack { cron, machine, position } => {
            let mut positions = conn.output_positions.lock();
            let key = (cron, machine);
            let current = positions.get(&key).copied().unwrap_or(0);
            positions.insert(key, current.max(position));
        }
        UiCommand::Run(cron) => endpoint.state.push_command(Command::RunNow { cron }),
        UiCommand::KillCron(cron) => endpoint.state.push_command(Command::KillCron { cron }),
        UiCommand::KillMachine { cron, machine, instance } => {
            let instance = instance
                .map(InstanceId)
                .or_else(|| resolve_instance(endpoint, &cron));
            endpoint.state.push_command(Command::KillMachine {
                cron,
                machine: MachineId::from(machine),
                instance,
            })
        }
        UiCommand::GetTimeline(params) => endpoint.state.push_command(Command::GetTimeline { params }),
    }
}

async fn broadcast(
    endpoint: &Arc<UiEndpoint>,
    conn: &Arc<ConnectionState>,
    tx: &mpsc::Sender<OutboundMessage>,
) -> Result<(), ()> {
    let snapshot = endpoint.state.config.load_full();

    if conn.last_cfg_serial.swap(snapshot.serial, Ordering::SeqCst) != snapshot.serial {
        let bad: Vec<(String, String)> = endpoint
            .state
            .bad_crons
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let msg = OutboundMessage::Config {
            serial: snapshot.serial,
            crons: snapshot.crons.values().cloned().collect(),
            bad,
        };
        if tx.send(msg).await.is_err() {
            return Err(());
        }
    }

    let running_names: HashSet<String> = endpoint
        .state
        .running
        .lock()
        .values()
        .map(|r| r.name.clone())
        .collect();

    let statuses: Vec<CronStatus> = snapshot
        .crons
        .values()
        .map(|def| {
            let slot = endpoint.state.job_slot(&def.name);
            let st = slot.state.read();
            CronStatus {
                name: def.name.clone(),
                next_run: st.next_run,
                last_run: st.last_run,
                last_success: st.last_success,
                running: running_names.contains(&def.name),
                group: st.group.clone(),
            }
        })
        .collect();

    if tx
        .send(OutboundMessage::Status { serial: snapshot.serial, crons: statuses })
        .await
        .is_err()
    {
        return Err(());
    }

    let subscriptions = conn.subscriptions.lock().clone();
    for cron in &subscriptions {
        let slot = endpoint.state.job_slot(cron);
        let results: Vec<(String, crate::types::MachineResult)> = {
            let st = slot.state.read();
            st.results.iter().map(|(m, r)| (m.0.clone(), r.clone())).collect()
        };

        if tx
            .send(OutboundMessage::Details { cron: cron.clone(), results: results.clone() })
            .await
            .is_err()
        {
            return Err(());
        }

        for (machine, result) in &results {
            let key = (cron.clone(), machine.clone());
            let mut positions = conn.output_positions.lock();
            let position = *positions.get(&key).unwrap_or(&0);

            let (start, truncated) = if position > result.ret.len() {
                (0, true)
            } else {
                (position, false)
            };

            let remaining = &result.ret[start..];
            if remaining.is_empty() && !truncated {
                continue;
            }
            let (chunk, new_position) = if remaining.len() > OUTPUT_CHUNK_CAP {
                let split = floor_char_boundary(remaining, OUTPUT_CHUNK_CAP);
                (remaining[..split].to_string(), start + split)
            } else {
                (remaining.to_string(), start + remaining.len())
            };
            positions.insert(key, new_position);
            drop(positions);

            if tx
                .send(OutboundMessage::OutputChunk {
                    cron: cron.clone(),
                    machine: machine.clone(),
                    position: new_position,
                    chunk,
                    total_length: result.ret.len(),
                    is_complete: result.is_terminal(),
                    truncated,
                })
                .await
                .is_err()
            {
                return Err(());
            }
        }
    }

    let tml = endpoint.state.timeline.read();
    let tml_id = tml.id;
    let entries = tml.entries.clone();
    drop(tml);
    if conn.last_tml_id.swap(tml_id, Ordering::SeqCst) != tml_id {
        if tx.send(OutboundMessage::Timeline { id: tml_id, entries }).await.is_err() {
            return Err(());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_starts_with_no_subscriptions() {
        let conn = ConnectionState::new();
        assert!(conn.subscriptions.lock().is_empty());
        assert_eq!(conn.last_cfg_serial.load(Ordering::SeqCst), u64::MAX);
    }
}
