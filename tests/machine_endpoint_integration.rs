//! End-to-end exercise of the machine endpoint (C2) over a real WebSocket
//! connection, covering §8 scenario 1 ("happy path") and scenario 3
//! ("out-of-order output never applies").

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use saltpeter::machine_endpoint::MachineEndpoint;
use saltpeter::state::SharedState;
use saltpeter::types::{InstanceId, MachineId, RunningInstance};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

async fn start_server(state: SharedState) -> (String, tokio::task::JoinHandle<()>) {
    let endpoint = MachineEndpoint::new(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = endpoint.router();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("ws://{addr}/ws"), handle)
}

fn seed_running(state: &SharedState, cron: &str, machines: &[&str]) -> InstanceId {
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
async fn happy_path_connect_start_output_complete() {
    let state = SharedState::new();
    let instance = seed_running(&state, "foo", &["a"]);
    let (url, _server) = start_server(state.clone()).await;

    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut write, mut read) = ws.split();

    let send = |v: Value| Message::Text(v.to_string());

    write
        .send(send(json!({
            "type": "connect", "job_name": "foo", "job_instance": instance.0, "machine": "a",
        })))
        .await
        .unwrap();
    let ack = read.next().await.unwrap().unwrap();
    assert!(as_json(&ack)["ack_type"] == "connect");

    write
        .send(send(json!({
            "type": "start", "job_name": "foo", "job_instance": instance.0, "machine": "a",
            "pid": 123, "version": "1.0",
        })))
        .await
        .unwrap();
    let ack = read.next().await.unwrap().unwrap();
    assert!(as_json(&ack)["ack_type"] == "start");

    write
        .send(send(json!({
            "type": "output", "job_name": "foo", "job_instance": instance.0, "machine": "a",
            "seq": 0, "stream": "stdout", "data": "hi\n",
        })))
        .await
        .unwrap();
    let ack = read.next().await.unwrap().unwrap();
    assert_eq!(as_json(&ack)["seq"], 0);

    write
        .send(send(json!({
            "type": "complete", "job_name": "foo", "job_instance": instance.0, "machine": "a",
            "retcode": 0, "seq": 1,
        })))
        .await
        .unwrap();
    let ack = read.next().await.unwrap().unwrap();
    assert!(as_json(&ack)["ack_type"] == "complete");

    let slot = state.job_slot("foo");
    let st = slot.state.read();
    let result = st.results.get(&MachineId::from("a")).unwrap();
    assert_eq!(result.ret, "hi\n");
    assert_eq!(result.retcode, Some(0));
    assert!(result.endtime.is_some());
}

#[tokio::test]
async fn out_of_order_output_over_the_wire_nacks_and_does_not_apply() {
    let state = SharedState::new();
    let instance = seed_running(&state, "foo", &["a"]);
    let (url, _server) = start_server(state.clone()).await;

    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut write, mut read) = ws.split();

    write
        .send(Message::Text(
            json!({
                "type": "output", "job_name": "foo", "job_instance": instance.0, "machine": "a",
                "seq": 1, "data": "x",
            })
            .to_string(),
        ))
        .await
        .unwrap();

    let reply = read.next().await.unwrap().unwrap();
    let parsed = as_json(&reply);
    assert_eq!(parsed["type"], "nack");
    assert_eq!(parsed["expected_seq"], 0);
    assert_eq!(parsed["received_seq"], 1);

    let slot = state.job_slot("foo");
    assert!(slot
        .state
        .read()
        .results
        .get(&MachineId::from("a"))
        .is_none());
}

fn as_json(msg: &Message) -> Value {
    match msg {
        Message::Text(t) => serde_json::from_str(t).unwrap(),
        other => panic!("expected text message, got {other:?}"),
    }
}
