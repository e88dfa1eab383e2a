//! Saltpeter controller binary: wires the shared state store to the
//! scheduler, the machine endpoint (and its kill-management tick), and the
//! operator-facing UI endpoint, then serves both HTTP surfaces until
//! shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};

use saltpeter::config;
use saltpeter::machine_endpoint::kill::KillManager;
use saltpeter::machine_endpoint::MachineEndpoint;
use saltpeter::scheduler::{ListTargetResolver, Scheduler, SchedulerConfig, SpawnArgs, WrapperSpawner};
use saltpeter::state::SharedState;
use saltpeter::types::error::SchedulerError;
use saltpeter::types::MachineId;
use saltpeter::ui_endpoint::UiEndpoint;

#[derive(Parser)]
#[command(name = "saltpeter")]
#[command(about = "Distributed cron: wall-clock scheduling, fleet dispatch, live output streaming")]
#[command(version)]
struct Cli {
    /// Directory of YAML cron-definition files.
    #[arg(short, long, default_value = "/etc/saltpeter/conf.d", global = true)]
    config_dir: PathBuf,

    /// Verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller: scheduler, machine endpoint and UI endpoint.
    Run {
        /// Address the machine endpoint (wrapper ingress) listens on.
        #[arg(long, default_value = "0.0.0.0:8888")]
        machine_bind: SocketAddr,

        /// Address the UI endpoint (HTTP + WebSocket) listens on.
        #[arg(long, default_value = "0.0.0.0:8889")]
        ui_bind: SocketAddr,

        /// URL wrappers should use to reach the machine endpoint, passed
        /// through to each spawned wrapper as `endpoint_url`.
        #[arg(long)]
        endpoint_url: String,

        /// Shell template used to deliver the wrapper binary to a target
        /// machine, e.g. `ssh {user}@{machine} saltpeter-wrapper {endpoint_url} {name} {instance_id} {machine} {command} {cwd} {user}`.
        /// The real remote-execution primitive is an external collaborator
        /// (§1); this is the injectable seam production deployments wire
        /// up to it.
        #[arg(long)]
        spawn_template: String,
    },
    /// Load the config directory and report parse/validation errors
    /// without starting the controller.
    CheckConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Run {
            machine_bind,
            ui_bind,
            endpoint_url,
            spawn_template,
        } => run_controller(&cli.config_dir, machine_bind, ui_bind, endpoint_url, spawn_template).await,
        Commands::CheckConfig => check_config(&cli.config_dir),
    };

    if let Err(e) = result {
        error!(error = %e, "saltpeter exited with an error");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .init();
}

fn check_config(config_dir: &PathBuf) -> anyhow::Result<()> {
    let loaded = config::load_dir(config_dir)?;
    info!(valid = loaded.crons.len(), invalid = loaded.bad.len(), "config directory loaded");
    for (name, def) in &loaded.crons {
        info!(cron = %name, expression = %def.cron_expression(), targets = def.targets.len(), "ok");
    }
    for (name, reason) in &loaded.bad {
        error!(cron = %name, %reason, "invalid");
    }
    if !loaded.bad.is_empty() {
        anyhow::bail!("{} cron(s) failed validation", loaded.bad.len());
    }
    Ok(())
}

async fn run_controller(
    config_dir: &PathBuf,
    machine_bind: SocketAddr,
    ui_bind: SocketAddr,
    endpoint_url: String,
    spawn_template: String,
) -> anyhow::Result<()> {
    let state = SharedState::new();

    let loaded = config::load_dir(config_dir)?;
    for (name, reason) in &loaded.bad {
        state.bad_crons.insert(name.clone(), reason.clone());
    }
    state
        .config
        .store(Arc::new(saltpeter::types::ConfigSnapshot {
            crons: loaded.crons,
            serial: 1,
        }));

    let machine_endpoint = MachineEndpoint::new(state.clone());
    let kill_manager = KillManager::new(state.clone(), machine_endpoint.clone());
    let ui_endpoint = UiEndpoint::new(state.clone());

    let scheduler = Arc::new(Scheduler::new(
        state.clone(),
        SchedulerConfig::new(config_dir.clone(), endpoint_url),
        Arc::new(ListTargetResolver),
        Arc::new(TemplateSpawner::new(spawn_template)),
    ));

    let scheduler_handle = scheduler.clone().spawn();
    let kill_handle = kill_manager.clone().spawn();

    let machine_router = machine_endpoint.router();
    let ui_router = ui_endpoint.router();

    let machine_listener = TcpListener::bind(machine_bind).await?;
    let ui_listener = TcpListener::bind(ui_bind).await?;
    info!(%machine_bind, %ui_bind, "saltpeter controller listening");

    let machine_server = axum::serve(machine_listener, machine_router);
    let ui_server = axum::serve(ui_listener, ui_router);

    tokio::select! {
        res = machine_server => { res?; }
        res = ui_server => { res?; }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    scheduler.shutdown_handle().notify_one();
    kill_manager.shutdown_handle().notify_one();
    let _ = scheduler_handle.await;
    let _ = kill_handle.await;
    Ok(())
}

/// Fire-and-forget wrapper delivery via a configurable shell template.
/// Substitutes `{endpoint_url} {name} {instance_id} {machine} {command}
/// {cwd} {user}` and spawns it detached; the wrapper reports its own
/// lifecycle back to the machine endpoint, so this only needs to succeed
/// at *starting* the remote command, not at waiting for it.
struct TemplateSpawner {
    template: String,
}

impl TemplateSpawner {
    fn new(template: String) -> Self {
        Self { template }
    }

    fn render(&self, args: &SpawnArgs) -> String {
        self.template
            .replace("{endpoint_url}", &args.endpoint_url)
            .replace("{name}", &args.name)
            .replace("{instance_id}", &args.instance_id.to_string())
            .replace("{machine}", &args.machine.0)
            .replace("{command}", &shell_quote(&args.command))
            .replace("{cwd}", &args.cwd)
            .replace("{user}", &args.user)
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[async_trait]
impl WrapperSpawner for TemplateSpawner {
    async fn spawn(&self, machine: &MachineId, args: &SpawnArgs) -> Result<(), SchedulerError> {
        let rendered = self.render(args);
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&rendered)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| SchedulerError::SpawnFailed {
                name: args.name.clone(),
                machine: machine.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}
