//! Wrapper agent binary (C3): runs on a target machine, executes one
//! cron's command, and streams its lifecycle back to the machine endpoint.
//!
//! CLI per §6: `saltpeter-wrapper <endpoint_url> <job_name> <job_instance>
//! <machine_id> <command> [cwd] [user]`.

use clap::Parser;
use tracing::error;

use saltpeter::wrapper::{self, WrapperConfig};

#[derive(Parser)]
#[command(name = "saltpeter-wrapper")]
#[command(about = "Executes one cron command on this machine and reports back to the endpoint")]
#[command(version)]
struct Cli {
    /// WebSocket URL of the machine endpoint, e.g. `ws://controller:8888`.
    endpoint_url: String,
    /// Cron name this instance belongs to.
    job_name: String,
    /// Instance id allocated by the scheduler, `<name>:<counter>`.
    job_instance: String,
    /// This machine's id, as resolved by the scheduler's target resolver.
    machine: String,
    /// Shell command to execute.
    command: String,
    /// Working directory for the command.
    #[arg(default_value = "/")]
    cwd: String,
    /// User the command is expected to run as (informational; see
    /// [`WrapperConfig::user`]).
    #[arg(default_value = "root")]
    user: String,

    /// Verbose (debug-level) logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    let config = WrapperConfig {
        endpoint_url: cli.endpoint_url,
        job_name: cli.job_name,
        job_instance: cli.job_instance,
        machine: cli.machine,
        command: cli.command,
        cwd: cli.cwd,
        user: cli.user,
    };

    if let Err(e) = wrapper::run(config).await {
        error!(error = %e, "wrapper exited with an error");
        std::process::exit(1);
    }
}
