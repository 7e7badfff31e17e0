//! Sandbridge - sandbox host and authenticating gateway.
//!
//! Usage:
//!   sandbridge sandbox [--port 4000] [--workspace /workspace/projects]
//!   sandbridge gateway [--port 3000] [--sandbox-url http://sandbox:4000] --jwt-secret <secret>

use anyhow::Context;
use clap::{Parser, Subcommand};
use sandbridge::config::{self, GatewayConfig, SandboxConfig};
use sandbridge::gateway::{self, auth::JwtVerifier, store::FileProjectStore, GatewayState};
use sandbridge::http_server;
use sandbridge::state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sandbridge")]
#[command(about = "Workspace-confined terminals and agent runs behind an authenticating gateway")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sandbox host
    Sandbox {
        #[arg(long, env = "PORT", default_value = "4000")]
        port: u16,

        /// Directory holding every workspace
        #[arg(long, env = "WORKSPACE_BASE", default_value = config::DEFAULT_WORKSPACE_ROOT)]
        workspace: PathBuf,

        /// Extra location of the agent CLI, probed after the workspace-local install
        #[arg(long, env = "AGENT_BIN")]
        agent_bin: Option<PathBuf>,

        #[arg(long, env = "GIT_TIMEOUT_SECS", default_value = "300")]
        git_timeout_secs: u64,

        #[arg(long, env = "AGENT_TIMEOUT_SECS", default_value = "600")]
        agent_timeout_secs: u64,

        #[arg(long, env = "TERMINAL_TIMEOUT_SECS", default_value = "3600")]
        terminal_timeout_secs: u64,
    },
    /// Run the gateway
    Gateway {
        #[arg(long, env = "PORT", default_value = "3000")]
        port: u16,

        #[arg(long, env = "SANDBOX_URL", default_value = "http://sandbox:4000")]
        sandbox_url: String,

        /// Workspace root on the sandbox host; ids are confined against it
        #[arg(long, env = "WORKSPACE_BASE", default_value = config::DEFAULT_WORKSPACE_ROOT)]
        workspace: PathBuf,

        /// JSON file holding project ownership records
        #[arg(long, env = "PROJECTS_DB", default_value = ".projects.db")]
        projects_db: PathBuf,

        /// HS256 secret for bearer tokens
        #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
        jwt_secret: String,

        #[arg(long, env = "JWT_ISSUER")]
        jwt_issuer: Option<String>,

        #[arg(long, env = "AGENT_TIMEOUT_SECS", default_value = "300")]
        agent_timeout_secs: u64,

        /// Bound on reaching the sandbox host, WebSocket handshake included
        #[arg(long, env = "SANDBOX_CONNECT_TIMEOUT_SECS", default_value = "10")]
        connect_timeout_secs: u64,

        #[arg(long, env = "PENDING_QUEUE_LIMIT", default_value_t = config::PENDING_QUEUE_LIMIT)]
        pending_queue_limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    if nix::unistd::geteuid().is_root() {
        warn!("Running as root; spawned shells and agents inherit root privileges");
    }

    match args.command {
        Commands::Sandbox {
            port,
            workspace,
            agent_bin,
            git_timeout_secs,
            agent_timeout_secs,
            terminal_timeout_secs,
        } => {
            let mut config = SandboxConfig {
                workspace_root: workspace,
                git_timeout: Duration::from_secs(git_timeout_secs),
                agent_timeout: Duration::from_secs(agent_timeout_secs),
                terminal_timeout: Duration::from_secs(terminal_timeout_secs),
                ..Default::default()
            };
            if let Some(bin) = agent_bin {
                config.agent_binaries.insert(0, bin);
            }
            std::fs::create_dir_all(&config.workspace_root).with_context(|| {
                format!("creating workspace root {}", config.workspace_root.display())
            })?;

            let state = AppState::new(config).context("invalid sandbox configuration")?;
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            http_server::run_server(addr, state, shutdown_signal())
                .await
                .context("sandbox host failed")?;
        }
        Commands::Gateway {
            port,
            sandbox_url,
            workspace,
            projects_db,
            jwt_secret,
            jwt_issuer,
            agent_timeout_secs,
            connect_timeout_secs,
            pending_queue_limit,
        } => {
            if jwt_secret.is_empty() {
                anyhow::bail!("JWT_SECRET must not be empty");
            }
            let config = GatewayConfig {
                sandbox_url,
                workspace_root: workspace,
                agent_timeout: Duration::from_secs(agent_timeout_secs),
                connect_timeout: Duration::from_secs(connect_timeout_secs),
                pending_queue_limit,
            };
            let verifier = Arc::new(JwtVerifier::hs256(
                jwt_secret.as_bytes(),
                jwt_issuer.as_deref(),
            ));
            let projects = Arc::new(FileProjectStore::open(projects_db).await);

            let state = GatewayState::new(config, verifier, projects)
                .context("invalid gateway configuration")?;
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            gateway::run_server(addr, state, shutdown_signal())
                .await
                .context("gateway failed")?;
        }
    }

    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
