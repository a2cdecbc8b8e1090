use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kprov_api::{build_backend, ApiError, ProvisionerApi, ProvisionerFacade};
use kprov_core::prelude::*;
use kprov_persist::Store;
use kprov_provisioner::Provisioner;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kprovctl", version, about = "Drive the provisioner facade directly, no gateway required")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    Ssh,
    Docker,
    Swarm,
    Kubernetes,
    Crd,
    Yarn,
}

impl From<Backend> for BackendKind {
    fn from(b: Backend) -> Self {
        match b {
            Backend::Ssh => BackendKind::Ssh,
            Backend::Docker => BackendKind::Docker,
            Backend::Swarm => BackendKind::Swarm,
            Backend::Kubernetes => BackendKind::Kubernetes,
            Backend::Crd => BackendKind::Crd,
            Backend::Yarn => BackendKind::Yarn,
        }
    }
}

use kprov_api::BackendKind;

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch a kernel and block until startup is confirmed or the launch times out.
    Launch {
        kernel_id: String,
        #[arg(long, default_value = "anonymous")]
        kernel_username: String,
        #[arg(long, value_enum)]
        backend: Backend,
        #[arg(long)]
        display_name: String,
        #[arg(long)]
        language: String,
        #[arg(long = "spark", action = clap::ArgAction::SetTrue)]
        is_spark: bool,
        /// Launch argv, e.g. --argv python3 --argv -m --argv ipykernel_launcher
        #[arg(long = "argv", required = true, num_args = 1)]
        argv: Vec<String>,
        /// key=value, may be repeated
        #[arg(long = "env", value_parser = parse_env_kv)]
        env: Vec<(String, String)>,
    },
    /// Poll whether a previously launched kernel is still alive.
    Poll {
        kernel_id: String,
        #[arg(long, value_enum)]
        backend: Backend,
    },
    /// Deliver a signal to a previously launched kernel.
    Signal {
        kernel_id: String,
        #[arg(long, value_enum)]
        backend: Backend,
        signum: i32,
    },
    /// Terminate a previously launched kernel.
    Terminate {
        kernel_id: String,
        #[arg(long, value_enum)]
        backend: Backend,
        #[arg(long, action = clap::ArgAction::SetTrue)]
        restart: bool,
    },
    /// Print the persisted provisioner info for a kernel, without touching the backend.
    Inspect { kernel_id: String },
}

fn parse_env_kv(s: &str) -> Result<(String, String), String> {
    s.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())).ok_or_else(|| format!("invalid env entry '{s}', expected key=value"))
}

fn init_tracing() {
    let env = std::env::var("KPROV_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn now_ms() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// Reconstructs a session for a kernel launched by a prior `kprovctl` or daemon invocation:
/// loads its persisted `ProvisionerInfo`, rebuilds the matching concrete backend, and restores
/// enough state via `load_provisioner_info` to resume polling/signaling/terminating it.
async fn rehydrate(
    kernel_id: &str,
    backend_kind: BackendKind,
) -> Result<(Provisioner<Box<dyn kprov_provisioner::backend::Backend>>, std::sync::Arc<dyn kprov_persist::Store>)> {
    let store: std::sync::Arc<dyn kprov_persist::Store> = std::sync::Arc::new(kprov_persist::SqliteStore::open_default()?);
    let info = store.get_info(kernel_id)?.ok_or_else(|| anyhow::anyhow!("no persisted state for kernel '{kernel_id}'"))?;

    let config = ProvisionerConfig::from_env()?;
    let backend = build_backend(backend_kind, &config).await.context("building backend")?;
    let response_manager = kprov_response::ResponseManager::bind("127.0.0.1", 0, 5).await?;
    let tunnels = std::sync::Arc::new(kprov_tunnel::TunnelSupervisor::new());
    let spec = KernelSpec { argv: Vec::new(), env: HashMap::new(), display_name: String::new(), language: String::new() };
    let mut session =
        Provisioner::new(config, response_manager, tunnels, backend, kernel_id.to_string(), String::new(), spec, false, now_ms());
    session.load_provisioner_info(info);
    Ok((session, store))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Launch { kernel_id, kernel_username, backend, display_name, language, is_spark, argv, env } => {
            info!(kernel_id = %kernel_id, backend = ?backend, "launch invoked");
            let facade = ProvisionerFacade::bind_from_env().await.context("binding provisioner facade")?;
            let spec = KernelSpec { argv, env: HashMap::new(), display_name, language };
            let env_map: HashMap<String, String> = env.into_iter().collect();
            match facade.start_kernel(kernel_id, kernel_username, spec, backend.into(), is_spark, env_map).await {
                Ok(conn) => println!("{}", serde_json::to_string_pretty(&conn)?),
                Err(e) => {
                    error!(error = ?e, "launch failed");
                    return Err(api_error_to_anyhow(e));
                }
            }
        }
        Commands::Poll { kernel_id, backend } => {
            let (mut session, store) = rehydrate(&kernel_id, backend.into()).await?;
            let exit_status = session.poll().await?;
            store.put_info(&session.get_provisioner_info())?;
            match exit_status {
                None => println!("running"),
                Some(code) => println!("exited ({code})"),
            }
        }
        Commands::Signal { kernel_id, backend, signum } => {
            let (mut session, store) = rehydrate(&kernel_id, backend.into()).await?;
            let outcome = session.send_signal(signum).await?;
            store.put_info(&session.get_provisioner_info())?;
            println!("{outcome:?}");
        }
        Commands::Terminate { kernel_id, backend, restart } => {
            let (mut session, store) = rehydrate(&kernel_id, backend.into()).await?;
            session.terminate(restart).await?;
            if restart {
                store.put_info(&session.get_provisioner_info())?;
            } else {
                store.delete_info(&kernel_id)?;
            }
            println!("{:?}", session.state());
        }
        Commands::Inspect { kernel_id } => {
            let store = kprov_persist::SqliteStore::open_default()?;
            match store.get_info(&kernel_id)? {
                Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                None => println!("no persisted state for kernel '{kernel_id}'"),
            }
        }
    }

    Ok(())
}

fn api_error_to_anyhow(e: ApiError) -> anyhow::Error {
    anyhow::Error::from(e)
}
