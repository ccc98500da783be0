//! stevedore - deploy containerized services across a cluster.
//!
//! `stevedore deploy` submits a deployment/application document pair,
//! issues the delta to the affected nodes, and (by default) waits for the
//! cluster to converge to the declared state. `stevedore status` shows one
//! node's actual unit set.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stevedore_engine::{
    ConvergenceDriver, DeployError, DeploymentVerifier, NodeClient, StateObserver,
    VerificationError, VerifyOpts,
};
use stevedore_model::{
    expected_state, ApplicationCatalog, DeploymentConfig, Unit, DEFAULT_VOLUME_ROOT,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "stevedore", version, about = "Cluster deployment convergence tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a deployment and wait for the cluster to converge to it.
    Deploy {
        /// Deployment document: node -> scheduled applications.
        deployment: PathBuf,

        /// Application catalog: name -> image, ports, links, volume.
        applications: PathBuf,

        /// Convergence deadline in seconds.
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,

        /// Poll interval in milliseconds.
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,

        /// Issue the apply operations but do not wait for convergence.
        #[arg(long)]
        no_wait: bool,

        /// Host directory under which nodes materialize volumes.
        #[arg(long, default_value = DEFAULT_VOLUME_ROOT)]
        volume_root: PathBuf,
    },

    /// Show the units currently running on one node.
    Status {
        /// Node API address (host:port).
        node: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Deploy {
            deployment,
            applications,
            timeout_secs,
            interval_ms,
            no_wait,
            volume_root,
        } => {
            deploy(
                &deployment,
                &applications,
                VerifyOpts {
                    interval: Duration::from_millis(interval_ms),
                    timeout: Duration::from_secs(timeout_secs),
                },
                no_wait,
                &volume_root,
            )
            .await
        }
        Command::Status { node } => status(&node).await,
    }
}

async fn deploy(
    deployment_path: &PathBuf,
    applications_path: &PathBuf,
    opts: VerifyOpts,
    no_wait: bool,
    volume_root: &PathBuf,
) -> Result<()> {
    let config: DeploymentConfig = read_document(deployment_path)?;
    let catalog: ApplicationCatalog = read_document(applications_path)?;

    let expected = expected_state(&config, &catalog, volume_root)
        .context("invalid deployment documents")?;

    let client = NodeClient::new();
    let driver = ConvergenceDriver::new(client.clone());

    // Each invocation starts fresh; diff against what actually runs so an
    // application deployed by an earlier run is stopped when it moves.
    driver
        .sync_with_cluster(&client, &config)
        .await
        .context("could not observe current cluster state")?;

    let ack = match driver.apply(&config, &catalog).await {
        Ok(ack) => ack,
        Err(DeployError::Validation(e)) => {
            return Err(anyhow::Error::new(e).context("deployment rejected"));
        }
        Err(e @ DeployError::PartialApply { .. }) => {
            if let DeployError::PartialApply { succeeded, failed } = &e {
                for node in succeeded {
                    eprintln!("updated: {node}");
                }
                for failure in failed {
                    eprintln!("FAILED:  {} ({})", failure.node, failure.reason);
                }
            }
            return Err(anyhow::Error::new(e)
                .context("apply incomplete; re-run to retry the failed nodes"));
        }
    };

    info!(
        changed = ack.changed.len(),
        unchanged = ack.unchanged.len(),
        "Apply issued"
    );

    if no_wait {
        println!("apply issued to {} node(s), not waiting", ack.changed.len());
        return Ok(());
    }

    let verifier = DeploymentVerifier::new(client);
    match verifier.verify(&expected, opts).await {
        Ok(()) => {
            println!("cluster converged on {} node(s)", expected.len());
            Ok(())
        }
        Err(VerificationError::Timeout { timeout, diffs }) => {
            eprintln!("deployment-mismatch after {timeout:?}:");
            for diff in &diffs {
                eprintln!("  {diff}");
            }
            anyhow::bail!("cluster did not converge within {timeout:?}");
        }
    }
}

async fn status(node: &str) -> Result<()> {
    let client = NodeClient::new();
    let units = client
        .observe(node)
        .await
        .with_context(|| format!("could not query node {node}"))?;

    if units.is_empty() {
        println!("no units running on {node}");
        return Ok(());
    }

    let rows: Vec<UnitRow> = units.iter().map(UnitRow::from).collect();
    println!("{}", tabled::Table::new(rows));
    Ok(())
}

fn read_document<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("could not parse {}", path.display()))
}

#[derive(tabled::Tabled)]
struct UnitRow {
    name: String,
    container: String,
    image: String,
    state: String,
    ports: String,
}

impl From<&Unit> for UnitRow {
    fn from(unit: &Unit) -> Self {
        Self {
            name: unit.name.clone(),
            container: unit.container_name.clone(),
            image: unit.image.clone(),
            state: unit.activation_state.to_string(),
            ports: unit
                .ports
                .iter()
                .map(|p| format!("{}->{}", p.external_port, p.internal_port))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}
