//! nodevault operator - node template secret redaction for Kubernetes

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nodevault::config::{
    Config, DEFAULT_ORPHAN_GRACE_PERIOD, DEFAULT_RECONCILE_INTERVAL, DEFAULT_SWEEP_INTERVAL,
};
use nodevault::context::Context;
use nodevault::controller::{error_policy, reconcile, reconcile_all, run_sweeper};
use nodevault::crd::{all_crds, NodeTemplate};
use nodevault::DEFAULT_API_PORT;

/// nodevault - keeps sensitive node template fields in secrets
#[derive(Parser, Debug)]
#[command(name = "nodevault", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Emit logs as JSON
    #[arg(long, env = "NODEVAULT_LOG_JSON")]
    log_json: bool,

    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller, orphan sweep and HTTP API (default mode)
    Controller {
        /// Port for the HTTP API
        #[arg(long, env = "NODEVAULT_API_PORT", default_value_t = DEFAULT_API_PORT)]
        port: u16,
    },

    /// Run one reconcile pass and print the report as JSON
    Sweep,
}

/// Reconciliation tunables shared by every mode
#[derive(Args, Debug)]
struct Tuning {
    /// Seconds between reconciles of a healthy template
    #[arg(long, env = "NODEVAULT_RECONCILE_INTERVAL_SECS", default_value_t = DEFAULT_RECONCILE_INTERVAL.as_secs())]
    reconcile_interval_secs: u64,

    /// Minimum age in seconds before an unreferenced secret record is deleted
    #[arg(long, env = "NODEVAULT_ORPHAN_GRACE_SECS", default_value_t = DEFAULT_ORPHAN_GRACE_PERIOD.as_secs())]
    orphan_grace_secs: u64,

    /// Seconds between orphan sweeps
    #[arg(long, env = "NODEVAULT_SWEEP_INTERVAL_SECS", default_value_t = DEFAULT_SWEEP_INTERVAL.as_secs())]
    sweep_interval_secs: u64,
}

impl Tuning {
    fn config(&self) -> Config {
        Config::default()
            .reconcile_interval(Duration::from_secs(self.reconcile_interval_secs))
            .orphan_grace_period(Duration::from_secs(self.orphan_grace_secs))
            .sweep_interval(Duration::from_secs(self.sweep_interval_secs))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    if cli.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    if cli.crd {
        for crd in all_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    let config = cli.tuning.config();
    match cli.command {
        Some(Commands::Sweep) => run_sweep(config).await,
        Some(Commands::Controller { port }) => run_controller(config, port).await,
        None => run_controller(config, DEFAULT_API_PORT).await,
    }
}

/// Ensure the nodevault CRDs are installed
///
/// Server-side apply keeps the installed CRDs in step with the binary.
async fn ensure_crds_installed(client: &Client, field_manager: &str) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(field_manager).force();

    for crd in all_crds() {
        let name = crd.name_any();
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }
    Ok(())
}

/// One reconcile pass over every template and secret record
async fn run_sweep(config: Config) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let ctx = Context::new(client, config);

    let report = reconcile_all(&ctx)
        .await
        .map_err(|e| anyhow::anyhow!("Reconcile pass failed: {}", e))?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_clean() {
        anyhow::bail!(
            "reconcile pass found {} dangling references and {} errors",
            report.missing_references.len(),
            report.errors.len()
        );
    }
    Ok(())
}

/// Run the NodeTemplate controller, the orphan sweep and the HTTP API
async fn run_controller(config: Config, port: u16) -> anyhow::Result<()> {
    tracing::info!("nodevault controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client, &config.field_manager).await?;

    let ctx = Arc::new(Context::new(client.clone(), config));
    let templates: Api<NodeTemplate> = Api::all(client);

    let controller = Controller::new(templates, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Template reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Template reconciliation error");
                }
            }
        });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind API server on {}: {}", addr, e))?;
    tracing::info!(%addr, "Starting HTTP API");
    let server = axum::serve(listener, nodevault::api::router(ctx.clone())).into_future();

    tokio::select! {
        _ = controller => {
            tracing::info!("Template controller completed");
        }
        _ = run_sweeper(ctx.clone()) => {
            tracing::info!("Orphan sweeper completed");
        }
        result = server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP API server error");
            }
        }
    }

    tracing::info!("nodevault controller shutting down");
    Ok(())
}
