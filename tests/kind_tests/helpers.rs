//! Test helpers for integration tests
//!
//! Provides utilities for managing the kind cluster, the nodevault CRDs and
//! the test namespace.

use std::collections::BTreeMap;
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Config, ResourceExt};
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio::time::sleep;

use nodevault::config::Config as VaultConfig;
use nodevault::context::Context;
use nodevault::crd::{all_crds, NodeTemplate, NodeTemplateSpec, TemplateId};
use nodevault::retry::RetryConfig;
use nodevault::wait::PollConfig;

/// Name of the kind cluster used for integration tests
pub const TEST_CLUSTER_NAME: &str = "nodevault-integration-test";

/// Namespace every test works in
pub const TEST_NAMESPACE: &str = "nodevault-test";

/// Global lock to ensure cluster is created only once
static CLUSTER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Track if CRDs and the namespace have been installed (async-safe)
static CRDS_INSTALLED: OnceCell<Result<(), String>> = OnceCell::const_new();

/// Check if a kind cluster with the given name exists
pub fn kind_cluster_exists(name: &str) -> bool {
    let output = Command::new("kind")
        .args(["get", "clusters"])
        .output()
        .expect("failed to run kind");

    let clusters = String::from_utf8_lossy(&output.stdout);
    clusters.lines().any(|line| line.trim() == name)
}

/// Create a kind cluster for testing
pub fn create_kind_cluster(name: &str) -> Result<(), String> {
    if kind_cluster_exists(name) {
        println!("Kind cluster '{name}' already exists, reusing it");
        return Ok(());
    }

    println!("Creating kind cluster '{name}'...");
    let output = Command::new("kind")
        .args(["create", "cluster", "--name", name, "--wait", "60s"])
        .output()
        .map_err(|e| format!("failed to run kind: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "failed to create kind cluster: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    println!("Kind cluster '{name}' created successfully");
    Ok(())
}

/// Apply the nodevault CRDs and the test namespace
pub async fn install_crds(client: &Client) -> Result<(), kube::Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("nodevault-tests").force();
    for crd in all_crds() {
        println!("Installing CRD {}...", crd.name_any());
        crds.patch(&crd.name_any(), &params, &Patch::Apply(&crd))
            .await?;
    }

    let namespaces: Api<Namespace> = Api::all(client.clone());
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(TEST_NAMESPACE.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    namespaces
        .patch(TEST_NAMESPACE, &params, &Patch::Apply(&namespace))
        .await?;

    // Wait for CRDs to be established
    sleep(Duration::from_secs(2)).await;

    println!("CRDs installed successfully");
    Ok(())
}

/// Create a Kubernetes client connected to the test cluster
pub async fn create_test_client() -> Result<Client, String> {
    // Use the kind cluster context directly without modifying kubeconfig
    let context_name = format!("kind-{TEST_CLUSTER_NAME}");

    let config = Config::from_kubeconfig(&kube::config::KubeConfigOptions {
        context: Some(context_name),
        ..Default::default()
    })
    .await
    .map_err(|e| format!("failed to load kubeconfig: {e}"))?;

    Client::try_from(config).map_err(|e| format!("failed to create client: {e}"))
}

/// Ensure the test cluster is ready (thread-safe, cluster created once)
///
/// Returns a fresh Client for each call - clients should not be shared across test threads.
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let cluster_result = CLUSTER_INIT.get_or_init(|| create_kind_cluster(TEST_CLUSTER_NAME));
    cluster_result.clone()?;

    let client = create_test_client().await?;

    let crd_result = CRDS_INSTALLED
        .get_or_init(|| async {
            let client = create_test_client().await?;
            install_crds(&client)
                .await
                .map_err(|e| format!("failed to install CRDs: {e}"))
        })
        .await;
    crd_result.clone()?;

    Ok(client)
}

/// Context against the test cluster with short retry and sweep timings
pub fn test_context(client: Client) -> Context {
    let config = VaultConfig::default()
        .orphan_grace_period(Duration::ZERO)
        .persist_retry(RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        });
    Context::new(client, config)
}

/// Poll settings generous enough for a kind cluster
pub fn poll() -> PollConfig {
    PollConfig::fixed(Duration::from_secs(30), Duration::from_millis(500))
}

/// An amazonec2 template carrying one sensitive field
pub fn sample_template(name: &str, config: Value) -> NodeTemplate {
    let mut template = NodeTemplate::new(
        name,
        NodeTemplateSpec {
            driver: "amazonec2Config".to_string(),
            config: serde_json::from_value(config).expect("config is an object"),
            secret_refs: BTreeMap::new(),
            cloud_credential_id: None,
            description: Some("integration test".to_string()),
        },
    );
    template.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    template
}

/// Remove a template left over from a previous run, detaching its pools first
pub async fn cleanup_template(ctx: &Context, name: &str) {
    let id = TemplateId::new(TEST_NAMESPACE, name);
    if let Ok(edges) = nodevault::guard::dependents(ctx, &id).await {
        for edge in edges {
            let _ = nodevault::guard::detach(ctx, &edge.consumer_namespace, &edge.consumer_name)
                .await;
        }
    }
    let _ = nodevault::guard::delete(ctx, &id).await;
}
