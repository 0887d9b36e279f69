//! Integration tests for template operations
//!
//! These tests tell the story of a platform operator managing node templates
//! whose sensitive fields end up in Kubernetes Secrets.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::api::{Api, PostParams};
use serde_json::json;

use nodevault::crd::{NodeTemplate, TemplateId};
use nodevault::engine;
use nodevault::wait::{wait_for_secret, wait_for_template_deleted};

use super::helpers::{
    cleanup_template, ensure_test_cluster, poll, sample_template, test_context, TEST_NAMESPACE,
};

/// Story: Operator creates a template with an SSH key
///
/// Expected behavior:
/// - The stored NodeTemplate holds a reference token, not the key
/// - A Secret holds the key and decodes back to the original value
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_ssh_key_lands_in_a_secret() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let ctx = test_context(client.clone());
    let name = "nt-1";
    cleanup_template(&ctx, name).await;

    let created = engine::create(
        &ctx,
        sample_template(name, json!({"sshKeyContents": "notarealsshkey", "region": "us-west-2"})),
    )
    .await
    .expect("failed to create template");
    assert_eq!(
        created.spec.config["sshKeyContents"],
        json!("secret://nodevault-test/nt-1:sshKeyContents")
    );

    // Assert: the raw object in the API server never saw the key
    let api: Api<NodeTemplate> = Api::namespaced(client, TEST_NAMESPACE);
    let raw = api.get(name).await.expect("failed to get template");
    assert!(!serde_json::to_string(&raw).unwrap().contains("notarealsshkey"));

    // Assert: the secret decodes to the original value
    let record = wait_for_secret(&ctx, TEST_NAMESPACE, "nt-1:sshKeyContents", &poll())
        .await
        .expect("secret never appeared");
    let decoded = STANDARD
        .decode(record.field("sshKeyContents").expect("field present"))
        .expect("payload is base64");
    assert_eq!(decoded, b"notarealsshkey");

    cleanup_template(&ctx, name).await;
}

/// Story: Operator rotates a key and later drops it
///
/// Expected behavior:
/// - A stale resource version is rejected
/// - Dropping the sensitive field deletes its Secret after the update lands
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_update_rotates_and_removes_secrets() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let ctx = test_context(client);
    let name = "nt-rotate";
    cleanup_template(&ctx, name).await;

    let created = engine::create(&ctx, sample_template(name, json!({"sshKeyContents": "old"})))
        .await
        .expect("failed to create template");

    let mut stale = sample_template(name, json!({"sshKeyContents": "new"}));
    stale.metadata.resource_version = Some("1".to_string());
    assert!(matches!(
        engine::update(&ctx, stale).await,
        Err(nodevault::Error::Conflict(_))
    ));

    let mut rotate = sample_template(name, json!({"region": "eu-west-1"}));
    rotate.metadata.resource_version = created.metadata.resource_version.clone();
    engine::update(&ctx, rotate)
        .await
        .expect("failed to update template");

    let gone = ctx
        .secrets
        .get_secret(TEST_NAMESPACE, &format!("{name}:sshKeyContents"))
        .await;
    assert!(matches!(gone, Err(nodevault::Error::NotFound(_))));

    nodevault::guard::delete(&ctx, &TemplateId::new(TEST_NAMESPACE, name))
        .await
        .expect("failed to delete template");
    wait_for_template_deleted(&ctx, &TemplateId::new(TEST_NAMESPACE, name), &poll())
        .await
        .expect("template never went away");
}

/// Story: Someone applies a template with plaintext straight through kubectl
///
/// Expected behavior:
/// - A reconcile pass moves the plaintext into a Secret
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_plaintext_written_around_the_operator_is_adopted() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let ctx = test_context(client.clone());
    let name = "nt-kubectl";
    cleanup_template(&ctx, name).await;

    let api: Api<NodeTemplate> = Api::namespaced(client, TEST_NAMESPACE);
    api.create(
        &PostParams::default(),
        &sample_template(name, json!({"secretKey": "plaintext-secret"})),
    )
    .await
    .expect("failed to create raw template");

    let report = nodevault::controller::reconcile_all(&ctx)
        .await
        .expect("reconcile pass failed");
    assert!(report.adopted >= 1);

    let stored = api.get(name).await.expect("failed to get template");
    assert!(!serde_json::to_string(&stored)
        .unwrap()
        .contains("plaintext-secret"));

    cleanup_template(&ctx, name).await;
}
