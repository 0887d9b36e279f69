//! Integration tests for node pools and template deletion
//!
//! These tests tell the story of templates that are in use: a node pool keeps
//! its template alive until the pool is gone.

use serde_json::json;

use nodevault::crd::{NodePool, TemplateId};
use nodevault::store::SecretRecord;
use nodevault::{engine, guard, Error};

use super::helpers::{
    cleanup_template, ensure_test_cluster, sample_template, test_context, TEST_NAMESPACE,
};

/// Story: Operator tries to delete a template that a node pool still uses
///
/// Expected behavior:
/// - Delete is refused with InUse while the pool exists
/// - After the pool is deleted the template and its secrets go away
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_template_in_use_cannot_be_deleted() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let ctx = test_context(client);
    let name = "t4";
    cleanup_template(&ctx, name).await;
    let id = TemplateId::new(TEST_NAMESPACE, name);

    engine::create(&ctx, sample_template(name, json!({"sshKeyContents": "k"})))
        .await
        .expect("failed to create template");
    guard::attach(&ctx, NodePool::for_template(TEST_NAMESPACE, "np-t4", id.clone()))
        .await
        .expect("failed to attach pool");

    let refused = guard::delete(&ctx, &id).await;
    assert!(matches!(refused, Err(Error::InUse(_))));

    guard::detach(&ctx, TEST_NAMESPACE, "np-t4")
        .await
        .expect("failed to detach pool");
    guard::delete(&ctx, &id)
        .await
        .expect("delete should succeed once unused");

    assert!(matches!(
        ctx.secrets.get_secret(TEST_NAMESPACE, "t4:sshKeyContents").await,
        Err(Error::NotFound(_))
    ));
}

/// Story: A secret outlives its template
///
/// Expected behavior:
/// - The orphan sweep deletes a managed Secret whose owner is gone
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_orphaned_secret_is_reclaimed() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let ctx = test_context(client);
    let owner = TemplateId::new(TEST_NAMESPACE, "never-created");

    ctx.secrets
        .put_secret(
            SecretRecord::new(TEST_NAMESPACE, "never-created:password")
                .with_field("password", "aHVudGVyMg==")
                .owned_by(owner),
        )
        .await
        .expect("failed to write secret");

    let report = nodevault::controller::sweep_orphans(&ctx, chrono::Utc::now())
        .await
        .expect("sweep failed");
    assert!(report
        .orphans_deleted
        .contains(&format!("{TEST_NAMESPACE}/never-created:password")));
}
