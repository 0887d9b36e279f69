//! NodeTemplate reconciliation
//!
//! Each pass adopts plaintext written around the engine, then checks that
//! every declared secret reference resolves. A dangling reference is reported
//! on the `SecretsResolved` condition and in the logs; it is never repaired by
//! writing made-up secret data.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::context::Context;
use crate::crd::{Condition, ConditionStatus, NodeTemplate, TemplatePhase};
use crate::engine;
use crate::guard::{status_of, write_status};
use crate::Error;

/// Condition type reporting whether every secret reference resolves
pub const SECRETS_RESOLVED: &str = "SecretsResolved";

/// What one reconcile pass did to a template
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TemplateOutcome {
    /// Plaintext sensitive values were moved into secret records
    pub adopted: bool,
    /// Configuration keys whose secret record or field is missing
    pub missing: Vec<String>,
    /// The status condition was rewritten
    pub status_written: bool,
}

/// Reconcile a single template against the stores in `ctx`
pub async fn reconcile_template(
    ctx: &Context,
    template: &NodeTemplate,
) -> Result<TemplateOutcome, Error> {
    let id = template.id()?;
    let mut outcome = TemplateOutcome::default();

    if template.phase() == TemplatePhase::Deleted {
        debug!(template = %id, "template already deleted, nothing to reconcile");
        return Ok(outcome);
    }

    let mut current = template.clone();
    if !current.plaintext_sensitive_keys(&ctx.classifier).is_empty() {
        current = engine::adopt(ctx, &current).await?;
        outcome.adopted = true;
    }

    for (key, reference) in &current.spec.secret_refs {
        match ctx
            .secrets
            .get_secret(&reference.namespace, &reference.name)
            .await
        {
            Ok(record) if record.field(&reference.field).is_some() => {}
            Ok(_) => outcome.missing.push(key.clone()),
            Err(e) if e.is_not_found() => outcome.missing.push(key.clone()),
            Err(e) => return Err(e),
        }
    }

    let condition = if outcome.missing.is_empty() {
        Condition::new(
            SECRETS_RESOLVED,
            ConditionStatus::True,
            "Resolved",
            "all secret references resolve",
        )
    } else {
        error!(
            template = %id,
            keys = ?outcome.missing,
            "secret references do not resolve to existing records"
        );
        Condition::new(
            SECRETS_RESOLVED,
            ConditionStatus::False,
            "MissingSecret",
            format!("missing secret records for {}", outcome.missing.join(", ")),
        )
    };

    let status = status_of(&current);
    let unchanged = status
        .get_condition(SECRETS_RESOLVED)
        .is_some_and(|existing| existing.same_state(&condition));
    if !unchanged {
        write_status(
            ctx,
            &id,
            &status.condition(condition),
            current.metadata.resource_version.clone(),
        )
        .await?;
        outcome.status_written = true;
    }

    Ok(outcome)
}

/// Controller entry point for a NodeTemplate
#[instrument(skip(template, ctx), fields(template = %template.name_any()))]
pub async fn reconcile(template: Arc<NodeTemplate>, ctx: Arc<Context>) -> Result<Action, Error> {
    if template.metadata.deletion_timestamp.is_some() {
        debug!("template is being removed by the API server");
        return Ok(Action::await_change());
    }

    let outcome = reconcile_template(&ctx, &template).await?;
    if outcome.adopted {
        info!("adopted plaintext sensitive values");
    }
    if !outcome.missing.is_empty() {
        warn!(missing = outcome.missing.len(), "template has dangling secret references");
    }
    Ok(Action::requeue(ctx.config.reconcile_interval))
}

/// Requeue policy after a failed reconcile
///
/// Conflicts mean the template moved underneath us and are retried quickly.
pub fn error_policy(template: Arc<NodeTemplate>, error: &Error, _ctx: Arc<Context>) -> Action {
    match error {
        Error::Conflict(_) => {
            debug!(template = %template.name_any(), error = %error, "template changed during reconcile");
            Action::requeue(Duration::from_secs(1))
        }
        _ => {
            error!(?error, template = %template.name_any(), "reconciliation failed");
            Action::requeue(Duration::from_secs(5))
        }
    }
}
