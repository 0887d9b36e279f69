//! Whole-store reconciliation and orphan reclamation
//!
//! A secret record is an orphan when its owner template is gone or no longer
//! references it. Only records older than the configured grace period are
//! considered, so a create that has written its secrets but not yet its
//! template never loses them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::template::reconcile_template;
use crate::context::Context;
use crate::crd::{template_resource, NodeTemplate, TemplateId, TemplatePhase};
use crate::engine::load;
use crate::store::{from_dynamic, SecretRecord};
use crate::Error;

/// Summary of one reconcile pass over every template and secret record
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Templates examined
    pub templates: usize,
    /// Templates whose plaintext values were moved into secret records
    pub adopted: usize,
    /// Dangling references as `<namespace>:<template>/<key>`
    pub missing_references: Vec<String>,
    /// Orphaned records deleted, as `<namespace>/<name>`
    pub orphans_deleted: Vec<String>,
    /// Per-object failures; the pass continues past them
    pub errors: Vec<String>,
}

impl ReconcileReport {
    /// Whether the pass found nothing wrong
    pub fn is_clean(&self) -> bool {
        self.missing_references.is_empty() && self.errors.is_empty()
    }
}

/// Whether the owner of `record` still references it
async fn still_referenced(
    ctx: &Context,
    owner: &TemplateId,
    record: &SecretRecord,
) -> Result<bool, Error> {
    match load(ctx, owner).await {
        Ok(template) => Ok(template.phase() != TemplatePhase::Deleted
            && template
                .referenced_secrets()
                .contains(&(record.namespace.clone(), record.name.clone()))),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

async fn reclaim(ctx: &Context, owner: &TemplateId, record: &SecretRecord) -> Result<bool, Error> {
    if still_referenced(ctx, owner, record).await? {
        return Ok(false);
    }

    // Re-read both sides right before deleting; an update may have just
    // rewritten the record or started referencing it again.
    let current = match ctx.secrets.get_secret(&record.namespace, &record.name).await {
        Ok(current) => current,
        Err(e) if e.is_not_found() => return Ok(false),
        Err(e) => return Err(e),
    };
    if !current.same_content(record) || still_referenced(ctx, owner, &current).await? {
        debug!(secret = %record.name, "record changed during sweep, keeping it");
        return Ok(false);
    }

    match ctx.secrets.delete_secret(&record.namespace, &record.name).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Delete managed records whose owner no longer references them
///
/// Records without an owner or a creation time are never touched.
pub async fn sweep_orphans(ctx: &Context, now: DateTime<Utc>) -> Result<ReconcileReport, Error> {
    let grace = chrono::Duration::from_std(ctx.config.orphan_grace_period)
        .map_err(|e| Error::validation(format!("orphan grace period out of range: {e}")))?;
    let mut report = ReconcileReport::default();

    for record in ctx.secrets.list_secrets(None).await? {
        let Some(owner) = record.owner.clone() else {
            continue;
        };
        let Some(created_at) = record.created_at else {
            continue;
        };
        if now - created_at < grace {
            continue;
        }

        let coordinate = format!("{}/{}", record.namespace, record.name);
        match reclaim(ctx, &owner, &record).await {
            Ok(true) => {
                info!(secret = %coordinate, owner = %owner, "deleted orphaned secret record");
                report.orphans_deleted.push(coordinate);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(secret = %coordinate, error = %e, "failed to check secret record");
                report.errors.push(format!("secret {coordinate}: {e}"));
            }
        }
    }
    Ok(report)
}

/// One pass over every template followed by an orphan sweep
///
/// Safe to run repeatedly and concurrently with request handling; a second
/// pass over unchanged state does nothing.
pub async fn reconcile_all(ctx: &Context) -> Result<ReconcileReport, Error> {
    let mut report = ReconcileReport::default();

    for object in ctx.resources.list(&template_resource(), None).await? {
        report.templates += 1;
        let template: NodeTemplate = match from_dynamic(object) {
            Ok(template) => template,
            Err(e) => {
                report.errors.push(format!("unreadable template: {e}"));
                continue;
            }
        };
        let id = match template.id() {
            Ok(id) => id,
            Err(e) => {
                report.errors.push(e.to_string());
                continue;
            }
        };

        match reconcile_template(ctx, &template).await {
            Ok(outcome) => {
                if outcome.adopted {
                    report.adopted += 1;
                }
                report
                    .missing_references
                    .extend(outcome.missing.iter().map(|key| format!("{id}/{key}")));
            }
            Err(e) => {
                warn!(template = %id, error = %e, "template reconcile failed");
                report.errors.push(format!("template {id}: {e}"));
            }
        }
    }

    let sweep = sweep_orphans(ctx, Utc::now()).await?;
    report.orphans_deleted = sweep.orphans_deleted;
    report.errors.extend(sweep.errors);

    info!(
        templates = report.templates,
        adopted = report.adopted,
        missing = report.missing_references.len(),
        orphans = report.orphans_deleted.len(),
        errors = report.errors.len(),
        "reconcile pass complete"
    );
    Ok(report)
}

/// Sweep orphans every `config.sweep_interval`, forever
pub async fn run_sweeper(ctx: Arc<Context>) {
    let mut ticker = tokio::time::interval(ctx.config.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match sweep_orphans(&ctx, Utc::now()).await {
            Ok(report) if !report.orphans_deleted.is_empty() => {
                info!(deleted = report.orphans_deleted.len(), "orphan sweep reclaimed records");
            }
            Ok(_) => debug!("orphan sweep found nothing"),
            Err(e) => warn!(error = %e, "orphan sweep failed"),
        }
    }
}
