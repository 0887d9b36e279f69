//! Redaction engine
//!
//! Moves sensitive configuration values into secret records and persists the
//! template with reference tokens in their place. Ordering rules:
//!
//! - create writes secrets first, then the template. Template persistence is
//!   retried against the secrets already written; a secret whose deterministic
//!   name already holds the same payload is reused, never duplicated.
//! - update writes (or overwrites) secrets, persists the template, and only
//!   then deletes secrets for keys that are no longer sensitive.
//! - writes for one template are serialized within the process, and update
//!   re-checks the stored version once it holds that lock. A failed update
//!   only reverts records that still hold its own payloads.
//! - every object handed back to a caller has been through the redacted view.

pub mod credentials;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::classify::SensitivityClassifier;
use crate::context::Context;
use crate::crd::{
    is_reference_token, template_resource, NodeTemplate, NodeTemplateSpec, SecretEncoding,
    SecretReference, TemplateId,
};
use crate::retry::retry_with_backoff_if;
use crate::store::{from_dynamic, to_dynamic, SecretRecord};
use crate::Error;

pub use credentials::strip_credential_fields;

/// Read a template as stored, without redaction
pub(crate) async fn load(ctx: &Context, id: &TemplateId) -> Result<NodeTemplate, Error> {
    let object = ctx
        .resources
        .get(&template_resource(), &id.namespace, &id.name)
        .await?;
    from_dynamic(object)
}

fn validate(template: &NodeTemplate) -> Result<TemplateId, Error> {
    let id = template.id()?;
    id.validate()?;
    if template.spec.driver.is_empty() {
        return Err(Error::validation("driver must not be empty"));
    }
    if template.spec.config.keys().any(|key| key.is_empty()) {
        return Err(Error::validation("configuration keys must not be empty"));
    }
    Ok(id)
}

/// Replace every sensitive value in `spec` with its reference token
///
/// Keys whose value already equals the token recorded in `existing` keep that
/// reference. Returns the records that must be written. `spec.secret_refs` is
/// rebuilt to cover exactly the sensitive keys.
pub fn redact(
    classifier: &SensitivityClassifier,
    id: &TemplateId,
    spec: &mut NodeTemplateSpec,
    existing: &BTreeMap<String, SecretReference>,
) -> Result<Vec<SecretRecord>, Error> {
    let mut refs = BTreeMap::new();
    let mut records = Vec::new();

    for key in classifier.classify(&spec.driver, &spec.config) {
        let value = &spec.config[&key];

        if let Some(reference) = existing.get(&key).filter(|r| r.matches_token(value)) {
            refs.insert(key, reference.clone());
            continue;
        }
        if is_reference_token(value) {
            return Err(Error::validation(format!(
                "{key} references a secret that does not belong to template {id}"
            )));
        }

        let reference = SecretReference::for_field(id, &key, SecretEncoding::for_value(value));
        let record = SecretRecord::new(&reference.namespace, &reference.name)
            .with_field(&reference.field, reference.encode_payload(value)?)
            .owned_by(id.clone());

        spec.config
            .insert(key.clone(), Value::String(reference.token()));
        refs.insert(key, reference);
        records.push(record);
    }

    spec.secret_refs = refs;
    Ok(records)
}

/// Best-effort removal of records written by a failed create
///
/// Records that the stored template already references are kept: a concurrent
/// create with the same input may have reused them.
async fn remove_secrets(ctx: &Context, id: &TemplateId, records: &[SecretRecord]) {
    if records.is_empty() {
        return;
    }
    let referenced = match load(ctx, id).await {
        Ok(stored) => stored.referenced_secrets(),
        Err(e) if e.is_not_found() => BTreeSet::new(),
        Err(e) => {
            warn!(template = %id, error = %e, "cannot check secret references, leaving secrets for the orphan sweep");
            return;
        }
    };

    for record in records {
        if referenced.contains(&(record.namespace.clone(), record.name.clone())) {
            debug!(template = %id, secret = %record.name, "secret is referenced by the stored template, keeping it");
            continue;
        }
        match ctx
            .secrets
            .delete_secret(&record.namespace, &record.name)
            .await
        {
            Ok(()) => debug!(secret = %record.name, "removed secret after failed operation"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(
                namespace = %record.namespace,
                secret = %record.name,
                error = %e,
                "failed to remove secret, leaving it for the orphan sweep"
            ),
        }
    }
}

/// Create-only write that reuses an identical existing record
///
/// Returns `true` when the record was freshly created by this call.
async fn store_new_secret(ctx: &Context, record: &SecretRecord) -> Result<bool, Error> {
    match ctx.secrets.create_secret(record.clone()).await {
        Ok(_) => Ok(true),
        Err(Error::Conflict(_)) => {
            let existing = ctx
                .secrets
                .get_secret(&record.namespace, &record.name)
                .await?;
            if existing.same_content(record) {
                debug!(secret = %record.name, "reusing identical secret from an earlier attempt");
                Ok(false)
            } else {
                Err(Error::conflict(format!(
                    "secret {}/{} already exists with different content",
                    record.namespace, record.name
                )))
            }
        }
        Err(e) => Err(e),
    }
}

/// Make the records of a just-persisted revision hold that revision's payloads
///
/// Does nothing once a newer revision is stored; the records belong to it.
async fn settle_secrets(
    ctx: &Context,
    id: &TemplateId,
    persisted: &NodeTemplate,
    records: &[SecretRecord],
) {
    if records.is_empty() {
        return;
    }
    match load(ctx, id).await {
        Ok(stored) if stored.metadata.resource_version == persisted.metadata.resource_version => {}
        Ok(_) => {
            debug!(template = %id, "newer revision stored, leaving secrets to it");
            return;
        }
        Err(e) => {
            warn!(template = %id, error = %e, "cannot re-read template, skipping secret check");
            return;
        }
    }

    for record in records {
        match ctx
            .secrets
            .get_secret(&record.namespace, &record.name)
            .await
        {
            Ok(current) if current.same_content(record) => continue,
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(template = %id, secret = %record.name, error = %e, "cannot verify secret");
                continue;
            }
        }
        match ctx.secrets.put_secret(record.clone()).await {
            Ok(_) => info!(template = %id, secret = %record.name, "rewrote secret for the stored revision"),
            Err(e) => error!(
                template = %id,
                secret = %record.name,
                error = %e,
                "secret does not match the stored revision"
            ),
        }
    }
}

/// Create a template, redacting its sensitive fields
///
/// Fails with [`Error::Conflict`] if the template already exists. Secrets
/// written by this call are removed if a later secret write fails; once the
/// template stage is reached they are left in place, since a concurrent writer
/// may already reference them and the orphan sweep reclaims any leftovers.
///
/// A persistence retry that finds the template already stored with this exact
/// spec treats it as its own earlier attempt whose response was lost.
pub async fn create(ctx: &Context, mut template: NodeTemplate) -> Result<NodeTemplate, Error> {
    let id = validate(&template)?;
    let resource = template_resource();
    let _guard = ctx.lock_template(&id).await;

    match ctx.resources.get(&resource, &id.namespace, &id.name).await {
        Ok(_) => {
            return Err(Error::conflict(format!("node template {id} already exists")));
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    strip_credential_fields(ctx, &mut template.spec).await?;
    let records = redact(&ctx.classifier, &id, &mut template.spec, &BTreeMap::new())?;

    let mut created = Vec::new();
    for record in &records {
        match store_new_secret(ctx, record).await {
            Ok(true) => created.push(record.clone()),
            Ok(false) => {}
            Err(e) => {
                warn!(template = %id, secret = %record.name, error = %e, "secret write failed, aborting create");
                remove_secrets(ctx, &id, &created).await;
                return Err(e);
            }
        }
    }

    template.metadata.namespace = Some(id.namespace.clone());
    template.metadata.resource_version = None;
    template.metadata.uid = None;
    template.metadata.creation_timestamp = None;
    template.status = None;
    let body = to_dynamic(&template)?;

    let saw_outage = AtomicBool::new(false);
    let attempt = {
        let (resource, namespace, body, saw_outage) =
            (&resource, id.namespace.as_str(), &body, &saw_outage);
        move || async move {
            let result = ctx.resources.create(resource, namespace, body.clone()).await;
            if result.as_ref().is_err_and(|e| e.is_retryable()) {
                saw_outage.store(true, Ordering::SeqCst);
            }
            result
        }
    };
    let result = retry_with_backoff_if(
        &ctx.config.persist_retry,
        "persist_node_template",
        Error::is_retryable,
        attempt,
    )
    .await;

    let persisted = match result {
        Ok(persisted) => from_dynamic::<NodeTemplate>(persisted)?,
        Err(Error::Conflict(msg)) if saw_outage.load(Ordering::SeqCst) => {
            let stored = load(ctx, &id).await?;
            if stored.spec != template.spec {
                return Err(Error::Conflict(msg));
            }
            info!(template = %id, "template already stored by an attempt whose response was lost");
            stored
        }
        Err(e) => {
            warn!(template = %id, error = %e, "template persistence failed after secrets were written");
            return Err(e);
        }
    };

    settle_secrets(ctx, &id, &persisted, &records).await;
    info!(template = %id, secrets = records.len(), "node template created");
    Ok(persisted.redacted(&ctx.classifier))
}

/// Update a template's spec, redacting any new sensitive values
///
/// `desired.metadata.resource_version`, when set, must match the stored
/// version. Overwritten secrets are restored and new ones removed if the
/// template cannot be persisted; secrets for keys that are no longer sensitive
/// are deleted only after the new revision is stored.
pub async fn update(ctx: &Context, mut desired: NodeTemplate) -> Result<NodeTemplate, Error> {
    let id = validate(&desired)?;
    let resource = template_resource();
    let current = load(ctx, &id).await?;

    let current_version = current.metadata.resource_version.clone();
    if let Some(expected) = &desired.metadata.resource_version {
        if current_version.as_ref() != Some(expected) {
            return Err(Error::conflict(format!(
                "node template {id} was modified, resource version {expected} is stale"
            )));
        }
    }

    strip_credential_fields(ctx, &mut desired.spec).await?;
    let records = redact(
        &ctx.classifier,
        &id,
        &mut desired.spec,
        &current.spec.secret_refs,
    )?;

    // (record to write, value it replaces)
    let mut snapshot: Vec<(SecretRecord, Option<SecretRecord>)> = Vec::with_capacity(records.len());
    for record in records {
        let previous = match ctx
            .secrets
            .get_secret(&record.namespace, &record.name)
            .await
        {
            Ok(previous) => Some(previous),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        snapshot.push((record, previous));
    }

    let _guard = ctx.lock_template(&id).await;
    let latest = load(ctx, &id).await?;
    if latest.metadata.resource_version != current_version {
        return Err(Error::conflict(format!(
            "node template {id} was modified concurrently"
        )));
    }

    let mut written: Vec<(SecretRecord, Option<SecretRecord>)> = Vec::with_capacity(snapshot.len());
    for (record, previous) in snapshot {
        if let Err(e) = ctx.secrets.put_secret(record.clone()).await {
            warn!(template = %id, secret = %record.name, error = %e, "secret write failed, aborting update");
            restore_secrets(ctx, &id, current_version.as_deref(), written).await;
            return Err(e);
        }
        written.push((record, previous));
    }

    let mut next = current.clone();
    next.spec = desired.spec;
    next.metadata.labels = desired.metadata.labels.or(current.metadata.labels.clone());
    next.metadata.annotations = desired
        .metadata
        .annotations
        .or(current.metadata.annotations.clone());
    next.metadata.resource_version = current_version.clone();
    let body = to_dynamic(&next)?;

    let persisted = match retry_with_backoff_if(
        &ctx.config.persist_retry,
        "persist_node_template",
        Error::is_retryable,
        || ctx.resources.update(&resource, &id.namespace, body.clone()),
    )
    .await
    {
        Ok(persisted) => from_dynamic::<NodeTemplate>(persisted)?,
        Err(e) => {
            warn!(template = %id, error = %e, "template update failed, restoring secrets");
            restore_secrets(ctx, &id, current_version.as_deref(), written).await;
            return Err(e);
        }
    };

    let rewritten: Vec<SecretRecord> = written.into_iter().map(|(record, _)| record).collect();
    settle_secrets(ctx, &id, &persisted, &rewritten).await;

    let stale: Vec<&SecretReference> = current
        .spec
        .secret_refs
        .iter()
        .filter(|(key, reference)| {
            next.spec
                .secret_refs
                .get(*key)
                .map_or(true, |r| r.name != reference.name)
        })
        .map(|(_, reference)| reference)
        .collect();
    for reference in stale {
        match ctx
            .secrets
            .delete_secret(&reference.namespace, &reference.name)
            .await
        {
            Ok(()) => debug!(template = %id, secret = %reference.name, "deleted stale secret"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(
                template = %id,
                secret = %reference.name,
                error = %e,
                "failed to delete stale secret, leaving it for the orphan sweep"
            ),
        }
    }

    info!(template = %id, rewritten = rewritten.len(), "node template updated");
    Ok(persisted.redacted(&ctx.classifier))
}

/// Undo the secret writes of an update whose template write failed
///
/// A record is reverted only while it still holds this call's payload and the
/// stored template is still at `base_version`.
async fn restore_secrets(
    ctx: &Context,
    id: &TemplateId,
    base_version: Option<&str>,
    written: Vec<(SecretRecord, Option<SecretRecord>)>,
) {
    if written.is_empty() {
        return;
    }
    match load(ctx, id).await {
        Ok(stored) if stored.metadata.resource_version.as_deref() == base_version => {}
        Ok(_) => {
            warn!(template = %id, "newer revision stored, leaving secrets to it");
            return;
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            warn!(template = %id, error = %e, "cannot re-read template, leaving secrets as written");
            return;
        }
    }

    for (record, previous) in written.into_iter().rev() {
        match ctx
            .secrets
            .get_secret(&record.namespace, &record.name)
            .await
        {
            Ok(current) if current.same_content(&record) => {}
            Ok(_) => {
                debug!(secret = %record.name, "secret rewritten by another writer, not restoring");
                continue;
            }
            Err(e) if e.is_not_found() => continue,
            Err(e) => {
                warn!(secret = %record.name, error = %e, "cannot read secret, not restoring");
                continue;
            }
        }

        let result = match previous {
            Some(previous) => ctx.secrets.put_secret(previous).await.map(|_| ()),
            None => match ctx
                .secrets
                .delete_secret(&record.namespace, &record.name)
                .await
            {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            },
        };
        if let Err(e) = result {
            warn!(
                namespace = %record.namespace,
                secret = %record.name,
                error = %e,
                "failed to restore secret"
            );
        }
    }
}

/// Fetch a template through the redacted view
pub async fn get(ctx: &Context, id: &TemplateId) -> Result<NodeTemplate, Error> {
    Ok(load(ctx, id).await?.redacted(&ctx.classifier))
}

/// Redact a template that was written around the engine
///
/// The template's own resource version guards the rewrite, so a concurrent
/// owner update wins and the adoption is retried on the next reconcile.
pub async fn adopt(ctx: &Context, template: &NodeTemplate) -> Result<NodeTemplate, Error> {
    let id = template.id()?;
    let plaintext = template.plaintext_sensitive_keys(&ctx.classifier);
    info!(template = %id, keys = ?plaintext, "adopting template with plaintext sensitive values");
    update(ctx, template.clone()).await
}

/// Configuration with every reference replaced by its decoded secret value
///
/// This is the only path that yields plaintext; its result must never be
/// persisted on the template or returned through the caller surface.
pub async fn resolve_config(
    ctx: &Context,
    template: &NodeTemplate,
) -> Result<BTreeMap<String, Value>, Error> {
    let mut config = template.spec.config.clone();
    for (key, reference) in &template.spec.secret_refs {
        let record = ctx
            .secrets
            .get_secret(&reference.namespace, &reference.name)
            .await?;
        let payload = record.field(&reference.field).ok_or_else(|| {
            Error::inconsistent(format!(
                "secret {}/{} has no field {}",
                reference.namespace, reference.name, reference.field
            ))
        })?;
        config.insert(key.clone(), reference.decode_payload(payload)?);
    }
    Ok(config)
}
