//! Reference-count guard
//!
//! Node pools are the only consumers of a template. A live NodePool whose
//! `spec.nodeTemplateRef` names a template is a dependency edge, and a template
//! with edges cannot be deleted.
//!
//! Attach and delete race through the template's resource version: attach
//! creates the pool and then rewrites the template status, while delete marks
//! the template, counts edges, and deletes with the version it observed. Any
//! attach that lands after the count changes that version, so the delete
//! fails with a conflict instead of orphaning the new pool.

use tracing::{debug, info, warn};

use crate::context::Context;
use crate::crd::{
    node_pool_resource, template_resource, NodePool, NodeTemplate, NodeTemplateStatus,
    TemplateId, TemplatePhase,
};
use crate::engine::load;
use crate::store::{from_dynamic, to_dynamic};
use crate::Error;

const STATUS_WRITE_ATTEMPTS: u32 = 5;

/// A live reference from a node pool to a template
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyEdge {
    /// Namespace of the node pool
    pub consumer_namespace: String,
    /// Name of the node pool
    pub consumer_name: String,
    /// Template the pool references
    pub template: TemplateId,
}

/// Inputs to the per-template lifecycle state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The owner asked for deletion while `dependents` edges were live
    DeleteRequested {
        /// Live edge count at the time of the request
        dependents: usize,
    },
    /// A node pool started referencing the template
    EdgeAdded,
    /// A node pool stopped referencing the template
    EdgeRemoved,
}

/// Next phase for `phase` after `event`
///
/// Deletion completes only with zero dependents. A new consumer cancels a
/// pending deletion request.
pub fn transition(phase: &TemplatePhase, event: LifecycleEvent) -> TemplatePhase {
    match (phase, event) {
        (TemplatePhase::Deleted, _) => TemplatePhase::Deleted,
        (_, LifecycleEvent::DeleteRequested { dependents: 0 }) => TemplatePhase::Deleted,
        (_, LifecycleEvent::DeleteRequested { .. }) => TemplatePhase::DeletionRequested,
        (_, LifecycleEvent::EdgeAdded) => TemplatePhase::Active,
        (phase, LifecycleEvent::EdgeRemoved) => phase.clone(),
    }
}

/// Live dependency edges pointing at `id`
pub async fn dependents(ctx: &Context, id: &TemplateId) -> Result<Vec<DependencyEdge>, Error> {
    let pools = ctx.resources.list(&node_pool_resource(), None).await?;
    let mut edges = Vec::new();
    for object in pools {
        let pool: NodePool = from_dynamic(object)?;
        if pool.spec.node_template_ref != *id {
            continue;
        }
        let (consumer_namespace, consumer_name) = pool.pool_id()?;
        edges.push(DependencyEdge {
            consumer_namespace,
            consumer_name,
            template: id.clone(),
        });
    }
    Ok(edges)
}

pub(crate) fn status_of(template: &NodeTemplate) -> NodeTemplateStatus {
    template.status.clone().unwrap_or_default()
}

pub(crate) async fn write_status(
    ctx: &Context,
    id: &TemplateId,
    status: &NodeTemplateStatus,
    expected_version: Option<String>,
) -> Result<NodeTemplate, Error> {
    let object = ctx
        .resources
        .update_status(
            &template_resource(),
            &id.namespace,
            &id.name,
            serde_json::to_value(status)?,
            expected_version,
        )
        .await?;
    from_dynamic(object)
}

/// Re-count edges and record the result on the template status
///
/// Every write is guarded by the version just read and retried on conflict,
/// so each call moves the template's resource version forward exactly once.
async fn refresh_dependents(
    ctx: &Context,
    id: &TemplateId,
    event: LifecycleEvent,
) -> Result<NodeTemplate, Error> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let template = load(ctx, id).await?;
        let count = dependents(ctx, id).await?.len();
        let mut status = status_of(&template);
        status.phase = transition(&status.phase, event);
        status.dependents = u32::try_from(count).unwrap_or(u32::MAX);

        match write_status(ctx, id, &status, template.metadata.resource_version.clone()).await {
            Ok(updated) => return Ok(updated),
            Err(Error::Conflict(msg)) if attempt < STATUS_WRITE_ATTEMPTS => {
                debug!(template = %id, attempt, error = %msg, "template status changed underneath, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Create a node pool that references an existing template
pub async fn attach(ctx: &Context, pool: NodePool) -> Result<NodePool, Error> {
    pool.validate()?;
    let (namespace, name) = pool.pool_id()?;
    let template_id = pool.spec.node_template_ref.clone();

    let template = load(ctx, &template_id).await.map_err(|e| match e {
        Error::NotFound(_) => Error::not_found(format!("node template {template_id} not found")),
        other => other,
    })?;
    if template.phase() == TemplatePhase::Deleted {
        return Err(Error::not_found(format!(
            "node template {template_id} is deleted"
        )));
    }

    let created = ctx
        .resources
        .create(&node_pool_resource(), &namespace, to_dynamic(&pool)?)
        .await?;

    match refresh_dependents(ctx, &template_id, LifecycleEvent::EdgeAdded).await {
        Ok(template) => {
            info!(
                template = %template_id,
                pool = %format!("{namespace}/{name}"),
                dependents = status_of(&template).dependents,
                "node pool attached"
            );
            from_dynamic(created)
        }
        Err(Error::NotFound(_)) => {
            warn!(template = %template_id, pool = %name, "template deleted while attaching, removing pool");
            if let Err(e) = ctx
                .resources
                .delete(&node_pool_resource(), &namespace, &name, None)
                .await
            {
                warn!(pool = %name, error = %e, "failed to remove pool for deleted template");
            }
            Err(Error::not_found(format!(
                "node template {template_id} was deleted"
            )))
        }
        Err(e) => Err(e),
    }
}

/// Delete a node pool and refresh its template's dependent count
pub async fn detach(ctx: &Context, namespace: &str, name: &str) -> Result<(), Error> {
    let resource = node_pool_resource();
    let pool: NodePool = from_dynamic(ctx.resources.get(&resource, namespace, name).await?)?;
    ctx.resources.delete(&resource, namespace, name, None).await?;

    let template_id = pool.spec.node_template_ref;
    match refresh_dependents(ctx, &template_id, LifecycleEvent::EdgeRemoved).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!(template = %template_id, error = %e, "failed to refresh dependent count"),
    }
    info!(template = %template_id, pool = %format!("{namespace}/{name}"), "node pool detached");
    Ok(())
}

/// Delete a template once nothing references it
///
/// The template is first marked `DeletionRequested`. With live edges the call
/// fails with [`Error::InUse`] and the template stays marked; the caller must
/// remove the pools and reissue the delete. Otherwise the template is deleted
/// under the version observed after marking, then its secrets are removed.
pub async fn delete(ctx: &Context, id: &TemplateId) -> Result<(), Error> {
    let template = load(ctx, id).await?;

    let mut status = status_of(&template);
    status.phase = TemplatePhase::DeletionRequested;
    let marked = write_status(
        ctx,
        id,
        &status.message("deletion requested"),
        template.metadata.resource_version.clone(),
    )
    .await?;

    let edges = dependents(ctx, id).await?;
    if transition(
        &marked.phase(),
        LifecycleEvent::DeleteRequested {
            dependents: edges.len(),
        },
    ) != TemplatePhase::Deleted
    {
        let consumers: Vec<String> = edges
            .iter()
            .map(|e| format!("{}/{}", e.consumer_namespace, e.consumer_name))
            .collect();
        let status = status_of(&marked)
            .dependents(u32::try_from(edges.len()).unwrap_or(u32::MAX))
            .message(format!("in use by node pools {}", consumers.join(", ")));
        if let Err(e) = write_status(ctx, id, &status, marked.metadata.resource_version.clone()).await {
            debug!(template = %id, error = %e, "could not record dependents on status");
        }
        info!(template = %id, dependents = edges.len(), "delete refused, template in use");
        return Err(Error::in_use(format!(
            "template is in use by a node pool ({})",
            consumers.join(", ")
        )));
    }

    ctx.resources
        .delete(
            &template_resource(),
            &id.namespace,
            &id.name,
            marked.metadata.resource_version.clone(),
        )
        .await?;

    for reference in template.spec.secret_refs.values() {
        match ctx
            .secrets
            .delete_secret(&reference.namespace, &reference.name)
            .await
        {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => warn!(
                template = %id,
                secret = %reference.name,
                error = %e,
                "failed to delete secret, leaving it for the orphan sweep"
            ),
        }
    }

    info!(template = %id, secrets = template.spec.secret_refs.len(), "node template deleted");
    Ok(())
}
