//! HTTP surface for templates and node pools
//!
//! Routes:
//! - `POST /v1/namespaces/{ns}/nodetemplates` - create a template
//! - `GET|PUT|DELETE /v1/namespaces/{ns}/nodetemplates/{name}` - read, update, delete
//! - `GET /v1/namespaces/{ns}/nodetemplates/{name}/dependents` - live node pool edges
//! - `POST /v1/namespaces/{ns}/nodepools` - attach a node pool
//! - `DELETE /v1/namespaces/{ns}/nodepools/{name}` - detach a node pool
//! - `GET /healthz`
//!
//! Every template in a response has been through the redacted view.

mod error;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::debug;

use crate::context::Context;
use crate::crd::{
    NodePool, NodePoolSpec, NodeTemplate, NodeTemplateSpec, TemplateId, CREATOR_ID_ANNOTATION,
};
use crate::guard::{self, DependencyEdge};
use crate::{engine, Error};

/// Header naming the user a create request acts for
pub const CREATOR_HEADER: &str = "x-nodevault-creator";

/// Body of a template create request
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTemplateRequest {
    /// Template name
    pub name: String,
    /// Labels copied onto the template
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    /// Driver and configuration
    pub spec: NodeTemplateSpec,
}

/// Body of a template update request
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTemplateRequest {
    /// Version the caller last read; the update fails if the template moved on
    #[serde(default)]
    pub resource_version: Option<String>,
    /// Labels replacing the current ones
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    /// New driver and configuration
    pub spec: NodeTemplateSpec,
}

/// Body of a node pool attach request
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodePoolRequest {
    /// Pool name
    pub name: String,
    /// Pool specification
    #[serde(flatten)]
    pub spec: NodePoolSpec,
}

fn creator(headers: &HeaderMap) -> Result<Option<String>, Error> {
    headers
        .get(CREATOR_HEADER)
        .map(|value| {
            value
                .to_str()
                .map(str::to_string)
                .map_err(|_| Error::validation(format!("{CREATOR_HEADER} is not valid text")))
        })
        .transpose()
}

async fn create_template(
    State(ctx): State<Arc<Context>>,
    Path(namespace): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CreateTemplateRequest>,
) -> Result<(StatusCode, Json<NodeTemplate>), Error> {
    let mut template = NodeTemplate::new(&request.name, request.spec);
    template.metadata.namespace = Some(namespace);
    template.metadata.labels = request.labels;
    if let Some(creator) = creator(&headers)? {
        template.metadata.annotations =
            Some(BTreeMap::from([(CREATOR_ID_ANNOTATION.to_string(), creator)]));
    }

    let created = engine::create(&ctx, template).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_template(
    State(ctx): State<Arc<Context>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<NodeTemplate>, Error> {
    Ok(Json(engine::get(&ctx, &TemplateId::new(namespace, name)).await?))
}

async fn update_template(
    State(ctx): State<Arc<Context>>,
    Path((namespace, name)): Path<(String, String)>,
    Json(request): Json<UpdateTemplateRequest>,
) -> Result<Json<NodeTemplate>, Error> {
    let mut template = NodeTemplate::new(&name, request.spec);
    template.metadata.namespace = Some(namespace);
    template.metadata.labels = request.labels;
    template.metadata.resource_version = request.resource_version;
    Ok(Json(engine::update(&ctx, template).await?))
}

async fn delete_template(
    State(ctx): State<Arc<Context>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<StatusCode, Error> {
    guard::delete(&ctx, &TemplateId::new(namespace, name)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_dependents(
    State(ctx): State<Arc<Context>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Vec<DependencyEdge>>, Error> {
    let id = TemplateId::new(namespace, name);
    engine::get(&ctx, &id).await?;
    Ok(Json(guard::dependents(&ctx, &id).await?))
}

async fn attach_pool(
    State(ctx): State<Arc<Context>>,
    Path(namespace): Path<String>,
    Json(request): Json<CreateNodePoolRequest>,
) -> Result<(StatusCode, Json<NodePool>), Error> {
    let mut pool = NodePool::new(&request.name, request.spec);
    pool.metadata.namespace = Some(namespace);
    let attached = guard::attach(&ctx, pool).await?;
    Ok((StatusCode::CREATED, Json(attached)))
}

async fn detach_pool(
    State(ctx): State<Arc<Context>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<StatusCode, Error> {
    guard::detach(&ctx, &namespace, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn healthz() -> &'static str {
    debug!("health check");
    "ok"
}

/// Build the router serving templates and node pools out of `ctx`
pub fn router(ctx: Arc<Context>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/namespaces/{namespace}/nodetemplates", post(create_template))
        .route(
            "/v1/namespaces/{namespace}/nodetemplates/{name}",
            get(get_template).put(update_template).delete(delete_template),
        )
        .route(
            "/v1/namespaces/{namespace}/nodetemplates/{name}/dependents",
            get(list_dependents),
        )
        .route("/v1/namespaces/{namespace}/nodepools", post(attach_pool))
        .route(
            "/v1/namespaces/{namespace}/nodepools/{name}",
            axum::routing::delete(detach_pool),
        )
        .with_state(ctx)
}
