//! Custom Resource Definitions for nodevault
//!
//! This module contains the NodeTemplate and NodePool CRDs plus the shared
//! reference and status types they are built from.

mod node_pool;
mod template;
mod types;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::ApiResource;
use kube::CustomResourceExt;

pub use node_pool::{NodePool, NodePoolSpec};
pub use template::{NodeTemplate, NodeTemplateSpec, NodeTemplateStatus, CREATOR_ID_ANNOTATION};
pub use types::{
    is_reference_token, validate_dns_label, Condition, ConditionStatus, SecretEncoding,
    SecretReference, TemplateId, TemplatePhase, REFERENCE_TOKEN_PREFIX,
};

/// Dynamic API resource for NodeTemplates
pub fn template_resource() -> ApiResource {
    ApiResource::erase::<NodeTemplate>(&())
}

/// Dynamic API resource for NodePools
pub fn node_pool_resource() -> ApiResource {
    ApiResource::erase::<NodePool>(&())
}

/// Every CRD the operator installs
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![NodeTemplate::crd(), NodePool::crd()]
}
