//! NodePool Custom Resource Definition
//!
//! A NodePool consumes a NodeTemplate. Each live pool is a dependency edge that
//! keeps its template from being deleted.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{validate_dns_label, TemplateId};
use crate::Error;

/// Specification for a NodePool
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "provisioning.nodevault.dev",
    version = "v1alpha1",
    kind = "NodePool",
    plural = "nodepools",
    shortname = "np",
    derive = "PartialEq",
    namespaced,
    printcolumn = r#"{"name":"Template","type":"string","jsonPath":".spec.nodeTemplateRef.name"}"#,
    printcolumn = r#"{"name":"Quantity","type":"integer","jsonPath":".spec.quantity"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Template the pool provisions its nodes from
    pub node_template_ref: TemplateId,

    /// Prefix for node hostnames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname_prefix: Option<String>,

    /// Desired node count
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

impl NodePool {
    /// Build a pool named `name` in `namespace` that references `template`
    pub fn for_template(namespace: &str, name: &str, template: TemplateId) -> Self {
        let mut pool = NodePool::new(
            name,
            NodePoolSpec {
                node_template_ref: template,
                hostname_prefix: None,
                quantity: default_quantity(),
            },
        );
        pool.metadata.namespace = Some(namespace.to_string());
        pool
    }

    /// `(namespace, name)` of this pool
    pub fn pool_id(&self) -> Result<(String, String), Error> {
        let namespace = self
            .namespace()
            .ok_or_else(|| Error::validation("node pool has no namespace"))?;
        let name = self
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::validation("node pool has no name"))?;
        Ok((namespace, name))
    }

    /// Validate names and the template reference
    pub fn validate(&self) -> Result<(), Error> {
        let (namespace, name) = self.pool_id()?;
        validate_dns_label("node pool namespace", &namespace)?;
        validate_dns_label("node pool name", &name)?;
        self.spec.node_template_ref.validate()
    }
}
