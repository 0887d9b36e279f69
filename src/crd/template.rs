//! NodeTemplate Custom Resource Definition
//!
//! A NodeTemplate holds the provider configuration used to provision the nodes
//! of a node pool. Sensitive fields never live on the object: their values are
//! stored as secret records and the configuration keeps a reference token.

use std::collections::{BTreeMap, BTreeSet};

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{Condition, SecretReference, TemplateId, TemplatePhase};
use crate::classify::SensitivityClassifier;
use crate::Error;

/// Annotation carrying the identity of the user that created the template
pub const CREATOR_ID_ANNOTATION: &str = "nodevault.dev/creator-id";

/// Specification for a NodeTemplate
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "provisioning.nodevault.dev",
    version = "v1alpha1",
    kind = "NodeTemplate",
    plural = "nodetemplates",
    shortname = "nt",
    derive = "PartialEq",
    status = "NodeTemplateStatus",
    namespaced,
    printcolumn = r#"{"name":"Driver","type":"string","jsonPath":".spec.driver"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Dependents","type":"integer","jsonPath":".status.dependents"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplateSpec {
    /// Provider configuration schema (e.g. `amazonec2Config`)
    pub driver: String,

    /// Provider configuration; sensitive keys hold reference tokens only
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config: BTreeMap<String, Value>,

    /// Secret record coordinates for every redacted key
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secret_refs: BTreeMap<String, SecretReference>,

    /// Cloud credential (`<namespace>:<name>`) supplying part of the configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_credential_id: Option<String>,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn preserve_unknown_fields(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    let mut extensions = schemars::Map::new();
    extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        Value::Bool(true),
    );
    schemars::schema::Schema::Object(schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::Object.into()),
        extensions,
        ..Default::default()
    })
}

/// Status for a NodeTemplate
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplateStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: TemplatePhase,

    /// Number of node pools referencing the template when last observed
    #[serde(default)]
    pub dependents: u32,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the template state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl NodeTemplateStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: TemplatePhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the dependent count and return self for chaining
    pub fn dependents(mut self, count: u32) -> Self {
        self.dependents = count;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }

    /// Look up a condition by type
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

impl NodeTemplate {
    /// Logical identity; fails for objects without namespace or name
    pub fn id(&self) -> Result<TemplateId, Error> {
        let namespace = self
            .namespace()
            .ok_or_else(|| Error::validation("node template has no namespace"))?;
        let name = self
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::validation("node template has no name"))?;
        Ok(TemplateId::new(namespace, name))
    }

    /// Identity of the user that created the template
    pub fn creator_id(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(CREATOR_ID_ANNOTATION))
            .map(String::as_str)
    }

    /// Current lifecycle phase, `Active` when no status was written yet
    pub fn phase(&self) -> TemplatePhase {
        self.status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or_default()
    }

    /// Sensitive keys whose configuration value is not this key's reference token
    pub fn plaintext_sensitive_keys(&self, classifier: &SensitivityClassifier) -> Vec<String> {
        classifier
            .classify(&self.spec.driver, &self.spec.config)
            .into_iter()
            .filter(|key| {
                let value = &self.spec.config[key];
                !self
                    .spec
                    .secret_refs
                    .get(key)
                    .is_some_and(|r| r.matches_token(value))
            })
            .collect()
    }

    /// Copy of this template with every plaintext sensitive value removed
    pub fn redacted(&self, classifier: &SensitivityClassifier) -> NodeTemplate {
        let mut copy = self.clone();
        for key in self.plaintext_sensitive_keys(classifier) {
            copy.spec.config.remove(&key);
        }
        copy
    }

    /// Logical names of every secret record this template references
    pub fn referenced_secrets(&self) -> BTreeSet<(String, String)> {
        self.spec
            .secret_refs
            .values()
            .map(|r| (r.namespace.clone(), r.name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::SecretEncoding;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::CustomResourceExt;
    use serde_json::json;

    fn sample_template(config: Value) -> NodeTemplate {
        let config = serde_json::from_value(config).unwrap();
        NodeTemplate {
            metadata: ObjectMeta {
                name: Some("nt-1".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(BTreeMap::from([(
                    CREATOR_ID_ANNOTATION.to_string(),
                    "user-abc".to_string(),
                )])),
                ..Default::default()
            },
            spec: NodeTemplateSpec {
                driver: "amazonec2Config".to_string(),
                config,
                secret_refs: BTreeMap::new(),
                cloud_credential_id: None,
                description: None,
            },
            status: None,
        }
    }

    #[test]
    fn identity_and_creator_come_from_metadata() {
        let nt = sample_template(json!({}));
        assert_eq!(nt.id().unwrap(), TemplateId::new("default", "nt-1"));
        assert_eq!(nt.creator_id(), Some("user-abc"));
        assert_eq!(nt.phase(), TemplatePhase::Active);
    }

    #[test]
    fn template_without_namespace_has_no_identity() {
        let mut nt = sample_template(json!({}));
        nt.metadata.namespace = None;
        assert!(nt.id().is_err());
    }

    #[test]
    fn plaintext_sensitive_values_are_detected_and_redacted() {
        let nt = sample_template(json!({
            "sshKeyContents": "notarealsshkey",
            "region": "us-west-2"
        }));
        let classifier = SensitivityClassifier::default();

        assert_eq!(nt.plaintext_sensitive_keys(&classifier), vec!["sshKeyContents"]);

        let redacted = nt.redacted(&classifier);
        assert!(!redacted.spec.config.contains_key("sshKeyContents"));
        assert_eq!(redacted.spec.config["region"], json!("us-west-2"));
    }

    #[test]
    fn reference_tokens_are_not_plaintext() {
        let mut nt = sample_template(json!({}));
        let reference = SecretReference::for_field(
            &nt.id().unwrap(),
            "sshKeyContents",
            SecretEncoding::Raw,
        );
        nt.spec
            .config
            .insert("sshKeyContents".to_string(), json!(reference.token()));
        nt.spec
            .secret_refs
            .insert("sshKeyContents".to_string(), reference);

        let classifier = SensitivityClassifier::default();
        assert!(nt.plaintext_sensitive_keys(&classifier).is_empty());
        assert_eq!(nt.redacted(&classifier), nt);
        assert_eq!(nt.referenced_secrets().len(), 1);
    }

    #[test]
    fn a_foreign_token_counts_as_plaintext() {
        let nt = sample_template(json!({
            "sshKeyContents": "secret://other/someone-else:sshKeyContents"
        }));
        let classifier = SensitivityClassifier::default();
        assert_eq!(nt.plaintext_sensitive_keys(&classifier), vec!["sshKeyContents"]);
    }

    #[test]
    fn crd_is_namespaced_and_preserves_config_fields() {
        let crd = NodeTemplate::crd();
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.plural, "nodetemplates");

        let yaml = serde_yaml::to_string(&crd).unwrap();
        assert!(yaml.contains("x-kubernetes-preserve-unknown-fields"));
    }

    #[test]
    fn status_conditions_replace_same_type() {
        use crate::crd::types::{Condition, ConditionStatus};

        let status = NodeTemplateStatus::with_phase(TemplatePhase::Active)
            .condition(Condition::new(
                "SecretsResolved",
                ConditionStatus::False,
                "MissingSecret",
                "sshKeyContents",
            ))
            .condition(Condition::new(
                "SecretsResolved",
                ConditionStatus::True,
                "AllReferencesResolved",
                "",
            ));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(
            status.get_condition("SecretsResolved").unwrap().status,
            ConditionStatus::True
        );
    }
}
