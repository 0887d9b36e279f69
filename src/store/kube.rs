//! Stores backed by the Kubernetes API server
//!
//! Templates and node pools are read and written as `DynamicObject`s so one
//! adapter serves every CRD. Secret records become `v1/Secret` objects labelled
//! as managed by nodevault; the logical record name and owning template are kept
//! in annotations because logical names (`<template>:<key>`) are not valid
//! object names.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams, Preconditions,
};
use kube::core::ApiResource;
use kube::Client;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{ResourceStore, SecretRecord, SecretStore};
use crate::crd::TemplateId;
use crate::{Error, MANAGED_BY_LABEL};

/// Annotation holding a record's logical name
pub const SECRET_NAME_ANNOTATION: &str = "nodevault.dev/secret-name";
/// Annotation holding the owning template as `<namespace>:<name>`
pub const SECRET_OWNER_ANNOTATION: &str = "nodevault.dev/owner";

const MAX_OBJECT_NAME_LEN: usize = 253;
const HASH_SUFFIX_LEN: usize = 10;

/// Kubernetes object name for a logical secret name
///
/// Valid DNS subdomain names are used as-is. Anything else is lowercased, has
/// invalid characters replaced by `-`, and gets a hash suffix of the original
/// so distinct logical names never collide.
pub fn object_name(logical: &str) -> String {
    let valid = !logical.is_empty()
        && logical.len() <= MAX_OBJECT_NAME_LEN
        && logical
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && logical.starts_with(|c: char| c.is_ascii_alphanumeric())
        && logical.ends_with(|c: char| c.is_ascii_alphanumeric());
    if valid {
        return logical.to_string();
    }

    let hash = format!("{:x}", Sha256::digest(logical.as_bytes()));
    let sanitized: String = logical
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();
    let budget = MAX_OBJECT_NAME_LEN - HASH_SUFFIX_LEN - 1;
    let prefix: String = sanitized.chars().take(budget).collect();
    let prefix = prefix.trim_matches('-');
    if prefix.is_empty() {
        hash[..HASH_SUFFIX_LEN].to_string()
    } else {
        format!("{prefix}-{}", &hash[..HASH_SUFFIX_LEN])
    }
}

/// Delete options carrying an optional resource-version precondition
fn delete_params(expected_version: Option<String>) -> DeleteParams {
    DeleteParams {
        preconditions: expected_version.map(|version| Preconditions {
            resource_version: Some(version),
            uid: None,
        }),
        ..Default::default()
    }
}

/// Resource store that talks to the API server
#[derive(Clone)]
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    /// Create a store over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        body: DynamicObject,
    ) -> Result<DynamicObject, Error> {
        Ok(self
            .api(resource, namespace)
            .create(&PostParams::default(), &body)
            .await?)
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, Error> {
        Ok(self.api(resource, namespace).get(name).await?)
    }

    async fn update(
        &self,
        resource: &ApiResource,
        namespace: &str,
        body: DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let name = body
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::validation("object has no name"))?;
        Ok(self
            .api(resource, namespace)
            .replace(&name, &PostParams::default(), &body)
            .await?)
    }

    async fn update_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        status: Value,
        expected_version: Option<String>,
    ) -> Result<DynamicObject, Error> {
        // A resourceVersion in a merge patch makes the API server reject stale writes.
        let patch = match expected_version {
            Some(version) => serde_json::json!({
                "metadata": { "resourceVersion": version },
                "status": status,
            }),
            None => serde_json::json!({ "status": status }),
        };
        Ok(self
            .api(resource, namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        expected_version: Option<String>,
    ) -> Result<(), Error> {
        self.api(resource, namespace)
            .delete(name, &delete_params(expected_version))
            .await?;
        Ok(())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<String>,
    ) -> Result<Vec<DynamicObject>, Error> {
        let api = match namespace {
            Some(ns) => self.api(resource, &ns),
            None => Api::all_with(self.client.clone(), resource),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// Secret store mapping records onto `v1/Secret` objects
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
    field_manager: String,
    managed_by: String,
}

impl KubeSecretStore {
    /// Create a store that labels its secrets `app.kubernetes.io/managed-by=<managed_by>`
    pub fn new(
        client: Client,
        field_manager: impl Into<String>,
        managed_by: impl Into<String>,
    ) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            managed_by: managed_by.into(),
        }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn to_secret(&self, record: &SecretRecord) -> Result<Secret, Error> {
        let mut annotations =
            BTreeMap::from([(SECRET_NAME_ANNOTATION.to_string(), record.name.clone())]);
        if let Some(owner) = &record.owner {
            annotations.insert(SECRET_OWNER_ANNOTATION.to_string(), owner.to_string());
        }

        let data = record
            .data
            .iter()
            .map(|(field, encoded)| {
                STANDARD
                    .decode(encoded)
                    .map(|bytes| (field.clone(), ByteString(bytes)))
                    .map_err(|e| {
                        Error::validation(format!(
                            "payload for {}/{} field {field} is not base64: {e}",
                            record.namespace, record.name
                        ))
                    })
            })
            .collect::<Result<BTreeMap<_, _>, Error>>()?;

        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(object_name(&record.name)),
                namespace: Some(record.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    self.managed_by.clone(),
                )])),
                annotations: Some(annotations),
                ..Default::default()
            },
            data: Some(data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        })
    }
}

/// Convert a Secret back into a record
///
/// Secrets written by other tools (cloud credentials) have no logical-name
/// annotation and keep their object name.
fn from_secret(secret: Secret) -> Option<SecretRecord> {
    let annotations = secret.metadata.annotations.unwrap_or_default();
    let name = annotations
        .get(SECRET_NAME_ANNOTATION)
        .cloned()
        .or(secret.metadata.name)?;
    let namespace = secret.metadata.namespace?;
    let owner = annotations
        .get(SECRET_OWNER_ANNOTATION)
        .and_then(|raw| raw.parse::<TemplateId>().ok());
    let data = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(field, bytes)| (field, STANDARD.encode(bytes.0)))
        .collect();

    Some(SecretRecord {
        namespace,
        name,
        data,
        owner,
        created_at: secret.metadata.creation_timestamp.map(|t| t.0),
    })
}

fn unreadable(namespace: &str, name: &str) -> Error {
    Error::not_found(format!("secret {namespace}/{name} has no readable identity"))
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn put_secret(&self, record: SecretRecord) -> Result<SecretRecord, Error> {
        let secret = self.to_secret(&record)?;
        let object = object_name(&record.name);
        debug!(namespace = %record.namespace, secret = %record.name, object = %object, "applying secret");
        let applied = self
            .api(&record.namespace)
            .patch(
                &object,
                &PatchParams::apply(&self.field_manager).force(),
                &Patch::Apply(&secret),
            )
            .await?;
        from_secret(applied).ok_or_else(|| unreadable(&record.namespace, &record.name))
    }

    async fn create_secret(&self, record: SecretRecord) -> Result<SecretRecord, Error> {
        let secret = self.to_secret(&record)?;
        let created = self
            .api(&record.namespace)
            .create(&PostParams::default(), &secret)
            .await?;
        from_secret(created).ok_or_else(|| unreadable(&record.namespace, &record.name))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretRecord, Error> {
        let secret = self.api(namespace).get(&object_name(name)).await?;
        from_secret(secret)
            .filter(|record| record.name == name)
            .ok_or_else(|| unreadable(namespace, name))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.api(namespace)
            .delete(&object_name(name), &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn list_secrets(&self, namespace: Option<String>) -> Result<Vec<SecretRecord>, Error> {
        let api: Api<Secret> = match namespace {
            Some(ns) => self.api(&ns),
            None => Api::all(self.client.clone()),
        };
        let selector = format!("{MANAGED_BY_LABEL}={}", self.managed_by);
        let secrets = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(secrets.items.into_iter().filter_map(from_secret).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    #[test]
    fn valid_names_are_used_verbatim() {
        assert_eq!(object_name("aws-creds"), "aws-creds");
    }

    #[test]
    fn logical_names_with_colons_get_a_stable_hashed_name() {
        let name = object_name("nt-1:sshKeyContents");
        assert!(name.starts_with("nt-1-sshkeycontents-"));
        assert_eq!(name.len(), "nt-1-sshkeycontents-".len() + HASH_SUFFIX_LEN);
        assert_eq!(name, object_name("nt-1:sshKeyContents"));
        assert_ne!(name, object_name("nt-1:sshkeycontents"));
    }

    #[test]
    fn delete_carries_the_expected_version() {
        let params = delete_params(Some("42".to_string()));
        let preconditions = params.preconditions.expect("precondition set");
        assert_eq!(preconditions.resource_version.as_deref(), Some("42"));
        assert!(preconditions.uid.is_none());

        assert!(delete_params(None).preconditions.is_none());
    }

    #[test]
    fn very_long_names_are_truncated() {
        let logical = format!("{}:secretKey", "a".repeat(300));
        assert!(object_name(&logical).len() <= MAX_OBJECT_NAME_LEN);
    }

    #[test]
    fn secrets_convert_back_to_records() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(object_name("nt-1:sshKeyContents")),
                namespace: Some("default".to_string()),
                annotations: Some(BTreeMap::from([
                    (
                        SECRET_NAME_ANNOTATION.to_string(),
                        "nt-1:sshKeyContents".to_string(),
                    ),
                    (SECRET_OWNER_ANNOTATION.to_string(), "default:nt-1".to_string()),
                ])),
                creation_timestamp: Some(Time(chrono::Utc::now())),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "sshKeyContents".to_string(),
                ByteString(b"notarealsshkey".to_vec()),
            )])),
            ..Default::default()
        };

        let record = from_secret(secret).unwrap();
        assert_eq!(record.name, "nt-1:sshKeyContents");
        assert_eq!(record.owner, Some(TemplateId::new("default", "nt-1")));
        assert_eq!(record.field("sshKeyContents"), Some("bm90YXJlYWxzc2hrZXk="));
        assert!(record.created_at.is_some());
    }

    #[test]
    fn foreign_secrets_keep_their_object_name() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("aws-creds".to_string()),
                namespace: Some("cattle-global-data".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "amazonec2credentialConfig-accessKey".to_string(),
                ByteString(b"AKIA".to_vec()),
            )])),
            ..Default::default()
        };
        let record = from_secret(secret).unwrap();
        assert_eq!(record.name, "aws-creds");
        assert!(record.owner.is_none());
    }
}
