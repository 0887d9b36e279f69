//! Capability adapters for the resource and secret backends
//!
//! The engine, guard and controller only talk to storage through the
//! [`ResourceStore`] and [`SecretStore`] traits. [`kube`] implements them on a
//! real cluster and [`memory`] implements them in-process for tests and local
//! runs. Both classify every backend failure into [`crate::Error`].

pub mod kube;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use ::kube::api::DynamicObject;
use ::kube::core::ApiResource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use crate::crd::TemplateId;
use crate::Error;

/// Namespaced CRUD over custom resources with resource-version concurrency
///
/// Updates and deletes carry the resource version the caller last observed;
/// a mismatch yields [`Error::Conflict`] and the caller must re-read.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Create an object; an existing object with the same name is a conflict
    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        body: DynamicObject,
    ) -> Result<DynamicObject, Error>;

    /// Fetch an object by name
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, Error>;

    /// Replace an object's spec and metadata
    ///
    /// `body.metadata.resource_version` is the expected current version. The
    /// status sub-resource is left untouched.
    async fn update(
        &self,
        resource: &ApiResource,
        namespace: &str,
        body: DynamicObject,
    ) -> Result<DynamicObject, Error>;

    /// Replace an object's status, optionally guarded by a resource version
    async fn update_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        status: Value,
        expected_version: Option<String>,
    ) -> Result<DynamicObject, Error>;

    /// Delete an object, optionally guarded by a resource version
    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        expected_version: Option<String>,
    ) -> Result<(), Error>;

    /// List objects in one namespace, or in all namespaces when `None`
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<String>,
    ) -> Result<Vec<DynamicObject>, Error>;
}

/// Namespaced key-value backend holding base64 secret payloads
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Create or overwrite a record
    async fn put_secret(&self, record: SecretRecord) -> Result<SecretRecord, Error>;

    /// Create a record; an existing record with the same name is a conflict
    async fn create_secret(&self, record: SecretRecord) -> Result<SecretRecord, Error>;

    /// Fetch a record by logical name
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretRecord, Error>;

    /// Delete a record by logical name
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// List records managed by nodevault, in one namespace or all
    async fn list_secrets(&self, namespace: Option<String>) -> Result<Vec<SecretRecord>, Error>;
}

/// A secret record as the engine sees it
///
/// `data` maps field names to base64-encoded payloads. `owner` names the
/// template the record belongs to; records without an owner are never swept.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretRecord {
    /// Namespace of the record
    pub namespace: String,
    /// Logical record name (`<template>:<key>`)
    pub name: String,
    /// Field name to base64 payload
    pub data: BTreeMap<String, String>,
    /// Template that owns the record
    pub owner: Option<TemplateId>,
    /// Set by the backend when the record is first stored
    pub created_at: Option<DateTime<Utc>>,
}

impl SecretRecord {
    /// Empty record with the given coordinates
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            data: BTreeMap::new(),
            owner: None,
            created_at: None,
        }
    }

    /// Add a base64 payload under `field`
    pub fn with_field(mut self, field: impl Into<String>, encoded: impl Into<String>) -> Self {
        self.data.insert(field.into(), encoded.into());
        self
    }

    /// Set the owning template
    pub fn owned_by(mut self, owner: TemplateId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Base64 payload stored under `field`
    pub fn field(&self, field: &str) -> Option<&str> {
        self.data.get(field).map(String::as_str)
    }

    /// Same payload and owner, ignoring backend-assigned fields
    pub fn same_content(&self, other: &SecretRecord) -> bool {
        self.data == other.data && self.owner == other.owner
    }
}

// Payloads stay out of logs even at debug level.
impl fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretRecord")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("fields", &self.data.keys().collect::<Vec<_>>())
            .field("owner", &self.owner)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Convert a typed resource into the dynamic form the resource store speaks
pub fn to_dynamic<K: Serialize>(object: &K) -> Result<DynamicObject, Error> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Convert a dynamic object back into its typed resource
pub fn from_dynamic<K: DeserializeOwned>(object: DynamicObject) -> Result<K, Error> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}
