//! In-process stores backed by `DashMap`
//!
//! These mirror the API server's semantics closely enough for the engine to
//! run unchanged: monotonically increasing resource versions, create-only
//! uniqueness, version-guarded update and delete, and a status sub-resource.
//! Both stores can be told to fail the next N calls with
//! [`Error::BackendUnavailable`].

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use kube::core::ApiResource;
use serde_json::Value;

use super::{ResourceStore, SecretRecord, SecretStore};
use crate::Error;

type ObjectKey = (String, String, String);

fn take_failure(failures: &AtomicU32, what: &str) -> Result<(), Error> {
    let injected = failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if injected {
        Err(Error::backend_unavailable(format!("{what}: injected failure")))
    } else {
        Ok(())
    }
}

fn check_version(current: &DynamicObject, expected: Option<&str>) -> Result<(), Error> {
    match expected {
        Some(expected) if current.metadata.resource_version.as_deref() != Some(expected) => {
            Err(Error::conflict(format!(
                "resource version {expected} is stale for {}",
                current.metadata.name.as_deref().unwrap_or_default()
            )))
        }
        _ => Ok(()),
    }
}

/// Resource store holding objects in memory
#[derive(Debug, Default)]
pub struct MemoryResourceStore {
    objects: DashMap<ObjectKey, DynamicObject>,
    version: AtomicU64,
    failures: AtomicU32,
}

impl MemoryResourceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls with a backend-unavailable error
    pub fn inject_failures(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of stored objects of the given resource type
    pub fn count(&self, resource: &ApiResource) -> usize {
        self.objects
            .iter()
            .filter(|entry| entry.key().0 == resource.plural)
            .count()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn key(resource: &ApiResource, namespace: &str, name: &str) -> ObjectKey {
        (
            resource.plural.clone(),
            namespace.to_string(),
            name.to_string(),
        )
    }

    fn object_name(body: &DynamicObject) -> Result<String, Error> {
        body.metadata
            .name
            .clone()
            .ok_or_else(|| Error::validation("object has no name"))
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        mut body: DynamicObject,
    ) -> Result<DynamicObject, Error> {
        take_failure(&self.failures, "create")?;
        let name = Self::object_name(&body)?;

        match self.objects.entry(Self::key(resource, namespace, &name)) {
            Entry::Occupied(_) => Err(Error::conflict(format!(
                "{} {namespace}/{name} already exists",
                resource.kind
            ))),
            Entry::Vacant(slot) => {
                let version = self.next_version();
                body.metadata.namespace = Some(namespace.to_string());
                body.metadata.uid = Some(format!("uid-{version}"));
                body.metadata.creation_timestamp = Some(Time(Utc::now()));
                body.metadata.resource_version = Some(version);
                Ok(slot.insert(body).clone())
            }
        }
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, Error> {
        take_failure(&self.failures, "get")?;
        self.objects
            .get(&Self::key(resource, namespace, name))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found(format!("{} {namespace}/{name}", resource.kind)))
    }

    async fn update(
        &self,
        resource: &ApiResource,
        namespace: &str,
        mut body: DynamicObject,
    ) -> Result<DynamicObject, Error> {
        take_failure(&self.failures, "update")?;
        let name = Self::object_name(&body)?;
        let mut current = self
            .objects
            .get_mut(&Self::key(resource, namespace, &name))
            .ok_or_else(|| Error::not_found(format!("{} {namespace}/{name}", resource.kind)))?;
        check_version(&current, body.metadata.resource_version.as_deref())?;

        match current.data.get("status") {
            Some(status) => {
                body.data["status"] = status.clone();
            }
            None => {
                if let Some(map) = body.data.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        body.metadata.namespace = Some(namespace.to_string());
        body.metadata.uid = current.metadata.uid.clone();
        body.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        body.metadata.resource_version = Some(self.next_version());
        *current = body;
        Ok(current.clone())
    }

    async fn update_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        status: Value,
        expected_version: Option<String>,
    ) -> Result<DynamicObject, Error> {
        take_failure(&self.failures, "update_status")?;
        let mut current = self
            .objects
            .get_mut(&Self::key(resource, namespace, name))
            .ok_or_else(|| Error::not_found(format!("{} {namespace}/{name}", resource.kind)))?;
        check_version(&current, expected_version.as_deref())?;

        current.data["status"] = status;
        current.metadata.resource_version = Some(self.next_version());
        Ok(current.clone())
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        expected_version: Option<String>,
    ) -> Result<(), Error> {
        take_failure(&self.failures, "delete")?;
        let key = Self::key(resource, namespace, name);
        match self.objects.entry(key) {
            Entry::Vacant(_) => Err(Error::not_found(format!(
                "{} {namespace}/{name}",
                resource.kind
            ))),
            Entry::Occupied(entry) => {
                check_version(entry.get(), expected_version.as_deref())?;
                entry.remove();
                Ok(())
            }
        }
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<String>,
    ) -> Result<Vec<DynamicObject>, Error> {
        take_failure(&self.failures, "list")?;
        let mut items: Vec<(ObjectKey, DynamicObject)> = self
            .objects
            .iter()
            .filter(|entry| {
                let (plural, ns, _) = entry.key();
                *plural == resource.plural && namespace.as_ref().map_or(true, |n| n == ns)
            })
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(items.into_iter().map(|(_, object)| object).collect())
    }
}

/// Secret store holding records in memory
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    records: DashMap<(String, String), SecretRecord>,
    failures: AtomicU32,
}

impl MemorySecretStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls with a backend-unavailable error
    pub fn inject_failures(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Total number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rewrite a record's creation time, e.g. to age it past the orphan grace period
    pub fn set_created_at(&self, namespace: &str, name: &str, created_at: DateTime<Utc>) {
        if let Some(mut record) = self
            .records
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            record.created_at = Some(created_at);
        }
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn put_secret(&self, mut record: SecretRecord) -> Result<SecretRecord, Error> {
        take_failure(&self.failures, "put_secret")?;
        let key = (record.namespace.clone(), record.name.clone());
        match self.records.entry(key) {
            Entry::Occupied(mut slot) => {
                record.created_at = slot.get().created_at;
                slot.insert(record.clone());
            }
            Entry::Vacant(slot) => {
                record.created_at = Some(Utc::now());
                slot.insert(record.clone());
            }
        }
        Ok(record)
    }

    async fn create_secret(&self, mut record: SecretRecord) -> Result<SecretRecord, Error> {
        take_failure(&self.failures, "create_secret")?;
        let key = (record.namespace.clone(), record.name.clone());
        match self.records.entry(key) {
            Entry::Occupied(_) => Err(Error::conflict(format!(
                "secret {}/{} already exists",
                record.namespace, record.name
            ))),
            Entry::Vacant(slot) => {
                record.created_at = Some(Utc::now());
                Ok(slot.insert(record).clone())
            }
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretRecord, Error> {
        take_failure(&self.failures, "get_secret")?;
        self.records
            .get(&(namespace.to_string(), name.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found(format!("secret {namespace}/{name}")))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        take_failure(&self.failures, "delete_secret")?;
        self.records
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("secret {namespace}/{name}")))
    }

    async fn list_secrets(&self, namespace: Option<String>) -> Result<Vec<SecretRecord>, Error> {
        take_failure(&self.failures, "list_secrets")?;
        let mut records: Vec<SecretRecord> = self
            .records
            .iter()
            .filter(|entry| namespace.as_ref().map_or(true, |n| *n == entry.key().0))
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(records)
    }
}
