//! Shared handle carrying the capability implementations
//!
//! Every engine, guard and controller call takes a [`Context`] explicitly;
//! there is no process-wide client.

use std::sync::Arc;

use dashmap::DashMap;
use kube::Client;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::classify::SensitivityClassifier;
use crate::config::Config;
use crate::crd::TemplateId;
use crate::store::kube::{KubeResourceStore, KubeSecretStore};
use crate::store::memory::{MemoryResourceStore, MemorySecretStore};
use crate::store::{ResourceStore, SecretStore};
use crate::Error;

/// Capabilities and settings shared across requests and reconciles
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder()
///     .client(client)
///     .config(Config::default())
///     .build()?;
/// ```
pub struct Context {
    /// Custom resource store (trait object for testability)
    pub resources: Arc<dyn ResourceStore>,
    /// Secret record store (trait object for testability)
    pub secrets: Arc<dyn SecretStore>,
    /// Sensitivity table used for redaction
    pub classifier: SensitivityClassifier,
    /// Runtime configuration
    pub config: Config,
    template_locks: DashMap<TemplateId, Arc<Mutex<()>>>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Context backed by the API server behind `client`
    pub fn new(client: Client, config: Config) -> Self {
        let secrets = KubeSecretStore::new(
            client.clone(),
            config.field_manager.clone(),
            config.managed_by.clone(),
        );
        Self {
            resources: Arc::new(KubeResourceStore::new(client)),
            secrets: Arc::new(secrets),
            classifier: SensitivityClassifier::default(),
            config,
            template_locks: DashMap::new(),
        }
    }

    /// Context backed by fresh in-memory stores
    pub fn in_memory() -> Self {
        Self {
            resources: Arc::new(MemoryResourceStore::new()),
            secrets: Arc::new(MemorySecretStore::new()),
            classifier: SensitivityClassifier::default(),
            config: Config::default(),
            template_locks: DashMap::new(),
        }
    }

    /// Serialize secret and template writes for one template within this process
    ///
    /// Secret names are deterministic, so two writers of the same template
    /// would otherwise overwrite each other's records before either persists.
    pub(crate) async fn lock_template(&self, id: &TemplateId) -> OwnedMutexGuard<()> {
        let lock = self
            .template_locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

/// Builder for [`Context`]
///
/// Explicit stores take precedence over the client; a client fills in
/// whichever store was not provided.
#[derive(Default)]
pub struct ContextBuilder {
    client: Option<Client>,
    resources: Option<Arc<dyn ResourceStore>>,
    secrets: Option<Arc<dyn SecretStore>>,
    classifier: Option<SensitivityClassifier>,
    config: Option<Config>,
}

impl ContextBuilder {
    /// Use the API server behind `client` for any store not set explicitly
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Override the resource store
    pub fn resource_store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.resources = Some(store);
        self
    }

    /// Override the secret store
    pub fn secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(store);
        self
    }

    /// Override the sensitivity table
    pub fn classifier(mut self, classifier: SensitivityClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Override the runtime configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the Context
    ///
    /// Fails when a store is neither set nor derivable from a client.
    pub fn build(self) -> Result<Context, Error> {
        let config = self.config.unwrap_or_default();

        let resources: Arc<dyn ResourceStore> = match (self.resources, &self.client) {
            (Some(store), _) => store,
            (None, Some(client)) => Arc::new(KubeResourceStore::new(client.clone())),
            (None, None) => {
                return Err(Error::validation(
                    "context needs a resource store or a kube client",
                ))
            }
        };
        let secrets: Arc<dyn SecretStore> = match (self.secrets, self.client) {
            (Some(store), _) => store,
            (None, Some(client)) => Arc::new(KubeSecretStore::new(
                client,
                config.field_manager.clone(),
                config.managed_by.clone(),
            )),
            (None, None) => {
                return Err(Error::validation(
                    "context needs a secret store or a kube client",
                ))
            }
        };

        Ok(Context {
            resources,
            secrets,
            classifier: self.classifier.unwrap_or_default(),
            config,
            template_locks: DashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn builder_requires_stores_or_client() {
        let result = Context::builder().build();
        assert!(matches!(result, Err(Error::Validation(_))));

        let only_resources = Context::builder()
            .resource_store(Arc::new(MemoryResourceStore::new()))
            .build();
        assert!(only_resources.is_err());
    }

    #[test]
    fn builder_accepts_explicit_stores() {
        let ctx = Context::builder()
            .resource_store(Arc::new(MemoryResourceStore::new()))
            .secret_store(Arc::new(MemorySecretStore::new()))
            .classifier(SensitivityClassifier::builtin().with_schema("harvesterConfig", ["kubeconfigContent"]))
            .config(Config::default().orphan_grace_period(Duration::ZERO))
            .build()
            .unwrap();
        assert!(ctx.classifier.is_sensitive("harvesterConfig", "kubeconfigContent"));
        assert_eq!(ctx.config.orphan_grace_period, Duration::ZERO);
    }

    #[tokio::test]
    async fn template_writes_are_serialized_per_template() {
        let ctx = Context::in_memory();
        let id = TemplateId::new("default", "nt-1");

        let held = ctx.lock_template(&id).await;
        let other = ctx.lock_template(&TemplateId::new("default", "nt-2")).await;
        drop(other);

        let waiting = tokio::time::timeout(Duration::from_millis(20), ctx.lock_template(&id)).await;
        assert!(waiting.is_err());

        drop(held);
        let _reacquired = ctx.lock_template(&id).await;
    }
}
