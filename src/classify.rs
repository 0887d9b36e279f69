//! Sensitivity classification for provider configuration
//!
//! Sensitivity is decided by an explicit, versioned table mapping a provider
//! configuration schema (the template's `driver`) to the keys that hold secret
//! material. Nothing is inferred from key names: a key absent from the table is
//! never redacted, and an unknown schema has no sensitive keys.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

/// Version of the built-in schema table; bump whenever an entry changes
pub const SCHEMA_TABLE_VERSION: u32 = 1;

const BUILTIN_SCHEMAS: &[(&str, &[&str])] = &[
    (
        "amazonec2Config",
        &["secretKey", "sessionToken", "sshKeyContents"],
    ),
    ("azureConfig", &["clientSecret"]),
    ("digitaloceanConfig", &["accessToken", "sshKeyContents"]),
    ("exoscaleConfig", &["apiSecretKey", "sshKey"]),
    ("linodeConfig", &["token", "rootPass"]),
    (
        "openstackConfig",
        &["password", "applicationCredentialSecret", "privateKeyFile"],
    ),
    ("packetConfig", &["apiKey"]),
    ("vmwarevsphereConfig", &["password"]),
];

/// Maps provider schema names to the set of keys that must be redacted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SensitivityClassifier {
    version: u32,
    schemas: BTreeMap<String, BTreeSet<String>>,
}

impl Default for SensitivityClassifier {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SensitivityClassifier {
    /// Classifier over the built-in provider schemas
    pub fn builtin() -> Self {
        let schemas = BUILTIN_SCHEMAS
            .iter()
            .map(|(schema, keys)| {
                (
                    schema.to_string(),
                    keys.iter().map(|k| k.to_string()).collect(),
                )
            })
            .collect();
        Self {
            version: SCHEMA_TABLE_VERSION,
            schemas,
        }
    }

    /// Register (or replace) a provider schema
    pub fn with_schema<I, S>(mut self, schema: impl Into<String>, sensitive_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schemas.insert(
            schema.into(),
            sensitive_keys.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Table version this classifier was built from
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Whether `key` is sensitive under `schema`
    pub fn is_sensitive(&self, schema: &str, key: &str) -> bool {
        self.schemas
            .get(schema)
            .is_some_and(|keys| keys.contains(key))
    }

    /// Keys of `config` that must be redacted under `schema`
    ///
    /// Keys whose value is JSON `null` carry nothing to protect and are skipped.
    pub fn classify(&self, schema: &str, config: &BTreeMap<String, Value>) -> BTreeSet<String> {
        let Some(sensitive) = self.schemas.get(schema) else {
            return BTreeSet::new();
        };
        config
            .iter()
            .filter(|(key, value)| sensitive.contains(key.as_str()) && !value.is_null())
            .map(|(key, _)| key.clone())
            .collect()
    }
}
