//! Supporting types shared by the NodeTemplate and NodePool CRDs

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// Prefix of the reference token that replaces a redacted configuration value
pub const REFERENCE_TOKEN_PREFIX: &str = "secret://";

/// Logical identity of a node template: namespace plus name
///
/// Rendered as `namespace:name`, the form node pools and cloud credentials use
/// to point at namespaced objects.
#[derive(
    Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct TemplateId {
    /// Namespace the template lives in
    pub namespace: String,
    /// Template name
    pub name: String,
}

impl TemplateId {
    /// Create a new template id
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Deterministic secret record name for one of this template's fields
    ///
    /// The same template and key always map to the same record, which is what
    /// makes retried creates reuse rather than duplicate their secrets.
    pub fn secret_name(&self, key: &str) -> String {
        format!("{}:{}", self.name, key)
    }

    /// Validate that both parts are usable Kubernetes object names
    pub fn validate(&self) -> Result<(), Error> {
        validate_dns_label("namespace", &self.namespace)?;
        validate_dns_label("name", &self.name)
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

impl FromStr for TemplateId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(namespace, name))
            }
            _ => Err(Error::validation(format!(
                "invalid reference {s:?}, expected <namespace>:<name>"
            ))),
        }
    }
}

/// Check a value against the RFC 1123 label rules used for names and namespaces
pub fn validate_dns_label(what: &str, value: &str) -> Result<(), Error> {
    if value.is_empty() {
        return Err(Error::validation(format!("{what} must not be empty")));
    }
    if value.len() > 63 {
        return Err(Error::validation(format!(
            "{what} {value:?} is longer than 63 characters"
        )));
    }
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = !value.starts_with('-') && !value.ends_with('-');
    if !valid_chars || !valid_edges {
        return Err(Error::validation(format!(
            "{what} {value:?} must consist of lowercase alphanumerics and '-', and start and end with an alphanumeric"
        )));
    }
    Ok(())
}

/// How a redacted value is encoded into its secret record
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SecretEncoding {
    /// String values stored as their UTF-8 bytes
    #[default]
    Raw,
    /// Any other JSON value stored as its serialized JSON text
    Json,
}

impl SecretEncoding {
    /// Pick the encoding that round-trips the given value exactly
    pub fn for_value(value: &Value) -> Self {
        match value {
            Value::String(_) => Self::Raw,
            _ => Self::Json,
        }
    }

    /// Encode a configuration value into secret payload bytes
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, Error> {
        match (self, value) {
            (Self::Raw, Value::String(s)) => Ok(s.as_bytes().to_vec()),
            (Self::Raw, other) => Err(Error::validation(format!(
                "raw encoding requires a string value, got {other}"
            ))),
            (Self::Json, other) => Ok(serde_json::to_vec(other)?),
        }
    }

    /// Decode secret payload bytes back into the original configuration value
    pub fn decode(&self, bytes: &[u8]) -> Result<Value, Error> {
        match self {
            Self::Raw => String::from_utf8(bytes.to_vec())
                .map(Value::String)
                .map_err(|e| Error::serialization(format!("secret payload is not UTF-8: {e}"))),
            Self::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

/// Coordinate of the secret record holding one redacted field
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Namespace of the secret record
    pub namespace: String,
    /// Logical secret record name (`<template>:<key>`)
    pub name: String,
    /// Field inside the record that holds the payload
    pub field: String,
    /// Payload encoding
    #[serde(default)]
    pub encoding: SecretEncoding,
}

impl SecretReference {
    /// Reference for `key` of the given template
    pub fn for_field(id: &TemplateId, key: &str, encoding: SecretEncoding) -> Self {
        Self {
            namespace: id.namespace.clone(),
            name: id.secret_name(key),
            field: key.to_string(),
            encoding,
        }
    }

    /// Token written into the template configuration in place of the plaintext
    pub fn token(&self) -> String {
        format!("{REFERENCE_TOKEN_PREFIX}{}/{}", self.namespace, self.name)
    }

    /// Whether `value` is exactly this reference's token
    pub fn matches_token(&self, value: &Value) -> bool {
        value.as_str().is_some_and(|s| s == self.token())
    }

    /// Base64-encode a payload for storage
    pub fn encode_payload(&self, value: &Value) -> Result<String, Error> {
        Ok(STANDARD.encode(self.encoding.encode(value)?))
    }

    /// Decode a base64 payload back to the original value
    pub fn decode_payload(&self, encoded: &str) -> Result<Value, Error> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| Error::serialization(format!("secret payload is not base64: {e}")))?;
        self.encoding.decode(&bytes)
    }
}

/// Whether a configuration value looks like any secret reference token
pub fn is_reference_token(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| s.starts_with(REFERENCE_TOKEN_PREFIX))
}

/// Lifecycle phase of a node template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum TemplatePhase {
    /// Template is usable; it may have dependents
    #[default]
    Active,
    /// The owner asked for deletion but dependents still exist
    DeletionRequested,
    /// Template and its secret records are gone
    Deleted,
}

impl fmt::Display for TemplatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::DeletionRequested => write!(f, "DeletionRequested"),
            Self::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., SecretsResolved)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Same type, status, reason and message; the timestamp is ignored
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}
