//! Cloud credential field stripping
//!
//! A cloud credential is a secret whose keys look like
//! `<driver-prefix>credentialConfig-<field>`, e.g.
//! `amazonec2credentialConfig-accessKey`. When a template names a credential,
//! every field the credential supplies for the template's driver is dropped
//! from the template configuration: the credential is the source of truth and
//! its values must not be duplicated onto the template.

use tracing::debug;

use crate::crd::NodeTemplateSpec;
use crate::context::Context;
use crate::store::SecretRecord;
use crate::Error;

const CREDENTIAL_CONFIG_SUFFIX: &str = "credentialConfig";

/// Driver name and field list a credential supplies
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialFields {
    /// Configuration schema the credential applies to (e.g. `amazonec2Config`)
    pub driver: String,
    /// Configuration keys supplied by the credential
    pub fields: Vec<String>,
}

/// Parse a `<namespace>:<name>` credential id
pub fn parse_credential_id(raw: &str) -> Result<(String, String), Error> {
    match raw.split_once(':') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
            Ok((namespace.to_string(), name.to_string()))
        }
        _ => Err(Error::validation(format!("invalid cloud credential {raw}"))),
    }
}

/// Work out which driver and fields a credential record supplies
pub fn credential_fields(id: &str, record: &SecretRecord) -> Result<CredentialFields, Error> {
    if record.data.is_empty() {
        return Err(Error::validation(format!(
            "cloud credential {id} has no data"
        )));
    }

    let prefix = record
        .data
        .keys()
        .filter_map(|key| key.split_once('-'))
        .map(|(head, _)| head)
        .find(|head| head.ends_with(CREDENTIAL_CONFIG_SUFFIX))
        .ok_or_else(|| {
            Error::validation(format!(
                "cloud credential {id} has no {CREDENTIAL_CONFIG_SUFFIX} keys"
            ))
        })?;

    let fields = record
        .data
        .keys()
        .filter_map(|key| key.split_once('-'))
        .filter(|(head, _)| *head == prefix)
        .map(|(_, field)| field.to_string())
        .collect();

    Ok(CredentialFields {
        driver: prefix.replacen("credential", "", 1),
        fields,
    })
}

/// Remove credential-supplied fields from `spec.config`
///
/// Returns the removed keys. A credential for a different driver leaves the
/// configuration untouched.
pub async fn strip_credential_fields(
    ctx: &Context,
    spec: &mut NodeTemplateSpec,
) -> Result<Vec<String>, Error> {
    let Some(raw_id) = spec.cloud_credential_id.as_deref().filter(|id| !id.is_empty()) else {
        return Ok(Vec::new());
    };
    let (namespace, name) = parse_credential_id(raw_id)?;

    let record = match ctx.secrets.get_secret(&namespace, &name).await {
        Ok(record) => record,
        Err(e) if e.is_not_found() => {
            return Err(Error::not_found("cloud credential not found"));
        }
        Err(e) => return Err(e),
    };

    let supplied = credential_fields(raw_id, &record)?;
    if supplied.driver != spec.driver {
        debug!(
            credential = %raw_id,
            credential_driver = %supplied.driver,
            driver = %spec.driver,
            "cloud credential targets another driver, nothing to strip"
        );
        return Ok(Vec::new());
    }

    let removed: Vec<String> = supplied
        .fields
        .into_iter()
        .filter(|field| spec.config.remove(field).is_some())
        .collect();
    debug!(credential = %raw_id, fields = ?removed, "stripped cloud credential fields");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemorySecretStore;
    use crate::store::SecretStore;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn aws_credential() -> SecretRecord {
        SecretRecord::new("cattle-global-data", "cc-aws")
            .with_field("amazonec2credentialConfig-accessKey", "QUtJQQ==")
            .with_field("amazonec2credentialConfig-secretKey", "c2VjcmV0")
    }

    fn spec(driver: &str) -> NodeTemplateSpec {
        NodeTemplateSpec {
            driver: driver.to_string(),
            config: serde_json::from_value(json!({
                "accessKey": "AKIA",
                "secretKey": "secret",
                "region": "us-west-2"
            }))
            .unwrap(),
            secret_refs: BTreeMap::new(),
            cloud_credential_id: Some("cattle-global-data:cc-aws".to_string()),
            description: None,
        }
    }

    async fn context_with(records: Vec<SecretRecord>) -> Context {
        let secrets = Arc::new(MemorySecretStore::new());
        for record in records {
            secrets.put_secret(record).await.unwrap();
        }
        Context::builder()
            .resource_store(Arc::new(crate::store::memory::MemoryResourceStore::new()))
            .secret_store(secrets)
            .build()
            .unwrap()
    }

    #[test]
    fn credential_keys_name_driver_and_fields() {
        let supplied = credential_fields("cattle-global-data:cc-aws", &aws_credential()).unwrap();
        assert_eq!(supplied.driver, "amazonec2Config");
        assert_eq!(supplied.fields, vec!["accessKey", "secretKey"]);
    }

    #[test]
    fn credential_without_config_keys_is_invalid() {
        let record = SecretRecord::new("ns", "cc").with_field("token", "eA==");
        assert!(matches!(
            credential_fields("ns:cc", &record),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            credential_fields("ns:cc", &SecretRecord::new("ns", "cc")),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn malformed_credential_ids_are_rejected() {
        assert!(parse_credential_id("cc-aws").is_err());
        assert!(parse_credential_id(":cc-aws").is_err());
        assert_eq!(
            parse_credential_id("cattle-global-data:cc-aws").unwrap(),
            ("cattle-global-data".to_string(), "cc-aws".to_string())
        );
    }

    #[tokio::test]
    async fn matching_driver_fields_are_removed() {
        let ctx = context_with(vec![aws_credential()]).await;
        let mut spec = spec("amazonec2Config");

        let removed = strip_credential_fields(&ctx, &mut spec).await.unwrap();
        assert_eq!(removed, vec!["accessKey", "secretKey"]);
        assert_eq!(spec.config.keys().collect::<Vec<_>>(), vec!["region"]);
    }

    #[tokio::test]
    async fn other_driver_is_left_alone() {
        let ctx = context_with(vec![aws_credential()]).await;
        let mut spec = spec("azureConfig");

        assert!(strip_credential_fields(&ctx, &mut spec).await.unwrap().is_empty());
        assert_eq!(spec.config.len(), 3);
    }

    #[tokio::test]
    async fn missing_credential_is_not_found() {
        let ctx = context_with(vec![]).await;
        let mut spec = spec("amazonec2Config");

        let err = strip_credential_fields(&ctx, &mut spec).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("cloud credential not found"));
    }

    #[tokio::test]
    async fn no_credential_means_no_lookup() {
        let ctx = context_with(vec![]).await;
        let mut spec = spec("amazonec2Config");
        spec.cloud_credential_id = None;

        assert!(strip_credential_fields(&ctx, &mut spec).await.unwrap().is_empty());
    }
}
