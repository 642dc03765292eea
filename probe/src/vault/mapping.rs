use base64::Engine as _;
use jsonpath_rust::JsonPath;
use serde::Deserialize;
use serde_json::Value;

use crate::error::VaultError;
use crate::types::{OauthClientConfig, Secret};

/// Field of `OauthClientConfig` a mapping entry fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetField {
    ClientId,
    ClientSecret,
    TokenEndpoint,
    Scope,
}

impl TargetField {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetField::ClientId => "clientId",
            TargetField::ClientSecret => "clientSecret",
            TargetField::TokenEndpoint => "tokenEndpoint",
            TargetField::Scope => "scope",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Transformation {
    #[serde(rename = "base64Decode")]
    Base64Decode,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub target_field: TargetField,
    pub source_path: String,
    #[serde(default)]
    pub transformations: Vec<Transformation>,
}

/// Operator-supplied description of where each OAuth credential lives in
/// the vault's response JSON. See `credentials-mapping.yaml` in the docs.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsMapping {
    pub mappings: Vec<FieldMapping>,
}

impl CredentialsMapping {
    pub fn from_yaml(raw: &str) -> Result<Self, VaultError> {
        let mapping: Self =
            serde_yaml::from_str(raw).map_err(|e| VaultError::MappingFile(e.to_string()))?;
        for required in [
            TargetField::ClientId,
            TargetField::ClientSecret,
            TargetField::TokenEndpoint,
        ] {
            if !mapping.mappings.iter().any(|m| m.target_field == required) {
                return Err(VaultError::MappingFile(format!(
                    "mapping file does not cover required field {}",
                    required.as_str()
                )));
            }
        }
        Ok(mapping)
    }

    /// Pulls the OAuth credentials out of one vault response. Failures name
    /// the target field; the looked-up value never appears in the error.
    pub fn extract(&self, response: &Value) -> Result<OauthClientConfig, VaultError> {
        let mut client_id = None;
        let mut client_secret = None;
        let mut token_endpoint = None;
        let mut scope = None;

        for mapping in &self.mappings {
            let value = resolve(response, mapping)?;
            match mapping.target_field {
                TargetField::ClientId => client_id = value,
                TargetField::ClientSecret => client_secret = value,
                TargetField::TokenEndpoint => token_endpoint = value,
                TargetField::Scope => scope = value,
            }
        }

        let missing = |field: TargetField| VaultError::Mapping {
            field: field.as_str().to_string(),
        };
        Ok(OauthClientConfig {
            client_id: client_id.ok_or_else(|| missing(TargetField::ClientId))?,
            client_secret: Secret::new(
                client_secret.ok_or_else(|| missing(TargetField::ClientSecret))?,
            ),
            token_endpoint: token_endpoint.ok_or_else(|| missing(TargetField::TokenEndpoint))?,
            scope,
        })
    }
}

/// Resolves one mapping entry. The scope field may be absent; every other
/// unresolved path is a mapping failure.
fn resolve(response: &Value, mapping: &FieldMapping) -> Result<Option<String>, VaultError> {
    let fail = || VaultError::Mapping {
        field: mapping.target_field.as_str().to_string(),
    };

    let matches = response.query(&mapping.source_path).map_err(|_| fail())?;
    let found = matches.first().and_then(|v| v.as_str());
    let Some(raw) = found else {
        if mapping.target_field == TargetField::Scope {
            return Ok(None);
        }
        return Err(fail());
    };

    let mut value = raw.to_string();
    for transformation in &mapping.transformations {
        value = match transformation {
            Transformation::Base64Decode => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(value.as_bytes())
                    .map_err(|_| fail())?;
                String::from_utf8(decoded).map_err(|_| fail())?
            }
        };
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING_YAML: &str = r#"
mappings:
  - targetField: clientId
    sourcePath: $.data.oauth.client_id
  - targetField: clientSecret
    sourcePath: $.data.oauth.client_secret
    transformations: [ base64Decode ]
  - targetField: tokenEndpoint
    sourcePath: $.data.oauth.token_endpoint
  - targetField: scope
    sourcePath: $.data.oauth.scope
"#;

    fn response() -> Value {
        serde_json::json!({
            "data": {
                "oauth": {
                    "client_id": "svc-probe",
                    "client_secret": "aHVudGVyMg==",
                    "token_endpoint": "https://idp.local/token",
                    "scope": "kafka"
                }
            }
        })
    }

    #[test]
    fn extracts_all_fields() {
        let mapping = CredentialsMapping::from_yaml(MAPPING_YAML).expect("mapping");
        let creds = mapping.extract(&response()).expect("extract");
        assert_eq!(creds.client_id, "svc-probe");
        assert_eq!(creds.client_secret.expose(), "hunter2");
        assert_eq!(creds.token_endpoint, "https://idp.local/token");
        assert_eq!(creds.scope.as_deref(), Some("kafka"));
    }

    #[test]
    fn scope_is_optional() {
        let mapping = CredentialsMapping::from_yaml(MAPPING_YAML).expect("mapping");
        let mut response = response();
        response["data"]["oauth"]
            .as_object_mut()
            .unwrap()
            .remove("scope");
        let creds = mapping.extract(&response).expect("extract");
        assert_eq!(creds.scope, None);
    }

    #[test]
    fn missing_required_field_names_the_field_not_the_value() {
        let mapping = CredentialsMapping::from_yaml(MAPPING_YAML).expect("mapping");
        let mut response = response();
        response["data"]["oauth"]
            .as_object_mut()
            .unwrap()
            .remove("client_secret");
        let err = mapping.extract(&response).unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("clientSecret"), "got: {rendered}");
        assert!(!rendered.contains("svc-probe"));
        assert!(!rendered.contains("idp.local"));
    }

    #[test]
    fn malformed_base64_fails_the_mapping() {
        let mapping = CredentialsMapping::from_yaml(MAPPING_YAML).expect("mapping");
        let mut response = response();
        response["data"]["oauth"]["client_secret"] = Value::String("%%not-base64%%".to_string());
        let err = mapping.extract(&response).unwrap_err();
        match err {
            VaultError::Mapping { field } => assert_eq!(field, "clientSecret"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn mapping_file_must_cover_required_fields() {
        let partial = r#"
mappings:
  - targetField: clientId
    sourcePath: $.data.client_id
"#;
        let err = CredentialsMapping::from_yaml(partial).unwrap_err();
        assert!(matches!(err, VaultError::MappingFile(_)));
    }

    #[test]
    fn unparsable_yaml_is_a_mapping_file_error() {
        let err = CredentialsMapping::from_yaml("mappings: [not: [valid").unwrap_err();
        assert!(matches!(err, VaultError::MappingFile(_)));
    }
}
