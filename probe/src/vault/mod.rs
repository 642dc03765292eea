use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::Value;
use url::Url;

use crate::config::{VaultAuth, VaultConfig};
use crate::error::VaultError;
use crate::types::{Secret, TopicDirective};

pub mod broker;
pub mod mapping;

pub use broker::CredentialBroker;
pub use mapping::CredentialsMapping;

/// The vault adapter. One fetch per topic directive; the response is opaque
/// JSON whose shape only the operator's mapping file understands.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VaultClient: Send + Sync {
    async fn fetch(&self, directive: &TopicDirective) -> Result<Value, VaultError>;
}

/// POSTs to the configured vault endpoint. Non-static auth modes rely on
/// platform-injected identity (instance role, workload identity, sidecar
/// token exchange) and attach nothing themselves.
pub struct HttpVaultClient {
    http: reqwest::Client,
    endpoint: Url,
    auth: VaultAuth,
    token: Option<Secret>,
}

impl HttpVaultClient {
    pub fn new(config: &VaultConfig) -> anyhow::Result<Self> {
        let endpoint = Url::parse(&config.vault_endpoint)?;
        let auth = config.auth().map_err(anyhow::Error::msg)?;
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
            auth,
            token: config.vault_token.clone().map(Secret::new),
        })
    }

    fn headers(&self) -> Result<HeaderMap, VaultError> {
        let mut headers = HeaderMap::new();
        if self.auth == VaultAuth::Static {
            let token = self.token.as_ref().ok_or_else(|| {
                VaultError::Config("static vault auth configured without a token".to_string())
            })?;
            let value = token.expose().parse().map_err(|_| {
                VaultError::Config("vault token is not a valid header value".to_string())
            })?;
            headers.insert("X-Vault-Token", value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl VaultClient for HttpVaultClient {
    async fn fetch(&self, directive: &TopicDirective) -> Result<Value, VaultError> {
        let body = serde_json::json!({
            "principal": directive.client_principal,
            "topic": directive.topic,
        });
        let response = self
            .http
            .post(self.endpoint.clone())
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| VaultError::Transport {
                topic: directive.topic.clone(),
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(VaultError::Http {
                topic: directive.topic.clone(),
                status: status.as_u16(),
            });
        }
        response.json().await.map_err(|e| VaultError::Transport {
            topic: directive.topic.clone(),
            detail: format!("response is not JSON: {e}"),
        })
    }
}
