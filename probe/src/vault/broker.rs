use std::sync::Arc;

use tracing::info;

use crate::error::VaultError;
use crate::types::{
    KafkaSecurityDirective, OauthClientConfig, Secret, SecurityProtocol, TopicDirective,
};
use crate::vault::{CredentialsMapping, VaultClient};

/// Login module named in the rendered JAAS line. Kafka's Java tooling is
/// what ultimately interprets it; librdkafka clients consume the structured
/// fields instead.
pub const OAUTH_LOGIN_MODULE: &str =
    "org.apache.kafka.common.security.oauthbearer.OAuthBearerLoginModule";

/// Turns topic directives into per-topic security directives by fetching
/// and mapping vault credentials. Credentials live only inside the returned
/// directives; nothing is cached or persisted here.
pub struct CredentialBroker {
    client: Arc<dyn VaultClient>,
    mapping: CredentialsMapping,
    protocol: SecurityProtocol,
}

impl CredentialBroker {
    pub fn new(
        client: Arc<dyn VaultClient>,
        mapping: CredentialsMapping,
        protocol: SecurityProtocol,
    ) -> Self {
        Self {
            client,
            mapping,
            protocol,
        }
    }

    /// One vault round-trip per directive, in directive order. Any failure
    /// aborts the whole batch; partial credential sets are useless to the
    /// streaming pools.
    pub async fn issue(
        &self,
        directives: &[TopicDirective],
    ) -> Result<Vec<KafkaSecurityDirective>, VaultError> {
        if self.protocol == SecurityProtocol::Plaintext {
            info!("plaintext cluster, vault brokering bypassed");
            return Ok(directives
                .iter()
                .map(|d| KafkaSecurityDirective::plaintext(d.topic.clone(), d.role))
                .collect());
        }

        let mut issued = Vec::with_capacity(directives.len());
        for directive in directives {
            let response = self.client.fetch(directive).await?;
            let credentials = self.mapping.extract(&response)?;
            info!(topic = %directive.topic, "issued oauth credentials");
            issued.push(KafkaSecurityDirective {
                topic: directive.topic.clone(),
                role: directive.role,
                protocol: SecurityProtocol::SaslSsl,
                jaas_config: render_jaas(&credentials),
                oauth: Some(credentials),
            });
        }
        Ok(issued)
    }
}

/// The canonical OAUTHBEARER login-module line:
/// `<module> required oauth.client.id="..." oauth.client.secret="..."
/// oauth.token.endpoint.uri="..." [oauth.scope="..."];`
fn render_jaas(credentials: &OauthClientConfig) -> Secret {
    let mut jaas = format!(
        "{OAUTH_LOGIN_MODULE} required oauth.client.id=\"{}\" oauth.client.secret=\"{}\" oauth.token.endpoint.uri=\"{}\"",
        credentials.client_id,
        credentials.client_secret.expose(),
        credentials.token_endpoint,
    );
    if let Some(scope) = &credentials.scope {
        jaas.push_str(&format!(" oauth.scope=\"{scope}\""));
    }
    jaas.push(';');
    Secret::new(jaas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TopicRole;
    use crate::vault::MockVaultClient;

    const MAPPING_YAML: &str = r#"
mappings:
  - targetField: clientId
    sourcePath: $.client_id
  - targetField: clientSecret
    sourcePath: $.client_secret
  - targetField: tokenEndpoint
    sourcePath: $.token_endpoint
  - targetField: scope
    sourcePath: $.scope
"#;

    fn directives() -> Vec<TopicDirective> {
        vec![
            TopicDirective {
                topic: "orders".to_string(),
                role: TopicRole::Producer,
                client_principal: "svc-probe".to_string(),
                event_filters: vec![],
            },
            TopicDirective {
                topic: "shipments".to_string(),
                role: TopicRole::Consumer,
                client_principal: "svc-probe".to_string(),
                event_filters: vec![],
            },
        ]
    }

    fn mapping() -> CredentialsMapping {
        CredentialsMapping::from_yaml(MAPPING_YAML).expect("mapping")
    }

    #[tokio::test]
    async fn issues_one_directive_per_topic() {
        let mut client = MockVaultClient::new();
        client.expect_fetch().times(2).returning(|directive| {
            Ok(serde_json::json!({
                "client_id": format!("id-{}", directive.topic),
                "client_secret": "s3cr3t",
                "token_endpoint": "https://idp.local/token",
                "scope": "kafka",
            }))
        });

        let broker =
            CredentialBroker::new(Arc::new(client), mapping(), SecurityProtocol::SaslSsl);
        let issued = broker.issue(&directives()).await.expect("issue");

        assert_eq!(issued.len(), 2);
        assert_eq!(issued[0].topic, "orders");
        assert_eq!(issued[0].protocol, SecurityProtocol::SaslSsl);
        let oauth = issued[0].oauth.as_ref().expect("oauth");
        assert_eq!(oauth.client_id, "id-orders");
        assert_eq!(
            issued[0].jaas_config.expose(),
            format!(
                "{OAUTH_LOGIN_MODULE} required oauth.client.id=\"id-orders\" \
                 oauth.client.secret=\"s3cr3t\" \
                 oauth.token.endpoint.uri=\"https://idp.local/token\" oauth.scope=\"kafka\";"
            )
        );
    }

    #[tokio::test]
    async fn jaas_omits_scope_when_absent() {
        let mut client = MockVaultClient::new();
        client.expect_fetch().returning(|_| {
            Ok(serde_json::json!({
                "client_id": "id",
                "client_secret": "s",
                "token_endpoint": "https://idp.local/token",
            }))
        });
        let broker =
            CredentialBroker::new(Arc::new(client), mapping(), SecurityProtocol::SaslSsl);
        let issued = broker.issue(&directives()[..1]).await.expect("issue");
        assert!(issued[0].jaas_config.expose().ends_with("token\";"));
        assert!(!issued[0].jaas_config.expose().contains("oauth.scope"));
    }

    #[tokio::test]
    async fn plaintext_bypasses_the_vault() {
        let mut client = MockVaultClient::new();
        client.expect_fetch().never();
        let broker =
            CredentialBroker::new(Arc::new(client), mapping(), SecurityProtocol::Plaintext);
        let issued = broker.issue(&directives()).await.expect("issue");
        assert_eq!(issued.len(), 2);
        assert_eq!(issued[0].protocol, SecurityProtocol::Plaintext);
        assert_eq!(issued[0].jaas_config.expose(), "");
        assert!(issued[0].oauth.is_none());
    }

    #[tokio::test]
    async fn vault_failure_aborts_the_batch() {
        let mut client = MockVaultClient::new();
        client.expect_fetch().times(1).returning(|directive| {
            Err(VaultError::Http {
                topic: directive.topic.clone(),
                status: 500,
            })
        });
        let broker =
            CredentialBroker::new(Arc::new(client), mapping(), SecurityProtocol::SaslSsl);
        let err = broker.issue(&directives()).await.unwrap_err();
        assert!(matches!(err, VaultError::Http { status: 500, .. }));
    }
}
