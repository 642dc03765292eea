use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::Context;
use envconfig::Envconfig;

use crate::types::SecurityProtocol;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3010")]
    pub address: SocketAddr,

    pub schema_registry_url: String,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub vault: VaultConfig,

    #[envconfig(nested = true)]
    pub storage: StorageConfig,

    #[envconfig(default = "32")]
    pub queue_capacity: usize, // Concurrently registered tests before Submit is rejected

    #[envconfig(default = "1800000")]
    pub poison_pill_ms: u64, // Hard per-test deadline, armed at Setup and Completed entry

    #[envconfig(default = "5000")]
    pub exception_cleanup_ms: u64, // Grace period before a failed test is torn down

    #[envconfig(default = "8")]
    pub io_blocking_pool_size: usize, // Sized onto the runtime's blocking thread pool

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    pub kafka_hosts: String,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "PLAINTEXT")]
    pub kafka_security_protocol: String, // PLAINTEXT for local clusters, SASL_SSL everywhere else
}

impl KafkaConfig {
    pub fn security_protocol(&self) -> Result<SecurityProtocol, String> {
        self.kafka_security_protocol.parse()
    }
}

#[derive(Envconfig, Clone)]
pub struct VaultConfig {
    pub vault_endpoint: String,

    #[envconfig(default = "static")]
    pub vault_auth: String, // iam-role, managed-identity, service-account or static

    pub vault_token: Option<String>, // only read when vault_auth = static

    pub vault_mapping_path: String, // credentials-mapping.yaml location
}

impl VaultConfig {
    pub fn auth(&self) -> Result<VaultAuth, String> {
        self.vault_auth.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultAuth {
    /// Credentials come from the instance's IAM role; no header is attached.
    IamRole,
    /// Platform-managed workload identity; no header is attached.
    ManagedIdentity,
    /// Kubernetes service-account token exchange handled by a sidecar.
    ServiceAccount,
    /// A fixed token from configuration, sent as `X-Vault-Token`.
    Static,
}

impl FromStr for VaultAuth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "iam-role" => Ok(VaultAuth::IamRole),
            "managed-identity" => Ok(VaultAuth::ManagedIdentity),
            "service-account" => Ok(VaultAuth::ServiceAccount),
            "static" => Ok(VaultAuth::Static),
            _ => Err(format!(
                "unknown vault auth mode: {s}, must be iam-role, managed-identity, service-account or static"
            )),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct StorageConfig {
    pub storage_bucket: String,

    #[envconfig(default = "us-east-1")]
    pub storage_region: String,

    pub storage_endpoint: Option<String>, // set for minio/localstack style deployments
}

impl Config {
    /// Semantic checks beyond what envconfig enforces. Run once at boot;
    /// a failure here is fatal.
    pub fn validate(&self) -> anyhow::Result<()> {
        url::Url::parse(&self.schema_registry_url)
            .with_context(|| format!("invalid schema registry url: {}", self.schema_registry_url))?;
        url::Url::parse(&self.vault.vault_endpoint)
            .with_context(|| format!("invalid vault endpoint: {}", self.vault.vault_endpoint))?;

        let auth = self.vault.auth().map_err(anyhow::Error::msg)?;
        if auth == VaultAuth::Static && self.vault.vault_token.is_none() {
            anyhow::bail!("vault auth is static but no VAULT_TOKEN is configured");
        }
        self.kafka.security_protocol().map_err(anyhow::Error::msg)?;

        if self.queue_capacity == 0 {
            anyhow::bail!("QUEUE_CAPACITY must be at least 1");
        }
        if self.poison_pill_ms == 0 {
            anyhow::bail!("POISON_PILL_MS must be positive");
        }
        if self.io_blocking_pool_size == 0 {
            anyhow::bail!("IO_BLOCKING_POOL_SIZE must be at least 1");
        }
        Ok(())
    }
}
