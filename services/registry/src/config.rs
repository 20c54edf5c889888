//! Server configuration, as read from a TOML file.
//!
//! ```toml
//! bind = "0.0.0.0:5000"
//! bucket = "registry"
//! secret_key = "change me"
//! accel_redirect = "/registry"
//!
//! [storage.local]
//! path = "/var/lib/registry"
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;
use storage::{StorageConfig, StorageError};

use crate::api::RegistryBuilder;
use crate::auth::RepositoryHeader;
use crate::token::{DEFAULT_TOKEN_TTL, SigningKey};

fn default_bind() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 5000))
}

fn default_bucket() -> String {
    "registry".into()
}

fn default_token_ttl() -> u64 {
    DEFAULT_TOKEN_TTL.as_secs()
}

/// Configuration of a registry server.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Address to listen on.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Bucket holding images and repository lists.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Storage backend.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Key signing session tokens. Shared by every server using the same storage.
    pub secret_key: SigningKey,

    /// Prefix of the front-end location serving layers via `X-Accel-Redirect`.
    #[serde(default)]
    pub accel_redirect: Option<String>,

    /// Seconds a client may take between a layer push and its checksum push.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Take the repository context from `X-Docker-Repository`, set by a trusted front-end.
    #[serde(default)]
    pub trust_repository_header: bool,
}

impl RegistryConfig {
    /// Build the storage backend and a registry builder configured from this file.
    pub async fn builder(self) -> Result<RegistryBuilder, StorageError> {
        let storage = self.storage.build().await?;

        let mut builder = RegistryBuilder::new()
            .storage(storage)
            .bucket(self.bucket)
            .signing_key(self.secret_key)
            .token_ttl(Duration::from_secs(self.token_ttl_secs));

        if let Some(prefix) = self.accel_redirect {
            builder = builder.accel_redirect(prefix);
        }

        if self.trust_repository_header {
            builder = builder.authorizer(RepositoryHeader);
        }

        Ok(builder)
    }
}
