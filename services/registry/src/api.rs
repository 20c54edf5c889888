//! API server builder and router

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::auth::{Access, Anonymous, Authorizer, Grant};
use crate::error::RegistryResult;
use crate::storage::{ImageStore, validate_image_id};
use crate::token::{DEFAULT_TOKEN_TTL, SessionCodec, SigningKey};

/// Shared state of the image handlers.
#[derive(Debug, Clone)]
pub(crate) struct RegistryState {
    pub(crate) store: ImageStore,
    pub(crate) sessions: SessionCodec,
    pub(crate) accel_redirect: Option<Arc<str>>,
    authorizer: Arc<dyn Authorizer>,
}

impl RegistryState {
    /// Validate `image_id` and ask the authorization gate about it.
    pub(crate) async fn authorize(
        &self,
        headers: &HeaderMap,
        image_id: &str,
        access: Access,
    ) -> RegistryResult<Grant> {
        validate_image_id(image_id)?;
        self.authorizer.authorize(headers, image_id, access).await
    }
}

/// Registry builder for configuring and creating the image registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    storage: Option<storage::Storage>,
    bucket: Option<String>,
    signing_key: Option<SigningKey>,
    token_ttl: Duration,
    accel_redirect: Option<String>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self {
            storage: None,
            bucket: None,
            signing_key: None,
            token_ttl: DEFAULT_TOKEN_TTL,
            accel_redirect: None,
            authorizer: None,
        }
    }

    /// Set the storage backend
    pub fn storage(mut self, storage: storage::Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the key signing session tokens.
    ///
    /// Every server sharing a store must use the same key, or a checksum push landing on a
    /// different server than its layer push will be refused.
    pub fn signing_key(mut self, key: impl Into<SigningKey>) -> Self {
        self.signing_key = Some(key.into());
        self
    }

    /// Set how long a client may wait between a layer push and its checksum push
    pub fn token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Delegate layer downloads to a front-end proxy with `X-Accel-Redirect`.
    ///
    /// Only storage backends that can name a local file support this; others keep streaming
    /// layers themselves.
    pub fn accel_redirect(mut self, prefix: impl Into<String>) -> Self {
        self.accel_redirect = Some(prefix.into());
        self
    }

    /// Set the authorization gate. Defaults to [`Anonymous`].
    pub fn authorizer<A>(mut self, authorizer: A) -> Self
    where
        A: Authorizer + 'static,
    {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        let storage = self.storage.expect("storage backend must be configured");
        let signing_key = self.signing_key.expect("session signing key must be configured");
        let bucket = self.bucket.unwrap_or_else(|| "registry".to_string());

        let state = RegistryState {
            store: ImageStore::new(storage, bucket),
            sessions: SessionCodec::new(&signing_key, self.token_ttl),
            accel_redirect: self
                .accel_redirect
                .map(|prefix| Arc::from(prefix.trim_end_matches('/'))),
            authorizer: self.authorizer.unwrap_or_else(|| Arc::new(Anonymous)),
        };

        tracing::debug!(driver = state.store.driver_name(), "building registry");

        Router::new()
            .route("/_ping", get(ping))
            .route("/v1/_ping", get(ping))
            .merge(crate::images::router())
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }
}

/// Liveness check
///
/// Returns 200 OK to indicate the registry is available
async fn ping() -> Json<bool> {
    Json(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let storage = storage::MemoryStorage::with_buckets(&["test"]);
        let _registry = RegistryBuilder::new()
            .storage(storage.into())
            .bucket("test")
            .signing_key("secret")
            .authorizer(crate::auth::RepositoryHeader)
            .build();
    }

    #[test]
    #[should_panic(expected = "signing key")]
    fn test_builder_requires_signing_key() {
        let storage = storage::MemoryStorage::with_buckets(&["test"]);
        let _registry = RegistryBuilder::new().storage(storage.into()).build();
    }
}
