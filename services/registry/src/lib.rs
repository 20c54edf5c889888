//! # Docker Image Registry
//!
//! This crate implements the image endpoints of the v1 docker registry protocol: pushing
//! and pulling image metadata, layers and ancestry.
//!
//! Pushes span several requests, and any of them may fail or be retried. Images only
//! become visible once their layer checksum is verified, so a reader sees either a
//! complete image or none at all. The only shared state is the storage backend.
//!
//! ## Features
//!
//! - Streaming layer uploads, digested as they are stored (`sha256` and `tarsum`)
//! - Checksums declared before or after the layer push
//! - Materialized ancestry chains
//! - Far-future cache headers and `X-Accel-Redirect` delegation for layers
//! - Pluggable storage backend via the `storage` crate
//! - Pluggable authorization via [`Authorizer`]
//!
//! ## Example
//!
//! ```no_run
//! use image_registry::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let registry = RegistryBuilder::new()
//!     .storage(storage.into())
//!     .bucket("registry")
//!     .signing_key("change me")
//!     .build();
//!
//! // Use the registry service with axum or any tower-compatible server
//! # Ok(())
//! # }
//! ```

mod ancestry;
mod api;
mod auth;
mod cache;
mod checksum;
mod config;
mod error;
mod images;
mod mark;
mod storage;
mod tarsum;
mod token;

pub use api::RegistryBuilder;
pub use auth::{Access, Anonymous, Authorizer, Grant, REPOSITORY_HEADER, RepositoryHeader};
pub use checksum::{Checksum, ChecksumSet};
pub use config::RegistryConfig;
pub use error::{RegistryError, RegistryResult};
pub use images::{X_ACCEL_REDIRECT, X_DOCKER_CHECKSUM, X_DOCKER_SIZE};
pub use token::{DEFAULT_TOKEN_TTL, SESSION_COOKIE, SigningKey};
