//! Authorization gate for image endpoints.
//!
//! The registry never authenticates anyone itself. Every image endpoint asks an
//! [`Authorizer`] whether the request may proceed, and the [`Grant`] it returns may name
//! the repository the request is acting for. That repository drives the membership check
//! on metadata pushes.
//!
//! Two implementations are provided:
//! - [`Anonymous`] grants everything without a repository context
//! - [`RepositoryHeader`] trusts a repository named by a front-end in `X-Docker-Repository`

use std::fmt;

use axum::http::HeaderMap;

use crate::error::{RegistryError, RegistryResult};

/// Header a trusted front-end uses to name the repository a request acts for.
pub const REPOSITORY_HEADER: &str = "x-docker-repository";

/// What a request wants to do with an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Fetch metadata, layer or ancestry.
    Read,
    /// Push metadata, layer or checksum.
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => f.write_str("read"),
            Access::Write => f.write_str("write"),
        }
    }
}

/// A successful authorization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grant {
    /// Repository context, as `namespace/name` or a bare name.
    pub repository: Option<String>,
}

/// Decides whether a request may access an image.
#[async_trait::async_trait]
pub trait Authorizer: fmt::Debug + Send + Sync {
    /// Authorize `access` to `image_id`. Refusals should be [`RegistryError::Unauthorized`].
    async fn authorize(
        &self,
        headers: &HeaderMap,
        image_id: &str,
        access: Access,
    ) -> RegistryResult<Grant>;
}

/// Grants every request, without a repository context.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

#[async_trait::async_trait]
impl Authorizer for Anonymous {
    async fn authorize(
        &self,
        _headers: &HeaderMap,
        _image_id: &str,
        _access: Access,
    ) -> RegistryResult<Grant> {
        Ok(Grant::default())
    }
}

/// Trusts the repository named in the `X-Docker-Repository` header.
///
/// Only for deployments behind a front-end which authenticates clients and sets the
/// header itself. Requests without it are refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepositoryHeader;

#[async_trait::async_trait]
impl Authorizer for RepositoryHeader {
    async fn authorize(
        &self,
        headers: &HeaderMap,
        image_id: &str,
        access: Access,
    ) -> RegistryResult<Grant> {
        let repository = headers
            .get(REPOSITORY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                RegistryError::Unauthorized(format!("no repository context for {access} access"))
            })?;

        tracing::trace!(%image_id, %repository, %access, "authorized by repository header");
        Ok(Grant {
            repository: Some(repository.to_string()),
        })
    }
}
