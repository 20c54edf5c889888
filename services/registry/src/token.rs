//! Client-bound session carrying the digests of a layer whose checksum is not yet known.
//!
//! The layer push hands the computed [`ChecksumSet`] back to the client in a signed cookie;
//! the checksum push presents it again. Any server sharing the signing key can validate it,
//! so no session state lives in the server.

use std::fmt;
use std::time::Duration;

use axum::http::{HeaderMap, header};
use cookie::Cookie;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::checksum::ChecksumSet;
use crate::error::RegistryResult;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "registry_session";

/// Default lifetime of a session token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// Secret used to sign session tokens.
///
/// Zeroed on drop and never printed.
#[derive(Clone, Deserialize)]
#[serde(from = "String")]
pub struct SigningKey(String);

impl SigningKey {
    /// Wrap a secret.
    pub fn new(secret: impl Into<String>) -> Self {
        SigningKey(secret.into())
    }

    fn revealed(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        self.0.zeroize()
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(****)")
    }
}

impl From<String> for SigningKey {
    fn from(value: String) -> Self {
        SigningKey(value)
    }
}

impl From<&str> for SigningKey {
    fn from(value: &str) -> Self {
        SigningKey(value.to_owned())
    }
}

/// Claims of a pending-checksum session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PendingChecksums {
    /// The image the digests belong to.
    pub(crate) sub: String,
    pub(crate) checksums: ChecksumSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) repository: Option<String>,
    iat: i64,
    exp: i64,
}

/// Signs and validates session tokens.
#[derive(Clone)]
pub(crate) struct SessionCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCodec")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SessionCodec {
    pub(crate) fn new(key: &SigningKey, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(key.revealed()),
            decoding: DecodingKey::from_secret(key.revealed()),
            ttl,
        }
    }

    /// Sign the digests of `image_id`'s layer.
    pub(crate) fn issue(
        &self,
        image_id: &str,
        checksums: ChecksumSet,
        repository: Option<String>,
    ) -> RegistryResult<String> {
        let iat = chrono::Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        self.sign(&PendingChecksums {
            sub: image_id.to_string(),
            checksums,
            repository,
            iat,
            exp: iat.saturating_add(ttl),
        })
    }

    fn sign(&self, claims: &PendingChecksums) -> RegistryResult<String> {
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &self.encoding,
        )?)
    }

    /// The pending digests for `image_id`, if `token` is valid and was issued for it.
    pub(crate) fn pending(&self, token: &str, image_id: &str) -> Option<PendingChecksums> {
        let validation = Validation::new(Algorithm::HS256);
        let claims = match jsonwebtoken::decode::<PendingChecksums>(
            token,
            &self.decoding,
            &validation,
        ) {
            Ok(data) => data.claims,
            Err(err) => {
                tracing::debug!(%err, "rejected session token");
                return None;
            }
        };

        if claims.sub != image_id {
            tracing::debug!(sub = %claims.sub, %image_id, "session token issued for another image");
            return None;
        }
        Some(claims)
    }
}

/// `Set-Cookie` value carrying `token`.
pub(crate) fn session_cookie(token: &str) -> String {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .build()
        .to_string()
}

/// Every session token sent in the request's `Cookie` headers, in order.
///
/// Clients may send the cookie more than once (for example from two paths), so the
/// caller picks the first one that validates.
pub(crate) fn session_tokens(headers: &HeaderMap) -> impl Iterator<Item = String> + '_ {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| Cookie::split_parse(value))
        .filter_map(Result::ok)
        .filter(|cookie| cookie.name() == SESSION_COOKIE)
        .map(|cookie| cookie.value_trimmed().to_owned())
}
