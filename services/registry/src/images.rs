//! Image endpoints: metadata, layer, checksum and ancestry.
//!
//! A push is three requests, in order: metadata (`PUT json`), layer (`PUT layer`) and, when
//! the metadata push didn't declare a checksum, checksum (`PUT checksum`). The metadata push
//! sets the upload marker; only a verified checksum clears it. Until then every read
//! endpoint answers [`RegistryError::Incomplete`].

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_TYPE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, put};
use bytes::Bytes;
use serde_json::Value;
use tokio::io::BufReader;
use tokio_util::io::ReaderStream;

use crate::ancestry;
use crate::api::RegistryState;
use crate::auth::Access;
use crate::cache;
use crate::checksum::{Checksum, LayerDigester};
use crate::error::{RegistryError, RegistryResult};
use crate::storage::{ImageStore, validate_image_id};
use crate::token::{session_cookie, session_tokens};

/// Checksum declared by the client, `algorithm:hex`.
pub const X_DOCKER_CHECKSUM: HeaderName = HeaderName::from_static("x-docker-checksum");

/// Size of the stored layer, on metadata responses.
pub const X_DOCKER_SIZE: HeaderName = HeaderName::from_static("x-docker-size");

/// Path a front-end proxy should serve instead of the response body.
pub const X_ACCEL_REDIRECT: HeaderName = HeaderName::from_static("x-accel-redirect");

const OCTET_STREAM: &str = "application/octet-stream";
const APPLICATION_JSON: &str = "application/json";

/// Capacity of the pipe between the request body and the storage upload.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Router for image operations
pub(crate) fn router() -> Router<RegistryState> {
    Router::new()
        .route(
            "/v1/images/{image_id}/layer",
            get(get_image_layer).put(put_image_layer),
        )
        .route(
            "/v1/images/{image_id}/json",
            get(get_image_json).put(put_image_json),
        )
        .route("/v1/images/{image_id}/checksum", put(put_image_checksum))
        .route("/v1/images/{image_id}/ancestry", get(get_image_ancestry))
}

/// Gate shared by the read endpoints: authorization, then completion, then the
/// conditional cache. Returns the response to send early, if any.
async fn check_readable(
    state: &RegistryState,
    headers: &HeaderMap,
    image_id: &str,
) -> RegistryResult<Option<Response>> {
    state.authorize(headers, image_id, Access::Read).await?;
    state.store.mark(image_id).require_completion().await?;
    Ok(cache::not_modified(headers))
}

/// The checksum header, when present and non-empty.
fn declared_checksum(headers: &HeaderMap) -> Option<&HeaderValue> {
    headers
        .get(&X_DOCKER_CHECKSUM)
        .filter(|value| !value.as_bytes().is_empty())
}

fn parse_checksum(value: &HeaderValue) -> RegistryResult<Checksum> {
    value
        .to_str()
        .map_err(|_| {
            RegistryError::InvalidChecksum(String::from_utf8_lossy(value.as_bytes()).into_owned())
        })?
        .parse()
}

/// Stream a layer, or hand it off to a front-end proxy
#[tracing::instrument(skip(state, headers))]
async fn get_image_layer(
    State(state): State<RegistryState>,
    Path(image_id): Path<String>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    if let Some(response) = check_readable(&state, &headers, &image_id).await? {
        return Ok(response);
    }

    let path = ImageStore::image_layer_path(&image_id);

    if let Some(prefix) = state.accel_redirect.as_deref() {
        match state.store.direct_path(&path) {
            Some(direct) => {
                if !state.store.exists(&path).await? {
                    return Err(RegistryError::ImageNotFound(image_id));
                }

                let uri = format!("{prefix}/{direct}");
                tracing::debug!(%uri, "send accelerated");
                return Ok((
                    cache::cache_headers(),
                    [(X_ACCEL_REDIRECT, uri)],
                    Body::empty(),
                )
                    .into_response());
            }
            None => {
                tracing::warn!(
                    driver = state.store.driver_name(),
                    "accel_redirect is configured, but storage cannot serve files directly"
                );
            }
        }
    }

    let reader = state.store.open(&image_id, &path).await?;
    Ok((
        cache::cache_headers(),
        [(CONTENT_TYPE, OCTET_STREAM)],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}

/// Receive a layer, digesting it on the way into storage
#[tracing::instrument(skip(state, headers, body))]
async fn put_image_layer(
    State(state): State<RegistryState>,
    Path(image_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    let grant = state.authorize(&headers, &image_id, Access::Write).await?;

    let json = state
        .store
        .get_content(&ImageStore::image_json_path(&image_id))
        .await?
        .ok_or_else(|| RegistryError::ImageNotFound(image_id.clone()))?;

    let layer_path = ImageStore::image_layer_path(&image_id);
    let mark = state.store.mark(&image_id);
    mark.check_collision(&layer_path).await?;

    let mut digester = LayerDigester::new(&json);
    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let mut reader = BufReader::new(reader);
    let (size, ()) = futures::try_join!(
        digester.relay(body.into_data_stream(), writer),
        state.store.write_stream(&layer_path, &mut reader),
    )?;
    let checksums = digester.finish().await;
    tracing::debug!(size, ?checksums, "layer stored");

    let Some(stored) = state
        .store
        .get_content(&ImageStore::image_checksum_path(&image_id))
        .await?
    else {
        // No checksum yet: the image stays marked until the checksum push.
        let token = state
            .sessions
            .issue(&image_id, checksums, grant.repository)?;
        return Ok(([(SET_COOKIE, session_cookie(&token))], Json(true)).into_response());
    };

    if !checksums.contains(&String::from_utf8_lossy(&stored)) {
        tracing::debug!(%image_id, "Wrong checksum, ignoring the layer");
        return Err(RegistryError::ChecksumMismatch(image_id));
    }

    mark.complete().await?;
    Ok(Json(true).into_response())
}

/// Confirm a layer pushed without a known checksum
#[tracing::instrument(skip(state, headers))]
async fn put_image_checksum(
    State(state): State<RegistryState>,
    Path(image_id): Path<String>,
    headers: HeaderMap,
) -> RegistryResult<Json<bool>> {
    let grant = state.authorize(&headers, &image_id, Access::Write).await?;

    let declared = declared_checksum(&headers).ok_or(RegistryError::MissingChecksum)?;

    let pending = session_tokens(&headers)
        .filter_map(|token| state.sessions.pending(&token, &image_id))
        .find(|pending| match (&grant.repository, &pending.repository) {
            (Some(granted), Some(issued)) => granted == issued,
            _ => true,
        })
        .ok_or(RegistryError::NoPendingChecksum)?;

    if !state
        .store
        .exists(&ImageStore::image_json_path(&image_id))
        .await?
    {
        return Err(RegistryError::ImageNotFound(image_id));
    }

    let mark = state.store.mark(&image_id);
    if !mark.is_present().await? {
        return Err(RegistryError::ChecksumLocked(image_id));
    }

    let checksum = parse_checksum(declared)?;
    state
        .store
        .put_content(
            &ImageStore::image_checksum_path(&image_id),
            checksum.as_str().as_bytes(),
        )
        .await?;

    if !pending.checksums.contains(checksum.as_str()) {
        tracing::debug!(%image_id, %checksum, "Wrong checksum");
        return Err(RegistryError::ChecksumMismatch(image_id));
    }

    mark.complete().await?;
    Ok(Json(true))
}

/// Fetch the metadata document, verbatim
#[tracing::instrument(skip(state, headers))]
async fn get_image_json(
    State(state): State<RegistryState>,
    Path(image_id): Path<String>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    if let Some(response) = check_readable(&state, &headers, &image_id).await? {
        return Ok(response);
    }

    let data = state
        .store
        .get_content(&ImageStore::image_json_path(&image_id))
        .await?
        .ok_or_else(|| RegistryError::ImageNotFound(image_id.clone()))?;

    let mut response_headers = cache::cache_headers();
    response_headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));

    match state
        .store
        .size(&ImageStore::image_layer_path(&image_id))
        .await
    {
        Ok(Some(size)) => {
            response_headers.insert(X_DOCKER_SIZE, HeaderValue::from(size));
        }
        Ok(None) => {}
        Err(err) => tracing::debug!(%image_id, %err, "layer size unavailable"),
    }

    if let Some(checksum) = state
        .store
        .get_content(&ImageStore::image_checksum_path(&image_id))
        .await?
    {
        match HeaderValue::from_bytes(&checksum) {
            Ok(value) => {
                response_headers.insert(X_DOCKER_CHECKSUM, value);
            }
            Err(_) => tracing::warn!(%image_id, "stored checksum is not a valid header value"),
        }
    }

    Ok((response_headers, Bytes::from(data)).into_response())
}

/// Store the metadata document and start an upload
#[tracing::instrument(skip(state, headers, body))]
async fn put_image_json(
    State(state): State<RegistryState>,
    Path(image_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Json<bool>> {
    let grant = state.authorize(&headers, &image_id, Access::Write).await?;

    let data: Value = serde_json::from_slice(&body).map_err(|_| RegistryError::InvalidJson)?;
    let metadata = data
        .as_object()
        .filter(|metadata| !metadata.is_empty())
        .ok_or(RegistryError::InvalidJson)?;

    let id = metadata.get("id").ok_or(RegistryError::MissingId)?;
    let checksum = declared_checksum(&headers).map(parse_checksum).transpose()?;

    if id.as_str() != Some(image_id.as_str()) {
        return Err(RegistryError::InvalidId);
    }

    if !ancestry::check_images_list(&state.store, &image_id, grant.repository.as_deref()).await? {
        return Err(RegistryError::NotInRepository(image_id));
    }

    let parent = match metadata.get("parent") {
        None | Some(Value::Null) => None,
        Some(Value::String(parent)) if parent.is_empty() => None,
        Some(Value::String(parent)) => Some(parent.as_str()),
        Some(_) => return Err(RegistryError::InvalidJson),
    };

    if let Some(parent) = parent {
        validate_image_id(parent)?;
        if !state
            .store
            .exists(&ImageStore::image_json_path(parent))
            .await?
        {
            return Err(RegistryError::ParentNotFound(parent.to_string()));
        }
    }

    let mark = state.store.mark(&image_id);
    let json_path = ImageStore::image_json_path(&image_id);
    mark.check_collision(&json_path).await?;

    // A new push or a retry: the stored checksum is replaced, or cleared if none was sent.
    let checksum_path = ImageStore::image_checksum_path(&image_id);
    match checksum {
        Some(checksum) => {
            state
                .store
                .put_content(&checksum_path, checksum.as_str().as_bytes())
                .await?
        }
        None => state.store.remove(&checksum_path).await?,
    }

    mark.begin(&body).await?;
    let chain = ancestry::generate(&state.store, &image_id, parent).await?;
    tracing::debug!(%image_id, depth = chain.len(), "image metadata stored");

    Ok(Json(true))
}

/// Fetch the lineage, self first
#[tracing::instrument(skip(state, headers))]
async fn get_image_ancestry(
    State(state): State<RegistryState>,
    Path(image_id): Path<String>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    if let Some(response) = check_readable(&state, &headers, &image_id).await? {
        return Ok(response);
    }

    let chain = ancestry::read(&state.store, &image_id).await?;
    Ok((cache::cache_headers(), Json(chain)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_checksum() {
        let mut headers = HeaderMap::new();
        assert!(declared_checksum(&headers).is_none());

        headers.insert(X_DOCKER_CHECKSUM, HeaderValue::from_static(""));
        assert!(declared_checksum(&headers).is_none());

        headers.insert(X_DOCKER_CHECKSUM, HeaderValue::from_static("sha256:abc"));
        let checksum = parse_checksum(declared_checksum(&headers).unwrap()).unwrap();
        assert_eq!(checksum.algorithm(), "sha256");

        headers.insert(X_DOCKER_CHECKSUM, HeaderValue::from_static("sha256"));
        assert!(matches!(
            parse_checksum(declared_checksum(&headers).unwrap()),
            Err(RegistryError::InvalidChecksum(_))
        ));
    }
}
