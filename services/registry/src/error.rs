//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The image, or the piece of it being asked for, is not in the store
    #[error("Image not found")]
    ImageNotFound(String),

    /// The image exists but its upload has not been confirmed
    #[error("Image is being uploaded, retry later")]
    Incomplete(String),

    /// The image is complete and cannot be pushed again
    #[error("Image already exists")]
    ImageExists(String),

    /// A checksum was pushed for an image that is not waiting for one
    #[error("Cannot set this image checksum")]
    ChecksumLocked(String),

    /// The image id is unusable as a storage key
    #[error("Invalid image id: {0:?}")]
    InvalidImageId(String),

    /// Metadata body is not a JSON object
    #[error("Invalid JSON")]
    InvalidJson,

    /// Metadata has no `id` field
    #[error("Missing key `id' in JSON")]
    MissingId,

    /// Metadata `id` does not name the image being pushed
    #[error("JSON data contains invalid id")]
    InvalidId,

    /// Metadata names a parent that has not been pushed
    #[error("Image depends on a non existing parent")]
    ParentNotFound(String),

    /// The repository context does not list this image
    #[error("This image does not belong to the repository")]
    NotInRepository(String),

    /// A checksum string is not `algorithm:hex`
    #[error("Invalid checksum format")]
    InvalidChecksum(String),

    /// The checksum header is absent
    #[error("Missing Image's checksum")]
    MissingChecksum,

    /// No digest set was handed to this client by a previous layer push
    #[error("Checksum not found in session")]
    NoPendingChecksum,

    /// The declared checksum matches none of the computed digests
    #[error("Checksum mismatch")]
    ChecksumMismatch(String),

    /// The authorization gate refused the request
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The request body failed mid-stream
    #[error("request body: {0}")]
    Body(#[from] axum::Error),

    /// Signing the session token failed
    #[error("session token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    /// A stored document could not be decoded or encoded
    #[error("stored document: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::ImageNotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::ImageExists(_) | RegistryError::ChecksumLocked(_) => {
                StatusCode::CONFLICT
            }
            RegistryError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RegistryError::Incomplete(_)
            | RegistryError::InvalidImageId(_)
            | RegistryError::InvalidJson
            | RegistryError::MissingId
            | RegistryError::InvalidId
            | RegistryError::ParentNotFound(_)
            | RegistryError::NotInRepository(_)
            | RegistryError::InvalidChecksum(_)
            | RegistryError::MissingChecksum
            | RegistryError::NoPendingChecksum
            | RegistryError::ChecksumMismatch(_)
            | RegistryError::Body(_) => StatusCode::BAD_REQUEST,
            RegistryError::Token(_)
            | RegistryError::Encoding(_)
            | RegistryError::Storage(_)
            | RegistryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error body understood by v1 clients
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = ErrorResponse {
            error: self.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_is_not_a_404() {
        let err = RegistryError::Incomplete("abc".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_ne!(
            err.status_code(),
            RegistryError::ImageNotFound("abc".into()).status_code()
        );
    }

    #[test]
    fn conflicts_are_409() {
        assert_eq!(
            RegistryError::ImageExists("abc".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            RegistryError::ChecksumLocked("abc".into()).status_code(),
            StatusCode::CONFLICT
        );
    }
}
