//! Storage layer for the registry

use camino::{Utf8Path, Utf8PathBuf};
use storage::{BoxReader, StorageBucket};
use tokio::io::{AsyncBufRead, AsyncReadExt};

use crate::error::{RegistryError, RegistryResult};
use crate::mark::UploadMark;

/// Namespace used for repositories named without one, e.g. `ubuntu`.
const DEFAULT_NAMESPACE: &str = "library";

/// Image storage, laid out as one directory of keys per image.
///
/// Nothing is cached between calls: every read goes to the backend, so several server
/// processes may share one store.
#[derive(Clone, Debug)]
pub(crate) struct ImageStore {
    bucket: StorageBucket,
}

impl ImageStore {
    /// Create a new image store in `bucket`.
    pub(crate) fn new(storage: storage::Storage, bucket: impl Into<String>) -> Self {
        Self {
            bucket: storage.bucket(bucket),
        }
    }

    fn image_path(image_id: &str, key: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("images/{image_id}/{key}"))
    }

    /// Path of the metadata document.
    pub(crate) fn image_json_path(image_id: &str) -> Utf8PathBuf {
        Self::image_path(image_id, "json")
    }

    /// Path of the layer archive.
    pub(crate) fn image_layer_path(image_id: &str) -> Utf8PathBuf {
        Self::image_path(image_id, "layer")
    }

    /// Path of the confirmed `algorithm:hex` checksum.
    pub(crate) fn image_checksum_path(image_id: &str) -> Utf8PathBuf {
        Self::image_path(image_id, "_checksum")
    }

    /// Path of the upload-in-progress sentinel.
    pub(crate) fn image_mark_path(image_id: &str) -> Utf8PathBuf {
        Self::image_path(image_id, "_inprogress")
    }

    /// Path of the materialized lineage.
    pub(crate) fn image_ancestry_path(image_id: &str) -> Utf8PathBuf {
        Self::image_path(image_id, "ancestry")
    }

    /// Path of the list of images belonging to a repository.
    pub(crate) fn images_list_path(repository: &str) -> Utf8PathBuf {
        let (namespace, name) = repository
            .split_once('/')
            .unwrap_or((DEFAULT_NAMESPACE, repository));
        Utf8PathBuf::from(format!("repositories/{namespace}/{name}/_images_list"))
    }

    /// The upload marker of an image.
    pub(crate) fn mark<'s>(&'s self, image_id: &'s str) -> UploadMark<'s> {
        UploadMark::new(self, image_id)
    }

    /// Check if an object exists
    pub(crate) async fn exists(&self, path: &Utf8Path) -> RegistryResult<bool> {
        Ok(self.bucket.exists(path).await?)
    }

    /// Read an object completely, `None` when it is absent.
    pub(crate) async fn get_content(&self, path: &Utf8Path) -> RegistryResult<Option<Vec<u8>>> {
        let mut reader = match self.bucket.open(path).await {
            Ok(reader) => reader,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        Ok(Some(data))
    }

    /// Replace an object with `data`.
    pub(crate) async fn put_content(&self, path: &Utf8Path, data: &[u8]) -> RegistryResult<()> {
        let mut reader = data;
        self.bucket.upload(path, &mut reader).await?;
        Ok(())
    }

    /// Replace an object with everything `reader` yields.
    pub(crate) async fn write_stream<R>(&self, path: &Utf8Path, reader: &mut R) -> RegistryResult<()>
    where
        R: AsyncBufRead + Unpin + Send + Sync,
    {
        self.bucket.upload(path, reader).await?;
        Ok(())
    }

    /// Remove an object. Removing an absent object succeeds.
    pub(crate) async fn remove(&self, path: &Utf8Path) -> RegistryResult<()> {
        match self.bucket.delete(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Size of an object in bytes, `None` when it is absent.
    pub(crate) async fn size(&self, path: &Utf8Path) -> RegistryResult<Option<u64>> {
        match self.bucket.metadata(path).await {
            Ok(metadata) => Ok(Some(metadata.size)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Open an image's object for streaming, mapping absence to [`RegistryError::ImageNotFound`].
    pub(crate) async fn open(&self, image_id: &str, path: &Utf8Path) -> RegistryResult<BoxReader> {
        self.bucket.open(path).await.map_err(|err| {
            if err.is_not_found() {
                RegistryError::ImageNotFound(image_id.to_string())
            } else {
                err.into()
            }
        })
    }

    /// Path a front-end proxy can serve directly, when the backend supports it.
    pub(crate) fn direct_path(&self, path: &Utf8Path) -> Option<Utf8PathBuf> {
        self.bucket.direct_path(path)
    }

    /// Name of the storage driver, for logging.
    pub(crate) fn driver_name(&self) -> &'static str {
        self.bucket.driver_name()
    }
}

/// Reject ids that would escape or alias the image's directory.
pub(crate) fn validate_image_id(image_id: &str) -> RegistryResult<()> {
    if image_id.is_empty()
        || image_id == "."
        || image_id.contains("..")
        || image_id.contains('/')
        || image_id.contains('\\')
    {
        return Err(RegistryError::InvalidImageId(image_id.to_string()));
    }
    Ok(())
}
