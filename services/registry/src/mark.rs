//! The upload-in-progress marker.
//!
//! An image is visible to readers only once its marker is gone. The marker is a
//! presence-only key, so setting and clearing it are single writes against the store and
//! never a read-modify-write of some status value.

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{RegistryError, RegistryResult};
use crate::storage::ImageStore;

const MARK_CONTENT: &[u8] = b"true";

/// The marker of one image.
#[derive(Debug)]
pub(crate) struct UploadMark<'s> {
    store: &'s ImageStore,
    image_id: &'s str,
    path: Utf8PathBuf,
}

impl<'s> UploadMark<'s> {
    pub(crate) fn new(store: &'s ImageStore, image_id: &'s str) -> Self {
        Self {
            store,
            image_id,
            path: ImageStore::image_mark_path(image_id),
        }
    }

    /// Whether the marker is set.
    pub(crate) async fn is_present(&self) -> RegistryResult<bool> {
        self.store.exists(&self.path).await
    }

    /// Whether the image has been confirmed complete.
    pub(crate) async fn is_complete(&self) -> RegistryResult<bool> {
        Ok(!self.is_present().await?)
    }

    /// Set the marker, then store the metadata document.
    ///
    /// The marker goes first: a reader racing this call may see a marker without json, never
    /// json without a marker.
    pub(crate) async fn begin(&self, json: &[u8]) -> RegistryResult<()> {
        self.store.put_content(&self.path, MARK_CONTENT).await?;
        self.store
            .put_content(&ImageStore::image_json_path(self.image_id), json)
            .await
    }

    /// Clear the marker, making the image visible.
    pub(crate) async fn complete(&self) -> RegistryResult<()> {
        self.store.remove(&self.path).await?;
        tracing::info!(image_id = %self.image_id, "image upload complete");
        Ok(())
    }

    /// Fail with [`RegistryError::Incomplete`] while the marker is set.
    pub(crate) async fn require_completion(&self) -> RegistryResult<()> {
        if self.is_present().await? {
            return Err(RegistryError::Incomplete(self.image_id.to_string()));
        }
        Ok(())
    }

    /// Fail with [`RegistryError::ImageExists`] when `existing` is stored and the marker is
    /// gone. With the marker present the push is a retry and may overwrite.
    pub(crate) async fn check_collision(&self, existing: &Utf8Path) -> RegistryResult<()> {
        if self.store.exists(existing).await? && self.is_complete().await? {
            return Err(RegistryError::ImageExists(self.image_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemoryStorage;

    fn test_store() -> ImageStore {
        ImageStore::new(MemoryStorage::with_buckets(&["test"]).into(), "test")
    }

    #[tokio::test]
    async fn begin_then_complete() {
        let store = test_store();
        let mark = store.mark("abc");

        assert!(mark.is_complete().await.unwrap());

        mark.begin(b"{\"id\":\"abc\"}").await.unwrap();
        assert!(mark.is_present().await.unwrap());
        assert!(store
            .exists(&ImageStore::image_json_path("abc"))
            .await
            .unwrap());
        assert!(matches!(
            mark.require_completion().await,
            Err(RegistryError::Incomplete(_))
        ));

        mark.complete().await.unwrap();
        mark.require_completion().await.unwrap();
    }

    #[tokio::test]
    async fn collision_only_after_completion() {
        let store = test_store();
        let mark = store.mark("abc");
        let json = ImageStore::image_json_path("abc");

        // nothing stored yet
        mark.check_collision(&json).await.unwrap();

        // retry while marked
        mark.begin(b"{\"id\":\"abc\"}").await.unwrap();
        mark.check_collision(&json).await.unwrap();

        mark.complete().await.unwrap();
        assert!(matches!(
            mark.check_collision(&json).await,
            Err(RegistryError::ImageExists(_))
        ));
    }
}
