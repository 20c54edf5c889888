//! Materialized image lineage and repository membership.
//!
//! Each image stores its full chain, self first, root last, so reading the ancestry of any
//! image is a single fetch.

use serde::Deserialize;

use crate::error::{RegistryError, RegistryResult};
use crate::storage::ImageStore;

/// Write the chain of `image_id`: itself, followed by the chain of `parent`.
pub(crate) async fn generate(
    store: &ImageStore,
    image_id: &str,
    parent: Option<&str>,
) -> RegistryResult<Vec<String>> {
    let chain = match parent {
        None => vec![image_id.to_string()],
        Some(parent) => {
            let data = store
                .get_content(&ImageStore::image_ancestry_path(parent))
                .await?
                .ok_or_else(|| RegistryError::ParentNotFound(parent.to_string()))?;
            let mut chain: Vec<String> = serde_json::from_slice(&data)?;
            chain.insert(0, image_id.to_string());
            chain
        }
    };

    store
        .put_content(
            &ImageStore::image_ancestry_path(image_id),
            &serde_json::to_vec(&chain)?,
        )
        .await?;
    Ok(chain)
}

/// The stored chain of `image_id`.
pub(crate) async fn read(store: &ImageStore, image_id: &str) -> RegistryResult<Vec<String>> {
    let data = store
        .get_content(&ImageStore::image_ancestry_path(image_id))
        .await?
        .ok_or_else(|| RegistryError::ImageNotFound(image_id.to_string()))?;
    Ok(serde_json::from_slice(&data)?)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListedImage {
    Id(String),
    Entry { id: String },
}

impl ListedImage {
    fn id(&self) -> &str {
        match self {
            ListedImage::Id(id) | ListedImage::Entry { id } => id,
        }
    }
}

/// Whether `image_id` is listed in `repository`.
///
/// Without a repository context there is nothing to check. A repository without an image
/// list has no members.
pub(crate) async fn check_images_list(
    store: &ImageStore,
    image_id: &str,
    repository: Option<&str>,
) -> RegistryResult<bool> {
    let Some(repository) = repository else {
        return Ok(true);
    };

    let Some(data) = store
        .get_content(&ImageStore::images_list_path(repository))
        .await?
    else {
        tracing::debug!(%repository, "repository has no image list");
        return Ok(false);
    };

    let images: Vec<ListedImage> = serde_json::from_slice(&data)?;
    Ok(images.iter().any(|image| image.id() == image_id))
}

#[cfg(test)]
mod tests {
    use storage::MemoryStorage;

    use super::*;

    fn test_store() -> ImageStore {
        ImageStore::new(MemoryStorage::with_buckets(&["test"]).into(), "test")
    }

    #[tokio::test]
    async fn chain_prepends_parent() {
        let store = test_store();

        assert_eq!(generate(&store, "A", None).await.unwrap(), ["A"]);
        assert_eq!(generate(&store, "B", Some("A")).await.unwrap(), ["B", "A"]);
        assert_eq!(
            generate(&store, "C", Some("B")).await.unwrap(),
            ["C", "B", "A"]
        );

        assert_eq!(read(&store, "C").await.unwrap(), ["C", "B", "A"]);
        let stored = store
            .get_content(&ImageStore::image_ancestry_path("B"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, br#"["B","A"]"#);
    }

    #[tokio::test]
    async fn missing_parent_chain() {
        let store = test_store();
        let err = generate(&store, "B", Some("A")).await.unwrap_err();
        assert!(matches!(err, RegistryError::ParentNotFound(parent) if parent == "A"));

        let err = read(&store, "B").await.unwrap_err();
        assert!(matches!(err, RegistryError::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn images_list_membership() {
        let store = test_store();

        assert!(check_images_list(&store, "abc", None).await.unwrap());
        assert!(
            !check_images_list(&store, "abc", Some("samalba/busybox"))
                .await
                .unwrap()
        );

        store
            .put_content(
                &ImageStore::images_list_path("samalba/busybox"),
                br#"[{"id":"abc","checksum":"sha256:00"},{"id":"def"}]"#,
            )
            .await
            .unwrap();
        assert!(
            check_images_list(&store, "abc", Some("samalba/busybox"))
                .await
                .unwrap()
        );
        assert!(
            !check_images_list(&store, "xyz", Some("samalba/busybox"))
                .await
                .unwrap()
        );

        store
            .put_content(&ImageStore::images_list_path("ubuntu"), br#"["abc"]"#)
            .await
            .unwrap();
        assert!(
            check_images_list(&store, "abc", Some("library/ubuntu"))
                .await
                .unwrap()
        );
    }
}
