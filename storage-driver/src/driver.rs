use std::{fmt, ops::Deref, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io::{self, AsyncWriteExt};

use crate::error::StorageError;

/// A reader stream for file contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// A writer stream for file contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + Sync + 'w;

/// An owned reader over a stored object, as returned by [`Driver::open`].
pub type BoxReader = Box<Reader<'static>>;

/// File object metadata, which will be generically provided by the driver.
///
/// This struct only provides common metadata fields, and drivers may provide more specific
/// metadata fields directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the file in bytes.
    pub size: u64,

    /// The creation timestamp of the file.
    pub created: DateTime<Utc>,
}

/// A storage driver, which provides the ability to interact with a storage backend.
///
/// Every operation is individually atomic from the caller's perspective: an upload either
/// replaces the object or leaves the previous one in place. Drivers make no promises across
/// multiple paths.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Get the metadata for a file, by path.
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Open a file for streaming reads.
    async fn open(&self, bucket: &str, remote: &Utf8Path) -> Result<BoxReader, StorageError>;

    /// Upload a file to the storage, using a reader stream to provide the contents.
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError>;

    /// Download a file from storage, into a writer stream.
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let mut reader = self.open(bucket, remote).await?;
        tokio::io::copy_buf(&mut reader, &mut *writer)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;
        writer
            .flush()
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;
        Ok(())
    }

    /// Delete a file from the storage, by path.
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError>;

    /// The path of a file relative to a directory that a front-end proxy can serve directly.
    ///
    /// Drivers which do not keep their objects on a local filesystem return `None`, which
    /// is the default.
    fn direct_path(&self, bucket: &str, remote: &Utf8Path) -> Option<Utf8PathBuf> {
        let _ = (bucket, remote);
        None
    }
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(bucket, remote).await
    }

    async fn open(&self, bucket: &str, remote: &Utf8Path) -> Result<BoxReader, StorageError> {
        self.deref().open(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.deref().upload(bucket, remote, reader).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.deref().download(bucket, remote, writer).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(bucket, remote).await
    }

    fn direct_path(&self, bucket: &str, remote: &Utf8Path) -> Option<Utf8PathBuf> {
        self.deref().direct_path(bucket, remote)
    }
}

#[async_trait::async_trait]
impl<D> Driver for &D
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        (**self).metadata(bucket, remote).await
    }

    async fn open(&self, bucket: &str, remote: &Utf8Path) -> Result<BoxReader, StorageError> {
        (**self).open(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        (**self).upload(bucket, remote, reader).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        (**self).download(bucket, remote, writer).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        (**self).delete(bucket, remote).await
    }

    fn direct_path(&self, bucket: &str, remote: &Utf8Path) -> Option<Utf8PathBuf> {
        (**self).direct_path(bucket, remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);
}
