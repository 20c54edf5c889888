use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::local::LocalDriver;
use storage_driver::{BoxReader, Driver, Metadata, Reader, StorageError};

/// A local driver whose root directory is removed when the driver is dropped.
#[derive(Debug)]
pub struct TempDriver {
    // Held for its drop.
    _dir: TempDir,
    driver: LocalDriver,
}

impl TempDriver {
    /// Create a new `TempDriver` instance, storing files in a temporary directory.
    pub fn new() -> io::Result<Self> {
        let dir = TempDir::new()?;
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).map_err(|path| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("temporary directory is not UTF-8: {}", path.display()),
            )
        })?;

        Ok(Self {
            _dir: dir,
            driver: LocalDriver::new(root),
        })
    }
}

#[async_trait::async_trait]
impl Driver for TempDriver {
    fn name(&self) -> &'static str {
        "temp"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(bucket, remote).await
    }

    async fn open(&self, bucket: &str, remote: &Utf8Path) -> Result<BoxReader, StorageError> {
        self.driver.open(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.driver.upload(bucket, remote, local).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(bucket, remote).await
    }

    fn direct_path(&self, bucket: &str, remote: &Utf8Path) -> Option<Utf8PathBuf> {
        self.driver.direct_path(bucket, remote)
    }
}
