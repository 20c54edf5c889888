use camino::{Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use tokio::io::AsyncWriteExt;

use storage_driver::{BoxReader, Driver, Metadata, Reader, StorageError, StorageErrorKind};

const ENGINE: &str = "local";

/// Storage driver rooted in a local directory.
///
/// Objects live at `{root}/{bucket}/b/{remote}`. Uploads are written to a uniquely
/// named sibling file and renamed into place, so an interrupted or concurrent upload
/// never leaves a mix of two writers' bytes behind.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn relative(bucket: &str, remote: &Utf8Path) -> Utf8PathBuf {
        let mut path = Utf8PathBuf::from(bucket);
        path.push("b");
        path.push(remote);
        path
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Utf8PathBuf {
        self.root.join(Self::relative(bucket, remote))
    }
}

fn io_error(bucket: &str, remote: &Utf8Path, context: &str, err: std::io::Error) -> StorageError {
    StorageError::builder(ENGINE, err.kind().into(), err)
        .bucket(bucket)
        .path(remote.as_str())
        .context(context)
        .build()
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| io_error(bucket, remote, "metadata", err))?;
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(|err| io_error(bucket, remote, "created timestamp", err))?;

        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn open(&self, bucket: &str, remote: &Utf8Path) -> Result<BoxReader, StorageError> {
        let path = self.path(bucket, remote);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| io_error(bucket, remote, "open", err))?;
        Ok(Box::new(tokio::io::BufReader::new(file)))
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);
        let parent = path
            .parent()
            .ok_or_else(|| eyre::eyre!("no parent directory for {path}"))
            .map_err(StorageError::with(ENGINE, StorageErrorKind::InvalidRequest))?;

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| io_error(bucket, remote, "create_dir_all", err))?;

        // Each upload stages into its own file, removed on drop if never persisted.
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}.", path.file_name().unwrap_or("upload")))
            .suffix(".partial")
            .tempfile_in(parent)
            .map_err(|err| io_error(bucket, remote, "create staging file", err))?;

        let file = staging
            .reopen()
            .map_err(|err| io_error(bucket, remote, "open staging file", err))?;
        let mut writer = tokio::io::BufWriter::new(tokio::fs::File::from_std(file));

        async {
            tokio::io::copy_buf(local, &mut writer).await?;
            writer.shutdown().await
        }
        .await
        .map_err(|err| io_error(bucket, remote, "copy", err))?;
        drop(writer);

        staging
            .persist(&path)
            .map_err(|err| err.error)
            .wrap_err_with(|| format!("persist staging file into {path}"))
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Io))?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);
        tokio::fs::remove_file(path)
            .await
            .map_err(|err| io_error(bucket, remote, "remove_file", err))?;
        Ok(())
    }

    fn direct_path(&self, bucket: &str, remote: &Utf8Path) -> Option<Utf8PathBuf> {
        Some(Self::relative(bucket, remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Sends a few bytes, then fails like a dropped client connection.
    struct Disconnects {
        sent: bool,
    }

    impl tokio::io::AsyncRead for Disconnects {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.sent {
                return std::task::Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()));
            }
            self.sent = true;
            buf.put_slice(b"partial");
            std::task::Poll::Ready(Ok(()))
        }
    }

    fn driver() -> (tempfile::TempDir, LocalDriver) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        (dir, LocalDriver::new(root))
    }

    #[tokio::test]
    async fn roundtrip_and_direct_path() {
        let (_dir, driver) = driver();
        let remote = Utf8Path::new("images/abc/layer");

        let mut reader: &[u8] = b"layer bytes";
        driver.upload("registry", remote, &mut reader).await.unwrap();

        let mut contents = Vec::new();
        driver
            .open("registry", remote)
            .await
            .unwrap()
            .read_to_end(&mut contents)
            .await
            .unwrap();
        assert_eq!(contents, b"layer bytes");

        let meta = driver.metadata("registry", remote).await.unwrap();
        assert_eq!(meta.size, 11);

        assert_eq!(
            driver.direct_path("registry", remote).unwrap(),
            Utf8PathBuf::from("registry/b/images/abc/layer")
        );
    }

    #[tokio::test]
    async fn concurrent_uploads_land_whole() {
        let (dir, driver) = driver();
        let remote = Utf8Path::new("images/x/layer");

        async fn trickle(byte: u8) -> tokio::io::BufReader<tokio::io::DuplexStream> {
            let (mut tx, rx) = tokio::io::duplex(64);
            tokio::spawn(async move {
                for _ in 0..64 {
                    tx.write_all(&[byte; 64]).await.unwrap();
                    tokio::task::yield_now().await;
                }
            });
            tokio::io::BufReader::new(rx)
        }

        let mut a = trickle(b'a').await;
        let mut b = trickle(b'b').await;
        let (first, second) = tokio::join!(
            driver.upload("registry", remote, &mut a),
            driver.upload("registry", remote, &mut b),
        );
        first.unwrap();
        second.unwrap();

        let mut contents = Vec::new();
        driver
            .open("registry", remote)
            .await
            .unwrap()
            .read_to_end(&mut contents)
            .await
            .unwrap();
        assert_eq!(contents.len(), 4096);
        assert!(
            contents.iter().all(|&c| c == b'a') || contents.iter().all(|&c| c == b'b'),
            "stored layer mixes both uploads"
        );

        let leftovers = std::fs::read_dir(dir.path().join("registry/b/images/x"))
            .unwrap()
            .count();
        assert_eq!(leftovers, 1, "staging files were left behind");
    }

    #[tokio::test]
    async fn failed_upload_leaves_no_staging_file() {
        let (dir, driver) = driver();
        let remote = Utf8Path::new("images/y/layer");

        let mut reader = tokio::io::BufReader::new(Disconnects { sent: false });
        assert!(driver.upload("registry", remote, &mut reader).await.is_err());

        let parent = dir.path().join("registry/b/images/y");
        assert_eq!(std::fs::read_dir(parent).unwrap().count(), 0);
        assert!(driver.metadata("registry", remote).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let (_dir, driver) = driver();
        let err = driver
            .delete("registry", Utf8Path::new("images/nope/_inprogress"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
