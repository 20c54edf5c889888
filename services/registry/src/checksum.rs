//! Layer digests and checksum verification.
//!
//! A layer is digested once, while it streams into the store. The resulting
//! [`ChecksumSet`] is compared against whatever checksum the client declares, whenever that
//! becomes known.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{RegistryError, RegistryResult};
use crate::tarsum;

/// A checksum as sent on the wire: `algorithm:hexvalue`, with exactly one colon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checksum {
    value: String,
    split: usize,
}

impl Checksum {
    /// The algorithm tag, e.g. `sha256` or `tarsum+sha256`.
    pub fn algorithm(&self) -> &str {
        &self.value[..self.split]
    }

    /// The hex digest.
    pub fn digest(&self) -> &str {
        &self.value[self.split + 1..]
    }

    /// The full `algorithm:hexvalue` string.
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl FromStr for Checksum {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::InvalidChecksum(s.to_string());
        let (algorithm, digest) = s.split_once(':').ok_or_else(invalid)?;
        if algorithm.is_empty() || digest.is_empty() || digest.contains(':') {
            return Err(invalid());
        }

        Ok(Checksum {
            value: s.to_string(),
            split: algorithm.len(),
        })
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Every digest computed for one layer. A declared checksum is accepted if it is any of
/// them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChecksumSet(Vec<String>);

impl ChecksumSet {
    /// Whether `checksum` matches one of the computed digests.
    pub fn contains(&self, checksum: &str) -> bool {
        self.0.iter().any(|candidate| candidate == checksum)
    }

    /// Iterate over the computed digests.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Number of computed digests.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no digest was computed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<String> for ChecksumSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        ChecksumSet(iter.into_iter().collect())
    }
}

/// Digests a layer while it is relayed to storage.
///
/// Produces `sha256:` over the raw bytes, `sha256:` over the metadata, a newline and the
/// raw bytes (what v1 clients compute), and, from a temporary spill of the layer, a
/// `tarsum+sha256:` structural digest.
#[derive(Debug)]
pub(crate) struct LayerDigester {
    json: Vec<u8>,
    raw: Sha256,
    seeded: Sha256,
    spill: Option<File>,
    size: u64,
}

impl LayerDigester {
    pub(crate) fn new(json: &[u8]) -> Self {
        let mut seeded = Sha256::new();
        seeded.update(json);
        seeded.update(b"\n");

        let spill = match tempfile::tempfile() {
            Ok(file) => Some(File::from_std(file)),
            Err(err) => {
                tracing::debug!(%err, "no spill file, tarsum will be skipped");
                None
            }
        };

        Self {
            json: json.to_vec(),
            raw: Sha256::new(),
            seeded,
            spill,
            size: 0,
        }
    }

    async fn update(&mut self, chunk: &[u8]) {
        self.raw.update(chunk);
        self.seeded.update(chunk);
        self.size += chunk.len() as u64;

        if let Some(spill) = self.spill.as_mut() {
            if let Err(err) = spill.write_all(chunk).await {
                tracing::debug!(%err, "spill write failed, tarsum will be skipped");
                self.spill = None;
            }
        }
    }

    /// Copy `body` into `sink`, digesting every chunk on the way. `sink` is shut down once
    /// the body ends. Returns the number of bytes relayed.
    pub(crate) async fn relay<S, E, W>(&mut self, body: S, mut sink: W) -> RegistryResult<u64>
    where
        S: Stream<Item = Result<Bytes, E>>,
        RegistryError: From<E>,
        W: AsyncWrite + Unpin,
    {
        let mut body = std::pin::pin!(body);
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            self.update(&chunk).await;
            sink.write_all(&chunk).await?;
        }
        sink.shutdown().await?;
        Ok(self.size)
    }

    /// Finish every digest. A tarsum failure only drops the tarsum from the set.
    pub(crate) async fn finish(self) -> ChecksumSet {
        let mut checksums = vec![
            format!("sha256:{}", hex::encode(self.raw.finalize())),
            format!("sha256:{}", hex::encode(self.seeded.finalize())),
        ];

        if let Some(spill) = self.spill {
            if let Some(tarsum) = structural_digest(spill, self.json).await {
                checksums.push(tarsum);
            }
        }

        checksums.into_iter().collect()
    }
}

async fn structural_digest(mut spill: File, json: Vec<u8>) -> Option<String> {
    if let Err(err) = spill.flush().await {
        tracing::debug!(%err, "flushing spill file");
        return None;
    }
    let file = spill.into_std().await;

    match tokio::task::spawn_blocking(move || tarsum::compute(file, &json)).await {
        Ok(Ok(tarsum)) => Some(tarsum),
        Ok(Err(err)) => {
            tracing::debug!(%err, "Error when computing tarsum");
            None
        }
        Err(err) => {
            tracing::debug!(%err, "tarsum task failed");
            None
        }
    }
}
