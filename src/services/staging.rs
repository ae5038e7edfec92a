//! src/services/staging.rs
//!
//! Staging storage: where uploaded object bytes wait until their bundle is
//! packed and sealed. Two backends implement [`StagingStorage`]: local disk
//! sharded beneath `base_path/{bucket}/{bundle}/{shard}/{shard}/{object}`,
//! and a remote S3-compatible store addressed path-style. The backend is
//! chosen once at startup; nothing else branches on it.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
};
use tokio_util::io::StreamReader;
use tracing::debug;
use uuid::Uuid;

/// Incoming bytes, e.g. an HTTP request body.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Outgoing bytes.
pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

const MAX_KEY_LEN: usize = 512;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staged object `{0}` not found")]
    NotFound(String),
    #[error("invalid {kind} `{value}`")]
    InvalidKey { kind: &'static str, value: String },
    #[error("remote staging returned {status} for `{key}`")]
    UnexpectedStatus { status: u16, key: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StagingResult<T> = Result<T, StagingError>;

#[async_trait]
pub trait StagingStorage: Send + Sync {
    /// Store an object's bytes, returning the stored size.
    async fn put(&self, bucket: &str, bundle: &str, object: &str, body: ByteStream) -> StagingResult<u64>;

    async fn get(&self, bucket: &str, bundle: &str, object: &str) -> StagingResult<ByteReader>;

    /// Remove an object. Removing a missing object succeeds.
    async fn delete(&self, bucket: &str, bundle: &str, object: &str) -> StagingResult<()>;

    /// Cheap readiness probe.
    async fn check(&self) -> StagingResult<()>;
}

/// Basic name validation to avoid trivial path traversal vectors.
///
/// Rejects empty or over-long names, names that begin with `/`, contain
/// `..`, backslashes or control characters.
pub fn ensure_key_safe(kind: &'static str, value: &str) -> StagingResult<()> {
    let invalid = value.is_empty()
        || value.len() > MAX_KEY_LEN
        || value.starts_with('/')
        || value.contains("..")
        || value
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
    if invalid {
        return Err(StagingError::InvalidKey {
            kind,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn ensure_all_safe(bucket: &str, bundle: &str, object: &str) -> StagingResult<()> {
    ensure_key_safe("bucket name", bucket)?;
    ensure_key_safe("bundle name", bundle)?;
    ensure_key_safe("object name", object)
}

/// Local-disk staging.
#[derive(Clone, Debug)]
pub struct LocalStaging {
    base_path: PathBuf,
}

impl LocalStaging {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn bundle_root(&self, bucket: &str, bundle: &str) -> PathBuf {
        self.base_path.join(bucket).join(bundle)
    }

    /// Two-level shard directories from MD5(bucket/bundle/object), keeping
    /// the file count per directory low for large bundles.
    fn object_shards(bucket: &str, bundle: &str, object: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}/{}", bucket, bundle, object));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket: &str, bundle: &str, object: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket, bundle, object);
        let mut path = self.bundle_root(bucket, bundle);
        path.push(shard_a);
        path.push(shard_b);
        path.push(object);
        path
    }

    /// Recursively remove empty directories up to the staging root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl StagingStorage for LocalStaging {
    /// Writes to a temp file, fsyncs, then renames into place, so a reader
    /// never observes a partially written object.
    async fn put(&self, bucket: &str, bundle: &str, object: &str, mut body: ByteStream) -> StagingResult<u64> {
        ensure_all_safe(bucket, bundle, object)?;

        let file_path = self.object_path(bucket, bundle, object);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StagingError::Io(err));
                }
            };
            size += chunk.len() as u64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StagingError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StagingError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StagingError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StagingError::Io(err));
        }

        debug!(
            "staged {}/{}/{} ({} bytes, md5 {:x})",
            bucket,
            bundle,
            object,
            size,
            digest.compute()
        );
        Ok(size)
    }

    async fn get(&self, bucket: &str, bundle: &str, object: &str) -> StagingResult<ByteReader> {
        ensure_all_safe(bucket, bundle, object)?;
        let file_path = self.object_path(bucket, bundle, object);
        match File::open(&file_path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StagingError::NotFound(format!("{}/{}/{}", bucket, bundle, object)))
            }
            Err(err) => Err(StagingError::Io(err)),
        }
    }

    async fn delete(&self, bucket: &str, bundle: &str, object: &str) -> StagingResult<()> {
        ensure_all_safe(bucket, bundle, object)?;
        let file_path = self.object_path(bucket, bundle, object);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed staged file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("staged file {} already missing", file_path.display());
            }
            Err(err) => return Err(StagingError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    /// Write, read back and delete a probe file under the staging root.
    async fn check(&self) -> StagingResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let probe = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz").await?;
        let read_back = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;
        if read_back? != b"readyz" {
            return Err(StagingError::Io(io::Error::other("probe file content mismatch")));
        }
        Ok(())
    }
}

/// Staging on a remote S3-compatible store, one object per key
/// `{bucket}/{bundle}/{object}` inside a single staging bucket.
#[derive(Clone, Debug)]
pub struct RemoteStaging {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
}

impl RemoteStaging {
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
        })
    }

    fn object_key(bucket: &str, bundle: &str, object: &str) -> String {
        format!("{}/{}/{}", bucket, bundle, object)
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }
}

#[async_trait]
impl StagingStorage for RemoteStaging {
    /// Uploads are small (bounded by the single-file limit), so the body is
    /// collected and sent with an exact content length.
    async fn put(&self, bucket: &str, bundle: &str, object: &str, body: ByteStream) -> StagingResult<u64> {
        ensure_all_safe(bucket, bundle, object)?;
        let key = Self::object_key(bucket, bundle, object);

        let payload = body
            .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await?
            .freeze();
        let size = payload.len() as u64;

        let resp = self.client.put(self.url(&key)).body(payload).send().await?;
        if !resp.status().is_success() {
            return Err(StagingError::UnexpectedStatus {
                status: resp.status().as_u16(),
                key,
            });
        }
        debug!("staged {} remotely ({} bytes)", key, size);
        Ok(size)
    }

    async fn get(&self, bucket: &str, bundle: &str, object: &str) -> StagingResult<ByteReader> {
        ensure_all_safe(bucket, bundle, object)?;
        let key = Self::object_key(bucket, bundle, object);

        let resp = self.client.get(self.url(&key)).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StagingError::NotFound(key));
        }
        if !resp.status().is_success() {
            return Err(StagingError::UnexpectedStatus {
                status: resp.status().as_u16(),
                key,
            });
        }
        let stream = resp.bytes_stream().map_err(io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn delete(&self, bucket: &str, bundle: &str, object: &str) -> StagingResult<()> {
        ensure_all_safe(bucket, bundle, object)?;
        let key = Self::object_key(bucket, bundle, object);

        let resp = self.client.delete(self.url(&key)).send().await?;
        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(StagingError::UnexpectedStatus {
                status: status.as_u16(),
                key,
            })
        }
    }

    async fn check(&self) -> StagingResult<()> {
        let url = format!("{}/{}", self.endpoint, self.bucket);
        let resp = self.client.head(&url).send().await?;
        if resp.status().is_server_error() {
            return Err(StagingError::UnexpectedStatus {
                status: resp.status().as_u16(),
                key: self.bucket.clone(),
            });
        }
        Ok(())
    }
}

/// Wrap an in-memory payload as a [`ByteStream`].
pub fn stream_from_bytes(bytes: impl Into<Bytes>) -> ByteStream {
    let bytes = bytes.into();
    Box::pin(futures::stream::once(async move { Ok(bytes) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_all(mut reader: ByteReader) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn local_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let staging = LocalStaging::new(dir.path());

        let size = staging
            .put("b1", "bundle-0", "docs/a.txt", stream_from_bytes("hello world"))
            .await
            .unwrap();
        assert_eq!(size, 11);

        let bytes = read_all(staging.get("b1", "bundle-0", "docs/a.txt").await.unwrap()).await;
        assert_eq!(bytes, b"hello world");

        staging.delete("b1", "bundle-0", "docs/a.txt").await.unwrap();
        assert!(matches!(
            staging.get("b1", "bundle-0", "docs/a.txt").await,
            Err(StagingError::NotFound(_))
        ));
        // Deleting twice is fine, and empty shard directories are pruned.
        staging.delete("b1", "bundle-0", "docs/a.txt").await.unwrap();
        assert!(!dir.path().join("b1").exists());
    }

    #[tokio::test]
    async fn failed_stream_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let staging = LocalStaging::new(dir.path());
        let body: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"part")),
            Err(io::Error::other("client went away")),
        ]));

        assert!(staging.put("b1", "bundle-0", "a", body).await.is_err());
        assert!(matches!(
            staging.get("b1", "bundle-0", "a").await,
            Err(StagingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let staging = LocalStaging::new(dir.path());
        for name in ["../escape", "/abs", "", "a\\b"] {
            let err = staging
                .put("b1", "bundle-0", name, stream_from_bytes("x"))
                .await
                .unwrap_err();
            assert!(matches!(err, StagingError::InvalidKey { .. }), "{name:?}");
        }
    }

    #[tokio::test]
    async fn local_check_probes_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let staging = LocalStaging::new(dir.path().join("staging"));
        staging.check().await.unwrap();
    }
}
