//! Packs a bundle's staged objects into one container file.
//!
//! The container is the plain concatenation of the objects' bytes in
//! insertion order. Each object's offset is the container position where
//! its bytes start; together with the object's size that is enough for a
//! byte-range read against the sealed chain object.

use crate::{
    models::{bundle::Bundle, object::Object},
    services::{
        bundle_repo::RepoError,
        object_repo::ObjectRepository,
        staging::{ByteReader, StagingError, StagingStorage},
    },
};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncWriteExt, BufWriter},
};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("bundle `{bucket}/{name}` has no objects to pack")]
    EmptyBundle { bucket: String, name: String },
    #[error("object `{object}` is {expected} bytes but {actual} were staged")]
    SizeMismatch {
        object: String,
        expected: i64,
        actual: u64,
    },
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A packed container on local disk.
#[derive(Debug)]
pub struct PackedBundle {
    pub path: PathBuf,
    pub size: u64,
    /// `(object id, offset)` in container order.
    pub offsets: Vec<(i64, i64)>,
}

impl PackedBundle {
    pub async fn open(&self) -> io::Result<ByteReader> {
        Ok(Box::pin(File::open(&self.path).await?))
    }

    /// Remove the container file.
    pub async fn discard(self) {
        if let Err(err) = fs::remove_file(&self.path).await {
            warn!("failed to remove packed bundle {}: {}", self.path.display(), err);
        }
    }
}

#[derive(Clone)]
pub struct BundlePacker {
    objects: ObjectRepository,
    staging: Arc<dyn StagingStorage>,
    work_dir: PathBuf,
}

impl BundlePacker {
    pub fn new(objects: ObjectRepository, staging: Arc<dyn StagingStorage>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            objects,
            staging,
            work_dir: work_dir.into(),
        }
    }

    /// Pack `bundle` and persist every object's offset.
    ///
    /// Offsets are written in one transaction after the container is
    /// complete; a failed pack changes no object row and leaves no file
    /// behind, so packing can simply be repeated.
    pub async fn pack(&self, bundle: &Bundle) -> Result<PackedBundle, PackError> {
        let objects = self.objects.get_bundle_objects(&bundle.bucket, &bundle.name).await?;
        if objects.is_empty() {
            return Err(PackError::EmptyBundle {
                bucket: bundle.bucket.clone(),
                name: bundle.name.clone(),
            });
        }

        fs::create_dir_all(&self.work_dir).await?;
        let path = self
            .work_dir
            .join(format!("{}-{}-{}.bundle", bundle.id, bundle.nonce, Uuid::new_v4()));

        let written = self.write_container(&path, bundle, &objects).await;
        let packed = match written {
            Ok((size, offsets)) => PackedBundle { path, size, offsets },
            Err(err) => {
                let _ = fs::remove_file(&path).await;
                return Err(err);
            }
        };

        if let Err(err) = self.objects.set_offsets(&packed.offsets).await {
            packed.discard().await;
            return Err(err.into());
        }

        debug!(
            bucket = %bundle.bucket,
            bundle = %bundle.name,
            files = packed.offsets.len(),
            size = packed.size,
            "packed bundle"
        );
        Ok(packed)
    }

    async fn write_container(
        &self,
        path: &Path,
        bundle: &Bundle,
        objects: &[Object],
    ) -> Result<(u64, Vec<(i64, i64)>), PackError> {
        let mut writer = BufWriter::new(File::create(path).await?);
        let mut position: u64 = 0;
        let mut offsets = Vec::with_capacity(objects.len());

        for object in objects {
            let mut reader = self
                .staging
                .get(&bundle.bucket, &bundle.name, &object.object_name)
                .await?;
            let copied = tokio::io::copy(&mut reader, &mut writer).await?;
            if i64::try_from(copied).ok() != Some(object.size) {
                return Err(PackError::SizeMismatch {
                    object: object.object_name.clone(),
                    expected: object.size,
                    actual: copied,
                });
            }
            offsets.push((object.id, position as i64));
            position += copied;
        }

        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        Ok((position, offsets))
    }
}
