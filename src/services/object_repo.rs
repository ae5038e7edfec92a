//! src/services/object_repo.rs
//!
//! ObjectRepository: object rows and the counters they feed on their
//! parent bundle.

use crate::{
    db::{WriteTx, is_unique_violation},
    models::{
        bundle::{Bundle, BundleStatus},
        object::{NewObject, Object},
    },
    services::bundle_repo::{BUNDLE_COLUMNS, OBJECT_COLUMNS, RepoError, RepoResult},
};
use chrono::Utc;
use sqlx::{SqlitePool, types::Json};
use std::sync::Arc;

#[derive(Clone)]
pub struct ObjectRepository {
    db: Arc<SqlitePool>,
}

impl ObjectRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Append `object` to its bucket's Bundling bundle.
    ///
    /// The bundle row is read, checked and incremented under the writer
    /// lock together with the object insert, so `files`/`size` always equal
    /// the count and byte sum of the bundle's object rows. The object is
    /// never re-targeted: if the bucket's Bundling bundle is not the one the
    /// object names, the append fails.
    pub async fn append_object(&self, object: &NewObject) -> RepoResult<Object> {
        let mut tx = WriteTx::begin(&self.db).await?;

        let sql = format!("SELECT {BUNDLE_COLUMNS} FROM bundles WHERE bucket = ? AND status = ?");
        let bundling = sqlx::query_as::<_, Bundle>(&sql)
            .bind(&object.bucket)
            .bind(BundleStatus::Bundling)
            .fetch_optional(tx.conn())
            .await?;
        let Some(bundle) = bundling else {
            tx.rollback().await?;
            return Err(RepoError::NoBundlingBundle(object.bucket.clone()));
        };
        if bundle.name != object.bundle_name {
            tx.rollback().await?;
            return Err(RepoError::BundleNameMismatch {
                declared: object.bundle_name.clone(),
                bundling: bundle.name,
            });
        }
        if !bundle.has_capacity() {
            tx.rollback().await?;
            return Err(RepoError::BundleFull {
                bucket: bundle.bucket,
                name: bundle.name,
            });
        }

        let now = Utc::now();
        sqlx::query("UPDATE bundles SET files = files + 1, size = size + ?, updated_at = ? WHERE id = ?")
            .bind(object.size)
            .bind(now)
            .bind(bundle.id)
            .execute(tx.conn())
            .await?;

        let sql = format!(
            "INSERT INTO objects (
                bucket, bundle_name, object_name, owner, content_type, size,
                hash_algo, hash, tags, offset_in_bundle, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            RETURNING {OBJECT_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, Object>(&sql)
            .bind(&object.bucket)
            .bind(&object.bundle_name)
            .bind(&object.object_name)
            .bind(&object.owner)
            .bind(&object.content_type)
            .bind(object.size)
            .bind(&object.hash_algo)
            .bind(&object.hash)
            .bind(Json(&object.tags))
            .bind(now)
            .bind(now)
            .fetch_one(tx.conn())
            .await;

        match inserted {
            Ok(row) => {
                tx.commit().await?;
                Ok(row)
            }
            Err(err) if is_unique_violation(&err) => {
                tx.rollback().await?;
                Err(RepoError::ObjectAlreadyExists {
                    bucket: object.bucket.clone(),
                    bundle: object.bundle_name.clone(),
                    object: object.object_name.clone(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_object(&self, bucket: &str, bundle: &str, object: &str) -> RepoResult<Option<Object>> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE bucket = ? AND bundle_name = ? AND object_name = ?"
        );
        Ok(sqlx::query_as::<_, Object>(&sql)
            .bind(bucket)
            .bind(bundle)
            .bind(object)
            .fetch_optional(&*self.db)
            .await?)
    }

    /// All objects of a bundle in packing order (insertion order).
    pub async fn get_bundle_objects(&self, bucket: &str, bundle: &str) -> RepoResult<Vec<Object>> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE bucket = ? AND bundle_name = ?
             ORDER BY id"
        );
        Ok(sqlx::query_as::<_, Object>(&sql)
            .bind(bucket)
            .bind(bundle)
            .fetch_all(&*self.db)
            .await?)
    }

    /// Store `(object id, offset)` pairs, all or nothing.
    pub async fn set_offsets(&self, offsets: &[(i64, i64)]) -> RepoResult<()> {
        let mut tx = WriteTx::begin(&self.db).await?;
        let now = Utc::now();
        for (id, offset) in offsets {
            sqlx::query("UPDATE objects SET offset_in_bundle = ?, updated_at = ? WHERE id = ?")
                .bind(offset)
                .bind(now)
                .bind(id)
                .execute(tx.conn())
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn new_object(bucket: &str, bundle: &str, name: &str, size: i64) -> NewObject {
    NewObject {
        bucket: bucket.into(),
        bundle_name: bundle.into(),
        object_name: name.into(),
        owner: "0xowner".into(),
        content_type: "text/plain".into(),
        size,
        hash_algo: "sha256".into(),
        hash: String::new(),
        tags: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::testing::temp_db,
        services::bundle_repo::{BundleRepository, new_bundle},
    };

    async fn setup() -> (tempfile::TempDir, BundleRepository, ObjectRepository) {
        let (dir, db) = temp_db().await;
        let db = Arc::new(db);
        (dir, BundleRepository::new(db.clone()), ObjectRepository::new(db))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_keep_counters_exact() {
        let (_dir, bundles, objects) = setup().await;
        let mut candidate = new_bundle("b1", "bundle-0");
        candidate.max_files = 1000;
        bundles.create_bundling_bundle_if_absent(&candidate).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20i64 {
            let objects = objects.clone();
            handles.push(tokio::spawn(async move {
                objects
                    .append_object(&new_object("b1", "bundle-0", &format!("obj-{i}"), i + 1))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let bundle = bundles.query_bundle("b1", "bundle-0").await.unwrap().unwrap();
        let rows = objects.get_bundle_objects("b1", "bundle-0").await.unwrap();
        assert_eq!(bundle.files, rows.len() as i64);
        assert_eq!(bundle.size, rows.iter().map(|o| o.size).sum::<i64>());
        assert_eq!(bundle.files, 20);
        assert_eq!(bundle.size, (1..=20).sum::<i64>());
    }

    #[tokio::test]
    async fn append_requires_matching_bundling_bundle() {
        let (_dir, bundles, objects) = setup().await;

        let err = objects
            .append_object(&new_object("b1", "bundle-0", "a", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::NoBundlingBundle(_)));

        bundles
            .create_bundling_bundle_if_absent(&new_bundle("b1", "bundle-0"))
            .await
            .unwrap();
        let err = objects
            .append_object(&new_object("b1", "bundle-9", "a", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::BundleNameMismatch { .. }));

        let bundle = bundles.query_bundle("b1", "bundle-0").await.unwrap().unwrap();
        assert_eq!((bundle.files, bundle.size), (0, 0));
    }

    #[tokio::test]
    async fn duplicate_object_leaves_counters_untouched() {
        let (_dir, bundles, objects) = setup().await;
        bundles
            .create_bundling_bundle_if_absent(&new_bundle("b1", "bundle-0"))
            .await
            .unwrap();
        objects
            .append_object(&new_object("b1", "bundle-0", "a", 5))
            .await
            .unwrap();

        let err = objects
            .append_object(&new_object("b1", "bundle-0", "a", 5))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::ObjectAlreadyExists { .. }));

        let bundle = bundles.query_bundle("b1", "bundle-0").await.unwrap().unwrap();
        assert_eq!((bundle.files, bundle.size), (1, 5));
    }

    #[tokio::test]
    async fn full_bundle_rejects_further_objects() {
        let (_dir, bundles, objects) = setup().await;
        let mut candidate = new_bundle("b1", "bundle-0");
        candidate.max_files = 1;
        bundles.create_bundling_bundle_if_absent(&candidate).await.unwrap();

        objects
            .append_object(&new_object("b1", "bundle-0", "a", 5))
            .await
            .unwrap();
        let err = objects
            .append_object(&new_object("b1", "bundle-0", "b", 5))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::BundleFull { .. }));
    }

    #[tokio::test]
    async fn offsets_are_written_together() {
        let (_dir, bundles, objects) = setup().await;
        bundles
            .create_bundling_bundle_if_absent(&new_bundle("b1", "bundle-0"))
            .await
            .unwrap();
        let a = objects.append_object(&new_object("b1", "bundle-0", "a", 10)).await.unwrap();
        let b = objects.append_object(&new_object("b1", "bundle-0", "b", 10)).await.unwrap();

        objects.set_offsets(&[(a.id, 0), (b.id, 10)]).await.unwrap();
        let rows = objects.get_bundle_objects("b1", "bundle-0").await.unwrap();
        let offsets: Vec<i64> = rows.iter().map(|o| o.offset_in_bundle).collect();
        assert_eq!(offsets, vec![0, 10]);
    }
}
