//! src/services/bundle_repo.rs
//!
//! BundleRepository: transactional access to bundle rows. Every status
//! change is a conditional update (`... WHERE status = <expected>`), so only
//! the worker that observed the current status can move a bundle forward,
//! even with several orchestrator processes sharing one database.

use crate::{
    db::{WriteTx, is_unique_violation},
    models::bundle::{Bundle, BundleStatus, NewBundle},
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;

pub(crate) const BUNDLE_COLUMNS: &str = "id, owner, bucket, name, bundler_account, status, files, size, \
     max_files, max_size, max_finalize_time, nonce, object_id, tx_hash, retry_counter, \
     err_message, created_at, updated_at";

pub(crate) const OBJECT_COLUMNS: &str = "id, bucket, bundle_name, object_name, owner, content_type, \
     size, hash_algo, hash, tags, offset_in_bundle, created_at, updated_at";

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("bucket `{0}` already has a bundling bundle")]
    BundlingBundleExists(String),
    #[error("bundle `{name}` already exists in bucket `{bucket}`")]
    BundleAlreadyExists { bucket: String, name: String },
    #[error("bundle `{name}` not found in bucket `{bucket}`")]
    BundleNotFound { bucket: String, name: String },
    #[error("bucket `{0}` has no bundling bundle")]
    NoBundlingBundle(String),
    #[error("object declares bundle `{declared}` but the bundling bundle is `{bundling}`")]
    BundleNameMismatch { declared: String, bundling: String },
    #[error("bundle `{name}` in bucket `{bucket}` is full and waiting to be finalized")]
    BundleFull { bucket: String, name: String },
    #[error("object `{object}` already exists in bundle `{bundle}` of bucket `{bucket}`")]
    ObjectAlreadyExists {
        bucket: String,
        bundle: String,
        object: String,
    },
    #[error("bundle `{name}` in bucket `{bucket}` is {status:?}")]
    InvalidStatus {
        bucket: String,
        name: String,
        status: BundleStatus,
    },
    #[error("bundle {id} is no longer {expected:?}")]
    TransitionConflict { id: i64, expected: BundleStatus },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Clone)]
pub struct BundleRepository {
    db: Arc<SqlitePool>,
}

impl BundleRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert `candidate` as the bucket's Bundling bundle.
    ///
    /// This is the only place a Bundling bundle is created. The count and
    /// the insert run under the writer lock, so of any number of concurrent
    /// callers for one bucket exactly one succeeds; the others get
    /// [`RepoError::BundlingBundleExists`].
    pub async fn create_bundling_bundle_if_absent(&self, candidate: &NewBundle) -> RepoResult<Bundle> {
        let mut tx = WriteTx::begin(&self.db).await?;

        let bundling: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM bundles WHERE bucket = ? AND status = ?")
                .bind(&candidate.bucket)
                .bind(BundleStatus::Bundling)
                .fetch_one(tx.conn())
                .await?;
        if bundling > 0 {
            tx.rollback().await?;
            return Err(RepoError::BundlingBundleExists(candidate.bucket.clone()));
        }

        let now = Utc::now();
        let sql = format!(
            "INSERT INTO bundles (
                owner, bucket, name, bundler_account, status, files, size,
                max_files, max_size, max_finalize_time, nonce,
                retry_counter, err_message, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 0, 0, ?, ?, ?, ?, 0, '', ?, ?)
            RETURNING {BUNDLE_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, Bundle>(&sql)
            .bind(&candidate.owner)
            .bind(&candidate.bucket)
            .bind(&candidate.name)
            .bind(&candidate.bundler_account)
            .bind(BundleStatus::Bundling)
            .bind(candidate.max_files)
            .bind(candidate.max_size)
            .bind(candidate.max_finalize_time)
            .bind(candidate.nonce)
            .bind(now)
            .bind(now)
            .fetch_one(tx.conn())
            .await;

        match inserted {
            Ok(bundle) => {
                tx.commit().await?;
                Ok(bundle)
            }
            Err(err) if is_unique_violation(&err) => {
                tx.rollback().await?;
                Err(RepoError::BundleAlreadyExists {
                    bucket: candidate.bucket.clone(),
                    name: candidate.name.clone(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn query_bundle(&self, bucket: &str, name: &str) -> RepoResult<Option<Bundle>> {
        let sql = format!("SELECT {BUNDLE_COLUMNS} FROM bundles WHERE bucket = ? AND name = ?");
        Ok(sqlx::query_as::<_, Bundle>(&sql)
            .bind(bucket)
            .bind(name)
            .fetch_optional(&*self.db)
            .await?)
    }

    pub async fn get_bundling_bundle(&self, bucket: &str) -> RepoResult<Option<Bundle>> {
        let sql = format!("SELECT {BUNDLE_COLUMNS} FROM bundles WHERE bucket = ? AND status = ?");
        Ok(sqlx::query_as::<_, Bundle>(&sql)
            .bind(bucket)
            .bind(BundleStatus::Bundling)
            .fetch_optional(&*self.db)
            .await?)
    }

    /// The bucket's bundle with the highest nonce, if any.
    pub async fn query_bundle_with_max_nonce(&self, bucket: &str) -> RepoResult<Option<Bundle>> {
        let sql = format!(
            "SELECT {BUNDLE_COLUMNS} FROM bundles WHERE bucket = ? ORDER BY nonce DESC LIMIT 1"
        );
        Ok(sqlx::query_as::<_, Bundle>(&sql)
            .bind(bucket)
            .fetch_optional(&*self.db)
            .await?)
    }

    /// Nonce for the bucket's next bundle. Not reserved: two callers may
    /// read the same value, and the loser fails on the name or the
    /// Bundling check when inserting.
    pub async fn next_nonce(&self, bucket: &str) -> RepoResult<i64> {
        Ok(self
            .query_bundle_with_max_nonce(bucket)
            .await?
            .map_or(0, |bundle| bundle.nonce + 1))
    }

    pub async fn get_bundling_bundles(&self) -> RepoResult<Vec<Bundle>> {
        let sql = format!("SELECT {BUNDLE_COLUMNS} FROM bundles WHERE status = ? ORDER BY id");
        Ok(sqlx::query_as::<_, Bundle>(&sql)
            .bind(BundleStatus::Bundling)
            .fetch_all(&*self.db)
            .await?)
    }

    pub async fn get_finalized_bundles_by_account(&self, account: &str) -> RepoResult<Vec<Bundle>> {
        self.list_by_status_and_account(BundleStatus::Finalized, account)
            .await
    }

    pub async fn get_created_on_chain_bundles_by_account(
        &self,
        account: &str,
    ) -> RepoResult<Vec<Bundle>> {
        self.list_by_status_and_account(BundleStatus::CreatedOnChain, account)
            .await
    }

    /// Served by `idx_bundles_status_account`.
    async fn list_by_status_and_account(
        &self,
        status: BundleStatus,
        account: &str,
    ) -> RepoResult<Vec<Bundle>> {
        let sql = format!(
            "SELECT {BUNDLE_COLUMNS} FROM bundles
             WHERE status = ? AND bundler_account = ?
             ORDER BY id"
        );
        Ok(sqlx::query_as::<_, Bundle>(&sql)
            .bind(status)
            .bind(account)
            .fetch_all(&*self.db)
            .await?)
    }

    /// Close a Bundling bundle: Finalized, or Expired when it holds no
    /// objects. The expire update also requires `files = 0`, so an object
    /// appended after `bundle` was read can never be expired away.
    pub async fn close_bundling(&self, bundle: &Bundle) -> RepoResult<BundleStatus> {
        let target = bundle.closing_status();
        let sql = match target {
            BundleStatus::Expired => {
                "UPDATE bundles SET status = ?, updated_at = ?
                 WHERE id = ? AND status = ? AND files = 0"
            }
            _ => "UPDATE bundles SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        };
        let result = sqlx::query(sql)
            .bind(target)
            .bind(Utc::now())
            .bind(bundle.id)
            .bind(BundleStatus::Bundling)
            .execute(&*self.db)
            .await?;
        expect_one(result.rows_affected(), bundle.id, BundleStatus::Bundling)?;
        Ok(target)
    }

    /// Finalized → CreatedOnChain, clearing the retry state.
    pub async fn mark_created_on_chain(&self, id: i64, tx_hash: &str, object_id: i64) -> RepoResult<()> {
        let result = sqlx::query(
            "UPDATE bundles
             SET status = ?, tx_hash = ?, object_id = ?, retry_counter = 0, err_message = '', updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(BundleStatus::CreatedOnChain)
        .bind(tx_hash)
        .bind(object_id)
        .bind(Utc::now())
        .bind(id)
        .bind(BundleStatus::Finalized)
        .execute(&*self.db)
        .await?;
        expect_one(result.rows_affected(), id, BundleStatus::Finalized)
    }

    /// CreatedOnChain → SealedOnChain.
    pub async fn mark_sealed(&self, id: i64) -> RepoResult<()> {
        let result = sqlx::query(
            "UPDATE bundles
             SET status = ?, retry_counter = 0, err_message = '', updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(BundleStatus::SealedOnChain)
        .bind(Utc::now())
        .bind(id)
        .bind(BundleStatus::CreatedOnChain)
        .execute(&*self.db)
        .await?;
        expect_one(result.rows_affected(), id, BundleStatus::CreatedOnChain)
    }

    /// CreatedOnChain → Finalized after the chain object was cancelled. The
    /// chain linkage is dropped and the retry state reset, so the submit
    /// loop picks the bundle up again at the fastest retry interval.
    pub async fn reopen_for_resubmission(&self, id: i64) -> RepoResult<()> {
        let result = sqlx::query(
            "UPDATE bundles
             SET status = ?, tx_hash = NULL, object_id = NULL, retry_counter = 0, err_message = '', updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(BundleStatus::Finalized)
        .bind(Utc::now())
        .bind(id)
        .bind(BundleStatus::CreatedOnChain)
        .execute(&*self.db)
        .await?;
        expect_one(result.rows_affected(), id, BundleStatus::CreatedOnChain)
    }

    /// Count a failed attempt without changing status.
    pub async fn record_failure(&self, id: i64, status: BundleStatus, message: &str) -> RepoResult<()> {
        let result = sqlx::query(
            "UPDATE bundles
             SET retry_counter = retry_counter + 1, err_message = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(message)
        .bind(Utc::now())
        .bind(id)
        .bind(status)
        .execute(&*self.db)
        .await?;
        expect_one(result.rows_affected(), id, status)
    }

    /// Mark a Finalized or CreatedOnChain bundle Deleted and drop its object
    /// rows in the same transaction. Returns the bundle as it was before.
    pub async fn delete_bundle(&self, bucket: &str, name: &str) -> RepoResult<Bundle> {
        let mut tx = WriteTx::begin(&self.db).await?;

        let sql = format!("SELECT {BUNDLE_COLUMNS} FROM bundles WHERE bucket = ? AND name = ?");
        let found = sqlx::query_as::<_, Bundle>(&sql)
            .bind(bucket)
            .bind(name)
            .fetch_optional(tx.conn())
            .await?;
        let Some(bundle) = found else {
            tx.rollback().await?;
            return Err(RepoError::BundleNotFound {
                bucket: bucket.to_string(),
                name: name.to_string(),
            });
        };
        if !bundle.status.is_deletable() {
            tx.rollback().await?;
            return Err(RepoError::InvalidStatus {
                bucket: bucket.to_string(),
                name: name.to_string(),
                status: bundle.status,
            });
        }

        sqlx::query("UPDATE bundles SET status = ?, updated_at = ? WHERE id = ?")
            .bind(BundleStatus::Deleted)
            .bind(Utc::now())
            .bind(bundle.id)
            .execute(tx.conn())
            .await?;
        sqlx::query("DELETE FROM objects WHERE bucket = ? AND bundle_name = ?")
            .bind(bucket)
            .bind(name)
            .execute(tx.conn())
            .await?;

        tx.commit().await?;
        Ok(bundle)
    }
}

fn expect_one(rows_affected: u64, id: i64, expected: BundleStatus) -> RepoResult<()> {
    if rows_affected == 1 {
        Ok(())
    } else {
        Err(RepoError::TransitionConflict { id, expected })
    }
}

#[cfg(test)]
pub(crate) fn new_bundle(bucket: &str, name: &str) -> NewBundle {
    NewBundle {
        owner: "0xowner".into(),
        bucket: bucket.into(),
        name: name.into(),
        bundler_account: "0xbundler".into(),
        max_files: 10,
        max_size: 1 << 20,
        max_finalize_time: 3600,
        nonce: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::temp_db;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_admit_exactly_one_bundling_bundle() {
        let (_dir, db) = temp_db().await;
        let repo = BundleRepository::new(Arc::new(db));

        let mut handles = Vec::new();
        for i in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let mut candidate = new_bundle("b1", &format!("bundle-{i}"));
                candidate.nonce = i;
                repo.create_bundling_bundle_if_absent(&candidate).await
            }));
        }

        let mut created = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(RepoError::BundlingBundleExists(bucket)) => {
                    assert_eq!(bucket, "b1");
                    rejected += 1;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(rejected, 7);
        assert_eq!(repo.get_bundling_bundles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected_once_the_first_bundle_closed() {
        let (_dir, db) = temp_db().await;
        let repo = BundleRepository::new(Arc::new(db));

        let first = repo
            .create_bundling_bundle_if_absent(&new_bundle("b1", "bundle-0"))
            .await
            .unwrap();
        sqlx::query("UPDATE bundles SET files = 1 WHERE id = ?")
            .bind(first.id)
            .execute(&*repo.db)
            .await
            .unwrap();
        let first = repo.query_bundle("b1", "bundle-0").await.unwrap().unwrap();
        assert_eq!(repo.close_bundling(&first).await.unwrap(), BundleStatus::Finalized);

        let err = repo
            .create_bundling_bundle_if_absent(&new_bundle("b1", "bundle-0"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::BundleAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn next_nonce_follows_the_highest_nonce() {
        let (_dir, db) = temp_db().await;
        let repo = BundleRepository::new(Arc::new(db));
        assert_eq!(repo.next_nonce("b1").await.unwrap(), 0);

        let mut candidate = new_bundle("b1", "bundle-4");
        candidate.nonce = 4;
        repo.create_bundling_bundle_if_absent(&candidate).await.unwrap();
        assert_eq!(repo.next_nonce("b1").await.unwrap(), 5);
        assert_eq!(repo.next_nonce("b2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transitions_are_conditional_on_the_current_status() {
        let (_dir, db) = temp_db().await;
        let repo = BundleRepository::new(Arc::new(db));
        let bundle = repo
            .create_bundling_bundle_if_absent(&new_bundle("b1", "bundle-0"))
            .await
            .unwrap();

        // Still Bundling: the submit-side transition must not apply.
        let err = repo.mark_created_on_chain(bundle.id, "0xtx", 7).await.unwrap_err();
        assert!(matches!(
            err,
            RepoError::TransitionConflict { expected: BundleStatus::Finalized, .. }
        ));

        assert_eq!(repo.close_bundling(&bundle).await.unwrap(), BundleStatus::Expired);
        let err = repo.close_bundling(&bundle).await.unwrap_err();
        assert!(matches!(err, RepoError::TransitionConflict { .. }));
    }

    #[tokio::test]
    async fn expiry_does_not_apply_once_an_object_arrived() {
        let (_dir, db) = temp_db().await;
        let repo = BundleRepository::new(Arc::new(db));
        let stale = repo
            .create_bundling_bundle_if_absent(&new_bundle("b1", "bundle-0"))
            .await
            .unwrap();
        sqlx::query("UPDATE bundles SET files = 1, size = 3 WHERE id = ?")
            .bind(stale.id)
            .execute(&*repo.db)
            .await
            .unwrap();

        let err = repo.close_bundling(&stale).await.unwrap_err();
        assert!(matches!(err, RepoError::TransitionConflict { .. }));
        let current = repo.query_bundle("b1", "bundle-0").await.unwrap().unwrap();
        assert_eq!(current.status, BundleStatus::Bundling);
    }

    #[tokio::test]
    async fn failure_bookkeeping_and_resubmission() {
        let (_dir, db) = temp_db().await;
        let repo = BundleRepository::new(Arc::new(db));
        let bundle = repo
            .create_bundling_bundle_if_absent(&new_bundle("b1", "bundle-0"))
            .await
            .unwrap();
        sqlx::query("UPDATE bundles SET status = ?, files = 1 WHERE id = ?")
            .bind(BundleStatus::Finalized)
            .bind(bundle.id)
            .execute(&*repo.db)
            .await
            .unwrap();

        repo.record_failure(bundle.id, BundleStatus::Finalized, "boom")
            .await
            .unwrap();
        let failed = repo.query_bundle("b1", "bundle-0").await.unwrap().unwrap();
        assert_eq!(failed.retry_counter, 1);
        assert_eq!(failed.err_message, "boom");

        repo.mark_created_on_chain(bundle.id, "0xtx", 42).await.unwrap();
        let created = repo.query_bundle("b1", "bundle-0").await.unwrap().unwrap();
        assert_eq!(created.status, BundleStatus::CreatedOnChain);
        assert_eq!(created.retry_counter, 0);
        assert_eq!(created.err_message, "");
        assert_eq!(created.object_id, Some(42));

        repo.reopen_for_resubmission(bundle.id).await.unwrap();
        let reopened = repo.query_bundle("b1", "bundle-0").await.unwrap().unwrap();
        assert_eq!(reopened.status, BundleStatus::Finalized);
        assert_eq!(reopened.object_id, None);
        assert_eq!(
            repo.get_finalized_bundles_by_account("0xbundler")
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn delete_requires_a_closed_unsealed_bundle() {
        let (_dir, db) = temp_db().await;
        let repo = BundleRepository::new(Arc::new(db));
        let bundle = repo
            .create_bundling_bundle_if_absent(&new_bundle("b1", "bundle-0"))
            .await
            .unwrap();

        let err = repo.delete_bundle("b1", "bundle-0").await.unwrap_err();
        assert!(matches!(
            err,
            RepoError::InvalidStatus { status: BundleStatus::Bundling, .. }
        ));

        sqlx::query("UPDATE bundles SET status = ? WHERE id = ?")
            .bind(BundleStatus::Finalized)
            .bind(bundle.id)
            .execute(&*repo.db)
            .await
            .unwrap();
        repo.delete_bundle("b1", "bundle-0").await.unwrap();
        let deleted = repo.query_bundle("b1", "bundle-0").await.unwrap().unwrap();
        assert_eq!(deleted.status, BundleStatus::Deleted);

        let err = repo.delete_bundle("b1", "missing").await.unwrap_err();
        assert!(matches!(err, RepoError::BundleNotFound { .. }));
    }
}
