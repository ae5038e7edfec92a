//! Bundle rules: per (owner, bucket) thresholds, falling back to defaults.

use crate::models::bundle_rule::{BundlePolicy, BundleRule};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;

pub const MAX_BUNDLE_FILES: i64 = 10_000;
pub const MAX_BUNDLE_SIZE: i64 = 2 * 1024 * 1024 * 1024;
pub const MAX_FINALIZE_TIME: i64 = 60 * 60 * 24 * 7;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("max files must be between 1 and {max}, got {0}", max = MAX_BUNDLE_FILES)]
    InvalidMaxFiles(i64),
    #[error("max size must be between 1 and {max} bytes, got {0}", max = MAX_BUNDLE_SIZE)]
    InvalidMaxSize(i64),
    #[error("max finalize time must be between 1 and {max} seconds, got {0}", max = MAX_FINALIZE_TIME)]
    InvalidMaxFinalizeTime(i64),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct BundleRuleStore {
    db: Arc<SqlitePool>,
    defaults: BundlePolicy,
}

impl BundleRuleStore {
    pub fn new(db: Arc<SqlitePool>, defaults: BundlePolicy) -> Self {
        Self { db, defaults }
    }

    pub async fn get(&self, owner: &str, bucket: &str) -> Result<Option<BundleRule>, RuleError> {
        Ok(sqlx::query_as::<_, BundleRule>(
            "SELECT id, owner, bucket, max_files, max_size, max_finalize_time, created_at, updated_at
             FROM bundle_rules WHERE owner = ? AND bucket = ?",
        )
        .bind(owner)
        .bind(bucket)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Thresholds for a new bundle: the stored rule, or the defaults.
    pub async fn resolve(&self, owner: &str, bucket: &str) -> Result<BundlePolicy, RuleError> {
        Ok(self
            .get(owner, bucket)
            .await?
            .map_or(self.defaults, |rule| BundlePolicy::from(&rule)))
    }

    /// Create or replace the rule for `(owner, bucket)`. Only bundles
    /// created afterwards see the new values.
    pub async fn set(&self, owner: &str, bucket: &str, policy: BundlePolicy) -> Result<BundleRule, RuleError> {
        validate(&policy)?;
        let now = Utc::now();
        Ok(sqlx::query_as::<_, BundleRule>(
            "INSERT INTO bundle_rules (owner, bucket, max_files, max_size, max_finalize_time, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(owner, bucket) DO UPDATE SET
                max_files = excluded.max_files,
                max_size = excluded.max_size,
                max_finalize_time = excluded.max_finalize_time,
                updated_at = excluded.updated_at
             RETURNING id, owner, bucket, max_files, max_size, max_finalize_time, created_at, updated_at",
        )
        .bind(owner)
        .bind(bucket)
        .bind(policy.max_files)
        .bind(policy.max_size)
        .bind(policy.max_finalize_time)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?)
    }
}

/// Reject thresholds outside the supported limits.
pub(crate) fn validate(policy: &BundlePolicy) -> Result<(), RuleError> {
    if !(1..=MAX_BUNDLE_FILES).contains(&policy.max_files) {
        return Err(RuleError::InvalidMaxFiles(policy.max_files));
    }
    if !(1..=MAX_BUNDLE_SIZE).contains(&policy.max_size) {
        return Err(RuleError::InvalidMaxSize(policy.max_size));
    }
    if !(1..=MAX_FINALIZE_TIME).contains(&policy.max_finalize_time) {
        return Err(RuleError::InvalidMaxFinalizeTime(policy.max_finalize_time));
    }
    Ok(())
}
