//! Per (owner, bucket) bundling thresholds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Stored override of the default thresholds.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BundleRule {
    pub id: i64,
    pub owner: String,
    pub bucket: String,
    pub max_files: i64,
    pub max_size: i64,
    /// Seconds.
    pub max_finalize_time: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The thresholds a new bundle is created with.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct BundlePolicy {
    pub max_files: i64,
    pub max_size: i64,
    pub max_finalize_time: i64,
}

impl Default for BundlePolicy {
    fn default() -> Self {
        Self {
            max_files: 100,
            max_size: 1024 * 1024 * 1024,
            max_finalize_time: 60 * 60 * 24,
        }
    }
}

impl From<&BundleRule> for BundlePolicy {
    fn from(rule: &BundleRule) -> Self {
        Self {
            max_files: rule.max_files,
            max_size: rule.max_size,
            max_finalize_time: rule.max_finalize_time,
        }
    }
}
