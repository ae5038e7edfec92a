//! Bundler accounts (chain signers) and the user → bundler mapping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One signer of the bundler pool.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BundlerAccount {
    pub id: i64,
    pub account_address: String,
    /// 0 = active. Kept for future account retirement.
    pub status: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted assignment of a user to a bundler account. Once written it is
/// never recomputed, so growing the pool does not move existing users.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UserBundlerAccount {
    pub id: i64,
    pub user_address: String,
    pub bundler_address: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
