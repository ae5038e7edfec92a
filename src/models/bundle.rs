//! Represents a bundle, one container of many small objects that is
//! submitted to the chain as a single object.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a bundle.
///
/// ```text
/// Bundling -> Finalized | Expired
/// Finalized -> CreatedOnChain | Deleted
/// CreatedOnChain -> SealedOnChain | Finalized (after cancel) | Deleted
/// ```
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    Bundling = 0,
    Finalized = 1,
    CreatedOnChain = 2,
    SealedOnChain = 3,
    Expired = 4,
    Deleted = 5,
}

impl BundleStatus {
    /// Whether an explicit delete may move a bundle out of this state.
    pub fn is_deletable(self) -> bool {
        matches!(self, Self::Finalized | Self::CreatedOnChain)
    }
}

/// A bundle row.
///
/// The policy fields are a snapshot taken when the bundle was created and
/// never change afterwards, even if the bucket's rule is edited.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bundle {
    /// Internal row id.
    pub id: i64,

    /// Address of the user whose uploads started this bundle.
    pub owner: String,

    /// Chain bucket the bundle will be written into.
    pub bucket: String,

    /// Bundle name, unique per bucket. Also the chain object name.
    pub name: String,

    /// Bundler account whose loops submit this bundle.
    pub bundler_account: String,

    pub status: BundleStatus,

    /// Number of objects appended so far.
    pub files: i64,

    /// Total payload bytes appended so far.
    pub size: i64,

    pub max_files: i64,
    pub max_size: i64,

    /// Seconds after `created_at` at which the bundle closes on its own.
    pub max_finalize_time: i64,

    /// Per-bucket sequence number, used for `bundle-<nonce>` names.
    pub nonce: i64,

    /// Chain-side object id, known once the bundle is created on chain.
    pub object_id: Option<i64>,

    /// Hash of the create transaction.
    pub tx_hash: Option<String>,

    /// Consecutive failed attempts at the current step.
    pub retry_counter: i64,

    /// Last failure, empty after a successful step.
    pub err_message: String,

    pub created_at: DateTime<Utc>,

    /// Bumped on every write to the row.
    pub updated_at: DateTime<Utc>,
}

impl Bundle {
    /// Whether any of the size, count or age thresholds has been reached.
    pub fn thresholds_met(&self, now: DateTime<Utc>) -> bool {
        self.size >= self.max_size
            || self.files >= self.max_files
            || now - self.created_at >= Duration::seconds(self.max_finalize_time)
    }

    /// Whether another object may still be appended.
    pub fn has_capacity(&self) -> bool {
        self.files < self.max_files && self.size < self.max_size
    }

    /// State a Bundling bundle moves to when closed: empty bundles expire
    /// instead of costing a chain transaction.
    pub fn closing_status(&self) -> BundleStatus {
        if self.files == 0 {
            BundleStatus::Expired
        } else {
            BundleStatus::Finalized
        }
    }
}

/// Values for a new Bundling bundle. The repository fills in status,
/// counters and timestamps.
#[derive(Clone, Debug)]
pub struct NewBundle {
    pub owner: String,
    pub bucket: String,
    pub name: String,
    pub bundler_account: String,
    pub max_files: i64,
    pub max_size: i64,
    pub max_finalize_time: i64,
    pub nonce: i64,
}

#[cfg(test)]
pub(crate) fn sample_bundle() -> Bundle {
    let now = Utc::now();
    Bundle {
        id: 1,
        owner: "0xowner".into(),
        bucket: "b1".into(),
        name: "bundle-0".into(),
        bundler_account: "0xbundler".into(),
        status: BundleStatus::Bundling,
        files: 0,
        size: 0,
        max_files: 2,
        max_size: 1024,
        max_finalize_time: 60,
        nonce: 0,
        object_id: None,
        tx_hash: None,
        retry_counter: 0,
        err_message: String::new(),
        created_at: now,
        updated_at: now,
    }
}
