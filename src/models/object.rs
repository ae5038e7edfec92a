//! Represents one client file that belongs to a bundle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use std::collections::BTreeMap;

/// A constituent object of a bundle.
///
/// The row stores metadata only; the bytes live in staging storage until
/// the bundle is sealed, and inside the packed bundle afterwards.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Internal row id. Packing order follows it.
    pub id: i64,

    pub bucket: String,

    /// Name of the parent bundle.
    pub bundle_name: String,

    /// Object name, unique within its bundle.
    pub object_name: String,

    /// Address of the uploader.
    pub owner: String,

    /// Content type (MIME type) declared at upload.
    pub content_type: String,

    /// Size in bytes.
    pub size: i64,

    /// Digest algorithm of `hash`, e.g. `sha256`.
    pub hash_algo: String,

    /// Hex-encoded content digest.
    pub hash: String,

    /// Opaque user metadata.
    pub tags: Json<BTreeMap<String, String>>,

    /// Byte position of this object inside the packed bundle. Zero until
    /// the bundle has been packed.
    pub offset_in_bundle: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values for an object being appended to a Bundling bundle.
#[derive(Clone, Debug)]
pub struct NewObject {
    pub bucket: String,
    pub bundle_name: String,
    pub object_name: String,
    pub owner: String,
    pub content_type: String,
    pub size: i64,
    pub hash_algo: String,
    pub hash: String,
    pub tags: BTreeMap<String, String>,
}
