//! Bundle service: aggregates small client objects into bundles, submits
//! each bundle to the storage chain as one object and follows it until it
//! is sealed.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

use crate::services::{bundle_service::BundleService, staging::StagingStorage};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub service: BundleService,
    pub db: Arc<SqlitePool>,
    pub staging: Arc<dyn StagingStorage>,
}
