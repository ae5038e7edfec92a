//! Defines the HTTP surface of the bundle service.
//!
//! ## Structure
//! - **Health** (mounted at root)
//!   - `GET  /healthz`, `GET /readyz`
//!
//! - **Bundles** (under `/v1`)
//!   - `POST /uploadObject`: raw body, metadata in `X-Bundle-*` headers
//!   - `POST /createBundle`, `POST /finalizeBundle`, `POST /deleteBundle`
//!   - `GET  /queryBundle/{bucket}/{bundle}`
//!   - `GET  /queryBundlingBundle/{bucket}`
//!   - `GET  /view/{bucket}/{bundle}/{*object}`
//!   - `GET  /download/{bucket}/{bundle}/{*object}`
//!
//! - **Rules and accounts** (under `/v1`)
//!   - `POST /setBundleRule`, `GET /queryBundleRule/{owner}/{bucket}`
//!   - `GET  /bundlerAccount/{user}`
//!
//! The wildcard `*object` allows nested names like `photos/2025/img.jpg`.

use crate::{
    AppState,
    handlers::{
        bundle_handlers::{
            bundler_account, create_bundle, delete_bundle, finalize_bundle, query_bundle,
            query_bundling_bundle,
        },
        health_handlers::{healthz, readyz},
        object_handlers::{download_object, upload_object, view_object},
        rule_handlers::{query_bundle_rule, set_bundle_rule},
    },
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router. Handlers share `AppState`.
pub fn routes() -> Router<AppState> {
    let v1 = Router::new()
        .route("/uploadObject", post(upload_object))
        .route("/createBundle", post(create_bundle))
        .route("/finalizeBundle", post(finalize_bundle))
        .route("/deleteBundle", post(delete_bundle))
        .route("/queryBundle/{bucket}/{bundle}", get(query_bundle))
        .route("/queryBundlingBundle/{bucket}", get(query_bundling_bundle))
        .route("/view/{bucket}/{bundle}/{*object}", get(view_object))
        .route("/download/{bucket}/{bundle}/{*object}", get(download_object))
        .route("/setBundleRule", post(set_bundle_rule))
        .route("/queryBundleRule/{owner}/{bucket}", get(query_bundle_rule))
        .route("/bundlerAccount/{user}", get(bundler_account));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest("/v1", v1)
}
