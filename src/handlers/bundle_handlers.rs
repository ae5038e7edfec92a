//! HTTP handlers for bundle management and bundler account lookup.

use crate::{
    AppState,
    errors::AppError,
    models::{bundle::Bundle, bundler_account::UserBundlerAccount},
};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct CreateBundleReq {
    pub owner: String,
    pub bucket_name: String,
    /// Defaults to `bundle-<nonce>`.
    pub bundle_name: Option<String>,
}

/// Body of finalize and delete requests.
#[derive(Debug, Deserialize)]
pub struct BundleRef {
    pub owner: String,
    pub bucket_name: String,
    pub bundle_name: String,
}

/// `POST /v1/createBundle`
pub async fn create_bundle(
    State(state): State<AppState>,
    Json(req): Json<CreateBundleReq>,
) -> Result<Json<Bundle>, AppError> {
    let bundle = state
        .service
        .create_bundle(&req.owner, &req.bucket_name, req.bundle_name)
        .await?;
    Ok(Json(bundle))
}

/// `POST /v1/finalizeBundle`
pub async fn finalize_bundle(
    State(state): State<AppState>,
    Json(req): Json<BundleRef>,
) -> Result<Json<Bundle>, AppError> {
    let bundle = state
        .service
        .finalize_bundle(&req.owner, &req.bucket_name, &req.bundle_name)
        .await?;
    Ok(Json(bundle))
}

/// `POST /v1/deleteBundle`
pub async fn delete_bundle(
    State(state): State<AppState>,
    Json(req): Json<BundleRef>,
) -> Result<Json<Bundle>, AppError> {
    let bundle = state
        .service
        .delete_bundle(&req.owner, &req.bucket_name, &req.bundle_name)
        .await?;
    Ok(Json(bundle))
}

/// `GET /v1/queryBundle/{bucket}/{bundle}`
pub async fn query_bundle(
    State(state): State<AppState>,
    Path((bucket, bundle)): Path<(String, String)>,
) -> Result<Json<Bundle>, AppError> {
    Ok(Json(state.service.query_bundle(&bucket, &bundle).await?))
}

/// `GET /v1/queryBundlingBundle/{bucket}`
pub async fn query_bundling_bundle(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<Json<Bundle>, AppError> {
    Ok(Json(state.service.query_bundling_bundle(&bucket).await?))
}

/// `GET /v1/bundlerAccount/{user}`
pub async fn bundler_account(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Json<UserBundlerAccount>, AppError> {
    Ok(Json(
        state.service.get_or_create_user_bundler_account(&user).await?,
    ))
}
