use crate::{AppState, errors::AppError, models::bundle_rule::BundlePolicy};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct SetBundleRuleReq {
    pub owner: String,
    pub bucket_name: String,
    pub max_files: i64,
    pub max_size: i64,
    /// Seconds.
    pub max_finalize_time: i64,
}

#[derive(Debug, Serialize)]
pub struct BundleRuleResponse {
    pub owner: String,
    pub bucket_name: String,
    #[serde(flatten)]
    pub policy: BundlePolicy,
}

/// `POST /v1/setBundleRule`
pub async fn set_bundle_rule(
    State(state): State<AppState>,
    Json(req): Json<SetBundleRuleReq>,
) -> Result<Json<BundleRuleResponse>, AppError> {
    let policy = BundlePolicy {
        max_files: req.max_files,
        max_size: req.max_size,
        max_finalize_time: req.max_finalize_time,
    };
    let rule = state
        .service
        .set_bundle_rule(&req.owner, &req.bucket_name, policy)
        .await?;
    Ok(Json(BundleRuleResponse {
        policy: BundlePolicy::from(&rule),
        owner: rule.owner,
        bucket_name: rule.bucket,
    }))
}

/// `GET /v1/queryBundleRule/{owner}/{bucket}`: the stored rule, or the
/// defaults when none is stored.
pub async fn query_bundle_rule(
    State(state): State<AppState>,
    Path((owner, bucket)): Path<(String, String)>,
) -> Result<Json<BundleRuleResponse>, AppError> {
    let policy = state.service.query_bundle_rule(&owner, &bucket).await?;
    Ok(Json(BundleRuleResponse {
        owner,
        bucket_name: bucket,
        policy,
    }))
}
