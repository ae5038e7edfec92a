//! HTTP handlers for object uploads and reads.
//! Object bodies are streamed in and out; the service decides where the
//! bytes come from (staging or the chain).

use crate::{
    AppState,
    errors::AppError,
    models::object::Object,
    services::bundle_service::{UploadObject, parse_tags},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use serde::Serialize;
use std::io;
use tokio_util::io::ReaderStream;

pub const OWNER_HEADER: &str = "x-bundle-owner";
pub const BUCKET_HEADER: &str = "x-bundle-bucket-name";
pub const FILE_NAME_HEADER: &str = "x-bundle-file-name";
pub const CONTENT_TYPE_HEADER: &str = "x-bundle-content-type";
pub const SHA256_HEADER: &str = "x-bundle-file-sha256";
pub const TAGS_HEADER: &str = "x-bundle-tags";

#[derive(Debug, Serialize)]
pub struct UploadObjectResponse {
    pub bundle_name: String,
    pub object_name: String,
    pub size: i64,
}

fn required_header(headers: &HeaderMap, name: &'static str) -> Result<String, AppError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::bad_request(format!("missing or invalid header `{}`", name)))
}

fn optional_header(headers: &HeaderMap, name: &'static str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `POST /v1/uploadObject`: raw body, metadata in `X-Bundle-*` headers.
pub async fn upload_object(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let tags = parse_tags(&optional_header(&headers, TAGS_HEADER).unwrap_or_default())?;
    let request = UploadObject {
        owner: required_header(&headers, OWNER_HEADER)?,
        bucket: required_header(&headers, BUCKET_HEADER)?,
        object_name: required_header(&headers, FILE_NAME_HEADER)?,
        content_type: optional_header(&headers, CONTENT_TYPE_HEADER)
            .unwrap_or_else(|| "application/octet-stream".into()),
        sha256: required_header(&headers, SHA256_HEADER)?,
        tags,
    };

    let stream = body.into_data_stream().map_err(io::Error::other);

    let object = state.service.upload_object(request, Box::pin(stream)).await?;

    Ok((
        StatusCode::OK,
        Json(UploadObjectResponse {
            bundle_name: object.bundle_name,
            object_name: object.object_name,
            size: object.size,
        }),
    ))
}

/// `GET /v1/view/{bucket}/{bundle}/{*object}`, inline.
pub async fn view_object(
    State(state): State<AppState>,
    Path((bucket, bundle, object)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    serve_object(&state, &bucket, &bundle, &object, HeaderValue::from_static("inline")).await
}

/// `GET /v1/download/{bucket}/{bundle}/{*object}`, as an attachment.
pub async fn download_object(
    State(state): State<AppState>,
    Path((bucket, bundle, object)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    let file_name = object.rsplit('/').next().unwrap_or(&object).replace('"', "");
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file_name))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    serve_object(&state, &bucket, &bundle, &object, disposition).await
}

async fn serve_object(
    state: &AppState,
    bucket: &str,
    bundle: &str,
    object: &str,
    disposition: HeaderValue,
) -> Result<Response, AppError> {
    let content = state.service.get_object(bucket, bundle, object).await?;
    let body = Body::from_stream(ReaderStream::new(content.body));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &content.object);
    response
        .headers_mut()
        .insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &Object) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&meta.size.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    if let Ok(value) = HeaderValue::from_str(&meta.hash) {
        headers.insert(HeaderName::from_static(SHA256_HEADER), value);
    }

    headers.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&meta.created_at.to_rfc2822())
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
}
