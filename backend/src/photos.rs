use axum::{
    extract::{Extension, Path},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{error, info};
use url::Url;
use uuid::Uuid;

use crate::config::{PHOTO_BUCKET, STORAGE_PUBLIC_BASE_URL};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::listings::ensure_owner;

pub const ALLOWED_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "gif"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhotoError {
    #[error("file has no extension")]
    MissingExtension,
    #[error("unsupported image type `{0}`")]
    UnsupportedExtension(String),
    #[error("object path `{0}` does not follow <provider>/<timestamp>.<ext>")]
    MalformedPath(String),
    #[error("object belongs to another provider")]
    ForeignProvider,
    #[error("invalid storage base url: {0}")]
    BaseUrl(#[from] url::ParseError),
    #[error("storage base url cannot carry a path")]
    OpaqueBaseUrl,
}

impl From<PhotoError> for AppError {
    fn from(err: PhotoError) -> Self {
        match err {
            PhotoError::BaseUrl(_) | PhotoError::OpaqueBaseUrl => AppError::Message(err.to_string()),
            other => AppError::BadRequest(other.to_string()),
        }
    }
}

/// Lower-cased extension of `file_name`, if it is an accepted image type.
pub fn image_extension(file_name: &str) -> Result<String, PhotoError> {
    let (_, ext) = file_name
        .rsplit_once('.')
        .filter(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
        .ok_or(PhotoError::MissingExtension)?;
    let ext = ext.to_ascii_lowercase();
    if ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        Ok(ext)
    } else {
        Err(PhotoError::UnsupportedExtension(ext))
    }
}

/// Storage key for a new upload: `{provider_id}/{timestamp_millis}.{ext}`.
pub fn object_path(provider_id: Uuid, timestamp_millis: i64, file_name: &str) -> Result<String, PhotoError> {
    let ext = image_extension(file_name)?;
    Ok(format!("{provider_id}/{timestamp_millis}.{ext}"))
}

/// Checks that `path` is a key issued for `provider_id`.
pub fn validate_object_path(provider_id: Uuid, path: &str) -> Result<(), PhotoError> {
    let malformed = || PhotoError::MalformedPath(path.to_string());
    let (owner, file) = path.split_once('/').ok_or_else(malformed)?;
    let owner: Uuid = owner.parse().map_err(|_| malformed())?;
    let (stamp, _) = file.split_once('.').ok_or_else(malformed)?;
    if stamp.is_empty() || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    image_extension(file)?;
    if owner != provider_id {
        return Err(PhotoError::ForeignProvider);
    }
    Ok(())
}

/// `{base}/{bucket}/{path}` with each segment percent-encoded.
pub fn public_url(base: &str, bucket: &str, path: &str) -> Result<Url, PhotoError> {
    let mut url = Url::parse(base)?;
    url.path_segments_mut()
        .map_err(|_| PhotoError::OpaqueBaseUrl)?
        .pop_if_empty()
        .push(bucket)
        .extend(path.split('/'));
    Ok(url)
}

pub fn routes() -> Router {
    Router::new()
        .route("/api/providers/:id/photos/upload-path", post(request_upload_path))
        .route(
            "/api/providers/:id/photos",
            post(register_photo).delete(remove_photo),
        )
}

#[derive(Debug, Deserialize)]
pub struct UploadPathRequest {
    pub file_name: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadTarget {
    pub bucket: String,
    pub path: String,
    pub public_url: String,
}

pub async fn request_upload_path(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Path(provider_id): Path<Uuid>,
    Json(payload): Json<UploadPathRequest>,
) -> AppResult<Json<UploadTarget>> {
    ensure_owner(&pool, provider_id, user_id).await?;
    let path = object_path(provider_id, Utc::now().timestamp_millis(), &payload.file_name)?;
    let url = public_url(&STORAGE_PUBLIC_BASE_URL, &PHOTO_BUCKET, &path)?;
    Ok(Json(UploadTarget {
        bucket: PHOTO_BUCKET.clone(),
        path,
        public_url: url.into(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RegisterPhoto {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhotoList {
    pub photo_urls: Vec<String>,
}

pub async fn register_photo(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Path(provider_id): Path<Uuid>,
    Json(payload): Json<RegisterPhoto>,
) -> AppResult<Json<PhotoList>> {
    ensure_owner(&pool, provider_id, user_id).await?;
    validate_object_path(provider_id, &payload.path)?;
    let url: String = public_url(&STORAGE_PUBLIC_BASE_URL, &PHOTO_BUCKET, &payload.path)?.into();
    let photo_urls: Vec<String> = sqlx::query_scalar(
        r#"
        UPDATE providers SET
            photo_urls = CASE WHEN $2 = ANY(photo_urls) THEN photo_urls ELSE array_append(photo_urls, $2) END,
            updated_at = NOW()
        WHERE id = $1
        RETURNING photo_urls
        "#,
    )
    .bind(provider_id)
    .bind(&url)
    .fetch_one(&pool)
    .await
    .map_err(|e| {
        error!(?e, "DB error registering photo");
        AppError::Db(e)
    })?;
    info!(%provider_id, path = %payload.path, "provider photo registered");
    Ok(Json(PhotoList { photo_urls }))
}

#[derive(Debug, Deserialize)]
pub struct RemovePhoto {
    pub url: String,
}

pub async fn remove_photo(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Path(provider_id): Path<Uuid>,
    Json(payload): Json<RemovePhoto>,
) -> AppResult<Json<PhotoList>> {
    ensure_owner(&pool, provider_id, user_id).await?;
    let photo_urls: Vec<String> = sqlx::query_scalar(
        "UPDATE providers SET photo_urls = array_remove(photo_urls, $2), updated_at = NOW() \
         WHERE id = $1 RETURNING photo_urls",
    )
    .bind(provider_id)
    .bind(&payload.url)
    .fetch_one(&pool)
    .await
    .map_err(|e| {
        error!(?e, "DB error removing photo");
        AppError::Db(e)
    })?;
    info!(%provider_id, "provider photo removed");
    Ok(Json(PhotoList { photo_urls }))
}
