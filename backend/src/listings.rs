use std::cmp::Ordering;

use axum::{
    extract::{Extension, Path, Query},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::error;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::validation;

const EARTH_RADIUS_MILES: f64 = 3958.8;

const LISTING_COLUMNS: &str = r#"
    id,
    owner_id,
    business_name,
    description,
    license_number,
    email,
    phone,
    address,
    city,
    state,
    zip_code,
    latitude,
    longitude,
    service_types,
    waiver_types,
    capacity,
    photo_urls,
    created_at
"#;

/// key: listings-model -> public facility profile
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ProviderListing {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub business_name: String,
    pub description: Option<String>,
    pub license_number: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub service_types: Vec<String>,
    pub waiver_types: Vec<String>,
    pub capacity: Option<i32>,
    pub photo_urls: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Distance,
    Name,
    Newest,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    pub service_type: Option<String>,
    pub waiver: Option<String>,
    pub city: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub max_distance_miles: Option<f64>,
    pub sort: Option<SortOrder>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RankedListing {
    #[serde(flatten)]
    pub provider: ProviderListing,
    pub distance_miles: Option<f64>,
}

pub fn routes() -> Router {
    Router::new()
        .route("/api/providers/search", get(search_providers))
        .route(
            "/api/providers/:id",
            get(get_provider).patch(update_provider),
        )
}

/// Great-circle distance in miles.
pub fn haversine_miles(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_MILES * a.sqrt().atan2((1.0 - a).sqrt())
}

fn contains_ignore_case(values: &[String], wanted: &str) -> bool {
    values.iter().any(|value| value.eq_ignore_ascii_case(wanted))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Applies the search filters and orders the result.
///
/// Providers lacking coordinates get no distance; they are dropped only when a
/// maximum distance is requested and sort last when ordering by distance.
pub fn filter_and_rank(providers: Vec<ProviderListing>, params: &SearchParams) -> Vec<RankedListing> {
    let origin = params.lat.zip(params.lng);
    let service_type = non_empty(&params.service_type);
    let waiver = non_empty(&params.waiver);
    let city = non_empty(&params.city).map(str::to_lowercase);

    let mut ranked: Vec<RankedListing> = providers
        .into_iter()
        .filter(|p| service_type.map_or(true, |wanted| contains_ignore_case(&p.service_types, wanted)))
        .filter(|p| waiver.map_or(true, |wanted| contains_ignore_case(&p.waiver_types, wanted)))
        .filter(|p| {
            city.as_deref().map_or(true, |wanted| {
                p.city
                    .as_deref()
                    .map_or(false, |c| c.to_lowercase().contains(wanted))
            })
        })
        .map(|provider| {
            let distance_miles = match (origin, provider.latitude.zip(provider.longitude)) {
                (Some((lat, lng)), Some((plat, plng))) => Some(haversine_miles(lat, lng, plat, plng)),
                _ => None,
            };
            RankedListing {
                provider,
                distance_miles,
            }
        })
        .filter(|listing| match (params.max_distance_miles, origin) {
            (Some(max), Some(_)) => listing.distance_miles.map_or(false, |d| d <= max),
            _ => true,
        })
        .collect();

    let sort = params.sort.unwrap_or(if origin.is_some() {
        SortOrder::Distance
    } else {
        SortOrder::Name
    });
    match sort {
        SortOrder::Distance => ranked.sort_by(|a, b| match (a.distance_miles, b.distance_miles) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => by_name(a, b),
        }),
        SortOrder::Name => ranked.sort_by(by_name),
        SortOrder::Newest => ranked.sort_by(|a, b| b.provider.created_at.cmp(&a.provider.created_at)),
    }
    ranked
}

fn by_name(a: &RankedListing, b: &RankedListing) -> Ordering {
    a.provider
        .business_name
        .to_lowercase()
        .cmp(&b.provider.business_name.to_lowercase())
}

pub async fn search_providers(
    Extension(pool): Extension<PgPool>,
    Query(params): Query<SearchParams>,
) -> AppResult<Json<Vec<RankedListing>>> {
    if let (Some(lat), Some(lng)) = (params.lat, params.lng) {
        validation::coordinates(lat, lng)?;
    }
    let query = format!(
        "SELECT {LISTING_COLUMNS} FROM providers \
         WHERE is_active = TRUE AND subscription_status IN ('trial', 'active')"
    );
    let providers = sqlx::query_as::<_, ProviderListing>(&query)
        .fetch_all(&pool)
        .await
        .map_err(|e| {
            error!(?e, "DB error listing providers");
            AppError::Db(e)
        })?;
    Ok(Json(filter_and_rank(providers, &params)))
}

pub async fn get_provider(
    Extension(pool): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ProviderListing>> {
    let query = format!(
        "SELECT {LISTING_COLUMNS} FROM providers \
         WHERE id = $1 AND is_active = TRUE AND subscription_status IN ('trial', 'active')"
    );
    let provider = sqlx::query_as::<_, ProviderListing>(&query)
        .bind(id)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            error!(?e, "DB error fetching provider");
            AppError::Db(e)
        })?;
    provider.map(Json).ok_or(AppError::NotFound)
}

/// Fails with `NotFound` for unknown providers and `Forbidden` when the
/// caller does not own the listing.
pub async fn ensure_owner(pool: &PgPool, provider_id: Uuid, user_id: Uuid) -> AppResult<()> {
    let owner: Option<Uuid> = sqlx::query_scalar("SELECT owner_id FROM providers WHERE id = $1")
        .bind(provider_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| {
            error!(?e, "DB error verifying provider ownership");
            AppError::Db(e)
        })?;
    match owner {
        None => Err(AppError::NotFound),
        Some(owner) if owner == user_id => Ok(()),
        Some(_) => Err(AppError::Forbidden),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateProfile {
    pub business_name: Option<String>,
    pub description: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub service_types: Option<Vec<String>>,
    pub waiver_types: Option<Vec<String>>,
    pub capacity: Option<i32>,
}

impl UpdateProfile {
    pub fn validate(&self) -> Result<(), validation::ValidationError> {
        if let Some(name) = &self.business_name {
            validation::required("business_name", name)?;
        }
        if let Some(email) = &self.email {
            validation::email("email", email)?;
        }
        validation::optional_phone("phone", self.phone.as_deref())?;
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => validation::coordinates(lat, lng)?,
            (None, None) => {}
            _ => {
                return Err(validation::ValidationError::Required(
                    if self.latitude.is_none() {
                        "latitude"
                    } else {
                        "longitude"
                    },
                ))
            }
        }
        if let Some(capacity) = self.capacity {
            if capacity < 0 {
                return Err(validation::ValidationError::Range {
                    field: "capacity",
                    reason: "must not be negative".into(),
                });
            }
        }
        Ok(())
    }
}

pub async fn update_provider(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateProfile>,
) -> AppResult<Json<ProviderListing>> {
    payload.validate()?;
    let query = format!(
        r#"
        UPDATE providers SET
            business_name = COALESCE($3, business_name),
            description = COALESCE($4, description),
            email = COALESCE($5, email),
            phone = COALESCE($6, phone),
            address = COALESCE($7, address),
            city = COALESCE($8, city),
            state = COALESCE($9, state),
            zip_code = COALESCE($10, zip_code),
            latitude = COALESCE($11, latitude),
            longitude = COALESCE($12, longitude),
            service_types = COALESCE($13, service_types),
            waiver_types = COALESCE($14, waiver_types),
            capacity = COALESCE($15, capacity),
            updated_at = NOW()
        WHERE id = $1 AND owner_id = $2
        RETURNING {LISTING_COLUMNS}
        "#
    );
    let updated = sqlx::query_as::<_, ProviderListing>(&query)
        .bind(id)
        .bind(user_id)
        .bind(payload.business_name.as_deref().map(str::trim))
        .bind(payload.description.as_deref())
        .bind(payload.email.as_deref().map(str::trim))
        .bind(payload.phone.as_deref())
        .bind(payload.address.as_deref())
        .bind(payload.city.as_deref())
        .bind(payload.state.as_deref())
        .bind(payload.zip_code.as_deref())
        .bind(payload.latitude)
        .bind(payload.longitude)
        .bind(payload.service_types.clone())
        .bind(payload.waiver_types.clone())
        .bind(payload.capacity)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            error!(?e, "DB error updating provider profile");
            AppError::Db(e)
        })?;
    updated.map(Json).ok_or(AppError::NotFound)
}
