use std::{fmt, str::FromStr};

use anyhow::anyhow;
use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::listings::ensure_owner;
use crate::notifications::{OutgoingEmail, SharedMailer};
use crate::validation::{self, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }

    /// Cancelled and completed bookings are final.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            other => Err(anyhow!("unknown booking status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Booking {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub care_seeker_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub requested_date: NaiveDate,
    pub requested_time: Option<String>,
    pub notes: Option<String>,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
}

const BOOKING_COLUMNS: &str = r#"
    id,
    provider_id,
    care_seeker_name,
    email,
    phone,
    requested_date,
    requested_time,
    notes,
    status,
    created_at
"#;

fn map_booking(row: &PgRow) -> Result<Booking, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(Booking {
        id: row.try_get("id")?,
        provider_id: row.try_get("provider_id")?,
        care_seeker_name: row.try_get("care_seeker_name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        requested_date: row.try_get("requested_date")?,
        requested_time: row.try_get("requested_time")?,
        notes: row.try_get("notes")?,
        status: status
            .parse()
            .map_err(|err: anyhow::Error| sqlx::Error::Decode(err.into()))?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewBooking {
    pub provider_id: Uuid,
    pub care_seeker_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub requested_date: NaiveDate,
    #[serde(default)]
    pub requested_time: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewBooking {
    pub fn validate(&self, today: NaiveDate) -> Result<(), ValidationError> {
        validation::required("care_seeker_name", &self.care_seeker_name)?;
        let email = validation::required("email", &self.email)?;
        validation::email("email", email)?;
        validation::optional_phone("phone", self.phone.as_deref())?;
        validation::not_in_past("requested_date", self.requested_date, today)
    }
}

pub fn routes() -> Router {
    Router::new()
        .route("/api/bookings", post(create_booking))
        .route("/api/bookings/:id", get(get_booking))
        .route("/api/bookings/:id/status", patch(update_booking_status))
        .route("/api/providers/:id/bookings", get(list_provider_bookings))
}

pub async fn create_booking(
    Extension(pool): Extension<PgPool>,
    Extension(mailer): Extension<SharedMailer>,
    Json(payload): Json<NewBooking>,
) -> AppResult<(StatusCode, Json<Booking>)> {
    payload.validate(Utc::now().date_naive())?;

    let business_name: Option<String> = sqlx::query_scalar(
        "SELECT business_name FROM providers WHERE id = $1 AND is_active = TRUE",
    )
    .bind(payload.provider_id)
    .fetch_optional(&pool)
    .await
    .map_err(|e| {
        error!(?e, "DB error looking up booking provider");
        AppError::Db(e)
    })?;
    let Some(business_name) = business_name else {
        return Err(AppError::BadRequest("provider does not exist".into()));
    };

    let query = format!(
        r#"
        INSERT INTO bookings
            (provider_id, care_seeker_name, email, phone, requested_date, requested_time, notes, status)
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
        RETURNING {BOOKING_COLUMNS}
        "#
    );
    let row = sqlx::query(&query)
        .bind(payload.provider_id)
        .bind(payload.care_seeker_name.trim())
        .bind(payload.email.trim())
        .bind(payload.phone.as_deref().map(str::trim).filter(|v| !v.is_empty()))
        .bind(payload.requested_date)
        .bind(payload.requested_time.as_deref())
        .bind(payload.notes.as_deref())
        .fetch_one(&pool)
        .await
        .map_err(|e| {
            error!(?e, "DB error creating booking");
            AppError::Db(e)
        })?;
    let booking = map_booking(&row)?;
    info!(booking_id = %booking.id, provider_id = %booking.provider_id, "booking created");

    let email = confirmation_email(&booking, &business_name);
    if let Err(err) = mailer.send(&email).await {
        warn!(?err, booking_id = %booking.id, "booking confirmation email failed");
    }
    Ok((StatusCode::CREATED, Json(booking)))
}

pub fn confirmation_email(booking: &Booking, business_name: &str) -> OutgoingEmail {
    let time = booking
        .requested_time
        .as_deref()
        .map(|t| format!(" at {t}"))
        .unwrap_or_default();
    OutgoingEmail {
        to: booking.email.clone(),
        subject: format!("Your visit request with {business_name}"),
        text: format!(
            "Hi {name},\n\nWe received your request to visit {business_name} on {date}{time}. \
             The provider will confirm shortly.\n\nConfirmation number: {id}\n",
            name = booking.care_seeker_name,
            date = booking.requested_date.format("%B %-d, %Y"),
            id = booking.id,
        ),
    }
}

pub async fn get_booking(
    Extension(pool): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Booking>> {
    let query = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1");
    let row = sqlx::query(&query)
        .bind(id)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            error!(?e, "DB error fetching booking");
            AppError::Db(e)
        })?;
    let row = row.ok_or(AppError::NotFound)?;
    Ok(Json(map_booking(&row)?))
}

pub async fn list_provider_bookings(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Path(provider_id): Path<Uuid>,
) -> AppResult<Json<Vec<Booking>>> {
    ensure_owner(&pool, provider_id, user_id).await?;
    let query = format!(
        "SELECT {BOOKING_COLUMNS} FROM bookings WHERE provider_id = $1 \
         ORDER BY requested_date ASC, created_at ASC"
    );
    let rows = sqlx::query(&query)
        .bind(provider_id)
        .fetch_all(&pool)
        .await
        .map_err(|e| {
            error!(?e, "DB error listing bookings");
            AppError::Db(e)
        })?;
    let bookings = rows
        .iter()
        .map(map_booking)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(bookings))
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: BookingStatus,
}

pub async fn update_booking_status(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<StatusUpdate>,
) -> AppResult<Json<Booking>> {
    let current = sqlx::query("SELECT provider_id, status FROM bookings WHERE id = $1")
        .bind(id)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            error!(?e, "DB error fetching booking");
            AppError::Db(e)
        })?
        .ok_or(AppError::NotFound)?;
    let provider_id: Uuid = current.try_get("provider_id")?;
    ensure_owner(&pool, provider_id, user_id).await?;

    let status: String = current.try_get("status")?;
    let status: BookingStatus = status.parse()?;
    if !status.can_transition_to(payload.status) {
        return Err(AppError::BadRequest(format!(
            "cannot move booking from {status} to {}",
            payload.status
        )));
    }

    let query = format!(
        "UPDATE bookings SET status = $2, updated_at = NOW() WHERE id = $1 AND status = $3 \
         RETURNING {BOOKING_COLUMNS}"
    );
    let row = sqlx::query(&query)
        .bind(id)
        .bind(payload.status.as_str())
        .bind(status.as_str())
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            error!(?e, "DB error updating booking status");
            AppError::Db(e)
        })?
        // lost a race with another status change
        .ok_or_else(|| AppError::BadRequest("booking status changed concurrently".into()))?;
    let booking = map_booking(&row)?;
    info!(booking_id = %id, from = %status, to = %booking.status, "booking status updated");
    Ok(Json(booking))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
    }

    fn request() -> NewBooking {
        NewBooking {
            provider_id: Uuid::new_v4(),
            care_seeker_name: "Jordan Lee".into(),
            email: "jordan@example.com".into(),
            phone: Some("(612) 555-0142".into()),
            requested_date: today(),
            requested_time: Some("10:30".into()),
            notes: None,
        }
    }

    #[test]
    fn accepts_today_and_rejects_past() {
        assert!(request().validate(today()).is_ok());
        let mut past = request();
        past.requested_date = today().pred_opt().unwrap();
        assert_eq!(
            past.validate(today()),
            Err(ValidationError::PastDate("requested_date"))
        );
    }

    #[test]
    fn rejects_blank_name_and_bad_contact() {
        let mut blank = request();
        blank.care_seeker_name = "   ".into();
        assert_eq!(
            blank.validate(today()),
            Err(ValidationError::Required("care_seeker_name"))
        );

        let mut bad_email = request();
        bad_email.email = "jordan.example.com".into();
        assert_eq!(bad_email.validate(today()), Err(ValidationError::Email("email")));

        let mut bad_phone = request();
        bad_phone.phone = Some("555-01".into());
        assert_eq!(bad_phone.validate(today()), Err(ValidationError::Phone("phone")));
    }

    #[test]
    fn status_transitions() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!Completed.can_transition_to(Cancelled));
        assert_eq!("confirmed".parse::<BookingStatus>().unwrap(), Confirmed);
        assert!("rescheduled".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn confirmation_email_mentions_visit() {
        let booking = Booking {
            id: Uuid::nil(),
            provider_id: Uuid::new_v4(),
            care_seeker_name: "Jordan Lee".into(),
            email: "jordan@example.com".into(),
            phone: None,
            requested_date: today(),
            requested_time: Some("10:30".into()),
            notes: None,
            status: BookingStatus::Pending,
            created_at: Utc::now(),
        };
        let email = confirmation_email(&booking, "Maple Grove Adult Day");
        assert_eq!(email.to, "jordan@example.com");
        assert_eq!(email.subject, "Your visit request with Maple Grove Adult Day");
        assert!(email.text.contains("March 10, 2026 at 10:30"));
        assert!(email.text.contains(&Uuid::nil().to_string()));
    }
}
