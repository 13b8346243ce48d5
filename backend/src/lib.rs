pub mod admin;
pub mod billing;
pub mod bookings;
pub mod config;
pub mod db;
pub mod error;
pub mod extractor;
pub mod inquiries;
pub mod listings;
pub mod messaging;
pub mod notifications;
pub mod photos;
pub mod routes;
pub mod validation;

pub async fn root() -> &'static str {
    "Care Marketplace API"
}
