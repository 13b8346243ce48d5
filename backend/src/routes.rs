use axum::Router;

use crate::{admin, billing, bookings, inquiries, listings, messaging, notifications, photos};

pub fn api_routes() -> Router {
    Router::new()
        .merge(listings::routes())
        .merge(bookings::routes())
        .merge(messaging::routes())
        .merge(inquiries::routes())
        .merge(photos::routes())
        .merge(billing::routes())
        .merge(notifications::routes())
        .merge(admin::routes())
}
