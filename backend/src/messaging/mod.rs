//! Conversations between care seekers and providers, with live delivery over
//! server-sent events.

use std::convert::Infallible;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{future, stream, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Row};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::validation;

pub mod hub;
pub mod thread;

pub use hub::MessageHub;
pub use thread::MessageThread;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub care_seeker_id: Uuid,
    pub business_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub unread_count: i64,
}

pub fn routes() -> Router {
    Router::new()
        .route(
            "/api/conversations",
            get(list_conversations).post(start_conversation),
        )
        .route(
            "/api/conversations/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/api/conversations/:id/read", post(mark_read))
        .route("/api/conversations/:id/stream", get(stream_messages))
}

const SUMMARY_QUERY: &str = r#"
    SELECT c.id, c.provider_id, c.care_seeker_id, p.business_name, c.created_at, c.updated_at,
        (SELECT COUNT(*) FROM messages m
            WHERE m.conversation_id = c.id AND m.sender_id <> $1 AND m.read_at IS NULL) AS unread_count
    FROM conversations c
    JOIN providers p ON p.id = c.provider_id
"#;

pub async fn list_conversations(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
) -> AppResult<Json<Vec<ConversationSummary>>> {
    let query = format!(
        "{SUMMARY_QUERY} WHERE c.care_seeker_id = $1 OR p.owner_id = $1 ORDER BY c.updated_at DESC"
    );
    let conversations = sqlx::query_as::<_, ConversationSummary>(&query)
        .bind(user_id)
        .fetch_all(&pool)
        .await
        .map_err(|e| {
            error!(?e, "DB error listing conversations");
            AppError::Db(e)
        })?;
    Ok(Json(conversations))
}

#[derive(Debug, Deserialize)]
pub struct StartConversation {
    pub provider_id: Uuid,
}

/// Opens the conversation between the caller and a provider, reusing the
/// existing one for the same pair.
pub async fn start_conversation(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, email }: AuthUser,
    Json(payload): Json<StartConversation>,
) -> AppResult<(StatusCode, Json<ConversationSummary>)> {
    let owner: Option<Uuid> =
        sqlx::query_scalar("SELECT owner_id FROM providers WHERE id = $1 AND is_active = TRUE")
            .bind(payload.provider_id)
            .fetch_optional(&pool)
            .await
            .map_err(|e| {
                error!(?e, "DB error looking up provider");
                AppError::Db(e)
            })?;
    match owner {
        None => return Err(AppError::NotFound),
        Some(owner) if owner == user_id => {
            return Err(AppError::BadRequest(
                "providers cannot message their own listing".into(),
            ))
        }
        Some(_) => {}
    }

    let mut tx = pool.begin().await?;
    sqlx::query("INSERT INTO care_seekers (id, email) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING")
        .bind(user_id)
        .bind(email.as_deref())
        .execute(&mut tx)
        .await?;
    let row = sqlx::query(
        r#"
        INSERT INTO conversations (provider_id, care_seeker_id)
        VALUES ($1, $2)
        ON CONFLICT (provider_id, care_seeker_id) DO UPDATE SET updated_at = conversations.updated_at
        RETURNING id, (xmax = 0) AS created
        "#,
    )
    .bind(payload.provider_id)
    .bind(user_id)
    .fetch_one(&mut tx)
    .await
    .map_err(|e| {
        error!(?e, "DB error opening conversation");
        AppError::Db(e)
    })?;
    tx.commit().await?;

    let conversation_id: Uuid = row.try_get("id")?;
    let created: bool = row.try_get("created")?;
    let summary = sqlx::query_as::<_, ConversationSummary>(&format!("{SUMMARY_QUERY} WHERE c.id = $2"))
        .bind(user_id)
        .bind(conversation_id)
        .fetch_one(&pool)
        .await?;
    if created {
        info!(%conversation_id, provider_id = %payload.provider_id, "conversation started");
    }
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(summary)))
}

/// Fails with `NotFound` unless the caller is the care seeker or the owner of
/// the provider in the conversation.
async fn ensure_participant(pool: &PgPool, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
    let row = sqlx::query(
        "SELECT c.care_seeker_id, p.owner_id FROM conversations c \
         JOIN providers p ON p.id = c.provider_id WHERE c.id = $1",
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        error!(?e, "DB error loading conversation");
        AppError::Db(e)
    })?
    .ok_or(AppError::NotFound)?;
    let care_seeker_id: Uuid = row.try_get("care_seeker_id")?;
    let owner_id: Uuid = row.try_get("owner_id")?;
    if user_id == care_seeker_id || user_id == owner_id {
        Ok(())
    } else {
        Err(AppError::NotFound)
    }
}

async fn load_messages(pool: &PgPool, conversation_id: Uuid) -> AppResult<Vec<Message>> {
    sqlx::query_as::<_, Message>(
        "SELECT id, conversation_id, sender_id, body, created_at, read_at FROM messages \
         WHERE conversation_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await
    .map_err(|e| {
        error!(?e, "DB error loading messages");
        AppError::Db(e)
    })
}

pub async fn list_messages(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<Vec<Message>>> {
    ensure_participant(&pool, conversation_id, user_id).await?;
    Ok(Json(load_messages(&pool, conversation_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct SendMessage {
    pub body: String,
}

pub async fn send_message(
    Extension(pool): Extension<PgPool>,
    Extension(hub): Extension<MessageHub>,
    AuthUser { user_id, .. }: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(payload): Json<SendMessage>,
) -> AppResult<(StatusCode, Json<Message>)> {
    let body = validation::required("body", &payload.body)?;
    ensure_participant(&pool, conversation_id, user_id).await?;

    let mut tx = pool.begin().await?;
    let message = sqlx::query_as::<_, Message>(
        "INSERT INTO messages (conversation_id, sender_id, body) VALUES ($1, $2, $3) \
         RETURNING id, conversation_id, sender_id, body, created_at, read_at",
    )
    .bind(conversation_id)
    .bind(user_id)
    .bind(body)
    .fetch_one(&mut tx)
    .await
    .map_err(|e| {
        error!(?e, "DB error storing message");
        AppError::Db(e)
    })?;
    sqlx::query("UPDATE conversations SET updated_at = NOW() WHERE id = $1")
        .bind(conversation_id)
        .execute(&mut tx)
        .await?;
    tx.commit().await?;

    let listeners = hub.publish(&message);
    debug!(%conversation_id, message_id = %message.id, listeners, "message published");
    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadReceipt {
    pub updated: u64,
}

/// Marks everything the other party sent as read.
pub async fn mark_read(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<ReadReceipt>> {
    ensure_participant(&pool, conversation_id, user_id).await?;
    let result = sqlx::query(
        "UPDATE messages SET read_at = NOW() \
         WHERE conversation_id = $1 AND sender_id <> $2 AND read_at IS NULL",
    )
    .bind(conversation_id)
    .bind(user_id)
    .execute(&pool)
    .await
    .map_err(|e| {
        error!(?e, "DB error marking messages read");
        AppError::Db(e)
    })?;
    Ok(Json(ReadReceipt {
        updated: result.rows_affected(),
    }))
}

/// Streams the stored backlog followed by live messages. The live channel is
/// subscribed before the backlog query so nothing sent in between is lost;
/// live pushes already in the backlog are skipped by id.
pub async fn stream_messages(
    Extension(pool): Extension<PgPool>,
    Extension(hub): Extension<MessageHub>,
    AuthUser { user_id, .. }: AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>> {
    ensure_participant(&pool, conversation_id, user_id).await?;
    let rx = hub.subscribe(conversation_id);
    let mut thread = MessageThread::new();
    thread.extend(load_messages(&pool, conversation_id).await?);
    let (backlog, mut overlap) = thread.into_parts();

    let live = BroadcastStream::new(rx)
        .filter_map(|res| async move { res.ok() })
        .filter(move |message| future::ready(!overlap.remove(&message.id)));
    let stream = stream::iter(backlog)
        .chain(live)
        .filter_map(|message| async move {
            match serde_json::to_string(&message) {
                Ok(data) => Some(Ok(Event::default().event("message").data(data))),
                Err(e) => {
                    tracing::error!(?e, "message serialization failed");
                    None
                }
            }
        });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
