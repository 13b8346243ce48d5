use axum::async_trait;
use axum::{
    extract::{Extension, FromRequestParts},
    http::{request::Parts, StatusCode},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Deserialize)]
struct Claims {
    sub: Uuid,
    #[serde(default)]
    email: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

/// Identity asserted by a bearer token from the managed identity provider.
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|authz| authz.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(|s| s.trim().to_string())
            .ok_or((StatusCode::UNAUTHORIZED, "Missing token".into()))?;
        let secret = crate::config::AUTH_JWT_SECRET.as_str();
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid token".into()))?;
        Ok(AuthUser {
            user_id: decoded.claims.sub,
            email: decoded.claims.email,
        })
    }
}

/// An authenticated user listed in `admin_users`.
pub struct AdminUser {
    pub user_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let AuthUser { user_id, .. } = AuthUser::from_request_parts(parts, state).await?;
        let Extension(pool) = Extension::<PgPool>::from_request_parts(parts, state)
            .await
            .map_err(|_| {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database unavailable".to_string(),
                )
            })?;
        if is_admin(&pool, user_id).await.map_err(|e| {
            tracing::error!(?e, "DB error checking admin membership");
            (StatusCode::INTERNAL_SERVER_ERROR, "database error".to_string())
        })? {
            Ok(AdminUser { user_id })
        } else {
            Err((StatusCode::FORBIDDEN, "Admin access required".into()))
        }
    }
}

pub async fn is_admin(pool: &PgPool, user_id: Uuid) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM admin_users WHERE user_id = $1)")
        .bind(user_id)
        .fetch_one(pool)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::Request, RequestPartsExt};
    use jsonwebtoken::{encode, EncodingKey, Header};

    #[tokio::test]
    async fn token_parsed_from_header() {
        let user_id = Uuid::new_v4();
        let claims = serde_json::json!({
            "sub": user_id,
            "email": "owner@example.com",
            "aud": "authenticated",
            "exp": 9999999999u64,
        });
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        std::env::set_var("AUTH_JWT_SECRET", "secret");
        let request = Request::builder()
            .header("Authorization", format!("Bearer {}", token))
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        let user = parts.extract::<AuthUser>().await.unwrap();
        assert_eq!(user.user_id, user_id);
        assert_eq!(user.email.as_deref(), Some("owner@example.com"));
    }

    #[tokio::test]
    async fn invalid_token_rejected() {
        std::env::set_var("AUTH_JWT_SECRET", "secret");
        let request = Request::builder()
            .header("Authorization", "Bearer invalid")
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        let res = AuthUser::from_request_parts(&mut parts, &()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn missing_header_rejected() {
        let request = Request::builder().body(axum::body::Body::empty()).unwrap();
        let mut parts = request.into_parts().0;
        let (status, _) = AuthUser::from_request_parts(&mut parts, &())
            .await
            .err()
            .unwrap();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
