//! Login, registration, and profile handlers.

use crate::auth::Principal;
use crate::error::ApiError;
use crate::routes::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// A user account. The directory is an in-memory stand-in for the platform's
/// user service; passwords are plaintext dev fixtures, not a storage scheme.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    pub password: String,
    pub role: String,
}

/// In-memory user directory keyed by username.
pub struct UserDirectory {
    users: DashMap<String, User>,
}

impl UserDirectory {
    /// Directory seeded with the development accounts.
    pub fn with_dev_users() -> Self {
        let users = DashMap::new();
        users.insert(
            "admin".to_string(),
            User {
                id: "1".to_string(),
                username: "admin".to_string(),
                password: "admin123".to_string(),
                role: "admin".to_string(),
            },
        );
        users.insert(
            "user".to_string(),
            User {
                id: "2".to_string(),
                username: "user".to_string(),
                password: "user123".to_string(),
                role: "user".to_string(),
            },
        );
        Self { users }
    }

    fn authenticate(&self, username: &str, password: &str) -> Option<User> {
        self.users
            .get(username)
            .filter(|user| user.password == password)
            .map(|user| user.clone())
    }

    fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    fn insert(&self, user: User) {
        self.users.insert(user.username.clone(), user);
    }

    fn find_by_id(&self, id: &str) -> Option<User> {
        self.users
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.clone())
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// The expiry is included so clients know when to refresh.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user_id: String,
    pub username: String,
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub message: String,
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub id: String,
    pub username: String,
    pub role: String,
}

/// POST /auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let user = state
        .users
        .authenticate(&req.username, &req.password)
        .ok_or(ApiError::Unauthorized("invalid credentials"))?;

    let (token, expires_at) = state.tokens.generate(&user.id, &user.username, &user.role)?;

    info!(
        "user login successful: username={} role={}",
        user.username, user.role
    );

    Ok(Json(LoginResponse {
        token,
        expires_at,
        user_id: user.id,
        username: user.username,
        role: user.role,
    }))
}

/// POST /auth/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    if req.username.is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest(
            "Username and password are required".to_string(),
        ));
    }
    if state.users.contains(&req.username) {
        return Err(ApiError::BadRequest(
            "Username is already taken".to_string(),
        ));
    }

    let user = User {
        id: Uuid::new_v4().to_string(),
        username: req.username,
        password: req.password,
        role: if req.role.is_empty() {
            "user".to_string()
        } else {
            req.role
        },
    };
    let user_id = user.id.clone();

    info!("user registered: username={} role={}", user.username, user.role);
    state.users.insert(user);

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "User registered successfully".to_string(),
            user_id,
        }),
    ))
}

/// GET /auth/profile — example of a protected endpoint reading the principal.
pub async fn profile(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<ProfileResponse>, ApiError> {
    let user = state
        .users
        .find_by_id(&principal.user_id)
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    Ok(Json(ProfileResponse {
        id: user.id,
        username: user.username,
        role: user.role,
    }))
}
