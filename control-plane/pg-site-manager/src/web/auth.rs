use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec};
use kube::{Api, Client, api::PostParams};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info};

use super::ApiError;
use crate::error::Result;

/// Resolves a bearer token to the user it authenticates.
#[async_trait]
pub trait TokenReviewer: Send + Sync {
    /// `None` when the token is not authenticated.
    async fn review(&self, token: &str) -> Result<Option<String>>;
}

pub struct KubeTokenReviewer {
    client: Client,
    audience: Option<String>,
}

impl KubeTokenReviewer {
    pub fn new(client: Client, audience: Option<String>) -> Self {
        Self {
            client,
            audience: audience.filter(|a| !a.is_empty()),
        }
    }
}

#[async_trait]
impl TokenReviewer for KubeTokenReviewer {
    async fn review(&self, token: &str) -> Result<Option<String>> {
        let api: Api<TokenReview> = Api::all(self.client.clone());
        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: self.audience.clone().map(|a| vec![a]),
            },
            ..Default::default()
        };
        let reviewed = api.create(&PostParams::default(), &review).await?;
        let Some(status) = reviewed.status else {
            return Ok(None);
        };
        if status.authenticated != Some(true) {
            return Ok(None);
        }
        Ok(status.user.and_then(|u| u.username))
    }
}

struct Session {
    reviewed_at: Instant,
    user: String,
}

/// Admits callers whose token belongs to one expected principal. Successful
/// reviews are remembered per token for the session timeout; the lock is not
/// held while a review is in flight.
pub struct AuthGate {
    reviewer: Arc<dyn TokenReviewer>,
    expected_user: String,
    session_timeout: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl AuthGate {
    pub fn new(
        reviewer: Arc<dyn TokenReviewer>,
        expected_user: impl Into<String>,
        session_timeout: Duration,
    ) -> Self {
        Self {
            reviewer,
            expected_user: expected_user.into(),
            session_timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn remember(&self, token: &str, user: &str) {
        let mut sessions = self.sessions.lock().await;
        let timeout = self.session_timeout;
        sessions.retain(|_, s| s.reviewed_at.elapsed() <= timeout);
        sessions.insert(
            token.to_string(),
            Session {
                reviewed_at: Instant::now(),
                user: user.to_string(),
            },
        );
    }

    /// Checks an `Authorization` header value.
    pub async fn authorize(&self, header: Option<&str>) -> Result<bool, ApiError> {
        let Some(token) = header
            .and_then(|h| h.strip_prefix("Bearer "))
            .filter(|t| !t.is_empty())
        else {
            return Ok(false);
        };

        let sessions = self.sessions.lock().await;
        let cached = sessions
            .get(token)
            .filter(|s| s.reviewed_at.elapsed() <= self.session_timeout)
            .map(|s| s.user.clone());
        drop(sessions);

        let user = match cached {
            Some(user) => Some(user),
            None => {
                info!("Session token expired, re-authenticating");
                let user = self.reviewer.review(token).await.map_err(|e| {
                    error!(error = %e, "Token review request failed");
                    ApiError::Internal(e.to_string())
                })?;
                // Only authenticated tokens are remembered.
                if let Some(user) = &user {
                    self.remember(token, user).await;
                }
                user
            }
        };

        if user.as_deref() == Some(self.expected_user.as_str()) {
            Ok(true)
        } else {
            error!(
                expected = %self.expected_user,
                "User is unauthorized, check site-manager configuration"
            );
            Ok(false)
        }
    }
}

pub async fn require_token(
    State(gate): State<Arc<AuthGate>>,
    req: Request,
    next: Next,
) -> Response {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    match gate.authorize(header.as_deref()).await {
        Ok(true) => next.run(req).await,
        Ok(false) => ApiError::Unauthorized.into_response(),
        Err(e) => e.into_response(),
    }
}
