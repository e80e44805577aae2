//! Consumer side of the listening address: a router lookup, an awaitable
//! readiness check and an axum middleware that holds requests until a
//! worker is listening.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::sync::watch;

use crate::protocol::ListeningAddress;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no worker became ready within {0:?}")]
    Timeout(Duration),

    #[error("supervisor is gone")]
    SupervisorGone,
}

impl RoutingError {
    pub fn status_code(&self) -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "WORKER_NOT_READY",
            Self::SupervisorGone => "SUPERVISOR_GONE",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

impl IntoResponse for RoutingError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}

#[derive(Clone)]
pub struct Routing {
    address: watch::Receiver<Option<ListeningAddress>>,
    ready_timeout: Option<Duration>,
}

impl Routing {
    pub fn new(address: watch::Receiver<Option<ListeningAddress>>) -> Self {
        Self {
            address,
            ready_timeout: None,
        }
    }

    /// Bound how long [`Routing::ready`] waits. `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Current address; `None` while no worker is listening.
    pub fn router(&self) -> Option<ListeningAddress> {
        self.address.borrow().clone()
    }

    /// Resolves as soon as a worker is listening, immediately if one already is.
    pub async fn ready(&self) -> Result<ListeningAddress, RoutingError> {
        match self.ready_timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait())
                .await
                .map_err(|_| RoutingError::Timeout(limit))?,
            None => self.wait().await,
        }
    }

    async fn wait(&self) -> Result<ListeningAddress, RoutingError> {
        let mut rx = self.address.clone();
        let address = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RoutingError::SupervisorGone)?;
        address.clone().ok_or(RoutingError::SupervisorGone)
    }
}

/// axum 미들웨어: 워커가 listening 상태가 될 때까지 요청을 보류
///
/// The resolved [`ListeningAddress`] is stored in the request extensions for
/// the proxying handler.
pub async fn gate(
    State(routing): State<Routing>,
    mut req: Request,
    next: Next,
) -> Result<Response, RoutingError> {
    let address = routing.ready().await.map_err(|e| {
        tracing::warn!("Rejecting {} {}: {}", req.method(), req.uri(), e);
        e
    })?;
    req.extensions_mut().insert(address);
    Ok(next.run(req).await)
}
