//! HTTP transport: JSON requests plus a server-sent-events notification stream.
//!
//! | Route                             | Operation                        |
//! |-----------------------------------|----------------------------------|
//! | `POST /clients/{id}/reference`    | add a reference                  |
//! | `DELETE /clients/{id}/reference`  | release a reference              |
//! | `PUT /clients/{id}/options`       | `{"update_interval": ms}`        |
//! | `GET /clients/{id}/events`        | notifications, closing = gone    |
//! | `GET /status`, `GET /position`    | current state                    |
//! | `GET /health`                     | liveness and cache counters      |
//!
//! A client may hold several event streams at once. It counts as gone only
//! when the last of them closes.

use axum::{
    Json, Router,
    extract::{FromRef, Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::{get, post, put},
};
use cellfix_common::{Notification, PositionReport, SubscriberOptions};
use futures::Stream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::service::ProviderHandle;

impl IntoResponse for ProviderError {
    fn into_response(self) -> Response {
        let status = match self {
            ProviderError::NotSubscribed(_) => StatusCode::FORBIDDEN,
            ProviderError::ServiceStopped => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
struct AppState {
    handle: ProviderHandle,
    streams: OpenStreams,
}

impl FromRef<AppState> for ProviderHandle {
    fn from_ref(state: &AppState) -> Self {
        state.handle.clone()
    }
}

/// Open event streams per client id
#[derive(Clone, Default)]
struct OpenStreams(Arc<Mutex<HashMap<String, usize>>>);

impl OpenStreams {
    fn open(&self, caller: &str) -> usize {
        let mut streams = self.0.lock().unwrap_or_else(|e| e.into_inner());
        let count = streams.entry(caller.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Returns the number of streams `caller` still has open
    fn close(&self, caller: &str) -> usize {
        let mut streams = self.0.lock().unwrap_or_else(|e| e.into_inner());
        let Some(count) = streams.get_mut(caller) else {
            return 0;
        };
        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            streams.remove(caller);
        }
        remaining
    }
}

pub fn router(handle: ProviderHandle) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/position", get(get_position))
        .route("/clients/{id}/reference", post(add_reference).delete(remove_reference))
        .route("/clients/{id}/options", put(set_options))
        .route("/clients/{id}/events", get(events))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState {
            handle,
            streams: OpenStreams::default(),
        })
}

async fn health_check(State(handle): State<ProviderHandle>) -> Result<impl IntoResponse, ProviderError> {
    let cache = handle.cache_statistics().await?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "cache": cache,
    })))
}

async fn get_status(State(handle): State<ProviderHandle>) -> Result<impl IntoResponse, ProviderError> {
    let status = handle.status().await?;
    Ok(Json(serde_json::json!({
        "status": status,
        "code": status as i32,
    })))
}

async fn get_position(State(handle): State<ProviderHandle>) -> Result<Json<PositionReport>, ProviderError> {
    Ok(Json(handle.position().await?))
}

async fn add_reference(
    State(handle): State<ProviderHandle>,
    Path(id): Path<String>,
) -> Result<StatusCode, ProviderError> {
    handle.add_reference(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_reference(
    State(handle): State<ProviderHandle>,
    Path(id): Path<String>,
) -> Result<StatusCode, ProviderError> {
    handle.remove_reference(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_options(
    State(handle): State<ProviderHandle>,
    Path(id): Path<String>,
    Json(options): Json<SubscriberOptions>,
) -> Result<StatusCode, ProviderError> {
    handle.set_options(&id, options).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Reports the subscriber as gone when its last event stream is dropped
struct DisconnectGuard {
    handle: ProviderHandle,
    streams: OpenStreams,
    caller: String,
}

impl DisconnectGuard {
    fn new(handle: ProviderHandle, streams: OpenStreams, caller: String) -> Self {
        let open = streams.open(&caller);
        debug!("Event stream of {} opened ({} open)", caller, open);
        Self { handle, streams, caller }
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let remaining = self.streams.close(&self.caller);
        debug!("Event stream of {} closed ({} still open)", self.caller, remaining);
        if remaining == 0 {
            self.handle.disconnect(&self.caller);
        }
    }
}

fn event_name(notification: &Notification) -> &'static str {
    match notification {
        Notification::StatusChanged { .. } => "status_changed",
        Notification::PositionChanged { .. } => "position_changed",
    }
}

async fn events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Sse<impl Stream<Item = Result<SseEvent, axum::Error>>> {
    let mut notifications = state.handle.subscribe();
    let guard = DisconnectGuard::new(state.handle, state.streams, id);

    let stream = async_stream::stream! {
        let guard = guard;
        loop {
            match notifications.recv().await {
                Ok(notification) => {
                    yield SseEvent::default()
                        .event(event_name(&notification))
                        .json_data(&notification);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event stream of {} fell behind, {} notifications lost", guard.caller, skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
