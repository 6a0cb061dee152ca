//! HTTP server for jsvault
//!
//! This module provides the HTTP/WebSocket surface using axum:
//!
//! - native routes supplied by the embedder, which always win over scripts
//! - script handlers for every request no native route claims
//! - `GET /__tasks`, `DELETE /__tasks/{id}` and `GET /__health` for admins
//! - `GET /debug`, the WebSocket endpoint for debug sessions
//! - an optional static directory for whatever is left

use axum::{
    body::{to_bytes, Body},
    extract::{ws::Message, ws::WebSocket, Path, Query, Request, State, WebSocketUpgrade},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use jsvault_common::protocol::error::{JsVaultError, Result};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::dispatch::{Dispatch, RequestDispatcher, ScriptReply, OVERRIDE_HEADER};
use crate::host::ScriptHost;
use crate::runtime::HttpExchange;
use crate::task::{Connection, DebugTaskFactory, Outbound, SessionHandler, TaskRegistry};

/// Largest request body handed to a script.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<RequestDispatcher>,
    pub registry: Arc<TaskRegistry>,
    pub sessions: Arc<SessionHandler<DebugTaskFactory>>,
    pub static_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(host: &ScriptHost) -> Self {
        Self {
            dispatcher: host.dispatcher().clone(),
            registry: host.registry().clone(),
            sessions: host.sessions().clone(),
            static_dir: host.config().static_dir.clone(),
        }
    }
}

/// Build the application router around the embedder's `native` routes.
pub fn router(state: AppState, native: Router<AppState>) -> Router {
    let native = native
        .route("/__health", get(health_check))
        .route_layer(middleware::from_fn_with_state(state.clone(), native_override));

    Router::new()
        .route("/__tasks", get(list_tasks))
        .route("/__tasks/{*id}", delete(stop_task))
        .route("/debug", get(debug_socket))
        .merge(native)
        .fallback(dispatch_script)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP server for a [`ScriptHost`].
pub struct HttpServer {
    app: Router,
}

impl HttpServer {
    pub fn new(host: &ScriptHost) -> Self {
        Self::with_native_routes(host, Router::new())
    }

    pub fn with_native_routes(host: &ScriptHost, native: Router<AppState>) -> Self {
        Self {
            app: router(AppState::new(host), native),
        }
    }

    pub fn app(&self) -> Router {
        self.app.clone()
    }

    /// Serve until the process ends.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        self.run_until(addr, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then finish in-flight requests.
    pub async fn run_until<F>(self, addr: SocketAddr, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| JsVaultError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;

        info!(
            "jsvault HTTP server listening on {}",
            listener
                .local_addr()
                .map_err(|e| JsVaultError::Transport(format!("Failed to get local addr: {}", e)))?
        );

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| JsVaultError::Transport(format!("Server error: {}", e)))?;

        Ok(())
    }
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.snapshot())
}

async fn stop_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.stop_task(&id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e @ JsVaultError::TaskNotFound(_)) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Marks native responses that shadow a script handler.
async fn native_override(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let mut response = next.run(request).await;

    let runtime = match state.dispatcher.acquire().await {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!("Override check skipped: {}", e);
            return response;
        }
    };
    let dispatcher = state.dispatcher.clone();
    match tokio::task::spawn_blocking(move || dispatcher.prepare(&runtime, &method, &path, true)).await {
        Ok(Ok(Dispatch::Overridden(script_path))) => {
            if let Ok(value) = HeaderValue::from_str(&script_path) {
                response.headers_mut().insert(OVERRIDE_HEADER, value);
            }
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("Shadowed script handler failed to load: {}", e),
        Err(e) => error!("Override check panicked: {}", e),
    }
    response
}

fn request_body(content_type: Option<&str>, bytes: &[u8]) -> JsonValue {
    if bytes.is_empty() {
        return JsonValue::Null;
    }
    let is_json = content_type.is_some_and(|content_type| content_type.contains("json"));
    if is_json {
        if let Ok(value) = serde_json::from_slice(bytes) {
            return value;
        }
    }
    JsonValue::String(String::from_utf8_lossy(bytes).into_owned())
}

fn reply_response(reply: ScriptReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK);
    let mut response = (status, reply.body).into_response();
    let headers = response.headers_mut();
    for (name, value) in &reply.headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "Dropping invalid header from script"),
        }
    }
    response
}

/// Fallback: run the script handler for this request, if any.
async fn dispatch_script(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response(),
    };

    let method = parts.method.to_string();
    let path = parts.uri.path().to_string();
    let mut exchange = HttpExchange::new(&method, &path);
    if let Ok(Query(query)) = Query::<BTreeMap<String, String>>::try_from_uri(&parts.uri) {
        exchange.query = query;
    }
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            exchange = exchange.with_header(name.as_str(), value);
        }
    }
    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    exchange.body = request_body(content_type, &bytes);

    let runtime = match state.dispatcher.acquire().await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(path = %parts.uri.path(), "No runtime for script handler: {}", e);
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };
    let dispatcher = state.dispatcher.clone();
    let outcome = tokio::task::spawn_blocking(move || -> Result<Option<ScriptReply>> {
        match dispatcher.prepare(&runtime, &method, &path, false)? {
            Dispatch::Script(handle) => dispatcher.serve(&handle, exchange).map(Some),
            Dispatch::Passthrough | Dispatch::Overridden(_) => Ok(None),
        }
    })
    .await;

    match outcome {
        Ok(Ok(Some(reply))) => {
            debug!(path = %parts.uri.path(), status = reply.status, "Script handled request");
            reply_response(reply)
        }
        Ok(Ok(None)) => serve_static(state.static_dir.as_ref(), Request::from_parts(parts, Body::from(bytes))).await,
        Ok(Err(e)) => {
            error!(path = %parts.uri.path(), "Script handler failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            error!(path = %parts.uri.path(), "Script handler panicked: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn serve_static(static_dir: Option<&PathBuf>, request: Request) -> Response {
    let Some(dir) = static_dir else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match ServeDir::new(dir).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}

async fn debug_socket(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(socket, state.sessions))
}

/// Pump one WebSocket: frames from the peer go to the session handler,
/// frames queued on the [`Connection`] go to the peer.
async fn handle_socket(socket: WebSocket, sessions: Arc<SessionHandler<DebugTaskFactory>>) {
    let (connection, mut outbound) = Connection::new();
    let (mut sink, mut stream) = socket.split();
    debug!(connection = %connection.id(), "Debug socket opened");

    let writer_connection = connection.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                Outbound::Text(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        writer_connection.mark_closed();
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let sessions = sessions.clone();
                let connection = connection.clone();
                let text = text.as_str().to_owned();
                if let Err(e) = tokio::task::spawn_blocking(move || sessions.on_text(&connection, &text)).await {
                    error!("Session handler panicked: {}", e);
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                sessions.on_transport_error(&connection, &e.to_string());
                writer.abort();
                return;
            }
        }
    }

    sessions.on_close(&connection);
    writer.abort();
    debug!(connection = %connection.id(), "Debug socket closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check() {
        let response = health_check().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_request_body_parsing() {
        assert_eq!(request_body(None, b""), JsonValue::Null);
        assert_eq!(
            request_body(Some("application/json"), br#"{"a":1}"#),
            serde_json::json!({"a": 1})
        );
        assert_eq!(request_body(Some("text/plain"), b"hi"), JsonValue::String("hi".into()));
        assert_eq!(
            request_body(Some("application/json"), b"{broken"),
            JsonValue::String("{broken".into())
        );
    }

    #[test]
    fn test_reply_headers_are_applied() {
        let mut headers = BTreeMap::new();
        headers.insert("x-trace".to_string(), "1".to_string());
        headers.insert("bad header".to_string(), "x".to_string());
        let response = reply_response(ScriptReply {
            status: 202,
            headers,
            body: "ok".to_string(),
        });
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()["x-trace"], "1");
        assert!(response.headers().keys().all(|name| name.as_str() != "bad header"));
    }
}
