//! Connection handlers for the Parley gateway.
//!
//! Each WebSocket connection is one user session: the user is added to the
//! directory, a delivery channel is registered with the broker, and on close
//! both are removed again.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use parley_core::{Broker, Directory, Lifetime, Message, User, UserError, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The message broker.
    pub broker: Broker,
    /// Connected users.
    pub directory: Directory,
    /// Lifetime shared by the broker, directory and connections.
    pub lifetime: Lifetime,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, lifetime: Lifetime) -> Self {
        Self {
            broker: Broker::with_config(lifetime.clone(), config.broker_config()),
            directory: Directory::with_lifetime(lifetime.clone()),
            lifetime,
            config,
        }
    }
}

/// Query parameters identifying the connecting user.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// A frame sent by a client. A missing `to` means broadcast.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub to: Option<UserId>,
    pub content: String,
}

/// A frame sent to a client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame<'a> {
    /// A delivered chat message.
    Message(&'a Message),
    /// A rejected client frame.
    Error { message: String },
}

/// Reasons a client frame is rejected.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame exceeds the configured size limit.
    #[error("Frame size {size} exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// Frame is not valid JSON for a client frame.
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Binary frames are not supported.
    #[error("Binary frames are not supported")]
    Binary,
}

/// Turn a client text frame into a broker message from `sender`.
///
/// # Errors
///
/// Returns an error if the frame is too large or malformed.
pub fn parse_client_frame(
    text: &str,
    sender: &str,
    max_size: usize,
) -> Result<Message, FrameError> {
    if text.len() > max_size {
        return Err(FrameError::TooLarge {
            size: text.len(),
            max: max_size,
        });
    }

    let frame: ClientFrame = serde_json::from_str(text)?;
    Ok(match frame.to {
        Some(recipient) => Message::direct(sender, recipient, frame.content),
        None => Message::broadcast(sender, frame.content),
    })
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/users", get(users_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let lifetime = Lifetime::new();
    let state = Arc::new(AppState::new(config.clone(), lifetime.clone()));
    state.broker.run()?;
    publish_broker_stats(
        Arc::clone(&state),
        Duration::from_millis(config.metrics.publish_interval_ms),
    );

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Parley server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    axum::serve(listener, app(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal(lifetime.clone()))
        .await?;

    lifetime.cancel();
    state.broker.done().await;
    info!("Parley server stopped");

    Ok(())
}

/// Periodically export broker statistics until the lifetime ends.
fn publish_broker_stats(state: Arc<AppState>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                () = state.lifetime.cancelled() => break,
                _ = ticker.tick() => metrics::set_broker_stats(&state.broker.stats()),
            }
        }
    })
}

async fn shutdown_signal(lifetime: Lifetime) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown requested");
            lifetime.cancel();
        }
        () = lifetime.cancelled() => {}
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.broker.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "users": stats.registered_users,
    }))
}

/// Directory listing handler.
async fn users_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.directory.users())
}

/// WebSocket upgrade handler.
///
/// The user is validated and added before the upgrade so that bad
/// parameters are answered with a plain HTTP error.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let user = User::new(params.id, params.name, params.email);
    let user_id = user.id.clone();

    let session = match admit_user(&state, user) {
        Ok(session) => session,
        Err(e) => {
            metrics::record_error("admit");
            warn!(user = %user_id, error = %e, "Rejected connection");
            let status = match e {
                UserError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                UserError::AlreadyExists(_) => StatusCode::CONFLICT,
                _ => StatusCode::BAD_REQUEST,
            };
            return (status, e.to_string()).into_response();
        }
    };

    // If the upgrade never completes the callback is dropped with the
    // session inside it, which releases the user.
    ws.on_failed_upgrade(move |e| {
        metrics::record_error("upgrade");
        warn!(user = %user_id, error = %e, "WebSocket upgrade failed");
    })
    .on_upgrade(move |socket| handle_websocket(socket, session))
}

/// A user admitted to the directory.
///
/// Dropping it unregisters the user's delivery channel and removes the user
/// from the directory.
struct Session {
    state: Arc<AppState>,
    user_id: UserId,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.state.broker.unregister_user(&self.user_id);
        if let Err(e) = self.state.directory.remove_user(&self.user_id) {
            debug!(user = %self.user_id, error = %e, "User not removed from directory");
        }
        debug!(user = %self.user_id, "Session released");
    }
}

/// Add a user to the directory unless the id is already connected.
fn admit_user(state: &Arc<AppState>, user: User) -> Result<Session, UserError> {
    let user_id = user.id.clone();
    state.directory.add_user_if_absent(user)?;
    Ok(Session {
        state: Arc::clone(state),
        user_id,
    })
}

/// Handle a WebSocket connection for one user.
async fn handle_websocket(socket: WebSocket, session: Session) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let state = Arc::clone(&session.state);
    let user_id = session.user_id.clone();

    let (delivery_tx, mut deliveries) = state.broker.delivery_channel();
    state.broker.register_user(user_id.clone(), delivery_tx);

    debug!(user = %user_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let max_size = state.config.limits.max_message_size;

    loop {
        tokio::select! {
            biased;

            () = state.lifetime.cancelled() => {
                let _ = sender.send(WsMessage::Close(None)).await;
                break;
            }

            // Forward deliveries from the broker to the client
            Some(message) = deliveries.recv() => {
                if send_frame(&mut sender, &ServerFrame::Message(message.as_ref())).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        metrics::record_message(text.len(), "inbound");
                        match parse_client_frame(&text, &user_id, max_size) {
                            Ok(message) => {
                                if let Err(e) = state.broker.send_message(message).await {
                                    debug!(user = %user_id, error = %e, "Broker refused message");
                                    break;
                                }
                            }
                            Err(e) => {
                                if reject(&mut sender, &user_id, e).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        if reject(&mut sender, &user_id, FrameError::Binary).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if sender.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!(user = %user_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(user = %user_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(user = %user_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Cleanup: stop deliveries, then forget the user
    drop(session);

    debug!(user = %user_id, "WebSocket disconnected");
}

async fn reject(
    sender: &mut SplitSink<WebSocket, WsMessage>,
    user_id: &str,
    error: FrameError,
) -> Result<()> {
    warn!(user = %user_id, error = %error, "Rejected frame");
    metrics::record_error("frame");
    send_frame(
        sender,
        &ServerFrame::Error {
            message: error.to_string(),
        },
    )
    .await
}

/// Send a frame to the WebSocket.
async fn send_frame(
    sender: &mut SplitSink<WebSocket, WsMessage>,
    frame: &ServerFrame<'_>,
) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    metrics::record_message(text.len(), "outbound");
    sender.send(WsMessage::Text(text)).await?;
    Ok(())
}
