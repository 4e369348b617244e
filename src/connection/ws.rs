use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::config::AgentConfig;
use crate::handler::{envelope, HandlerContext, HandlerRegistry};

use super::ConnectionEvent;

/// Path the hub serves agent WebSocket connections on.
const CONNECT_PATH: &str = "/api/agent/connect";

/// Keepalive ping cadence; comfortably inside the hub's 70 s idle timeout.
const PING_INTERVAL: Duration = Duration::from_secs(45);

/// Everything needed to dial the hub.
#[derive(Debug, Clone)]
pub struct WsSettings {
    pub url: String,
    pub token: String,
}

impl WsSettings {
    /// None when the outbound transport isn't configured — the agent then
    /// runs SSH-only.
    pub fn from_config(config: &AgentConfig) -> Option<Self> {
        let hub_url = config.hub_url.as_deref()?;
        let token = config.token.clone()?;
        Some(Self {
            url: websocket_url(hub_url),
            token,
        })
    }
}

/// Map the configured hub URL onto the agent-connect endpoint with a
/// WebSocket scheme.
fn websocket_url(hub_url: &str) -> String {
    let base = hub_url.trim_end_matches('/');
    let converted = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("ws://{base}")
    };
    format!("{converted}{CONNECT_PATH}")
}

/// One connection lifetime: dial, emit `WebSocketConnect`, serve the
/// request-driven loop with keepalive pings, and return when the peer
/// closes, an error occurs, or the session is cancelled. The caller emits
/// `WebSocketDisconnect` when this returns.
pub async fn run_session(
    agent: Arc<Agent>,
    registry: Arc<HandlerRegistry>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    cancel: CancellationToken,
    settings: WsSettings,
) -> Result<()> {
    let mut request = settings
        .url
        .as_str()
        .into_client_request()
        .context("Invalid hub URL")?;
    request.headers_mut().insert(
        "X-Token",
        HeaderValue::from_str(&settings.token).context("Token is not a valid header value")?,
    );
    request.headers_mut().insert(
        "X-Agent-Version",
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );

    let (stream, _response) = connect_async(request)
        .await
        .context("WebSocket connect failed")?;
    info!(url = %settings.url, "Connected to hub");
    events_tx.send(ConnectionEvent::WebSocketConnect).await.ok();

    let (mut write, mut read) = stream.split();
    // Fresh context per connection: the hub must re-verify its token.
    let ctx = HandlerContext::new(agent, false);
    let mut keepalive = tokio::time::interval(PING_INTERVAL);
    keepalive.tick().await; // first tick is immediate — skip it

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            _ = keepalive.tick() => {
                if write.send(Message::Ping(Bytes::new())).await.is_err() {
                    return Ok(());
                }
            }
            message = read.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => return Err(e).context("WebSocket read failed"),
                    None => return Ok(()),
                };
                match message {
                    Message::Binary(payload) => {
                        let response = match envelope::decode::<envelope::HubRequest>(&payload) {
                            Ok(request) => registry.dispatch(&ctx, request).await,
                            Err(e) => {
                                warn!(error = %e, "Undecodable hub message");
                                envelope::AgentResponse::failure(None, "bad request envelope")
                            }
                        };
                        let encoded = envelope::encode(&response)?;
                        write
                            .send(Message::Binary(Bytes::from(encoded)))
                            .await
                            .context("WebSocket write failed")?;
                    }
                    Message::Ping(payload) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Message::Close(frame) => {
                        debug!(?frame, "Hub closed the session");
                        return Ok(());
                    }
                    other => debug!(?other, "Ignoring non-binary message"),
                }
            }
        }
    }
}
