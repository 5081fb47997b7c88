//! WebSocket relay between clients and the upstream speech service.
//!
//! Each accepted client connection is paired with exactly one new upstream
//! connection. The relay sends the one-shot session configuration as soon as
//! the upstream opens, then forwards every message verbatim in both
//! directions, preserving boundaries and order. Closing either side closes
//! the other; there is no session resumption.

use crate::config::{ConfigError, RelayConfig};
use crate::protocol::{ClientEvent, ErrorDetail, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_async, connect_async};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("Upstream connection failed: {0}")]
    Upstream(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Message sent to the client in place of raw upstream error detail.
const UPSTREAM_ERROR_MESSAGE: &str = "Connection to the voice assistant failed";

pub struct RelayServer {
    config: Arc<RelayConfig>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn run(self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_address).await?;
        log::info!("🎙 Relay listening on {}", self.config.bind_address);
        self.serve(listener).await
    }

    /// Accept loop over an existing listener. Each connection runs in its own
    /// task; the immutable config is the only state they share.
    pub async fn serve(self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::info!("🔌 New connection from {}", addr);

            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, config).await {
                    log::error!("❌ Connection from {} failed: {}", addr, e);
                }
                log::info!("🔌 Connection from {} closed", addr);
            });
        }
    }
}

async fn handle_client(mut stream: TcpStream, config: Arc<RelayConfig>) -> Result<(), RelayError> {
    // Inspect the request head before committing to the upgrade.
    let head = peek_request_head(&stream).await?;
    if !is_websocket_upgrade(&head) {
        log::warn!("Rejecting non-WebSocket request");
        // Drain the request before responding so the close does not reset the
        // connection under the reply.
        stream.read_exact(&mut vec![0u8; head.len()]).await?;
        write_http_response(
            &mut stream,
            "400 Bad Request",
            "text/plain",
            "Expected WebSocket upgrade",
        )
        .await?;
        return Ok(());
    }

    let api_key = match config.require_api_key() {
        Ok(key) => key.to_string(),
        Err(e) => {
            log::error!("Rejecting connection: {}", e);
            stream.read_exact(&mut vec![0u8; head.len()]).await?;
            write_http_response(
                &mut stream,
                "500 Internal Server Error",
                "application/json",
                r#"{"error":"upstream credential not configured"}"#,
            )
            .await?;
            return Ok(());
        }
    };

    let client_ws = accept_async(stream)
        .await
        .map_err(|e| RelayError::Handshake(e.to_string()))?;
    log::debug!("Client WebSocket established");

    // Exactly one upstream connection per client, opened only after the
    // client upgrade succeeds.
    let request = upstream_request(&config, &api_key)?;
    let (mut client_write, mut client_read) = client_ws.split();

    let upstream_ws = match connect_async(request).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            log::error!("Upstream connection failed: {}", e);
            let _ = client_write.send(synthesized_error()).await;
            let _ = client_write.close().await;
            return Err(RelayError::Upstream(e.to_string()));
        }
    };
    let (mut upstream_write, mut upstream_read) = upstream_ws.split();
    log::info!("✅ Upstream connected");

    // The session configuration must precede any relayed audio.
    let update = ClientEvent::SessionUpdate {
        session: config.session.to_session_update(),
    };
    let payload = serde_json::to_string(&update).unwrap(); // Infallible
    upstream_write
        .send(Message::Text(payload.into()))
        .await
        .map_err(|e| RelayError::Upstream(format!("failed to send session config: {}", e)))?;
    log::debug!("Session configuration sent");

    // Forward verbatim in both directions, one message at a time per side.
    loop {
        tokio::select! {
            message = client_read.next() => match message {
                Some(Ok(message)) if message.is_text() || message.is_binary() => {
                    if let Err(e) = upstream_write.send(message).await {
                        log::warn!("Forward to upstream failed: {}", e);
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Client closed, closing upstream");
                    let _ = upstream_write.close().await;
                    break;
                }
                Some(Ok(_)) => {} // ping/pong handled by the protocol layer
                Some(Err(e)) => {
                    log::warn!("Client socket error: {}", e);
                    let _ = upstream_write.close().await;
                    break;
                }
            },
            message = upstream_read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let outbound = if is_upstream_error(text.as_str()) {
                        log::error!("Upstream error event: {}", text.as_str());
                        synthesized_error()
                    } else {
                        Message::Text(text)
                    };
                    if let Err(e) = client_write.send(outbound).await {
                        log::warn!("Forward to client failed: {}", e);
                        break;
                    }
                }
                Some(Ok(message)) if message.is_binary() => {
                    if let Err(e) = client_write.send(message).await {
                        log::warn!("Forward to client failed: {}", e);
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Upstream closed, closing client");
                    let _ = client_write.close().await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::error!("Upstream socket error: {}", e);
                    let _ = client_write.send(synthesized_error()).await;
                    let _ = client_write.close().await;
                    break;
                }
            },
        }
    }

    Ok(())
}

/// Peek the HTTP request head without consuming it, so the WebSocket
/// handshake can still read the request afterwards.
async fn peek_request_head(stream: &TcpStream) -> Result<Vec<u8>, RelayError> {
    let mut buf = vec![0u8; 4096];
    let mut seen = 0usize;

    for _ in 0..100 {
        let n = stream.peek(&mut buf).await?;
        if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") || n == buf.len() {
            return Ok(buf[..n].to_vec());
        }
        if n == seen {
            // No new bytes buffered yet; yield briefly rather than spin.
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        seen = n;
    }

    Ok(buf[..seen].to_vec())
}

/// True when the request head asks for a WebSocket upgrade.
fn is_websocket_upgrade(head: &[u8]) -> bool {
    let head = String::from_utf8_lossy(head);
    for line in head.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
            {
                return true;
            }
        }
    }
    false
}

async fn write_http_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &str,
) -> Result<(), RelayError> {
    let response = format!(
        "HTTP/1.1 {}\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Build the upstream handshake request: configured endpoint plus the bearer
/// credential and the realtime protocol header.
fn upstream_request(
    config: &RelayConfig,
    api_key: &str,
) -> Result<http::Request<()>, RelayError> {
    let mut request = config
        .upstream_url
        .as_str()
        .into_client_request()
        .map_err(|e| RelayError::Handshake(e.to_string()))?;

    let headers = request.headers_mut();
    headers.insert(
        http::header::AUTHORIZATION,
        format!("Bearer {}", api_key)
            .parse()
            .map_err(|_| RelayError::Handshake("credential is not a valid header".to_string()))?,
    );
    headers.insert(
        "OpenAI-Beta",
        http::HeaderValue::from_static("realtime=v1"),
    );

    Ok(request)
}

/// Does this upstream message carry an error event? Only the discriminant is
/// inspected; everything else is forwarded untouched.
fn is_upstream_error(text: &str) -> bool {
    matches!(
        serde_json::from_str::<serde_json::Value>(text),
        Ok(value) if value.get("type").and_then(|t| t.as_str()) == Some("error")
    )
}

/// The structured error sent to the client in place of upstream detail.
fn synthesized_error() -> Message {
    let event = ServerEvent::Error {
        error: ErrorDetail {
            message: UPSTREAM_ERROR_MESSAGE.to_string(),
        },
    };
    Message::Text(serde_json::to_string(&event).unwrap().into()) // Infallible
}
