//! Websocket transport to the session server
//!
//! [`Connector::connect`] returns immediately with a [`LinkHandle`] for
//! outbound frames; everything the socket does afterwards (open, messages,
//! close, failure) arrives in order as [`LinkEvent`]s tagged with the
//! connection epoch, so events from a replaced socket can be ignored.

use crate::config::ServerConfig;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Keepalive ping interval
const PING_INTERVAL: Duration = Duration::from_secs(3);

/// How long to wait for the server to answer our close frame
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Something that happened on a connection
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Handshake completed; frames may be sent
    Opened,
    /// A text frame from the server
    Message(String),
    /// Close handshake started
    Closing { code: u16, reason: String },
    /// Connection closed cleanly
    Closed { code: u16, reason: String },
    /// Connection failed or could not be established
    Failed(String),
}

/// Events from the transport, tagged with the connection epoch
pub type EventSender = mpsc::UnboundedSender<(u64, LinkEvent)>;

/// Frames queued for the socket writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Sending half of a connection
#[derive(Debug, Clone)]
pub struct LinkHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl LinkHandle {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    /// Queue a text frame; false if the connection task is gone
    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(Outbound::Text(text)).is_ok()
    }

    /// Start the close handshake
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Parameters of one connection attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub epoch: u64,
    pub url: String,
    pub tenant_id: String,
    pub token: String,
}

/// Opens connections to the session server
pub trait Connector: Send + Sync {
    fn connect(&self, request: ConnectRequest, events: EventSender) -> LinkHandle;
}

/// Session URL with routing parameters
pub fn session_url(config: &ServerConfig) -> Result<Url, url::ParseError> {
    let scheme = if config.tls { "wss" } else { "ws" };
    let base = match config.port {
        Some(port) => format!("{}://{}:{}/", scheme, config.host, port),
        None => format!("{}://{}/", scheme, config.host),
    };
    Url::parse_with_params(
        &base,
        &[
            ("skillset", config.skillset.as_str()),
            ("userID", config.user_id.as_str()),
            ("language", config.language.as_str()),
            ("engine", config.engine.as_str()),
        ],
    )
}

/// Connector using tokio-tungstenite
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, request: ConnectRequest, events: EventSender) -> LinkHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(request, rx, events));
        LinkHandle::new(tx)
    }
}

async fn run_socket(
    request: ConnectRequest,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: EventSender,
) {
    let epoch = request.epoch;
    let emit = |event: LinkEvent| {
        let _ = events.send((epoch, event));
    };

    let mut http_request = match request.url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            emit(LinkEvent::Failed(format!("Invalid session URL: {}", e)));
            return;
        }
    };

    let bearer = match HeaderValue::from_str(&format!("Bearer {}", request.token)) {
        Ok(v) => v,
        Err(e) => {
            emit(LinkEvent::Failed(format!("Invalid access token: {}", e)));
            return;
        }
    };
    http_request.headers_mut().insert(AUTHORIZATION, bearer);

    if !request.tenant_id.is_empty() {
        match HeaderValue::from_str(&request.tenant_id) {
            Ok(v) => {
                http_request.headers_mut().insert("tenantid", v);
            }
            Err(e) => tracing::warn!("Skipping invalid tenant id header: {}", e),
        }
    }

    tracing::debug!("Connecting to {}", request.url);
    let socket = match tokio_tungstenite::connect_async(http_request).await {
        Ok((socket, _response)) => socket,
        Err(e) => {
            emit(LinkEvent::Failed(e.to_string()));
            return;
        }
    };
    emit(LinkEvent::Opened);

    let (mut sink, mut stream) = socket.split();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    let mut close_code = 1005u16;
    let mut close_reason = String::new();

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        emit(LinkEvent::Failed(e.to_string()));
                        return;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    emit(LinkEvent::Closing { code, reason: reason.clone() });
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    let _ = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
                        while let Some(Ok(message)) = stream.next().await {
                            if message.is_close() {
                                break;
                            }
                        }
                    })
                    .await;
                    emit(LinkEvent::Closed { code, reason });
                    return;
                }
                None => {
                    // Owner dropped the handle
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },

            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => emit(LinkEvent::Message(text)),
                Some(Ok(Message::Binary(data))) => {
                    tracing::warn!("Received {} bytes of binary data, ignoring", data.len());
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        close_code = u16::from(frame.code);
                        close_reason = frame.reason.to_string();
                    }
                    emit(LinkEvent::Closing {
                        code: close_code,
                        reason: close_reason.clone(),
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    emit(LinkEvent::Failed(e.to_string()));
                    return;
                }
                None => {
                    emit(LinkEvent::Closed {
                        code: close_code,
                        reason: close_reason,
                    });
                    return;
                }
            },

            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    emit(LinkEvent::Failed(e.to_string()));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_config() -> ServerConfig {
        ServerConfig {
            host: "assistant.local".to_string(),
            skillset: "kitchen helper".to_string(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_session_url_tls_default_port() {
        let url = session_url(&server_config()).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.port(), None);
        assert_eq!(
            url.as_str(),
            "wss://assistant.local/?skillset=kitchen+helper&userID=voxclient&language=en-US&engine=watson"
        );
    }

    #[test]
    fn test_session_url_plain_with_port() {
        let mut config = server_config();
        config.tls = false;
        config.port = Some(8080);
        let url = session_url(&config).unwrap();
        assert!(url.as_str().starts_with("ws://assistant.local:8080/?skillset="));
    }

    #[test]
    fn test_session_url_escapes_query_values() {
        let mut config = server_config();
        config.skillset = "a&b=c".to_string();
        let url = session_url(&config).unwrap();

        assert!(url.as_str().contains("skillset=a%26b%3Dc&"));
        let skillset = url
            .query_pairs()
            .find(|(key, _)| key == "skillset")
            .map(|(_, value)| value.into_owned());
        assert_eq!(skillset.as_deref(), Some("a&b=c"));
    }

    #[test]
    fn test_session_url_rejects_bad_host() {
        let mut config = server_config();
        config.host = "bad host".to_string();
        assert!(session_url(&config).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_failure() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let request = ConnectRequest {
            epoch: 7,
            url: "ws://127.0.0.1:9/session".to_string(),
            tenant_id: "acme".to_string(),
            token: "token".to_string(),
        };
        let _handle = WsConnector.connect(request, events_tx);

        let (epoch, event) = events_rx.recv().await.unwrap();
        assert_eq!(epoch, 7);
        assert!(matches!(event, LinkEvent::Failed(_)));
    }
}
