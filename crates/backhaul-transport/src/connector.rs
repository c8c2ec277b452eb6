//! Agent-side tunnel connector

use async_trait::async_trait;
use backhaul_proto::{LocalTarget, AUTHORIZATION_HEADER, TARGET_HOST_HEADER, TARGET_PORT_HEADER};
use rustls::pki_types::ServerName;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, info};
use url::Url;

use crate::auth::bearer;
use crate::tls::ClientTlsConfig;
use crate::websocket::split_channel;
use crate::{Channel, Connector, TransportError, TransportResult};

/// Opens `ws://` or `wss://` tunnels to a relay
pub struct WebSocketConnector {
    url: Url,
    auth_token: String,
    tls_connector: Option<tokio_rustls::TlsConnector>,
    server_name: Option<String>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("url", &self.url.as_str())
            .field("tls", &self.tls_connector.is_some())
            .finish()
    }
}

impl WebSocketConnector {
    pub fn new(url: &str, auth_token: impl Into<String>, tls: ClientTlsConfig) -> TransportResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid URL {}: {}", url, e)))?;

        let tls_connector = match url.scheme() {
            "ws" => None,
            "wss" => Some(tls.build_connector()?),
            other => {
                return Err(TransportError::ConfigurationError(format!(
                    "Unsupported tunnel scheme: {} (expected ws or wss)",
                    other
                )))
            }
        };

        if url.host_str().is_none() {
            return Err(TransportError::ConfigurationError(format!(
                "Tunnel URL has no host: {}",
                url
            )));
        }

        debug!("WebSocket connector created for {}", url);

        Ok(Self {
            url,
            auth_token: auth_token.into(),
            tls_connector,
            server_name: tls.server_name,
            connect_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn build_request(
        &self,
        target: &LocalTarget,
    ) -> TransportResult<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid request: {}", e)))?;

        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION_HEADER, header_value(&bearer(&self.auth_token))?);
        headers.insert(TARGET_HOST_HEADER, header_value(&target.host)?);
        headers.insert(TARGET_PORT_HEADER, header_value(&target.port.to_string())?);

        Ok(request)
    }

    async fn open(&self, target: &LocalTarget) -> TransportResult<Channel> {
        let host = self.url.host_str().unwrap_or_default();
        let port = self.url.port_or_known_default().unwrap_or(80);

        let request = self.build_request(target)?;

        let tcp_stream = TcpStream::connect((host, port)).await.map_err(|e| {
            TransportError::ConnectionError(format!("TCP connect to {}:{} failed: {}", host, port, e))
        })?;
        let _ = tcp_stream.set_nodelay(true);

        let stream = match &self.tls_connector {
            None => MaybeTlsStream::Plain(tcp_stream),
            Some(connector) => {
                let name = self.server_name.as_deref().unwrap_or(host).to_string();
                let dns_name = ServerName::try_from(name)
                    .map_err(|e| TransportError::TlsError(format!("Invalid server name: {}", e)))?;

                let tls_stream = connector
                    .connect(dns_name, tcp_stream)
                    .await
                    .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;
                MaybeTlsStream::Rustls(tls_stream)
            }
        };

        let (ws_stream, _response) = tokio_tungstenite::client_async(request, stream)
            .await
            .map_err(|e| match e {
                WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
                    TransportError::AuthenticationFailed(format!(
                        "relay rejected token ({})",
                        response.status()
                    ))
                }
                other => {
                    TransportError::ConnectionError(format!("WebSocket handshake failed: {}", other))
                }
            })?;

        info!("Tunnel established to {}", self.url);

        Ok(split_channel(ws_stream, format!("agent->{}", self.url)))
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, target: &LocalTarget) -> TransportResult<Channel> {
        match tokio::time::timeout(self.connect_timeout, self.open(target)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionError(format!(
                "Timed out connecting to {} after {:?}",
                self.url, self.connect_timeout
            ))),
        }
    }
}

fn header_value(value: &str) -> TransportResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| TransportError::ConfigurationError(format!("Invalid header value: {}", e)))
}
