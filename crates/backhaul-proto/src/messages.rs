//! Protocol message types

use crate::body::BodyEncoding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Header map carried in request and response messages.
///
/// One value per header name; multi-valued headers are flattened to their
/// first value before they reach the wire.
pub type HeaderMap = BTreeMap<String, String>;

/// Main tunnel protocol message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelMessage {
    /// Relay -> agent, sent once after a successful handshake
    Connected { data: ConnectedData },
    /// Relay -> agent
    HttpRequest { id: String, data: HttpRequestData },
    /// Agent -> relay, correlated by `id`
    HttpResponse { id: String, data: HttpResponseData },
    /// Agent -> relay, unix seconds
    Heartbeat { time: i64 },
    Ping { id: String },
    Pong { id: String },
}

impl TunnelMessage {
    /// Short name of the message tag, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelMessage::Connected { .. } => "connected",
            TunnelMessage::HttpRequest { .. } => "http_request",
            TunnelMessage::HttpResponse { .. } => "http_response",
            TunnelMessage::Heartbeat { .. } => "heartbeat",
            TunnelMessage::Ping { .. } => "ping",
            TunnelMessage::Pong { .. } => "pong",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedData {
    pub client_id: String,
    pub public_url: String,
    /// `host:port` the relay recorded for this session
    pub local_target: String,
}

/// A public HTTP request forwarded to the agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestData {
    pub method: String,
    /// Request path, without the query string
    pub url: String,
    /// Raw query string, without the leading `?`
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub body_encoding: BodyEncoding,
}

impl HttpRequestData {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            query: String::new(),
            headers: HeaderMap::new(),
            body: String::new(),
            body_encoding: BodyEncoding::Utf8,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, bytes: &[u8]) -> Self {
        let (body, encoding) = crate::Body::encode(bytes);
        self.body = body;
        self.body_encoding = encoding;
        self
    }

    /// Path plus query string, as it should appear on the request line
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.url.clone()
        } else {
            format!("{}?{}", self.url, self.query)
        }
    }
}

/// The agent's answer to an [`HttpRequestData`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponseData {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub body_encoding: BodyEncoding,
    /// Set when the agent could not complete the local call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HttpResponseData {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: HeaderMap::new(),
            body: String::new(),
            body_encoding: BodyEncoding::Utf8,
            error: None,
        }
    }

    /// Structured failure result: 500, `text/plain`, empty body, `error` set
    pub fn error_response(message: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type".to_string(), "text/plain".to_string());
        Self {
            status_code: 500,
            headers,
            body: String::new(),
            body_encoding: BodyEncoding::Utf8,
            error: Some(message.into()),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, bytes: &[u8]) -> Self {
        let (body, encoding) = crate::Body::encode(bytes);
        self.body = body;
        self.body_encoding = encoding;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Local service address an agent forwards to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalTarget {
    pub host: String,
    pub port: u16,
}

impl LocalTarget {
    pub const DEFAULT_HOST: &'static str = "localhost";
    pub const DEFAULT_PORT: u16 = 3000;

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for LocalTarget {
    fn default() -> Self {
        Self::new(Self::DEFAULT_HOST, Self::DEFAULT_PORT)
    }
}

impl fmt::Display for LocalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
