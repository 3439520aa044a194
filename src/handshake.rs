//! Upgrade request construction and response validation.
//!
//! The byte-level exchange is tungstenite's job; this module prepares the
//! client `Request` (endpoint normalization, caller headers, subprotocol
//! offer) and checks what came back.

use crate::error::ClientError;
use crate::settings::{ConnectionSettings, ProtocolVersion};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::{Request, Response};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};

pub(crate) const SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";

/// Where to open the TCP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Reject configurations the delegated codec cannot speak.
pub(crate) fn ensure_supported(version: ProtocolVersion) -> Result<(), ClientError> {
    match version {
        ProtocolVersion::V13 => Ok(()),
        ProtocolVersion::V00 => Err(ClientError::Handshake(
            "hixie-76 (V00) endpoints are not supported by this codec".to_owned(),
        )),
    }
}

/// Parse and normalize the endpoint URI: scheme must be ws/wss and an
/// empty path is rewritten to `/`.
pub(crate) fn normalized_uri(raw: &str) -> Result<Uri, ClientError> {
    let uri: Uri = raw
        .parse()
        .map_err(|e| ClientError::InvalidUri(format!("{raw}: {e}")))?;
    match uri.scheme_str() {
        Some("ws" | "wss") => {}
        other => {
            return Err(ClientError::InvalidUri(format!(
                "{raw}: expected ws:// or wss://, got {other:?}"
            )));
        }
    }
    if uri.host().is_none() {
        return Err(ClientError::InvalidUri(format!("{raw}: missing host")));
    }
    if !uri.path().is_empty() {
        return Ok(uri);
    }
    let path_and_query = match uri.query() {
        Some(q) => format!("/?{q}"),
        None => "/".to_owned(),
    };
    let mut parts = uri.into_parts();
    parts.path_and_query = Some(
        path_and_query
            .parse()
            .map_err(|e| ClientError::InvalidUri(format!("{raw}: {e}")))?,
    );
    Uri::from_parts(parts).map_err(|e| ClientError::InvalidUri(format!("{raw}: {e}")))
}

/// Extract host, port (scheme default when absent) and TLS flag.
pub(crate) fn endpoint(uri: &Uri) -> Result<Endpoint, ClientError> {
    let tls = uri.scheme_str() == Some("wss");
    let host = uri
        .host()
        .ok_or_else(|| ClientError::InvalidUri("missing host".to_owned()))?
        .to_owned();
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    Ok(Endpoint { host, port, tls })
}

/// Build the upgrade request: standard headers come from tungstenite, the
/// caller's `initial_headers` go in verbatim, and a non-empty subprotocol
/// list becomes one comma-joined `Sec-WebSocket-Protocol` header.
pub(crate) fn build_request(
    uri: &Uri,
    settings: &ConnectionSettings,
) -> Result<Request, ClientError> {
    let mut request = uri
        .clone()
        .into_client_request()
        .map_err(|e| ClientError::Handshake(e.to_string()))?;

    let headers = request.headers_mut();
    for (name, value) in &settings.initial_headers {
        let name: HeaderName = name
            .parse()
            .map_err(|e| ClientError::Handshake(format!("invalid header name '{name}': {e}")))?;
        let value: HeaderValue = value
            .parse()
            .map_err(|e| ClientError::Handshake(format!("invalid header value for '{name}': {e}")))?;
        headers.insert(name, value);
    }

    if !settings.protocols.is_empty() {
        let offer = settings.protocols.join(",");
        headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            offer
                .parse()
                .map_err(|e| ClientError::Handshake(format!("invalid subprotocol offer: {e}")))?,
        );
    }

    Ok(request)
}

/// Check the subprotocol the server selected, if any.
///
/// tungstenite has already verified the 101 status and accept key; what is
/// left is making sure the server did not pick a protocol we never offered.
pub(crate) fn negotiated_subprotocol(
    response: &Response,
    offered: &[String],
) -> Result<Option<String>, ClientError> {
    let Some(value) = response.headers().get(SEC_WEBSOCKET_PROTOCOL) else {
        return Ok(None);
    };
    let selected = value
        .to_str()
        .map_err(|e| ClientError::Handshake(format!("unreadable subprotocol header: {e}")))?
        .trim()
        .to_owned();
    if offered.iter().any(|p| *p == selected) {
        Ok(Some(selected))
    } else {
        Err(ClientError::Handshake(format!(
            "server selected unoffered subprotocol '{selected}'"
        )))
    }
}
