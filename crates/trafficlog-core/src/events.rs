//! Captured transaction events
//!
//! An [`ActivityEvent`] is built once per logged transaction on the capture
//! path, from descriptors that the capture layer has already fully read. After
//! construction the event no longer references anything owned by the host.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Address of this host as seen by outgoing traffic, resolved once.
static LOCAL_SOURCE_IP: Lazy<String> = Lazy::new(resolve_local_ip);

fn resolve_local_ip() -> String {
    // Connecting a UDP socket only selects a route, nothing is sent.
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .to_string()
}

/// Local address recorded as the source of captured transactions
pub fn local_source_ip() -> &'static str {
    &LOCAL_SOURCE_IP
}

/// A fully-read HTTP request as handed over by the capture layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub url: String,
    pub method: String,
    pub http_version: String,
    pub headers: Vec<(String, String)>,
    /// Complete request as sent on the wire (start line, headers and body)
    pub raw: Vec<u8>,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

/// A fully-read HTTP response as handed over by the capture layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseDescriptor {
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Vec<(String, String)>,
    /// Complete response as received (status line, headers and body)
    pub raw: Vec<u8>,
    pub body: Vec<u8>,
    /// MIME type as stated by the host's own content sniffing
    pub mime_type: Option<String>,
    pub content_type: Option<String>,
}

/// Per-call capture settings snapshot
///
/// Passed explicitly into every `record` call, so a settings change never
/// affects an event that is already being built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// When set, record calls are inert
    #[serde(default)]
    pub paused: bool,

    /// When unset, only the request side of a transaction is stored
    #[serde(default)]
    pub include_responses: bool,
}

/// One captured transaction, the unit of persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub source_ip: String,
    pub target_url: String,
    pub http_method: String,
    pub tool_name: String,
    pub send_datetime: DateTime<Utc>,

    pub request_raw: String,
    /// JSON object of request header names to values
    pub request_headers: String,
    pub request_body: String,
    pub request_size: u64,
    pub request_content_type: Option<String>,

    pub response_raw: Option<String>,
    pub response_headers: Option<String>,
    pub response_body: Option<String>,
    pub response_size: Option<u64>,
    pub status_code: Option<u16>,
    pub reason_phrase: Option<String>,
    pub response_mime_type: Option<String>,
    pub response_content_type: Option<String>,

    pub http_version: String,
    /// Absent when no response was captured or no start time was known
    pub response_latency_ms: Option<i64>,

    // Set when the matching text field holds base64 instead of the original bytes
    pub request_raw_encoded: bool,
    pub request_body_encoded: bool,
    pub response_raw_encoded: bool,
    pub response_body_encoded: bool,
}

impl ActivityEvent {
    /// Build an event for a transaction that is available right now
    ///
    /// `started_at` is the moment the request was sent, when the capture layer
    /// knows it. It becomes the send timestamp and is the base for latency.
    pub fn capture(
        request: &RequestDescriptor,
        response: Option<&ResponseDescriptor>,
        tool: &str,
        started_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self::capture_at(
            local_source_ip(),
            request,
            response,
            tool,
            started_at,
            Utc::now(),
        )
    }

    /// Build an event with an explicit source address and capture time
    pub fn capture_at(
        source_ip: &str,
        request: &RequestDescriptor,
        response: Option<&ResponseDescriptor>,
        tool: &str,
        started_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let (request_raw, request_raw_encoded) = text_or_base64(&request.raw);
        let (request_body, request_body_encoded) = text_or_base64(&request.body);

        let (response_raw, response_raw_encoded) = match response {
            Some(r) => {
                let (text, encoded) = text_or_base64(&r.raw);
                (Some(text), encoded)
            }
            None => (None, false),
        };
        let (response_body, response_body_encoded) = match response {
            Some(r) => {
                let (text, encoded) = text_or_base64(&r.body);
                (Some(text), encoded)
            }
            None => (None, false),
        };

        let response_latency_ms = match (response, started_at) {
            (Some(_), Some(start)) => Some((now - start).num_milliseconds().max(0)),
            _ => None,
        };

        Self {
            source_ip: source_ip.to_string(),
            target_url: request.url.clone(),
            http_method: request.method.clone(),
            tool_name: tool.to_string(),
            send_datetime: started_at.unwrap_or(now),
            request_raw,
            request_headers: headers_to_json(&request.headers),
            request_body,
            request_size: request.raw.len() as u64,
            request_content_type: request.content_type.clone(),
            response_raw,
            response_headers: response.map(|r| headers_to_json(&r.headers)),
            response_body,
            response_size: response.map(|r| r.raw.len() as u64),
            status_code: response.map(|r| r.status_code),
            reason_phrase: response.map(|r| r.reason_phrase.clone()),
            response_mime_type: response.and_then(|r| r.mime_type.clone()),
            response_content_type: response.and_then(|r| r.content_type.clone()),
            http_version: request.http_version.clone(),
            response_latency_ms,
            request_raw_encoded,
            request_body_encoded,
            response_raw_encoded,
            response_body_encoded,
        }
    }

    /// Whether the response side of the transaction was captured
    pub fn has_response(&self) -> bool {
        self.status_code.is_some()
    }
}

/// UTF-8 text is kept as is, anything else is base64-encoded
pub(crate) fn text_or_base64(bytes: &[u8]) -> (String, bool) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), false),
        Err(_) => (STANDARD.encode(bytes), true),
    }
}

/// Serialize headers as a JSON object; repeated names are comma-joined
fn headers_to_json(headers: &[(String, String)]) -> String {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        match map.get_mut(name) {
            Some(serde_json::Value::String(existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            _ => {
                map.insert(name.clone(), serde_json::Value::String(value.clone()));
            }
        }
    }
    serde_json::Value::Object(map).to_string()
}
