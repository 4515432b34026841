//! JSON-lines transaction input for `trafficlog ingest`
//!
//! One object per line:
//! `{"request": {...}, "response": {...}, "tool": "Proxy", "started_at": "2024-05-01T12:00:00Z"}`.
//! Only `request.url` is required. Bodies are plain text, or base64 in
//! `body_base64` for binary content. The raw message is rebuilt from the
//! start line, headers and body.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use trafficlog_core::{RequestDescriptor, ResponseDescriptor};

#[derive(Debug, Deserialize)]
pub struct IngestRecord {
    pub request: RequestRecord,

    #[serde(default)]
    pub response: Option<ResponseRecord>,

    #[serde(default = "default_tool")]
    pub tool: String,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct RequestRecord {
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default = "default_http_version")]
    pub http_version: String,

    /// Ordered `[name, value]` pairs
    #[serde(default)]
    pub headers: Vec<(String, String)>,

    #[serde(default)]
    pub body: Option<String>,

    #[serde(default)]
    pub body_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseRecord {
    pub status_code: u16,

    #[serde(default)]
    pub reason_phrase: String,

    #[serde(default = "default_http_version")]
    pub http_version: String,

    #[serde(default)]
    pub headers: Vec<(String, String)>,

    #[serde(default)]
    pub body: Option<String>,

    #[serde(default)]
    pub body_base64: Option<String>,

    #[serde(default)]
    pub mime_type: Option<String>,
}

fn default_tool() -> String {
    "Import".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_http_version() -> String {
    "HTTP/1.1".to_string()
}

impl IngestRecord {
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn request_descriptor(&self) -> anyhow::Result<RequestDescriptor> {
        let request = &self.request;
        let body = decode_body(request.body.as_deref(), request.body_base64.as_deref())?;
        let start_line = format!("{} {} {}", request.method, request.url, request.http_version);

        Ok(RequestDescriptor {
            url: request.url.clone(),
            method: request.method.clone(),
            http_version: request.http_version.clone(),
            raw: raw_message(&start_line, &request.headers, &body),
            content_type: content_type(&request.headers),
            headers: request.headers.clone(),
            body,
        })
    }

    pub fn response_descriptor(&self) -> anyhow::Result<Option<ResponseDescriptor>> {
        let Some(response) = &self.response else {
            return Ok(None);
        };
        let body = decode_body(response.body.as_deref(), response.body_base64.as_deref())?;
        let start_line = format!(
            "{} {} {}",
            response.http_version, response.status_code, response.reason_phrase
        );

        Ok(Some(ResponseDescriptor {
            status_code: response.status_code,
            reason_phrase: response.reason_phrase.clone(),
            raw: raw_message(start_line.trim_end(), &response.headers, &body),
            content_type: content_type(&response.headers),
            mime_type: response.mime_type.clone(),
            headers: response.headers.clone(),
            body,
        }))
    }
}

fn decode_body(text: Option<&str>, encoded: Option<&str>) -> anyhow::Result<Vec<u8>> {
    match (text, encoded) {
        (_, Some(encoded)) => Ok(STANDARD.decode(encoded)?),
        (Some(text), None) => Ok(text.as_bytes().to_vec()),
        (None, None) => Ok(Vec::new()),
    }
}

fn raw_message(start_line: &str, headers: &[(String, String)], body: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(start_line.len() + body.len() + 64);
    raw.extend_from_slice(start_line.as_bytes());
    raw.extend_from_slice(b"\r\n");
    for (name, value) in headers {
        raw.extend_from_slice(name.as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(body);
    raw
}

fn content_type(headers: &[(String, String)]) -> Option<String> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_line() {
        let record = IngestRecord::parse(r#"{"request":{"url":"http://example.com/"}}"#).unwrap();
        assert_eq!(record.tool, "Import");
        assert!(record.started_at.is_none());

        let request = record.request_descriptor().unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.raw, b"GET http://example.com/ HTTP/1.1\r\n\r\n");
        assert!(record.response_descriptor().unwrap().is_none());
    }

    #[test]
    fn test_full_line() {
        let line = r#"{
            "request": {
                "url": "http://example.com/api",
                "method": "POST",
                "headers": [["Content-Type", "application/json"], ["Host", "example.com"]],
                "body": "{\"a\":1}"
            },
            "response": {
                "status_code": 200,
                "reason_phrase": "OK",
                "body_base64": "AAEC",
                "mime_type": "JSON"
            },
            "tool": "Repeater",
            "started_at": "2024-05-01T12:00:00Z"
        }"#
        .replace('\n', " ");
        let record = IngestRecord::parse(&line).unwrap();

        let request = record.request_descriptor().unwrap();
        assert_eq!(request.content_type.as_deref(), Some("application/json"));
        assert!(request.raw.ends_with(b"\r\n\r\n{\"a\":1}"));

        let response = record.response_descriptor().unwrap().unwrap();
        assert_eq!(response.body, vec![0, 1, 2]);
        assert!(response.raw.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert_eq!(record.tool, "Repeater");
        assert!(record.started_at.is_some());
    }

    #[test]
    fn test_invalid_base64_is_an_error() {
        let record = IngestRecord::parse(
            r#"{"request":{"url":"http://a/","body_base64":"!!"}}"#,
        )
        .unwrap();
        assert!(record.request_descriptor().is_err());
    }

    #[test]
    fn test_missing_url_is_an_error() {
        assert!(IngestRecord::parse(r#"{"request":{}}"#).is_err());
    }
}
