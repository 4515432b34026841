//! Backend-specific text sanitizing applied before an event is enqueued

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::events::ActivityEvent;

/// Rewrites event text so the selected backend can store it verbatim
pub trait Sanitizer: Send + Sync {
    fn sanitize(&self, event: ActivityEvent) -> ActivityEvent;
}

/// For engines whose text columns accept any valid string
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl Sanitizer for PassThrough {
    fn sanitize(&self, event: ActivityEvent) -> ActivityEvent {
        event
    }
}

/// For engines whose text columns reject the NUL character
///
/// Raw and body fields carrying NUL are base64-encoded and flagged; NUL is
/// stripped from the remaining descriptive fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct NulSafe;

impl NulSafe {
    fn encode_field(text: &mut String, encoded: &mut bool) {
        // Already-encoded fields are pure base64 and cannot contain NUL
        if !*encoded && text.contains('\0') {
            *text = STANDARD.encode(text.as_bytes());
            *encoded = true;
        }
    }

    fn strip(text: &mut String) {
        if text.contains('\0') {
            text.retain(|c| c != '\0');
        }
    }
}

impl Sanitizer for NulSafe {
    fn sanitize(&self, mut event: ActivityEvent) -> ActivityEvent {
        Self::encode_field(&mut event.request_raw, &mut event.request_raw_encoded);
        Self::encode_field(&mut event.request_body, &mut event.request_body_encoded);
        if let Some(raw) = event.response_raw.as_mut() {
            Self::encode_field(raw, &mut event.response_raw_encoded);
        }
        if let Some(body) = event.response_body.as_mut() {
            Self::encode_field(body, &mut event.response_body_encoded);
        }

        Self::strip(&mut event.target_url);
        Self::strip(&mut event.http_method);
        Self::strip(&mut event.tool_name);
        Self::strip(&mut event.request_headers);
        Self::strip(&mut event.http_version);
        for field in [
            event.request_content_type.as_mut(),
            event.response_headers.as_mut(),
            event.reason_phrase.as_mut(),
            event.response_mime_type.as_mut(),
            event.response_content_type.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            Self::strip(field);
        }

        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{RequestDescriptor, ResponseDescriptor};
    use chrono::Utc;

    fn event_with_nul() -> ActivityEvent {
        let request = RequestDescriptor {
            url: "http://x/\0a".to_string(),
            method: "GET".to_string(),
            http_version: "HTTP/1.1".to_string(),
            headers: vec![],
            raw: b"GET / HTTP/1.1\r\n\r\n\0".to_vec(),
            body: b"plain".to_vec(),
            content_type: None,
        };
        let response = ResponseDescriptor {
            status_code: 200,
            reason_phrase: "OK".to_string(),
            headers: vec![],
            raw: b"HTTP/1.1 200 OK\r\n\r\n".to_vec(),
            body: b"a\0b".to_vec(),
            mime_type: None,
            content_type: None,
        };
        ActivityEvent::capture_at("h", &request, Some(&response), "Proxy", None, Utc::now())
    }

    #[test]
    fn test_pass_through_is_identity() {
        let event = event_with_nul();
        assert_eq!(PassThrough.sanitize(event.clone()), event);
    }

    #[test]
    fn test_nul_safe_encodes_raw_and_body_fields() {
        let event = NulSafe.sanitize(event_with_nul());

        assert!(event.request_raw_encoded);
        assert_eq!(
            STANDARD.decode(&event.request_raw).unwrap(),
            b"GET / HTTP/1.1\r\n\r\n\0"
        );
        assert!(!event.request_body_encoded);
        assert_eq!(event.request_body, "plain");
        assert!(!event.response_raw_encoded);
        assert!(event.response_body_encoded);
        assert_eq!(event.target_url, "http://x/a");
    }

    #[test]
    fn test_nul_safe_leaves_encoded_fields_alone() {
        let mut event = event_with_nul();
        event.request_raw = "AAEC".to_string();
        event.request_raw_encoded = true;

        let event = NulSafe.sanitize(event);
        assert_eq!(event.request_raw, "AAEC");
    }
}
