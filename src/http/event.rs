//! Invocation event built from an inbound HTTP request.

use bytes::Bytes;
use hyper::http::request::Parts;
use serde::Serialize;
use std::collections::HashMap;

/// CloudEvents attributes carried in binary mode (`ce-*` headers).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CloudEventAttributes {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub source: Option<String>,
    #[serde(rename = "specversion")]
    pub spec_version: Option<String>,
    pub time: Option<String>,
}

impl CloudEventAttributes {
    fn from_headers(headers: &HashMap<String, String>) -> Option<Self> {
        let attrs = Self {
            id: headers.get("ce-id").cloned(),
            event_type: headers.get("ce-type").cloned(),
            source: headers.get("ce-source").cloned(),
            spec_version: headers.get("ce-specversion").cloned(),
            time: headers.get("ce-time").cloned(),
        };
        if attrs == Self::default() {
            None
        } else {
            Some(attrs)
        }
    }
}

/// The event handed to a user function.
///
/// The host never interprets the event; it is built once per request and
/// passed through unchanged.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// HTTP method, uppercase.
    pub method: String,
    /// Request path without the query string.
    pub path: String,
    /// Raw query string, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Request headers with lowercase names.
    pub headers: HashMap<String, String>,
    /// Request body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Bytes>,
    /// CloudEvents attributes, when the request carries them.
    #[serde(rename = "ce", skip_serializing_if = "Option::is_none")]
    pub cloud_event: Option<CloudEventAttributes>,
}

impl Event {
    /// Create an event for `method` and `path` with no headers or body.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            query: None,
            headers: HashMap::new(),
            body: None,
            cloud_event: None,
        }
    }

    /// Build an event from request parts and an already collected body.
    pub fn from_parts(parts: &Parts, body: Bytes) -> Self {
        let mut headers = HashMap::new();
        for (name, value) in &parts.headers {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_string(), v.to_string());
            }
        }
        let cloud_event = CloudEventAttributes::from_headers(&headers);

        Self {
            method: parts.method.as_str().to_string(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            headers,
            body: if body.is_empty() { None } else { Some(body) },
            cloud_event,
        }
    }

    /// Add a header. Names are stored lowercase.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(key.into().to_ascii_lowercase(), value.into());
        self.cloud_event = CloudEventAttributes::from_headers(&self.headers);
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Look up a header, case-insensitively.
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The body as text, if present.
    pub fn text(&self) -> Option<String> {
        self.body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).to_string())
    }

    /// Parse the body as JSON, if present.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.body.as_ref().map(|b| serde_json::from_slice(b))
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new("GET", "/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(uri: &str) -> Parts {
        let (parts, _) = hyper::Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("ce-id", "42")
            .header("ce-type", "order.created")
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    #[test]
    fn test_from_parts_splits_query_and_reads_cloud_event() {
        let event = Event::from_parts(&parts("/orders?limit=5"), Bytes::from_static(b"{\"n\":1}"));

        assert_eq!(event.method, "POST");
        assert_eq!(event.path, "/orders");
        assert_eq!(event.query.as_deref(), Some("limit=5"));
        assert_eq!(event.get_header("content-type"), Some("application/json"));

        let ce = event.cloud_event.clone().unwrap();
        assert_eq!(ce.id.as_deref(), Some("42"));
        assert_eq!(ce.event_type.as_deref(), Some("order.created"));

        let data: serde_json::Value = event.json().unwrap().unwrap();
        assert_eq!(data["n"], 1);
    }

    #[test]
    fn test_empty_body_is_absent() {
        let event = Event::from_parts(&parts("/"), Bytes::new());
        assert!(event.body.is_none());
        assert!(event.text().is_none());
    }

    #[test]
    fn test_plain_request_has_no_cloud_event() {
        let event = Event::new("GET", "/").header("X-Name", "fn");
        assert!(event.cloud_event.is_none());
        assert_eq!(event.get_header("X-NAME"), Some("fn"));
    }
}
