//! The unified invocation outcome and its HTTP rendering.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::Response;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Message used whenever an error carries no message of its own.
pub const INTERNAL_SERVER_ERROR: &str = "Internal server error";

/// The outcome of one invocation: status, body and optional headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// HTTP status code.
    pub status: u16,
    /// Response body. Strings are sent as text, `null` as an empty body and
    /// everything else as JSON.
    #[serde(default)]
    pub body: Value,
    /// Extra response headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Reply {
    /// Create a reply with the given status and body.
    pub fn new(status: u16, body: impl Into<Value>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: HashMap::new(),
        }
    }

    /// Create a 200 reply.
    pub fn ok(body: impl Into<Value>) -> Self {
        Self::new(200, body)
    }

    /// Create a reply with an empty body.
    pub fn empty(status: u16) -> Self {
        Self::new(status, Value::Null)
    }

    /// Add a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Whether `status` can be written as an HTTP status line.
    pub fn has_valid_status(&self) -> bool {
        hyper::StatusCode::from_u16(self.status).is_ok()
    }

    /// The body as text, the way it would be written to the wire.
    pub fn text_body(&self) -> String {
        match &self.body {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// JavaScript-style truthiness of a produced value.
///
/// `null`, `false`, `0` and `""` are falsy; arrays and objects are truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a reply into a hyper response.
pub fn render(reply: Reply) -> Response<Full<Bytes>> {
    let status = hyper::StatusCode::from_u16(reply.status).unwrap_or_else(|_| {
        warn!(
            "Invalid status code {}, falling back to 500 Internal Server Error",
            reply.status
        );
        hyper::StatusCode::INTERNAL_SERVER_ERROR
    });

    let (content_type, body) = match reply.body {
        Value::Null => (None, Bytes::new()),
        Value::String(s) => (Some("text/plain; charset=utf-8"), Bytes::from(s)),
        other => (
            Some("application/json"),
            Bytes::from(serde_json::to_vec(&other).unwrap_or_default()),
        ),
    };

    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    if let Some(content_type) = content_type {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    for (name, value) in reply.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("Skipping invalid response header '{}'", name),
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!("ok")));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }

    #[tokio::test]
    async fn test_render_string_body() {
        let response = render(Reply::new(404, "nope"));
        assert_eq!(response.status(), hyper::StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"nope");
    }

    #[tokio::test]
    async fn test_render_json_body_and_user_headers() {
        let reply =
            Reply::ok(json!({"count": 2})).header("Content-Type", "application/vnd.api+json");
        let response = render(reply);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/vnd.api+json");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"count":2}"#);
    }

    #[test]
    fn test_render_invalid_status_falls_back() {
        let response = render(Reply::empty(1000));
        assert_eq!(response.status(), hyper::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_status_validity() {
        assert!(Reply::empty(100).has_valid_status());
        assert!(Reply::empty(999).has_valid_status());
        assert!(!Reply::empty(0).has_valid_status());
        assert!(!Reply::empty(1000).has_valid_status());
    }
}
