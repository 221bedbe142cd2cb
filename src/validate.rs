//! Authentication and static validation of inbound requests.
//!
//! Everything here runs before a response is committed, so failures become
//! ordinary HTTP errors with an OpenAI-style JSON body.

use crate::translate::openai_types::{ChatRequest, ErrorResponse, PUBLIC_MODEL_ID};

use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

/// A request refused before any streaming started.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl Rejection {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: ErrorResponse::authentication(msg),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorResponse::invalid_request(msg),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ErrorResponse::invalid_request(msg),
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Check `Authorization: Bearer <token>` against the configured token.
///
/// Exactly one `Bearer ` scheme prefix is stripped and surrounding whitespace
/// trimmed; anything else left in the value is part of the token.
pub fn authenticate(headers: &HeaderMap, expected_token: &str) -> Result<(), Rejection> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Err(Rejection::unauthorized("Missing Authorization header"));
    };

    let token = value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| Rejection::unauthorized("Invalid Authorization header format"))?;

    if token.trim() != expected_token {
        return Err(Rejection::unauthorized("Invalid authentication token"));
    }

    Ok(())
}

/// Parse and validate a chat completion body.
///
/// A request without any `user` message passes unless `require_user_message`
/// is set; otherwise it is caught by the stream translator and reported in-band.
pub fn parse_chat_request(body: &[u8], require_user_message: bool) -> Result<ChatRequest, Rejection> {
    let req: ChatRequest = serde_json::from_slice(body)
        .map_err(|e| Rejection::bad_request(format!("Invalid request body: {}", e)))?;

    if req.model != PUBLIC_MODEL_ID {
        return Err(Rejection::bad_request(format!(
            "model must be \"{}\"",
            PUBLIC_MODEL_ID
        )));
    }

    if !req.stream {
        return Err(Rejection::bad_request("stream must be true"));
    }

    if req.messages.is_empty() {
        return Err(Rejection::bad_request(
            "messages must contain at least one message",
        ));
    }

    if require_user_message && !req.has_user_message() {
        return Err(Rejection::bad_request("No user message found"));
    }

    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const TOKEN: &str = "111222333444555666";

    fn headers_with(auth: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        headers
    }

    fn rejected_message(r: Result<(), Rejection>) -> String {
        let rej = r.unwrap_err();
        assert_eq!(rej.status, StatusCode::UNAUTHORIZED);
        assert_eq!(rej.body.error.error_type, "authentication_error");
        rej.body.error.message
    }

    #[test]
    fn test_valid_token() {
        assert!(authenticate(&headers_with("Bearer 111222333444555666"), TOKEN).is_ok());
        assert!(authenticate(&headers_with("Bearer  111222333444555666 "), TOKEN).is_ok());
    }

    #[test]
    fn test_missing_header() {
        let msg = rejected_message(authenticate(&HeaderMap::new(), TOKEN));
        assert_eq!(msg, "Missing Authorization header");
    }

    #[test]
    fn test_wrong_scheme() {
        let msg = rejected_message(authenticate(&headers_with("Basic 111222333444555666"), TOKEN));
        assert_eq!(msg, "Invalid Authorization header format");
        let msg = rejected_message(authenticate(&headers_with("bearer 111222333444555666"), TOKEN));
        assert_eq!(msg, "Invalid Authorization header format");
    }

    #[test]
    fn test_wrong_token() {
        let msg = rejected_message(authenticate(&headers_with("Bearer nope"), TOKEN));
        assert_eq!(msg, "Invalid authentication token");
        let msg = rejected_message(authenticate(&headers_with("Bearer "), TOKEN));
        assert_eq!(msg, "Invalid authentication token");
    }

    #[test]
    fn test_only_one_bearer_prefix_is_stripped() {
        let doubled = format!("Bearer Bearer {TOKEN}");
        let msg = rejected_message(authenticate(&headers_with(&doubled), TOKEN));
        assert_eq!(msg, "Invalid authentication token");

        let padded = format!("Bearer   {TOKEN}  ");
        assert!(authenticate(&headers_with(&padded), TOKEN).is_ok());
    }

    #[test]
    fn test_valid_chat_request() {
        let req = parse_chat_request(
            br#"{"model":"iflow","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
            true,
        )
        .unwrap();
        assert_eq!(req.messages.len(), 1);
    }

    #[test]
    fn test_rejects_wrong_model_stream_and_empty_messages() {
        let cases: [&[u8]; 4] = [
            br#"{"model":"gpt-4o","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
            br#"{"model":"iflow","stream":false,"messages":[{"role":"user","content":"hi"}]}"#,
            br#"{"model":"iflow","stream":true,"messages":[]}"#,
            br#"{"model":"iflow""#,
        ];
        for body in cases {
            let rej = parse_chat_request(body, false).unwrap_err();
            assert_eq!(rej.status, StatusCode::BAD_REQUEST);
            assert_eq!(rej.body.error.error_type, "invalid_request_error");
        }
    }

    #[test]
    fn test_user_message_check_follows_policy() {
        let body = br#"{"model":"iflow","stream":true,"messages":[{"role":"system","content":"x"}]}"#;
        assert!(parse_chat_request(body, false).is_ok());
        let rej = parse_chat_request(body, true).unwrap_err();
        assert_eq!(rej.status, StatusCode::BAD_REQUEST);
        assert_eq!(rej.body.error.message, "No user message found");
    }
}
