//! Response bodies, CORS headers and error mapping shared by every route

use entity_core::{ChatEvent, EngineError, sanitize_error};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Response, StatusCode};
use llm::LlmError;
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub type Body = UnsyncBoxBody<Bytes, Infallible>;

pub fn full(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into()).boxed_unsync()
}

fn add_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
}

fn respond(status: StatusCode, content_type: &'static str, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    add_cors(headers);
    response
}

pub fn json_response(status: StatusCode, value: &impl Serialize) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => respond(status, "application/json", full(bytes)),
        Err(e) => {
            tracing::error!("Failed to serialize response: {}", e);
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "application/json",
                full(r#"{"error":"failed to serialize response"}"#),
            )
        }
    }
}

/// Empty 200 answer to a CORS pre-flight
pub fn preflight() -> Response<Body> {
    let mut response = Response::new(full(Bytes::new()));
    add_cors(response.headers_mut());
    response
}

pub fn not_found(path: &str) -> Response<Body> {
    json_response(
        StatusCode::NOT_FOUND,
        &json!({ "error": format!("no route for {}", path) }),
    )
}

pub fn method_not_allowed() -> Response<Body> {
    json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &json!({ "error": "method not allowed" }),
    )
}

/// One server-sent-events frame
pub fn sse_frame(event: &ChatEvent) -> Bytes {
    match serde_json::to_string(event) {
        Ok(json) => Bytes::from(format!("data: {}\n\n", json)),
        Err(e) => {
            tracing::error!("Failed to serialize chat event: {}", e);
            Bytes::new()
        }
    }
}

/// Stream every event received on `events` as `text/event-stream`.
///
/// The body ends when every sender is dropped; dropping the body (client
/// disconnect) closes the channel so senders observe the failure.
pub fn event_stream(events: UnboundedReceiver<ChatEvent>) -> Response<Body> {
    let frames = UnboundedReceiverStream::new(events)
        .map(|event| Ok::<_, Infallible>(Frame::data(sse_frame(&event))));
    let mut response = respond(
        StatusCode::OK,
        "text/event-stream",
        StreamBody::new(frames).boxed_unsync(),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Failure of a request before any streaming started
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    PayloadTooLarge(usize),
    ModelUnavailable(String),
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn raw_message(&self) -> String {
        match self {
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::PayloadTooLarge(limit) => {
                format!("request body exceeds {} bytes", limit)
            }
            ApiError::ModelUnavailable(id) => format!("no usable model for '{}'", id),
            ApiError::Internal(e) => e.to_string(),
        }
    }

    pub fn into_response(self) -> Response<Body> {
        let status = self.status();
        let raw = self.raw_message();
        if status.is_server_error() {
            tracing::error!(status = %status, "Request failed: {}", raw);
        } else {
            tracing::debug!(status = %status, "Request rejected: {}", raw);
        }
        let message = match self {
            // Our own messages carry no backend detail
            ApiError::BadRequest(_) | ApiError::PayloadTooLarge(_) => raw,
            ApiError::ModelUnavailable(_) | ApiError::Internal(_) => sanitize_error(&raw).message,
        };
        json_response(status, &json!({ "error": message }))
    }
}

impl From<LlmError> for ApiError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::ModelUnavailable(id) => ApiError::ModelUnavailable(id),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::ModelUnavailable(id) => ApiError::ModelUnavailable(id),
            EngineError::Validation(_)
            | EngineError::InvalidArgument(_)
            | EngineError::ToolNameInvalid { .. } => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}
