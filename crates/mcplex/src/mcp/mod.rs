pub mod aggregator;
pub mod health;
pub mod keepalive;
pub mod registry;
pub mod relay;
pub mod router;
pub mod session;
pub mod sse;
pub mod streamablehttp;
pub mod toolscache;
pub mod upstream;

use axum::response::{IntoResponse, Response};
use http::StatusCode;
use thiserror::Error;

use crate::mcp::upstream::TransportError;

/// Errors surfaced on the downstream HTTP surface. Aggregator argument errors
/// are *not* here: those travel as tool results with `is_error` set.
#[derive(Error, Debug)]
pub enum Error {
	#[error("method not allowed; must be GET, POST, or DELETE")]
	MethodNotAllowed,
	#[error("client must accept both application/json and text/event-stream")]
	InvalidAccept,
	#[error("client must send application/json")]
	InvalidContentType,
	#[error("failed to read request body: {0}")]
	Body(String),
	#[error("fail to deserialize request body: {0}")]
	Deserialize(serde_json::Error),
	#[error("Service not found")]
	ServiceNotFound,
	#[error("Group not found")]
	GroupNotFound,
	#[error("Service is disabled")]
	ServiceDisabled,
	#[error("Group is disabled")]
	GroupDisabled,
	#[error("metadata store unavailable: {0}")]
	Store(String),
	#[error("session not found")]
	UnknownSession,
	#[error("session ID is required")]
	SessionIdRequired,
	#[error("failed to process sessionId query parameter")]
	InvalidSessionIdQuery,
	#[error("upstream initialization failed: {0}")]
	UpstreamInit(#[from] TransportError),
}

impl Error {
	pub fn status(&self) -> StatusCode {
		match self {
			Error::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
			Error::InvalidAccept | Error::InvalidContentType => StatusCode::NOT_ACCEPTABLE,
			Error::Body(_) | Error::Deserialize(_) | Error::InvalidSessionIdQuery
			| Error::SessionIdRequired => StatusCode::BAD_REQUEST,
			Error::ServiceNotFound | Error::GroupNotFound | Error::UnknownSession => {
				StatusCode::NOT_FOUND
			},
			Error::ServiceDisabled | Error::GroupDisabled => StatusCode::SERVICE_UNAVAILABLE,
			Error::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
			Error::UpstreamInit(_) => StatusCode::BAD_GATEWAY,
		}
	}
}

impl IntoResponse for Error {
	fn into_response(self) -> Response {
		(self.status(), self.to_string()).into_response()
	}
}
