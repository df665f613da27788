use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use http::{Method, StatusCode, header};
use rmcp::model::{
	ClientJsonRpcMessage, ClientRequest, ErrorCode, ErrorData, RequestId, ServerJsonRpcMessage,
};
use tokio_stream::wrappers::ReceiverStream;

use crate::mcp::Error;
use crate::mcp::relay::Relay;
use crate::mcp::session::SessionManager;

#[cfg(test)]
#[path = "streamablehttp_tests.rs"]
mod tests;

const BODY_LIMIT: usize = 4 * 1024 * 1024;
const HEADER_SESSION_ID: &str = "mcp-session-id";
const JSON_MIME_TYPE: &str = "application/json";
const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
const HEARTBEAT: Duration = Duration::from_secs(30);

/// JSON-RPC error code for a session this gateway no longer holds. Soft by
/// design: reconnecting clients see a protocol-level error and reinitialize
/// instead of failing on HTTP.
const CODE_SESSION_NOT_FOUND: i32 = -32001;

/// Streamable-HTTP output adapter: one endpoint frames JSON-RPC in both
/// directions, with sessions correlated through the `mcp-session-id` header.
pub struct StreamableHttpService {
	relay: Arc<Relay>,
	sessions: Arc<SessionManager>,
}

impl StreamableHttpService {
	pub fn new(relay: Arc<Relay>) -> Self {
		Self {
			relay,
			sessions: Arc::new(SessionManager::new()),
		}
	}

	pub async fn handle(&self, _action: &str, request: Request) -> Result<Response, Error> {
		match *request.method() {
			Method::POST => self.handle_post(request).await,
			Method::GET => self.handle_get(request).await,
			Method::DELETE => self.handle_delete(request).await,
			_ => Err(Error::MethodNotAllowed),
		}
	}

	async fn handle_post(&self, request: Request) -> Result<Response, Error> {
		// check accept header
		if !request
			.headers()
			.get(header::ACCEPT)
			.and_then(|header| header.to_str().ok())
			.is_some_and(|header| {
				header.contains(JSON_MIME_TYPE) && header.contains(EVENT_STREAM_MIME_TYPE)
			}) {
			return Err(Error::InvalidAccept);
		}
		// check content type
		if !request
			.headers()
			.get(header::CONTENT_TYPE)
			.and_then(|header| header.to_str().ok())
			.is_some_and(|header| header.starts_with(JSON_MIME_TYPE))
		{
			return Err(Error::InvalidContentType);
		}

		let session_id = request
			.headers()
			.get(HEADER_SESSION_ID)
			.and_then(|v| v.to_str().ok())
			.map(|s| s.to_string());

		let bytes = axum::body::to_bytes(request.into_body(), BODY_LIMIT)
			.await
			.map_err(|e| Error::Body(e.to_string()))?;
		let message =
			serde_json::from_slice::<ClientJsonRpcMessage>(&bytes).map_err(Error::Deserialize)?;

		if let Some(session_id) = session_id {
			let Some(session) = self.sessions.get_session(&session_id) else {
				// Unknown session: answer in-band so the client reinitializes
				// rather than treating the gateway as down.
				return Ok(json_response(
					StatusCode::OK,
					&session_not_found(request_id(&message)),
				));
			};
			let reply = session.handle(message).await;
			return Ok(match reply {
				Some(reply) => {
					let mut resp = json_response(StatusCode::OK, &reply);
					if let Ok(sid) = session.id.parse() {
						resp.headers_mut().insert(HEADER_SESSION_ID, sid);
					}
					resp
				},
				None => accepted_response(),
			});
		}

		let is_init = matches!(&message, ClientJsonRpcMessage::Request(r)
			if matches!(&r.request, &ClientRequest::InitializeRequest(_)));
		if is_init {
			let session = self.sessions.create_session(self.relay.clone());
			let reply = session.handle(message).await;
			return Ok(match reply {
				Some(reply) => {
					let mut resp = json_response(StatusCode::OK, &reply);
					if let Ok(sid) = session.id.parse() {
						resp.headers_mut().insert(HEADER_SESSION_ID, sid);
					}
					resp
				},
				None => accepted_response(),
			});
		}

		// No session header and not an initialize: serve statelessly. The
		// relay holds no per-session state, so this is safe and lets simple
		// clients skip session management entirely.
		let reply = self.relay.handle(message).await;
		Ok(match reply {
			Some(reply) => json_response(StatusCode::OK, &reply),
			None => accepted_response(),
		})
	}

	/// GET opens the server-to-client stream for an existing session; the
	/// heartbeat keeps intermediaries from reaping it.
	async fn handle_get(&self, request: Request) -> Result<Response, Error> {
		if !request
			.headers()
			.get(header::ACCEPT)
			.and_then(|header| header.to_str().ok())
			.is_some_and(|header| header.contains(EVENT_STREAM_MIME_TYPE))
		{
			return Err(Error::InvalidAccept);
		}
		let Some(session_id) = request
			.headers()
			.get(HEADER_SESSION_ID)
			.and_then(|v| v.to_str().ok())
		else {
			return Err(Error::SessionIdRequired);
		};
		let Some(session) = self.sessions.get_session(session_id) else {
			return Err(Error::UnknownSession);
		};

		let rx = session.attach_stream();
		let stream = ReceiverStream::new(rx).map(|message| {
			let data = serde_json::to_string(&message).unwrap_or_default();
			Ok::<_, Infallible>(Event::default().event("message").data(data))
		});
		Ok(
			Sse::new(stream)
				.keep_alive(KeepAlive::new().interval(HEARTBEAT))
				.into_response(),
		)
	}

	async fn handle_delete(&self, request: Request) -> Result<Response, Error> {
		let Some(session_id) = request
			.headers()
			.get(HEADER_SESSION_ID)
			.and_then(|v| v.to_str().ok())
		else {
			return Err(Error::SessionIdRequired);
		};
		self.sessions.remove_session(session_id);
		Ok(accepted_response())
	}
}

fn request_id(message: &ClientJsonRpcMessage) -> RequestId {
	match message {
		ClientJsonRpcMessage::Request(r) => r.id.clone(),
		_ => RequestId::Number(0),
	}
}

fn session_not_found(id: RequestId) -> ServerJsonRpcMessage {
	ServerJsonRpcMessage::error(
		ErrorData::new(
			ErrorCode(CODE_SESSION_NOT_FOUND),
			"session not found; reinitialize",
			None,
		),
		id,
	)
}

fn json_response(status: StatusCode, message: &ServerJsonRpcMessage) -> Response {
	http::Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, JSON_MIME_TYPE)
		.body(Body::from(serde_json::to_vec(message).unwrap_or_default()))
		.expect("valid response")
}

fn accepted_response() -> Response {
	http::Response::builder()
		.status(StatusCode::ACCEPTED)
		.body(Body::empty())
		.expect("valid response")
}
