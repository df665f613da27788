use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{Query, Request};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use http::{Method, StatusCode, header};
use rmcp::model::ClientJsonRpcMessage;
use tokio_stream::wrappers::ReceiverStream;

use crate::mcp::Error;
use crate::mcp::relay::Relay;
use crate::mcp::session::{self, SessionManager};

#[cfg(test)]
#[path = "sse_tests.rs"]
mod tests;

const BODY_LIMIT: usize = 4 * 1024 * 1024;

/// SSE output adapter. GET opens the event stream and announces the message
/// endpoint; POST delivers JSON-RPC to the session named by `sessionId`.
/// The message path is relative to the adapter's mount.
pub struct SseService {
	relay: Arc<Relay>,
	sessions: Arc<SessionManager>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostEventQuery {
	pub session_id: String,
}

impl SseService {
	pub fn new(relay: Arc<Relay>) -> Self {
		Self {
			relay,
			sessions: Arc::new(SessionManager::new()),
		}
	}

	pub async fn handle(&self, action: &str, request: Request) -> Result<Response, Error> {
		match (request.method().clone(), action.trim_matches('/')) {
			(Method::GET, "") => self.handle_get(request).await,
			(Method::POST, "message") => self.handle_post(request).await,
			_ => Err(Error::MethodNotAllowed),
		}
	}

	/// GET establishes the stream: first an `endpoint` event carrying the
	/// message path with this session's id, then `message` events for every
	/// JSON-RPC reply. Dropping the stream deletes the session.
	async fn handle_get(&self, _request: Request) -> Result<Response, Error> {
		let session = self.sessions.create_session(self.relay.clone());
		let rx = session.attach_stream();

		let endpoint = format!("/message?sessionId={}", session.id);
		let first = futures::stream::once(async move {
			Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint))
		});
		let messages = ReceiverStream::new(rx).map(|message| {
			let data = serde_json::to_string(&message).unwrap_or_default();
			Ok::<_, Infallible>(Event::default().event("message").data(data))
		});
		let guard = session::dropper(self.sessions.clone(), session.id.clone());
		let stream = GuardedStream {
			inner: first.chain(messages),
			_guard: guard,
		};
		Ok(Sse::new(stream).into_response())
	}

	/// POST delivers a JSON-RPC message; the reply rides back on the 202
	/// body and is mirrored onto the event stream.
	async fn handle_post(&self, request: Request) -> Result<Response, Error> {
		let Ok(Query(PostEventQuery { session_id })) = Query::try_from_uri(request.uri()) else {
			return Err(Error::InvalidSessionIdQuery);
		};
		let Some(session) = self.sessions.get_session(&session_id) else {
			return Err(Error::UnknownSession);
		};

		let bytes = axum::body::to_bytes(request.into_body(), BODY_LIMIT)
			.await
			.map_err(|e| Error::Body(e.to_string()))?;
		let message =
			serde_json::from_slice::<ClientJsonRpcMessage>(&bytes).map_err(Error::Deserialize)?;

		let reply = session.handle(message).await;
		if let Some(reply) = &reply {
			session.push(reply.clone()).await;
		}
		let body = match &reply {
			Some(reply) => Body::from(serde_json::to_vec(reply).unwrap_or_default()),
			None => Body::empty(),
		};
		Ok(
			http::Response::builder()
				.status(StatusCode::ACCEPTED)
				.header(header::CONTENT_TYPE, "application/json")
				.body(body)
				.expect("valid response"),
		)
	}
}

pin_project_lite::pin_project! {
	struct GuardedStream<S> {
		#[pin]
		inner: S,
		_guard: session::SessionDropper,
	}
}

impl<S: Stream> Stream for GuardedStream<S> {
	type Item = S::Item;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		self.project().inner.poll_next(cx)
	}
}
