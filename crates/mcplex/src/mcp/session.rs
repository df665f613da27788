use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rmcp::model::{ClientJsonRpcMessage, ServerJsonRpcMessage};
use tokio::sync::mpsc::{Receiver, Sender};
use tracing::debug;
use uuid::Uuid;

use crate::mcp::relay::Relay;

const STREAM_BUFFER: usize = 64;

/// One downstream MCP session. The id is opaque to clients; it keys the
/// session in its adapter and nothing else. Sessions share their adapter's
/// relay, so they are cheap.
#[derive(Clone)]
pub struct Session {
	pub id: Arc<str>,
	relay: Arc<Relay>,
	stream: Arc<Mutex<Option<Sender<ServerJsonRpcMessage>>>>,
}

impl Session {
	pub async fn handle(&self, message: ClientJsonRpcMessage) -> Option<ServerJsonRpcMessage> {
		self.relay.handle(message).await
	}

	/// Mirror a message onto the session's live event stream, if one is
	/// attached. A full or closed stream drops the message; the POST reply
	/// already carried it.
	pub async fn push(&self, message: ServerJsonRpcMessage) {
		let tx = self.stream.lock().clone();
		if let Some(tx) = tx {
			let _ = tx.send(message).await;
		}
	}

	/// Attach (or replace) the server-to-client event stream.
	pub fn attach_stream(&self) -> Receiver<ServerJsonRpcMessage> {
		let (tx, rx) = tokio::sync::mpsc::channel(STREAM_BUFFER);
		*self.stream.lock() = Some(tx);
		rx
	}
}

fn session_id() -> Arc<str> {
	Uuid::new_v4().to_string().into()
}

#[derive(Default)]
pub struct SessionManager {
	sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn create_session(&self, relay: Arc<Relay>) -> Session {
		let session = Session {
			id: session_id(),
			relay,
			stream: Arc::new(Mutex::new(None)),
		};
		self
			.sessions
			.write()
			.insert(session.id.to_string(), session.clone());
		session
	}

	pub fn get_session(&self, id: &str) -> Option<Session> {
		self.sessions.read().get(id).cloned()
	}

	pub fn remove_session(&self, id: &str) -> Option<Session> {
		self.sessions.write().remove(id)
	}
}

/// Handle that removes its session when dropped; tied to the response body
/// of streaming requests so an abandoned stream cleans itself up.
pub struct SessionDropper {
	manager: Arc<SessionManager>,
	id: Option<Arc<str>>,
}

pub fn dropper(manager: Arc<SessionManager>, id: Arc<str>) -> SessionDropper {
	SessionDropper {
		manager,
		id: Some(id),
	}
}

impl Drop for SessionDropper {
	fn drop(&mut self) {
		let Some(id) = self.id.take() else {
			return;
		};
		debug!("delete session {id}");
		self.manager.remove_session(id.as_ref());
	}
}
