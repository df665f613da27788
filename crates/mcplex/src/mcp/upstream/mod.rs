use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use rmcp::RoleClient;
use rmcp::model::{
	CallToolRequestParam, CallToolResult, ClientInfo, ClientRequest, GetPromptRequestParam,
	GetPromptResult, Implementation, JsonObject, Prompt, ReadResourceRequestParam,
	ReadResourceResult, Resource, ResourceTemplate, Tool,
};
use rmcp::service::{Peer, RunningService, ServiceExt};
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::transport::sse_client::{SseClientConfig, SseClientTransport};
use rmcp::transport::streamable_http_client::{
	StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::store::{Service, ServiceId, TransportType};

#[cfg(test)]
#[path = "upstream_tests.rs"]
mod tests;

const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Phase of the upstream lifecycle an error originated in. Carried on every
/// transport error so logs and stats can attribute failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	Start,
	Initialize,
	Call,
	Ping,
}

impl fmt::Display for Phase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Phase::Start => write!(f, "start"),
			Phase::Initialize => write!(f, "initialize"),
			Phase::Call => write!(f, "call"),
			Phase::Ping => write!(f, "ping"),
		}
	}
}

#[derive(Error, Debug)]
pub enum UpstreamError {
	#[error("transport not started")]
	NotStarted,
	#[error("transport not initialized")]
	NotInitialized,
	#[error("transport closed")]
	Closed,
	#[error("timed out after {0:?}")]
	Timeout(Duration),
	#[error("spawn failed: {0}")]
	Spawn(#[from] io::Error),
	#[error("handshake failed: {0}")]
	Handshake(String),
	#[error("{0}")]
	Service(#[from] rmcp::ServiceError),
	#[error("sse connect failed: {0}")]
	SseConnect(String),
	#[error("invalid header {0:?}")]
	InvalidHeader(String),
	#[error("failed to build http client: {0}")]
	HttpClient(String),
	#[error("missing {0} configuration")]
	InvalidConfig(&'static str),
}

/// An [`UpstreamError`] wrapped with the phase and originating service; this
/// is the error that surfaces in logs and stats.
#[derive(Error, Debug)]
#[error("{phase} failed for service {service} ({name}): {source}")]
pub struct TransportError {
	pub service: ServiceId,
	pub name: String,
	pub phase: Phase,
	#[source]
	pub source: UpstreamError,
}

/// Construction inputs derived from a [`Service`] plus the requesting scope's
/// overlay. Maps are ordered so fingerprints over this struct are stable.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct EffectiveConfig {
	pub transport: TransportType,
	pub command: Option<String>,
	pub args: Vec<String>,
	pub env: BTreeMap<String, String>,
	pub url: Option<String>,
	pub headers: BTreeMap<String, String>,
}

impl EffectiveConfig {
	/// Merge semantics: right wins; the overlay may add or overwrite baseline
	/// keys, never delete them. The overlay is ignored entirely unless the
	/// service allows per-user overrides.
	pub fn resolve(svc: &Service, overlay: Option<&BTreeMap<String, String>>) -> Self {
		let overlay = if svc.allow_user_override {
			overlay
		} else {
			None
		};
		match svc.transport {
			TransportType::Stdio => EffectiveConfig {
				transport: svc.transport,
				command: svc.command.clone(),
				args: svc.args.clone(),
				env: merge(&svc.default_env, overlay),
				url: None,
				headers: BTreeMap::new(),
			},
			TransportType::Sse | TransportType::StreamableHttp => EffectiveConfig {
				transport: svc.transport,
				command: None,
				args: Vec::new(),
				env: BTreeMap::new(),
				url: svc.endpoint_url.clone(),
				headers: merge(&svc.headers, overlay),
			},
		}
	}
}

pub fn merge(
	base: &BTreeMap<String, String>,
	overlay: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
	let mut out = base.clone();
	if let Some(overlay) = overlay {
		for (k, v) in overlay {
			out.insert(k.clone(), v.clone());
		}
	}
	out
}

enum PendingTransport {
	ChildProcess(TokioChildProcess),
	Sse(SseClientTransport<reqwest::Client>),
	StreamableHttp(StreamableHttpClientTransport<reqwest::Client>),
}

enum ClientState {
	Idle,
	Started(PendingTransport),
	Ready(RunningService<RoleClient, ClientInfo>),
	Closed,
}

/// One upstream MCP server behind a uniform capability set, regardless of
/// transport. Lifecycle is two-phase: `start` opens the wire (spawns the
/// child, connects the SSE stream, builds the HTTP channel) and `initialize`
/// runs the MCP handshake. stdio starts implicitly on `initialize`; the HTTP
/// transports require an explicit `start` first.
pub struct UpstreamClient {
	service_id: ServiceId,
	name: String,
	config: EffectiveConfig,
	initialize_timeout: Duration,
	call_timeout: Duration,
	state: tokio::sync::Mutex<ClientState>,
}

impl fmt::Debug for UpstreamClient {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("UpstreamClient")
			.field("service_id", &self.service_id)
			.field("name", &self.name)
			.field("transport", &self.config.transport)
			.finish()
	}
}

impl UpstreamClient {
	pub fn new(
		service_id: ServiceId,
		name: impl Into<String>,
		config: EffectiveConfig,
		initialize_timeout: Duration,
		call_timeout: Duration,
	) -> Self {
		Self {
			service_id,
			name: name.into(),
			config,
			initialize_timeout,
			call_timeout,
			state: tokio::sync::Mutex::new(ClientState::Idle),
		}
	}

	pub fn service_id(&self) -> ServiceId {
		self.service_id
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn config(&self) -> &EffectiveConfig {
		&self.config
	}

	/// Whether this client holds a long-lived connection that needs keepalive
	/// pings. Child processes are supervised by the OS instead.
	pub fn needs_keepalive(&self) -> bool {
		self.config.transport != TransportType::Stdio
	}

	fn err(&self, phase: Phase, source: UpstreamError) -> TransportError {
		TransportError {
			service: self.service_id,
			name: self.name.clone(),
			phase,
			source,
		}
	}

	/// Open the transport without running the handshake. Idempotent once the
	/// transport is open or the client is ready.
	pub async fn start(&self) -> Result<(), TransportError> {
		let mut state = self.state.lock().await;
		match &*state {
			ClientState::Idle => {},
			ClientState::Started(_) | ClientState::Ready(_) => return Ok(()),
			ClientState::Closed => return Err(self.err(Phase::Start, UpstreamError::Closed)),
		}
		let pending = self
			.open_transport()
			.await
			.map_err(|e| self.err(Phase::Start, e))?;
		*state = ClientState::Started(pending);
		Ok(())
	}

	/// Run the MCP handshake within the configured bound. On failure the
	/// client is left closed and must be rebuilt; mid-session restarts are
	/// the handler cache's job, not this client's.
	pub async fn initialize(&self) -> Result<(), TransportError> {
		let mut state = self.state.lock().await;
		if matches!(&*state, ClientState::Idle if self.config.transport != TransportType::Stdio) {
			return Err(self.err(Phase::Initialize, UpstreamError::NotStarted));
		}
		let pending = match std::mem::replace(&mut *state, ClientState::Closed) {
			ClientState::Started(pending) => pending,
			// stdio spawns implicitly; no manual start required
			ClientState::Idle => self
				.open_transport()
				.await
				.map_err(|e| self.err(Phase::Start, e))?,
			ClientState::Ready(service) => {
				*state = ClientState::Ready(service);
				return Ok(());
			},
			ClientState::Closed => {
				return Err(self.err(Phase::Initialize, UpstreamError::Closed));
			},
		};

		let info = client_info();
		let handshake = async move {
			match pending {
				PendingTransport::ChildProcess(t) => info
					.serve(t)
					.await
					.map_err(|e| UpstreamError::Handshake(e.to_string())),
				PendingTransport::Sse(t) => info
					.serve(t)
					.await
					.map_err(|e| UpstreamError::Handshake(e.to_string())),
				PendingTransport::StreamableHttp(t) => info
					.serve(t)
					.await
					.map_err(|e| UpstreamError::Handshake(e.to_string())),
			}
		};
		let service = match timeout(self.initialize_timeout, handshake).await {
			Ok(Ok(service)) => service,
			Ok(Err(e)) => return Err(self.err(Phase::Initialize, e)),
			Err(_) => {
				return Err(self.err(
					Phase::Initialize,
					UpstreamError::Timeout(self.initialize_timeout),
				));
			},
		};
		debug!(service = %self.name, transport = %self.config.transport, "upstream initialized");
		*state = ClientState::Ready(service);
		Ok(())
	}

	async fn open_transport(&self) -> Result<PendingTransport, UpstreamError> {
		match self.config.transport {
			TransportType::Stdio => {
				let command = self
					.config
					.command
					.as_deref()
					.ok_or(UpstreamError::InvalidConfig("command"))?;
				let mut cmd = Command::new(command);
				cmd.args(&self.config.args).kill_on_drop(true);
				for (k, v) in &self.config.env {
					cmd.env(k, v);
				}
				let (transport, stderr) = TokioChildProcess::builder(cmd)
					.stderr(Stdio::piped())
					.spawn()?;
				if let Some(stderr) = stderr {
					let name = self.name.clone();
					tokio::spawn(async move {
						let mut lines = tokio::io::BufReader::new(stderr).lines();
						while let Ok(Some(line)) = lines.next_line().await {
							debug!(service = %name, "upstream stderr: {line}");
						}
					});
				}
				Ok(PendingTransport::ChildProcess(transport))
			},
			TransportType::Sse => {
				let url = self
					.config
					.url
					.as_deref()
					.ok_or(UpstreamError::InvalidConfig("url"))?;
				let client = http_client(&self.config.headers)?;
				let transport = SseClientTransport::start_with_client(
					client,
					SseClientConfig {
						sse_endpoint: url.to_string().into(),
						..Default::default()
					},
				)
				.await
				.map_err(|e| UpstreamError::SseConnect(e.to_string()))?;
				Ok(PendingTransport::Sse(transport))
			},
			TransportType::StreamableHttp => {
				let url = self
					.config
					.url
					.as_deref()
					.ok_or(UpstreamError::InvalidConfig("url"))?;
				let client = http_client(&self.config.headers)?;
				let transport = StreamableHttpClientTransport::with_client(
					client,
					StreamableHttpClientTransportConfig {
						uri: url.to_string().into(),
						..Default::default()
					},
				);
				Ok(PendingTransport::StreamableHttp(transport))
			},
		}
	}

	async fn ready_peer(&self, phase: Phase) -> Result<Peer<RoleClient>, TransportError> {
		let state = self.state.lock().await;
		match &*state {
			ClientState::Ready(service) => Ok(service.peer().clone()),
			ClientState::Closed => Err(self.err(phase, UpstreamError::Closed)),
			_ => Err(self.err(phase, UpstreamError::NotInitialized)),
		}
	}

	async fn with_timeout<T>(
		&self,
		phase: Phase,
		bound: Duration,
		fut: impl Future<Output = Result<T, rmcp::ServiceError>>,
	) -> Result<T, TransportError> {
		match timeout(bound, fut).await {
			Ok(Ok(v)) => Ok(v),
			Ok(Err(e)) => Err(self.err(phase, e.into())),
			Err(_) => Err(self.err(phase, UpstreamError::Timeout(bound))),
		}
	}

	pub async fn list_tools(&self) -> Result<Vec<Tool>, TransportError> {
		let peer = self.ready_peer(Phase::Call).await?;
		self
			.with_timeout(Phase::Call, self.call_timeout, async move {
				peer.list_tools(None).await
			})
			.await
			.map(|r| r.tools)
	}

	pub async fn list_resources(&self) -> Result<Vec<Resource>, TransportError> {
		let peer = self.ready_peer(Phase::Call).await?;
		self
			.with_timeout(Phase::Call, self.call_timeout, async move {
				peer.list_resources(None).await
			})
			.await
			.map(|r| r.resources)
	}

	pub async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>, TransportError> {
		let peer = self.ready_peer(Phase::Call).await?;
		self
			.with_timeout(Phase::Call, self.call_timeout, async move {
				peer.list_resource_templates(None).await
			})
			.await
			.map(|r| r.resource_templates)
	}

	pub async fn list_prompts(&self) -> Result<Vec<Prompt>, TransportError> {
		let peer = self.ready_peer(Phase::Call).await?;
		self
			.with_timeout(Phase::Call, self.call_timeout, async move {
				peer.list_prompts(None).await
			})
			.await
			.map(|r| r.prompts)
	}

	/// Tool-level failures come back as a result with `is_error` set; only
	/// transport-level failures error here.
	pub async fn call_tool(
		&self,
		name: &str,
		arguments: Option<JsonObject>,
	) -> Result<CallToolResult, TransportError> {
		let peer = self.ready_peer(Phase::Call).await?;
		let params = CallToolRequestParam {
			name: name.to_string().into(),
			arguments,
		};
		self
			.with_timeout(Phase::Call, self.call_timeout, async move {
				peer.call_tool(params).await
			})
			.await
	}

	pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, TransportError> {
		let peer = self.ready_peer(Phase::Call).await?;
		let params = ReadResourceRequestParam {
			uri: uri.to_string(),
		};
		self
			.with_timeout(Phase::Call, self.call_timeout, async move {
				peer.read_resource(params).await
			})
			.await
	}

	pub async fn get_prompt(
		&self,
		name: &str,
		arguments: Option<JsonObject>,
	) -> Result<GetPromptResult, TransportError> {
		let peer = self.ready_peer(Phase::Call).await?;
		let params = GetPromptRequestParam {
			name: name.to_string(),
			arguments,
		};
		self
			.with_timeout(Phase::Call, self.call_timeout, async move {
				peer.get_prompt(params).await
			})
			.await
	}

	pub async fn ping(&self) -> Result<(), TransportError> {
		let peer = self.ready_peer(Phase::Ping).await?;
		self
			.with_timeout(Phase::Ping, PING_TIMEOUT, async move {
				peer
					.send_request(ClientRequest::PingRequest(Default::default()))
					.await
			})
			.await
			.map(|_| ())
	}

	/// Release the child process or connection. Safe to call any number of
	/// times; calls after the first are no-ops.
	pub async fn close(&self) {
		let prev = {
			let mut state = self.state.lock().await;
			std::mem::replace(&mut *state, ClientState::Closed)
		};
		match prev {
			ClientState::Ready(service) => {
				let _ = service.cancel().await;
			},
			// A pending child transport is killed on drop; pending HTTP
			// transports have nothing to release yet.
			_ => {},
		}
		debug!(service = %self.name, "upstream closed");
	}
}

fn http_client(headers: &BTreeMap<String, String>) -> Result<reqwest::Client, UpstreamError> {
	let mut map = http::HeaderMap::new();
	for (k, v) in headers {
		let name = http::header::HeaderName::from_str(k)
			.map_err(|_| UpstreamError::InvalidHeader(k.clone()))?;
		let value = http::header::HeaderValue::from_str(v)
			.map_err(|_| UpstreamError::InvalidHeader(k.clone()))?;
		map.insert(name, value);
	}
	reqwest::Client::builder()
		.default_headers(map)
		.build()
		.map_err(|e| UpstreamError::HttpClient(e.to_string()))
}

fn client_info() -> ClientInfo {
	ClientInfo {
		protocol_version: Default::default(),
		capabilities: Default::default(),
		client_info: Implementation {
			name: env!("CARGO_PKG_NAME").to_string(),
			version: env!("CARGO_PKG_VERSION").to_string(),
			..Default::default()
		},
		..Default::default()
	}
}
