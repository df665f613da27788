use std::sync::Arc;
use std::time::Instant;

use rmcp::model::{
	ClientJsonRpcMessage, ClientRequest, ErrorCode, ErrorData, Implementation, ListPromptsResult,
	ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, Prompt, ProtocolVersion,
	Resource, ResourceTemplate, ServerCapabilities, ServerInfo, ServerJsonRpcMessage, ServerResult,
};
use tracing::debug;

use crate::mcp::aggregator::{EXECUTE_TOOL, GroupAggregator, SEARCH_TOOLS};
use crate::mcp::toolscache::ToolsCache;
use crate::mcp::upstream::UpstreamClient;
use crate::stats::StatsRecorder;
use crate::store::Service;

#[cfg(test)]
#[path = "relay_tests.rs"]
mod tests;

/// A single proxied service: the shared transport plus the capability
/// snapshots collected when the handler was built. Tools go through the
/// tools cache so they can refresh; the rarer capability lists are pinned at
/// build time.
pub struct SingleProxy {
	pub service: Service,
	pub client: Arc<UpstreamClient>,
	pub resources: Vec<Resource>,
	pub resource_templates: Vec<ResourceTemplate>,
	pub prompts: Vec<Prompt>,
}

enum RelayKind {
	Single(SingleProxy),
	Group(GroupAggregator),
}

/// The in-process MCP server behind an output adapter. Requests are
/// dispatched in order per session; every request produces a JSON-RPC reply
/// carrying the request id, wrong answers included.
pub struct Relay {
	kind: RelayKind,
	tools_cache: Arc<ToolsCache>,
	stats: StatsRecorder,
}

impl Relay {
	pub fn single(proxy: SingleProxy, tools_cache: Arc<ToolsCache>, stats: StatsRecorder) -> Self {
		Self {
			kind: RelayKind::Single(proxy),
			tools_cache,
			stats,
		}
	}

	pub fn group(
		aggregator: GroupAggregator,
		tools_cache: Arc<ToolsCache>,
		stats: StatsRecorder,
	) -> Self {
		Self {
			kind: RelayKind::Group(aggregator),
			tools_cache,
			stats,
		}
	}

	/// All transports this relay proxies onto; the handler cache closes
	/// them on eviction.
	pub fn clients(&self) -> Vec<Arc<UpstreamClient>> {
		match &self.kind {
			RelayKind::Single(p) => vec![p.client.clone()],
			RelayKind::Group(a) => a.member_clients(),
		}
	}

	/// Dispatch one incoming message. Requests yield a reply; notifications
	/// and stray responses yield nothing.
	pub async fn handle(&self, message: ClientJsonRpcMessage) -> Option<ServerJsonRpcMessage> {
		match message {
			ClientJsonRpcMessage::Request(r) => {
				let id = r.id.clone();
				let reply = match self.dispatch(r.request).await {
					Ok(result) => ServerJsonRpcMessage::response(result, id),
					Err(e) => ServerJsonRpcMessage::error(e, id),
				};
				Some(reply)
			},
			ClientJsonRpcMessage::Notification(_) => {
				// The upstream handshake already ran when the handler was
				// built; client notifications have nothing to drive here.
				debug!("dropping client notification");
				None
			},
			_ => None,
		}
	}

	async fn dispatch(&self, request: ClientRequest) -> Result<ServerResult, ErrorData> {
		match request {
			ClientRequest::InitializeRequest(ir) => Ok(ServerResult::InitializeResult(
				self.server_info(ir.params.protocol_version),
			)),
			ClientRequest::PingRequest(_) | ClientRequest::SetLevelRequest(_) => {
				Ok(ServerResult::empty(()))
			},
			ClientRequest::ListToolsRequest(_) => {
				let tools = match &self.kind {
					RelayKind::Single(p) => self
						.tools_cache
						.get_fresh(&p.client)
						.await
						.map(|entry| entry.tools.as_ref().clone())
						.map_err(internal)?,
					RelayKind::Group(a) => a.tools(),
				};
				Ok(ServerResult::ListToolsResult(ListToolsResult {
					tools,
					..Default::default()
				}))
			},
			ClientRequest::CallToolRequest(ctr) => {
				let name = ctr.params.name.as_ref();
				match &self.kind {
					RelayKind::Single(p) => {
						let start = Instant::now();
						let result = p.client.call_tool(name, ctr.params.arguments.clone()).await;
						let success = matches!(&result, Ok(r) if !r.is_error.unwrap_or(false));
						self.stats.record(p.service.id, success, start.elapsed());
						Ok(ServerResult::CallToolResult(result.map_err(internal)?))
					},
					RelayKind::Group(a) => match name {
						SEARCH_TOOLS => Ok(ServerResult::CallToolResult(
							a.search_tools(ctr.params.arguments.as_ref()).await,
						)),
						EXECUTE_TOOL => Ok(ServerResult::CallToolResult(
							a.execute_tool(ctr.params.arguments.as_ref())
								.await
								.map_err(internal)?,
						)),
						other => Err(ErrorData::invalid_params(
							format!("unknown tool {other:?}; groups expose search_tools and execute_tool"),
							None,
						)),
					},
				}
			},
			ClientRequest::ListResourcesRequest(_) => {
				let resources = match &self.kind {
					RelayKind::Single(p) => p.resources.clone(),
					RelayKind::Group(a) => a.resources(),
				};
				Ok(ServerResult::ListResourcesResult(ListResourcesResult {
					resources,
					..Default::default()
				}))
			},
			ClientRequest::ReadResourceRequest(rrr) => match &self.kind {
				RelayKind::Single(p) => Ok(ServerResult::ReadResourceResult(
					p.client
						.read_resource(&rrr.params.uri)
						.await
						.map_err(internal)?,
				)),
				RelayKind::Group(a) => match a.read_resource(&rrr.params.uri).await {
					Some(result) => Ok(ServerResult::ReadResourceResult(result)),
					None => Err(ErrorData::invalid_params(
						format!("unknown resource {:?}", rrr.params.uri),
						None,
					)),
				},
			},
			ClientRequest::ListResourceTemplatesRequest(_) => {
				let resource_templates = match &self.kind {
					RelayKind::Single(p) => p.resource_templates.clone(),
					RelayKind::Group(_) => Vec::new(),
				};
				Ok(ServerResult::ListResourceTemplatesResult(
					ListResourceTemplatesResult {
						resource_templates,
						..Default::default()
					},
				))
			},
			ClientRequest::ListPromptsRequest(_) => {
				let prompts = match &self.kind {
					RelayKind::Single(p) => p.prompts.clone(),
					RelayKind::Group(_) => Vec::new(),
				};
				Ok(ServerResult::ListPromptsResult(ListPromptsResult {
					prompts,
					..Default::default()
				}))
			},
			ClientRequest::GetPromptRequest(gpr) => match &self.kind {
				RelayKind::Single(p) => Ok(ServerResult::GetPromptResult(
					p.client
						.get_prompt(&gpr.params.name, gpr.params.arguments.clone())
						.await
						.map_err(internal)?,
				)),
				RelayKind::Group(_) => Err(ErrorData::invalid_params(
					"prompts are not available on group endpoints",
					None,
				)),
			},
			other => Err(ErrorData::new(
				ErrorCode::METHOD_NOT_FOUND,
				format!("unsupported method {}", other.method()),
				None,
			)),
		}
	}

	fn server_info(&self, protocol_version: ProtocolVersion) -> ServerInfo {
		let instructions = match &self.kind {
			RelayKind::Single(p) => {
				if p.service.description.is_empty() {
					None
				} else {
					Some(p.service.description.clone())
				}
			},
			RelayKind::Group(a) => Some(format!(
				"Gateway endpoint for the {} group. Call search_tools to discover \
				 tools across its services, then execute_tool to invoke one.",
				a.group().display_name
			)),
		};
		ServerInfo {
			protocol_version,
			capabilities: ServerCapabilities::builder()
				.enable_tools()
				.enable_resources()
				.enable_prompts()
				.build(),
			server_info: Implementation::from_build_env(),
			instructions,
		}
	}
}

fn internal(e: impl std::fmt::Display) -> ErrorData {
	ErrorData::internal_error(e.to_string(), None)
}
