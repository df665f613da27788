use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use indexmap::IndexMap;
use rmcp::model::{
	CallToolResult, Content, JsonObject, RawResource, ReadResourceResult, Resource,
	ResourceContents, Tool,
};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::mcp::toolscache::ToolsCache;
use crate::mcp::upstream::{TransportError, UpstreamClient};
use crate::stats::StatsRecorder;
use crate::store::{Group, Service};

#[cfg(test)]
#[path = "aggregator_tests.rs"]
mod tests;

pub const SEARCH_TOOLS: &str = "search_tools";
pub const EXECUTE_TOOL: &str = "execute_tool";

const DEFAULT_SEARCH_LIMIT: usize = 10;
const MEMBER_RESOURCE_SCHEME: &str = "tools://";

/// One live member of a group: its metadata record and the shared transport
/// the group builder established.
pub struct GroupMember {
	pub service: Service,
	pub client: Arc<UpstreamClient>,
}

/// Virtualizes a group of MCP services behind two synthetic tools so a
/// client can discover and invoke tools without knowing the upstream
/// catalog.
pub struct GroupAggregator {
	group: Group,
	members: IndexMap<String, GroupMember>,
	tools_cache: Arc<ToolsCache>,
	stats: StatsRecorder,
}

impl GroupAggregator {
	pub fn new(
		group: Group,
		members: Vec<GroupMember>,
		tools_cache: Arc<ToolsCache>,
		stats: StatsRecorder,
	) -> Self {
		let members = members
			.into_iter()
			.map(|m| (m.service.name.clone(), m))
			.collect();
		Self {
			group,
			members,
			tools_cache,
			stats,
		}
	}

	pub fn group(&self) -> &Group {
		&self.group
	}

	pub fn member_clients(&self) -> Vec<Arc<UpstreamClient>> {
		self.members.values().map(|m| m.client.clone()).collect()
	}

	fn member_names(&self) -> Vec<&str> {
		self.members.keys().map(String::as_str).collect()
	}

	/// The two synthetic tools this group's virtual server advertises.
	pub fn tools(&self) -> Vec<Tool> {
		vec![self.search_tools_descriptor(), self.execute_tool_descriptor()]
	}

	fn search_tools_descriptor(&self) -> Tool {
		let schema = serde_json::json!({
			"type": "object",
			"properties": {
				"mcp_name": {
					"type": "string",
					"enum": self.member_names(),
					"description": "Name of the member MCP service to search.",
				},
				"tool_name": {
					"type": "string",
					"description": "Keywords matched against tool names and descriptions. Every whitespace- or comma-separated keyword must match.",
				},
				"limit": {
					"type": "integer",
					"description": "Maximum number of tools to return.",
					"default": DEFAULT_SEARCH_LIMIT,
				},
			},
			"required": ["mcp_name"],
		});
		Tool::new(
			SEARCH_TOOLS,
			format!(
				"Search the tools available from the services in the {} group. \
				 Returns a YAML listing of matching tools with their input schemas.",
				self.group.display_name
			),
			Arc::new(object(schema)),
		)
	}

	fn execute_tool_descriptor(&self) -> Tool {
		let schema = serde_json::json!({
			"type": "object",
			"properties": {
				"mcp_name": {
					"type": "string",
					"enum": self.member_names(),
					"description": "Name of the member MCP service that owns the tool.",
				},
				"tool_name": {
					"type": "string",
					"description": "Exact name of the tool to invoke, as returned by search_tools.",
				},
				"arguments": {
					"type": "object",
					"description": "Arguments for the tool, matching its input schema.",
				},
			},
			"required": ["mcp_name", "tool_name"],
		});
		Tool::new(
			EXECUTE_TOOL,
			format!(
				"Execute a tool on one of the services in the {} group. \
				 Pass the tool's own arguments directly in the `arguments` object; \
				 do not wrap them in a nested `arguments` key.",
				self.group.display_name
			),
			Arc::new(object(schema)),
		)
	}

	/// `search_tools`: resolve the member, read its tool snapshot, filter by
	/// keywords, render YAML. Argument problems come back as tool-level
	/// errors; the HTTP layer never sees them.
	pub async fn search_tools(&self, args: Option<&JsonObject>) -> CallToolResult {
		let Some(name) = args
			.and_then(|a| a.get("mcp_name"))
			.and_then(Value::as_str)
		else {
			return invalid_arguments("mcp_name is required");
		};
		let Some(member) = self.members.get(name) else {
			return invalid_arguments(format!(
				"unknown mcp_name {name:?}; expected one of {:?}",
				self.member_names()
			));
		};
		let limit = args
			.and_then(|a| a.get("limit"))
			.and_then(Value::as_u64)
			.map(|l| l as usize)
			.filter(|l| *l > 0)
			.unwrap_or(DEFAULT_SEARCH_LIMIT);
		let query = args
			.and_then(|a| a.get("tool_name"))
			.and_then(Value::as_str)
			.unwrap_or_default();

		let entry = match self.tools_cache.get_fresh(&member.client).await {
			Ok(entry) => entry,
			Err(e) => {
				debug!(group = %self.group.name, member = name, "tool listing failed: {e}");
				return invalid_arguments(format!("failed to list tools for {name:?}: {e}"));
			},
		};
		let mut matched = filter_tools(&entry.tools, query);
		matched.truncate(limit);
		render_listing(entry.tools.len(), &matched)
	}

	/// `execute_tool`: resolve the member and forward the call through the
	/// shared transport, returning the upstream result verbatim.
	pub async fn execute_tool(
		&self,
		args: Option<&JsonObject>,
	) -> Result<CallToolResult, TransportError> {
		let Some(name) = args
			.and_then(|a| a.get("mcp_name"))
			.and_then(Value::as_str)
		else {
			return Ok(invalid_arguments("mcp_name is required"));
		};
		let Some(tool_name) = args
			.and_then(|a| a.get("tool_name"))
			.and_then(Value::as_str)
		else {
			return Ok(invalid_arguments("tool_name is required"));
		};
		let Some(member) = self.members.get(name) else {
			return Ok(invalid_arguments(format!(
				"unknown mcp_name {name:?}; expected one of {:?}",
				self.member_names()
			)));
		};
		let arguments = match args.and_then(|a| a.get("arguments")) {
			None | Some(Value::Null) => None,
			Some(Value::Object(map)) => Some(map.clone()),
			Some(_) => return Ok(invalid_arguments("arguments must be an object")),
		};

		let start = Instant::now();
		let result = member.client.call_tool(tool_name, arguments).await;
		let success = match &result {
			Ok(r) => !r.is_error.unwrap_or(false),
			Err(_) => false,
		};
		self
			.stats
			.record(member.service.id, success, start.elapsed());
		result
	}

	/// One resource per member whose content is that member's tool listing.
	pub fn resources(&self) -> Vec<Resource> {
		self
			.members
			.values()
			.map(|m| {
				let mut raw = RawResource::new(
					format!("{MEMBER_RESOURCE_SCHEME}{}", m.service.name),
					m.service.display_name.clone(),
				);
				raw.description = Some(format!("Tool listing for the {} service", m.service.name));
				raw.mime_type = Some("text/yaml".to_string());
				Resource {
					raw,
					annotations: None,
				}
			})
			.collect()
	}

	/// Render a member's full tool listing; `None` when the uri does not
	/// name a member of this group.
	pub async fn read_resource(&self, uri: &str) -> Option<ReadResourceResult> {
		let name = uri.strip_prefix(MEMBER_RESOURCE_SCHEME)?;
		let member = self.members.get(name)?;
		let tools = match self.tools_cache.get_fresh(&member.client).await {
			Ok(entry) => entry.tools,
			// an unreachable member renders as an empty listing
			Err(_) => Arc::new(Vec::new()),
		};
		let listing = ToolListing::new(tools.len(), &tools.iter().collect::<Vec<_>>());
		let yaml = serde_yaml::to_string(&listing).unwrap_or_default();
		Some(ReadResourceResult {
			contents: vec![ResourceContents::text(yaml, uri)],
		})
	}
}

fn object(v: Value) -> JsonObject {
	match v {
		Value::Object(map) => map,
		_ => JsonObject::new(),
	}
}

fn invalid_arguments(msg: impl Into<String>) -> CallToolResult {
	CallToolResult::error(vec![Content::text(msg.into())])
}

/// Case-insensitive AND filter: every keyword must appear in the tool's name
/// or description. An empty query matches everything.
pub(crate) fn filter_tools<'a>(tools: &'a [Tool], query: &str) -> Vec<&'a Tool> {
	let keywords: Vec<String> = query
		.split(|c: char| c.is_whitespace() || c == ',')
		.filter(|s| !s.is_empty())
		.map(|s| s.to_lowercase())
		.collect();
	if keywords.is_empty() {
		return tools.iter().collect();
	}
	tools
		.iter()
		.filter(|t| {
			let name = t.name.to_lowercase();
			let description = t
				.description
				.as_deref()
				.unwrap_or_default()
				.to_lowercase();
			keywords
				.iter()
				.all(|k| name.contains(k.as_str()) || description.contains(k.as_str()))
		})
		.collect()
}

#[derive(Serialize)]
struct ToolListing {
	/// Total tools cached for the member, not the filtered count; hints to
	/// the model that a broader query may find more.
	tool_count: usize,
	current_time: String,
	tools: Vec<ToolSummary>,
}

#[derive(Serialize)]
struct ToolSummary {
	name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	description: Option<String>,
	input_schema: Value,
}

impl ToolListing {
	fn new(total: usize, tools: &[&Tool]) -> Self {
		ToolListing {
			tool_count: total,
			current_time: Utc::now().to_rfc3339(),
			tools: tools
				.iter()
				.map(|t| ToolSummary {
					name: t.name.to_string(),
					description: t.description.as_ref().map(|d| d.to_string()),
					input_schema: Value::Object((*t.input_schema).clone()),
				})
				.collect(),
		}
	}
}

fn render_listing(total: usize, tools: &[&Tool]) -> CallToolResult {
	let listing = ToolListing::new(total, tools);
	match serde_yaml::to_string(&listing) {
		Ok(yaml) => CallToolResult::success(vec![Content::text(yaml)]),
		Err(e) => invalid_arguments(format!("failed to render tool listing: {e}")),
	}
}
