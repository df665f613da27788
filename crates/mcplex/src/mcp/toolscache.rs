use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rmcp::model::Tool;
use tracing::warn;

use crate::mcp::upstream::{TransportError, UpstreamClient};
use crate::store::ServiceId;

#[cfg(test)]
#[path = "toolscache_tests.rs"]
mod tests;

/// Snapshot of the tools a service advertised at the last successful listing.
#[derive(Debug, Clone)]
pub struct ToolsEntry {
	pub service_id: ServiceId,
	pub tools: Arc<Vec<Tool>>,
	pub fetched_at: DateTime<Utc>,
}

/// Per-service tool snapshots. Written at handler build, invalidated on
/// eviction, refreshed on access once an entry goes stale. Readers tolerate
/// staleness within the TTL; this is an optimistic snapshot, not a source of
/// truth.
#[derive(Debug)]
pub struct ToolsCache {
	ttl: Duration,
	entries: RwLock<HashMap<ServiceId, ToolsEntry>>,
}

impl ToolsCache {
	pub fn new(ttl: Duration) -> Self {
		Self {
			ttl,
			entries: RwLock::new(HashMap::new()),
		}
	}

	pub fn insert(&self, service_id: ServiceId, tools: Vec<Tool>) -> ToolsEntry {
		let entry = ToolsEntry {
			service_id,
			tools: Arc::new(tools),
			fetched_at: Utc::now(),
		};
		self.entries.write().insert(service_id, entry.clone());
		entry
	}

	pub fn get(&self, service_id: ServiceId) -> Option<ToolsEntry> {
		self.entries.read().get(&service_id).cloned()
	}

	pub fn invalidate(&self, service_id: ServiceId) {
		self.entries.write().remove(&service_id);
	}

	fn is_fresh(&self, entry: &ToolsEntry) -> bool {
		let age = Utc::now().signed_duration_since(entry.fetched_at);
		age.to_std().map(|age| age < self.ttl).unwrap_or(true)
	}

	/// Read the entry for a service, refreshing through the given live client
	/// when the snapshot is stale or absent. A failed refresh falls back to
	/// the stale entry when one exists.
	pub async fn get_fresh(&self, client: &UpstreamClient) -> Result<ToolsEntry, TransportError> {
		let service_id = client.service_id();
		let stale = match self.get(service_id) {
			Some(entry) if self.is_fresh(&entry) => return Ok(entry),
			other => other,
		};
		match client.list_tools().await {
			Ok(tools) => Ok(self.insert(service_id, tools)),
			Err(e) => match stale {
				Some(entry) => {
					warn!(service = %client.name(), "tools refresh failed, serving stale snapshot: {e}");
					Ok(entry)
				},
				None => Err(e),
			},
		}
	}
}
