use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rmcp::model::Tool;

use super::*;

fn tool(name: &str, description: &str) -> Tool {
	Tool::new(
		name.to_string(),
		description.to_string(),
		Arc::new(serde_json::Map::new()),
	)
}

#[test]
fn test_insert_and_get() {
	let cache = ToolsCache::new(Duration::from_secs(300));
	assert!(cache.get(1).is_none());
	cache.insert(1, vec![tool("alpha", "alpha tool")]);
	let entry = cache.get(1).expect("entry");
	assert_eq!(entry.service_id, 1);
	assert_eq!(entry.tools.len(), 1);
	assert_eq!(entry.tools[0].name, "alpha");
}

#[test]
fn test_invalidate() {
	let cache = ToolsCache::new(Duration::from_secs(300));
	cache.insert(1, vec![tool("alpha", "alpha tool")]);
	cache.invalidate(1);
	assert!(cache.get(1).is_none());
}

#[test]
fn test_freshness_window() {
	let cache = ToolsCache::new(Duration::from_secs(300));
	let fresh = cache.insert(1, vec![]);
	assert!(cache.is_fresh(&fresh));

	let stale = ToolsEntry {
		service_id: 1,
		tools: Arc::new(vec![]),
		fetched_at: Utc::now() - chrono::Duration::seconds(301),
	};
	assert!(!cache.is_fresh(&stale));
}

#[test]
fn test_reinsert_replaces_snapshot() {
	let cache = ToolsCache::new(Duration::from_secs(300));
	cache.insert(1, vec![tool("alpha", "alpha tool")]);
	cache.insert(1, vec![tool("beta", "beta tool"), tool("gamma", "gamma tool")]);
	let entry = cache.get(1).expect("entry");
	assert_eq!(entry.tools.len(), 2);
	assert_eq!(entry.tools[0].name, "beta");
}
