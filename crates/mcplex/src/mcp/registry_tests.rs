use std::collections::HashMap;
use std::time::Duration;

use super::*;
use crate::config::LogFormat;
use crate::store::{HealthStatus, TransportType};

fn test_config() -> Arc<Config> {
	Arc::new(Config {
		listen: "127.0.0.1:0".parse().unwrap(),
		metadata_timeout: Duration::from_secs(1),
		initialize_timeout: Duration::from_secs(2),
		call_timeout: Duration::from_secs(2),
		ping_interval: Duration::from_secs(15),
		tools_cache_ttl: Duration::from_secs(300),
		stats_buffer: 16,
		log_format: LogFormat::Text,
		tokens: HashMap::new(),
	})
}

fn test_cache() -> Arc<HandlerCache> {
	let stats = StatsRecorder::spawn(16, Arc::new(crate::stats::TracingSink));
	HandlerCache::new(
		test_config(),
		Arc::new(ToolsCache::new(Duration::from_secs(300))),
		Arc::new(HealthTracker::new()),
		stats,
	)
}

fn stdio_service(id: ServiceId, name: &str, command: &str) -> Service {
	Service {
		id,
		name: name.to_string(),
		display_name: name.to_string(),
		description: String::new(),
		transport: TransportType::Stdio,
		command: Some(command.to_string()),
		args: Vec::new(),
		default_env: Default::default(),
		endpoint_url: None,
		headers: Default::default(),
		allow_user_override: true,
		enabled: true,
	}
}

fn empty_group() -> Group {
	Group {
		id: 9,
		user_id: 5,
		name: "g".to_string(),
		display_name: "g".to_string(),
		description: String::new(),
		service_ids: Vec::new(),
		enabled: true,
	}
}

fn make_entry(cache: &Arc<HandlerCache>, key: HandlerKey, fingerprint: u64) -> CachedHandler {
	let stats = StatsRecorder::spawn(16, Arc::new(crate::stats::TracingSink));
	let aggregator = GroupAggregator::new(
		empty_group(),
		Vec::new(),
		cache.tools().clone(),
		stats.clone(),
	);
	let relay = Arc::new(Relay::group(aggregator, cache.tools().clone(), stats));
	CachedHandler {
		key,
		fingerprint,
		built_at: Instant::now(),
		adapter: OutputAdapter::Http(StreamableHttpService::new(relay.clone())),
		clients: relay.clients(),
		keepalive: CancellationToken::new(),
	}
}

#[test]
fn test_handler_key_canonical_strings() {
	assert_eq!(
		HandlerKey::Global {
			service: 3,
			scope: Scope::Sse
		}
		.to_string(),
		"global-service-3"
	);
	assert_eq!(
		HandlerKey::Global {
			service: 3,
			scope: Scope::Http
		}
		.to_string(),
		"global-service-3-http"
	);
	assert_eq!(
		HandlerKey::User {
			user: 7,
			service: 3,
			scope: Scope::Sse
		}
		.to_string(),
		"user-7-service-3"
	);
	assert_eq!(
		HandlerKey::Group { group: 2, user: 7 }.to_string(),
		"group-2-user-7"
	);
}

#[test]
fn test_service_fingerprint_tracks_construction_inputs() {
	let svc = stdio_service(1, "svc", "echo-mcp-mock");
	let base = fingerprint_service(&EffectiveConfig::resolve(&svc, None));
	assert_eq!(
		base,
		fingerprint_service(&EffectiveConfig::resolve(&svc, None)),
		"fingerprint must be deterministic"
	);

	let mut changed = svc.clone();
	changed
		.default_env
		.insert("KEY".to_string(), "value".to_string());
	assert_ne!(
		base,
		fingerprint_service(&EffectiveConfig::resolve(&changed, None))
	);

	let mut changed = svc.clone();
	changed.args.push("--verbose".to_string());
	assert_ne!(
		base,
		fingerprint_service(&EffectiveConfig::resolve(&changed, None))
	);

	// an overlay is a construction input for user-scoped handlers
	let overlay = std::collections::BTreeMap::from([("K".to_string(), "v".to_string())]);
	assert_ne!(
		base,
		fingerprint_service(&EffectiveConfig::resolve(&svc, Some(&overlay)))
	);
}

#[test]
fn test_group_fingerprint_tracks_members() {
	let group = empty_group();
	let a = stdio_service(1, "a", "cmd-a");
	let b = stdio_service(2, "b", "cmd-b");
	let cfg = |s: &Service| EffectiveConfig::resolve(s, None);

	let fp_ab = fingerprint_group(&group, &[(a.clone(), cfg(&a)), (b.clone(), cfg(&b))]);
	let fp_ba = fingerprint_group(&group, &[(b.clone(), cfg(&b)), (a.clone(), cfg(&a))]);
	assert_ne!(fp_ab, fp_ba, "member order is part of the fingerprint");

	let mut a2 = a.clone();
	a2.command = Some("cmd-a-v2".to_string());
	let fp_changed = fingerprint_group(&group, &[(a2.clone(), cfg(&a2)), (b.clone(), cfg(&b))]);
	assert_ne!(fp_ab, fp_changed, "member config change must re-fingerprint");

	let mut other = empty_group();
	other.id = 10;
	let fp_other = fingerprint_group(&other, &[(a.clone(), cfg(&a)), (b.clone(), cfg(&b))]);
	assert_ne!(fp_ab, fp_other);
}

#[tokio::test]
async fn test_install_prefers_incumbent_on_equal_fingerprint() {
	let cache = test_cache();
	let key = HandlerKey::Group { group: 9, user: 5 };
	let first = cache.install(make_entry(&cache, key, 42));
	let second = cache.install(make_entry(&cache, key, 42));
	assert!(Arc::ptr_eq(&first, &second), "incumbent must win the race");
	assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_install_replaces_stale_fingerprint() {
	let cache = test_cache();
	let key = HandlerKey::Group { group: 9, user: 5 };
	let first = cache.install(make_entry(&cache, key, 1));
	let second = cache.install(make_entry(&cache, key, 2));
	assert!(!Arc::ptr_eq(&first, &second));
	assert_eq!(cache.len(), 1);
	assert_eq!(second.fingerprint, 2);
}

#[tokio::test]
async fn test_lookup_evicts_on_fingerprint_mismatch() {
	let cache = test_cache();
	let key = HandlerKey::Group { group: 9, user: 5 };
	cache.install(make_entry(&cache, key, 1));
	assert!(cache.lookup(&key, 1).is_some());
	assert!(cache.lookup(&key, 2).is_none());
	assert!(cache.is_empty(), "mismatched entry must be evicted");
}

#[tokio::test]
async fn test_failed_build_is_not_cached() {
	let cache = test_cache();
	let svc = stdio_service(1, "ghost", "mcplex-test-no-such-binary");
	let result = cache
		.get_or_build_service(&svc, Scope::Sse, None, None)
		.await;
	assert!(result.is_err());
	assert!(cache.is_empty());
	assert_eq!(cache.health().status(1), HealthStatus::Unhealthy);
}

#[tokio::test]
async fn test_evict_removes_and_invalidates_tools() {
	let cache = test_cache();
	let key = HandlerKey::Group { group: 9, user: 5 };
	cache.install(make_entry(&cache, key, 1));
	cache.tools().insert(1, Vec::new());
	cache.evict(&key);
	assert!(cache.is_empty());
}
