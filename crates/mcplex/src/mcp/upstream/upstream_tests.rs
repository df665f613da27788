use std::collections::BTreeMap;
use std::time::Duration;

use super::*;
use crate::store::{Service, TransportType};

fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
	pairs
		.iter()
		.map(|(k, v)| (k.to_string(), v.to_string()))
		.collect()
}

fn stdio_service(default_env: BTreeMap<String, String>, allow_override: bool) -> Service {
	Service {
		id: 1,
		name: "svc".to_string(),
		display_name: "svc".to_string(),
		description: String::new(),
		transport: TransportType::Stdio,
		command: Some("echo-mcp-mock".to_string()),
		args: vec!["--flag".to_string()],
		default_env,
		endpoint_url: None,
		headers: BTreeMap::new(),
		allow_user_override: allow_override,
		enabled: true,
	}
}

fn sse_service() -> Service {
	Service {
		id: 2,
		name: "remote".to_string(),
		display_name: "remote".to_string(),
		description: String::new(),
		transport: TransportType::Sse,
		command: None,
		args: Vec::new(),
		default_env: BTreeMap::new(),
		endpoint_url: Some("http://127.0.0.1:1/sse".to_string()),
		headers: env(&[("authorization", "Bearer abc")]),
		allow_user_override: false,
		enabled: true,
	}
}

#[test]
fn test_merge_right_wins() {
	let base = env(&[("BASE", "base"), ("OVERRIDE_ME", "default")]);
	let overlay = env(&[("USER_ENV", "u"), ("OVERRIDE_ME", "mine")]);
	let merged = merge(&base, Some(&overlay));
	assert_eq!(
		merged,
		env(&[("BASE", "base"), ("USER_ENV", "u"), ("OVERRIDE_ME", "mine")])
	);
	// every overlay key wins; every other key falls back to the base
	for (k, v) in &merged {
		let expect = overlay.get(k).unwrap_or_else(|| &base[k]);
		assert_eq!(v, expect);
	}
}

#[test]
fn test_effective_config_applies_overlay_for_stdio() {
	let svc = stdio_service(env(&[("BASE", "base"), ("OVERRIDE_ME", "default")]), true);
	let overlay = env(&[("USER_ENV", "u"), ("OVERRIDE_ME", "mine")]);
	let cfg = EffectiveConfig::resolve(&svc, Some(&overlay));
	assert_eq!(cfg.env.get("BASE").map(String::as_str), Some("base"));
	assert_eq!(cfg.env.get("USER_ENV").map(String::as_str), Some("u"));
	assert_eq!(cfg.env.get("OVERRIDE_ME").map(String::as_str), Some("mine"));
	assert_eq!(cfg.env.len(), 3);
}

#[test]
fn test_effective_config_ignores_overlay_when_not_allowed() {
	let svc = stdio_service(env(&[("BASE", "base")]), false);
	let overlay = env(&[("BASE", "evil")]);
	let cfg = EffectiveConfig::resolve(&svc, Some(&overlay));
	assert_eq!(cfg.env.get("BASE").map(String::as_str), Some("base"));
}

#[test]
fn test_effective_config_headers_for_sse() {
	let svc = sse_service();
	let overlay = env(&[("x-extra", "1")]);
	let mut svc = svc;
	svc.allow_user_override = true;
	let cfg = EffectiveConfig::resolve(&svc, Some(&overlay));
	assert_eq!(cfg.url.as_deref(), Some("http://127.0.0.1:1/sse"));
	assert_eq!(cfg.headers.len(), 2);
	assert!(cfg.command.is_none());
	assert!(cfg.env.is_empty());
}

#[tokio::test]
async fn test_initialize_requires_start_for_sse() {
	let svc = sse_service();
	let cfg = EffectiveConfig::resolve(&svc, None);
	let client = UpstreamClient::new(
		svc.id,
		&svc.name,
		cfg,
		Duration::from_secs(1),
		Duration::from_secs(1),
	);
	let err = client.initialize().await.expect_err("must require start");
	assert_eq!(err.phase, Phase::Initialize);
	assert!(err.to_string().contains("transport not started"));
}

#[tokio::test]
async fn test_close_is_idempotent() {
	let svc = sse_service();
	let cfg = EffectiveConfig::resolve(&svc, None);
	let client = UpstreamClient::new(
		svc.id,
		&svc.name,
		cfg,
		Duration::from_secs(1),
		Duration::from_secs(1),
	);
	client.close().await;
	client.close().await;
	// calls after close consistently fail closed
	let err = client.initialize().await.expect_err("closed");
	assert!(err.to_string().contains("transport closed"));
	let err = client.ping().await.expect_err("closed");
	assert!(err.to_string().contains("transport closed"));
}

#[tokio::test]
async fn test_calls_require_initialize() {
	let svc = stdio_service(BTreeMap::new(), false);
	let cfg = EffectiveConfig::resolve(&svc, None);
	let client = UpstreamClient::new(
		svc.id,
		&svc.name,
		cfg,
		Duration::from_secs(1),
		Duration::from_secs(1),
	);
	let err = client.list_tools().await.expect_err("not initialized");
	assert!(err.to_string().contains("transport not initialized"));
}
