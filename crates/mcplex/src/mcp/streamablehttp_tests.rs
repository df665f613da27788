use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Value, json};

use super::*;
use crate::mcp::aggregator::{GroupAggregator, GroupMember};
use crate::mcp::toolscache::ToolsCache;
use crate::mcp::upstream::{EffectiveConfig, UpstreamClient};
use crate::stats::StatsRecorder;
use crate::store::{Group, Service, TransportType};

fn group_relay() -> Arc<Relay> {
	let service = Service {
		id: 1,
		name: "svc".to_string(),
		display_name: "svc".to_string(),
		description: String::new(),
		transport: TransportType::Stdio,
		command: Some("echo-mcp-mock".to_string()),
		args: Vec::new(),
		default_env: BTreeMap::new(),
		endpoint_url: None,
		headers: BTreeMap::new(),
		allow_user_override: false,
		enabled: true,
	};
	let config = EffectiveConfig::resolve(&service, None);
	let client = Arc::new(UpstreamClient::new(
		1,
		"svc",
		config,
		Duration::from_secs(1),
		Duration::from_secs(1),
	));
	let cache = Arc::new(ToolsCache::new(Duration::from_secs(300)));
	let stats = StatsRecorder::spawn(16, Arc::new(crate::stats::TracingSink));
	let group = Group {
		id: 7,
		user_id: 42,
		name: "g".to_string(),
		display_name: "g".to_string(),
		description: String::new(),
		service_ids: vec![1],
		enabled: true,
	};
	let aggregator = GroupAggregator::new(
		group,
		vec![GroupMember { service, client }],
		cache.clone(),
		stats.clone(),
	);
	Arc::new(Relay::group(aggregator, cache, stats))
}

fn post(body: Value, session: Option<&str>) -> Request {
	let mut builder = Request::builder()
		.method("POST")
		.uri("/")
		.header(header::ACCEPT, "application/json, text/event-stream")
		.header(header::CONTENT_TYPE, "application/json");
	if let Some(session) = session {
		builder = builder.header(HEADER_SESSION_ID, session);
	}
	builder.body(Body::from(body.to_string())).unwrap()
}

fn initialize_body() -> Value {
	json!({
		"jsonrpc": "2.0",
		"id": 0,
		"method": "initialize",
		"params": {
			"protocolVersion": "2025-03-26",
			"capabilities": {},
			"clientInfo": {"name": "test", "version": "0.0.0"}
		}
	})
}

async fn json_body(response: Response) -> Value {
	let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
		.await
		.expect("body");
	serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn test_post_validates_accept_and_content_type() {
	let service = StreamableHttpService::new(group_relay());
	let request = Request::builder()
		.method("POST")
		.uri("/")
		.header(header::CONTENT_TYPE, "application/json")
		.body(Body::from(initialize_body().to_string()))
		.unwrap();
	let err = service.handle("", request).await.expect_err("missing accept");
	assert!(matches!(err, Error::InvalidAccept));

	let request = Request::builder()
		.method("POST")
		.uri("/")
		.header(header::ACCEPT, "application/json, text/event-stream")
		.header(header::CONTENT_TYPE, "text/plain")
		.body(Body::from(initialize_body().to_string()))
		.unwrap();
	let err = service.handle("", request).await.expect_err("bad content type");
	assert!(matches!(err, Error::InvalidContentType));
}

#[tokio::test]
async fn test_initialize_allocates_session() {
	let service = StreamableHttpService::new(group_relay());
	let response = service
		.handle("", post(initialize_body(), None))
		.await
		.expect("initialize");
	assert_eq!(response.status(), StatusCode::OK);
	let session = response
		.headers()
		.get(HEADER_SESSION_ID)
		.and_then(|v| v.to_str().ok())
		.expect("session header")
		.to_string();

	let reply = json_body(response).await;
	assert_eq!(reply["id"], json!(0));
	assert!(reply["result"]["protocolVersion"].is_string());

	// the allocated session answers follow-ups
	let list = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
	let response = service
		.handle("", post(list, Some(&session)))
		.await
		.expect("tools/list");
	assert_eq!(response.status(), StatusCode::OK);
	let reply = json_body(response).await;
	assert_eq!(reply["result"]["tools"].as_array().map(|t| t.len()), Some(2));
}

#[tokio::test]
async fn test_unknown_session_is_soft_error() {
	let service = StreamableHttpService::new(group_relay());
	let list = json!({"jsonrpc": "2.0", "id": 5, "method": "tools/list"});
	let response = service
		.handle("", post(list, Some("ghost")))
		.await
		.expect("soft error");
	// HTTP succeeds; the failure is in-band so clients reinitialize
	assert_eq!(response.status(), StatusCode::OK);
	let reply = json_body(response).await;
	assert_eq!(reply["id"], json!(5));
	assert_eq!(reply["error"]["code"], json!(-32001));
	assert!(
		reply["error"]["message"]
			.as_str()
			.expect("message")
			.contains("reinitialize")
	);
}

#[tokio::test]
async fn test_stateless_post_without_session() {
	let service = StreamableHttpService::new(group_relay());
	let list = json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"});
	let response = service.handle("", post(list, None)).await.expect("stateless");
	assert_eq!(response.status(), StatusCode::OK);
	let reply = json_body(response).await;
	let tools = reply["result"]["tools"].as_array().expect("tools");
	assert_eq!(tools.len(), 2);
	assert_eq!(tools[0]["name"], json!("search_tools"));
}

#[tokio::test]
async fn test_delete_requires_and_removes_session() {
	let service = StreamableHttpService::new(group_relay());
	let request = Request::builder()
		.method("DELETE")
		.uri("/")
		.body(Body::empty())
		.unwrap();
	let err = service.handle("", request).await.expect_err("missing header");
	assert!(matches!(err, Error::SessionIdRequired));

	let response = service
		.handle("", post(initialize_body(), None))
		.await
		.expect("initialize");
	let session = response
		.headers()
		.get(HEADER_SESSION_ID)
		.and_then(|v| v.to_str().ok())
		.expect("session header")
		.to_string();

	let request = Request::builder()
		.method("DELETE")
		.uri("/")
		.header(HEADER_SESSION_ID, session.as_str())
		.body(Body::empty())
		.unwrap();
	let response = service.handle("", request).await.expect("delete");
	assert_eq!(response.status(), StatusCode::ACCEPTED);

	// the session is gone: a follow-up gets the soft error
	let list = json!({"jsonrpc": "2.0", "id": 9, "method": "tools/list"});
	let response = service
		.handle("", post(list, Some(&session)))
		.await
		.expect("soft error");
	let reply = json_body(response).await;
	assert_eq!(reply["error"]["code"], json!(-32001));
}
