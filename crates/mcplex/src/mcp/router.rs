use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use http::{StatusCode, header};
use serde_json::json;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::auth::{self, AuthUser, StaticTokens, TokenVerifier};
use crate::config::Config;
use crate::mcp::Error;
use crate::mcp::health::HealthTracker;
use crate::mcp::registry::{CachedHandler, HandlerCache, Scope};
use crate::mcp::toolscache::ToolsCache;
use crate::stats::{StatsRecorder, StatsSink, TracingSink};
use crate::store::{MetadataStore, Service, StoreError, TransportType, UserId};

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;

/// The HTTP front door: resolves proxy paths to services or groups, consults
/// the handler cache, and hands the stripped action path to the matched
/// output adapter.
#[derive(Clone)]
pub struct App {
	config: Arc<Config>,
	store: Arc<dyn MetadataStore>,
	cache: Arc<HandlerCache>,
	verifier: Arc<dyn TokenVerifier>,
}

impl App {
	pub fn new(config: Arc<Config>, store: Arc<dyn MetadataStore>) -> Self {
		Self::with_sink(config, store, Arc::new(TracingSink))
	}

	pub fn with_sink(
		config: Arc<Config>,
		store: Arc<dyn MetadataStore>,
		sink: Arc<dyn StatsSink>,
	) -> Self {
		let stats = StatsRecorder::spawn(config.stats_buffer, sink);
		let tools = Arc::new(ToolsCache::new(config.tools_cache_ttl));
		let health = Arc::new(HealthTracker::new());
		let cache = HandlerCache::new(config.clone(), tools, health, stats);
		let verifier: Arc<dyn TokenVerifier> = Arc::new(StaticTokens::new(config.tokens.clone()));
		Self {
			config,
			store,
			cache,
			verifier,
		}
	}

	pub fn cache(&self) -> &Arc<HandlerCache> {
		&self.cache
	}

	pub fn router(&self) -> Router {
		Router::new()
			.route("/proxy/{name}/sse", any(proxy_sse_redirect))
			.route("/proxy/{name}/sse/", any(proxy_sse_root))
			.route("/proxy/{name}/sse/{*action}", any(proxy_sse_action))
			.route("/proxy/{name}/mcp", any(proxy_http_root))
			.route("/proxy/{name}/mcp/", any(proxy_http_root))
			.route("/proxy/{name}/mcp/{*action}", any(proxy_http_action))
			.route("/group/{name}/mcp", any(group_root))
			.route("/group/{name}/mcp/", any(group_root))
			.route("/group/{name}/mcp/{*action}", any(group_action))
			.route("/services/{id}/tools", get(service_tools))
			.layer(axum::middleware::from_fn_with_state(
				self.verifier.clone(),
				auth::authenticate,
			))
			.with_state(self.clone())
	}

	async fn fetch<T>(
		&self,
		fut: impl Future<Output = Result<T, StoreError>>,
		not_found: Error,
	) -> Result<T, Error> {
		match timeout(self.config.metadata_timeout, fut).await {
			Ok(Ok(v)) => Ok(v),
			Ok(Err(StoreError::NotFound)) => Err(not_found),
			Ok(Err(e)) => Err(Error::Store(e.to_string())),
			Err(_) => Err(Error::Store("metadata fetch timed out".to_string())),
		}
	}

	async fn fetch_overlay(
		&self,
		user: UserId,
		service: &Service,
	) -> Result<BTreeMap<String, String>, Error> {
		match timeout(
			self.config.metadata_timeout,
			self.store.get_user_overlay(user, service.id),
		)
		.await
		{
			Ok(Ok(overlay)) => Ok(overlay),
			Ok(Err(StoreError::NotFound)) => Ok(BTreeMap::new()),
			Ok(Err(e)) => Err(Error::Store(e.to_string())),
			Err(_) => Err(Error::Store("metadata fetch timed out".to_string())),
		}
	}

	async fn dispatch_service(
		&self,
		name: &str,
		scope: Scope,
		action: &str,
		request: Request,
	) -> Result<Response, Error> {
		let service = self
			.fetch(self.store.get_service_by_name(name), Error::ServiceNotFound)
			.await?;
		if !service.enabled {
			return Err(Error::ServiceDisabled);
		}
		let user = request.extensions().get::<AuthUser>().map(|u| u.0);

		// User scoping applies only to stdio services that allow overrides,
		// and only for verified users; everyone else shares the global
		// handler. A failed user-scoped build degrades to the global handler
		// rather than failing the request.
		if let Some(user) = user
			&& service.allow_user_override
			&& service.transport == TransportType::Stdio
		{
			match self.user_scoped(&service, scope, user).await {
				Ok(entry) => return entry.adapter.handle(action, request).await,
				Err(e) => {
					warn!(
						service = %service.name,
						user,
						"user-scoped build failed, falling back to global handler: {e}"
					);
				},
			}
		}

		let entry = self
			.cache
			.get_or_build_service(&service, scope, None, None)
			.await?;
		entry.adapter.handle(action, request).await
	}

	async fn user_scoped(
		&self,
		service: &Service,
		scope: Scope,
		user: UserId,
	) -> Result<Arc<CachedHandler>, Error> {
		let overlay = self.fetch_overlay(user, service).await?;
		if overlay.is_empty() {
			// nothing to overlay: the global handler is identical, and a
			// per-user child process would just duplicate it
			return Ok(
				self
					.cache
					.get_or_build_service(service, scope, None, None)
					.await?,
			);
		}
		Ok(
			self
				.cache
				.get_or_build_service(service, scope, Some(user), Some(&overlay))
				.await?,
		)
	}

	async fn dispatch_group(
		&self,
		name: &str,
		action: &str,
		request: Request,
	) -> Result<Response, Error> {
		let group = self
			.fetch(self.store.get_group_by_name(name), Error::GroupNotFound)
			.await?;
		if !group.enabled {
			return Err(Error::GroupDisabled);
		}
		let services = self
			.fetch(
				self.store.get_services_by_ids(&group.service_ids),
				Error::GroupNotFound,
			)
			.await?;

		// Disabled and stale members are skipped, never fatal. Overlays are
		// scoped to the group's owner; groups are user-owned.
		let mut members = Vec::with_capacity(services.len());
		for service in services {
			if !service.enabled {
				info!(group = %group.name, service = %service.name, "skipping disabled member");
				continue;
			}
			let overlay = if service.allow_user_override {
				let overlay = self.fetch_overlay(group.user_id, &service).await?;
				(!overlay.is_empty()).then_some(overlay)
			} else {
				None
			};
			members.push((service, overlay));
		}

		let entry = self.cache.get_or_build_group(&group, members).await?;
		entry.adapter.handle(action, request).await
	}
}

async fn proxy_sse_redirect(Path(name): Path<String>, request: Request) -> Response {
	// keep relative URLs stable for SSE clients
	let query = request
		.uri()
		.query()
		.map(|q| format!("?{q}"))
		.unwrap_or_default();
	http::Response::builder()
		.status(StatusCode::MOVED_PERMANENTLY)
		.header(header::LOCATION, format!("/proxy/{name}/sse/{query}"))
		.body(axum::body::Body::empty())
		.expect("valid response")
		.into_response()
}

async fn proxy_sse_root(
	State(app): State<App>,
	Path(name): Path<String>,
	request: Request,
) -> Response {
	respond(app.dispatch_service(&name, Scope::Sse, "", request).await)
}

async fn proxy_sse_action(
	State(app): State<App>,
	Path((name, action)): Path<(String, String)>,
	request: Request,
) -> Response {
	respond(
		app
			.dispatch_service(&name, Scope::Sse, &action, request)
			.await,
	)
}

async fn proxy_http_root(
	State(app): State<App>,
	Path(name): Path<String>,
	request: Request,
) -> Response {
	respond(app.dispatch_service(&name, Scope::Http, "", request).await)
}

async fn proxy_http_action(
	State(app): State<App>,
	Path((name, action)): Path<(String, String)>,
	request: Request,
) -> Response {
	respond(
		app
			.dispatch_service(&name, Scope::Http, &action, request)
			.await,
	)
}

async fn group_root(State(app): State<App>, Path(name): Path<String>, request: Request) -> Response {
	respond(app.dispatch_group(&name, "", request).await)
}

async fn group_action(
	State(app): State<App>,
	Path((name, action)): Path<(String, String)>,
	request: Request,
) -> Response {
	respond(app.dispatch_group(&name, &action, request).await)
}

/// Tools-cache reader: the snapshot plus the service's computed health.
async fn service_tools(State(app): State<App>, Path(id): Path<i64>) -> Response {
	let health = app.cache.health().status(id);
	match app.cache.tools().get(id) {
		Some(entry) => Json(json!({
			"serviceId": id,
			"health": health,
			"fetchedAt": entry.fetched_at,
			"tools": entry.tools.as_ref(),
		}))
		.into_response(),
		None => (
			StatusCode::NOT_FOUND,
			Json(json!({"serviceId": id, "health": health, "error": "tools not cached"})),
		)
			.into_response(),
	}
}

fn respond(result: Result<Response, Error>) -> Response {
	match result {
		Ok(response) => response,
		Err(e) => {
			info!("request failed: {e}");
			e.into_response()
		},
	}
}
