use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::response::Response;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::mcp::Error;
use crate::mcp::aggregator::{GroupAggregator, GroupMember};
use crate::mcp::health::HealthTracker;
use crate::mcp::keepalive;
use crate::mcp::relay::{Relay, SingleProxy};
use crate::mcp::sse::SseService;
use crate::mcp::streamablehttp::StreamableHttpService;
use crate::mcp::toolscache::ToolsCache;
use crate::mcp::upstream::{EffectiveConfig, TransportError, UpstreamClient};
use crate::stats::StatsRecorder;
use crate::store::{Group, GroupId, Service, ServiceId, UserId};

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;

/// Which output surface a handler serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
	Sse,
	Http,
}

/// Canonical cache key. The `Display` form is the wire-visible shape used in
/// logs; equality and hashing work on the typed form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKey {
	Global {
		service: ServiceId,
		scope: Scope,
	},
	User {
		user: UserId,
		service: ServiceId,
		scope: Scope,
	},
	Group {
		group: GroupId,
		user: UserId,
	},
}

impl fmt::Display for HandlerKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			HandlerKey::Global {
				service,
				scope: Scope::Sse,
			} => write!(f, "global-service-{service}"),
			HandlerKey::Global {
				service,
				scope: Scope::Http,
			} => write!(f, "global-service-{service}-http"),
			HandlerKey::User {
				user,
				service,
				scope: Scope::Sse,
			} => write!(f, "user-{user}-service-{service}"),
			HandlerKey::User {
				user,
				service,
				scope: Scope::Http,
			} => write!(f, "user-{user}-service-{service}-http"),
			HandlerKey::Group { group, user } => write!(f, "group-{group}-user-{user}"),
		}
	}
}

/// Content hash over the inputs that affect handler construction. Stable for
/// the process lifetime, which is exactly the cache's lifetime.
pub fn fingerprint_service(config: &EffectiveConfig) -> u64 {
	let mut hasher = DefaultHasher::new();
	config.hash(&mut hasher);
	hasher.finish()
}

/// Groups hash their ordered membership and each member's construction
/// config, so mutating a member rebuilds the group handler too.
pub fn fingerprint_group(group: &Group, members: &[(Service, EffectiveConfig)]) -> u64 {
	let mut hasher = DefaultHasher::new();
	group.id.hash(&mut hasher);
	for (service, config) in members {
		service.id.hash(&mut hasher);
		config.hash(&mut hasher);
	}
	hasher.finish()
}

pub enum OutputAdapter {
	Sse(SseService),
	Http(StreamableHttpService),
}

impl OutputAdapter {
	pub async fn handle(&self, action: &str, request: Request) -> Result<Response, Error> {
		match self {
			OutputAdapter::Sse(s) => s.handle(action, request).await,
			OutputAdapter::Http(s) => s.handle(action, request).await,
		}
	}
}

/// A built handler: the output adapter plus everything it owns. The cache is
/// the owner; adapters and relays hold non-owning views, and eviction closes
/// in deterministic order (keepalive, then transports).
pub struct CachedHandler {
	pub key: HandlerKey,
	pub fingerprint: u64,
	pub built_at: Instant,
	pub adapter: OutputAdapter,
	clients: Vec<Arc<UpstreamClient>>,
	keepalive: CancellationToken,
}

impl CachedHandler {
	async fn close(&self) {
		self.keepalive.cancel();
		for client in &self.clients {
			client.close().await;
		}
	}
}

/// Keyed map of live output adapters. Builds happen outside the lock; a lost
/// install race closes the losing transports (at most one live transport per
/// key at any instant).
pub struct HandlerCache {
	config: Arc<Config>,
	tools: Arc<ToolsCache>,
	health: Arc<HealthTracker>,
	stats: StatsRecorder,
	entries: RwLock<HashMap<HandlerKey, Arc<CachedHandler>>>,
}

impl HandlerCache {
	pub fn new(
		config: Arc<Config>,
		tools: Arc<ToolsCache>,
		health: Arc<HealthTracker>,
		stats: StatsRecorder,
	) -> Arc<Self> {
		Arc::new(Self {
			config,
			tools,
			health,
			stats,
			entries: RwLock::new(HashMap::new()),
		})
	}

	pub fn tools(&self) -> &Arc<ToolsCache> {
		&self.tools
	}

	pub fn health(&self) -> &Arc<HealthTracker> {
		&self.health
	}

	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.read().is_empty()
	}

	pub async fn get_or_build_service(
		self: &Arc<Self>,
		service: &Service,
		scope: Scope,
		user: Option<UserId>,
		overlay: Option<&BTreeMap<String, String>>,
	) -> Result<Arc<CachedHandler>, TransportError> {
		let key = match user {
			Some(user) => HandlerKey::User {
				user,
				service: service.id,
				scope,
			},
			None => HandlerKey::Global {
				service: service.id,
				scope,
			},
		};
		let config = EffectiveConfig::resolve(service, overlay);
		let fingerprint = fingerprint_service(&config);
		if let Some(existing) = self.lookup(&key, fingerprint) {
			return Ok(existing);
		}

		debug!(key = %key, service = %service.name, "building handler");
		let client = Arc::new(UpstreamClient::new(
			service.id,
			&service.name,
			config,
			self.config.initialize_timeout,
			self.config.call_timeout,
		));
		let proxy = match self.connect_single(service, &client).await {
			Ok(proxy) => proxy,
			Err(e) => {
				// failed builds are never cached
				client.close().await;
				self.health.mark_unhealthy(service.id);
				return Err(e);
			},
		};
		let relay = Arc::new(Relay::single(proxy, self.tools.clone(), self.stats.clone()));
		let adapter = match scope {
			Scope::Sse => OutputAdapter::Sse(SseService::new(relay.clone())),
			Scope::Http => OutputAdapter::Http(StreamableHttpService::new(relay.clone())),
		};
		Ok(self.install(CachedHandler {
			key,
			fingerprint,
			built_at: Instant::now(),
			adapter,
			clients: relay.clients(),
			keepalive: CancellationToken::new(),
		}))
	}

	async fn connect_single(
		&self,
		service: &Service,
		client: &Arc<UpstreamClient>,
	) -> Result<SingleProxy, TransportError> {
		if client.needs_keepalive() {
			client.start().await?;
		}
		client.initialize().await?;
		self.health.mark_healthy(service.id);

		match client.list_tools().await {
			Ok(tools) => {
				self.tools.insert(service.id, tools);
			},
			Err(e) => warn!(service = %service.name, "initial tool listing failed: {e}"),
		}
		// not every upstream implements these; absence is normal
		let resources = client.list_resources().await.unwrap_or_else(|e| {
			debug!(service = %service.name, "no resources: {e}");
			Vec::new()
		});
		let resource_templates = client.list_resource_templates().await.unwrap_or_else(|e| {
			debug!(service = %service.name, "no resource templates: {e}");
			Vec::new()
		});
		let prompts = client.list_prompts().await.unwrap_or_else(|e| {
			debug!(service = %service.name, "no prompts: {e}");
			Vec::new()
		});

		Ok(SingleProxy {
			service: service.clone(),
			client: client.clone(),
			resources,
			resource_templates,
			prompts,
		})
	}

	/// Group build: one shared transport per member; a member that fails to
	/// initialize fails the whole build and releases everything built so
	/// far. Disabled and stale members were already skipped by the caller.
	pub async fn get_or_build_group(
		self: &Arc<Self>,
		group: &Group,
		members: Vec<(Service, Option<BTreeMap<String, String>>)>,
	) -> Result<Arc<CachedHandler>, TransportError> {
		let key = HandlerKey::Group {
			group: group.id,
			user: group.user_id,
		};
		let configs: Vec<(Service, EffectiveConfig)> = members
			.into_iter()
			.map(|(service, overlay)| {
				let config = EffectiveConfig::resolve(&service, overlay.as_ref());
				(service, config)
			})
			.collect();
		let fingerprint = fingerprint_group(group, &configs);
		if let Some(existing) = self.lookup(&key, fingerprint) {
			return Ok(existing);
		}

		debug!(key = %key, group = %group.name, "building group handler");
		let mut built: Vec<GroupMember> = Vec::with_capacity(configs.len());
		for (service, config) in configs {
			let client = Arc::new(UpstreamClient::new(
				service.id,
				&service.name,
				config,
				self.config.initialize_timeout,
				self.config.call_timeout,
			));
			let connected = async {
				if client.needs_keepalive() {
					client.start().await?;
				}
				client.initialize().await
			}
			.await;
			if let Err(e) = connected {
				client.close().await;
				self.health.mark_unhealthy(service.id);
				for member in &built {
					member.client.close().await;
				}
				return Err(e);
			}
			self.health.mark_healthy(service.id);
			match client.list_tools().await {
				Ok(tools) => {
					self.tools.insert(service.id, tools);
				},
				Err(e) => warn!(service = %service.name, "initial tool listing failed: {e}"),
			}
			built.push(GroupMember { service, client });
		}

		let aggregator =
			GroupAggregator::new(group.clone(), built, self.tools.clone(), self.stats.clone());
		let relay = Arc::new(Relay::group(
			aggregator,
			self.tools.clone(),
			self.stats.clone(),
		));
		let adapter = OutputAdapter::Http(StreamableHttpService::new(relay.clone()));
		Ok(self.install(CachedHandler {
			key,
			fingerprint,
			built_at: Instant::now(),
			adapter,
			clients: relay.clients(),
			keepalive: CancellationToken::new(),
		}))
	}

	/// Hit when the fingerprint still matches; a stale entry is evicted so
	/// the caller rebuilds against the current record.
	fn lookup(self: &Arc<Self>, key: &HandlerKey, fingerprint: u64) -> Option<Arc<CachedHandler>> {
		let stale = {
			let entries = self.entries.read();
			match entries.get(key) {
				Some(entry) if entry.fingerprint == fingerprint => return Some(entry.clone()),
				Some(_) => true,
				None => false,
			}
		};
		if stale {
			info!(key = %key, "handler fingerprint changed, evicting");
			self.evict(key);
		}
		None
	}

	/// Install a freshly built handler. If a concurrent builder installed an
	/// equivalent entry first, prefer the incumbent and close the loser;
	/// stale incumbents are replaced and closed.
	fn install(self: &Arc<Self>, built: CachedHandler) -> Arc<CachedHandler> {
		let key = built.key;
		let entry = Arc::new(built);
		let (winner, loser) = {
			let mut entries = self.entries.write();
			match entries.get(&key) {
				Some(existing) if existing.fingerprint == entry.fingerprint => {
					(existing.clone(), Some(entry.clone()))
				},
				_ => {
					let old = entries.insert(key, entry.clone());
					(entry.clone(), old)
				},
			}
		};
		if let Some(loser) = loser {
			debug!(key = %key, "closing superseded handler");
			tokio::spawn(async move { loser.close().await });
		}
		if Arc::ptr_eq(&winner, &entry) {
			self.start_keepalives(&winner);
		}
		winner
	}

	fn start_keepalives(self: &Arc<Self>, entry: &Arc<CachedHandler>) {
		for client in &entry.clients {
			if client.needs_keepalive() {
				keepalive::spawn(
					self.clone(),
					Arc::downgrade(entry),
					client.clone(),
					entry.keepalive.clone(),
					self.config.ping_interval,
				);
			}
		}
	}

	/// Remove and close an entry. Tool snapshots for its services go with
	/// it; the next build repopulates them.
	pub fn evict(&self, key: &HandlerKey) {
		let removed = self.entries.write().remove(key);
		self.close_removed(key, removed);
	}

	/// Evict only if `entry` is still the installed handler. Keepalive loops
	/// use this so a loop belonging to a replaced entry can never tear down
	/// its successor.
	pub fn evict_entry(&self, key: &HandlerKey, entry: &Arc<CachedHandler>) {
		let removed = {
			let mut entries = self.entries.write();
			match entries.get(key) {
				Some(current) if Arc::ptr_eq(current, entry) => entries.remove(key),
				_ => None,
			}
		};
		self.close_removed(key, removed);
	}

	fn close_removed(&self, key: &HandlerKey, removed: Option<Arc<CachedHandler>>) {
		if let Some(entry) = removed {
			info!(key = %key, "evicting handler");
			for client in &entry.clients {
				self.tools.invalidate(client.service_id());
			}
			tokio::spawn(async move { entry.close().await });
		}
	}

	/// Orderly shutdown: drain the map and close every handler in place.
	pub async fn close_all(&self) {
		let entries: Vec<_> = {
			let mut map = self.entries.write();
			map.drain().map(|(_, entry)| entry).collect()
		};
		for entry in entries {
			entry.close().await;
		}
	}
}
