use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[cfg(test)]
#[path = "local_tests.rs"]
mod tests;

pub type ServiceId = i64;
pub type GroupId = i64;
pub type UserId = i64;

/// Transport spoken by an upstream MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
	Stdio,
	Sse,
	StreamableHttp,
}

impl fmt::Display for TransportType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransportType::Stdio => write!(f, "stdio"),
			TransportType::Sse => write!(f, "sse"),
			TransportType::StreamableHttp => write!(f, "streamable_http"),
		}
	}
}

/// One upstream MCP server definition. Immutable from the gateway's point of
/// view except for `enabled`; writes happen in an external control plane.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
	pub id: ServiceId,
	/// URL-safe name, unique; used in the proxy path.
	pub name: String,
	pub display_name: String,
	pub description: String,
	pub transport: TransportType,
	/// stdio only
	pub command: Option<String>,
	pub args: Vec<String>,
	pub default_env: BTreeMap<String, String>,
	/// sse / streamable_http only
	pub endpoint_url: Option<String>,
	pub headers: BTreeMap<String, String>,
	pub allow_user_override: bool,
	pub enabled: bool,
}

/// A user-owned bundle of services exposed as one MCP endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
	pub id: GroupId,
	pub user_id: UserId,
	pub name: String,
	pub display_name: String,
	pub description: String,
	/// Ordered and deduplicated. Members may reference services that no
	/// longer exist; stale members are skipped, never fatal.
	pub service_ids: Vec<ServiceId>,
	pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
	#[default]
	Unknown,
	Healthy,
	Unhealthy,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("not found")]
	NotFound,
	#[error("store error: {0}")]
	Internal(String),
}

/// Read-only contract over the external metadata store. The gateway never
/// writes through this; invalidation arrives as explicit signals against the
/// handler cache.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
	async fn get_service(&self, id: ServiceId) -> Result<Service, StoreError>;
	async fn get_service_by_name(&self, name: &str) -> Result<Service, StoreError>;
	/// Missing ids are omitted from the result, not an error.
	async fn get_services_by_ids(&self, ids: &[ServiceId]) -> Result<Vec<Service>, StoreError>;
	async fn get_group_by_name(&self, name: &str) -> Result<Group, StoreError>;
	async fn get_user_overlay(
		&self,
		user: UserId,
		service: ServiceId,
	) -> Result<BTreeMap<String, String>, StoreError>;
}

#[derive(Default)]
struct LocalState {
	services: IndexMap<ServiceId, Service>,
	groups: IndexMap<GroupId, Group>,
	overlays: HashMap<(UserId, ServiceId), BTreeMap<String, String>>,
}

/// In-process store fed from the config file. This is the backing store for
/// standalone deployments and tests; a relational implementation lives behind
/// the same trait in the control plane.
#[derive(Default)]
pub struct LocalStore {
	state: RwLock<LocalState>,
}

impl LocalStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn insert_service(&self, svc: Service) {
		self.state.write().services.insert(svc.id, svc);
	}

	pub fn insert_group(&self, group: Group) {
		self.state.write().groups.insert(group.id, group);
	}

	pub fn insert_overlay(&self, user: UserId, service: ServiceId, env: BTreeMap<String, String>) {
		self.state.write().overlays.insert((user, service), env);
	}

	/// Toggling enablement is the one mutation the gateway observes; the
	/// handler cache notices through fingerprint revalidation.
	pub fn set_service_enabled(&self, id: ServiceId, enabled: bool) -> bool {
		let mut state = self.state.write();
		match state.services.get_mut(&id) {
			Some(svc) => {
				svc.enabled = enabled;
				true
			},
			None => false,
		}
	}

	pub fn remove_service(&self, id: ServiceId) -> bool {
		self.state.write().services.shift_remove(&id).is_some()
	}
}

#[async_trait]
impl MetadataStore for LocalStore {
	async fn get_service(&self, id: ServiceId) -> Result<Service, StoreError> {
		self
			.state
			.read()
			.services
			.get(&id)
			.cloned()
			.ok_or(StoreError::NotFound)
	}

	async fn get_service_by_name(&self, name: &str) -> Result<Service, StoreError> {
		self
			.state
			.read()
			.services
			.values()
			.find(|s| s.name == name)
			.cloned()
			.ok_or(StoreError::NotFound)
	}

	async fn get_services_by_ids(&self, ids: &[ServiceId]) -> Result<Vec<Service>, StoreError> {
		let state = self.state.read();
		Ok(
			ids
				.iter()
				.filter_map(|id| state.services.get(id).cloned())
				.collect(),
		)
	}

	async fn get_group_by_name(&self, name: &str) -> Result<Group, StoreError> {
		self
			.state
			.read()
			.groups
			.values()
			.find(|g| g.name == name)
			.cloned()
			.ok_or(StoreError::NotFound)
	}

	async fn get_user_overlay(
		&self,
		user: UserId,
		service: ServiceId,
	) -> Result<BTreeMap<String, String>, StoreError> {
		Ok(
			self
				.state
				.read()
				.overlays
				.get(&(user, service))
				.cloned()
				.unwrap_or_default(),
		)
	}
}
