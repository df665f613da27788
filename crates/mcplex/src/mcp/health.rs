use std::collections::HashMap;

use parking_lot::RwLock;

use crate::store::{HealthStatus, ServiceId};

/// Process-wide liveness view of upstream services, fed by initialize results
/// and the keepalive loop. Services the gateway has never contacted are
/// `unknown`.
#[derive(Debug, Default)]
pub struct HealthTracker {
	statuses: RwLock<HashMap<ServiceId, HealthStatus>>,
}

impl HealthTracker {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_healthy(&self, service: ServiceId) {
		self.statuses.write().insert(service, HealthStatus::Healthy);
	}

	pub fn mark_unhealthy(&self, service: ServiceId) {
		self
			.statuses
			.write()
			.insert(service, HealthStatus::Unhealthy);
	}

	pub fn status(&self, service: ServiceId) -> HealthStatus {
		self
			.statuses
			.read()
			.get(&service)
			.copied()
			.unwrap_or_default()
	}
}
