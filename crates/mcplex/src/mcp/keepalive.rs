use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::mcp::registry::{CachedHandler, HandlerCache};
use crate::mcp::upstream::UpstreamClient;

/// Failures tolerated before the transport is declared dead.
const MAX_CONSECUTIVE_FAILURES: u32 = 2;

/// Background ping for one long-lived transport. Two consecutive failures
/// mark the service unhealthy, evict the owning cache entry, and end the
/// loop; the next request rebuilds from scratch. Cancellation is bound to
/// the cache entry's lifetime, and the weak handle guarantees a stale loop
/// can never evict the entry's successor.
pub fn spawn(
	cache: Arc<HandlerCache>,
	entry: Weak<CachedHandler>,
	client: Arc<UpstreamClient>,
	token: CancellationToken,
	interval: Duration,
) {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		// the first tick fires immediately; skip it, the client just connected
		ticker.tick().await;
		let mut failures = 0u32;
		loop {
			tokio::select! {
				_ = token.cancelled() => {
					debug!(service = %client.name(), "keepalive cancelled");
					return;
				}
				_ = ticker.tick() => {}
			}
			match client.ping().await {
				Ok(()) => {
					failures = 0;
					cache.health().mark_healthy(client.service_id());
				},
				Err(e) => {
					failures += 1;
					warn!(
						service = %client.name(),
						failures,
						"keepalive ping failed: {e}"
					);
					if failures >= MAX_CONSECUTIVE_FAILURES {
						cache.health().mark_unhealthy(client.service_id());
						if let Some(entry) = entry.upgrade() {
							cache.evict_entry(&entry.key, &entry);
						}
						return;
					}
				},
			}
		}
	});
}
