use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::store::ServiceId;

#[cfg(test)]
#[path = "stats_tests.rs"]
mod tests;

/// One proxied call. The analytics collaborator aggregates these; the
/// gateway only emits.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
	pub service_id: ServiceId,
	pub success: bool,
	pub latency_ms: u64,
	pub created_at: DateTime<Utc>,
}

pub trait StatsSink: Send + Sync + 'static {
	fn record(&self, record: &CallRecord);
}

/// Default sink: structured log lines, picked up by whatever ships logs.
#[derive(Debug, Default)]
pub struct TracingSink;

impl StatsSink for TracingSink {
	fn record(&self, record: &CallRecord) {
		info!(
			target: "stats",
			service = record.service_id,
			success = record.success,
			latency_ms = record.latency_ms,
			"tool call",
		);
	}
}

/// Best-effort recorder over a bounded channel. `record` never blocks the
/// proxy path: when the buffer is full the record is dropped and a counter
/// incremented.
#[derive(Debug, Clone)]
pub struct StatsRecorder {
	tx: mpsc::Sender<CallRecord>,
	dropped: Arc<AtomicU64>,
}

impl StatsRecorder {
	pub fn spawn(buffer: usize, sink: Arc<dyn StatsSink>) -> StatsRecorder {
		let (tx, mut rx) = mpsc::channel::<CallRecord>(buffer.max(1));
		tokio::spawn(async move {
			while let Some(record) = rx.recv().await {
				sink.record(&record);
			}
		});
		StatsRecorder {
			tx,
			dropped: Arc::new(AtomicU64::new(0)),
		}
	}

	pub fn record(&self, service_id: ServiceId, success: bool, latency: Duration) {
		let record = CallRecord {
			service_id,
			success,
			latency_ms: latency.as_millis() as u64,
			created_at: Utc::now(),
		};
		if self.tx.try_send(record).is_err() {
			self.dropped.fetch_add(1, Ordering::Relaxed);
		}
	}

	pub fn dropped(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}
}
