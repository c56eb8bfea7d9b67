#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use lazybot_domain::ChannelLogin;
use lazybot_platform::StreamStatusSource;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::registry::{ActiveStreamRegistry, StreamStatusSink};
use super::task::ScheduledTask;

pub const AUDIT_INTERVAL: Duration = Duration::from_secs(60);
/// Checks in a row without a confirmed live channel before the auditor stops itself.
pub const MAX_CONSECUTIVE_MISSES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditOutcome {
	/// At least one registry channel is confirmed live.
	Confirmed { live: usize, phantoms: Vec<ChannelLogin> },
	/// Nothing in the registry is live (or the registry is empty).
	Miss { phantoms: Vec<ChannelLogin>, misses: u32 },
	/// Status API failed; the registry is left as is.
	Skipped,
}

/// Cross-checks the registry against the status API and removes phantoms.
pub struct LivenessAuditor {
	registry: Arc<ActiveStreamRegistry>,
	source: Arc<dyn StreamStatusSource>,
	sink: Arc<dyn StreamStatusSink>,
	interval: Duration,
	misses: AtomicU32,
	task: Mutex<Option<ScheduledTask>>,
}

impl LivenessAuditor {
	pub fn new(
		registry: Arc<ActiveStreamRegistry>,
		source: Arc<dyn StreamStatusSource>,
		sink: Arc<dyn StreamStatusSink>,
		interval: Duration,
	) -> Self {
		Self {
			registry,
			source,
			sink,
			interval,
			misses: AtomicU32::new(0),
			task: Mutex::new(None),
		}
	}

	/// Start checking (immediately, then every interval). Returns false when already running.
	pub fn start(self: &Arc<Self>) -> bool {
		let mut slot = self.task.lock();
		if slot.is_some() {
			return false;
		}

		self.misses.store(0, Ordering::Relaxed);
		let this = Arc::downgrade(self);
		*slot = Some(ScheduledTask::every(self.interval, true, move || {
			let this = this.clone();
			async move {
				if let Some(auditor) = this.upgrade() {
					auditor.check_once().await;
				}
			}
		}));
		info!(interval_secs = self.interval.as_secs(), "liveness auditor started");
		true
	}

	/// Returns false when not running.
	pub fn stop(&self) -> bool {
		match self.task.lock().take() {
			Some(task) => {
				task.cancel();
				info!("liveness auditor stopped");
				true
			}
			None => false,
		}
	}

	pub fn is_running(&self) -> bool {
		self.task.lock().is_some()
	}

	pub fn consecutive_misses(&self) -> u32 {
		self.misses.load(Ordering::Relaxed)
	}

	pub async fn check_once(&self) -> AuditOutcome {
		let channels = self.registry.snapshot();
		if channels.is_empty() {
			debug!("liveness audit: registry empty");
			let misses = self.record_miss();
			return AuditOutcome::Miss {
				phantoms: Vec::new(),
				misses,
			};
		}

		let live: HashSet<ChannelLogin> = match self.source.live_channels(&channels).await {
			Ok(live) => live,
			Err(e) => {
				warn!(error = %e, "liveness audit: status lookup failed; trusting registry this cycle");
				return AuditOutcome::Skipped;
			}
		};

		let (confirmed, phantoms): (Vec<ChannelLogin>, Vec<ChannelLogin>) =
			channels.into_iter().partition(|c| live.contains(c));

		for phantom in &phantoms {
			info!(channel = %phantom, "liveness audit: removing phantom channel");
			metrics::counter!("lazybot_auditor_phantoms_removed_total").increment(1);
			self.sink.on_stream_status_change(phantom, false).await;
		}

		if confirmed.is_empty() {
			let misses = self.record_miss();
			AuditOutcome::Miss { phantoms, misses }
		} else {
			self.misses.store(0, Ordering::Relaxed);
			debug!(live = confirmed.len(), "liveness audit: registry confirmed");
			AuditOutcome::Confirmed {
				live: confirmed.len(),
				phantoms,
			}
		}
	}

	fn record_miss(&self) -> u32 {
		let misses = self.misses.fetch_add(1, Ordering::Relaxed) + 1;
		if misses >= MAX_CONSECUTIVE_MISSES {
			info!(misses, "liveness audit: no live channels confirmed; stopping");
			self.stop();
		}
		misses
	}
}
