#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use lazybot_domain::ChannelLogin;
use lazybot_platform::StreamStatusSource;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::registry::{ActiveStreamRegistry, StreamStatusSink};
use super::sync::ChannelSettingsCache;
use super::task::ScheduledTask;

/// Periodically asks the status API which managed channels are live.
pub struct StreamStatusPoller {
	source: Arc<dyn StreamStatusSource>,
	cache: Arc<ChannelSettingsCache>,
	registry: Arc<ActiveStreamRegistry>,
	sink: Arc<dyn StreamStatusSink>,
	interval: Duration,
	task: Mutex<Option<ScheduledTask>>,
	cycles: watch::Sender<u64>,
}

impl StreamStatusPoller {
	pub fn new(
		source: Arc<dyn StreamStatusSource>,
		cache: Arc<ChannelSettingsCache>,
		registry: Arc<ActiveStreamRegistry>,
		sink: Arc<dyn StreamStatusSink>,
		interval: Duration,
	) -> Self {
		let (cycles, _) = watch::channel(0);
		Self {
			source,
			cache,
			registry,
			sink,
			interval,
			task: Mutex::new(None),
			cycles,
		}
	}

	/// One cycle: fetch snapshots and report every liveness transition.
	///
	/// A cycle counts as completed even when the API call fails.
	pub async fn poll_once(&self) {
		let channels = self.cache.managed();
		if channels.is_empty() {
			debug!("stream poll: no managed channels");
		} else {
			match self.source.stream_snapshots(&channels).await {
				Ok(snapshots) => {
					let live: HashSet<ChannelLogin> = snapshots
						.into_iter()
						.filter(|s| s.is_live())
						.map(|s| s.channel)
						.collect();
					for channel in &channels {
						let is_live = live.contains(channel);
						if is_live != self.registry.contains(channel) {
							self.sink.on_stream_status_change(channel, is_live).await;
						}
					}
					debug!(managed = channels.len(), live = live.len(), "stream poll complete");
				}
				Err(e) => warn!(error = %e, "stream poll failed"),
			}
		}
		self.cycles.send_modify(|n| *n += 1);
	}

	/// Returns false when already running.
	pub fn start(self: &Arc<Self>) -> bool {
		let mut slot = self.task.lock();
		if slot.is_some() {
			return false;
		}

		let this = Arc::downgrade(self);
		*slot = Some(ScheduledTask::every(self.interval, true, move || {
			let this = this.clone();
			async move {
				if let Some(poller) = this.upgrade() {
					poller.poll_once().await;
				}
			}
		}));
		info!(interval_secs = self.interval.as_secs(), "stream status poller started");
		true
	}

	/// Returns false when not running.
	pub fn stop(&self) -> bool {
		match self.task.lock().take() {
			Some(task) => {
				task.cancel();
				info!("stream status poller stopped");
				true
			}
			None => false,
		}
	}

	/// While the periodic poller is stopped, still run a cycle every interval so
	/// a lazy-connect bot notices channels going live.
	pub fn spawn_idle_discovery(self: &Arc<Self>) -> ScheduledTask {
		let this = Arc::downgrade(self);
		ScheduledTask::every(self.interval, false, move || {
			let this = this.clone();
			async move {
				if let Some(poller) = this.upgrade()
					&& !poller.is_running()
				{
					debug!("idle stream discovery cycle");
					poller.poll_once().await;
				}
			}
		})
	}

	pub fn is_running(&self) -> bool {
		self.task.lock().is_some()
	}

	pub fn completed_cycles(&self) -> u64 {
		*self.cycles.borrow()
	}

	/// Resolves once at least one cycle has completed.
	pub async fn wait_first_cycle(&self) {
		let mut rx = self.cycles.subscribe();
		let _ = rx.wait_for(|n| *n > 0).await;
	}
}
