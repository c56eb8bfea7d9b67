#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lazybot_domain::{ChannelLogin, ConnectionState};
use lazybot_platform::ads::{AdFetchError, AdScheduleSource};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::registry::ActiveStreamRegistry;
use super::supervisor::TransportSupervisor;
use super::sync::ChannelSettingsCache;
use super::task::ScheduledTask;

#[derive(Debug, Clone)]
pub struct AdNotifierSettings {
	pub poll_interval: Duration,
	/// Alert this long before the break.
	pub lead: Duration,
	pub min_delay: Duration,
	/// Waits before each extra attempt after a transient fetch failure.
	pub retry_delays: Vec<Duration>,
}

impl Default for AdNotifierSettings {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_secs(30),
			lead: Duration::from_secs(60),
			min_delay: Duration::from_secs(5),
			retry_delays: vec![Duration::from_secs(1), Duration::from_secs(3)],
		}
	}
}

/// `max(min_delay, until - lead)`, with a break already in the past treated as now.
pub fn fire_delay(now: DateTime<Utc>, next_ad_at: DateTime<Utc>, lead: Duration, min_delay: Duration) -> Duration {
	let until = (next_ad_at - now).to_std().unwrap_or(Duration::ZERO);
	until.saturating_sub(lead).max(min_delay)
}

/// Delivers the pre-break alert.
#[async_trait::async_trait]
pub trait AdAlertSink: Send + Sync + 'static {
	async fn send_ad_alert(&self, channel: &ChannelLogin, next_ad_at: DateTime<Utc>) -> anyhow::Result<()>;
}

/// Posts the configured message in the channel's chat.
pub struct TransportAdAlertSink {
	supervisor: TransportSupervisor,
	message: String,
}

impl TransportAdAlertSink {
	pub fn new(supervisor: TransportSupervisor, message: impl Into<String>) -> Self {
		Self {
			supervisor,
			message: message.into(),
		}
	}
}

#[async_trait::async_trait]
impl AdAlertSink for TransportAdAlertSink {
	async fn send_ad_alert(&self, channel: &ChannelLogin, _next_ad_at: DateTime<Utc>) -> anyhow::Result<()> {
		if self.supervisor.connection_state() != ConnectionState::Connected {
			anyhow::bail!("chat transport not connected");
		}
		self.supervisor.say(channel, &self.message).await?;
		Ok(())
	}
}

struct ArmedAlert {
	next_ad_at: DateTime<Utc>,
	timer: ScheduledTask,
}

/// Polls each live channel's ad schedule and keeps one alert timer per channel.
pub struct AdScheduleNotifier {
	registry: Arc<ActiveStreamRegistry>,
	cache: Arc<ChannelSettingsCache>,
	source: Arc<dyn AdScheduleSource>,
	sink: Arc<dyn AdAlertSink>,
	settings: AdNotifierSettings,
	timers: Mutex<HashMap<ChannelLogin, ArmedAlert>>,
	task: Mutex<Option<ScheduledTask>>,
}

impl AdScheduleNotifier {
	pub fn new(
		registry: Arc<ActiveStreamRegistry>,
		cache: Arc<ChannelSettingsCache>,
		source: Arc<dyn AdScheduleSource>,
		sink: Arc<dyn AdAlertSink>,
		settings: AdNotifierSettings,
	) -> Self {
		Self {
			registry,
			cache,
			source,
			sink,
			settings,
			timers: Mutex::new(HashMap::new()),
			task: Mutex::new(None),
		}
	}

	/// Returns false when already running.
	pub fn start(self: &Arc<Self>) -> bool {
		let mut slot = self.task.lock();
		if slot.is_some() {
			return false;
		}

		let this = Arc::downgrade(self);
		*slot = Some(ScheduledTask::every(self.settings.poll_interval, true, move || {
			let this = this.clone();
			async move {
				if let Some(notifier) = this.upgrade() {
					notifier.tick().await;
				}
			}
		}));
		info!(
			interval_secs = self.settings.poll_interval.as_secs(),
			"ad schedule notifier started"
		);
		true
	}

	/// Stop polling and drop every pending alert. Returns false when not running.
	pub fn stop(&self) -> bool {
		let was_running = match self.task.lock().take() {
			Some(task) => {
				task.cancel();
				true
			}
			None => false,
		};
		self.timers.lock().clear();
		if was_running {
			info!("ad schedule notifier stopped");
		}
		was_running
	}

	pub fn is_running(&self) -> bool {
		self.task.lock().is_some()
	}

	/// When the pending alert for `channel` targets, if any.
	pub fn armed_for(&self, channel: &ChannelLogin) -> Option<DateTime<Utc>> {
		self.timers.lock().get(channel).map(|armed| armed.next_ad_at)
	}

	/// Alerts armed but not yet fired.
	pub fn pending_alerts(&self) -> usize {
		self.timers.lock().values().filter(|armed| !armed.timer.is_finished()).count()
	}

	/// One reconciliation pass over live channels and pending timers.
	pub async fn tick(self: &Arc<Self>) {
		let mut channels: BTreeSet<ChannelLogin> = self.registry.snapshot().into_iter().collect();
		channels.extend(self.timers.lock().keys().cloned());

		let mut auth_warned = false;
		for channel in channels {
			if !self.registry.contains(&channel) {
				self.cancel(&channel, "channel offline");
				continue;
			}
			if !self.cache.ad_notifications_enabled(&channel) {
				self.cancel(&channel, "ad notifications disabled");
				continue;
			}

			match self.fetch_with_retry(&channel).await {
				Ok(Some(next_ad_at)) => self.arm(&channel, next_ad_at),
				Ok(None) => self.cancel(&channel, "no ad scheduled"),
				Err(e @ (AdFetchError::Auth(_) | AdFetchError::ScopeMissing(_))) => {
					if auth_warned {
						debug!(channel = %channel, error = %e, "ad schedule not authorized");
					} else {
						warn!(channel = %channel, error = %e, "ad schedule not authorized; skipping this tick");
						auth_warned = true;
					}
				}
				Err(e @ AdFetchError::Transient(_)) => {
					warn!(channel = %channel, error = %e, "ad schedule fetch kept failing; giving up this tick")
				}
				Err(e @ AdFetchError::Unexpected(_)) => {
					warn!(channel = %channel, error = %e, "ad schedule fetch failed")
				}
			}
		}
	}

	async fn fetch_with_retry(&self, channel: &ChannelLogin) -> Result<Option<DateTime<Utc>>, AdFetchError> {
		let mut delays = self.settings.retry_delays.iter();
		loop {
			match self.source.next_ad_at(channel).await {
				Err(e) if e.is_retryable() => match delays.next() {
					Some(delay) => {
						debug!(
							channel = %channel,
							delay_ms = delay.as_millis() as u64,
							error = %e,
							"ad schedule fetch failed; retrying"
						);
						tokio::time::sleep(*delay).await;
					}
					None => return Err(e),
				},
				other => return other,
			}
		}
	}

	/// Fired timers stay in the map so the same break is not announced twice.
	fn arm(self: &Arc<Self>, channel: &ChannelLogin, next_ad_at: DateTime<Utc>) {
		let mut timers = self.timers.lock();
		if timers.get(channel).is_some_and(|armed| armed.next_ad_at == next_ad_at) {
			return;
		}

		let now = Utc::now();
		if next_ad_at <= now {
			debug!(channel = %channel, next_ad_at = %next_ad_at, "ad break already started; not arming");
			timers.remove(channel);
			return;
		}

		let delay = fire_delay(now, next_ad_at, self.settings.lead, self.settings.min_delay);
		let this = Arc::downgrade(self);
		let target = channel.clone();
		let timer = ScheduledTask::after(delay, async move {
			if let Some(notifier) = this.upgrade() {
				notifier.fire(&target, next_ad_at).await;
			}
		});

		debug!(
			channel = %channel,
			next_ad_at = %next_ad_at,
			delay_ms = delay.as_millis() as u64,
			"ad alert armed"
		);
		// Replacing drops (and cancels) the previous timer.
		timers.insert(channel.clone(), ArmedAlert { next_ad_at, timer });
	}

	fn cancel(&self, channel: &ChannelLogin, reason: &'static str) {
		if self.timers.lock().remove(channel).is_some() {
			debug!(channel = %channel, reason, "ad alert cancelled");
		}
	}

	async fn fire(&self, channel: &ChannelLogin, next_ad_at: DateTime<Utc>) {
		if !self.registry.contains(channel) || !self.cache.ad_notifications_enabled(channel) {
			debug!(channel = %channel, "ad alert skipped: channel no longer eligible");
			return;
		}

		match self.sink.send_ad_alert(channel, next_ad_at).await {
			Ok(()) => {
				metrics::counter!("lazybot_ad_alerts_sent_total").increment(1);
				info!(channel = %channel, next_ad_at = %next_ad_at, "ad alert sent");
			}
			Err(e) => warn!(channel = %channel, error = %e, "ad alert delivery failed"),
		}
	}
}
