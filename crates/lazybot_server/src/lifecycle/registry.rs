#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lazybot_domain::{ChannelLogin, ConnectionState, Environment};
use lazybot_platform::TransportError;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::supervisor::TransportSupervisor;
use super::task::ScheduledTask;

pub const RECONNECT_MIN_DELAY: Duration = Duration::from_secs(1);
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

/// `RECONNECT_MIN_DELAY * 2^attempt`, capped at `RECONNECT_MAX_DELAY`.
pub fn reconnect_delay(attempt: u32) -> Duration {
	RECONNECT_MIN_DELAY
		.saturating_mul(1u32 << attempt.min(6))
		.min(RECONNECT_MAX_DELAY)
}

/// Channels currently believed to be live.
#[derive(Debug, Default)]
pub struct ActiveStreamRegistry {
	live: Mutex<BTreeSet<ChannelLogin>>,
}

impl ActiveStreamRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns whether membership changed. Adding a present channel or
	/// removing an absent one is a no-op.
	pub fn set_live(&self, channel: &ChannelLogin, is_live: bool) -> bool {
		let mut live = self.live.lock();
		let changed = if is_live {
			live.insert(channel.clone())
		} else {
			live.remove(channel)
		};
		metrics::gauge!("lazybot_registry_live_channels").set(live.len() as f64);
		changed
	}

	pub fn contains(&self, channel: &ChannelLogin) -> bool {
		self.live.lock().contains(channel)
	}

	pub fn len(&self) -> usize {
		self.live.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.live.lock().is_empty()
	}

	pub fn snapshot(&self) -> Vec<ChannelLogin> {
		self.live.lock().iter().cloned().collect()
	}
}

/// When the transport should be up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPolicy {
	pub environment: Environment,
	pub lazy_connect: bool,
}

impl ConnectPolicy {
	pub fn wants_connection(&self, active: usize) -> bool {
		let dev = self.environment.is_dev();
		(dev && !self.lazy_connect) || (!dev && (!self.lazy_connect || active > 0))
	}
}

/// Receives stream online/offline signals.
#[async_trait::async_trait]
pub trait StreamStatusSink: Send + Sync + 'static {
	async fn on_stream_status_change(&self, channel: &ChannelLogin, is_live: bool);
}

/// What a reassessment asked the transport to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassessAction {
	Idle,
	Connect,
	/// A wanted connect failed. Anything but a login rejection is retried with backoff.
	ConnectFailed(TransportError),
	/// Joins issued for registry channels the transport had not joined.
	JoinMissing(Vec<ChannelLogin>),
	Disconnect,
}

/// Applies liveness signals to the registry and drives the transport from it.
pub struct ConnectionDecisionEngine {
	registry: Arc<ActiveStreamRegistry>,
	policy: ConnectPolicy,
	supervisor: TransportSupervisor,
	this: Weak<Self>,
	reconnect_task: Mutex<Option<ScheduledTask>>,
	reconnect_attempts: AtomicU32,
}

impl ConnectionDecisionEngine {
	pub fn new(registry: Arc<ActiveStreamRegistry>, policy: ConnectPolicy, supervisor: TransportSupervisor) -> Arc<Self> {
		Arc::new_cyclic(|this| Self {
			registry,
			policy,
			supervisor,
			this: this.clone(),
			reconnect_task: Mutex::new(None),
			reconnect_attempts: AtomicU32::new(0),
		})
	}

	pub fn reconnect_scheduled(&self) -> bool {
		self.reconnect_task.lock().as_ref().is_some_and(|t| !t.is_finished())
	}

	/// Keep re-running the decision, backing off, until a connect goes through
	/// or is no longer wanted. A no-op while such a loop is already running.
	pub fn schedule_reconnect(&self) {
		let mut slot = self.reconnect_task.lock();
		if slot.as_ref().is_some_and(|t| !t.is_finished()) {
			return;
		}

		let engine = self.this.clone();
		*slot = Some(ScheduledTask::spawn(async move {
			loop {
				let Some(delay) = engine.upgrade().map(|e| e.next_reconnect_delay()) else {
					return;
				};
				tokio::time::sleep(delay).await;

				let Some(engine) = engine.upgrade() else {
					return;
				};
				match engine.reassess_connection_state().await {
					ReassessAction::ConnectFailed(e) if is_retryable(&e) => continue,
					_ => return,
				}
			}
		}));
	}

	/// The transport logged in: reset the backoff and drop any pending retry.
	pub fn note_connected(&self) {
		self.reconnect_attempts.store(0, Ordering::Relaxed);
		self.reconnect_task.lock().take();
	}

	fn next_reconnect_delay(&self) -> Duration {
		let attempt = self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
		let delay = reconnect_delay(attempt);
		debug!(attempt, delay_ms = delay.as_millis() as u64, "connection check scheduled");
		delay
	}

	pub fn registry(&self) -> &Arc<ActiveStreamRegistry> {
		&self.registry
	}

	pub async fn apply_stream_status(&self, channel: &ChannelLogin, is_live: bool) -> ReassessAction {
		if self.registry.set_live(channel, is_live) {
			info!(channel = %channel, is_live, active = self.registry.len(), "stream status changed");
		} else {
			debug!(channel = %channel, is_live, "stream status unchanged");
		}
		self.reassess_connection_state().await
	}

	/// Bring the transport in line with the registry. Safe to call repeatedly.
	pub async fn reassess_connection_state(&self) -> ReassessAction {
		let active = self.registry.len();
		let desired = self.policy.wants_connection(active);
		let state = self.supervisor.connection_state();

		match (desired, state) {
			(true, ConnectionState::Disconnected) => {
				info!(active, "connection wanted; connecting");
				match self.supervisor.connect().await {
					Ok(()) => ReassessAction::Connect,
					Err(e) => {
						warn!(error = %e, "connect requested by reassessment failed");
						if is_retryable(&e) {
							self.schedule_reconnect();
						}
						ReassessAction::ConnectFailed(e)
					}
				}
			}
			(true, ConnectionState::Connected) => {
				let joined: HashSet<ChannelLogin> = self.supervisor.joined_channels().into_iter().collect();
				let missing: Vec<ChannelLogin> = self
					.registry
					.snapshot()
					.into_iter()
					.filter(|c| !joined.contains(c))
					.collect();
				if missing.is_empty() {
					return ReassessAction::Idle;
				}

				for channel in &missing {
					match self.supervisor.join(channel).await {
						Ok(()) => info!(channel = %channel, "joined live channel"),
						Err(e) => warn!(channel = %channel, error = %e, "join failed"),
					}
				}
				ReassessAction::JoinMissing(missing)
			}
			(false, ConnectionState::Connected) if self.policy.lazy_connect => {
				info!("no live channels; disconnecting");
				if let Err(e) = self.supervisor.disconnect().await {
					warn!(error = %e, "lazy disconnect failed");
				}
				ReassessAction::Disconnect
			}
			_ => ReassessAction::Idle,
		}
	}
}

/// A rejected login waits for auth recovery instead.
fn is_retryable(err: &TransportError) -> bool {
	!matches!(err, TransportError::Auth(_))
}

#[async_trait::async_trait]
impl StreamStatusSink for ConnectionDecisionEngine {
	async fn on_stream_status_change(&self, channel: &ChannelLogin, is_live: bool) {
		self.apply_stream_status(channel, is_live).await;
	}
}
