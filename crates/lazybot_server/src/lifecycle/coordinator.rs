#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use lazybot_domain::{ChannelLogin, Environment};
use lazybot_platform::twitch::is_auth_failure;
use lazybot_platform::{TransportEvent, TransportEventRx};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ads::AdScheduleNotifier;
use super::auditor::LivenessAuditor;
use super::poller::StreamStatusPoller;
use super::registry::ConnectionDecisionEngine;
use super::supervisor::TransportSupervisor;
use super::sync::ChannelSync;
use super::task::ScheduledTask;
use crate::server::health::HealthState;

/// Transport state transitions, in the order the transport reports them.
#[async_trait::async_trait]
pub trait TransportListener: Send + Sync + 'static {
	async fn on_connecting(&self);
	async fn on_connected(&self);
	async fn on_disconnected(&self, reason: &str);
	async fn on_notice(&self, channel: Option<&ChannelLogin>, msgid: Option<&str>, message: &str);
	async fn on_error(&self, message: &str);
}

/// Deliver transport events to `listener` until the transport goes away.
pub fn spawn_event_dispatcher(mut events: TransportEventRx, listener: Arc<dyn TransportListener>) -> JoinHandle<()> {
	tokio::spawn(async move {
		while let Some(event) = events.recv().await {
			match event {
				TransportEvent::Connecting => listener.on_connecting().await,
				TransportEvent::Connected => listener.on_connected().await,
				TransportEvent::Disconnected { reason } => listener.on_disconnected(&reason).await,
				TransportEvent::Notice {
					channel,
					msgid,
					message,
				} => listener.on_notice(channel.as_ref(), msgid.as_deref(), &message).await,
				TransportEvent::Error { message } => listener.on_error(&message).await,
			}
		}
		debug!("transport event stream closed");
	})
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
	pub environment: Environment,
	pub lazy_connect: bool,
	pub registry_sync_enabled: bool,
	pub channel_sync_interval: Duration,
}

/// Starts and stops everything that only makes sense while connected.
pub struct ConnectionEventCoordinator {
	settings: CoordinatorSettings,
	supervisor: TransportSupervisor,
	engine: Arc<ConnectionDecisionEngine>,
	sync: Arc<ChannelSync>,
	poller: Arc<StreamStatusPoller>,
	ads: Option<Arc<AdScheduleNotifier>>,
	auditor: Arc<LivenessAuditor>,
	health: HealthState,
	resync_task: Mutex<Option<ScheduledTask>>,
	readiness_task: Mutex<Option<ScheduledTask>>,
}

impl ConnectionEventCoordinator {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		settings: CoordinatorSettings,
		supervisor: TransportSupervisor,
		engine: Arc<ConnectionDecisionEngine>,
		sync: Arc<ChannelSync>,
		poller: Arc<StreamStatusPoller>,
		ads: Option<Arc<AdScheduleNotifier>>,
		auditor: Arc<LivenessAuditor>,
		health: HealthState,
	) -> Self {
		Self {
			settings,
			supervisor,
			engine,
			sync,
			poller,
			ads,
			auditor,
			health,
			resync_task: Mutex::new(None),
			readiness_task: Mutex::new(None),
		}
	}

	pub fn resync_scheduled(&self) -> bool {
		self.resync_task.lock().is_some()
	}

	pub fn reconnect_scheduled(&self) -> bool {
		self.engine.reconnect_scheduled()
	}

	fn schedule_resync(&self) {
		let mut slot = self.resync_task.lock();
		if slot.is_some() {
			return;
		}
		let sync = Arc::downgrade(&self.sync);
		*slot = Some(ScheduledTask::every(self.settings.channel_sync_interval, false, move || {
			let sync = sync.clone();
			async move {
				if let Some(sync) = sync.upgrade()
					&& let Err(e) = sync.resync().await
				{
					warn!(error = %e, "periodic channel resync failed");
				}
			}
		}));
	}

	/// Runs off the dispatcher so event delivery never waits on a refresh.
	fn spawn_auth_recovery(&self) {
		let supervisor = self.supervisor.clone();
		tokio::spawn(async move {
			let outcome = supervisor.recover_from_auth_failure().await;
			debug!(?outcome, "auth recovery finished");
		});
	}

	fn schedule_readiness(&self) {
		if self.health.is_ready() {
			return;
		}
		let mut slot = self.readiness_task.lock();
		if slot.as_ref().is_some_and(|t| !t.is_finished()) {
			return;
		}
		let poller = Arc::clone(&self.poller);
		let health = self.health.clone();
		*slot = Some(ScheduledTask::spawn(async move {
			poller.wait_first_cycle().await;
			if !health.is_ready() {
				health.mark_ready();
				info!("fully initialized");
			}
		}));
	}
}

#[async_trait::async_trait]
impl TransportListener for ConnectionEventCoordinator {
	async fn on_connecting(&self) {
		info!("chat transport connecting");
	}

	async fn on_connected(&self) {
		info!("chat transport connected");
		self.supervisor.note_connected();
		self.engine.note_connected();

		if self.settings.registry_sync_enabled {
			self.sync.attach_listener();
		}

		if let Err(e) = self.sync.resync().await {
			warn!(error = %e, "channel resync after connect failed");
		}
		// Joins live channels a failed resync missed; in lazy mode with nothing live, disconnects.
		self.engine.reassess_connection_state().await;
		self.schedule_resync();

		self.poller.start();
		if let Some(ads) = &self.ads {
			ads.start();
		}
		if self.settings.lazy_connect {
			self.auditor.start();
		}

		self.schedule_readiness();
	}

	async fn on_disconnected(&self, reason: &str) {
		info!(reason, "chat transport disconnected");

		self.poller.stop();
		if let Some(ads) = &self.ads {
			ads.stop();
		}
		if let Some(task) = self.resync_task.lock().take() {
			task.cancel();
		}
		// Dev keeps following the directory across reconnects.
		if !self.settings.environment.is_dev() {
			self.sync.detach_listener();
		}

		// Re-run the connection decision after an unplanned disconnect, backing off.
		self.engine.schedule_reconnect();
	}

	async fn on_notice(&self, channel: Option<&ChannelLogin>, msgid: Option<&str>, message: &str) {
		if is_auth_failure(msgid, message) {
			warn!(msgid = msgid.unwrap_or(""), message, "chat login rejected; starting auth recovery");
			self.spawn_auth_recovery();
			return;
		}

		match channel {
			Some(channel) => debug!(channel = %channel, msgid = msgid.unwrap_or(""), message, "server notice"),
			None => debug!(msgid = msgid.unwrap_or(""), message, "server notice"),
		}
	}

	async fn on_error(&self, message: &str) {
		if is_auth_failure(None, message) {
			warn!(message, "chat transport reported an auth failure; starting auth recovery");
			self.spawn_auth_recovery();
			return;
		}
		warn!(message, "chat transport error");
	}
}
