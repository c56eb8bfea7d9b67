#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Context;
use lazybot_domain::{ChannelLogin, ConnectionState};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::registry::{ActiveStreamRegistry, StreamStatusSink};
use super::supervisor::TransportSupervisor;
use super::task::ScheduledTask;
use crate::directory::{ChannelDirectory, DirectoryChange, ManagedChannel};

/// Last known managed channels and their per-channel settings.
#[derive(Debug, Default)]
pub struct ChannelSettingsCache {
	channels: RwLock<BTreeMap<ChannelLogin, ManagedChannel>>,
}

impl ChannelSettingsCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn replace(&self, channels: Vec<ManagedChannel>) {
		let mut map = self.channels.write();
		map.clear();
		map.extend(channels.into_iter().map(|c| (c.login.clone(), c)));
	}

	pub fn apply(&self, change: &DirectoryChange) {
		let mut map = self.channels.write();
		match change {
			DirectoryChange::Added(channel) | DirectoryChange::Updated(channel) => {
				map.insert(channel.login.clone(), channel.clone());
			}
			DirectoryChange::Removed(login) => {
				map.remove(login);
			}
		}
	}

	pub fn managed(&self) -> Vec<ChannelLogin> {
		self.channels.read().keys().cloned().collect()
	}

	pub fn is_managed(&self, channel: &ChannelLogin) -> bool {
		self.channels.read().contains_key(channel)
	}

	pub fn ad_notifications_enabled(&self, channel: &ChannelLogin) -> bool {
		self.channels.read().get(channel).is_some_and(|c| c.ad_notifications)
	}

	pub fn len(&self) -> usize {
		self.channels.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.channels.read().is_empty()
	}
}

/// Reconciles transport channel membership with the managed-channel directory.
pub struct ChannelSync {
	directory: Arc<dyn ChannelDirectory>,
	cache: Arc<ChannelSettingsCache>,
	registry: Arc<ActiveStreamRegistry>,
	supervisor: TransportSupervisor,
	sink: Arc<dyn StreamStatusSink>,
	lazy_connect: bool,
	listener: Mutex<Option<ScheduledTask>>,
}

impl ChannelSync {
	pub fn new(
		directory: Arc<dyn ChannelDirectory>,
		cache: Arc<ChannelSettingsCache>,
		registry: Arc<ActiveStreamRegistry>,
		supervisor: TransportSupervisor,
		sink: Arc<dyn StreamStatusSink>,
		lazy_connect: bool,
	) -> Self {
		Self {
			directory,
			cache,
			registry,
			supervisor,
			sink,
			lazy_connect,
			listener: Mutex::new(None),
		}
	}

	pub fn cache(&self) -> &Arc<ChannelSettingsCache> {
		&self.cache
	}

	/// Reload the directory, then join and part to match it.
	///
	/// In lazy-connect mode only live managed channels are joined.
	pub async fn resync(&self) -> anyhow::Result<()> {
		let channels = self
			.directory
			.managed_channels()
			.await
			.context("load managed channels")?;
		self.cache.replace(channels);
		let managed: BTreeSet<ChannelLogin> = self.cache.managed().into_iter().collect();

		for channel in self.registry.snapshot() {
			if !managed.contains(&channel) {
				info!(channel = %channel, "live channel is no longer managed");
				self.sink.on_stream_status_change(&channel, false).await;
			}
		}

		if self.supervisor.connection_state() != ConnectionState::Connected {
			debug!(managed = managed.len(), "channel resync: transport not connected; membership unchanged");
			return Ok(());
		}

		let desired: BTreeSet<ChannelLogin> = if self.lazy_connect {
			managed.iter().filter(|c| self.registry.contains(c)).cloned().collect()
		} else {
			managed.clone()
		};
		let joined: BTreeSet<ChannelLogin> = self.supervisor.joined_channels().into_iter().collect();

		for channel in desired.difference(&joined) {
			match self.supervisor.join(channel).await {
				Ok(()) => info!(channel = %channel, "joined managed channel"),
				Err(e) => warn!(channel = %channel, error = %e, "join failed during resync"),
			}
		}

		for channel in joined.difference(&desired) {
			if self.registry.contains(channel) {
				continue;
			}
			match self.supervisor.part(channel).await {
				Ok(()) => info!(channel = %channel, "parted channel no longer wanted"),
				Err(e) => warn!(channel = %channel, error = %e, "part failed during resync"),
			}
		}

		debug!(managed = managed.len(), desired = desired.len(), "channel resync complete");
		Ok(())
	}

	/// Start following directory changes. Returns false when already attached.
	pub fn attach_listener(self: &Arc<Self>) -> bool {
		let mut slot = self.listener.lock();
		if slot.as_ref().is_some_and(|task| !task.is_finished()) {
			return false;
		}

		let mut changes = self.directory.watch();
		let this = Arc::downgrade(self);
		*slot = Some(ScheduledTask::spawn(async move {
			while let Some(change) = changes.recv().await {
				let Some(sync) = this.upgrade() else {
					break;
				};
				debug!(?change, "managed channel change");
				sync.cache.apply(&change);
				if let Err(e) = sync.resync().await {
					warn!(error = %e, "resync after directory change failed");
				}
			}
			debug!("channel directory listener ended");
		}));
		info!("channel directory listener attached");
		true
	}

	/// Returns false when no listener was attached.
	pub fn detach_listener(&self) -> bool {
		match self.listener.lock().take() {
			Some(task) => {
				task.cancel();
				info!("channel directory listener detached");
				true
			}
			None => false,
		}
	}

	pub fn listener_attached(&self) -> bool {
		self.listener.lock().as_ref().is_some_and(|task| !task.is_finished())
	}
}
