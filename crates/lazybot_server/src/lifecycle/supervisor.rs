#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use lazybot_domain::{ChannelLogin, ConnectionState};
use lazybot_platform::{ChatTransport, TransportError};
use tracing::{error, info, warn};

use super::credentials::CredentialRefresher;
use super::single_flight::SingleFlight;

/// Consecutive failed auth recoveries before further recovery requests are ignored.
pub const MAX_FAILED_RECOVERIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
	Reconnected,
	/// The refresh token itself was rejected; the transport stays down.
	GaveUp(String),
	Failed(String),
	/// Too many failed recoveries since the last successful connect.
	Exhausted,
}

/// Owns the single chat transport and the credential it logs in with.
#[derive(Clone)]
pub struct TransportSupervisor {
	inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
	transport: Arc<dyn ChatTransport>,
	credentials: CredentialRefresher,
	connect_flight: SingleFlight<Result<(), TransportError>>,
	recovery_flight: SingleFlight<RecoveryOutcome>,
	failed_recoveries: AtomicU32,
}

impl TransportSupervisor {
	/// Wrap `transport`, seeding it with a credential when one can be had now.
	pub async fn create_client(transport: Arc<dyn ChatTransport>, credentials: CredentialRefresher) -> Self {
		match credentials.get_valid_credential().await {
			Ok(token) => transport.set_credential(token),
			Err(e) => warn!(error = %e, "no access token at startup; retrying on connect"),
		}

		Self {
			inner: Arc::new(SupervisorInner {
				transport,
				credentials,
				connect_flight: SingleFlight::new(),
				recovery_flight: SingleFlight::new(),
				failed_recoveries: AtomicU32::new(0),
			}),
		}
	}

	pub fn connection_state(&self) -> ConnectionState {
		self.inner.connection_state()
	}

	pub fn joined_channels(&self) -> Vec<ChannelLogin> {
		self.inner.transport.channels()
	}

	/// Connect unless already connected; concurrent callers share one attempt.
	pub async fn connect(&self) -> Result<(), TransportError> {
		self.inner.connect().await
	}

	pub async fn disconnect(&self) -> Result<(), TransportError> {
		if self.connection_state() == ConnectionState::Disconnected {
			return Ok(());
		}
		info!("disconnecting chat transport");
		self.inner.transport.disconnect().await
	}

	pub async fn join(&self, channel: &ChannelLogin) -> Result<(), TransportError> {
		self.inner.transport.join(channel).await
	}

	pub async fn part(&self, channel: &ChannelLogin) -> Result<(), TransportError> {
		self.inner.transport.part(channel).await
	}

	pub async fn say(&self, channel: &ChannelLogin, text: &str) -> Result<(), TransportError> {
		self.inner.transport.say(channel, text).await
	}

	/// A login went through; auth recovery may run again.
	pub fn note_connected(&self) {
		self.inner.failed_recoveries.store(0, Ordering::Relaxed);
	}

	/// Refresh the credential and reconnect after the server rejected our login.
	///
	/// Overlapping calls share one recovery cycle.
	pub async fn recover_from_auth_failure(&self) -> RecoveryOutcome {
		let inner = Arc::clone(&self.inner);
		self.inner
			.recovery_flight
			.run(move || async move { inner.recover().await })
			.await
			.unwrap_or_else(|aborted| RecoveryOutcome::Failed(aborted.to_string()))
	}
}

impl SupervisorInner {
	fn connection_state(&self) -> ConnectionState {
		self.transport.ready_state().into()
	}

	async fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
		match self.connection_state() {
			ConnectionState::Connected => return Ok(()),
			// Connecting outside our own attempt; let it finish.
			ConnectionState::Connecting if !self.connect_flight.in_flight() => return Ok(()),
			_ => {}
		}

		let inner = Arc::clone(self);
		self.connect_flight
			.run(move || async move { inner.connect_once().await })
			.await
			.unwrap_or_else(|aborted| Err(TransportError::Connect(aborted.to_string())))
	}

	async fn connect_once(&self) -> Result<(), TransportError> {
		metrics::counter!("lazybot_transport_connect_total").increment(1);

		let token = self.credentials.get_valid_credential().await.map_err(|e| {
			warn!(error = %e, "no usable access token; not connecting");
			TransportError::from(e)
		})?;
		self.transport.set_credential(token);

		info!("connecting chat transport");
		self.transport
			.connect()
			.await
			.inspect_err(|e| warn!(error = %e, "chat transport connect failed"))
	}

	async fn recover(self: &Arc<Self>) -> RecoveryOutcome {
		let failed = self.failed_recoveries.load(Ordering::Relaxed);
		if failed >= MAX_FAILED_RECOVERIES {
			warn!(failed, "auth recovery skipped: too many failures since the last successful login");
			return RecoveryOutcome::Exhausted;
		}

		metrics::counter!("lazybot_transport_auth_recoveries_total").increment(1);
		info!("recovering from chat authentication failure");

		if matches!(
			self.connection_state(),
			ConnectionState::Connected | ConnectionState::Connecting
		) && let Err(e) = self.transport.disconnect().await
		{
			warn!(error = %e, "disconnect before auth recovery failed");
		}

		let token = match self.credentials.force_refresh().await {
			Ok(token) => token,
			Err(e) if e.is_auth_invalid() => {
				self.failed_recoveries.fetch_add(1, Ordering::Relaxed);
				error!(error = %e, "auth recovery abandoned: refresh token is invalid; transport stays disconnected");
				return RecoveryOutcome::GaveUp(e.to_string());
			}
			Err(e) => {
				self.failed_recoveries.fetch_add(1, Ordering::Relaxed);
				warn!(error = %e, "auth recovery could not refresh the credential");
				return RecoveryOutcome::Failed(e.to_string());
			}
		};
		self.transport.set_credential(token);

		match self.connect().await {
			Ok(()) => {
				info!("auth recovery reconnected");
				RecoveryOutcome::Reconnected
			}
			Err(e) => {
				self.failed_recoveries.fetch_add(1, Ordering::Relaxed);
				warn!(error = %e, "auth recovery reconnect failed");
				RecoveryOutcome::Failed(e.to_string())
			}
		}
	}
}
