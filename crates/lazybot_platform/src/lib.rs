#![forbid(unsafe_code)]

pub mod ads;
pub mod secrets;
pub mod twitch;

use std::collections::HashSet;
use std::fmt;

use lazybot_domain::{ChannelLogin, ReadyState};
use tokio::sync::mpsc;

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Transport → lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
	Connecting,
	Connected,
	Disconnected {
		reason: String,
	},
	/// Server notice (`NOTICE` line), optionally scoped to a channel.
	Notice {
		channel: Option<ChannelLogin>,
		msgid: Option<String>,
		message: String,
	},
	Error {
		message: String,
	},
}

pub type TransportEventTx = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventRx = mpsc::UnboundedReceiver<TransportEvent>;

/// Build the event channel a transport reports into.
pub fn transport_event_channel() -> (TransportEventTx, TransportEventRx) {
	mpsc::unbounded_channel()
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
	#[error("transport is not connected")]
	NotConnected,

	#[error("connect failed: {0}")]
	Connect(String),

	/// The server rejected our credential during login.
	#[error("authentication failed: {0}")]
	Auth(String),

	#[error("io error: {0}")]
	Io(String),

	#[error("timed out: {0}")]
	Timeout(String),
}

/// Real-time chat connection.
///
/// Exactly one instance exists per process; the lifecycle core serializes
/// `connect` calls on top of it.
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync + 'static {
	/// Open the connection and resolve once the server accepted the login.
	async fn connect(&self) -> Result<(), TransportError>;

	/// Close the connection and resolve once the session ended.
	async fn disconnect(&self) -> Result<(), TransportError>;

	fn ready_state(&self) -> ReadyState;

	/// Channels the server confirmed as joined.
	fn channels(&self) -> Vec<ChannelLogin>;

	async fn join(&self, channel: &ChannelLogin) -> Result<(), TransportError>;

	async fn part(&self, channel: &ChannelLogin) -> Result<(), TransportError>;

	async fn say(&self, channel: &ChannelLogin, text: &str) -> Result<(), TransportError>;

	/// Replace the access token used by the next `connect`.
	fn set_credential(&self, access_token: SecretString);
}

/// Hands out a currently valid access token.
#[async_trait::async_trait]
pub trait AccessTokenProvider: Send + Sync + 'static {
	async fn access_token(&self) -> anyhow::Result<SecretString>;

	/// The API answered 401 for `rejected`; the next call must not hand it out again.
	fn invalidate(&self, rejected: &SecretString);
}

/// Per-channel stream snapshot from the status API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSnapshot {
	pub channel: ChannelLogin,
	pub started_at: Option<String>,
	pub game_name: Option<String>,
}

impl StreamSnapshot {
	/// Live means the stream has a start time and a category.
	pub fn is_live(&self) -> bool {
		let started = self.started_at.as_deref().is_some_and(|s| !s.trim().is_empty());
		let game = self.game_name.as_deref().is_some_and(|s| !s.trim().is_empty());
		started && game
	}
}

/// External source of truth for stream liveness.
#[async_trait::async_trait]
pub trait StreamStatusSource: Send + Sync + 'static {
	/// Subset of `channels` that is currently broadcasting.
	async fn live_channels(&self, channels: &[ChannelLogin]) -> anyhow::Result<HashSet<ChannelLogin>>;

	/// Stream details for every channel that currently has a stream object.
	async fn stream_snapshots(&self, channels: &[ChannelLogin]) -> anyhow::Result<Vec<StreamSnapshot>>;
}
