#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Twitch channel login (lowercase, no leading `#`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelLogin(String);

impl ChannelLogin {
	/// Normalize and validate a channel login.
	pub fn new(login: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let login = login.as_ref().trim();
		let login = login.strip_prefix('#').unwrap_or(login).trim();
		if login.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if login.chars().any(|c| c.is_whitespace() || c == ',') {
			return Err(ParseIdError::InvalidFormat(format!("channel login contains separators: {login}")));
		}
		Ok(Self(login.to_ascii_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// IRC channel name (`#login`).
	pub fn irc_channel(&self) -> String {
		format!("#{}", self.0)
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelLogin {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelLogin {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelLogin::new(s)
	}
}

impl TryFrom<String> for ChannelLogin {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		ChannelLogin::new(value)
	}
}

impl From<ChannelLogin> for String {
	fn from(value: ChannelLogin) -> Self {
		value.0
	}
}

/// Deployment environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Environment {
	Development,
	Staging,
	#[default]
	Production,
	Other(String),
}

impl Environment {
	pub fn as_str(&self) -> &str {
		match self {
			Self::Development => "development",
			Self::Staging => "staging",
			Self::Production => "production",
			Self::Other(name) => name.as_str(),
		}
	}

	pub fn is_dev(&self) -> bool {
		matches!(self, Self::Development)
	}
}

impl fmt::Display for Environment {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Environment {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		Ok(match s.to_ascii_lowercase().as_str() {
			"dev" | "development" | "local" => Self::Development,
			"staging" | "stage" => Self::Staging,
			"prod" | "production" => Self::Production,
			other => Self::Other(other.to_string()),
		})
	}
}

/// Raw ready-state reported by a chat transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadyState {
	Connecting,
	Open,
	Closing,
	Closed,
}

/// Connection state as seen by the lifecycle core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
}

impl ConnectionState {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Disconnected => "DISCONNECTED",
			Self::Connecting => "CONNECTING",
			Self::Connected => "CONNECTED",
		}
	}
}

impl From<ReadyState> for ConnectionState {
	fn from(state: ReadyState) -> Self {
		match state {
			ReadyState::Open => Self::Connected,
			ReadyState::Connecting => Self::Connecting,
			ReadyState::Closing | ReadyState::Closed => Self::Disconnected,
		}
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
