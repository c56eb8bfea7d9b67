#![forbid(unsafe_code)]

//! Client for the ad-schedule proxy (`GET /ads/schedule?channel=<name>`).

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use lazybot_domain::ChannelLogin;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::SecretString;

/// Values above this are unix milliseconds rather than seconds.
const UNIX_MILLIS_THRESHOLD: i64 = 100_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdFetchError {
	#[error("ad schedule auth rejected: {0}")]
	Auth(String),

	#[error("ad schedule scope missing: {0}")]
	ScopeMissing(String),

	#[error("ad schedule transient failure: {0}")]
	Transient(String),

	#[error("ad schedule unexpected failure: {0}")]
	Unexpected(String),
}

impl AdFetchError {
	pub fn is_retryable(&self) -> bool {
		matches!(self, Self::Transient(_))
	}

	fn from_status(status: StatusCode, body: String) -> Self {
		match status {
			StatusCode::UNAUTHORIZED => Self::Auth(body),
			StatusCode::FORBIDDEN => {
				let lower = body.to_ascii_lowercase();
				if lower.contains("scope") || lower.contains("missing") {
					Self::ScopeMissing(body)
				} else {
					Self::Auth(body)
				}
			}
			StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Self::Transient(format!("{status}: {body}")),
			s if s.is_server_error() => Self::Transient(format!("{status}: {body}")),
			_ => Self::Unexpected(format!("{status}: {body}")),
		}
	}
}

/// Where the next ad break for a channel comes from.
#[async_trait::async_trait]
pub trait AdScheduleSource: Send + Sync + 'static {
	/// `Ok(None)` when no ad break is scheduled.
	async fn next_ad_at(&self, channel: &ChannelLogin) -> Result<Option<DateTime<Utc>>, AdFetchError>;
}

#[derive(Debug, Deserialize)]
struct AdScheduleResponse {
	#[serde(default)]
	data: Vec<AdScheduleEntry>,
}

#[derive(Debug, Deserialize)]
struct AdScheduleEntry {
	#[serde(default)]
	next_ad_at: serde_json::Value,
}

/// Accepts RFC3339 strings and unix timestamps in seconds or milliseconds.
pub fn parse_next_ad_at(value: &serde_json::Value) -> Option<DateTime<Utc>> {
	let from_unix = |n: i64| {
		if n <= 0 {
			None
		} else if n >= UNIX_MILLIS_THRESHOLD {
			Utc.timestamp_millis_opt(n).single()
		} else {
			Utc.timestamp_opt(n, 0).single()
		}
	};

	match value {
		serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).and_then(from_unix),
		serde_json::Value::String(s) => {
			let s = s.trim();
			if s.is_empty() {
				return None;
			}
			if let Ok(n) = s.parse::<i64>() {
				return from_unix(n);
			}
			DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc))
		}
		_ => None,
	}
}

/// Authenticated proxy client.
#[derive(Clone, Debug)]
pub struct AdScheduleClient {
	http: reqwest::Client,
	base_url: Url,
	token: SecretString,
}

impl AdScheduleClient {
	pub fn new(base_url: Url, token: SecretString) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("lazybot/0.x (ads)")
			.timeout(Duration::from_secs(10))
			.build()
			.context("build reqwest client")?;

		Ok(Self { http, base_url, token })
	}
}

fn schedule_url(base_url: &Url, channel: &ChannelLogin) -> Result<Url, AdFetchError> {
	let mut url = base_url
		.join("/ads/schedule")
		.map_err(|e| AdFetchError::Unexpected(format!("join ad schedule url: {e}")))?;
	url.query_pairs_mut().append_pair("channel", channel.as_str());
	Ok(url)
}

#[async_trait::async_trait]
impl AdScheduleSource for AdScheduleClient {
	async fn next_ad_at(&self, channel: &ChannelLogin) -> Result<Option<DateTime<Utc>>, AdFetchError> {
		let url = schedule_url(&self.base_url, channel)?;
		let resp = self
			.http
			.get(url)
			.bearer_auth(self.token.expose())
			.send()
			.await
			.map_err(|e| AdFetchError::Transient(e.to_string()))?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.map_err(|e| AdFetchError::Transient(format!("read body: {e}")))?;

		if !status.is_success() {
			return Err(AdFetchError::from_status(status, body));
		}

		let parsed: AdScheduleResponse =
			serde_json::from_str(&body).map_err(|e| AdFetchError::Unexpected(format!("parse ad schedule: {e}")))?;
		Ok(parsed.data.first().and_then(|entry| parse_next_ad_at(&entry.next_ad_at)))
	}
}
