#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use lazybot_domain::ChannelLogin;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::{AccessTokenProvider, SecretString, StreamSnapshot, StreamStatusSource};

pub const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv";

const USERS_PATH: &str = "/helix/users";
const STREAMS_PATH: &str = "/helix/streams";

/// Helix accepts at most 100 ids/logins per lookup.
pub const HELIX_MAX_QUERY_ITEMS: usize = 100;

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label} send"))?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		return Err(HelixAuthError { status, body }.into());
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(delay).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	Ok(resp)
}

/// Helix refused the bearer token (401) or its scopes (403).
#[derive(Debug, thiserror::Error)]
#[error("helix auth failed (status={status}) body={body}")]
pub struct HelixAuthError {
	pub status: StatusCode,
	pub body: String,
}

impl HelixAuthError {
	/// Whether the error chain holds a 401, i.e. the token itself is stale.
	pub fn is_unauthorized(err: &anyhow::Error) -> bool {
		err.chain()
			.filter_map(|e| e.downcast_ref::<Self>())
			.any(|e| e.status == StatusCode::UNAUTHORIZED)
	}
}

fn repeated_query(key: &str, values: &[&str]) -> String {
	values
		.iter()
		.map(|v| format!("{key}={}", urlencoding::encode(v)))
		.collect::<Vec<_>>()
		.join("&")
}

#[derive(Clone, Debug)]
pub struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	bearer_token: String,
}

impl HelixClient {
	pub fn new(base_url: Url, client_id: String, bearer_token: String) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("lazybot/0.x (helix)")
			.timeout(Duration::from_secs(10))
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			client_id,
			bearer_token,
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {}", self.bearer_token))
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url.join(path_and_query).context("join helix url")
	}

	/// Bulk user lookup; logins beyond the first 100 are ignored.
	pub async fn get_users_by_login(&self, logins: &[&str]) -> anyhow::Result<Vec<HelixUser>> {
		if logins.is_empty() {
			return Ok(Vec::new());
		}
		let take = &logins[..logins.len().min(HELIX_MAX_QUERY_ITEMS)];
		let url = self.url(&format!("{USERS_PATH}?{}", repeated_query("login", take)))?;

		let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/users")
			.await
			.context("helix GET /helix/users send")?;

		let status = resp.status();
		let body = resp.text().await.context("helix GET /helix/users read body")?;

		if !status.is_success() {
			anyhow::bail!("helix GET /helix/users failed: status={status} body={body}");
		}

		let parsed: HelixUsersResponse = serde_json::from_str(&body).context("helix users parse json")?;
		Ok(parsed.data)
	}

	/// Live streams for the given user ids.
	pub async fn get_streams_by_user_ids(&self, user_ids: &[&str]) -> anyhow::Result<Vec<HelixStream>> {
		self.get_streams("user_id", user_ids).await
	}

	/// Live streams for the given logins.
	pub async fn get_streams_by_user_logins(&self, logins: &[&str]) -> anyhow::Result<Vec<HelixStream>> {
		self.get_streams("user_login", logins).await
	}

	async fn get_streams(&self, key: &str, values: &[&str]) -> anyhow::Result<Vec<HelixStream>> {
		if values.is_empty() {
			return Ok(Vec::new());
		}
		let take = &values[..values.len().min(HELIX_MAX_QUERY_ITEMS)];
		let url = self.url(&format!(
			"{STREAMS_PATH}?{}&first={}",
			repeated_query(key, take),
			HELIX_MAX_QUERY_ITEMS
		))?;

		let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/streams")
			.await
			.context("helix GET /helix/streams send")?;

		let status = resp.status();
		let body = resp.text().await.context("helix GET /helix/streams read body")?;

		if !status.is_success() {
			anyhow::bail!("helix GET /helix/streams failed: status={status} body={body}");
		}

		let parsed: HelixStreamsResponse = serde_json::from_str(&body).context("helix streams parse json")?;
		Ok(parsed.data)
	}
}

#[derive(Debug, Deserialize)]
pub struct HelixUsersResponse {
	pub data: Vec<HelixUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixUser {
	pub id: String,
	pub login: String,

	#[serde(default)]
	pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HelixStreamsResponse {
	pub data: Vec<HelixStream>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixStream {
	pub user_id: String,
	pub user_login: String,

	#[serde(default)]
	pub game_name: Option<String>,

	/// `live` for active broadcasts; empty on errors.
	#[serde(default, rename = "type")]
	pub kind: Option<String>,

	#[serde(default)]
	pub started_at: Option<String>,
}

/// `StreamStatusSource` backed by Helix.
pub struct HelixStreamStatus {
	base_url: Url,
	client_id: String,
	tokens: Arc<dyn AccessTokenProvider>,
	user_ids: Mutex<HashMap<ChannelLogin, String>>,
}

impl HelixStreamStatus {
	pub fn new(base_url: Url, client_id: impl Into<String>, tokens: Arc<dyn AccessTokenProvider>) -> Self {
		Self {
			base_url,
			client_id: client_id.into(),
			tokens,
			user_ids: Mutex::new(HashMap::new()),
		}
	}

	async fn client(&self) -> anyhow::Result<(HelixClient, SecretString)> {
		if self.client_id.trim().is_empty() {
			return Err(anyhow::anyhow!("missing twitch client_id"));
		}
		let token = self.tokens.access_token().await.context("obtain helix bearer token")?;
		let helix = HelixClient::new(self.base_url.clone(), self.client_id.clone(), token.expose().to_string())?;
		Ok((helix, token))
	}

	/// Drop a token Helix no longer accepts so the next cycle mints a new one.
	fn check_token<T>(&self, token: &SecretString, result: anyhow::Result<T>) -> anyhow::Result<T> {
		if let Err(e) = &result
			&& HelixAuthError::is_unauthorized(e)
		{
			warn!("helix rejected the access token; invalidating it");
			self.tokens.invalidate(token);
		}
		result
	}

	async fn query_live(&self, helix: &HelixClient, channels: &[ChannelLogin]) -> anyhow::Result<HashSet<ChannelLogin>> {
		let by_id = self.resolve_user_ids(helix, channels).await?;
		let ids: Vec<&str> = by_id.keys().map(String::as_str).collect();

		let mut live = HashSet::new();
		for chunk in ids.chunks(HELIX_MAX_QUERY_ITEMS) {
			for stream in helix.get_streams_by_user_ids(chunk).await? {
				if stream.kind.as_deref().is_some_and(|k| k != "live") {
					continue;
				}
				if let Some(login) = by_id.get(&stream.user_id) {
					live.insert(login.clone());
				}
			}
		}
		Ok(live)
	}

	async fn query_snapshots(&self, helix: &HelixClient, channels: &[ChannelLogin]) -> anyhow::Result<Vec<StreamSnapshot>> {
		let mut out = Vec::new();
		for chunk in channels.chunks(HELIX_MAX_QUERY_ITEMS) {
			let logins: Vec<&str> = chunk.iter().map(|c| c.as_str()).collect();
			for stream in helix.get_streams_by_user_logins(&logins).await? {
				let Ok(channel) = ChannelLogin::new(&stream.user_login) else {
					continue;
				};
				self.user_ids.lock().insert(channel.clone(), stream.user_id.clone());
				out.push(StreamSnapshot {
					channel,
					started_at: stream.started_at,
					game_name: stream.game_name,
				});
			}
		}
		Ok(out)
	}

	/// Resolve logins to user ids, caching results.
	async fn resolve_user_ids(
		&self,
		helix: &HelixClient,
		channels: &[ChannelLogin],
	) -> anyhow::Result<HashMap<String, ChannelLogin>> {
		let missing: Vec<ChannelLogin> = {
			let cache = self.user_ids.lock();
			channels.iter().filter(|c| !cache.contains_key(*c)).cloned().collect()
		};

		for chunk in missing.chunks(HELIX_MAX_QUERY_ITEMS) {
			let logins: Vec<&str> = chunk.iter().map(|c| c.as_str()).collect();
			let users = helix.get_users_by_login(&logins).await?;
			let mut cache = self.user_ids.lock();
			for user in users {
				if let Ok(login) = ChannelLogin::new(&user.login) {
					cache.insert(login, user.id);
				}
			}
		}

		let cache = self.user_ids.lock();
		let mut by_id = HashMap::new();
		for channel in channels {
			match cache.get(channel) {
				Some(id) => {
					by_id.insert(id.clone(), channel.clone());
				}
				None => debug!(channel = %channel, "no helix user for channel login"),
			}
		}
		Ok(by_id)
	}
}

#[async_trait::async_trait]
impl StreamStatusSource for HelixStreamStatus {
	async fn live_channels(&self, channels: &[ChannelLogin]) -> anyhow::Result<HashSet<ChannelLogin>> {
		let (helix, token) = self.client().await?;
		let result = self.query_live(&helix, channels).await;
		self.check_token(&token, result)
	}

	async fn stream_snapshots(&self, channels: &[ChannelLogin]) -> anyhow::Result<Vec<StreamSnapshot>> {
		let (helix, token) = self.client().await?;
		let result = self.query_snapshots(&helix, channels).await;
		self.check_token(&token, result)
	}
}
