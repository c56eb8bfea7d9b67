#![forbid(unsafe_code)]

//! Hand-written doubles shared by the lifecycle tests.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lazybot_domain::{ChannelLogin, ReadyState};
use lazybot_platform::ads::{AdFetchError, AdScheduleSource};
use lazybot_platform::secrets::SecretStore;
use lazybot_platform::twitch::{TokenEndpoint, TokenEndpointError, TokenRefreshResponse};
use lazybot_platform::{ChatTransport, SecretString, StreamSnapshot, StreamStatusSource, TransportError};
use parking_lot::Mutex;

use super::ads::AdAlertSink;
use super::credentials::{CredentialRefresher, CredentialSettings};
use super::registry::StreamStatusSink;
use super::supervisor::TransportSupervisor;

pub const SECRET_NAME: &str = "twitch-bot-refresh-token";

pub fn login(name: &str) -> ChannelLogin {
	ChannelLogin::new(name).expect("valid login")
}

/// Opt-in log output: `LAZYBOT_TEST_LOG=debug cargo test`.
pub fn init_test_logging() {
	if let Ok(filter) = std::env::var("LAZYBOT_TEST_LOG") {
		let _ = tracing_subscriber::fmt()
			.with_env_filter(tracing_subscriber::EnvFilter::new(filter))
			.with_test_writer()
			.try_init();
	}
}

#[derive(Default)]
pub struct FakeTransport {
	state: Mutex<Option<ReadyState>>,
	joined: Mutex<BTreeSet<ChannelLogin>>,
	said: Mutex<Vec<(ChannelLogin, String)>>,
	credentials: Mutex<Vec<String>>,
	connect_delay: Mutex<Duration>,
	connect_error: Mutex<Option<TransportError>>,
	join_error: Mutex<Option<TransportError>>,
	connects: AtomicUsize,
	disconnects: AtomicUsize,
	joins: AtomicUsize,
	parts: AtomicUsize,
}

impl FakeTransport {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn set_ready_state(&self, state: ReadyState) {
		*self.state.lock() = Some(state);
	}

	pub fn set_connect_delay(&self, delay: Duration) {
		*self.connect_delay.lock() = delay;
	}

	pub fn fail_connects(&self, error: Option<TransportError>) {
		*self.connect_error.lock() = error;
	}

	pub fn fail_joins(&self, error: Option<TransportError>) {
		*self.join_error.lock() = error;
	}

	/// Pretend the server already has us in `channel`.
	pub fn seed_joined(&self, channel: ChannelLogin) {
		self.joined.lock().insert(channel);
	}

	pub fn connect_calls(&self) -> usize {
		self.connects.load(Ordering::SeqCst)
	}

	pub fn disconnect_calls(&self) -> usize {
		self.disconnects.load(Ordering::SeqCst)
	}

	pub fn join_calls(&self) -> usize {
		self.joins.load(Ordering::SeqCst)
	}

	pub fn part_calls(&self) -> usize {
		self.parts.load(Ordering::SeqCst)
	}

	pub fn said(&self) -> Vec<(ChannelLogin, String)> {
		self.said.lock().clone()
	}

	pub fn last_credential(&self) -> Option<String> {
		self.credentials.lock().last().cloned()
	}
}

#[async_trait::async_trait]
impl ChatTransport for FakeTransport {
	async fn connect(&self) -> Result<(), TransportError> {
		self.connects.fetch_add(1, Ordering::SeqCst);
		let delay = *self.connect_delay.lock();
		if !delay.is_zero() {
			self.set_ready_state(ReadyState::Connecting);
			tokio::time::sleep(delay).await;
		}
		let error = self.connect_error.lock().clone();
		if let Some(error) = error {
			self.set_ready_state(ReadyState::Closed);
			return Err(error);
		}
		self.set_ready_state(ReadyState::Open);
		Ok(())
	}

	async fn disconnect(&self) -> Result<(), TransportError> {
		self.disconnects.fetch_add(1, Ordering::SeqCst);
		self.set_ready_state(ReadyState::Closed);
		self.joined.lock().clear();
		Ok(())
	}

	fn ready_state(&self) -> ReadyState {
		self.state.lock().unwrap_or(ReadyState::Closed)
	}

	fn channels(&self) -> Vec<ChannelLogin> {
		self.joined.lock().iter().cloned().collect()
	}

	async fn join(&self, channel: &ChannelLogin) -> Result<(), TransportError> {
		self.joins.fetch_add(1, Ordering::SeqCst);
		let error = self.join_error.lock().clone();
		if let Some(error) = error {
			return Err(error);
		}
		self.joined.lock().insert(channel.clone());
		Ok(())
	}

	async fn part(&self, channel: &ChannelLogin) -> Result<(), TransportError> {
		self.parts.fetch_add(1, Ordering::SeqCst);
		self.joined.lock().remove(channel);
		Ok(())
	}

	async fn say(&self, channel: &ChannelLogin, text: &str) -> Result<(), TransportError> {
		if self.ready_state() != ReadyState::Open {
			return Err(TransportError::NotConnected);
		}
		self.said.lock().push((channel.clone(), text.to_string()));
		Ok(())
	}

	fn set_credential(&self, access_token: SecretString) {
		self.credentials.lock().push(access_token.expose().to_string());
	}
}

/// Answers from a script, then with fresh `at-<n>` tokens.
#[derive(Default)]
pub struct FakeTokenEndpoint {
	script: Mutex<VecDeque<Result<TokenRefreshResponse, TokenEndpointError>>>,
	delay: Mutex<Duration>,
	calls: AtomicUsize,
	seen: Mutex<Vec<String>>,
}

impl FakeTokenEndpoint {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn with_delay(delay: Duration) -> Arc<Self> {
		let endpoint = Self::default();
		*endpoint.delay.lock() = delay;
		Arc::new(endpoint)
	}

	pub fn push(&self, response: Result<TokenRefreshResponse, TokenEndpointError>) {
		self.script.lock().push_back(response);
	}

	pub fn push_rejected(&self, status: u16) {
		self.push(Err(TokenEndpointError::Rejected {
			status,
			body: "{\"message\":\"Invalid refresh token\"}".to_string(),
		}));
	}

	pub fn push_network_error(&self) {
		self.push(Err(TokenEndpointError::Network("connection reset".to_string())));
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	/// Refresh tokens presented, in call order.
	pub fn seen_refresh_tokens(&self) -> Vec<String> {
		self.seen.lock().clone()
	}
}

pub fn token_response(access_token: &str, refresh_token: Option<&str>) -> TokenRefreshResponse {
	TokenRefreshResponse {
		access_token: access_token.to_string(),
		refresh_token: refresh_token.map(str::to_string),
		expires_in: Some(14_400),
	}
}

#[async_trait::async_trait]
impl TokenEndpoint for FakeTokenEndpoint {
	async fn refresh(
		&self,
		_client_id: &str,
		_client_secret: &str,
		refresh_token: &str,
	) -> Result<TokenRefreshResponse, TokenEndpointError> {
		let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
		self.seen.lock().push(refresh_token.to_string());

		let delay = *self.delay.lock();
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}

		let scripted = self.script.lock().pop_front();
		scripted.unwrap_or_else(|| Ok(token_response(&format!("at-{n}"), None)))
	}
}

#[derive(Default)]
pub struct MemorySecretStore {
	values: Mutex<HashMap<String, String>>,
	fail_reads: AtomicBool,
	fail_writes: AtomicBool,
	reads: AtomicUsize,
	writes: AtomicUsize,
}

impl MemorySecretStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn with_secret(name: &str, value: &str) -> Arc<Self> {
		let store = Self::default();
		store.values.lock().insert(name.to_string(), value.to_string());
		Arc::new(store)
	}

	pub fn put(&self, name: &str, value: &str) {
		self.values.lock().insert(name.to_string(), value.to_string());
	}

	pub fn value(&self, name: &str) -> Option<String> {
		self.values.lock().get(name).cloned()
	}

	pub fn fail_reads(&self, fail: bool) {
		self.fail_reads.store(fail, Ordering::SeqCst);
	}

	pub fn fail_writes(&self, fail: bool) {
		self.fail_writes.store(fail, Ordering::SeqCst);
	}

	pub fn reads(&self) -> usize {
		self.reads.load(Ordering::SeqCst)
	}

	pub fn writes(&self) -> usize {
		self.writes.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl SecretStore for MemorySecretStore {
	async fn get_secret_value(&self, name: &str) -> anyhow::Result<Option<String>> {
		self.reads.fetch_add(1, Ordering::SeqCst);
		if self.fail_reads.load(Ordering::SeqCst) {
			anyhow::bail!("secret backend unavailable");
		}
		Ok(self.values.lock().get(name).cloned())
	}

	async fn set_secret_value(&self, name: &str, value: &str) -> anyhow::Result<bool> {
		self.writes.fetch_add(1, Ordering::SeqCst);
		if self.fail_writes.load(Ordering::SeqCst) {
			anyhow::bail!("secret backend is read-only");
		}
		self.values.lock().insert(name.to_string(), value.to_string());
		Ok(true)
	}
}

/// Refresher with immediate retries and `rt-1` in the store.
pub fn refresher(endpoint: Arc<FakeTokenEndpoint>, store: Arc<MemorySecretStore>) -> CredentialRefresher {
	let mut settings = CredentialSettings::new("client-id", SecretString::new("client-secret"), SECRET_NAME);
	settings.retry_delays = vec![Duration::from_millis(10); 3];
	CredentialRefresher::new(settings, endpoint, store)
}

pub struct Harness {
	pub transport: Arc<FakeTransport>,
	pub endpoint: Arc<FakeTokenEndpoint>,
	pub store: Arc<MemorySecretStore>,
	pub credentials: CredentialRefresher,
	pub supervisor: TransportSupervisor,
}

impl Harness {
	pub async fn new() -> Self {
		init_test_logging();
		let transport = FakeTransport::new();
		let endpoint = FakeTokenEndpoint::new();
		let store = MemorySecretStore::with_secret(SECRET_NAME, "rt-1");
		let credentials = refresher(Arc::clone(&endpoint), Arc::clone(&store));
		let supervisor = TransportSupervisor::create_client(transport.clone(), credentials.clone()).await;
		Self {
			transport,
			endpoint,
			store,
			credentials,
			supervisor,
		}
	}
}

/// Live set plus an on/off failure switch.
#[derive(Default)]
pub struct FakeStatusSource {
	live: Mutex<HashSet<ChannelLogin>>,
	fail: AtomicBool,
	live_calls: AtomicUsize,
	snapshot_calls: AtomicUsize,
}

impl FakeStatusSource {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn set_live(&self, channels: &[&str]) {
		*self.live.lock() = channels.iter().map(|c| login(c)).collect();
	}

	pub fn fail(&self, fail: bool) {
		self.fail.store(fail, Ordering::SeqCst);
	}

	pub fn live_calls(&self) -> usize {
		self.live_calls.load(Ordering::SeqCst)
	}

	pub fn snapshot_calls(&self) -> usize {
		self.snapshot_calls.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl StreamStatusSource for FakeStatusSource {
	async fn live_channels(&self, channels: &[ChannelLogin]) -> anyhow::Result<HashSet<ChannelLogin>> {
		self.live_calls.fetch_add(1, Ordering::SeqCst);
		if self.fail.load(Ordering::SeqCst) {
			anyhow::bail!("helix unavailable");
		}
		let live = self.live.lock();
		Ok(channels.iter().filter(|c| live.contains(*c)).cloned().collect())
	}

	async fn stream_snapshots(&self, channels: &[ChannelLogin]) -> anyhow::Result<Vec<StreamSnapshot>> {
		self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
		if self.fail.load(Ordering::SeqCst) {
			anyhow::bail!("helix unavailable");
		}
		let live = self.live.lock();
		Ok(channels
			.iter()
			.filter(|c| live.contains(*c))
			.map(|c| StreamSnapshot {
				channel: c.clone(),
				started_at: Some("2024-01-01T12:00:00Z".to_string()),
				game_name: Some("Just Chatting".to_string()),
			})
			.collect())
	}
}

#[derive(Default)]
pub struct RecordingSink {
	calls: Mutex<Vec<(ChannelLogin, bool)>>,
}

impl RecordingSink {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn calls(&self) -> Vec<(ChannelLogin, bool)> {
		self.calls.lock().clone()
	}
}

#[async_trait::async_trait]
impl StreamStatusSink for RecordingSink {
	async fn on_stream_status_change(&self, channel: &ChannelLogin, is_live: bool) {
		self.calls.lock().push((channel.clone(), is_live));
	}
}

#[derive(Default)]
pub struct FakeAdSource {
	answers: Mutex<HashMap<ChannelLogin, Result<Option<DateTime<Utc>>, AdFetchError>>>,
	calls: AtomicUsize,
}

impl FakeAdSource {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn set(&self, channel: &str, answer: Result<Option<DateTime<Utc>>, AdFetchError>) {
		self.answers.lock().insert(login(channel), answer);
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl AdScheduleSource for FakeAdSource {
	async fn next_ad_at(&self, channel: &ChannelLogin) -> Result<Option<DateTime<Utc>>, AdFetchError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		self.answers.lock().get(channel).cloned().unwrap_or(Ok(None))
	}
}

#[derive(Default)]
pub struct RecordingAdSink {
	alerts: Mutex<Vec<(ChannelLogin, DateTime<Utc>)>>,
}

impl RecordingAdSink {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn alerts(&self) -> Vec<(ChannelLogin, DateTime<Utc>)> {
		self.alerts.lock().clone()
	}
}

#[async_trait::async_trait]
impl AdAlertSink for RecordingAdSink {
	async fn send_ad_alert(&self, channel: &ChannelLogin, next_ad_at: DateTime<Utc>) -> anyhow::Result<()> {
		self.alerts.lock().push((channel.clone(), next_ad_at));
		Ok(())
	}
}
