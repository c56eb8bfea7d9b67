#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use lazybot_platform::secrets::SecretStore;
use lazybot_platform::twitch::{TokenEndpoint, TokenRefreshResponse};
use lazybot_platform::{AccessTokenProvider, SecretString};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::single_flight::SingleFlight;

/// Backoff between token endpoint attempts after a transient failure.
pub const DEFAULT_RETRY_DELAYS: [Duration; 3] = [Duration::from_secs(2), Duration::from_secs(5), Duration::from_secs(10)];
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Access tokens are replaced this long before the provider says they expire.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(5 * 60);

const SECRET_READ_ATTEMPTS: u32 = 3;
const SECRET_READ_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
	/// The long-lived refresh token is bad. Needs a new one from outside.
	#[error("refresh token rejected: {0}")]
	AuthInvalid(String),

	#[error("transient refresh failure: {0}")]
	Transient(String),

	#[error("credential refresh timed out")]
	Timeout,

	#[error("refresh token secret {0:?} is not available")]
	MissingSecret(String),

	#[error("unexpected refresh failure: {0}")]
	Unexpected(String),
}

impl CredentialError {
	pub fn is_auth_invalid(&self) -> bool {
		matches!(self, Self::AuthInvalid(_))
	}
}

#[derive(Debug, Clone)]
pub struct CredentialSettings {
	pub client_id: String,
	pub client_secret: SecretString,
	/// Secret store key of the long-lived refresh token.
	pub secret_name: String,
	/// Used instead of the secret store until the provider rotates it.
	pub refresh_token_override: Option<SecretString>,
	pub operation_timeout: Duration,
	pub retry_delays: Vec<Duration>,
}

impl CredentialSettings {
	pub fn new(client_id: impl Into<String>, client_secret: SecretString, secret_name: impl Into<String>) -> Self {
		Self {
			client_id: client_id.into(),
			client_secret,
			secret_name: secret_name.into(),
			refresh_token_override: None,
			operation_timeout: DEFAULT_OPERATION_TIMEOUT,
			retry_delays: DEFAULT_RETRY_DELAYS.to_vec(),
		}
	}
}

#[derive(Default)]
struct CredentialState {
	access_token: Option<SecretString>,
	/// No deadline when the provider did not report a lifetime.
	expires_at: Option<Instant>,
	/// In-memory refresh token: the configured override or the latest rotation.
	refresh_token: Option<SecretString>,
	/// Refresh token the provider last answered 400/401 for.
	rejected: Option<SecretString>,
}

/// Keeps the chat access token valid.
///
/// Cheap to clone; all clones share the cache and the in-flight refresh.
#[derive(Clone)]
pub struct CredentialRefresher {
	inner: Arc<Inner>,
}

struct Inner {
	settings: CredentialSettings,
	endpoint: Arc<dyn TokenEndpoint>,
	store: Arc<dyn SecretStore>,
	state: Mutex<CredentialState>,
	flight: SingleFlight<Result<SecretString, CredentialError>>,
}

impl CredentialState {
	fn usable_token(&mut self) -> Option<SecretString> {
		if self.expires_at.is_some_and(|deadline| Instant::now() >= deadline) {
			debug!("cached access token expired");
			self.clear_access_token();
		}
		self.access_token.clone()
	}

	fn clear_access_token(&mut self) {
		self.access_token = None;
		self.expires_at = None;
	}
}

/// How long a token with the given lifetime may be served from the cache.
fn usable_lifetime(expires_in_secs: u64) -> Duration {
	let lifetime = Duration::from_secs(expires_in_secs);
	lifetime.checked_sub(EXPIRY_MARGIN).unwrap_or(lifetime / 2)
}

impl CredentialRefresher {
	pub fn new(settings: CredentialSettings, endpoint: Arc<dyn TokenEndpoint>, store: Arc<dyn SecretStore>) -> Self {
		let state = CredentialState {
			refresh_token: settings.refresh_token_override.clone().filter(|t| !t.is_empty()),
			..CredentialState::default()
		};

		Self {
			inner: Arc::new(Inner {
				settings,
				endpoint,
				store,
				state: Mutex::new(state),
				flight: SingleFlight::new(),
			}),
		}
	}

	/// Cached access token, or a fresh one.
	pub async fn get_valid_credential(&self) -> Result<SecretString, CredentialError> {
		if let Some(token) = self.inner.state.lock().usable_token() {
			return Ok(token);
		}
		self.refresh().await
	}

	/// Forget `rejected` if it is still the cached token.
	///
	/// A token minted after the rejected one was handed out stays cached.
	pub fn invalidate(&self, rejected: &SecretString) {
		let mut state = self.inner.state.lock();
		if state.access_token.as_ref() == Some(rejected) {
			info!("cached access token invalidated");
			state.clear_access_token();
		}
	}

	/// Drop the cached access token and mint a new one.
	///
	/// Joins a refresh that is already running instead of starting another.
	pub async fn force_refresh(&self) -> Result<SecretString, CredentialError> {
		self.inner.state.lock().clear_access_token();
		self.refresh().await
	}

	pub fn has_cached_credential(&self) -> bool {
		self.inner.state.lock().usable_token().is_some()
	}

	pub fn refresh_in_flight(&self) -> bool {
		self.inner.flight.in_flight()
	}

	async fn refresh(&self) -> Result<SecretString, CredentialError> {
		let inner = Arc::clone(&self.inner);
		match self.inner.flight.run(move || async move { inner.refresh_bounded().await }).await {
			Ok(outcome) => outcome,
			Err(aborted) => Err(CredentialError::Unexpected(aborted.to_string())),
		}
	}
}

impl Inner {
	async fn refresh_bounded(&self) -> Result<SecretString, CredentialError> {
		metrics::counter!("lazybot_credential_refresh_total").increment(1);

		let outcome = match tokio::time::timeout(self.settings.operation_timeout, self.refresh_with_retries()).await {
			Ok(outcome) => outcome,
			Err(_) => {
				warn!(
					timeout_ms = self.settings.operation_timeout.as_millis() as u64,
					"credential refresh timed out"
				);
				Err(CredentialError::Timeout)
			}
		};

		if outcome.is_err() {
			metrics::counter!("lazybot_credential_refresh_failures_total").increment(1);
		}
		outcome
	}

	async fn refresh_with_retries(&self) -> Result<SecretString, CredentialError> {
		let refresh_token = self.load_refresh_token().await?;

		if self.state.lock().rejected.as_ref() == Some(&refresh_token) {
			debug!("refresh token unchanged since it was rejected; not calling the token endpoint");
			return Err(CredentialError::AuthInvalid(
				"refresh token was already rejected; waiting for a new one".to_string(),
			));
		}

		let max_attempts = self.settings.retry_delays.len() + 1;
		let mut attempt = 0;
		loop {
			attempt += 1;
			let result = self
				.endpoint
				.refresh(
					&self.settings.client_id,
					self.settings.client_secret.expose(),
					refresh_token.expose(),
				)
				.await;

			let err = match result {
				Ok(resp) => return self.accept(resp, &refresh_token).await,
				Err(e) => e,
			};

			if err.is_auth_invalid() {
				error!(error = %err, "refresh token rejected by the identity provider; a new one is required");
				let mut state = self.state.lock();
				state.clear_access_token();
				state.refresh_token = None;
				state.rejected = Some(refresh_token);
				return Err(CredentialError::AuthInvalid(err.to_string()));
			}

			if !err.is_transient() {
				warn!(error = %err, "credential refresh failed");
				return Err(CredentialError::Unexpected(err.to_string()));
			}

			if attempt >= max_attempts {
				warn!(attempt, error = %err, "credential refresh still failing; giving up");
				return Err(CredentialError::Transient(err.to_string()));
			}

			let delay = self.settings.retry_delays[attempt - 1];
			warn!(
				attempt,
				delay_ms = delay.as_millis() as u64,
				error = %err,
				"credential refresh failed; retrying"
			);
			tokio::time::sleep(delay).await;
		}
	}

	async fn load_refresh_token(&self) -> Result<SecretString, CredentialError> {
		if let Some(token) = self.state.lock().refresh_token.clone() {
			return Ok(token);
		}

		let name = self.settings.secret_name.as_str();
		let mut last_error = String::new();
		for attempt in 1..=SECRET_READ_ATTEMPTS {
			match self.store.get_secret_value(name).await {
				Ok(Some(value)) if !value.trim().is_empty() => return Ok(SecretString::new(value)),
				Ok(_) => {
					if self.state.lock().rejected.is_some() {
						return Err(CredentialError::AuthInvalid(
							"refresh token was rejected and no replacement is stored".to_string(),
						));
					}
					return Err(CredentialError::MissingSecret(name.to_string()));
				}
				Err(e) => {
					warn!(attempt, secret = name, error = %e, "secret store read failed");
					last_error = e.to_string();
					if attempt < SECRET_READ_ATTEMPTS {
						tokio::time::sleep(SECRET_READ_DELAY).await;
					}
				}
			}
		}

		Err(CredentialError::Transient(format!("secret store unavailable: {last_error}")))
	}

	async fn accept(&self, resp: TokenRefreshResponse, used: &SecretString) -> Result<SecretString, CredentialError> {
		let access_token = SecretString::new(resp.access_token);
		if access_token.is_empty() {
			return Err(CredentialError::Unexpected(
				"token endpoint returned an empty access_token".to_string(),
			));
		}

		let rotated = resp
			.refresh_token
			.filter(|t| !t.trim().is_empty() && t.as_str() != used.expose())
			.map(SecretString::new);

		{
			let mut state = self.state.lock();
			state.access_token = Some(access_token.clone());
			state.expires_at = resp.expires_in.map(|secs| Instant::now() + usable_lifetime(secs));
			state.rejected = None;
			if let Some(rotated) = &rotated {
				state.refresh_token = Some(rotated.clone());
			}
		}

		if let Some(rotated) = rotated {
			let name = self.settings.secret_name.as_str();
			match self.store.set_secret_value(name, rotated.expose()).await {
				Ok(true) => info!(secret = name, "rotated refresh token persisted"),
				Ok(false) => warn!(secret = name, "secret store declined the rotated refresh token"),
				Err(e) => warn!(secret = name, error = %e, "failed to persist rotated refresh token"),
			}
		}

		info!(expires_in = ?resp.expires_in, "access token refreshed");
		Ok(access_token)
	}
}

#[async_trait::async_trait]
impl AccessTokenProvider for CredentialRefresher {
	async fn access_token(&self) -> anyhow::Result<SecretString> {
		Ok(self.get_valid_credential().await?)
	}

	fn invalidate(&self, rejected: &SecretString) {
		CredentialRefresher::invalidate(self, rejected);
	}
}

impl From<CredentialError> for lazybot_platform::TransportError {
	/// Only a rejected refresh token is an auth failure; the rest may clear up on their own.
	fn from(e: CredentialError) -> Self {
		match e {
			CredentialError::AuthInvalid(_) => Self::Auth(e.to_string()),
			other => Self::Connect(other.to_string()),
		}
	}
}

