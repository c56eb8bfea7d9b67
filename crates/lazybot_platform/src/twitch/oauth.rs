#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

pub const DEFAULT_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TokenRefreshResponse {
	pub access_token: String,

	/// Present when the provider rotated the long-lived secret.
	#[serde(default)]
	pub refresh_token: Option<String>,

	#[serde(default)]
	pub expires_in: Option<u64>,
}

/// Failure talking to the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenEndpointError {
	/// The endpoint answered with a non-success status.
	#[error("token endpoint rejected refresh (status={status}): {body}")]
	Rejected { status: u16, body: String },

	/// No usable response: connect error, timeout, unreadable body.
	#[error("token endpoint unreachable: {0}")]
	Network(String),
}

impl TokenEndpointError {
	/// 400/401 mean the refresh token itself is bad.
	pub fn is_auth_invalid(&self) -> bool {
		matches!(self, Self::Rejected { status, .. } if *status == 400 || *status == 401)
	}

	/// Worth retrying: no response, throttling, or a server-side failure.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Network(_) => true,
			Self::Rejected { status, .. } => *status == 408 || *status == 429 || *status >= 500,
		}
	}
}

/// OAuth refresh_token grant.
#[async_trait::async_trait]
pub trait TokenEndpoint: Send + Sync + 'static {
	async fn refresh(
		&self,
		client_id: &str,
		client_secret: &str,
		refresh_token: &str,
	) -> Result<TokenRefreshResponse, TokenEndpointError>;
}

/// Twitch identity provider.
#[derive(Clone, Debug)]
pub struct TwitchOAuth {
	http: reqwest::Client,
	token_url: Url,
}

impl TwitchOAuth {
	pub fn new(token_url: Url, request_timeout: Duration) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("lazybot/0.x (oauth-refresh)")
			.timeout(request_timeout)
			.build()
			.context("build reqwest client")?;

		Ok(Self { http, token_url })
	}
}

#[async_trait::async_trait]
impl TokenEndpoint for TwitchOAuth {
	async fn refresh(
		&self,
		client_id: &str,
		client_secret: &str,
		refresh_token: &str,
	) -> Result<TokenRefreshResponse, TokenEndpointError> {
		let resp = self
			.http
			.post(self.token_url.clone())
			.form(&[
				("client_id", client_id),
				("client_secret", client_secret),
				("grant_type", "refresh_token"),
				("refresh_token", refresh_token),
			])
			.send()
			.await
			.map_err(|e| TokenEndpointError::Network(e.to_string()))?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.map_err(|e| TokenEndpointError::Network(format!("read body: {e}")))?;

		if status != StatusCode::OK {
			return Err(TokenEndpointError::Rejected {
				status: status.as_u16(),
				body,
			});
		}

		serde_json::from_str(&body).map_err(|e| TokenEndpointError::Rejected {
			status: status.as_u16(),
			body: format!("unparseable token response: {e}"),
		})
	}
}
