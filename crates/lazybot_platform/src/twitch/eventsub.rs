#![forbid(unsafe_code)]

//! EventSub webhook deliveries: signature check and stream online/offline decoding.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use lazybot_domain::ChannelLogin;
use serde::Deserialize;
use sha2::Sha256;

pub const HEADER_MESSAGE_ID: &str = "Twitch-Eventsub-Message-Id";
pub const HEADER_MESSAGE_TIMESTAMP: &str = "Twitch-Eventsub-Message-Timestamp";
pub const HEADER_MESSAGE_SIGNATURE: &str = "Twitch-Eventsub-Message-Signature";
pub const HEADER_MESSAGE_TYPE: &str = "Twitch-Eventsub-Message-Type";

/// Deliveries older than this are refused as replays.
pub const MAX_MESSAGE_AGE_SECS: i64 = 10 * 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookError {
	#[error("missing header {0}")]
	MissingHeader(&'static str),

	#[error("signature mismatch")]
	BadSignature,

	#[error("message timestamp is stale or invalid")]
	Stale,

	#[error("malformed payload: {0}")]
	Payload(String),
}

/// Header values of one delivery.
#[derive(Debug, Clone, Copy)]
pub struct WebhookHeaders<'a> {
	pub message_id: &'a str,
	pub timestamp: &'a str,
	pub signature: &'a str,
	pub message_type: &'a str,
}

/// What a verified delivery asks of us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDelivery {
	/// Echo `challenge` back as plain text.
	Challenge(String),
	Revocation {
		subscription_type: String,
		status: String,
	},
	StreamOnline(ChannelLogin),
	StreamOffline(ChannelLogin),
	/// A notification for a subscription type we do not act on.
	Ignored(String),
}

fn keyed_digest(secret: &[u8], message_id: &str, timestamp: &str, body: &[u8]) -> Option<Hmac<Sha256>> {
	// HMAC accepts keys of any length, so this only fails in theory.
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).ok()?;
	mac.update(message_id.as_bytes());
	mac.update(timestamp.as_bytes());
	mac.update(body);
	Some(mac)
}

/// `sha256=<hex>` over `message_id ‖ timestamp ‖ body`.
pub fn sign(secret: &[u8], message_id: &str, timestamp: &str, body: &[u8]) -> String {
	match keyed_digest(secret, message_id, timestamp, body) {
		Some(mac) => format!("sha256={}", hex::encode(mac.finalize().into_bytes())),
		None => String::new(),
	}
}

pub fn verify_signature(secret: &[u8], headers: &WebhookHeaders<'_>, body: &[u8]) -> Result<(), WebhookError> {
	if headers.message_id.is_empty() {
		return Err(WebhookError::MissingHeader(HEADER_MESSAGE_ID));
	}
	if headers.timestamp.is_empty() {
		return Err(WebhookError::MissingHeader(HEADER_MESSAGE_TIMESTAMP));
	}
	if headers.signature.is_empty() {
		return Err(WebhookError::MissingHeader(HEADER_MESSAGE_SIGNATURE));
	}

	let presented = headers
		.signature
		.trim()
		.strip_prefix("sha256=")
		.and_then(|h| hex::decode(h).ok())
		.ok_or(WebhookError::BadSignature)?;
	keyed_digest(secret, headers.message_id, headers.timestamp, body)
		.ok_or(WebhookError::BadSignature)?
		.verify_slice(&presented)
		.map_err(|_| WebhookError::BadSignature)
}

pub fn check_freshness(timestamp: &str, now: DateTime<Utc>) -> Result<(), WebhookError> {
	let sent = DateTime::parse_from_rfc3339(timestamp.trim())
		.map_err(|_| WebhookError::Stale)?
		.with_timezone(&Utc);
	if now.signed_duration_since(sent).num_seconds() > MAX_MESSAGE_AGE_SECS {
		return Err(WebhookError::Stale);
	}
	Ok(())
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
	subscription: WebhookSubscription,

	#[serde(default)]
	challenge: Option<String>,

	#[serde(default)]
	event: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WebhookSubscription {
	#[serde(rename = "type")]
	kind: String,

	#[serde(default)]
	status: String,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
	broadcaster_user_login: String,
}

/// Verify and decode one delivery.
pub fn decode_delivery(
	secret: &[u8],
	headers: &WebhookHeaders<'_>,
	body: &[u8],
	now: DateTime<Utc>,
) -> Result<WebhookDelivery, WebhookError> {
	verify_signature(secret, headers, body)?;
	check_freshness(headers.timestamp, now)?;

	let envelope: WebhookEnvelope = serde_json::from_slice(body).map_err(|e| WebhookError::Payload(e.to_string()))?;

	match headers.message_type {
		"webhook_callback_verification" => envelope
			.challenge
			.map(WebhookDelivery::Challenge)
			.ok_or_else(|| WebhookError::Payload("missing challenge".to_string())),
		"revocation" => Ok(WebhookDelivery::Revocation {
			subscription_type: envelope.subscription.kind,
			status: envelope.subscription.status,
		}),
		"notification" => {
			let kind = envelope.subscription.kind;
			let online = match kind.as_str() {
				"stream.online" => true,
				"stream.offline" => false,
				_ => return Ok(WebhookDelivery::Ignored(kind)),
			};
			let event = envelope
				.event
				.ok_or_else(|| WebhookError::Payload("missing event".to_string()))?;
			let event: StreamEvent = serde_json::from_value(event).map_err(|e| WebhookError::Payload(e.to_string()))?;
			let login =
				ChannelLogin::new(&event.broadcaster_user_login).map_err(|e| WebhookError::Payload(e.to_string()))?;
			Ok(if online {
				WebhookDelivery::StreamOnline(login)
			} else {
				WebhookDelivery::StreamOffline(login)
			})
		}
		other => Err(WebhookError::Payload(format!("unknown message type {other:?}"))),
	}
}
