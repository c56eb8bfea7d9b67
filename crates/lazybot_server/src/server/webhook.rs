#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::header::HeaderMap;
use hyper::{Response, StatusCode};
use lazybot_platform::SecretString;
use lazybot_platform::twitch::eventsub::{
	HEADER_MESSAGE_ID, HEADER_MESSAGE_SIGNATURE, HEADER_MESSAGE_TIMESTAMP, HEADER_MESSAGE_TYPE, WebhookDelivery,
	WebhookError, WebhookHeaders, decode_delivery,
};
use tracing::{debug, info, warn};

use crate::lifecycle::registry::StreamStatusSink;
use crate::lifecycle::sync::ChannelSettingsCache;

/// EventSub webhook ingress.
#[derive(Clone)]
pub struct WebhookState {
	pub path: String,
	pub secret: SecretString,
	pub sink: Arc<dyn StreamStatusSink>,
	/// Only managed channels are forwarded.
	pub cache: Arc<ChannelSettingsCache>,
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, WebhookError> {
	headers
		.get(name)
		.and_then(|v| v.to_str().ok())
		.ok_or(WebhookError::MissingHeader(name))
}

fn webhook_headers(headers: &HeaderMap) -> Result<WebhookHeaders<'_>, WebhookError> {
	Ok(WebhookHeaders {
		message_id: header(headers, HEADER_MESSAGE_ID)?,
		timestamp: header(headers, HEADER_MESSAGE_TIMESTAMP)?,
		signature: header(headers, HEADER_MESSAGE_SIGNATURE)?,
		message_type: header(headers, HEADER_MESSAGE_TYPE)?,
	})
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	Response::builder().status(status).body(Full::new(body.into())).unwrap()
}

/// Handle one delivery; stream changes are applied off the request path.
pub fn handle_delivery(state: &WebhookState, headers: &HeaderMap, body: &[u8]) -> Response<Full<Bytes>> {
	let delivery = webhook_headers(headers)
		.and_then(|h| decode_delivery(state.secret.expose().as_bytes(), &h, body, Utc::now()));

	let delivery = match delivery {
		Ok(delivery) => delivery,
		Err(e) => {
			metrics::counter!("lazybot_webhook_requests_total", "outcome" => "rejected").increment(1);
			warn!(error = %e, "eventsub delivery rejected");
			let status = match e {
				WebhookError::BadSignature => StatusCode::FORBIDDEN,
				_ => StatusCode::BAD_REQUEST,
			};
			return respond(status, Bytes::new());
		}
	};

	metrics::counter!("lazybot_webhook_requests_total", "outcome" => "accepted").increment(1);
	match delivery {
		WebhookDelivery::Challenge(challenge) => {
			info!("eventsub subscription verified");
			Response::builder()
				.status(StatusCode::OK)
				.header(hyper::header::CONTENT_TYPE, "text/plain")
				.body(Full::new(Bytes::from(challenge)))
				.unwrap()
		}
		WebhookDelivery::Revocation {
			subscription_type,
			status,
		} => {
			warn!(subscription_type, status, "eventsub subscription revoked");
			respond(StatusCode::NO_CONTENT, Bytes::new())
		}
		WebhookDelivery::StreamOnline(channel) | WebhookDelivery::StreamOffline(channel)
			if !state.cache.is_managed(&channel) =>
		{
			debug!(channel = %channel, "eventsub notification for unmanaged channel ignored");
			respond(StatusCode::NO_CONTENT, Bytes::new())
		}
		WebhookDelivery::StreamOnline(channel) => {
			forward(state, channel, true);
			respond(StatusCode::NO_CONTENT, Bytes::new())
		}
		WebhookDelivery::StreamOffline(channel) => {
			forward(state, channel, false);
			respond(StatusCode::NO_CONTENT, Bytes::new())
		}
		WebhookDelivery::Ignored(kind) => {
			debug!(kind, "eventsub notification ignored");
			respond(StatusCode::NO_CONTENT, Bytes::new())
		}
	}
}

fn forward(state: &WebhookState, channel: lazybot_domain::ChannelLogin, is_live: bool) {
	info!(channel = %channel, is_live, "eventsub stream status");
	let sink = Arc::clone(&state.sink);
	tokio::spawn(async move {
		sink.on_stream_status_change(&channel, is_live).await;
	});
}
