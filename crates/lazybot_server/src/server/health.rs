#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::webhook::{WebhookState, handle_delivery};

/// EventSub payloads are small; anything larger is refused.
const MAX_WEBHOOK_BODY: usize = 64 * 1024;

/// Flipped once the bot is fully initialized.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

#[derive(Clone)]
struct ServerState {
	health: HealthState,
	webhook: Option<Arc<WebhookState>>,
}

/// Bind `bind` and serve the health endpoints plus, when configured, the EventSub webhook.
pub async fn spawn_http_server(
	bind: SocketAddr,
	health: HealthState,
	webhook: Option<WebhookState>,
) -> anyhow::Result<SocketAddr> {
	let listener = TcpListener::bind(bind)
		.await
		.with_context(|| format!("bind http listener on {bind}"))?;
	let local = listener.local_addr().context("http listener address")?;
	info!(addr = %local, webhook = webhook.is_some(), "http server listening");

	let state = ServerState {
		health,
		webhook: webhook.map(Arc::new),
	};
	tokio::spawn(async move {
		if let Err(err) = run_http_server(listener, state).await {
			warn!(error = %err, "http server stopped");
		}
	});
	Ok(local)
}

async fn run_http_server(listener: TcpListener, state: ServerState) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "http connection error");
			}
		});
	}
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
	Response::builder().status(status).body(Full::new(Bytes::new())).unwrap()
}

fn text(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::from_static(body)))
		.unwrap()
}

async fn handle_request(req: Request<Incoming>, state: ServerState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if let Some(webhook) = &state.webhook
		&& req.uri().path() == webhook.path
	{
		if req.method() != Method::POST {
			return Ok(empty(StatusCode::METHOD_NOT_ALLOWED));
		}
		let (parts, body) = req.into_parts();
		let body = match Limited::new(body, MAX_WEBHOOK_BODY).collect().await {
			Ok(collected) => collected.to_bytes(),
			Err(err) => {
				warn!(error = %err, "eventsub body rejected");
				return Ok(empty(StatusCode::PAYLOAD_TOO_LARGE));
			}
		};
		return Ok(handle_delivery(webhook, &parts.headers, &body));
	}

	if req.method() != Method::GET {
		return Ok(empty(StatusCode::METHOD_NOT_ALLOWED));
	}

	let response = match req.uri().path() {
		"/healthz" => text(StatusCode::OK, b"ok"),
		"/readyz" if state.health.is_ready() => text(StatusCode::OK, b"ready"),
		"/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, b"not-ready"),
		_ => empty(StatusCode::NOT_FOUND),
	};
	Ok(response)
}
