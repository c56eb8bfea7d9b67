#![forbid(unsafe_code)]

mod config;
mod directory;
mod lifecycle;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use lazybot_platform::ads::AdScheduleClient;
use lazybot_platform::secrets::FileSecretStore;
use lazybot_platform::twitch::{HelixStreamStatus, IrcConfig, IrcTransport, TwitchOAuth};
use lazybot_platform::{ChatTransport, SecretString, transport_event_channel};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

use crate::config::BotConfig;
use crate::directory::{ChannelDirectory, ManagedChannel, SqlChannelDirectory, StaticChannelDirectory};
use crate::lifecycle::ads::{AdNotifierSettings, AdScheduleNotifier, TransportAdAlertSink};
use crate::lifecycle::auditor::{AUDIT_INTERVAL, LivenessAuditor};
use crate::lifecycle::coordinator::{ConnectionEventCoordinator, CoordinatorSettings, spawn_event_dispatcher};
use crate::lifecycle::credentials::{CredentialRefresher, CredentialSettings};
use crate::lifecycle::poller::StreamStatusPoller;
use crate::lifecycle::registry::{ActiveStreamRegistry, ConnectPolicy, ConnectionDecisionEngine};
use crate::lifecycle::supervisor::TransportSupervisor;
use crate::lifecycle::sync::{ChannelSettingsCache, ChannelSync};
use crate::server::health::{HealthState, spawn_http_server};
use crate::server::webhook::WebhookState;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: lazybot [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.lazybot/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,lazybot_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("lazybot");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn parse_url(raw: &str, what: &str) -> anyhow::Result<Url> {
	Url::parse(raw).with_context(|| format!("invalid {what} {raw:?}"))
}

async fn build_directory(cfg: &BotConfig) -> anyhow::Result<Arc<dyn ChannelDirectory>> {
	if let Some(database_url) = cfg.channels.database_url.as_deref() {
		let dir = SqlChannelDirectory::connect(database_url, cfg.channels.watch_interval)
			.await
			.context("open managed-channel database")?;
		info!("managed channels: database directory");
		return Ok(Arc::new(dir));
	}

	let channels = cfg
		.channels
		.static_channels
		.iter()
		.map(|c| ManagedChannel {
			login: c.login.clone(),
			ad_notifications: c.ad_notifications,
		})
		.collect::<Vec<_>>();
	if channels.is_empty() {
		warn!("no managed channels configured");
	}
	info!(count = channels.len(), "managed channels: static list");
	Ok(Arc::new(StaticChannelDirectory::new(channels)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_bot_config_from_path(&config_path)?;
	info!(
		path = %config_path.display(),
		environment = %cfg.environment,
		lazy_connect = cfg.bot.lazy_connect,
		"loaded bot config (toml + env overrides)"
	);

	init_metrics(cfg.server.metrics_bind.as_deref());

	let client_id = cfg
		.twitch
		.client_id
		.clone()
		.filter(|id| !id.trim().is_empty())
		.context("twitch.client_id is required")?;
	let client_secret = cfg
		.twitch
		.client_secret
		.clone()
		.filter(|s| !s.is_empty())
		.context("twitch.client_secret is required")?;

	let secrets_path = cfg.secrets.resolved_path()?;
	info!(path = %secrets_path.display(), "secret store");
	let secret_store = Arc::new(FileSecretStore::new(secrets_path));

	let oauth = Arc::new(TwitchOAuth::new(
		parse_url(&cfg.twitch.token_url, "twitch.token_url")?,
		cfg.twitch.token_request_timeout,
	)?);
	let mut credential_settings = CredentialSettings::new(
		client_id.clone(),
		client_secret,
		cfg.twitch.refresh_token_secret_name.clone(),
	);
	credential_settings.refresh_token_override = cfg.twitch.refresh_token.clone();
	credential_settings.operation_timeout = cfg.twitch.refresh_operation_timeout;
	let credentials = CredentialRefresher::new(credential_settings, oauth, secret_store);

	let (events_tx, events_rx) = transport_event_channel();
	let mut irc_cfg = IrcConfig::new(parse_url(&cfg.twitch.irc_ws_url, "twitch.irc_ws_url")?, cfg.bot.nick.clone());
	irc_cfg.connect_timeout = cfg.bot.connect_timeout;
	let transport: Arc<dyn ChatTransport> = Arc::new(IrcTransport::new(irc_cfg, events_tx));
	let supervisor = TransportSupervisor::create_client(transport, credentials.clone()).await;

	let registry = Arc::new(ActiveStreamRegistry::new());
	let engine = ConnectionDecisionEngine::new(
		Arc::clone(&registry),
		ConnectPolicy {
			environment: cfg.environment.clone(),
			lazy_connect: cfg.bot.lazy_connect,
		},
		supervisor.clone(),
	);

	let cache = Arc::new(ChannelSettingsCache::new());
	let sync = Arc::new(ChannelSync::new(
		build_directory(&cfg).await?,
		Arc::clone(&cache),
		Arc::clone(&registry),
		supervisor.clone(),
		engine.clone(),
		cfg.bot.lazy_connect,
	));

	let status_source = Arc::new(HelixStreamStatus::new(
		parse_url(&cfg.twitch.helix_base_url, "twitch.helix_base_url")?,
		client_id,
		Arc::new(credentials.clone()),
	));
	let poller = Arc::new(StreamStatusPoller::new(
		status_source.clone(),
		Arc::clone(&cache),
		Arc::clone(&registry),
		engine.clone(),
		cfg.bot.stream_poll_interval,
	));
	let auditor = Arc::new(LivenessAuditor::new(
		Arc::clone(&registry),
		status_source,
		engine.clone(),
		AUDIT_INTERVAL,
	));

	let ads = match (cfg.ads.enabled, cfg.ads.proxy_base_url.as_deref()) {
		(true, Some(base_url)) => {
			let client = AdScheduleClient::new(
				parse_url(base_url, "ads.proxy_base_url")?,
				cfg.ads.proxy_token.clone().unwrap_or_else(|| SecretString::new("")),
			)?;
			let settings = AdNotifierSettings {
				poll_interval: cfg.ads.poll_interval,
				lead: cfg.ads.lead,
				min_delay: cfg.ads.min_delay,
				..AdNotifierSettings::default()
			};
			info!(lead_secs = settings.lead.as_secs(), "ad break alerts enabled");
			Some(Arc::new(AdScheduleNotifier::new(
				Arc::clone(&registry),
				Arc::clone(&cache),
				Arc::new(client),
				Arc::new(TransportAdAlertSink::new(supervisor.clone(), cfg.ads.message.clone())),
				settings,
			)))
		}
		(true, None) => {
			warn!("ads.enabled is set but ads.proxy_base_url is missing; ad alerts disabled");
			None
		}
		(false, _) => None,
	};

	let health = HealthState::new();
	let coordinator = Arc::new(ConnectionEventCoordinator::new(
		CoordinatorSettings {
			environment: cfg.environment.clone(),
			lazy_connect: cfg.bot.lazy_connect,
			registry_sync_enabled: cfg.bot.registry_sync_enabled,
			channel_sync_interval: cfg.bot.channel_sync_interval,
		},
		supervisor.clone(),
		engine.clone(),
		Arc::clone(&sync),
		Arc::clone(&poller),
		ads,
		auditor,
		health.clone(),
	));
	let _dispatcher = spawn_event_dispatcher(events_rx, coordinator);

	if let Some(bind) = cfg.server.health_bind.as_deref() {
		let webhook = cfg.server.eventsub_secret.clone().map(|secret| WebhookState {
			path: cfg.server.eventsub_path.clone(),
			secret,
			sink: engine.clone(),
			cache: Arc::clone(&cache),
		});
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_http_server(addr, health.clone(), webhook).await?;
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	} else if cfg.server.eventsub_secret.is_some() {
		warn!("server.eventsub_secret is set but server.health_bind is not; webhook ingress disabled");
	}

	if let Err(e) = sync.resync().await {
		warn!(error = %e, "initial channel load failed");
	}
	// Picks up channels that are already live before the first connect decision.
	poller.poll_once().await;
	engine.reassess_connection_state().await;

	let _idle_discovery = cfg.bot.lazy_connect.then(|| poller.spawn_idle_discovery());

	info!("lazybot running");
	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutting down");

	if let Err(e) = supervisor.disconnect().await {
		warn!(error = %e, "disconnect on shutdown failed");
	}
	Ok(())
}
