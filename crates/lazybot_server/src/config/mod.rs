#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use lazybot_domain::{ChannelLogin, Environment};
use lazybot_platform::SecretString;
use lazybot_platform::twitch::helix::DEFAULT_HELIX_BASE_URL;
use lazybot_platform::twitch::irc::DEFAULT_IRC_WS_URL;
use lazybot_platform::twitch::oauth::DEFAULT_TOKEN_URL;
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_REFRESH_TOKEN_SECRET_NAME: &str = "twitch-bot-refresh-token";
pub const DEFAULT_EVENTSUB_PATH: &str = "/eventsub";
pub const DEFAULT_AD_MESSAGE: &str = "Heads up: an ad break starts in about a minute. Stretch, hydrate, and we'll be right back!";

/// Directory holding the config and secrets files: `~/.lazybot`.
pub fn default_config_dir() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".lazybot"))
}

/// Default config path: `~/.lazybot/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	Ok(default_config_dir()?.join("config.toml"))
}

/// Load the bot config from TOML and `LAZYBOT_*` env overrides.
pub fn load_bot_config_from_path(path: &Path) -> anyhow::Result<BotConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = BotConfig::from_file(file_cfg);
	apply_env_overrides_with(&mut cfg, |key| std::env::var(key).ok());
	Ok(cfg)
}

/// Bot config (v1).
#[derive(Debug, Clone, Default)]
pub struct BotConfig {
	pub environment: Environment,
	pub bot: BotSettings,
	pub twitch: TwitchSettings,
	pub secrets: SecretsSettings,
	pub ads: AdsSettings,
	pub channels: ChannelsSettings,
	pub server: ServerSettings,
}

#[derive(Debug, Clone)]
pub struct BotSettings {
	/// Login the bot authenticates as.
	pub nick: String,
	/// Stay disconnected while no managed channel is live.
	pub lazy_connect: bool,
	pub channel_sync_interval: Duration,
	/// Keep a change listener on the channel directory while connected.
	pub registry_sync_enabled: bool,
	pub stream_poll_interval: Duration,
	pub connect_timeout: Duration,
}

impl Default for BotSettings {
	fn default() -> Self {
		Self {
			nick: String::new(),
			lazy_connect: false,
			channel_sync_interval: Duration::from_secs(300),
			registry_sync_enabled: true,
			stream_poll_interval: Duration::from_secs(120),
			connect_timeout: Duration::from_secs(15),
		}
	}
}

#[derive(Debug, Clone)]
pub struct TwitchSettings {
	pub client_id: Option<String>,
	pub client_secret: Option<SecretString>,
	/// Local override of the long-lived refresh token; the secret store is used otherwise.
	pub refresh_token: Option<SecretString>,
	pub refresh_token_secret_name: String,
	pub irc_ws_url: String,
	pub helix_base_url: String,
	pub token_url: String,
	pub token_request_timeout: Duration,
	/// Upper bound for a whole refresh including retries.
	pub refresh_operation_timeout: Duration,
}

impl Default for TwitchSettings {
	fn default() -> Self {
		Self {
			client_id: None,
			client_secret: None,
			refresh_token: None,
			refresh_token_secret_name: DEFAULT_REFRESH_TOKEN_SECRET_NAME.to_string(),
			irc_ws_url: DEFAULT_IRC_WS_URL.to_string(),
			helix_base_url: DEFAULT_HELIX_BASE_URL.to_string(),
			token_url: DEFAULT_TOKEN_URL.to_string(),
			token_request_timeout: Duration::from_secs(10),
			refresh_operation_timeout: Duration::from_secs(60),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct SecretsSettings {
	/// File secret store path; `~/.lazybot/secrets.toml` when unset.
	pub path: Option<PathBuf>,
}

impl SecretsSettings {
	pub fn resolved_path(&self) -> anyhow::Result<PathBuf> {
		match &self.path {
			Some(path) => Ok(path.clone()),
			None => Ok(default_config_dir()?.join("secrets.toml")),
		}
	}
}

#[derive(Debug, Clone)]
pub struct AdsSettings {
	pub enabled: bool,
	pub proxy_base_url: Option<String>,
	pub proxy_token: Option<SecretString>,
	pub poll_interval: Duration,
	/// How long before the ad break the alert goes out.
	pub lead: Duration,
	/// Alerts never fire sooner than this after being armed.
	pub min_delay: Duration,
	pub message: String,
}

impl Default for AdsSettings {
	fn default() -> Self {
		Self {
			enabled: false,
			proxy_base_url: None,
			proxy_token: None,
			poll_interval: Duration::from_secs(30),
			lead: Duration::from_secs(60),
			min_delay: Duration::from_secs(5),
			message: DEFAULT_AD_MESSAGE.to_string(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticChannel {
	pub login: ChannelLogin,
	pub ad_notifications: bool,
}

#[derive(Debug, Clone)]
pub struct ChannelsSettings {
	/// Managed-channel table (sqlite:, postgres:, mysql:). Takes precedence over `static_channels`.
	pub database_url: Option<String>,
	pub static_channels: Vec<StaticChannel>,
	pub watch_interval: Duration,
}

impl Default for ChannelsSettings {
	fn default() -> Self {
		Self {
			database_url: None,
			static_channels: Vec::new(),
			watch_interval: Duration::from_secs(15),
		}
	}
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Health/readiness and webhook HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// EventSub webhook secret; the webhook route is disabled without it.
	pub eventsub_secret: Option<SecretString>,
	pub eventsub_path: String,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			health_bind: None,
			metrics_bind: None,
			eventsub_secret: None,
			eventsub_path: DEFAULT_EVENTSUB_PATH.to_string(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	environment: Option<String>,

	#[serde(default)]
	bot: FileBotSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	secrets: FileSecretsSettings,

	#[serde(default)]
	ads: FileAdsSettings,

	#[serde(default)]
	channels: FileChannelsSettings,

	#[serde(default)]
	server: FileServerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBotSettings {
	nick: Option<String>,
	lazy_connect: Option<bool>,
	channel_sync_interval_secs: Option<u64>,
	registry_sync_enabled: Option<bool>,
	stream_poll_interval_secs: Option<u64>,
	connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	refresh_token: Option<String>,
	refresh_token_secret_name: Option<String>,
	irc_ws_url: Option<String>,
	helix_base_url: Option<String>,
	token_url: Option<String>,
	token_request_timeout_secs: Option<u64>,
	refresh_operation_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSecretsSettings {
	path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAdsSettings {
	enabled: Option<bool>,
	proxy_base_url: Option<String>,
	proxy_token: Option<String>,
	poll_interval_secs: Option<u64>,
	lead_secs: Option<u64>,
	min_delay_secs: Option<u64>,
	message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChannelsSettings {
	database_url: Option<String>,
	#[serde(default, rename = "static")]
	static_channels: Vec<FileStaticChannel>,
	watch_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileStaticChannel {
	name: String,
	ad_notifications: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	health_bind: Option<String>,
	metrics_bind: Option<String>,
	eventsub_secret: Option<String>,
	eventsub_path: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Zero intervals would spin; keep the default instead.
fn positive_secs(field: &'static str, v: Option<u64>, default: Duration) -> Duration {
	match v {
		Some(0) => {
			warn!(field, "config: zero interval ignored");
			default
		}
		Some(secs) => Duration::from_secs(secs),
		None => default,
	}
}

impl BotConfig {
	fn from_file(file: FileConfig) -> Self {
		let environment = match non_empty(file.environment) {
			Some(name) => name.parse::<Environment>().unwrap_or_default(),
			None => Environment::default(),
		};

		let bot_defaults = BotSettings::default();
		let bot = BotSettings {
			nick: non_empty(file.bot.nick).unwrap_or_default().to_ascii_lowercase(),
			lazy_connect: file.bot.lazy_connect.unwrap_or(bot_defaults.lazy_connect),
			channel_sync_interval: positive_secs(
				"bot.channel_sync_interval_secs",
				file.bot.channel_sync_interval_secs,
				bot_defaults.channel_sync_interval,
			),
			registry_sync_enabled: file.bot.registry_sync_enabled.unwrap_or(bot_defaults.registry_sync_enabled),
			stream_poll_interval: positive_secs(
				"bot.stream_poll_interval_secs",
				file.bot.stream_poll_interval_secs,
				bot_defaults.stream_poll_interval,
			),
			connect_timeout: positive_secs(
				"bot.connect_timeout_secs",
				file.bot.connect_timeout_secs,
				bot_defaults.connect_timeout,
			),
		};

		let twitch_defaults = TwitchSettings::default();
		let twitch = TwitchSettings {
			client_id: non_empty(file.twitch.client_id),
			client_secret: non_empty(file.twitch.client_secret).map(SecretString::new),
			refresh_token: non_empty(file.twitch.refresh_token).map(SecretString::new),
			refresh_token_secret_name: non_empty(file.twitch.refresh_token_secret_name)
				.unwrap_or(twitch_defaults.refresh_token_secret_name),
			irc_ws_url: non_empty(file.twitch.irc_ws_url).unwrap_or(twitch_defaults.irc_ws_url),
			helix_base_url: non_empty(file.twitch.helix_base_url).unwrap_or(twitch_defaults.helix_base_url),
			token_url: non_empty(file.twitch.token_url).unwrap_or(twitch_defaults.token_url),
			token_request_timeout: positive_secs(
				"twitch.token_request_timeout_secs",
				file.twitch.token_request_timeout_secs,
				twitch_defaults.token_request_timeout,
			),
			refresh_operation_timeout: positive_secs(
				"twitch.refresh_operation_timeout_secs",
				file.twitch.refresh_operation_timeout_secs,
				twitch_defaults.refresh_operation_timeout,
			),
		};

		let ads_defaults = AdsSettings::default();
		let ads = AdsSettings {
			enabled: file.ads.enabled.unwrap_or(ads_defaults.enabled),
			proxy_base_url: non_empty(file.ads.proxy_base_url),
			proxy_token: non_empty(file.ads.proxy_token).map(SecretString::new),
			poll_interval: positive_secs("ads.poll_interval_secs", file.ads.poll_interval_secs, ads_defaults.poll_interval),
			lead: file.ads.lead_secs.map(Duration::from_secs).unwrap_or(ads_defaults.lead),
			min_delay: file
				.ads
				.min_delay_secs
				.map(Duration::from_secs)
				.unwrap_or(ads_defaults.min_delay),
			message: non_empty(file.ads.message).unwrap_or(ads_defaults.message),
		};

		let mut static_channels: Vec<StaticChannel> = Vec::new();
		for entry in file.channels.static_channels {
			match ChannelLogin::new(&entry.name) {
				Ok(login) => {
					if static_channels.iter().any(|c| c.login == login) {
						warn!(channel = %login, "config: duplicate static channel ignored");
						continue;
					}
					static_channels.push(StaticChannel {
						login,
						ad_notifications: entry.ad_notifications.unwrap_or(true),
					});
				}
				Err(e) => warn!(name = %entry.name, error = %e, "config: invalid static channel ignored"),
			}
		}

		let channels = ChannelsSettings {
			database_url: non_empty(file.channels.database_url),
			static_channels,
			watch_interval: positive_secs(
				"channels.watch_interval_secs",
				file.channels.watch_interval_secs,
				ChannelsSettings::default().watch_interval,
			),
		};

		let server = ServerSettings {
			health_bind: non_empty(file.server.health_bind),
			metrics_bind: non_empty(file.server.metrics_bind),
			eventsub_secret: non_empty(file.server.eventsub_secret).map(SecretString::new),
			eventsub_path: non_empty(file.server.eventsub_path)
				.map(normalize_path)
				.unwrap_or_else(|| DEFAULT_EVENTSUB_PATH.to_string()),
		};

		Self {
			environment,
			bot,
			twitch,
			secrets: SecretsSettings {
				path: non_empty(file.secrets.path).map(PathBuf::from),
			},
			ads,
			channels,
			server,
		}
	}
}

fn normalize_path(path: String) -> String {
	if path.starts_with('/') { path } else { format!("/{path}") }
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// Apply `LAZYBOT_*` overrides read through `lookup`.
pub fn apply_env_overrides_with(cfg: &mut BotConfig, lookup: impl Fn(&str) -> Option<String>) {
	let string = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
	let bool_var = |key: &str| {
		let raw = lookup(key)?;
		let parsed = parse_env_bool(&raw);
		if parsed.is_none() {
			warn!(key, value = %raw, "config: invalid boolean in env ignored");
		}
		parsed
	};
	let secs_var = |key: &str| {
		let raw = lookup(key)?;
		match raw.trim().parse::<u64>() {
			Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
			_ => {
				warn!(key, value = %raw, "config: invalid interval in env ignored");
				None
			}
		}
	};

	if let Some(v) = string("LAZYBOT_ENVIRONMENT")
		&& let Ok(environment) = v.parse::<Environment>()
	{
		info!(environment = %environment, "bot config: environment overridden by env");
		cfg.environment = environment;
	}

	if let Some(v) = string("LAZYBOT_NICK") {
		cfg.bot.nick = v.to_ascii_lowercase();
		info!("bot config: nick overridden by env");
	}

	if let Some(lazy_connect) = bool_var("LAZYBOT_LAZY_CONNECT") {
		cfg.bot.lazy_connect = lazy_connect;
		info!(lazy_connect, "bot config: lazy_connect overridden by env");
	}

	if let Some(interval) = secs_var("LAZYBOT_CHANNEL_SYNC_INTERVAL_SECS") {
		cfg.bot.channel_sync_interval = interval;
		info!(secs = interval.as_secs(), "bot config: channel_sync_interval overridden by env");
	}

	if let Some(enabled) = bool_var("LAZYBOT_REGISTRY_SYNC_ENABLED") {
		cfg.bot.registry_sync_enabled = enabled;
		info!(enabled, "bot config: registry_sync_enabled overridden by env");
	}

	if let Some(interval) = secs_var("LAZYBOT_STREAM_POLL_INTERVAL_SECS") {
		cfg.bot.stream_poll_interval = interval;
		info!(secs = interval.as_secs(), "bot config: stream_poll_interval overridden by env");
	}

	if let Some(v) = string("LAZYBOT_TWITCH_CLIENT_ID") {
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = string("LAZYBOT_TWITCH_CLIENT_SECRET") {
		cfg.twitch.client_secret = Some(SecretString::new(v));
		info!("twitch config: client_secret overridden by env");
	}

	if let Some(v) = string("LAZYBOT_TWITCH_REFRESH_TOKEN") {
		cfg.twitch.refresh_token = Some(SecretString::new(v));
		info!("twitch config: refresh_token overridden by env");
	}

	if let Some(v) = string("LAZYBOT_TWITCH_IRC_WS_URL") {
		cfg.twitch.irc_ws_url = v;
		info!("twitch config: irc_ws_url overridden by env");
	}

	if let Some(v) = string("LAZYBOT_SECRETS_PATH") {
		cfg.secrets.path = Some(PathBuf::from(v));
		info!("secrets config: path overridden by env");
	}

	if let Some(enabled) = bool_var("LAZYBOT_ADS_ENABLED") {
		cfg.ads.enabled = enabled;
		info!(enabled, "ads config: enabled overridden by env");
	}

	if let Some(v) = string("LAZYBOT_ADS_PROXY_BASE_URL") {
		cfg.ads.proxy_base_url = Some(v);
		info!("ads config: proxy_base_url overridden by env");
	}

	if let Some(v) = string("LAZYBOT_ADS_PROXY_TOKEN") {
		cfg.ads.proxy_token = Some(SecretString::new(v));
		info!("ads config: proxy_token overridden by env");
	}

	if let Some(v) = string("LAZYBOT_CHANNELS_DATABASE_URL") {
		cfg.channels.database_url = Some(v);
		info!("channels config: database_url overridden by env");
	}

	if let Some(v) = string("LAZYBOT_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = string("LAZYBOT_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = string("LAZYBOT_EVENTSUB_SECRET") {
		cfg.server.eventsub_secret = Some(SecretString::new(v));
		info!("server config: eventsub_secret overridden by env");
	}

	if cfg.ads.enabled && cfg.ads.proxy_base_url.is_none() {
		warn!("ads config: enabled without proxy_base_url; ad alerts stay off");
	}

	if cfg.ads.lead < cfg.ads.min_delay {
		warn!(
			lead_secs = cfg.ads.lead.as_secs(),
			min_delay_secs = cfg.ads.min_delay.as_secs(),
			"ads config: lead shorter than min_delay; alerts may arrive after the break starts"
		);
	}
}
