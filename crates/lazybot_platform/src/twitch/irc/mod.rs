#![forbid(unsafe_code)]

mod message;

pub use message::IrcMessage;

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use lazybot_domain::{ChannelLogin, ReadyState};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::{ChatTransport, SecretString, TransportError, TransportEvent, TransportEventTx};

pub const DEFAULT_IRC_WS_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

const CAPABILITIES: &str = "CAP REQ :twitch.tv/tags twitch.tv/commands";
const MEMBERSHIP_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type IrcWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<IrcWs>> + Send + Sync>;

/// Whether a server notice means the access token was refused.
pub fn is_auth_failure(msgid: Option<&str>, message: &str) -> bool {
	if msgid.is_some_and(|id| id.eq_ignore_ascii_case("login_authentication_failed")) {
		return true;
	}
	let lower = message.to_ascii_lowercase();
	lower.contains("login authentication failed") || lower.contains("improperly formatted auth")
}

#[derive(Clone)]
pub struct IrcConfig {
	pub ws_url: Url,
	pub nick: String,
	/// Bounds both the websocket handshake and the wait for `001`.
	pub connect_timeout: Duration,
	pub ws_connector: Option<WsConnector>,
}

impl IrcConfig {
	pub fn new(ws_url: Url, nick: impl Into<String>) -> Self {
		Self {
			ws_url,
			nick: nick.into(),
			connect_timeout: Duration::from_secs(15),
			ws_connector: None,
		}
	}
}

impl fmt::Debug for IrcConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("IrcConfig")
			.field("ws_url", &self.ws_url.as_str())
			.field("nick", &self.nick)
			.field("connect_timeout", &self.connect_timeout)
			.field("ws_connector", &self.ws_connector.is_some())
			.finish()
	}
}

enum Outbound {
	Line(String),
	Close,
}

struct LinkState {
	ready: ReadyState,
	channels: BTreeSet<ChannelLogin>,
	credential: Option<SecretString>,
	outbound: Option<mpsc::UnboundedSender<Outbound>>,
}

struct Shared {
	state: Mutex<LinkState>,
	membership: Notify,
	events: TransportEventTx,
}

impl Shared {
	fn emit(&self, event: TransportEvent) {
		let _ = self.events.send(event);
	}

	fn set_ready(&self, ready: ReadyState) {
		self.state.lock().ready = ready;
	}

	fn fail_connect(&self, err: TransportError) -> TransportError {
		{
			let mut st = self.state.lock();
			st.ready = ReadyState::Closed;
			st.outbound = None;
		}
		self.emit(TransportEvent::Disconnected { reason: err.to_string() });
		err
	}
}

struct Session {
	outbound: mpsc::UnboundedSender<Outbound>,
	task: JoinHandle<()>,
}

/// Twitch chat over IRC-on-WebSocket.
pub struct IrcTransport {
	cfg: IrcConfig,
	nick: String,
	shared: Arc<Shared>,
	session: tokio::sync::Mutex<Option<Session>>,
}

impl IrcTransport {
	pub fn new(cfg: IrcConfig, events: TransportEventTx) -> Self {
		let nick = cfg.nick.trim().to_ascii_lowercase();
		Self {
			cfg,
			nick,
			shared: Arc::new(Shared {
				state: Mutex::new(LinkState {
					ready: ReadyState::Closed,
					channels: BTreeSet::new(),
					credential: None,
					outbound: None,
				}),
				membership: Notify::new(),
				events,
			}),
			session: tokio::sync::Mutex::new(None),
		}
	}

	async fn connect_irc_ws(url: Url) -> anyhow::Result<IrcWs> {
		let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
			.await
			.context("connect_async to irc ws")?;
		Ok(ws)
	}

	fn ws_connector(&self) -> WsConnector {
		if let Some(c) = &self.cfg.ws_connector {
			return c.clone();
		}

		Arc::new(|url: Url| Box::pin(async move { Self::connect_irc_ws(url).await }) as BoxFuture<'static, anyhow::Result<IrcWs>>)
	}

	fn send_line(&self, line: String) -> Result<(), TransportError> {
		let st = self.shared.state.lock();
		if st.ready != ReadyState::Open {
			return Err(TransportError::NotConnected);
		}
		let Some(tx) = st.outbound.as_ref() else {
			return Err(TransportError::NotConnected);
		};
		tx.send(Outbound::Line(line)).map_err(|_| TransportError::NotConnected)
	}

	async fn wait_for_membership(&self, channel: &ChannelLogin, joined: bool) -> Result<(), TransportError> {
		let deadline = tokio::time::Instant::now() + MEMBERSHIP_TIMEOUT;
		loop {
			let notified = self.shared.membership.notified();
			{
				let st = self.shared.state.lock();
				if st.channels.contains(channel) == joined {
					return Ok(());
				}
				if st.ready != ReadyState::Open {
					return Err(TransportError::NotConnected);
				}
			}
			if tokio::time::timeout_at(deadline, notified).await.is_err() {
				let op = if joined { "join" } else { "part" };
				return Err(TransportError::Timeout(format!("{op} {channel}")));
			}
		}
	}

	async fn shutdown_session(outbound: &mpsc::UnboundedSender<Outbound>, mut task: JoinHandle<()>) {
		let _ = outbound.send(Outbound::Close);
		if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
			warn!("irc session did not stop in time; aborting");
			task.abort();
		}
	}
}

#[async_trait::async_trait]
impl ChatTransport for IrcTransport {
	async fn connect(&self) -> Result<(), TransportError> {
		let mut session = self.session.lock().await;
		if let Some(existing) = session.as_ref()
			&& !existing.task.is_finished()
			&& self.ready_state() == ReadyState::Open
		{
			return Ok(());
		}
		if let Some(stale) = session.take() {
			stale.task.abort();
		}

		let token = self
			.shared
			.state
			.lock()
			.credential
			.clone()
			.filter(|t| !t.is_empty())
			.ok_or_else(|| TransportError::Auth("no access token configured".to_string()))?;

		self.shared.set_ready(ReadyState::Connecting);
		self.shared.emit(TransportEvent::Connecting);
		info!(url = %self.cfg.ws_url, nick = %self.nick, "connecting to twitch irc");

		let connector = self.ws_connector();
		let mut ws = match tokio::time::timeout(self.cfg.connect_timeout, connector(self.cfg.ws_url.clone())).await {
			Ok(Ok(ws)) => ws,
			Ok(Err(e)) => return Err(self.shared.fail_connect(TransportError::Connect(format!("{e:#}")))),
			Err(_) => {
				return Err(self
					.shared
					.fail_connect(TransportError::Timeout("websocket handshake".to_string())));
			}
		};

		let login = [
			CAPABILITIES.to_string(),
			format!("PASS oauth:{}", token.expose()),
			format!("NICK {}", self.nick),
		];
		for line in login {
			if let Err(e) = ws.send(Message::Text(line.into())).await {
				return Err(self.shared.fail_connect(TransportError::Io(e.to_string())));
			}
		}

		let (out_tx, out_rx) = mpsc::unbounded_channel();
		let (welcome_tx, welcome_rx) = oneshot::channel();
		self.shared.state.lock().outbound = Some(out_tx.clone());
		let task = tokio::spawn(run_session(ws, out_rx, self.shared.clone(), self.nick.clone(), welcome_tx));

		match tokio::time::timeout(self.cfg.connect_timeout, welcome_rx).await {
			Ok(Ok(Ok(()))) => {
				*session = Some(Session { outbound: out_tx, task });
				metrics::counter!("lazybot_irc_sessions_total").increment(1);
				Ok(())
			}
			Ok(Ok(Err(e))) => {
				Self::shutdown_session(&out_tx, task).await;
				Err(e)
			}
			Ok(Err(_)) => {
				Self::shutdown_session(&out_tx, task).await;
				Err(TransportError::Connect("session ended before welcome".to_string()))
			}
			Err(_) => {
				Self::shutdown_session(&out_tx, task).await;
				Err(TransportError::Timeout("waiting for welcome".to_string()))
			}
		}
	}

	async fn disconnect(&self) -> Result<(), TransportError> {
		let mut session = self.session.lock().await;
		let Some(active) = session.take() else {
			self.shared.set_ready(ReadyState::Closed);
			return Ok(());
		};

		{
			let mut st = self.shared.state.lock();
			st.ready = ReadyState::Closing;
			st.outbound = None;
		}
		Self::shutdown_session(&active.outbound, active.task).await;
		self.shared.set_ready(ReadyState::Closed);
		Ok(())
	}

	fn ready_state(&self) -> ReadyState {
		self.shared.state.lock().ready
	}

	fn channels(&self) -> Vec<ChannelLogin> {
		self.shared.state.lock().channels.iter().cloned().collect()
	}

	async fn join(&self, channel: &ChannelLogin) -> Result<(), TransportError> {
		if self.shared.state.lock().channels.contains(channel) {
			return Ok(());
		}
		self.send_line(format!("JOIN {}", channel.irc_channel()))?;
		self.wait_for_membership(channel, true).await
	}

	async fn part(&self, channel: &ChannelLogin) -> Result<(), TransportError> {
		if !self.shared.state.lock().channels.contains(channel) {
			return Ok(());
		}
		self.send_line(format!("PART {}", channel.irc_channel()))?;
		self.wait_for_membership(channel, false).await
	}

	async fn say(&self, channel: &ChannelLogin, text: &str) -> Result<(), TransportError> {
		let text = text.replace(['\r', '\n'], " ");
		self.send_line(format!("PRIVMSG {} :{}", channel.irc_channel(), text.trim()))
	}

	fn set_credential(&self, access_token: SecretString) {
		self.shared.state.lock().credential = Some(access_token);
	}
}

type Welcome = Option<oneshot::Sender<Result<(), TransportError>>>;

/// Returns `Err(reason)` when the session must end.
fn handle_line(
	msg: &IrcMessage,
	shared: &Shared,
	nick: &str,
	welcome: &mut Welcome,
	replies: &mut Vec<String>,
) -> Result<(), String> {
	match msg.command.as_str() {
		"PING" => {
			replies.push(format!("PONG :{}", msg.trailing().unwrap_or("tmi.twitch.tv")));
		}
		"001" => {
			shared.set_ready(ReadyState::Open);
			if let Some(tx) = welcome.take() {
				let _ = tx.send(Ok(()));
			}
			info!(nick = %nick, "twitch irc login accepted");
			shared.emit(TransportEvent::Connected);
		}
		"JOIN" | "PART" => {
			let ours = msg.nick().is_some_and(|n| n.eq_ignore_ascii_case(nick));
			if ours && let Some(Ok(channel)) = msg.param(0).map(ChannelLogin::new) {
				let mut st = shared.state.lock();
				if msg.command == "JOIN" {
					debug!(channel = %channel, "joined");
					st.channels.insert(channel);
				} else {
					debug!(channel = %channel, "parted");
					st.channels.remove(&channel);
				}
				drop(st);
				shared.membership.notify_waiters();
			}
		}
		"NOTICE" => {
			let channel = msg
				.param(0)
				.filter(|p| p.starts_with('#'))
				.and_then(|p| ChannelLogin::new(p).ok());
			let msgid = msg.tag("msg-id").map(str::to_string);
			let message = msg.trailing().unwrap_or_default().to_string();
			let auth_failed = is_auth_failure(msgid.as_deref(), &message);

			shared.emit(TransportEvent::Notice {
				channel,
				msgid,
				message: message.clone(),
			});

			if auth_failed {
				if let Some(tx) = welcome.take() {
					let _ = tx.send(Err(TransportError::Auth(message.clone())));
				}
				return Err(format!("login rejected: {message}"));
			}
		}
		"RECONNECT" => return Err("server requested reconnect".to_string()),
		_ => {}
	}
	Ok(())
}

async fn run_session(
	ws: IrcWs,
	mut outbound: mpsc::UnboundedReceiver<Outbound>,
	shared: Arc<Shared>,
	nick: String,
	welcome_tx: oneshot::Sender<Result<(), TransportError>>,
) {
	let (mut sink, mut stream) = ws.split();
	let mut welcome: Welcome = Some(welcome_tx);

	let reason = 'session: loop {
		tokio::select! {
			cmd = outbound.recv() => match cmd {
				Some(Outbound::Line(line)) => {
					if let Err(e) = sink.send(Message::Text(line.into())).await {
						break 'session format!("send failed: {e}");
					}
				}
				Some(Outbound::Close) | None => {
					let _ = sink.send(Message::Close(None)).await;
					break 'session "client disconnect".to_string();
				}
			},
			frame = stream.next() => match frame {
				Some(Ok(Message::Text(text))) => {
					let mut replies = Vec::new();
					let mut closing = None;
					for line in text.as_str().lines() {
						let Some(msg) = IrcMessage::parse(line) else {
							continue;
						};
						if let Err(reason) = handle_line(&msg, &shared, &nick, &mut welcome, &mut replies) {
							closing = Some(reason);
							break;
						}
					}
					for reply in replies {
						if let Err(e) = sink.send(Message::Text(reply.into())).await {
							break 'session format!("send failed: {e}");
						}
					}
					if let Some(reason) = closing {
						let _ = sink.send(Message::Close(None)).await;
						break 'session reason;
					}
				}
				Some(Ok(Message::Close(frame))) => {
					break 'session match frame {
						Some(f) => format!("server closed: {} {}", u16::from(f.code), f.reason.as_str()),
						None => "server closed".to_string(),
					};
				}
				Some(Ok(_)) => {}
				Some(Err(e)) => {
					shared.emit(TransportEvent::Error { message: e.to_string() });
					break 'session format!("websocket error: {e}");
				}
				None => break 'session "stream ended".to_string(),
			},
		}
	};

	{
		let mut st = shared.state.lock();
		st.ready = ReadyState::Closed;
		st.channels.clear();
		st.outbound = None;
	}
	shared.membership.notify_waiters();
	if let Some(tx) = welcome.take() {
		let _ = tx.send(Err(TransportError::Connect(reason.clone())));
	}
	info!(reason = %reason, "twitch irc session ended");
	shared.emit(TransportEvent::Disconnected { reason });
}
