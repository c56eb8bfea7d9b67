#![forbid(unsafe_code)]

//! Where the set of managed channels comes from.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, anyhow};
use lazybot_domain::ChannelLogin;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

const WATCH_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedChannel {
	pub login: ChannelLogin,
	pub ad_notifications: bool,
}

impl ManagedChannel {
	pub fn new(login: ChannelLogin) -> Self {
		Self {
			login,
			ad_notifications: true,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryChange {
	Added(ManagedChannel),
	Updated(ManagedChannel),
	Removed(ChannelLogin),
}

#[async_trait::async_trait]
pub trait ChannelDirectory: Send + Sync + 'static {
	async fn managed_channels(&self) -> anyhow::Result<Vec<ManagedChannel>>;

	/// Changes from now on. Dropping the receiver stops the watch.
	fn watch(&self) -> mpsc::Receiver<DirectoryChange>;
}

/// Changes turning `before` into `after`.
pub fn diff_channels(before: &[ManagedChannel], after: &[ManagedChannel]) -> Vec<DirectoryChange> {
	let before: BTreeMap<&ChannelLogin, &ManagedChannel> = before.iter().map(|c| (&c.login, c)).collect();
	let after: BTreeMap<&ChannelLogin, &ManagedChannel> = after.iter().map(|c| (&c.login, c)).collect();

	let mut changes = Vec::new();
	for (login, channel) in &after {
		match before.get(login) {
			None => changes.push(DirectoryChange::Added((*channel).clone())),
			Some(old) if old != channel => changes.push(DirectoryChange::Updated((*channel).clone())),
			Some(_) => {}
		}
	}
	for login in before.keys() {
		if !after.contains_key(login) {
			changes.push(DirectoryChange::Removed((*login).clone()));
		}
	}
	changes
}

/// Fixed channel list from the config file.
pub struct StaticChannelDirectory {
	channels: Mutex<Vec<ManagedChannel>>,
	watchers: Mutex<Vec<mpsc::Sender<DirectoryChange>>>,
}

impl StaticChannelDirectory {
	pub fn new(channels: Vec<ManagedChannel>) -> Self {
		Self {
			channels: Mutex::new(channels),
			watchers: Mutex::new(Vec::new()),
		}
	}

	/// Replace the list and notify watchers.
	pub fn set_channels(&self, channels: Vec<ManagedChannel>) {
		let changes = {
			let mut current = self.channels.lock();
			let changes = diff_channels(&current, &channels);
			*current = channels;
			changes
		};

		let mut watchers = self.watchers.lock();
		watchers.retain(|tx| !tx.is_closed());
		for change in changes {
			for tx in watchers.iter() {
				if let Err(e) = tx.try_send(change.clone()) {
					warn!(error = %e, "channel directory watcher lagging; change dropped");
				}
			}
		}
	}
}

#[async_trait::async_trait]
impl ChannelDirectory for StaticChannelDirectory {
	async fn managed_channels(&self) -> anyhow::Result<Vec<ManagedChannel>> {
		Ok(self.channels.lock().clone())
	}

	fn watch(&self) -> mpsc::Receiver<DirectoryChange> {
		let (tx, rx) = mpsc::channel(WATCH_BUFFER);
		let mut watchers = self.watchers.lock();
		watchers.retain(|tx| !tx.is_closed());
		watchers.push(tx);
		rx
	}
}

/// `managed_channels` table in sqlite, postgres or mysql.
pub struct SqlChannelDirectory {
	backend: DirectoryBackend,
	watch_interval: Duration,
}

#[derive(Clone)]
enum DirectoryBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl SqlChannelDirectory {
	pub async fn connect(database_url: &str, watch_interval: Duration) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			DirectoryBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			DirectoryBackend::Postgres(pool)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;
			DirectoryBackend::Mysql(pool)
		} else {
			return Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"));
		};

		Ok(Self {
			backend,
			watch_interval,
		})
	}

	pub async fn upsert(&self, channel: &ManagedChannel) -> anyhow::Result<()> {
		let login = channel.login.as_str();
		match &self.backend {
			DirectoryBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO managed_channels (login, ad_notifications) VALUES (?, ?) \
					ON CONFLICT(login) DO UPDATE SET ad_notifications = excluded.ad_notifications",
				)
				.bind(login)
				.bind(channel.ad_notifications)
				.execute(pool)
				.await
				.context("upsert managed_channels (sqlite)")?;
			}
			DirectoryBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO managed_channels (login, ad_notifications) VALUES ($1, $2) \
					ON CONFLICT (login) DO UPDATE SET ad_notifications = EXCLUDED.ad_notifications",
				)
				.bind(login)
				.bind(channel.ad_notifications)
				.execute(pool)
				.await
				.context("upsert managed_channels (postgres)")?;
			}
			DirectoryBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO managed_channels (login, ad_notifications) VALUES (?, ?) \
					ON DUPLICATE KEY UPDATE ad_notifications = VALUES(ad_notifications)",
				)
				.bind(login)
				.bind(channel.ad_notifications)
				.execute(pool)
				.await
				.context("upsert managed_channels (mysql)")?;
			}
		}
		Ok(())
	}

	/// Returns whether a row was deleted.
	pub async fn remove(&self, login: &ChannelLogin) -> anyhow::Result<bool> {
		let affected = match &self.backend {
			DirectoryBackend::Sqlite(pool) => sqlx::query("DELETE FROM managed_channels WHERE login = ?")
				.bind(login.as_str())
				.execute(pool)
				.await
				.context("delete managed_channels (sqlite)")?
				.rows_affected(),
			DirectoryBackend::Postgres(pool) => sqlx::query("DELETE FROM managed_channels WHERE login = $1")
				.bind(login.as_str())
				.execute(pool)
				.await
				.context("delete managed_channels (postgres)")?
				.rows_affected(),
			DirectoryBackend::Mysql(pool) => sqlx::query("DELETE FROM managed_channels WHERE login = ?")
				.bind(login.as_str())
				.execute(pool)
				.await
				.context("delete managed_channels (mysql)")?
				.rows_affected(),
		};
		Ok(affected > 0)
	}
}

impl DirectoryBackend {
	async fn load(&self) -> anyhow::Result<Vec<ManagedChannel>> {
		const SELECT: &str = "SELECT login, ad_notifications FROM managed_channels ORDER BY login";

		let rows: Vec<(String, bool)> = match self {
			Self::Sqlite(pool) => sqlx::query_as(SELECT)
				.fetch_all(pool)
				.await
				.context("load managed_channels (sqlite)")?,
			Self::Postgres(pool) => sqlx::query_as(SELECT)
				.fetch_all(pool)
				.await
				.context("load managed_channels (postgres)")?,
			Self::Mysql(pool) => sqlx::query_as(SELECT)
				.fetch_all(pool)
				.await
				.context("load managed_channels (mysql)")?,
		};

		let mut out = Vec::with_capacity(rows.len());
		for (login, ad_notifications) in rows {
			match ChannelLogin::new(&login) {
				Ok(login) => out.push(ManagedChannel {
					login,
					ad_notifications,
				}),
				Err(e) => warn!(login = %login, error = %e, "skipping invalid managed channel row"),
			}
		}
		Ok(out)
	}
}

#[async_trait::async_trait]
impl ChannelDirectory for SqlChannelDirectory {
	async fn managed_channels(&self) -> anyhow::Result<Vec<ManagedChannel>> {
		self.backend.load().await
	}

	fn watch(&self) -> mpsc::Receiver<DirectoryChange> {
		let (tx, rx) = mpsc::channel(WATCH_BUFFER);
		let backend = self.backend.clone();
		let period = self.watch_interval;

		tokio::spawn(async move {
			let mut known = match backend.load().await {
				Ok(channels) => Some(channels),
				Err(e) => {
					warn!(error = %e, "channel directory watch: initial load failed");
					None
				}
			};

			let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

			loop {
				tokio::select! {
					_ = tx.closed() => break,
					_ = ticker.tick() => {}
				}

				let current = match backend.load().await {
					Ok(current) => current,
					Err(e) => {
						warn!(error = %e, "channel directory watch: load failed");
						continue;
					}
				};

				let Some(before) = known.replace(current.clone()) else {
					continue;
				};
				for change in diff_channels(&before, &current) {
					if tx.send(change).await.is_err() {
						return;
					}
				}
			}
			debug!("channel directory watch stopped");
		});

		rx
	}
}
