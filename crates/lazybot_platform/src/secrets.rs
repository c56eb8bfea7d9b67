#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::sync::Mutex;
use tracing::debug;

/// Durable key/value store for long-lived secrets.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync + 'static {
	/// `Ok(None)` when the secret does not exist.
	async fn get_secret_value(&self, name: &str) -> anyhow::Result<Option<String>>;

	/// Returns whether the value was stored.
	async fn set_secret_value(&self, name: &str, value: &str) -> anyhow::Result<bool>;
}

/// Secrets kept in a TOML table on disk (`name = "value"`).
pub struct FileSecretStore {
	path: PathBuf,
	// Serializes read-modify-write cycles.
	write_lock: Mutex<()>,
}

impl FileSecretStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			write_lock: Mutex::new(()),
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	async fn load(&self) -> anyhow::Result<BTreeMap<String, String>> {
		let data = match tokio::fs::read_to_string(&self.path).await {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
			Err(e) => return Err(e).with_context(|| format!("read secrets file {}", self.path.display())),
		};
		toml::from_str(&data).with_context(|| format!("parse secrets file {}", self.path.display()))
	}

	async fn store(&self, secrets: &BTreeMap<String, String>) -> anyhow::Result<()> {
		if let Some(parent) = self.path.parent()
			&& !parent.as_os_str().is_empty()
		{
			tokio::fs::create_dir_all(parent)
				.await
				.with_context(|| format!("create secrets dir {}", parent.display()))?;
		}

		let data = toml::to_string_pretty(secrets).context("serialize secrets")?;
		let mut tmp = self.path.clone().into_os_string();
		tmp.push(".tmp");
		let tmp = PathBuf::from(tmp);

		tokio::fs::write(&tmp, data)
			.await
			.with_context(|| format!("write {}", tmp.display()))?;
		tokio::fs::rename(&tmp, &self.path)
			.await
			.with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
		Ok(())
	}
}

#[async_trait::async_trait]
impl SecretStore for FileSecretStore {
	async fn get_secret_value(&self, name: &str) -> anyhow::Result<Option<String>> {
		let secrets = self.load().await?;
		Ok(secrets.get(name).filter(|v| !v.trim().is_empty()).cloned())
	}

	async fn set_secret_value(&self, name: &str, value: &str) -> anyhow::Result<bool> {
		let _guard = self.write_lock.lock().await;
		let mut secrets = self.load().await?;
		if secrets.get(name).map(String::as_str) == Some(value) {
			return Ok(true);
		}
		secrets.insert(name.to_string(), value.to_string());
		self.store(&secrets).await?;
		debug!(name, path = %self.path.display(), "secret stored");
		Ok(true)
	}
}
