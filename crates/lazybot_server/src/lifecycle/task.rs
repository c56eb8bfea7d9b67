#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Owned handle to a spawned timer task. Dropping it cancels the task.
#[derive(Debug)]
pub struct ScheduledTask {
	handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
	/// Run `fut` now, owned by the returned handle.
	pub fn spawn<F>(fut: F) -> Self
	where
		F: Future<Output = ()> + Send + 'static,
	{
		Self {
			handle: Some(tokio::spawn(fut)),
		}
	}

	/// Run `fut` once after `delay`.
	pub fn after<F>(delay: Duration, fut: F) -> Self
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let handle = tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			fut.await;
		});
		Self { handle: Some(handle) }
	}

	/// Run `tick()` every `period`; the first run is immediate when `immediate` is set.
	///
	/// Runs never overlap: a slow tick delays the next one.
	pub fn every<F, Fut>(period: Duration, immediate: bool, mut tick: F) -> Self
	where
		F: FnMut() -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let handle = tokio::spawn(async move {
			let start = if immediate { Instant::now() } else { Instant::now() + period };
			let mut ticker = tokio::time::interval_at(start, period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				tick().await;
			}
		});
		Self { handle: Some(handle) }
	}

	pub fn cancel(mut self) {
		if let Some(handle) = self.handle.take() {
			handle.abort();
		}
	}

	pub fn is_finished(&self) -> bool {
		self.handle.as_ref().is_none_or(JoinHandle::is_finished)
	}
}

impl Drop for ScheduledTask {
	fn drop(&mut self) {
		if let Some(handle) = self.handle.take() {
			handle.abort();
		}
	}
}
