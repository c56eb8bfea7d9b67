#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use super::poller::StreamStatusPoller;
use super::registry::ActiveStreamRegistry;
use super::sync::ChannelSettingsCache;
use super::testing::{FakeStatusSource, RecordingSink, login};
use crate::directory::ManagedChannel;

const INTERVAL: Duration = Duration::from_secs(120);

struct Fixture {
	registry: Arc<ActiveStreamRegistry>,
	source: Arc<FakeStatusSource>,
	sink: Arc<RecordingSink>,
	poller: Arc<StreamStatusPoller>,
}

fn fixture(managed: &[&str]) -> Fixture {
	let cache = Arc::new(ChannelSettingsCache::new());
	cache.replace(managed.iter().map(|n| ManagedChannel::new(login(n))).collect());
	let registry = Arc::new(ActiveStreamRegistry::new());
	let source = FakeStatusSource::new();
	let sink = RecordingSink::new();
	let poller = Arc::new(StreamStatusPoller::new(
		source.clone(),
		cache,
		Arc::clone(&registry),
		sink.clone(),
		INTERVAL,
	));
	Fixture {
		registry,
		source,
		sink,
		poller,
	}
}

#[tokio::test]
async fn poll_reports_transitions_only() {
	let f = fixture(&["foo", "bar", "baz"]);
	f.registry.set_live(&login("bar"), true);
	f.registry.set_live(&login("baz"), true);
	f.source.set_live(&["foo", "baz"]);

	f.poller.poll_once().await;
	assert_eq!(f.sink.calls(), vec![(login("bar"), false), (login("foo"), true)]);
	assert_eq!(f.poller.completed_cycles(), 1);
}

#[tokio::test]
async fn failed_cycle_still_counts() {
	let f = fixture(&["foo"]);
	f.source.fail(true);

	f.poller.poll_once().await;
	f.poller.wait_first_cycle().await;
	assert_eq!(f.poller.completed_cycles(), 1);
	assert!(f.sink.calls().is_empty());
}

#[tokio::test]
async fn no_managed_channels_skips_the_lookup() {
	let f = fixture(&[]);

	f.poller.poll_once().await;
	assert_eq!(f.source.snapshot_calls(), 0);
	assert_eq!(f.poller.completed_cycles(), 1);
}

#[tokio::test(start_paused = true)]
async fn periodic_polling_starts_immediately_and_stops() {
	let f = fixture(&["foo"]);

	assert!(f.poller.start());
	assert!(!f.poller.start());
	tokio::time::timeout(Duration::from_secs(1), f.poller.wait_first_cycle())
		.await
		.expect("first cycle");

	tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;
	assert_eq!(f.source.snapshot_calls(), 2);

	assert!(f.poller.stop());
	assert!(!f.poller.stop());
	tokio::time::sleep(INTERVAL * 3).await;
	assert_eq!(f.source.snapshot_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn idle_discovery_runs_only_while_the_poller_is_stopped() {
	let f = fixture(&["foo"]);
	let _idle = f.poller.spawn_idle_discovery();

	tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;
	assert_eq!(f.source.snapshot_calls(), 1);

	// The periodic poller polls at 121s and 241s; idle discovery stands down at 240s.
	f.poller.start();
	tokio::time::sleep(INTERVAL * 2 - Duration::from_secs(10)).await;
	assert_eq!(f.source.snapshot_calls(), 3);
}
