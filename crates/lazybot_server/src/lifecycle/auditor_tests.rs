#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use super::auditor::{AUDIT_INTERVAL, AuditOutcome, LivenessAuditor, MAX_CONSECUTIVE_MISSES};
use super::registry::ActiveStreamRegistry;
use super::testing::{FakeStatusSource, RecordingSink, login};

struct Fixture {
	registry: Arc<ActiveStreamRegistry>,
	source: Arc<FakeStatusSource>,
	sink: Arc<RecordingSink>,
	auditor: Arc<LivenessAuditor>,
}

fn fixture(live_in_registry: &[&str]) -> Fixture {
	let registry = Arc::new(ActiveStreamRegistry::new());
	for name in live_in_registry {
		registry.set_live(&login(name), true);
	}
	let source = FakeStatusSource::new();
	let sink = RecordingSink::new();
	let auditor = Arc::new(LivenessAuditor::new(
		Arc::clone(&registry),
		source.clone(),
		sink.clone(),
		AUDIT_INTERVAL,
	));
	Fixture {
		registry,
		source,
		sink,
		auditor,
	}
}

#[tokio::test(start_paused = true)]
async fn start_and_stop_are_idempotent() {
	let f = fixture(&["foo"]);
	f.source.set_live(&["foo"]);

	assert!(f.auditor.start());
	assert!(!f.auditor.start());
	assert!(f.auditor.is_running());
	assert!(f.auditor.stop());
	assert!(!f.auditor.stop());
	assert!(!f.auditor.is_running());
}

#[tokio::test(start_paused = true)]
async fn stops_itself_after_consecutive_misses() {
	let f = fixture(&["foo"]);
	f.auditor.start();

	// Checks at 0s, 60s and 120s all come back empty.
	tokio::time::sleep(Duration::from_secs(121)).await;
	assert_eq!(f.source.live_calls(), 3);
	assert_eq!(f.auditor.consecutive_misses(), MAX_CONSECUTIVE_MISSES);
	assert!(!f.auditor.is_running());

	tokio::time::sleep(Duration::from_secs(300)).await;
	assert_eq!(f.source.live_calls(), 3);
}

#[tokio::test]
async fn phantom_channels_are_removed_and_live_ones_kept() {
	let f = fixture(&["foo", "bar"]);
	f.source.set_live(&["foo"]);

	let outcome = f.auditor.check_once().await;
	assert_eq!(
		outcome,
		AuditOutcome::Confirmed {
			live: 1,
			phantoms: vec![login("bar")],
		}
	);
	assert_eq!(f.sink.calls(), vec![(login("bar"), false)]);
	assert_eq!(f.auditor.consecutive_misses(), 0);
}

#[tokio::test]
async fn empty_registry_counts_as_a_miss_without_a_lookup() {
	let f = fixture(&[]);

	assert_eq!(
		f.auditor.check_once().await,
		AuditOutcome::Miss {
			phantoms: Vec::new(),
			misses: 1,
		}
	);
	assert_eq!(f.source.live_calls(), 0);
}

#[tokio::test]
async fn lookup_failure_leaves_registry_and_counter_alone() {
	let f = fixture(&["foo"]);
	f.source.fail(true);

	assert_eq!(f.auditor.check_once().await, AuditOutcome::Skipped);
	assert!(f.registry.contains(&login("foo")));
	assert!(f.sink.calls().is_empty());
	assert_eq!(f.auditor.consecutive_misses(), 0);
}

#[tokio::test]
async fn a_confirmed_check_resets_the_miss_counter() {
	let f = fixture(&["foo"]);

	f.auditor.check_once().await;
	f.auditor.check_once().await;
	assert_eq!(f.auditor.consecutive_misses(), 2);

	f.source.set_live(&["foo"]);
	f.auditor.check_once().await;
	assert_eq!(f.auditor.consecutive_misses(), 0);
}

#[tokio::test(start_paused = true)]
async fn restarting_clears_old_misses() {
	let f = fixture(&["foo"]);
	f.auditor.check_once().await;
	f.auditor.check_once().await;

	f.source.set_live(&["foo"]);
	f.auditor.start();
	tokio::time::sleep(Duration::from_secs(1)).await;
	assert_eq!(f.auditor.consecutive_misses(), 0);
	assert!(f.auditor.is_running());
}
