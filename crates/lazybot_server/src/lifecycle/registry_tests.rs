#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use lazybot_domain::{Environment, ReadyState};
use lazybot_platform::TransportError;
use proptest::prelude::*;

use super::registry::{ActiveStreamRegistry, ConnectPolicy, ConnectionDecisionEngine, ReassessAction};
use super::testing::{Harness, login};

fn engine(h: &Harness, environment: Environment, lazy_connect: bool) -> Arc<ConnectionDecisionEngine> {
	ConnectionDecisionEngine::new(
		Arc::new(ActiveStreamRegistry::new()),
		ConnectPolicy {
			environment,
			lazy_connect,
		},
		h.supervisor.clone(),
	)
}

#[tokio::test]
async fn lazy_production_with_no_live_channels_stays_disconnected() {
	let h = Harness::new().await;
	let engine = engine(&h, Environment::Production, true);

	assert_eq!(engine.reassess_connection_state().await, ReassessAction::Idle);
	assert_eq!(h.transport.connect_calls(), 0);
}

#[tokio::test]
async fn first_live_channel_connects_exactly_once() {
	let h = Harness::new().await;
	let engine = engine(&h, Environment::Production, true);
	let foo = login("foo");

	assert_eq!(engine.apply_stream_status(&foo, true).await, ReassessAction::Connect);
	assert_eq!(h.transport.connect_calls(), 1);

	// Connected now: the repeat signal only joins what is missing.
	assert_eq!(
		engine.apply_stream_status(&foo, true).await,
		ReassessAction::JoinMissing(vec![foo.clone()])
	);
	assert_eq!(engine.reassess_connection_state().await, ReassessAction::Idle);
	assert_eq!(h.transport.connect_calls(), 1);
	assert_eq!(h.transport.join_calls(), 1);
}

#[tokio::test]
async fn join_failures_do_not_stop_the_other_joins() {
	let h = Harness::new().await;
	let engine = engine(&h, Environment::Production, false);
	h.transport.set_ready_state(ReadyState::Open);
	h.transport.fail_joins(Some(TransportError::Io("broken pipe".to_string())));

	engine.registry().set_live(&login("foo"), true);
	engine.registry().set_live(&login("bar"), true);

	assert_eq!(
		engine.reassess_connection_state().await,
		ReassessAction::JoinMissing(vec![login("bar"), login("foo")])
	);
	assert_eq!(h.transport.join_calls(), 2);
}

#[tokio::test]
async fn lazy_mode_disconnects_when_the_last_channel_goes_offline() {
	let h = Harness::new().await;
	let engine = engine(&h, Environment::Production, true);
	let foo = login("foo");
	engine.apply_stream_status(&foo, true).await;

	assert_eq!(engine.apply_stream_status(&foo, false).await, ReassessAction::Disconnect);
	assert_eq!(h.transport.disconnect_calls(), 1);

	// Already down: removing again changes nothing.
	assert_eq!(engine.apply_stream_status(&foo, false).await, ReassessAction::Idle);
	assert_eq!(h.transport.disconnect_calls(), 1);
}

#[tokio::test]
async fn eager_mode_stays_connected_without_live_channels() {
	let h = Harness::new().await;
	let engine = engine(&h, Environment::Production, false);

	assert_eq!(engine.reassess_connection_state().await, ReassessAction::Connect);
	assert_eq!(engine.apply_stream_status(&login("foo"), false).await, ReassessAction::Idle);
	assert_eq!(h.transport.disconnect_calls(), 0);
}

#[tokio::test]
async fn lazy_development_never_connects() {
	let h = Harness::new().await;
	let engine = engine(&h, Environment::Development, true);

	assert_eq!(engine.apply_stream_status(&login("foo"), true).await, ReassessAction::Idle);
	assert_eq!(h.transport.connect_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_connect_is_retried_with_backoff() {
	let h = Harness::new().await;
	let engine = engine(&h, Environment::Production, true);
	let reset = TransportError::Io("connection reset".to_string());
	h.transport.fail_connects(Some(reset.clone()));

	assert_eq!(
		engine.apply_stream_status(&login("foo"), true).await,
		ReassessAction::ConnectFailed(reset)
	);
	assert!(engine.reconnect_scheduled());

	// Still failing at the 1s retry; the next one comes 2s later.
	tokio::time::sleep(Duration::from_millis(1500)).await;
	assert_eq!(h.transport.connect_calls(), 2);

	h.transport.fail_connects(None);
	tokio::time::sleep(Duration::from_secs(2)).await;
	assert_eq!(h.transport.connect_calls(), 3);
	assert!(!engine.reconnect_scheduled());

	tokio::time::sleep(Duration::from_secs(120)).await;
	assert_eq!(h.transport.connect_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn retry_stops_once_the_connection_is_no_longer_wanted() {
	let h = Harness::new().await;
	let engine = engine(&h, Environment::Production, true);
	let foo = login("foo");
	h.transport.fail_connects(Some(TransportError::Timeout("no 001".to_string())));

	engine.apply_stream_status(&foo, true).await;
	engine.registry().set_live(&foo, false);

	tokio::time::sleep(Duration::from_secs(2)).await;
	assert_eq!(h.transport.connect_calls(), 1);
	assert!(!engine.reconnect_scheduled());
}

#[tokio::test(start_paused = true)]
async fn rejected_login_is_left_to_auth_recovery() {
	let h = Harness::new().await;
	let engine = engine(&h, Environment::Production, false);
	h.transport.fail_connects(Some(TransportError::Auth("Login authentication failed".to_string())));

	assert!(matches!(
		engine.reassess_connection_state().await,
		ReassessAction::ConnectFailed(TransportError::Auth(_))
	));
	assert!(!engine.reconnect_scheduled());

	tokio::time::sleep(Duration::from_secs(120)).await;
	assert_eq!(h.transport.connect_calls(), 1);
}

#[derive(Debug, Clone)]
enum Signal {
	Online(usize),
	Offline(usize),
}

fn signal() -> impl Strategy<Value = Signal> {
	prop_oneof![(0usize..4).prop_map(Signal::Online), (0usize..4).prop_map(Signal::Offline)]
}

proptest! {
	#[test]
	fn registry_holds_the_last_signal_per_channel(signals in proptest::collection::vec(signal(), 0..64)) {
		const NAMES: [&str; 4] = ["foo", "bar", "baz", "qux"];
		let registry = ActiveStreamRegistry::new();
		let mut expected = BTreeMap::new();

		for signal in &signals {
			let (idx, live) = match signal {
				Signal::Online(idx) => (*idx, true),
				Signal::Offline(idx) => (*idx, false),
			};
			let channel = login(NAMES[idx]);
			let was_live = registry.contains(&channel);
			prop_assert_eq!(registry.set_live(&channel, live), was_live != live);
			expected.insert(channel, live);
		}

		let live: Vec<_> = expected.into_iter().filter(|(_, live)| *live).map(|(c, _)| c).collect();
		prop_assert_eq!(registry.snapshot(), live);
	}
}
