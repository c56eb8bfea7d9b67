#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use lazybot_platform::SecretString;
use tokio::time::Instant;

use super::credentials::{CredentialError, CredentialRefresher, CredentialSettings};
use super::testing::{FakeTokenEndpoint, MemorySecretStore, SECRET_NAME, init_test_logging, refresher, token_response};

fn settings() -> CredentialSettings {
	CredentialSettings::new("client-id", SecretString::new("client-secret"), SECRET_NAME)
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_token_request() {
	init_test_logging();
	let endpoint = FakeTokenEndpoint::with_delay(Duration::from_millis(200));
	let store = MemorySecretStore::with_secret(SECRET_NAME, "rt-1");
	let creds = refresher(Arc::clone(&endpoint), store);

	let (a, b, c, d) = tokio::join!(
		creds.get_valid_credential(),
		creds.get_valid_credential(),
		creds.force_refresh(),
		creds.get_valid_credential(),
	);

	for token in [a, b, c, d] {
		assert_eq!(token.expect("token").expose(), "at-1");
	}
	assert_eq!(endpoint.calls(), 1);
	assert!(!creds.refresh_in_flight());

	// Served from cache.
	assert_eq!(creds.get_valid_credential().await.unwrap().expose(), "at-1");
	assert_eq!(endpoint.calls(), 1);
}

#[tokio::test]
async fn force_refresh_replaces_cached_token() {
	let endpoint = FakeTokenEndpoint::new();
	let creds = refresher(Arc::clone(&endpoint), MemorySecretStore::with_secret(SECRET_NAME, "rt-1"));

	assert_eq!(creds.get_valid_credential().await.unwrap().expose(), "at-1");
	assert_eq!(creds.force_refresh().await.unwrap().expose(), "at-2");
	assert_eq!(creds.get_valid_credential().await.unwrap().expose(), "at-2");
	assert_eq!(endpoint.calls(), 2);
}

#[tokio::test]
async fn rejected_refresh_token_latches_without_further_requests() {
	let endpoint = FakeTokenEndpoint::new();
	endpoint.push_rejected(400);
	let store = MemorySecretStore::with_secret(SECRET_NAME, "rt-1");
	let creds = refresher(Arc::clone(&endpoint), Arc::clone(&store));

	let first = creds.get_valid_credential().await.unwrap_err();
	assert!(first.is_auth_invalid(), "{first:?}");
	assert!(!creds.has_cached_credential());
	assert_eq!(endpoint.calls(), 1);

	let second = creds.get_valid_credential().await.unwrap_err();
	assert!(second.is_auth_invalid(), "{second:?}");
	let third = creds.force_refresh().await.unwrap_err();
	assert!(third.is_auth_invalid(), "{third:?}");
	assert_eq!(endpoint.calls(), 1, "latched token must not be retried");
}

#[tokio::test]
async fn new_stored_secret_releases_the_latch() {
	let endpoint = FakeTokenEndpoint::new();
	endpoint.push_rejected(401);
	let store = MemorySecretStore::with_secret(SECRET_NAME, "rt-1");
	let creds = refresher(Arc::clone(&endpoint), Arc::clone(&store));

	assert!(creds.get_valid_credential().await.unwrap_err().is_auth_invalid());

	store.put(SECRET_NAME, "rt-2");
	assert_eq!(creds.get_valid_credential().await.unwrap().expose(), "at-2");
	assert_eq!(endpoint.seen_refresh_tokens(), vec!["rt-1".to_string(), "rt-2".to_string()]);
}

#[tokio::test]
async fn rejected_token_with_empty_store_stays_auth_invalid() {
	let endpoint = FakeTokenEndpoint::new();
	endpoint.push_rejected(400);
	let store = MemorySecretStore::with_secret(SECRET_NAME, "rt-1");
	let creds = refresher(Arc::clone(&endpoint), Arc::clone(&store));

	assert!(creds.get_valid_credential().await.unwrap_err().is_auth_invalid());
	store.put(SECRET_NAME, "  ");
	assert!(creds.get_valid_credential().await.unwrap_err().is_auth_invalid());
	assert_eq!(endpoint.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_then_succeed() {
	let endpoint = FakeTokenEndpoint::new();
	endpoint.push_network_error();
	endpoint.push_rejected(503);
	let creds = CredentialRefresher::new(
		settings(),
		endpoint.clone(),
		MemorySecretStore::with_secret(SECRET_NAME, "rt-1"),
	);

	let started = Instant::now();
	let token = creds.get_valid_credential().await.expect("third attempt succeeds");
	let elapsed = started.elapsed();

	assert_eq!(token.expose(), "at-3");
	assert_eq!(endpoint.calls(), 3);
	// 2s then 5s of backoff.
	assert!(elapsed >= Duration::from_secs(7), "{elapsed:?}");
	assert!(elapsed < Duration::from_secs(8), "{elapsed:?}");
}

#[tokio::test]
async fn exhausted_retries_surface_transient() {
	let endpoint = FakeTokenEndpoint::new();
	for _ in 0..4 {
		endpoint.push_network_error();
	}
	let creds = refresher(Arc::clone(&endpoint), MemorySecretStore::with_secret(SECRET_NAME, "rt-1"));

	let err = creds.get_valid_credential().await.unwrap_err();
	assert!(matches!(err, CredentialError::Transient(_)), "{err:?}");
	assert_eq!(endpoint.calls(), 4);
	assert!(!creds.has_cached_credential());
}

#[tokio::test]
async fn unexpected_status_is_not_retried() {
	let endpoint = FakeTokenEndpoint::new();
	endpoint.push_rejected(403);
	let creds = refresher(Arc::clone(&endpoint), MemorySecretStore::with_secret(SECRET_NAME, "rt-1"));

	let err = creds.get_valid_credential().await.unwrap_err();
	assert!(matches!(err, CredentialError::Unexpected(_)), "{err:?}");
	assert_eq!(endpoint.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn whole_refresh_is_bounded_by_operation_timeout() {
	let endpoint = FakeTokenEndpoint::with_delay(Duration::from_secs(120));
	let mut settings = settings();
	settings.operation_timeout = Duration::from_secs(60);
	let creds = CredentialRefresher::new(
		settings,
		endpoint.clone(),
		MemorySecretStore::with_secret(SECRET_NAME, "rt-1"),
	);

	let started = Instant::now();
	let err = creds.get_valid_credential().await.unwrap_err();
	assert_eq!(err, CredentialError::Timeout);
	let elapsed = started.elapsed();
	assert!(elapsed >= Duration::from_secs(60) && elapsed < Duration::from_secs(61), "{elapsed:?}");
	assert!(!creds.refresh_in_flight());
}

#[tokio::test]
async fn rotated_refresh_token_is_persisted_and_used_next() {
	let endpoint = FakeTokenEndpoint::new();
	endpoint.push(Ok(token_response("at-a", Some("rt-2"))));
	let store = MemorySecretStore::with_secret(SECRET_NAME, "rt-1");
	let creds = refresher(Arc::clone(&endpoint), Arc::clone(&store));

	assert_eq!(creds.get_valid_credential().await.unwrap().expose(), "at-a");
	assert_eq!(store.value(SECRET_NAME).as_deref(), Some("rt-2"));
	assert_eq!(store.writes(), 1);

	creds.force_refresh().await.unwrap();
	assert_eq!(endpoint.seen_refresh_tokens(), vec!["rt-1".to_string(), "rt-2".to_string()]);
	// The in-memory copy is used; the store is not read again.
	assert_eq!(store.reads(), 1);
}

#[tokio::test]
async fn echoed_refresh_token_is_not_rewritten() {
	let endpoint = FakeTokenEndpoint::new();
	endpoint.push(Ok(token_response("at-a", Some("rt-1"))));
	let store = MemorySecretStore::with_secret(SECRET_NAME, "rt-1");
	let creds = refresher(Arc::clone(&endpoint), Arc::clone(&store));

	creds.get_valid_credential().await.unwrap();
	assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn failing_to_persist_rotation_keeps_the_token() {
	let endpoint = FakeTokenEndpoint::new();
	endpoint.push(Ok(token_response("at-a", Some("rt-2"))));
	let store = MemorySecretStore::with_secret(SECRET_NAME, "rt-1");
	store.fail_writes(true);
	let creds = refresher(Arc::clone(&endpoint), Arc::clone(&store));

	assert_eq!(creds.get_valid_credential().await.unwrap().expose(), "at-a");
	assert_eq!(store.writes(), 1);
	assert_eq!(store.value(SECRET_NAME).as_deref(), Some("rt-1"));

	creds.force_refresh().await.unwrap();
	assert_eq!(endpoint.seen_refresh_tokens().last().map(String::as_str), Some("rt-2"));
}

#[tokio::test]
async fn missing_secret_is_reported_without_a_request() {
	let endpoint = FakeTokenEndpoint::new();
	let creds = refresher(Arc::clone(&endpoint), MemorySecretStore::new());

	let err = creds.get_valid_credential().await.unwrap_err();
	assert_eq!(err, CredentialError::MissingSecret(SECRET_NAME.to_string()));
	assert_eq!(endpoint.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn unreadable_store_is_retried_then_transient() {
	let endpoint = FakeTokenEndpoint::new();
	let store = MemorySecretStore::with_secret(SECRET_NAME, "rt-1");
	store.fail_reads(true);
	let creds = refresher(Arc::clone(&endpoint), Arc::clone(&store));

	let err = creds.get_valid_credential().await.unwrap_err();
	assert!(matches!(err, CredentialError::Transient(_)), "{err:?}");
	assert_eq!(store.reads(), 3);
	assert_eq!(endpoint.calls(), 0);
}

#[tokio::test]
async fn configured_override_skips_the_store() {
	let endpoint = FakeTokenEndpoint::new();
	let store = MemorySecretStore::with_secret(SECRET_NAME, "rt-1");
	let mut settings = settings();
	settings.refresh_token_override = Some(SecretString::new("rt-local"));
	let creds = CredentialRefresher::new(settings, endpoint.clone(), store.clone());

	creds.get_valid_credential().await.unwrap();
	assert_eq!(endpoint.seen_refresh_tokens(), vec!["rt-local".to_string()]);
	assert_eq!(store.reads(), 0);
}

#[tokio::test(start_paused = true)]
async fn token_is_replaced_before_it_expires() {
	let endpoint = FakeTokenEndpoint::new();
	let creds = refresher(Arc::clone(&endpoint), MemorySecretStore::with_secret(SECRET_NAME, "rt-1"));

	// 4h lifetime, served until 5 minutes before the end.
	assert_eq!(creds.get_valid_credential().await.unwrap().expose(), "at-1");
	tokio::time::sleep(Duration::from_secs(14_400 - 300 - 1)).await;
	assert_eq!(creds.get_valid_credential().await.unwrap().expose(), "at-1");
	assert_eq!(endpoint.calls(), 1);

	tokio::time::sleep(Duration::from_secs(2)).await;
	assert!(!creds.has_cached_credential());
	assert_eq!(creds.get_valid_credential().await.unwrap().expose(), "at-2");
	assert_eq!(endpoint.calls(), 2);

	tokio::time::sleep(Duration::from_secs(5 * 3600)).await;
	assert_eq!(creds.get_valid_credential().await.unwrap().expose(), "at-3");
}

#[tokio::test(start_paused = true)]
async fn short_lived_token_is_kept_for_half_its_lifetime() {
	let endpoint = FakeTokenEndpoint::new();
	let mut short = token_response("at-short", None);
	short.expires_in = Some(60);
	endpoint.push(Ok(short));
	let creds = refresher(Arc::clone(&endpoint), MemorySecretStore::with_secret(SECRET_NAME, "rt-1"));

	assert_eq!(creds.get_valid_credential().await.unwrap().expose(), "at-short");
	tokio::time::sleep(Duration::from_secs(29)).await;
	assert_eq!(creds.get_valid_credential().await.unwrap().expose(), "at-short");

	tokio::time::sleep(Duration::from_secs(2)).await;
	assert_eq!(creds.get_valid_credential().await.unwrap().expose(), "at-2");
}

#[tokio::test(start_paused = true)]
async fn token_without_lifetime_stays_cached() {
	let endpoint = FakeTokenEndpoint::new();
	let mut forever = token_response("at-forever", None);
	forever.expires_in = None;
	endpoint.push(Ok(forever));
	let creds = refresher(Arc::clone(&endpoint), MemorySecretStore::with_secret(SECRET_NAME, "rt-1"));

	creds.get_valid_credential().await.unwrap();
	tokio::time::sleep(Duration::from_secs(48 * 3600)).await;
	assert_eq!(creds.get_valid_credential().await.unwrap().expose(), "at-forever");
	assert_eq!(endpoint.calls(), 1);
}

#[tokio::test]
async fn invalidate_drops_only_the_rejected_token() {
	let endpoint = FakeTokenEndpoint::new();
	let creds = refresher(Arc::clone(&endpoint), MemorySecretStore::with_secret(SECRET_NAME, "rt-1"));
	let token = creds.get_valid_credential().await.unwrap();

	// Someone rejecting an older token does not throw away the current one.
	creds.invalidate(&SecretString::new("at-0"));
	assert!(creds.has_cached_credential());

	creds.invalidate(&token);
	assert!(!creds.has_cached_credential());
	assert_eq!(creds.get_valid_credential().await.unwrap().expose(), "at-2");
	assert_eq!(endpoint.calls(), 2);
}

#[test]
fn credential_failures_map_to_transport_errors() {
	use lazybot_platform::TransportError;

	let rejected = TransportError::from(CredentialError::AuthInvalid("400".to_string()));
	assert!(matches!(rejected, TransportError::Auth(_)));

	let outage = TransportError::from(CredentialError::Transient("secret store unavailable".to_string()));
	assert!(matches!(outage, TransportError::Connect(_)));
	assert!(matches!(
		TransportError::from(CredentialError::Timeout),
		TransportError::Connect(_)
	));
}
