#![forbid(unsafe_code)]

//! Run an async operation at most once at a time; concurrent callers share its result.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

/// The operation's task panicked or was cancelled before producing a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("single-flight operation aborted")]
pub struct FlightAborted;

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T, FlightAborted>>>;

struct Flight<T: Clone> {
	id: u64,
	outcome: SharedOutcome<T>,
}

type Slot<T> = Arc<Mutex<Option<Flight<T>>>>;

/// In-flight operation handle.
///
/// The operation runs on its own task, so it completes even when every
/// caller stops waiting. The slot is cleared as soon as it finishes, and the
/// next `run` starts a fresh operation.
pub struct SingleFlight<T: Clone + Send + Sync + 'static> {
	slot: Slot<T>,
	next_id: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> Default for SingleFlight<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
	pub fn new() -> Self {
		Self {
			slot: Arc::new(Mutex::new(None)),
			next_id: AtomicU64::new(1),
		}
	}

	pub fn in_flight(&self) -> bool {
		self.slot.lock().is_some()
	}

	/// Join the running operation, or start `make()` if none is running.
	pub async fn run<F, Fut>(&self, make: F) -> Result<T, FlightAborted>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = T> + Send + 'static,
	{
		let outcome = {
			let mut slot = self.slot.lock();
			match slot.as_ref() {
				Some(flight) => flight.outcome.clone(),
				None => {
					let id = self.next_id.fetch_add(1, Ordering::Relaxed);
					let op = make();

					let task_slot = Arc::clone(&self.slot);
					let handle = tokio::spawn(async move {
						let out = op.await;
						clear_slot(&task_slot, id);
						out
					});

					let waiter_slot = Arc::clone(&self.slot);
					let outcome = async move {
						let res = handle.await.map_err(|_| FlightAborted);
						// Only reached without the task clearing it when the task panicked.
						clear_slot(&waiter_slot, id);
						res
					}
					.boxed()
					.shared();

					*slot = Some(Flight {
						id,
						outcome: outcome.clone(),
					});
					outcome
				}
			}
		};

		outcome.await
	}
}

fn clear_slot<T: Clone>(slot: &Mutex<Option<Flight<T>>>, id: u64) {
	let mut slot = slot.lock();
	if slot.as_ref().is_some_and(|flight| flight.id == id) {
		*slot = None;
	}
}
