//! Startup/shutdown hooks and graceful in-flight-request draining (§4.13).
//!
//! Grounded on `original_source/src/thor/lifespan.py` for the handler-list and draining
//! semantics; the in-flight counter and quiescent signal are implemented with `tokio::sync::Notify`
//! over an atomic counter, the pattern `examples/argan-rs-argan/src/server.rs` uses for its own
//! graceful-shutdown watcher.

// ----------

use std::{
	future::Future,
	pin::Pin,
	sync::atomic::{AtomicBool, AtomicUsize, Ordering},
	time::Duration,
};

use tokio::sync::Notify;

use crate::BoxedError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type LifecycleHook = Box<dyn Fn() -> BoxFuture<'static, Result<(), BoxedError>> + Send + Sync>;

/// Default bound on how long shutdown waits for in-flight requests to drain (§4.13).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

// --------------------------------------------------
// InFlightGuard

/// RAII guard held for the duration of one dispatched request; decrements the in-flight counter
/// and notifies a waiting shutdown on drop, even if the request task panics (§4.13, §8.5).
pub struct InFlightGuard<'a> {
	lifecycle: &'a Lifecycle,
}

impl Drop for InFlightGuard<'_> {
	fn drop(&mut self) {
		if self.lifecycle.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
			self.lifecycle.quiescent.notify_waiters();
		}
	}
}

// --------------------------------------------------
// Lifecycle

/// The lifecycle manager: startup/shutdown handler lists, the in-flight counter, and the
/// quiescent signal shutdown waits on (§4.13).
pub struct Lifecycle {
	startup_hooks: Vec<LifecycleHook>,
	shutdown_hooks: Vec<LifecycleHook>,
	in_flight: AtomicUsize,
	quiescent: Notify,
	shutting_down: AtomicBool,
	shutdown_timeout: Duration,
}

impl Default for Lifecycle {
	fn default() -> Self {
		Self::new(DEFAULT_SHUTDOWN_TIMEOUT)
	}
}

impl Lifecycle {
	pub fn new(shutdown_timeout: Duration) -> Self {
		Self {
			startup_hooks: Vec::new(),
			shutdown_hooks: Vec::new(),
			in_flight: AtomicUsize::new(0),
			quiescent: Notify::new(),
			shutting_down: AtomicBool::new(false),
			shutdown_timeout,
		}
	}

	pub fn on_startup<F, Fut>(&mut self, hook: F)
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<(), BoxedError>> + Send + 'static,
	{
		self.startup_hooks.push(Box::new(move || Box::pin(hook())));
	}

	pub fn on_shutdown<F, Fut>(&mut self, hook: F)
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<(), BoxedError>> + Send + 'static,
	{
		self.shutdown_hooks.push(Box::new(move || Box::pin(hook())));
	}

	/// Runs startup hooks in registration order (§4.13.1). Stops at the first failure.
	pub async fn run_startup(&self) -> Result<(), BoxedError> {
		for hook in &self.startup_hooks {
			hook().await?;
		}

		Ok(())
	}

	/// Marks the shutdown flag, waits up to `shutdown_timeout` for the in-flight counter to reach
	/// zero, then runs shutdown hooks in reverse registration order regardless of whether the
	/// drain timed out (§4.13.3).
	pub async fn run_shutdown(&self) {
		self.shutting_down.store(true, Ordering::SeqCst);

		// `enable()` registers this future as a waiter immediately, so a guard dropping (and
		// calling `notify_waiters`) between the counter check below and the `await` can never be
		// missed the way a bare `notified()` call created right before awaiting could be.
		let notified = self.quiescent.notified();
		tokio::pin!(notified);
		notified.as_mut().enable();

		if self.in_flight.load(Ordering::Acquire) > 0 {
			let drained = tokio::time::timeout(self.shutdown_timeout, notified).await.is_ok();

			if !drained && self.in_flight.load(Ordering::Acquire) > 0 {
				tracing::warn!(
					in_flight = self.in_flight.load(Ordering::Acquire),
					"shutdown timeout elapsed with requests still in flight"
				);
			}
		}

		for hook in self.shutdown_hooks.iter().rev() {
			if let Err(error) = hook().await {
				tracing::error!(error = %error, "shutdown hook failed");
			}
		}
	}

	pub fn is_shutting_down(&self) -> bool {
		self.shutting_down.load(Ordering::SeqCst)
	}

	pub fn in_flight_count(&self) -> usize {
		self.in_flight.load(Ordering::SeqCst)
	}

	/// Registers one dispatched request; the returned guard decrements on drop (§4.13.2, §8.5).
	pub fn enter(&self) -> InFlightGuard<'_> {
		self.in_flight.fetch_add(1, Ordering::AcqRel);
		InFlightGuard { lifecycle: self }
	}
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;

	#[tokio::test]
	async fn startup_hooks_run_in_order() {
		let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
		let mut lifecycle = Lifecycle::default();

		let order_a = order.clone();
		lifecycle.on_startup(move || {
			let order_a = order_a.clone();
			async move {
				order_a.lock().await.push(1);
				Ok(())
			}
		});

		let order_b = order.clone();
		lifecycle.on_startup(move || {
			let order_b = order_b.clone();
			async move {
				order_b.lock().await.push(2);
				Ok(())
			}
		});

		lifecycle.run_startup().await.unwrap();
		assert_eq!(*order.lock().await, vec![1, 2]);
	}

	#[tokio::test]
	async fn shutdown_hooks_run_in_reverse_order() {
		let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
		let mut lifecycle = Lifecycle::default();

		let order_a = order.clone();
		lifecycle.on_shutdown(move || {
			let order_a = order_a.clone();
			async move {
				order_a.lock().await.push(1);
				Ok(())
			}
		});

		let order_b = order.clone();
		lifecycle.on_shutdown(move || {
			let order_b = order_b.clone();
			async move {
				order_b.lock().await.push(2);
				Ok(())
			}
		});

		lifecycle.run_shutdown().await;
		assert_eq!(*order.lock().await, vec![2, 1]);
	}

	#[tokio::test]
	async fn in_flight_guard_decrements_on_drop() {
		let lifecycle = Lifecycle::default();
		assert_eq!(lifecycle.in_flight_count(), 0);

		{
			let _guard = lifecycle.enter();
			assert_eq!(lifecycle.in_flight_count(), 1);
		}

		assert_eq!(lifecycle.in_flight_count(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn shutdown_waits_for_drain_within_timeout() {
		let lifecycle = Arc::new(Lifecycle::new(Duration::from_secs(5)));
		let guard_lifecycle = lifecycle.clone();

		let handle = tokio::spawn(async move {
			let _guard = guard_lifecycle.enter();
			tokio::time::sleep(Duration::from_millis(200)).await;
		});

		lifecycle.run_shutdown().await;
		handle.await.unwrap();
		assert_eq!(lifecycle.in_flight_count(), 0);
	}
}
