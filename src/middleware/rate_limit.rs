//! Per-client sliding-window rate limiting (§4.11).
//!
//! Grounded on `original_source/src/thor/middleware/ratelimit.py` for the window/prune/retry-after
//! arithmetic; the per-client map uses `dashmap` for lock-free concurrent access, the way the
//! corpus reaches for it wherever a shared map is hit from many tasks at once.

// ----------

use std::{
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::{Duration, SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;

use crate::{
	error::ThorError,
	handler::{BoxHandler, Middleware},
	request::RequestContext,
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

fn now_secs() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
}

struct ClientRecord {
	timestamps: Vec<u64>,
}

/// Configuration for [`RateLimitMiddleware`]: a maximum request count per sliding window, keyed
/// per client IP (§4.11).
pub struct RateLimitMiddleware {
	max_requests: usize,
	window: Duration,
	records: DashMap<String, ClientRecord>,
	sweep_every: u64,
	requests_since_sweep: AtomicU64,
}

impl RateLimitMiddleware {
	pub fn new(max_requests: usize, window: Duration) -> Self {
		Self {
			max_requests,
			window,
			records: DashMap::new(),
			sweep_every: 1000,
			requests_since_sweep: AtomicU64::new(0),
		}
	}

	/// Bounds unbounded memory growth from clients that stop sending requests (§9's rate-limiter
	/// memory-growth note): every `sweep_every` requests, drop any client record whose newest
	/// timestamp has already aged out of the window.
	fn maybe_sweep(&self) {
		let count = self.requests_since_sweep.fetch_add(1, Ordering::Relaxed);
		if count % self.sweep_every != 0 {
			return;
		}

		let cutoff = now_secs().saturating_sub(self.window.as_secs());
		self.records.retain(|_, record| {
			record.timestamps.last().is_some_and(|&latest| latest >= cutoff)
		});
	}

	pub fn build(self) -> Middleware {
		let state = Arc::new(self);

		crate::handler::middleware_fn(move |next: BoxHandler| {
			let state = state.clone();

			crate::handler::handler_fn(move |ctx: Arc<RequestContext>| {
				let state = state.clone();
				let next = next.clone();

				async move {
					let client_key = ctx
						.request
						.client_addr()
						.map(|addr| addr.ip().to_string())
						.unwrap_or_else(|| "unknown".to_owned());

					state.maybe_sweep();

					let now = now_secs();
					let window_secs = state.window.as_secs();
					let cutoff = now.saturating_sub(window_secs);

					let mut entry = state.records.entry(client_key).or_insert_with(|| ClientRecord {
						timestamps: Vec::new(),
					});
					entry.timestamps.retain(|&ts| ts >= cutoff);

					if entry.timestamps.len() >= state.max_requests {
						let oldest = *entry.timestamps.first().expect("len checked above");
						let retry_after = window_secs.saturating_sub(now.saturating_sub(oldest)) + 1;

						return Err(ThorError::TooManyRequests { retry_after });
					}

					entry.timestamps.push(now);
					let remaining = state.max_requests - entry.timestamps.len();
					drop(entry);

					let mut response = next.call(ctx).await?;

					response.insert_header(
						http::HeaderName::from_static("x-ratelimit-limit"),
						http::HeaderValue::from_str(&state.max_requests.to_string())
							.expect("numeric header value"),
					);
					response.insert_header(
						http::HeaderName::from_static("x-ratelimit-remaining"),
						http::HeaderValue::from_str(&remaining.to_string()).expect("numeric header value"),
					);
					response.insert_header(
						http::HeaderName::from_static("x-ratelimit-reset"),
						http::HeaderValue::from_str(&window_secs.to_string()).expect("numeric header value"),
					);

					Ok(response)
				}
			})
		})
	}
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::response::Response;

	fn ok_handler() -> BoxHandler {
		crate::handler::handler_fn(|_ctx| async move { Ok(Response::text("ok")) })
	}

	fn ctx_from(addr: &str) -> Arc<RequestContext> {
		let request = crate::request::Request::without_body(
			http::Method::GET,
			"/".to_owned(),
			String::new(),
			http::HeaderMap::new(),
			Some(addr.parse().unwrap()),
			"http".to_owned(),
			crate::request::DEFAULT_MAX_BODY_SIZE,
		);
		Arc::new(RequestContext::new(request, Arc::new(http::Extensions::new())))
	}

	#[tokio::test]
	async fn allows_up_to_the_limit_then_rejects() {
		let chain = RateLimitMiddleware::new(3, Duration::from_secs(60)).build()(ok_handler());

		for expected_remaining in [2, 1, 0] {
			let response = chain.call(ctx_from("10.0.0.1:1")).await.unwrap();
			assert_eq!(response.status(), http::StatusCode::OK);
			assert_eq!(
				response
					.headers()
					.get("x-ratelimit-remaining")
					.unwrap()
					.to_str()
					.unwrap(),
				expected_remaining.to_string()
			);
		}

		let result = chain.call(ctx_from("10.0.0.1:1")).await;
		assert!(matches!(result, Err(ThorError::TooManyRequests { .. })));
	}

	#[tokio::test]
	async fn different_clients_have_independent_windows() {
		let chain = RateLimitMiddleware::new(1, Duration::from_secs(60)).build()(ok_handler());

		assert!(chain.call(ctx_from("10.0.0.1:1")).await.is_ok());
		assert!(chain.call(ctx_from("10.0.0.2:1")).await.is_ok());
	}
}
