//! Middleware chain composition (§4.5).
//!
//! Grounded on `examples/argan-rs-argan/src/middleware/mod.rs`'s function-wrapping idiom: a
//! middleware is a function from the downstream handler to a new handler, and a chain is nothing
//! more than folding a list of those functions over a terminal handler.

// ----------

use crate::handler::{BoxHandler, Middleware};

pub mod cors;
pub mod csrf;
pub mod error_handler;
pub mod logging;
pub mod rate_limit;
pub mod timeout;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Folds `middleware` over `terminal` in reverse registration order, so the first-registered
/// middleware ends up as the outermost wrapper and runs first on the way in, last on the way out
/// (§4.5).
pub fn compose(terminal: BoxHandler, middleware: &[Middleware]) -> BoxHandler {
	middleware.iter().rev().fold(terminal, |inner, layer| layer(inner))
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use std::sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	};

	use super::*;
	use crate::{handler::handler_fn, response::Response};

	#[tokio::test]
	async fn outermost_middleware_runs_first() {
		let order = Arc::new(AtomicUsize::new(0));
		let first_seen = Arc::new(AtomicUsize::new(0));
		let second_seen = Arc::new(AtomicUsize::new(0));

		let order_a = order.clone();
		let first_seen_a = first_seen.clone();
		let outer: Middleware = crate::handler::middleware_fn(move |next| {
			let order = order_a.clone();
			let first_seen = first_seen_a.clone();
			crate::handler::handler_fn(move |ctx| {
				let next = next.clone();
				let order = order.clone();
				let first_seen = first_seen.clone();
				async move {
					first_seen.store(order.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
					next.call(ctx).await
				}
			})
		});

		let order_b = order.clone();
		let second_seen_b = second_seen.clone();
		let inner: Middleware = crate::handler::middleware_fn(move |next| {
			let order = order_b.clone();
			let second_seen = second_seen_b.clone();
			crate::handler::handler_fn(move |ctx| {
				let next = next.clone();
				let order = order.clone();
				let second_seen = second_seen.clone();
				async move {
					second_seen.store(order.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
					next.call(ctx).await
				}
			})
		});

		let terminal = handler_fn(|_ctx| async move { Ok(Response::text("ok")) });
		let chain = compose(terminal, &[outer, inner]);

		let ctx = Arc::new(crate::request::RequestContext::minimal(http::Method::GET, "/"));
		chain.call(ctx).await.unwrap();

		assert_eq!(first_seen.load(Ordering::SeqCst), 0);
		assert_eq!(second_seen.load(Ordering::SeqCst), 1);
	}
}
