//! Per-request deadline enforcement (§4.12).
//!
//! Grounded on `original_source/src/thor/middleware/timeout.py`'s cancel-and-raise behavior; built on
//! `tokio::time::timeout`, the idiom the corpus itself uses for bounding async work.

// ----------

use std::{sync::Arc, time::Duration};

use crate::{
	error::ThorError,
	handler::{BoxHandler, Middleware},
	request::RequestContext,
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Builds the timeout middleware (§4.12): if the downstream chain has not produced a response
/// within `duration`, the in-flight work is dropped and a `gateway-timeout` error is raised
/// instead, to be handled uniformly by [`crate::middleware::error_handler`] regardless of where
/// this middleware sits among user-registered layers.
pub fn timeout(duration: Duration) -> Middleware {
	crate::handler::middleware_fn(move |next: BoxHandler| {
		let next = next.clone();

		crate::handler::handler_fn(move |ctx: Arc<RequestContext>| {
			let next = next.clone();

			async move {
				match tokio::time::timeout(duration, next.call(ctx)).await {
					Ok(result) => result,
					Err(_elapsed) => Err(ThorError::GatewayTimeout),
				}
			}
		})
	})
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::response::Response;

	#[tokio::test(start_paused = true)]
	async fn fast_handler_completes_normally() {
		let terminal = crate::handler::handler_fn(|_ctx| async move { Ok(Response::text("ok")) });
		let chain = timeout(Duration::from_secs(1))(terminal);

		let ctx = Arc::new(RequestContext::minimal(http::Method::GET, "/"));
		let response = chain.call(ctx).await.unwrap();
		assert_eq!(response.status(), http::StatusCode::OK);
	}

	#[tokio::test(start_paused = true)]
	async fn slow_handler_raises_gateway_timeout() {
		let terminal = crate::handler::handler_fn(|_ctx| async move {
			tokio::time::sleep(Duration::from_secs(10)).await;
			Ok(Response::text("too slow"))
		});
		let chain = timeout(Duration::from_millis(10))(terminal);

		let ctx = Arc::new(RequestContext::minimal(http::Method::GET, "/"));
		let result = chain.call(ctx).await;
		assert!(matches!(result, Err(ThorError::GatewayTimeout)));
	}
}
