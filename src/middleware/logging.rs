//! Structured access logging (§4.16).
//!
//! Grounded on `examples/argan-rs-argan/src/middleware/mod.rs`'s middleware shape; the fields
//! logged (method, path, status, latency, request id) mirror the access-log line
//! `original_source/src/thor/middleware/logging.py` writes.

// ----------

use std::{sync::Arc, time::Instant};

use crate::{
	handler::{BoxHandler, Middleware},
	request::RequestContext,
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Builds the access-logging middleware: one `tracing` event per completed request, emitted
/// after the response status is known, with a `warn` bump for 5xx outcomes (§4.16).
///
/// Register this inside [`crate::middleware::error_handler::error_handler`] so the request id it
/// assigns is already set on the context.
pub fn request_logging() -> Middleware {
	crate::handler::middleware_fn(move |next: BoxHandler| {
		let next = next.clone();

		crate::handler::handler_fn(move |ctx: Arc<RequestContext>| {
			let next = next.clone();

			async move {
				let started_at = Instant::now();
				let method = ctx.request.method().clone();
				let path = ctx.request.path().to_owned();

				let outcome = next.call(ctx.clone()).await;
				let elapsed = started_at.elapsed();

				match &outcome {
					Ok(response) if response.status().is_server_error() => {
						tracing::warn!(
							request_id = ctx.request_id().unwrap_or("-"),
							method = %method,
							path = %path,
							status = response.status().as_u16(),
							elapsed_ms = elapsed.as_millis() as u64,
							"request completed with a server error"
						);
					}
					Ok(response) => {
						tracing::info!(
							request_id = ctx.request_id().unwrap_or("-"),
							method = %method,
							path = %path,
							status = response.status().as_u16(),
							elapsed_ms = elapsed.as_millis() as u64,
							"request completed"
						);
					}
					Err(error) => {
						tracing::info!(
							request_id = ctx.request_id().unwrap_or("-"),
							method = %method,
							path = %path,
							status = error.status_code().as_u16(),
							elapsed_ms = elapsed.as_millis() as u64,
							"request completed"
						);
					}
				}

				outcome
			}
		})
	})
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::response::Response;

	#[tokio::test]
	async fn passes_through_the_response() {
		let terminal = crate::handler::handler_fn(|_ctx| async move { Ok(Response::text("ok")) });
		let chain = request_logging()(terminal);

		let ctx = Arc::new(RequestContext::minimal(http::Method::GET, "/"));
		let response = chain.call(ctx).await.unwrap();
		assert_eq!(response.status(), http::StatusCode::OK);
	}
}
