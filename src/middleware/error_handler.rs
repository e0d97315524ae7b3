//! The always-outermost error-handling and request-id middleware (§4.6).
//!
//! Grounded on `original_source/src/thor/middleware/error_handler.py` and `exceptions.py` for the
//! client-facing error envelope, wrapped in the function-middleware idiom
//! `examples/argan-rs-argan/src/middleware/mod.rs` follows, and logged with `tracing` the way the
//! corpus instruments its own request path.

// ----------

use std::sync::Arc;

use http::HeaderValue;
use uuid::Uuid;

use crate::{
	handler::{BoxHandler, Middleware},
	request::RequestContext,
	response::Response,
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Builds the error-handler middleware (§4.6).
///
/// Assigns every request a UUID request id, exposes it to handlers via
/// [`RequestContext::request_id`], stamps it onto the response as `X-Request-Id`, and turns any
/// `ThorError` that escapes the inner chain into a `{"error", "status_code", "request_id"}` JSON
/// body. 4xx outcomes are logged at `warn`; 5xx at `error`, since those represent a framework or
/// handler bug rather than an ordinary client mistake.
pub fn error_handler() -> Middleware {
	crate::handler::middleware_fn(move |next: BoxHandler| {
		let next = next.clone();

		crate::handler::handler_fn(move |ctx: Arc<RequestContext>| {
			let next = next.clone();

			async move {
				let request_id = Uuid::new_v4().to_string();
				ctx.set_request_id(request_id.clone());

				let outcome = next.call(ctx.clone()).await;

				let mut response = match outcome {
					Ok(response) => response,
					Err(error) => {
						if error.is_server_error() {
							tracing::error!(
								request_id = %request_id,
								path = ctx.request.path(),
								error = %error,
								"request failed with a server error"
							);
						} else {
							tracing::warn!(
								request_id = %request_id,
								path = ctx.request.path(),
								error = %error,
								"request rejected"
							);
						}

						let mut body = serde_json::json!({
							"error": error.public_detail(),
							"status_code": error.status_code().as_u16(),
							"request_id": request_id,
						});

						if let Some(extra) = error.extra_body_fields() {
							if let (Some(body_map), Some(extra_map)) = (body.as_object_mut(), extra.as_object()) {
								for (key, value) in extra_map {
									body_map.insert(key.clone(), value.clone());
								}
							}
						}

						let mut response = Response::json(&body)
							.unwrap_or_else(|_| Response::new(http::StatusCode::INTERNAL_SERVER_ERROR));
						response.set_status(error.status_code());

						for (name, value) in error.extra_headers() {
							response.insert_header(name, value);
						}

						response
					}
				};

				if let Ok(value) = HeaderValue::from_str(&request_id) {
					response.insert_header(
						http::HeaderName::from_static("x-request-id"),
						value,
					);
				}

				Ok(response)
			}
		})
	})
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::ThorError;

	#[tokio::test]
	async fn caught_error_becomes_json_envelope() {
		let terminal = crate::handler::handler_fn(|_ctx| async move {
			Err(ThorError::bad_request("missing field"))
		});
		let chain = error_handler()(terminal);

		let ctx = Arc::new(RequestContext::minimal(http::Method::GET, "/"));
		let response = chain.call(ctx).await.unwrap();

		assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);
		assert!(response.headers().contains_key("x-request-id"));
	}

	#[tokio::test]
	async fn success_still_gets_a_request_id_header() {
		let terminal = crate::handler::handler_fn(|_ctx| async move { Ok(Response::text("ok")) });
		let chain = error_handler()(terminal);

		let ctx = Arc::new(RequestContext::minimal(http::Method::GET, "/"));
		let response = chain.call(ctx).await.unwrap();

		assert_eq!(response.status(), http::StatusCode::OK);
		assert!(response.headers().contains_key("x-request-id"));
	}

	#[tokio::test]
	async fn rate_limit_error_carries_retry_after_field() {
		let terminal = crate::handler::handler_fn(|_ctx| async move {
			Err(ThorError::TooManyRequests { retry_after: 7 })
		});
		let chain = error_handler()(terminal);

		let ctx = Arc::new(RequestContext::minimal(http::Method::GET, "/"));
		let response = chain.call(ctx).await.unwrap();

		assert_eq!(response.status(), http::StatusCode::TOO_MANY_REQUESTS);
		assert!(response.headers().contains_key("retry-after"));
	}
}
