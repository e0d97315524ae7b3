//! Double-submit-cookie CSRF validation (§4.9).
//!
//! Grounded on `original_source/src/thor/middleware/csrf.py` for the exact skip/refresh rules, wrapped in
//! the function-middleware idiom `examples/argan-rs-argan/src/middleware/mod.rs` follows.

// ----------

use std::sync::Arc;

use http::Method;

use crate::{
	cookie::CookieOptions,
	error::ThorError,
	handler::{BoxHandler, Handler, Middleware},
	request::RequestContext,
	response::Response,
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

fn is_safe_method(method: &Method) -> bool {
	matches!(method, &Method::GET | &Method::HEAD | &Method::OPTIONS | &Method::TRACE)
}

fn generate_token() -> String {
	use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
	use rand::Rng;

	let bytes: [u8; 32] = rand::thread_rng().gen();
	URL_SAFE_NO_PAD.encode(bytes)
}

/// Compares two byte strings in time independent of where they first differ (§8.9): every byte
/// pair is compared regardless of earlier mismatches, and the result folds through a bitwise OR
/// rather than a short-circuiting branch.
fn constant_time_eq(a: &str, b: &str) -> bool {
	let (a, b) = (a.as_bytes(), b.as_bytes());
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// Configuration for the CSRF middleware (§4.9).
pub struct CsrfMiddleware {
	cookie_name: String,
	header_name: String,
	form_field_name: String,
	cookie_options: CookieOptions,
	exclude_paths: Vec<String>,
}

impl Default for CsrfMiddleware {
	fn default() -> Self {
		Self {
			cookie_name: "thor_csrf".to_owned(),
			header_name: "x-csrf-token".to_owned(),
			form_field_name: "_csrf_token".to_owned(),
			cookie_options: CookieOptions::default().with_http_only(false),
			exclude_paths: Vec::new(),
		}
	}
}

impl CsrfMiddleware {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cookie_name(mut self, name: impl Into<String>) -> Self {
		self.cookie_name = name.into();
		self
	}

	pub fn exclude_paths(mut self, paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
		self.exclude_paths = paths.into_iter().map(Into::into).collect();
		self
	}

	pub fn build(self) -> Middleware {
		let state = Arc::new(self);

		crate::handler::middleware_fn(move |next: BoxHandler| {
			let state = state.clone();

			crate::handler::handler_fn(move |ctx: Arc<RequestContext>| {
				let state = state.clone();
				let next = next.clone();

				async move {
					if state.exclude_paths.iter().any(|p| ctx.request.path().starts_with(p.as_str())) {
						return next.call(ctx).await;
					}

					let cookie_value = ctx.request.cookie(&state.cookie_name).map(str::to_owned);
					let token = cookie_value.clone().unwrap_or_else(generate_token);
					ctx.set_csrf_token(token.clone());

					if !is_safe_method(ctx.request.method()) {
						if let Some(cookie_token) = &cookie_value {
							let submitted = submitted_token(&ctx, &state).await?;

							let valid = submitted
								.as_deref()
								.is_some_and(|submitted| constant_time_eq(cookie_token, submitted));

							if !valid {
								return csrf_rejection();
							}
						} else {
							return csrf_rejection();
						}
					}

					let mut response = next.call(ctx).await?;
					response.set_cookie(&state.cookie_name, &token, &state.cookie_options);

					Ok(response)
				}
			})
		})
	}
}

async fn submitted_token(
	ctx: &RequestContext,
	state: &CsrfMiddleware,
) -> Result<Option<String>, ThorError> {
	if let Some(header_value) = ctx.request.header(&state.header_name) {
		return Ok(Some(header_value.to_owned()));
	}

	let content_type = ctx.request.header("content-type").unwrap_or_default();
	if content_type == "application/x-www-form-urlencoded" {
		let form = ctx.request.form().await?;
		return Ok(form.get(&state.form_field_name).map(str::to_owned));
	}

	Ok(None)
}

fn csrf_rejection() -> crate::handler::HandlerResult {
	let body = serde_json::json!({
		"error": "CSRF token missing or invalid",
		"status_code": 403,
	});

	let mut response =
		Response::json(&body).unwrap_or_else(|_| Response::new(http::StatusCode::FORBIDDEN));
	response.set_status(http::StatusCode::FORBIDDEN);

	Ok(response)
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::response::Response as ThorResponse;

	fn ok_handler() -> BoxHandler {
		crate::handler::handler_fn(|_ctx| async move { Ok(ThorResponse::text("ok")) })
	}

	#[tokio::test]
	async fn get_request_sets_a_fresh_cookie() {
		let chain = CsrfMiddleware::new().build()(ok_handler());
		let ctx = Arc::new(RequestContext::minimal(http::Method::GET, "/x"));

		let response = chain.call(ctx).await.unwrap();
		assert_eq!(response.status(), http::StatusCode::OK);
		assert_eq!(response.cookies().len(), 1);
		assert!(response.cookies()[0].starts_with("thor_csrf="));
	}

	#[tokio::test]
	async fn matching_header_token_passes() {
		let chain = CsrfMiddleware::new().build()(ok_handler());

		let mut headers = http::HeaderMap::new();
		headers.insert("cookie", "thor_csrf=abc123".parse().unwrap());
		headers.insert("x-csrf-token", "abc123".parse().unwrap());

		let request = crate::request::Request::without_body(
			http::Method::POST,
			"/x".to_owned(),
			String::new(),
			headers,
			None,
			"http".to_owned(),
			crate::request::DEFAULT_MAX_BODY_SIZE,
		);
		let ctx = Arc::new(RequestContext::new(request, Arc::new(http::Extensions::new())));

		let response = chain.call(ctx).await.unwrap();
		assert_eq!(response.status(), http::StatusCode::OK);
	}

	#[tokio::test]
	async fn mismatched_header_token_is_rejected() {
		let chain = CsrfMiddleware::new().build()(ok_handler());

		let mut headers = http::HeaderMap::new();
		headers.insert("cookie", "thor_csrf=abc123".parse().unwrap());
		headers.insert("x-csrf-token", "wrong".parse().unwrap());

		let request = crate::request::Request::without_body(
			http::Method::POST,
			"/x".to_owned(),
			String::new(),
			headers,
			None,
			"http".to_owned(),
			crate::request::DEFAULT_MAX_BODY_SIZE,
		);
		let ctx = Arc::new(RequestContext::new(request, Arc::new(http::Extensions::new())));

		let response = chain.call(ctx).await.unwrap();
		assert_eq!(response.status(), http::StatusCode::FORBIDDEN);
	}

	#[tokio::test]
	async fn excluded_path_skips_validation_and_cookie() {
		let chain = CsrfMiddleware::new().exclude_paths(["/webhooks"]).build()(ok_handler());
		let ctx = Arc::new(RequestContext::minimal(http::Method::POST, "/webhooks/stripe"));

		let response = chain.call(ctx).await.unwrap();
		assert_eq!(response.status(), http::StatusCode::OK);
		assert!(response.cookies().is_empty());
	}
}
