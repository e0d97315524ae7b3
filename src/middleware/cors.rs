//! CORS origin matching, preflight handling, and response header injection (§4.10).
//!
//! Grounded on `original_source/src/thor/middleware/cors.py` for the origin-matching precedence and the
//! bare-wildcard/subdomain-mixing nuance; wrapped in the function-middleware idiom
//! `examples/argan-rs-argan/src/middleware/mod.rs` follows.

// ----------

use std::{sync::Arc, time::Duration};

use http::{HeaderValue, Method, StatusCode};
use regex::Regex;

use crate::{
	handler::{BoxHandler, Middleware},
	request::RequestContext,
	response::Response,
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// A single `allow_origins` entry: an exact origin, the bare wildcard, or a `*.suffix`
/// wildcard-subdomain pattern (§4.10).
#[derive(Debug, Clone)]
enum OriginPattern {
	BareWildcard,
	WildcardSubdomain(String),
	Exact(String),
}

fn classify(raw: &str) -> OriginPattern {
	if raw == "*" {
		OriginPattern::BareWildcard
	} else if let Some(suffix) = raw.strip_prefix("*.") {
		OriginPattern::WildcardSubdomain(suffix.to_owned())
	} else {
		OriginPattern::Exact(raw.to_owned())
	}
}

/// Returned by [`CorsMiddleware::new`] when the configuration violates the CORS spec.
#[derive(Debug, thiserror::Error)]
#[error("allow_credentials=true cannot be combined with a bare \"*\" origin and no regex")]
pub struct CorsConfigError;

/// CORS configuration and the middleware it builds (§4.10).
pub struct CorsMiddleware {
	patterns: Vec<OriginPattern>,
	allow_origin_regex: Option<Regex>,
	allow_methods: Vec<Method>,
	allow_headers: Vec<String>,
	allow_credentials: bool,
	expose_headers: Vec<String>,
	max_age: Duration,
}

impl CorsMiddleware {
	pub fn new(
		allow_origins: impl IntoIterator<Item = impl Into<String>>,
	) -> Result<Self, CorsConfigError> {
		let patterns: Vec<OriginPattern> = allow_origins.into_iter().map(|o| classify(&o.into())).collect();

		Ok(Self {
			patterns,
			allow_origin_regex: None,
			allow_methods: vec![Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE],
			allow_headers: vec!["content-type".to_owned(), "authorization".to_owned()],
			allow_credentials: false,
			expose_headers: Vec::new(),
			max_age: Duration::from_secs(600),
		})
	}

	pub fn allow_origin_regex(mut self, regex: Regex) -> Self {
		self.allow_origin_regex = Some(regex);
		self
	}

	pub fn allow_methods(mut self, methods: Vec<Method>) -> Self {
		self.allow_methods = methods;
		self
	}

	pub fn allow_headers(mut self, headers: Vec<String>) -> Self {
		self.allow_headers = headers;
		self
	}

	pub fn expose_headers(mut self, headers: Vec<String>) -> Self {
		self.expose_headers = headers;
		self
	}

	pub fn max_age(mut self, max_age: Duration) -> Self {
		self.max_age = max_age;
		self
	}

	/// Rejects the spec-violating combination of credentialed responses with blanket origin
	/// reflection and no narrower matcher (§4.10).
	pub fn allow_credentials(mut self, allow: bool) -> Result<Self, CorsConfigError> {
		if allow
			&& self.allow_origin_regex.is_none()
			&& self.patterns.iter().any(|p| matches!(p, OriginPattern::BareWildcard))
		{
			return Err(CorsConfigError);
		}

		self.allow_credentials = allow;
		Ok(self)
	}

	fn has_bare_wildcard(&self) -> bool {
		self.patterns.iter().any(|p| matches!(p, OriginPattern::BareWildcard))
	}

	fn has_subdomain_entries(&self) -> bool {
		self
			.patterns
			.iter()
			.any(|p| matches!(p, OriginPattern::WildcardSubdomain(_)))
	}

	/// Bare-wildcard-only fast path: allow every origin, reflect the literal `*`, no `Vary` (§4.10).
	fn is_bare_wildcard_only(&self) -> bool {
		self.has_bare_wildcard() && !self.has_subdomain_entries()
	}

	/// Origin matching precedence: bare wildcard, exact membership, subdomain suffix, regex
	/// full-match (§4.10).
	fn matches(&self, origin: &str) -> bool {
		if self.is_bare_wildcard_only() {
			return true;
		}

		for pattern in &self.patterns {
			match pattern {
				OriginPattern::BareWildcard => return true,
				OriginPattern::Exact(exact) => {
					if exact == origin {
						return true;
					}
				}
				OriginPattern::WildcardSubdomain(suffix) => {
					if origin.ends_with(suffix.as_str())
						&& origin.len() > suffix.len()
						&& origin.as_bytes()[origin.len() - suffix.len() - 1] == b'.'
					{
						return true;
					}
				}
			}
		}

		if let Some(regex) = &self.allow_origin_regex {
			return regex.is_match(origin);
		}

		false
	}

	fn apply_common_headers(&self, response: &mut Response, origin: &str) {
		let reflect_literal_wildcard = self.is_bare_wildcard_only() && !self.allow_credentials;

		let allow_origin_value = if reflect_literal_wildcard { "*" } else { origin };

		if let Ok(value) = HeaderValue::from_str(allow_origin_value) {
			response.insert_header(http::header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
		}

		if !reflect_literal_wildcard {
			response.append_header(http::header::VARY, HeaderValue::from_static("Origin"));
		}

		if self.allow_credentials {
			response.insert_header(
				http::header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
				HeaderValue::from_static("true"),
			);
		}

		if !self.expose_headers.is_empty() {
			if let Ok(value) = HeaderValue::from_str(&self.expose_headers.join(", ")) {
				response.insert_header(http::header::ACCESS_CONTROL_EXPOSE_HEADERS, value);
			}
		}
	}

	pub fn build(self) -> Middleware {
		let state = Arc::new(self);

		crate::handler::middleware_fn(move |next: BoxHandler| {
			let state = state.clone();

			crate::handler::handler_fn(move |ctx: Arc<RequestContext>| {
				let state = state.clone();
				let next = next.clone();

				async move {
					let Some(origin) = ctx.request.header("origin").map(str::to_owned) else {
						return next.call(ctx).await;
					};

					if !state.matches(&origin) {
						return next.call(ctx).await;
					}

					if ctx.request.method() == Method::OPTIONS
						&& ctx.request.header("access-control-request-method").is_some()
					{
						let mut response = Response::new(StatusCode::NO_CONTENT);
						state.apply_common_headers(&mut response, &origin);

						let methods = state
							.allow_methods
							.iter()
							.map(Method::as_str)
							.collect::<Vec<_>>()
							.join(", ");
						if let Ok(value) = HeaderValue::from_str(&methods) {
							response.insert_header(http::header::ACCESS_CONTROL_ALLOW_METHODS, value);
						}

						let headers = state.allow_headers.join(", ");
						if let Ok(value) = HeaderValue::from_str(&headers) {
							response.insert_header(http::header::ACCESS_CONTROL_ALLOW_HEADERS, value);
						}

						response.insert_header(
							http::header::ACCESS_CONTROL_MAX_AGE,
							HeaderValue::from_str(&state.max_age.as_secs().to_string())
								.expect("numeric header value"),
						);

						return Ok(response);
					}

					let mut response = next.call(ctx).await?;
					state.apply_common_headers(&mut response, &origin);

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
	use crate::request::Request;

	fn ctx_with_origin(method: Method, origin: &str) -> Arc<RequestContext> {
		let mut headers = http::HeaderMap::new();
		headers.insert("origin", origin.parse().unwrap());
		if method == Method::OPTIONS {
			headers.insert("access-control-request-method", "GET".parse().unwrap());
		}

		let request = Request::without_body(
			method,
			"/".to_owned(),
			String::new(),
			headers,
			None,
			"http".to_owned(),
			crate::request::DEFAULT_MAX_BODY_SIZE,
		);
		Arc::new(RequestContext::new(request, Arc::new(http::Extensions::new())))
	}

	fn ok_handler() -> BoxHandler {
		crate::handler::handler_fn(|_ctx| async move { Ok(Response::text("ok")) })
	}

	#[tokio::test]
	async fn allowed_origin_gets_reflected_with_vary() {
		let cors = CorsMiddleware::new(["https://example.com"]).unwrap().build();
		let chain = cors(ok_handler());

		let ctx = ctx_with_origin(Method::GET, "https://example.com");
		let response = chain.call(ctx).await.unwrap();

		assert_eq!(
			response
				.headers()
				.get(http::header::ACCESS_CONTROL_ALLOW_ORIGIN)
				.unwrap(),
			"https://example.com"
		);
		assert_eq!(response.headers().get(http::header::VARY).unwrap(), "Origin");
	}

	#[tokio::test]
	async fn bare_wildcard_only_reflects_literal_star_with_no_vary() {
		let cors = CorsMiddleware::new(["*"]).unwrap().build();
		let chain = cors(ok_handler());

		let ctx = ctx_with_origin(Method::GET, "https://anything.example");
		let response = chain.call(ctx).await.unwrap();

		assert_eq!(
			response
				.headers()
				.get(http::header::ACCESS_CONTROL_ALLOW_ORIGIN)
				.unwrap(),
			"*"
		);
		assert!(response.headers().get(http::header::VARY).is_none());
	}

	#[tokio::test]
	async fn wildcard_subdomain_mixed_with_bare_star_still_varies() {
		let cors = CorsMiddleware::new(["*", "*.example.com"]).unwrap().build();
		let chain = cors(ok_handler());

		let ctx = ctx_with_origin(Method::GET, "https://app.example.com");
		let response = chain.call(ctx).await.unwrap();

		assert!(response.headers().get(http::header::VARY).is_some());
	}

	#[tokio::test]
	async fn preflight_gets_max_age_and_allow_methods() {
		let cors = CorsMiddleware::new(["https://example.com"]).unwrap().build();
		let chain = cors(ok_handler());

		let ctx = ctx_with_origin(Method::OPTIONS, "https://example.com");
		let response = chain.call(ctx).await.unwrap();

		assert_eq!(response.status(), StatusCode::NO_CONTENT);
		assert!(response
			.headers()
			.get(http::header::ACCESS_CONTROL_MAX_AGE)
			.is_some());
	}

	#[test]
	fn credentials_with_bare_wildcard_and_no_regex_is_rejected() {
		let cors = CorsMiddleware::new(["*"]).unwrap();
		assert!(cors.allow_credentials(true).is_err());
	}
}
