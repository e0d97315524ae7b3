//! The closed-world HTTP error taxonomy (§7 of the design).
//!
//! Grounded on `argan-core/src/response/error.rs`'s `ResponseError`, simplified away from its
//! `Any`/downcasting design: this crate's error surface is a fixed, closed set of kinds rather
//! than an open extensible one, since the spec enumerates exactly nine kinds and nothing else
//! is meant to reach a client as a framework error.

// ----------

use std::borrow::Cow;

use http::{HeaderName, HeaderValue, StatusCode};
use serde_json::Value;

use crate::BoxedError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// The engine's closed-world HTTP error taxonomy.
///
/// Raising one of these from a handler or middleware bubbles up to the error-handler
/// middleware (§4.6), which is the only place a `ThorError` is ever turned into bytes on the
/// wire. Everything else that goes wrong — a panic caught at the task boundary, an `io::Error`
/// from a file response, anything not already one of these kinds — is wrapped as `Internal` and
/// never exposes its message to the client.
#[derive(Debug, thiserror::Error)]
pub enum ThorError {
	#[error("{0}")]
	BadRequest(Cow<'static, str>),

	#[error("{0}")]
	Unauthorized(Cow<'static, str>),

	#[error("{0}")]
	Forbidden(Cow<'static, str>),

	#[error("not found")]
	NotFound,

	#[error("method not allowed")]
	MethodNotAllowed,

	#[error("payload too large")]
	PayloadTooLarge,

	#[error("too many requests")]
	TooManyRequests { retry_after: u64 },

	#[error("gateway timeout")]
	GatewayTimeout,

	#[error(transparent)]
	Internal(#[from] BoxedError),
}

impl ThorError {
	pub fn bad_request(detail: impl Into<Cow<'static, str>>) -> Self {
		Self::BadRequest(detail.into())
	}

	pub fn unauthorized(detail: impl Into<Cow<'static, str>>) -> Self {
		Self::Unauthorized(detail.into())
	}

	pub fn forbidden(detail: impl Into<Cow<'static, str>>) -> Self {
		Self::Forbidden(detail.into())
	}

	pub fn internal(error: impl std::error::Error + Send + Sync + 'static) -> Self {
		Self::Internal(Box::new(error))
	}

	/// The status code a client sees for this error kind.
	pub fn status_code(&self) -> StatusCode {
		use ThorError::*;

		match self {
			BadRequest(_) => StatusCode::BAD_REQUEST,
			Unauthorized(_) => StatusCode::UNAUTHORIZED,
			Forbidden(_) => StatusCode::FORBIDDEN,
			NotFound => StatusCode::NOT_FOUND,
			MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
			PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
			GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
			Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// The message that is safe to place in the client-visible JSON body.
	///
	/// The `Internal` variant's source error is deliberately not consulted here — its message
	/// and stack trace are for the logs only, never the wire, even when debugging is enabled.
	pub fn public_detail(&self) -> Cow<'static, str> {
		use ThorError::*;

		match self {
			BadRequest(detail) | Unauthorized(detail) | Forbidden(detail) => detail.clone(),
			NotFound => Cow::Borrowed("Not Found"),
			MethodNotAllowed => Cow::Borrowed("Method Not Allowed"),
			PayloadTooLarge => Cow::Borrowed("Payload Too Large"),
			TooManyRequests { .. } => Cow::Borrowed("Too Many Requests"),
			GatewayTimeout => Cow::Borrowed("Gateway Timeout"),
			Internal(_) => Cow::Borrowed("Internal Server Error"),
		}
	}

	/// Extra headers the error handler attaches to the response in addition to `X-Request-Id`.
	pub fn extra_headers(&self) -> Vec<(HeaderName, HeaderValue)> {
		match self {
			ThorError::Unauthorized(_) => {
				vec![(
					http::header::WWW_AUTHENTICATE,
					HeaderValue::from_static("Bearer"),
				)]
			}
			ThorError::TooManyRequests { retry_after } => {
				vec![(
					HeaderName::from_static("retry-after"),
					HeaderValue::from_str(&retry_after.to_string())
						.unwrap_or_else(|_| HeaderValue::from_static("1")),
				)]
			}
			_ => Vec::new(),
		}
	}

	/// Kind-specific fields merged into the body's top-level JSON object (e.g. `retry_after`).
	pub fn extra_body_fields(&self) -> Option<Value> {
		match self {
			ThorError::TooManyRequests { retry_after } => {
				Some(serde_json::json!({ "retry_after": retry_after }))
			}
			_ => None,
		}
	}

	/// `true` for 5xx kinds, which the error handler logs at `error` level with a stack trace
	/// rather than `warn`.
	pub fn is_server_error(&self) -> bool {
		self.status_code().is_server_error()
	}
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn statuses_match_taxonomy() {
		assert_eq!(
			ThorError::bad_request("x").status_code(),
			StatusCode::BAD_REQUEST
		);
		assert_eq!(ThorError::NotFound.status_code(), StatusCode::NOT_FOUND);
		assert_eq!(
			ThorError::MethodNotAllowed.status_code(),
			StatusCode::METHOD_NOT_ALLOWED
		);
		assert_eq!(
			ThorError::PayloadTooLarge.status_code(),
			StatusCode::PAYLOAD_TOO_LARGE
		);
		assert_eq!(
			ThorError::TooManyRequests { retry_after: 5 }.status_code(),
			StatusCode::TOO_MANY_REQUESTS
		);
		assert_eq!(
			ThorError::GatewayTimeout.status_code(),
			StatusCode::GATEWAY_TIMEOUT
		);
	}

	#[test]
	fn internal_never_leaks_detail() {
		let error = ThorError::internal(std::io::Error::other("leaked secret"));
		assert_eq!(error.public_detail(), "Internal Server Error");
	}

	#[test]
	fn unauthorized_carries_www_authenticate() {
		let error = ThorError::unauthorized("missing token");
		let headers = error.extra_headers();
		assert_eq!(headers.len(), 1);
		assert_eq!(headers[0].0, http::header::WWW_AUTHENTICATE);
	}
}
