//! The inbound request type and the per-request property bag (§3, §4.4, §9).
//!
//! Grounded on `original_source/src/thor/request.py` and, for the boxed-body plumbing,
//! `argan-core/src/request/mod.rs`. The source's mutable "scope" dictionary is re-architected
//! here as a strongly-typed struct with explicit fields, per §9's guidance, with a separate
//! opaque [`http::Extensions`] map standing in for the source's free-form `app`/`state` keys.

// ----------

use std::{
	collections::HashMap,
	fmt,
	net::SocketAddr,
	sync::{Arc, Mutex, OnceLock},
};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;

use crate::{body::Body, cookie::parse_cookies, error::ThorError};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Default cap on request body size, in bytes. `0` disables the check (§3).
pub const DEFAULT_MAX_BODY_SIZE: usize = 1_048_576;

// --------------------------------------------------
// PathParamValue / PathParams

/// A single typed path-parameter value resolved by the router at match time (§9).
///
/// Type conversion happens once, during routing, so handlers never re-parse path segments.
#[derive(Debug, Clone, PartialEq)]
pub enum PathParamValue {
	Int(i64),
	Str(String),
}

impl PathParamValue {
	pub fn as_str(&self) -> Option<&str> {
		match self {
			PathParamValue::Str(s) => Some(s),
			PathParamValue::Int(_) => None,
		}
	}

	pub fn as_int(&self) -> Option<i64> {
		match self {
			PathParamValue::Int(i) => Some(*i),
			PathParamValue::Str(_) => None,
		}
	}
}

impl fmt::Display for PathParamValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PathParamValue::Int(i) => write!(f, "{i}"),
			PathParamValue::Str(s) => write!(f, "{s}"),
		}
	}
}

/// The map of path-parameter names to their typed, matched values.
pub type PathParams = HashMap<String, PathParamValue>;

// --------------------------------------------------
// Request body

enum BodyState {
	Pending {
		body: Body,
		content_length: Option<usize>,
	},
	Taken,
	Cached(Bytes),
}

// --------------------------------------------------
// Request

/// An inbound HTTP (or WebSocket handshake) request.
///
/// The body is read lazily and at most once: the first successful [`Request::body`] call caches
/// the bytes for every subsequent call, and the cached bytes are never re-streamed from the
/// connection.
pub struct Request {
	method: Method,
	path: String,
	query: String,
	headers: HeaderMap,
	client_addr: Option<SocketAddr>,
	scheme: String,
	max_body_size: usize,
	body: Mutex<BodyState>,
	cookies: OnceLock<HashMap<String, String>>,
}

impl Request {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		method: Method,
		path: String,
		query: String,
		headers: HeaderMap,
		client_addr: Option<SocketAddr>,
		scheme: String,
		body: Body,
		content_length: Option<usize>,
		max_body_size: usize,
	) -> Self {
		Self {
			method,
			path,
			query,
			headers,
			client_addr,
			scheme,
			max_body_size,
			body: Mutex::new(BodyState::Pending {
				body,
				content_length,
			}),
			cookies: OnceLock::new(),
		}
	}

	/// Builds a bodyless request, for tests and for internally synthesized requests (e.g. CORS
	/// preflight short-circuits that never need to read the body).
	pub fn without_body(
		method: Method,
		path: String,
		query: String,
		headers: HeaderMap,
		client_addr: Option<SocketAddr>,
		scheme: String,
		max_body_size: usize,
	) -> Self {
		Self::new(
			method,
			path,
			query,
			headers,
			client_addr,
			scheme,
			Body::default(),
			Some(0),
			max_body_size,
		)
	}

	pub fn method(&self) -> &Method {
		&self.method
	}

	pub fn path(&self) -> &str {
		&self.path
	}

	pub fn query(&self) -> &str {
		&self.query
	}

	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(name).and_then(|value| value.to_str().ok())
	}

	pub fn client_addr(&self) -> Option<SocketAddr> {
		self.client_addr
	}

	pub fn scheme(&self) -> &str {
		&self.scheme
	}

	/// Parses the `Cookie` header on first access; cached thereafter (§4.2).
	pub fn cookies(&self) -> &HashMap<String, String> {
		self.cookies.get_or_init(|| {
			self
				.header("cookie")
				.map(parse_cookies)
				.unwrap_or_default()
		})
	}

	pub fn cookie(&self, name: &str) -> Option<&str> {
		self.cookies().get(name).map(String::as_str)
	}

	/// Reads and caches the full request body, enforcing `max_body_size` (§3, §8.8).
	///
	/// A request whose declared `Content-Length` already exceeds the cap fails immediately,
	/// before any bytes are read; one whose length is unknown up front is rejected as soon as
	/// the running total crosses the cap, so a handler never observes a partial body.
	pub async fn body(&self) -> Result<Bytes, ThorError> {
		let taken = {
			let mut guard = self.body.lock().expect("request body mutex poisoned");
			match &*guard {
				BodyState::Cached(bytes) => return Ok(bytes.clone()),
				BodyState::Taken => None,
				BodyState::Pending { .. } => {
					match std::mem::replace(&mut *guard, BodyState::Taken) {
						BodyState::Pending {
							body,
							content_length,
						} => Some((body, content_length)),
						_ => unreachable!(),
					}
				}
			}
		};

		let Some((mut body, content_length)) = taken else {
			// A concurrent caller already consumed the stream; this engine hands each request
			// to a single task, so this path is not expected in practice.
			return Ok(Bytes::new());
		};

		if self.max_body_size > 0 {
			if let Some(len) = content_length {
				if len > self.max_body_size {
					return Err(ThorError::PayloadTooLarge);
				}
			}
		}

		let mut collected = BytesMut::new();
		while let Some(frame) = body.frame().await {
			let frame = frame.map_err(ThorError::internal)?;
			if let Ok(data) = frame.into_data() {
				collected.extend_from_slice(&data);

				if self.max_body_size > 0 && collected.len() > self.max_body_size {
					return Err(ThorError::PayloadTooLarge);
				}
			}
		}

		let bytes = collected.freeze();
		*self.body.lock().expect("request body mutex poisoned") = BodyState::Cached(bytes.clone());

		Ok(bytes)
	}

	/// Parses the body as JSON. An empty body yields `Ok(None)` rather than an error; a
	/// non-empty body that is not valid UTF-8 JSON is a `bad-request`.
	pub async fn json<T: DeserializeOwned>(&self) -> Result<Option<T>, ThorError> {
		let bytes = self.body().await?;
		if bytes.is_empty() {
			return Ok(None);
		}

		serde_json::from_slice(&bytes)
			.map(Some)
			.map_err(|error| ThorError::bad_request(format!("invalid JSON body: {error}")))
	}

	/// Parses the body as a form, dispatching to the multipart parser or URL-decoding depending
	/// on `Content-Type` (§4.4).
	pub async fn form(&self) -> Result<crate::multipart::Form, ThorError> {
		let content_type = self.header("content-type").unwrap_or_default().to_owned();

		if let Some(boundary) = crate::multipart::multipart_boundary(&content_type) {
			let bytes = self.body().await?;
			return crate::multipart::parse_multipart(&bytes, &boundary);
		}

		let bytes = self.body().await?;
		let pairs: Vec<(String, String)> =
			serde_urlencoded::from_bytes(&bytes).map_err(|error| {
				ThorError::bad_request(format!("invalid urlencoded form body: {error}"))
			})?;

		Ok(crate::multipart::Form::from_pairs(pairs))
	}
}

// --------------------------------------------------
// RequestContext

/// The per-request mutable property bag threaded through the middleware chain (§3, §9).
///
/// Replaces the source's free-form "scope" dictionary with explicit, strongly-typed fields for
/// every cross-cutting concern the engine itself knows about (`request_id`, `user`, `session`,
/// `csrf_token`, `path_params`), plus an opaque [`http::Extensions`] map for application-defined
/// shared state (the lifespan bag) and anything else a caller wants to stash per request.
pub struct RequestContext {
	pub request: Request,
	path_params: OnceLock<PathParams>,
	request_id: OnceLock<String>,
	user: Mutex<Option<crate::auth::AuthUser>>,
	session: Mutex<Option<crate::session::Session>>,
	csrf_token: Mutex<Option<String>>,
	extensions: Arc<http::Extensions>,
	websocket_upgrade: Mutex<Option<hyper::upgrade::OnUpgrade>>,
}

impl RequestContext {
	pub fn new(request: Request, extensions: Arc<http::Extensions>) -> Self {
		Self {
			request,
			path_params: OnceLock::new(),
			request_id: OnceLock::new(),
			user: Mutex::new(None),
			session: Mutex::new(None),
			csrf_token: Mutex::new(None),
			extensions,
			websocket_upgrade: Mutex::new(None),
		}
	}

	/// Attaches the hyper upgrade future for a WebSocket handshake request, for a
	/// [`crate::websocket`] route handler to later take and drive (§4.14, §4.15).
	pub(crate) fn set_websocket_upgrade(&self, upgrade: hyper::upgrade::OnUpgrade) {
		*self.websocket_upgrade.lock().expect("websocket upgrade mutex poisoned") = Some(upgrade);
	}

	/// Takes the upgrade future set by the transport adapter for a WebSocket handshake request;
	/// `None` for an ordinary HTTP request, or if already taken (§4.14).
	pub fn take_websocket_upgrade(&self) -> Option<hyper::upgrade::OnUpgrade> {
		self
			.websocket_upgrade
			.lock()
			.expect("websocket upgrade mutex poisoned")
			.take()
	}

	pub fn request_id(&self) -> Option<&str> {
		self.request_id.get().map(String::as_str)
	}

	/// Set once, by the error-handler middleware, which is always the outermost wrapper (§4.6).
	pub fn set_request_id(&self, id: String) {
		let _ = self.request_id.set(id);
	}

	/// The typed path parameters the router resolved for this request; empty until the dispatcher
	/// sets them, which happens before any middleware or handler observes this context (§9).
	pub fn path_params(&self) -> &PathParams {
		self.path_params.get_or_init(PathParams::new)
	}

	/// Set once, by the application dispatcher, right after the router resolves the matched route
	/// (§4.3, §9).
	pub fn set_path_params(&self, params: PathParams) {
		let _ = self.path_params.set(params);
	}

	pub fn user(&self) -> Option<crate::auth::AuthUser> {
		self.user.lock().expect("user mutex poisoned").clone()
	}

	pub fn set_user(&self, user: crate::auth::AuthUser) {
		*self.user.lock().expect("user mutex poisoned") = Some(user);
	}

	pub fn with_session<R>(&self, f: impl FnOnce(&mut crate::session::Session) -> R) -> Option<R> {
		let mut guard = self.session.lock().expect("session mutex poisoned");
		guard.as_mut().map(f)
	}

	pub fn take_session(&self) -> Option<crate::session::Session> {
		self.session.lock().expect("session mutex poisoned").take()
	}

	pub fn set_session(&self, session: crate::session::Session) {
		*self.session.lock().expect("session mutex poisoned") = Some(session);
	}

	pub fn csrf_token(&self) -> Option<String> {
		self.csrf_token.lock().expect("csrf mutex poisoned").clone()
	}

	pub fn set_csrf_token(&self, token: String) {
		*self.csrf_token.lock().expect("csrf mutex poisoned") = Some(token);
	}

	/// The application-wide lifespan state bag (§4.13), read-only during request processing.
	pub fn app_state(&self) -> &http::Extensions {
		&self.extensions
	}

	/// Builds a minimal context with no body and the default size cap, for tests and for
	/// internally synthesized dispatches (e.g. CORS preflight).
	pub fn minimal(method: Method, path: impl Into<String>) -> Self {
		let request = Request::without_body(
			method,
			path.into(),
			String::new(),
			HeaderMap::new(),
			None,
			"http".to_owned(),
			DEFAULT_MAX_BODY_SIZE,
		);

		Self::new(request, Arc::new(http::Extensions::new()))
	}
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn body_reads_are_cached() {
		let request = Request::new(
			Method::POST,
			"/".to_owned(),
			String::new(),
			HeaderMap::new(),
			None,
			"http".to_owned(),
			Body::from(Bytes::from_static(b"hello")),
			Some(5),
			DEFAULT_MAX_BODY_SIZE,
		);

		assert_eq!(request.body().await.unwrap(), Bytes::from_static(b"hello"));
		assert_eq!(request.body().await.unwrap(), Bytes::from_static(b"hello"));
	}

	#[tokio::test]
	async fn oversized_declared_length_is_rejected_up_front() {
		let request = Request::new(
			Method::POST,
			"/".to_owned(),
			String::new(),
			HeaderMap::new(),
			None,
			"http".to_owned(),
			Body::from(Bytes::from_static(b"hello")),
			Some(100),
			10,
		);

		assert!(matches!(
			request.body().await,
			Err(ThorError::PayloadTooLarge)
		));
	}

	#[tokio::test]
	async fn empty_json_body_is_none() {
		let request = Request::without_body(
			Method::POST,
			"/".to_owned(),
			String::new(),
			HeaderMap::new(),
			None,
			"http".to_owned(),
			DEFAULT_MAX_BODY_SIZE,
		);

		let value: Option<serde_json::Value> = request.json().await.unwrap();
		assert!(value.is_none());
	}

	#[test]
	fn cookies_parse_lazily_and_cache() {
		let mut headers = HeaderMap::new();
		headers.insert("cookie", "a=1; b=2".parse().unwrap());

		let request = Request::without_body(
			Method::GET,
			"/".to_owned(),
			String::new(),
			headers,
			None,
			"http".to_owned(),
			DEFAULT_MAX_BODY_SIZE,
		);

		assert_eq!(request.cookie("a"), Some("1"));
		assert_eq!(request.cookie("b"), Some("2"));
	}
}
