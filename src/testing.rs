//! In-process test client: drives a built [`App`] straight through its composed middleware chain
//! and router, without touching a socket (§4.18).
//!
//! Grounded on `examples/argan-rs-argan/src/handler/mod.rs`'s `HandlerService` adapter for wiring
//! a [`crate::handler::Handler`] behind `tower_service::Service`; this module is the one place
//! besides [`crate::server`] that needs to actually drive the composed chain, so it is built the
//! same way the teacher turns a handler into a pollable service rather than calling `Handler::call`
//! directly.

// ----------

use std::{net::SocketAddr, sync::Arc, task::Poll};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use http_body_util::BodyExt;
use serde::{de::DeserializeOwned, Serialize};
use tower_service::Service as TowerService;

use crate::{
	app::App,
	body::Body,
	handler::{BoxFuture, BoxHandler},
	middleware::{compose, error_handler::error_handler, logging::request_logging},
	request::{Request, RequestContext},
	response::Response,
	server::dispatch_terminal,
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Adapts a composed [`BoxHandler`] chain to `tower_service::Service`, the way the teacher's own
/// `HandlerService` adapts a single [`crate::handler::Handler`] (`examples/argan-rs-argan/src/handler/mod.rs`).
///
/// Readiness is unconditional: nothing behind this chain does its own backpressure, so
/// `poll_ready` always resolves immediately, matching the teacher's `HandlerService::poll_ready`.
struct ChainService(BoxHandler);

impl TowerService<Arc<RequestContext>> for ChainService {
	type Response = Response;
	type Error = crate::error::ThorError;
	type Future = BoxFuture<'static, Result<Response, crate::error::ThorError>>;

	fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, ctx: Arc<RequestContext>) -> Self::Future {
		self.0.call(ctx)
	}
}

// --------------------------------------------------
// TestClient

/// Drives requests through an [`App`]'s middleware chain and router directly, bypassing
/// [`crate::server`] and any real TCP connection (§4.18).
///
/// The error handler and request logger are added exactly where [`crate::server::serve`] adds
/// them — always outermost, ahead of any user-registered middleware — so a test observes the same
/// response an end-to-end client would.
pub struct TestClient {
	chain: BoxHandler,
	app_state: Arc<http::Extensions>,
	max_body_size: usize,
}

impl TestClient {
	/// Builds a client from a fully-configured `app`, consuming it the same way [`App::run`] does.
	pub fn new(app: App) -> Self {
		let (router, middleware, _lifecycle, config, app_state) = app.into_parts();

		let mut layers = Vec::with_capacity(middleware.len() + 2);
		layers.push(error_handler());
		layers.push(request_logging());
		layers.extend(middleware);

		let terminal = dispatch_terminal(Arc::new(router));
		let chain = compose(terminal, &layers);

		Self {
			chain,
			app_state,
			max_body_size: config.max_body_size,
		}
	}

	pub fn get(&self, path: impl Into<String>) -> TestRequest<'_> {
		self.request(Method::GET, path)
	}

	pub fn post(&self, path: impl Into<String>) -> TestRequest<'_> {
		self.request(Method::POST, path)
	}

	pub fn put(&self, path: impl Into<String>) -> TestRequest<'_> {
		self.request(Method::PUT, path)
	}

	pub fn patch(&self, path: impl Into<String>) -> TestRequest<'_> {
		self.request(Method::PATCH, path)
	}

	pub fn delete(&self, path: impl Into<String>) -> TestRequest<'_> {
		self.request(Method::DELETE, path)
	}

	pub fn request(&self, method: Method, path: impl Into<String>) -> TestRequest<'_> {
		TestRequest {
			client: self,
			method,
			path: path.into(),
			query: String::new(),
			headers: HeaderMap::new(),
			body: Bytes::new(),
			client_addr: None,
		}
	}

	async fn dispatch(&self, ctx: Arc<RequestContext>) -> Response {
		let mut service = ChainService(self.chain.clone());

		std::future::poll_fn(|cx| TowerService::poll_ready(&mut service, cx))
			.await
			.expect("ChainService::poll_ready never fails");

		// The error-handler layer is always the outermost wrapper, so it has already turned any
		// `ThorError` into a response by the time it reaches here (§4.6).
		TowerService::call(&mut service, ctx)
			.await
			.expect("error_handler never lets a ThorError escape")
	}
}

// --------------------------------------------------
// TestRequest

/// A request under construction, built fluently before [`TestRequest::send`] dispatches it.
pub struct TestRequest<'a> {
	client: &'a TestClient,
	method: Method,
	path: String,
	query: String,
	headers: HeaderMap,
	body: Bytes,
	client_addr: Option<SocketAddr>,
}

impl<'a> TestRequest<'a> {
	pub fn query(mut self, query: impl Into<String>) -> Self {
		self.query = query.into();
		self
	}

	pub fn header(mut self, name: &str, value: &str) -> Self {
		if let (Ok(name), Ok(value)) = (
			HeaderName::from_bytes(name.as_bytes()),
			HeaderValue::from_str(value),
		) {
			self.headers.append(name, value);
		}
		self
	}

	/// Appends one `name=value` pair to the request's `Cookie` header (§4.2).
	pub fn cookie(mut self, name: &str, value: &str) -> Self {
		let pair = format!("{name}={value}");
		let combined = match self.headers.get(http::header::COOKIE).and_then(|v| v.to_str().ok()) {
			Some(existing) => format!("{existing}; {pair}"),
			None => pair,
		};

		if let Ok(value) = HeaderValue::from_str(&combined) {
			self.headers.insert(http::header::COOKIE, value);
		}
		self
	}

	pub fn client_addr(mut self, addr: SocketAddr) -> Self {
		self.client_addr = Some(addr);
		self
	}

	pub fn body(mut self, body: impl Into<Bytes>) -> Self {
		self.body = body.into();
		self
	}

	/// Serializes `value` as the JSON request body, setting `Content-Type` to match (§4.4).
	pub fn json<T: Serialize>(mut self, value: &T) -> Self {
		let bytes = serde_json::to_vec(value).expect("value serializes as JSON");
		self.headers.insert(
			http::header::CONTENT_TYPE,
			HeaderValue::from_static("application/json"),
		);
		self.body = Bytes::from(bytes);
		self
	}

	/// Sends a URL-encoded form request body, setting `Content-Type` to match (§4.4).
	pub fn form(mut self, pairs: &[(&str, &str)]) -> Self {
		let encoded = serde_urlencoded::to_string(pairs).expect("pairs encode as a urlencoded form");
		self.headers.insert(
			http::header::CONTENT_TYPE,
			HeaderValue::from_static("application/x-www-form-urlencoded"),
		);
		self.body = Bytes::from(encoded);
		self
	}

	pub async fn send(self) -> TestResponse {
		let content_length = Some(self.body.len());

		let request = Request::new(
			self.method,
			self.path,
			self.query,
			self.headers,
			self.client_addr,
			"http".to_owned(),
			Body::from(self.body),
			content_length,
			self.client.max_body_size,
		);

		let ctx = Arc::new(RequestContext::new(request, self.client.app_state.clone()));
		let response = self.client.dispatch(ctx).await;

		TestResponse(response)
	}
}

// --------------------------------------------------
// TestResponse

/// The outcome of dispatching a [`TestRequest`], offering assertion-friendly accessors over the
/// engine's [`Response`] (§4.18).
pub struct TestResponse(Response);

impl TestResponse {
	pub fn status(&self) -> StatusCode {
		self.0.status()
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		self.0.headers().get(name).and_then(|value| value.to_str().ok())
	}

	/// The raw, un-parsed `Set-Cookie` header values queued on the response, in registration order.
	pub fn set_cookies(&self) -> &[String] {
		self.0.cookies()
	}

	/// Reads the full response body. Consumes the response, matching [`Response::body`].
	pub async fn bytes(self) -> Bytes {
		self
			.0
			.body()
			.collect()
			.await
			.expect("test response bodies never fail mid-stream")
			.to_bytes()
	}

	pub async fn text(self) -> String {
		String::from_utf8_lossy(&self.bytes().await).into_owned()
	}

	pub async fn json<T: DeserializeOwned>(self) -> T {
		let bytes = self.bytes().await;
		serde_json::from_slice(&bytes).expect("response body is valid JSON for the expected type")
	}
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::app::App;

	fn test_app() -> App {
		let mut app = App::new("0123456789abcdef").unwrap();
		app
			.get("/ping", |_ctx| async move { Ok(Response::text("pong")) })
			.unwrap();
		app
			.post("/echo", |ctx: Arc<RequestContext>| async move {
				let body = ctx.request.body().await?;
				Ok(Response::text(String::from_utf8_lossy(&body).into_owned()))
			})
			.unwrap();
		app
			.get("/boom", |_ctx| async move {
				Err(crate::error::ThorError::bad_request("nope"))
			})
			.unwrap();

		app
	}

	#[tokio::test]
	async fn dispatches_a_matching_route() {
		let client = TestClient::new(test_app());
		let response = client.get("/ping").send().await;

		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(response.text().await, "pong");
	}

	#[tokio::test]
	async fn not_found_gets_the_error_envelope() {
		let client = TestClient::new(test_app());
		let response = client.get("/does-not-exist").send().await;

		assert_eq!(response.status(), StatusCode::NOT_FOUND);
		assert!(response.header("x-request-id").is_some());
	}

	#[tokio::test]
	async fn request_body_round_trips() {
		let client = TestClient::new(test_app());
		let response = client.post("/echo").body(Bytes::from_static(b"hello")).send().await;

		assert_eq!(response.text().await, "hello");
	}

	#[tokio::test]
	async fn handler_errors_become_json_envelopes() {
		let client = TestClient::new(test_app());
		let response = client.get("/boom").send().await;

		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
		let body: serde_json::Value = response.json().await;
		assert_eq!(body["error"], "nope");
	}

	/// End-to-end routing scenario (§8 S1): a static route wins over a parametric one sharing its
	/// prefix, the typed `{id:int}` segment converts before the handler runs, an unsupported method
	/// on a matched path is a 405, and an unmatched path is a 404.
	#[tokio::test]
	async fn typed_routes_dispatch_and_reject_correctly() {
		let mut app = App::new("0123456789abcdef").unwrap();
		app
			.get("/users/me", |_ctx| async move { Ok(Response::text("me")) })
			.unwrap();
		app
			.get("/users/{id:int}", |ctx: Arc<RequestContext>| async move {
				let id = ctx.path_params().get("id").and_then(|v| v.as_int()).unwrap();
				Ok(Response::text(id.to_string()))
			})
			.unwrap();

		let client = TestClient::new(app);

		let me = client.get("/users/me").send().await;
		assert_eq!(me.status(), StatusCode::OK);
		assert_eq!(me.text().await, "me");

		let by_id = client.get("/users/42").send().await;
		assert_eq!(by_id.status(), StatusCode::OK);
		assert_eq!(by_id.text().await, "42");

		let wrong_method = client.post("/users/me").send().await;
		assert_eq!(wrong_method.status(), StatusCode::METHOD_NOT_ALLOWED);

		let wrong_type = client.get("/users/abc").send().await;
		assert_eq!(wrong_type.status(), StatusCode::NOT_FOUND);
	}

	/// End-to-end session round-trip scenario (§8 S4): a handler writes to the session, the
	/// response carries the signed cookie, and a subsequent request presenting that cookie reaches
	/// a handler that reads the same value back.
	#[tokio::test]
	async fn session_value_round_trips_across_requests() {
		let mut app = App::new("0123456789abcdef").unwrap();
		let backend = Arc::new(crate::session::InMemorySessionBackend::new());
		app.with_session(backend).unwrap();
		app
			.post("/login", |ctx: Arc<RequestContext>| async move {
				ctx.with_session(|session| session.set("uid", 7));
				Ok(Response::text("logged in"))
			})
			.unwrap();
		app
			.get("/whoami", |ctx: Arc<RequestContext>| async move {
				let uid = ctx
					.with_session(|session| session.get("uid").cloned())
					.flatten()
					.unwrap_or(serde_json::Value::Null);
				Ok(Response::json(&uid).unwrap())
			})
			.unwrap();

		let client = TestClient::new(app);

		let login = client.post("/login").send().await;
		assert_eq!(login.status(), StatusCode::OK);
		let session_cookie = login
			.set_cookies()
			.iter()
			.find(|c| c.starts_with("thor_session="))
			.and_then(|c| c.split(';').next())
			.and_then(|pair| pair.split_once('='))
			.map(|(_, value)| value.to_owned())
			.expect("login response sets a session cookie");

		let whoami = client
			.get("/whoami")
			.cookie("thor_session", &session_cookie)
			.send()
			.await;
		assert_eq!(whoami.status(), StatusCode::OK);
		let uid: serde_json::Value = whoami.json().await;
		assert_eq!(uid, serde_json::json!(7));
	}
}
