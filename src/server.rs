//! Host transport adapter: binds a listener, drives hyper connections, and dispatches each one
//! through the composed middleware chain and router (§4.15).
//!
//! Grounded on `examples/argan-rs-argan/src/server.rs` for the accept-loop shape — racing
//! `Ctrl+C`/`SIGTERM` against `listener.accept()`, `hyper_util`'s `auto::Builder` +
//! `GracefulShutdown` watcher, the accept-error backoff — simplified to drop the teacher's `tls`
//! feature path (TLS termination is an explicit Non-goal, §1) and its `peer-addr` feature gate
//! (this crate always threads the peer address through, unconditionally). The lifecycle-manager
//! tie-in (§4.13) and the WebSocket-upgrade-detection-before-routing ordering (§4.15) are this
//! crate's own, per SPEC_FULL.md.

// ----------

use std::{
	convert::Infallible,
	future::Future,
	io::Error as IoError,
	net::{SocketAddr, ToSocketAddrs},
	pin::{pin, Pin},
	sync::Arc,
};

use bytes::Bytes;
use http::{Request as HttpRequest, Response as HttpResponse};
use http_body_util::combinators::BoxBody;
use hyper::{body::Incoming, service::Service as HyperService, upgrade::OnUpgrade};
use hyper_util::{
	rt::{TokioExecutor, TokioIo},
	server::{conn::auto::Builder, graceful::GracefulShutdown},
};
use tokio::net::TcpListener;

use crate::{
	app::App,
	body::Body,
	error::ThorError,
	handler::{handler_fn, BoxHandler},
	lifecycle::Lifecycle,
	middleware::{compose, error_handler::error_handler, logging::request_logging},
	request::{Request, RequestContext},
	response::Response,
	router::{RouteMethod, Router},
	websocket,
	BoxedError,
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Runs `app` against the host adapter, binding the first address `addr` resolves to and
/// blocking until shutdown completes (§4.15, §4.17).
pub async fn serve(app: App, addr: impl ToSocketAddrs) -> Result<(), ServerError> {
	let (router, middleware, lifecycle, config, app_state) = app.into_parts();

	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::new(config.tracing_filter.clone()))
		.try_init();

	let max_body_size = config.max_body_size;
	let shutdown_timeout = config.shutdown_timeout;

	let mut layers = Vec::with_capacity(middleware.len() + 2);
	layers.push(error_handler());
	layers.push(request_logging());
	layers.extend(middleware);

	let router = Arc::new(router);
	let terminal = dispatch_terminal(router.clone());
	let chain = compose(terminal, &layers);

	let lifecycle = Arc::new(lifecycle);

	lifecycle
		.run_startup()
		.await
		.map_err(ServerError::Startup)?;

	let mut addresses = addr.to_socket_addrs()?;
	let Some(listener) = (loop {
		let Some(candidate) = addresses.next() else {
			break None;
		};

		if let Ok(listener) = TcpListener::bind(candidate).await {
			break Some(listener);
		}
	}) else {
		return Err(ServerError::Bind);
	};

	let service = ThorService {
		chain,
		router,
		lifecycle: lifecycle.clone(),
		app_state,
		max_body_size,
		peer_addr: None,
	};

	let connection_builder = Builder::new(TokioExecutor::new());
	let graceful_shutdown_watcher = GracefulShutdown::new();

	let mut accept_error_count = 0;
	let mut pinned_ctrl_c = pin!(tokio::signal::ctrl_c());

	#[cfg(unix)]
	let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
		.map_err(ServerError::Io)?;
	#[cfg(unix)]
	let mut pinned_terminate = pin!(signal.recv());
	#[cfg(not(unix))]
	let mut pinned_terminate = pin!(std::future::pending::<()>());

	loop {
		tokio::select! {
			connection = listener.accept() => {
				match connection {
					Ok((stream, peer_address)) => {
						accept_error_count = 0;

						let mut per_connection_service = service.clone();
						per_connection_service.peer_addr = Some(peer_address);

						let connection = connection_builder
							.serve_connection_with_upgrades(TokioIo::new(stream), per_connection_service);
						let connection = graceful_shutdown_watcher.watch(connection.into_owned());

						tokio::spawn(connection);
					}
					Err(error) => {
						tokio::time::sleep(std::time::Duration::from_secs(1)).await;

						if accept_error_count < 3 {
							accept_error_count += 1;
							continue;
						}

						return Err(ServerError::from(error));
					}
				}
			},
			_ = pinned_ctrl_c.as_mut() => break,
			_ = pinned_terminate.as_mut() => break,
		}
	}

	tokio::join!(
		lifecycle.run_shutdown(),
		async {
			tokio::select! {
				_ = graceful_shutdown_watcher.shutdown() => {},
				_ = tokio::time::sleep(shutdown_timeout) => {},
			}
		},
	);

	Ok(())
}

// --------------------------------------------------
// ThorService

/// The `hyper::service::Service` binding realizing the host-adapter contract over hyper (§4.15,
/// §6): translates each inbound `http::Request<Incoming>` into the engine's [`Request`], detects
/// a WebSocket upgrade before the router's HTTP branch runs, and either dispatches it straight to
/// its route handler (bypassing the middleware chain entirely, per §4.5/§4.15) or drives an
/// ordinary HTTP request through the composed middleware chain; either way the resulting
/// [`Response`] is translated back.
#[derive(Clone)]
pub(crate) struct ThorService {
	pub(crate) chain: BoxHandler,
	pub(crate) router: Arc<Router>,
	pub(crate) lifecycle: Arc<Lifecycle>,
	pub(crate) app_state: Arc<http::Extensions>,
	pub(crate) max_body_size: usize,
	pub(crate) peer_addr: Option<SocketAddr>,
}

impl HyperService<HttpRequest<Incoming>> for ThorService {
	type Response = HttpResponse<BoxBody<Bytes, BoxedError>>;
	type Error = Infallible;
	type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

	fn call(&self, mut req: HttpRequest<Incoming>) -> Self::Future {
		let chain = self.chain.clone();
		let router = self.router.clone();
		let lifecycle = self.lifecycle.clone();
		let app_state = self.app_state.clone();
		let max_body_size = self.max_body_size;
		let peer_addr = self.peer_addr;

		let on_upgrade = req.extensions_mut().remove::<OnUpgrade>();

		Box::pin(async move {
			let _in_flight = lifecycle.enter();

			let (parts, incoming) = req.into_parts();

			let content_length = parts
				.headers
				.get(http::header::CONTENT_LENGTH)
				.and_then(|value| value.to_str().ok())
				.and_then(|value| value.parse::<usize>().ok());

			let query = parts.uri.query().unwrap_or("").to_owned();
			let path = parts.uri.path().to_owned();
			let scheme = parts.uri.scheme_str().unwrap_or("http").to_owned();
			let body = Body::new(incoming);

			let request = Request::new(
				parts.method,
				path,
				query,
				parts.headers,
				peer_addr,
				scheme,
				body,
				content_length,
				max_body_size,
			);

			let is_websocket = websocket::is_upgrade_request(&request);

			let ctx = Arc::new(RequestContext::new(request, app_state));
			if let Some(on_upgrade) = on_upgrade {
				ctx.set_websocket_upgrade(on_upgrade);
			}

			// A WebSocket handshake reaches the router directly and is handed to its route handler
			// without further middleware wrapping (§4.5, §4.15): none of the error handler, request
			// logging, CSRF, CORS, rate limiting, or timeout middleware ever see it.
			let response = if is_websocket {
				dispatch_websocket(&router, ctx).await
			} else {
				match chain.call(ctx).await {
					Ok(response) => response,
					Err(error) => {
						// The error handler is always the outermost layer (§4.6), so this arm is only
						// reached if a middleware was registered outside it by mistake; fail safe rather
						// than dropping the connection.
						tracing::error!(error = %error, "response escaped the error-handler middleware uncaught");
						Response::new(http::StatusCode::INTERNAL_SERVER_ERROR)
					}
				}
			};

			Ok(response.into_http_response())
		})
	}
}

/// Builds the terminal dispatch handler for ordinary HTTP requests: resolves `(path, method)`
/// against `router` (§4.3). WebSocket handshakes never reach this handler — they are intercepted
/// and dispatched by [`dispatch_websocket`] before the middleware chain is entered (§4.15).
pub(crate) fn dispatch_terminal(router: Arc<Router>) -> BoxHandler {
	handler_fn(move |ctx: Arc<RequestContext>| {
		let router = router.clone();

		async move {
			let method = RouteMethod::from_http(ctx.request.method());
			let (route, params) = router.lookup(ctx.request.path(), &method)?;

			ctx.set_path_params(params);
			route.handler.call(ctx).await
		}
	})
}

/// Resolves a WebSocket handshake against the router's `WEBSOCKET` pseudo-method and dispatches
/// it directly to the matched route handler, with no middleware chain wrapping it at all (§4.5,
/// §4.14, §4.15): a registered timeout, CSRF, CORS, rate-limit, or session middleware never runs
/// for a handshake. Emits the `close{code=1008}` response on an unmatched path rather than an
/// ordinary `not-found` JSON envelope, and a bare status response (no error-handler JSON envelope,
/// since that middleware is bypassed too) for any other error the lookup or handler raises.
async fn dispatch_websocket(router: &Router, ctx: Arc<RequestContext>) -> Response {
	let outcome = async {
		let (route, params) = router.lookup(ctx.request.path(), &RouteMethod::WebSocket)?;
		ctx.set_path_params(params);
		route.handler.call(ctx).await
	}
	.await;

	match outcome {
		Ok(response) => response,
		Err(ThorError::NotFound) => websocket::no_route_close_response(),
		Err(error) => {
			tracing::warn!(error = %error, "websocket handshake rejected");

			let mut response = Response::new(error.status_code());
			for (name, value) in error.extra_headers() {
				response.insert_header(name, value);
			}
			response
		}
	}
}

// --------------------------------------------------
// ServerError

/// Errors raised while binding or running the transport adapter (§4.15).
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
	#[error(transparent)]
	Io(#[from] IoError),
	#[error("no valid address with an unbound port was given")]
	Bind,
	#[error("startup hook failed: {0}")]
	Startup(BoxedError),
}

// --------------------------------------------------------------------------------
