//! The application facade: route/middleware/lifecycle registration and the `run()` entrypoint
//! (§4.17).
//!
//! Grounded on `original_source/src/thor/app.py` for the surface a user touches (route
//! registration, middleware registration, lifecycle hooks, `url_for`, `run`); delegates to
//! [`crate::router::Router`], [`crate::middleware::compose`], and [`crate::lifecycle::Lifecycle`]
//! rather than reimplementing any of their logic.

// ----------

use std::{collections::HashMap, future::Future, net::ToSocketAddrs, sync::Arc};

use http::Method;

use crate::{
	config::{AppConfig, ConfigError},
	handler::{handler_fn, HandlerResult, Middleware},
	lifecycle::Lifecycle,
	middleware::csrf::CsrfMiddleware,
	request::RequestContext,
	router::{RouteError, RouteMethod, Router},
	session::{SessionBackend, SessionMiddleware},
	token::{SecretKeyTooShort, TokenCodec},
	BoxedError,
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Errors raised while building or configuring an [`App`] (§4.17).
#[derive(Debug, thiserror::Error)]
pub enum AppError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error(transparent)]
	Route(#[from] RouteError),
	#[error(transparent)]
	SecretKey(#[from] SecretKeyTooShort),
	#[error("{0} requires a secret key; construct the application with `App::new` instead of `App::without_secret_key`")]
	MissingSecretKey(&'static str),
}

// --------------------------------------------------
// App

/// The application facade (§4.17).
pub struct App {
	router: Router,
	middleware: Vec<Middleware>,
	lifecycle: Lifecycle,
	config: AppConfig,
	token_codec: Option<Arc<TokenCodec>>,
	state: http::Extensions,
}

impl App {
	/// Builds an application signing everything (sessions, CSRF) with `secret_key`, validated to
	/// be at least [`crate::token::MIN_SECRET_KEY_LEN`] bytes (§4.17).
	pub fn new(secret_key: impl AsRef<[u8]>) -> Result<Self, AppError> {
		Self::from_config(AppConfig::load(Some(secret_key))?)
	}

	/// Builds an application with no signing key; [`App::with_session`] and [`App::with_csrf`]
	/// refuse to register on one of these (§4.17).
	pub fn without_secret_key() -> Result<Self, AppError> {
		Self::from_config(AppConfig::load(None::<&[u8]>)?)
	}

	/// Builds an application from an already-resolved [`AppConfig`], for callers that need to
	/// override defaults [`AppConfig::load`] wouldn't otherwise expose.
	pub fn from_config(config: AppConfig) -> Result<Self, AppError> {
		let token_codec = match &config.secret_key {
			Some(key) => Some(Arc::new(TokenCodec::new(key)?)),
			None => None,
		};

		Ok(Self {
			router: Router::new(),
			middleware: Vec::new(),
			lifecycle: Lifecycle::new(config.shutdown_timeout),
			config,
			token_codec,
			state: http::Extensions::new(),
		})
	}

	pub fn config(&self) -> &AppConfig {
		&self.config
	}

	fn require_secret_key(&self, feature: &'static str) -> Result<Arc<TokenCodec>, AppError> {
		self.token_codec.clone().ok_or(AppError::MissingSecretKey(feature))
	}

	/// Inserts a value into the process-wide lifespan state bag attached to every request
	/// context (§3, §4.13); the Rust counterpart of the source's free-form startup-populated
	/// dict, replaced per §9 with a typed `http::Extensions` insertion keyed by `T`'s type.
	///
	/// Call this before [`App::run`]; the bag is frozen (wrapped in an `Arc`) once the
	/// application is handed to the transport adapter, matching "populated during startup,
	/// read-only during request processing" (§5).
	pub fn set_state<T: Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
		self.state.insert(value);
		self
	}

	// --------------------------------------------------
	// Route registration

	pub fn route<F, Fut>(
		&mut self,
		path: &str,
		methods: impl IntoIterator<Item = Method>,
		handler: F,
	) -> Result<&mut Self, RouteError>
	where
		F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = HandlerResult> + Send + 'static,
	{
		let route_methods = methods.into_iter().map(RouteMethod::Http).collect();
		self.router.route(path, route_methods, handler_fn(handler))?;
		Ok(self)
	}

	pub fn get<F, Fut>(&mut self, path: &str, handler: F) -> Result<&mut Self, RouteError>
	where
		F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = HandlerResult> + Send + 'static,
	{
		self.route(path, [Method::GET], handler)
	}

	pub fn post<F, Fut>(&mut self, path: &str, handler: F) -> Result<&mut Self, RouteError>
	where
		F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = HandlerResult> + Send + 'static,
	{
		self.route(path, [Method::POST], handler)
	}

	pub fn put<F, Fut>(&mut self, path: &str, handler: F) -> Result<&mut Self, RouteError>
	where
		F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = HandlerResult> + Send + 'static,
	{
		self.route(path, [Method::PUT], handler)
	}

	pub fn patch<F, Fut>(&mut self, path: &str, handler: F) -> Result<&mut Self, RouteError>
	where
		F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = HandlerResult> + Send + 'static,
	{
		self.route(path, [Method::PATCH], handler)
	}

	pub fn delete<F, Fut>(&mut self, path: &str, handler: F) -> Result<&mut Self, RouteError>
	where
		F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = HandlerResult> + Send + 'static,
	{
		self.route(path, [Method::DELETE], handler)
	}

	/// Registers a WebSocket route, matched against the router's `WEBSOCKET` pseudo-method
	/// (§4.3, §4.14).
	pub fn websocket<F, Fut>(&mut self, path: &str, handler: F) -> Result<&mut Self, RouteError>
	where
		F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = HandlerResult> + Send + 'static,
	{
		self.router.route(path, vec![RouteMethod::WebSocket], handler_fn(handler))?;
		Ok(self)
	}

	/// Mounts `sub_router`'s routes under `prefix` (§4.3).
	pub fn mount(&mut self, prefix: &str, sub_router: Router) -> Result<&mut Self, RouteError> {
		self.router.mount(prefix, sub_router)?;
		Ok(self)
	}

	/// Reverse URL generation, delegating to the router (§4.3, §4.17).
	pub fn url_for(&self, name: &str, params: &HashMap<String, String>) -> Result<String, RouteError> {
		self.router.url_for(name, params)
	}

	// --------------------------------------------------
	// Middleware registration

	/// Registers a middleware layer, outermost among previously-registered layers (§4.5).
	///
	/// The error handler and request logger are always the two outermost layers regardless of
	/// registration order (§4.6, §4.16); this only orders user-registered layers relative to each
	/// other.
	pub fn middleware(&mut self, middleware: Middleware) -> &mut Self {
		self.middleware.push(middleware);
		self
	}

	/// Registers [`SessionMiddleware`] backed by `backend`, signing the session cookie with the
	/// application's secret key (§4.7, §4.17).
	pub fn with_session(&mut self, backend: Arc<dyn SessionBackend>) -> Result<&mut Self, AppError> {
		let codec = self.require_secret_key("session middleware")?;
		self.middleware.push(SessionMiddleware::new(backend, codec).build());
		Ok(self)
	}

	/// Like [`App::with_session`], but lets the caller further configure the middleware (cookie
	/// name, lifetime, cookie options) before it is built.
	pub fn with_session_configured(
		&mut self,
		backend: Arc<dyn SessionBackend>,
		configure: impl FnOnce(SessionMiddleware) -> SessionMiddleware,
	) -> Result<&mut Self, AppError> {
		let codec = self.require_secret_key("session middleware")?;
		self.middleware.push(configure(SessionMiddleware::new(backend, codec)).build());
		Ok(self)
	}

	/// Registers [`CsrfMiddleware`] with its defaults (§4.9, §4.17).
	///
	/// The secret key is required by this facade method per §4.17's construction-time rule, even
	/// though `CsrfMiddleware` itself takes no key (its double-submit-cookie check needs none; see
	/// DESIGN.md's Open Question note).
	pub fn with_csrf(&mut self) -> Result<&mut Self, AppError> {
		self.with_csrf_configured(CsrfMiddleware::new())
	}

	pub fn with_csrf_configured(&mut self, csrf: CsrfMiddleware) -> Result<&mut Self, AppError> {
		self.require_secret_key("CSRF middleware")?;
		self.middleware.push(csrf.build());
		Ok(self)
	}

	// --------------------------------------------------
	// Lifecycle registration

	pub fn on_startup<F, Fut>(&mut self, hook: F) -> &mut Self
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<(), BoxedError>> + Send + 'static,
	{
		self.lifecycle.on_startup(hook);
		self
	}

	pub fn on_shutdown<F, Fut>(&mut self, hook: F) -> &mut Self
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<(), BoxedError>> + Send + 'static,
	{
		self.lifecycle.on_shutdown(hook);
		self
	}

	// --------------------------------------------------
	// Dispatch / run

	/// Tears the application down into the pieces [`crate::server`] (and [`crate::testing`]) wire
	/// into a runnable dispatcher: the router, user-registered middleware (the error handler and
	/// request logger are added by the caller itself, always outermost, per §4.6/§4.16), the
	/// lifecycle manager, the resolved configuration, and the frozen lifespan state bag.
	pub(crate) fn into_parts(self) -> (Router, Vec<Middleware>, Lifecycle, AppConfig, Arc<http::Extensions>) {
		(
			self.router,
			self.middleware,
			self.lifecycle,
			self.config,
			Arc::new(self.state),
		)
	}

	/// Wires this application into the host transport adapter and blocks until shutdown completes
	/// (§4.15, §4.17).
	///
	/// `addr` overrides [`AppConfig::bind`] for this call, the way the teacher's own `Server::serve`
	/// takes its listener addresses as a parameter rather than baking them into the builder.
	pub async fn run(self, addr: impl ToSocketAddrs) -> Result<(), crate::server::ServerError> {
		crate::server::serve(self, addr).await
	}
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::response::Response;

	#[test]
	fn new_rejects_short_secret_keys() {
		assert!(matches!(App::new("short"), Err(AppError::SecretKey(_))));
	}

	#[test]
	fn session_without_secret_key_is_rejected() {
		let mut app = App::without_secret_key().unwrap();
		let backend = Arc::new(crate::session::InMemorySessionBackend::new());
		assert!(matches!(
			app.with_session(backend),
			Err(AppError::MissingSecretKey(_))
		));
	}

	#[test]
	fn session_with_secret_key_succeeds() {
		let mut app = App::new("0123456789abcdef").unwrap();
		let backend = Arc::new(crate::session::InMemorySessionBackend::new());
		assert!(app.with_session(backend).is_ok());
	}

	#[test]
	fn route_registration_is_queryable_through_the_router() {
		let mut app = App::new("0123456789abcdef").unwrap();
		app
			.get("/ping", |_ctx| async move { Ok(Response::text("pong")) })
			.unwrap();

		let (route, _) = app
			.router
			.lookup("/ping", &RouteMethod::Http(Method::GET))
			.unwrap();
		assert_eq!(route.path_template, "/ping");
	}
}
