//! Authentication: the authenticated-user view, three pluggable strategies, and access gates
//! (§4.8).
//!
//! Grounded on `original_source/src/thor/auth.py`, which defines the same token/session/basic
//! three-strategy split and the same gate-combinator style (`login_required`, scope checks) this
//! module follows; the middleware wrapping itself is grounded on
//! `examples/argan-rs-argan/src/middleware/mod.rs`.

// ----------

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};

use crate::{
	error::ThorError,
	handler::{BoxFuture, BoxHandler, Handler, Middleware},
	request::RequestContext,
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

// --------------------------------------------------
// AuthUser

/// The authenticated-identity view a handler reads through [`RequestContext::user`] (§4.8).
///
/// An unauthenticated request still gets a value — [`AuthUser::anonymous`] — rather than an
/// `Option`, so gate combinators and handlers have one type to branch on instead of two.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
	pub id: Option<String>,
	pub username: Option<String>,
	pub email: Option<String>,
	pub scopes: Vec<String>,
	pub is_authenticated: bool,
}

impl AuthUser {
	pub fn anonymous() -> Self {
		Self {
			id: None,
			username: None,
			email: None,
			scopes: Vec::new(),
			is_authenticated: false,
		}
	}

	pub fn authenticated(id: impl Into<String>) -> Self {
		Self {
			id: Some(id.into()),
			username: None,
			email: None,
			scopes: Vec::new(),
			is_authenticated: true,
		}
	}

	pub fn with_username(mut self, username: impl Into<String>) -> Self {
		self.username = Some(username.into());
		self
	}

	pub fn with_email(mut self, email: impl Into<String>) -> Self {
		self.email = Some(email.into());
		self
	}

	pub fn with_scopes(mut self, scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
		self.scopes = scopes.into_iter().map(Into::into).collect();
		self
	}

	pub fn has_scope(&self, scope: &str) -> bool {
		self.scopes.iter().any(|s| s == scope)
	}
}

impl Default for AuthUser {
	fn default() -> Self {
		Self::anonymous()
	}
}

// --------------------------------------------------
// AuthStrategy

/// A pluggable identity-resolution strategy (§4.8): given the incoming request, produce the
/// `AuthUser` it carries, or `None` for "this strategy found no credential to check".
///
/// A strategy returning `None` is not itself a failure — [`AuthMiddleware`] falls through to
/// [`AuthUser::anonymous`] when every configured strategy abstains. A strategy returning
/// `Some(Err(_))` means a credential was present but invalid, which the middleware does *not*
/// treat as fatal either; it still yields an anonymous user, leaving the decision of whether
/// authentication was required to [`login_required`] or [`require_scopes`] further down the
/// chain (§4.8's "absence of identity is not itself an error" rule).
pub trait AuthStrategy: Send + Sync {
	fn authenticate<'a>(
		&'a self,
		context: &'a RequestContext,
	) -> BoxFuture<'a, Option<Result<AuthUser, ThorError>>>;
}

// --------------------------------------------------
// TokenAuth

/// Verifies a bearer token from the `Authorization` header using an injected verifier function,
/// e.g. a JWT library call or a lookup against an API-key store (§4.8).
pub struct TokenAuth<V> {
	verify: V,
}

impl<V, Fut> TokenAuth<V>
where
	V: Fn(String) -> Fut + Send + Sync,
	Fut: std::future::Future<Output = Result<AuthUser, ThorError>> + Send,
{
	pub fn new(verify: V) -> Self {
		Self { verify }
	}
}

impl<V, Fut> AuthStrategy for TokenAuth<V>
where
	V: Fn(String) -> Fut + Send + Sync,
	Fut: std::future::Future<Output = Result<AuthUser, ThorError>> + Send,
{
	fn authenticate<'a>(
		&'a self,
		context: &'a RequestContext,
	) -> BoxFuture<'a, Option<Result<AuthUser, ThorError>>> {
		Box::pin(async move {
			let header = context.request.header("authorization")?;
			let token = header.strip_prefix("Bearer ")?.to_owned();

			Some((self.verify)(token).await)
		})
	}
}

// --------------------------------------------------
// SessionAuth

/// Resolves the user from the session already loaded onto the request by [`crate::session`]'s
/// middleware, via an injected `load_user` callback keyed on whatever id the session stores
/// (§4.8). Abstains entirely when there is no session, or the session carries no user id.
pub struct SessionAuth<L> {
	session_key: String,
	load_user: L,
}

impl<L, Fut> SessionAuth<L>
where
	L: Fn(String) -> Fut + Send + Sync,
	Fut: std::future::Future<Output = Result<AuthUser, ThorError>> + Send,
{
	pub fn new(load_user: L) -> Self {
		Self {
			session_key: "user_id".to_owned(),
			load_user,
		}
	}

	pub fn session_key(mut self, key: impl Into<String>) -> Self {
		self.session_key = key.into();
		self
	}
}

impl<L, Fut> AuthStrategy for SessionAuth<L>
where
	L: Fn(String) -> Fut + Send + Sync,
	Fut: std::future::Future<Output = Result<AuthUser, ThorError>> + Send,
{
	fn authenticate<'a>(
		&'a self,
		context: &'a RequestContext,
	) -> BoxFuture<'a, Option<Result<AuthUser, ThorError>>> {
		Box::pin(async move {
			let user_id = context.with_session(|session| {
				session
					.get(&self.session_key)
					.and_then(|value| value.as_str())
					.map(str::to_owned)
			})??;

			Some((self.load_user)(user_id).await)
		})
	}
}

// --------------------------------------------------
// BasicAuth

/// Verifies an `Authorization: Basic <base64>` header using an injected `verify_credentials`
/// callback (§4.8).
pub struct BasicAuth<V> {
	verify_credentials: V,
}

impl<V, Fut> BasicAuth<V>
where
	V: Fn(String, String) -> Fut + Send + Sync,
	Fut: std::future::Future<Output = Result<AuthUser, ThorError>> + Send,
{
	pub fn new(verify_credentials: V) -> Self {
		Self { verify_credentials }
	}
}

impl<V, Fut> AuthStrategy for BasicAuth<V>
where
	V: Fn(String, String) -> Fut + Send + Sync,
	Fut: std::future::Future<Output = Result<AuthUser, ThorError>> + Send,
{
	fn authenticate<'a>(
		&'a self,
		context: &'a RequestContext,
	) -> BoxFuture<'a, Option<Result<AuthUser, ThorError>>> {
		Box::pin(async move {
			let header = context.request.header("authorization")?;
			let encoded = header.strip_prefix("Basic ")?;
			let decoded = BASE64_STANDARD.decode(encoded).ok()?;
			let decoded = String::from_utf8(decoded).ok()?;
			let (username, password) = decoded.split_once(':')?;

			Some((self.verify_credentials)(username.to_owned(), password.to_owned()).await)
		})
	}
}

// --------------------------------------------------
// AuthMiddleware

/// Runs a sequence of strategies in order, taking the first that doesn't abstain, and attaches
/// the resulting (possibly anonymous) [`AuthUser`] to [`RequestContext`] (§4.8).
///
/// Paths in `exclude_paths` skip the middleware entirely, so e.g. a login endpoint never pays the
/// cost of probing every configured strategy.
pub struct AuthMiddleware {
	strategies: Vec<Arc<dyn AuthStrategy>>,
	exclude_paths: Vec<String>,
}

impl AuthMiddleware {
	pub fn new(strategies: Vec<Arc<dyn AuthStrategy>>) -> Self {
		Self {
			strategies,
			exclude_paths: Vec::new(),
		}
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
					if state.exclude_paths.iter().any(|p| p == ctx.request.path()) {
						return next.call(ctx).await;
					}

					let mut user = AuthUser::anonymous();
					for strategy in &state.strategies {
						if let Some(result) = strategy.authenticate(&ctx).await {
							user = result?;
							break;
						}
					}

					ctx.set_user(user);

					next.call(ctx).await
				}
			})
		})
	}
}

// --------------------------------------------------
// Gate combinators

/// Rejects an anonymous user with `401 Unauthorized` before the wrapped handler runs (§4.8).
pub fn login_required(next: BoxHandler) -> BoxHandler {
	crate::handler::handler_fn(move |ctx: Arc<RequestContext>| {
		let next = next.clone();

		async move {
			if !ctx.user().map(|u| u.is_authenticated).unwrap_or(false) {
				return Err(ThorError::unauthorized("authentication required"));
			}

			next.call(ctx).await
		}
	})
}

/// Rejects a user lacking any of `scopes` with `403 Forbidden`; implies [`login_required`] (§4.8).
pub fn require_scopes(
	scopes: impl IntoIterator<Item = impl Into<String>>,
) -> impl Fn(BoxHandler) -> BoxHandler + Clone {
	let scopes: Vec<String> = scopes.into_iter().map(Into::into).collect();

	move |next: BoxHandler| {
		let next = login_required(next);
		let scopes = scopes.clone();

		crate::handler::handler_fn(move |ctx: Arc<RequestContext>| {
			let next = next.clone();
			let scopes = scopes.clone();

			async move {
				let user = ctx.user().unwrap_or_default();
				if !scopes.iter().all(|scope| user.has_scope(scope)) {
					return Err(ThorError::forbidden("missing required scope"));
				}

				next.call(ctx).await
			}
		})
	}
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{handler::handler_fn, response::Response};

	fn ok_handler() -> BoxHandler {
		handler_fn(|_ctx| async move { Ok(Response::text("ok")) })
	}

	#[test]
	fn anonymous_has_no_scopes() {
		let user = AuthUser::anonymous();
		assert!(!user.is_authenticated);
		assert!(!user.has_scope("admin"));
	}

	#[tokio::test]
	async fn login_required_rejects_anonymous() {
		let handler = login_required(ok_handler());
		let ctx = Arc::new(RequestContext::minimal(http::Method::GET, "/"));

		let result = handler.call(ctx).await;
		assert!(matches!(result, Err(ThorError::Unauthorized(_))));
	}

	#[tokio::test]
	async fn login_required_admits_authenticated_user() {
		let handler = login_required(ok_handler());
		let ctx = Arc::new(RequestContext::minimal(http::Method::GET, "/"));
		ctx.set_user(AuthUser::authenticated("u1"));

		let result = handler.call(ctx).await;
		assert!(result.is_ok());
	}

	#[tokio::test]
	async fn require_scopes_rejects_missing_scope() {
		let gate = require_scopes(["admin"]);
		let handler = gate(ok_handler());
		let ctx = Arc::new(RequestContext::minimal(http::Method::GET, "/"));
		ctx.set_user(AuthUser::authenticated("u1").with_scopes(["read"]));

		let result = handler.call(ctx).await;
		assert!(matches!(result, Err(ThorError::Forbidden(_))));
	}

	#[tokio::test]
	async fn require_scopes_admits_matching_scope() {
		let gate = require_scopes(["admin"]);
		let handler = gate(ok_handler());
		let ctx = Arc::new(RequestContext::minimal(http::Method::GET, "/"));
		ctx.set_user(AuthUser::authenticated("u1").with_scopes(["admin"]));

		let result = handler.call(ctx).await;
		assert!(result.is_ok());
	}
}
