//! The handler trait and its boxed, type-erased form (§4.5, §9).
//!
//! Grounded on `examples/argan-rs-argan/src/handler/mod.rs`, simplified away from that module's
//! generic `Args<Ext>` extractor system per DESIGN.md: this crate re-architects the source's
//! keyword-argument handler signature into a single uniform `handler(context)` shape (§9), so a
//! handler is just an async function from [`RequestContext`] to a fallible [`Response`].

// ----------

use std::{future::Future, pin::Pin, sync::Arc};

use crate::{error::ThorError, request::RequestContext, response::Response};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// A boxed future, used throughout the crate instead of `async fn` in traits so that handlers
/// and middleware can be stored as trait objects.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The outcome of dispatching a request through a handler or middleware chain.
pub type HandlerResult = Result<Response, ThorError>;

// --------------------------------------------------
// Handler

/// A request handler: an async function from a shared [`RequestContext`] to a [`HandlerResult`].
///
/// The context is `Arc`-shared rather than consumed, because middleware needs to read back what
/// happened during the downstream call after it returns (the session mutated by a handler, the
/// CSRF token minted by an inner layer, the request id assigned by the error handler) in order to
/// finish the response it is wrapping (§4.5, §4.6, §4.7). Every field that changes over a
/// request's lifetime is therefore behind interior mutability on [`RequestContext`] itself.
///
/// Path-parameter type conversion has already happened by the time a handler runs (§9); the
/// context's `path_params` are typed values, not strings to be parsed again.
pub trait Handler: Send + Sync {
	fn call(&self, context: Arc<RequestContext>) -> BoxFuture<'static, HandlerResult>;
}

/// The type-erased, shareable form every route and middleware chain stores.
pub type BoxHandler = Arc<dyn Handler>;

// --------------------------------------------------
// HandlerFn

struct HandlerFn<F>(F);

impl<F, Fut> Handler for HandlerFn<F>
where
	F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = HandlerResult> + Send + 'static,
{
	fn call(&self, context: Arc<RequestContext>) -> BoxFuture<'static, HandlerResult> {
		Box::pin((self.0)(context))
	}
}

/// Wraps a plain async function into a [`BoxHandler`].
///
/// ```ignore
/// let handler = handler_fn(|ctx: Arc<RequestContext>| async move {
///     Ok(Response::text("hello"))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> BoxHandler
where
	F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = HandlerResult> + Send + 'static,
{
	Arc::new(HandlerFn(f))
}

// --------------------------------------------------
// Middleware

/// A middleware is a function from the downstream handler to a new, wrapping handler (§4.5).
///
/// The chain composer folds registered middleware over the terminal dispatch handler in reverse
/// registration order, so the first-added middleware ends up as the outermost wrapper.
pub type Middleware = Arc<dyn Fn(BoxHandler) -> BoxHandler + Send + Sync>;

/// Builds a [`Middleware`] value out of a plain closure, for readability at call sites.
pub fn middleware_fn<F>(f: F) -> Middleware
where
	F: Fn(BoxHandler) -> BoxHandler + Send + Sync + 'static,
{
	Arc::new(f)
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::response::Response;

	#[tokio::test]
	async fn handler_fn_calls_the_closure() {
		let handler = handler_fn(|_ctx| async move { Ok(Response::text("ok")) });
		let ctx = Arc::new(RequestContext::minimal(http::Method::GET, "/"));
		let response = handler.call(ctx).await.unwrap();
		assert_eq!(response.status(), http::StatusCode::OK);
	}
}
