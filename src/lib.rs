#![doc = include_str!("../README.md")]
#![allow(dead_code)]

// ----------

pub mod app;
pub mod auth;
pub mod body;
pub mod config;
pub mod cookie;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod middleware;
pub mod multipart;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod session;
pub mod testing;
pub mod token;
pub mod websocket;

pub mod prelude {
	pub use crate::{
		app::App,
		error::ThorError,
		handler::{handler_fn, BoxHandler, Handler, HandlerResult},
		request::{PathParamValue, PathParams, Request, RequestContext},
		response::{IntoResponse, Response},
		router::RouteMethod,
	};
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// A type-erased error, used internally wherever a concrete error type would be noise.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

// --------------------------------------------------------------------------------
