//! The radix-tree router: typed path parameters, O(segments) lookup, reverse URL generation
//! (§4.3).
//!
//! Grounded on `original_source/src/thor/routing.py` for the matching semantics; the
//! segment/pattern vocabulary (`{name}` / `{name:type}`) takes its naming idiom from
//! `examples/argan-rs-argan/src/pattern/mod.rs`, though the data structure itself — a literal
//! radix tree rather than argan's regex-per-resource matcher — is this crate's own, since the
//! spec requires O(segments) lookup independent of the number of registered routes.

// ----------

use std::{
	collections::HashMap,
	sync::{OnceLock, RwLock},
};

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use regex::Regex;

use crate::{
	error::ThorError,
	handler::BoxHandler,
	request::{PathParamValue, PathParams},
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

// --------------------------------------------------
// ParamType

/// The path-parameter type grammar: `{name}` or `{name:type}` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
	Int,
	Str,
	Path,
	Uuid,
	Slug,
}

impl ParamType {
	fn from_name(name: &str) -> Option<Self> {
		match name {
			"int" => Some(Self::Int),
			"str" => Some(Self::Str),
			"path" => Some(Self::Path),
			"uuid" => Some(Self::Uuid),
			"slug" => Some(Self::Slug),
			_ => None,
		}
	}

	/// Whether `segment` satisfies this type's grammar (§4.3).
	fn matches(self, segment: &str) -> bool {
		match self {
			ParamType::Int => int_regex().is_match(segment),
			ParamType::Str => !segment.is_empty(),
			ParamType::Path => !segment.is_empty(),
			ParamType::Uuid => uuid_regex().is_match(segment),
			ParamType::Slug => slug_regex().is_match(segment),
		}
	}

	fn convert(self, segment: &str) -> Option<PathParamValue> {
		match self {
			ParamType::Int => segment.parse::<i64>().ok().map(PathParamValue::Int),
			_ => Some(PathParamValue::Str(segment.to_owned())),
		}
	}
}

fn int_regex() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"^\d+$").expect("valid regex"))
}

fn uuid_regex() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| {
		Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
			.expect("valid regex")
	})
}

fn slug_regex() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("valid regex"))
}

// --------------------------------------------------
// Segment

#[derive(Debug, Clone)]
enum Segment {
	Static(String),
	Param { name: String, param_type: ParamType },
}

/// A route registration failed: an unknown path-parameter type, or an otherwise malformed
/// template.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
	#[error("unknown path parameter type {0:?} in template {1:?}")]
	UnknownParamType(String, String),
	#[error("route named {0:?} not found")]
	NameNotFound(String),
	#[error("missing path parameter {0:?} for route {1:?}")]
	MissingParam(String, String),
}

fn parse_template(template: &str) -> Result<Vec<Segment>, RouteError> {
	let mut segments = Vec::new();

	for raw in template.split('/') {
		if raw.is_empty() {
			continue;
		}

		if let Some(inner) = raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
			let (name, some_type_name) = match inner.split_once(':') {
				Some((name, type_name)) => (name, Some(type_name)),
				None => (inner, None),
			};

			let param_type = match some_type_name {
				Some(type_name) => ParamType::from_name(type_name).ok_or_else(|| {
					RouteError::UnknownParamType(type_name.to_owned(), template.to_owned())
				})?,
				None => ParamType::Str,
			};

			segments.push(Segment::Param {
				name: name.to_owned(),
				param_type,
			});
		} else {
			segments.push(Segment::Static(raw.to_owned()));
		}
	}

	Ok(segments)
}

// --------------------------------------------------
// RouteMethod

/// A route-dispatch method token: an ordinary HTTP method, or the reserved `WEBSOCKET`
/// pseudo-method (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteMethod {
	Http(http::Method),
	WebSocket,
}

impl RouteMethod {
	pub fn from_http(method: &http::Method) -> Self {
		Self::Http(method.clone())
	}
}

// --------------------------------------------------
// Route

/// An immutable, registered route (§3).
pub struct Route {
	pub path_template: String,
	pub methods: Vec<RouteMethod>,
	pub name: Option<String>,
	segments: Vec<Segment>,
	pub handler: BoxHandler,
}

impl Route {
	fn methods_include(&self, method: &RouteMethod) -> bool {
		self.methods.iter().any(|m| m == method)
	}
}

/// An owned handle to a matched route, cheap to clone out of the tree before the read lock
/// guarding it is released (the `handler` is an `Arc`; the rest are small strings).
#[derive(Clone)]
pub struct RouteMatch {
	pub path_template: String,
	pub name: Option<String>,
	pub handler: BoxHandler,
}

impl From<&Route> for RouteMatch {
	fn from(route: &Route) -> Self {
		Self {
			path_template: route.path_template.clone(),
			name: route.name.clone(),
			handler: route.handler.clone(),
		}
	}
}

// --------------------------------------------------
// Radix tree node

#[derive(Default)]
struct Node {
	static_children: HashMap<String, Node>,
	param_child: Option<(String, ParamType, Box<Node>)>,
	terminal_routes: Vec<Route>,
}

impl Node {
	fn insert(&mut self, segments: &[Segment], route_index: usize, routes: &mut Vec<Option<Route>>) {
		match segments.split_first() {
			None => {
				let route = routes[route_index].take().expect("route taken once");
				self.terminal_routes.push(route);
			}
			Some((Segment::Static(literal), rest)) => {
				self
					.static_children
					.entry(literal.clone())
					.or_default()
					.insert(rest, route_index, routes);
			}
			Some((Segment::Param { name, param_type }, rest)) => {
				if self.param_child.is_none() {
					self.param_child = Some((name.clone(), *param_type, Box::new(Node::default())));
				}

				let (_, _, child) = self.param_child.as_mut().expect("just inserted");
				child.insert(rest, route_index, routes);
			}
		}
	}
}

enum LookupOutcome {
	Found {
		route: RouteMatch,
		params: PathParams,
	},
	MethodMismatch,
	NotFound,
}

fn lookup_node(node: &Node, segments: &[&str], method: &RouteMethod) -> LookupOutcome {
	match segments.split_first() {
		None => {
			if let Some(route) = node.terminal_routes.iter().find(|r| r.methods_include(method)) {
				LookupOutcome::Found {
					route: RouteMatch::from(route),
					params: PathParams::new(),
				}
			} else if node.terminal_routes.is_empty() {
				LookupOutcome::NotFound
			} else {
				LookupOutcome::MethodMismatch
			}
		}
		Some((first, rest)) => {
			let static_outcome = node
				.static_children
				.get(*first)
				.map(|child| lookup_node(child, rest, method));

			if let Some(LookupOutcome::Found { route, params }) = static_outcome {
				return LookupOutcome::Found { route, params };
			}

			let param_outcome = node.param_child.as_ref().and_then(|(name, param_type, child)| {
				if *param_type == ParamType::Path {
					// The `path` type consumes every remaining segment, including this one.
					let value = segments.join("/");
					if value.is_empty() {
						return None;
					}

					return Some(match child.terminal_routes.iter().find(|r| r.methods_include(method)) {
						Some(route) => {
							let mut params = PathParams::new();
							params.insert(name.clone(), PathParamValue::Str(value));
							LookupOutcome::Found {
								route: RouteMatch::from(route),
								params,
							}
						}
						None if child.terminal_routes.is_empty() => LookupOutcome::NotFound,
						None => LookupOutcome::MethodMismatch,
					});
				}

				if !param_type.matches(first) {
					return None;
				}

				let value = param_type.convert(first)?;
				let outcome = lookup_node(child, rest, method);

				Some(match outcome {
					LookupOutcome::Found { route, mut params } => {
						params.insert(name.clone(), value);
						LookupOutcome::Found { route, params }
					}
					other => other,
				})
			});

			match (static_outcome, param_outcome) {
				(_, Some(LookupOutcome::Found { route, params })) => {
					LookupOutcome::Found { route, params }
				}
				(Some(LookupOutcome::MethodMismatch), _) | (_, Some(LookupOutcome::MethodMismatch)) => {
					LookupOutcome::MethodMismatch
				}
				_ => LookupOutcome::NotFound,
			}
		}
	}
}

// --------------------------------------------------
// Router

/// The router: holds every registered route as a flat list plus a lazily (re)built radix tree.
///
/// Direct registration on the root router ([`Router::route`]) inserts incrementally into an
/// already-built tree. Mounting a sub-router ([`Router::mount`]) instead marks the tree dirty;
/// the next lookup rebuilds it from the flattened route list (§4.3).
pub struct Router {
	prefix: String,
	routes: Vec<(Vec<Segment>, RouteRegistration)>,
	tree: RwLock<Option<Node>>,
}

struct RouteRegistration {
	path_template: String,
	methods: Vec<RouteMethod>,
	name: Option<String>,
	handler: BoxHandler,
}

impl Default for Router {
	fn default() -> Self {
		Self::new()
	}
}

impl Router {
	pub fn new() -> Self {
		Self {
			prefix: String::new(),
			routes: Vec::new(),
			tree: RwLock::new(Some(Node::default())),
		}
	}

	pub fn with_prefix(prefix: impl Into<String>) -> Self {
		Self {
			prefix: prefix.into(),
			routes: Vec::new(),
			tree: RwLock::new(Some(Node::default())),
		}
	}

	/// Registers a route directly on this router, inserting incrementally if the tree is
	/// already built (§4.3).
	pub fn route(
		&mut self,
		path_template: &str,
		methods: Vec<RouteMethod>,
		handler: BoxHandler,
	) -> Result<(), RouteError> {
		self.route_named(path_template, methods, None, handler)
	}

	pub fn route_named(
		&mut self,
		path_template: &str,
		methods: Vec<RouteMethod>,
		name: Option<String>,
		handler: BoxHandler,
	) -> Result<(), RouteError> {
		let full_template = join_template(&self.prefix, path_template);
		let segments = parse_template(&full_template)?;

		let registration = RouteRegistration {
			path_template: full_template,
			methods,
			name,
			handler,
		};

		if let Some(tree) = self.tree.write().expect("router tree lock poisoned").as_mut() {
			let mut boxed = vec![Some(build_route(&registration, &segments))];
			tree.insert(&segments, 0, &mut boxed);
		}

		self.routes.push((segments, registration));

		Ok(())
	}

	/// Mounts `sub_router`'s routes under `prefix`, marking this router's tree dirty so the next
	/// lookup rebuilds it from the fully flattened route list (§4.3).
	pub fn mount(&mut self, prefix: &str, sub_router: Router) -> Result<(), RouteError> {
		for (_, registration) in sub_router.routes {
			let full_template = join_template(prefix, &registration.path_template);
			let segments = parse_template(&full_template)?;

			self.routes.push((
				segments,
				RouteRegistration {
					path_template: full_template,
					methods: registration.methods,
					name: registration.name,
					handler: registration.handler,
				},
			));
		}

		*self.tree.write().expect("router tree lock poisoned") = None;

		Ok(())
	}

	fn rebuild_if_dirty(&self) {
		let needs_rebuild = self.tree.read().expect("router tree lock poisoned").is_none();
		if !needs_rebuild {
			return;
		}

		let mut tree_guard = self.tree.write().expect("router tree lock poisoned");
		if tree_guard.is_some() {
			// Another writer rebuilt it while we waited for the lock.
			return;
		}

		let mut node = Node::default();
		for (segments, registration) in &self.routes {
			let route = build_route(registration, segments);
			let mut boxed = vec![Some(route)];
			node.insert(segments, 0, &mut boxed);
		}

		*tree_guard = Some(node);
	}

	/// Resolves `(path, method)` to a route and its typed path parameters (§4.3).
	pub fn lookup(
		&self,
		path: &str,
		method: &RouteMethod,
	) -> Result<(RouteMatch, PathParams), ThorError> {
		self.rebuild_if_dirty();

		let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

		let guard = self.tree.read().expect("router tree lock poisoned");
		let node = guard.as_ref().expect("tree rebuilt above");

		match lookup_node(node, &segments, method) {
			LookupOutcome::Found { route, params } => Ok((route, params)),
			LookupOutcome::MethodMismatch => Err(ThorError::MethodNotAllowed),
			LookupOutcome::NotFound => Err(ThorError::NotFound),
		}
	}

	/// Reverse URL generation: substitutes `{name}`/`{name:type}` placeholders in the named
	/// route's template with percent-encoded parameter values (§4.3).
	pub fn url_for(
		&self,
		name: &str,
		params: &HashMap<String, String>,
	) -> Result<String, RouteError> {
		let (segments, registration) = self
			.routes
			.iter()
			.find(|(_, registration)| registration.name.as_deref() == Some(name))
			.ok_or_else(|| RouteError::NameNotFound(name.to_owned()))?;

		let mut url = String::from("/");
		let mut first = true;

		for segment in segments {
			if !first {
				url.push('/');
			}
			first = false;

			match segment {
				Segment::Static(literal) => url.push_str(literal),
				Segment::Param { name: param_name, .. } => {
					let value = params.get(param_name).ok_or_else(|| {
						RouteError::MissingParam(param_name.clone(), registration.path_template.clone())
					})?;
					url.push_str(&utf8_percent_encode(value, NON_ALPHANUMERIC).to_string());
				}
			}
		}

		Ok(url)
	}
}

fn build_route(registration: &RouteRegistration, segments: &[Segment]) -> Route {
	Route {
		path_template: registration.path_template.clone(),
		methods: registration.methods.clone(),
		name: registration.name.clone(),
		segments: segments.to_vec(),
		handler: registration.handler.clone(),
	}
}

fn join_template(prefix: &str, template: &str) -> String {
	let prefix = prefix.trim_end_matches('/');
	let template = template.trim_start_matches('/');

	if prefix.is_empty() {
		format!("/{template}")
	} else if template.is_empty() {
		prefix.to_owned()
	} else {
		format!("{prefix}/{template}")
	}
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{handler::handler_fn, response::Response};

	fn noop_handler() -> BoxHandler {
		handler_fn(|_ctx| async move { Ok(Response::empty()) })
	}

	fn get(method: http::Method) -> RouteMethod {
		RouteMethod::Http(method)
	}

	#[test]
	fn static_route_beats_param_route_s1() {
		let mut router = Router::new();
		router
			.route("/users/me", vec![get(http::Method::GET)], noop_handler())
			.unwrap();
		router
			.route(
				"/users/{id:int}",
				vec![get(http::Method::GET)],
				noop_handler(),
			)
			.unwrap();

		let (route, params) = router
			.lookup("/users/me", &RouteMethod::Http(http::Method::GET))
			.unwrap();
		assert_eq!(route.path_template, "/users/me");
		assert!(params.is_empty());

		let (route, params) = router
			.lookup("/users/42", &RouteMethod::Http(http::Method::GET))
			.unwrap();
		assert_eq!(route.path_template, "/users/{id:int}");
		assert_eq!(params.get("id"), Some(&PathParamValue::Int(42)));

		let error = router
			.lookup("/users/me", &RouteMethod::Http(http::Method::POST))
			.unwrap_err();
		assert!(matches!(error, ThorError::MethodNotAllowed));

		let error = router
			.lookup("/users/abc", &RouteMethod::Http(http::Method::GET))
			.unwrap_err();
		assert!(matches!(error, ThorError::NotFound));
	}

	#[test]
	fn mounting_a_sub_router_rebuilds_the_tree() {
		let mut api = Router::with_prefix("/api");
		api
			.route("/ping", vec![get(http::Method::GET)], noop_handler())
			.unwrap();

		let mut root = Router::new();
		root.mount("", api).unwrap();

		let (route, _) = root
			.lookup("/api/ping", &RouteMethod::Http(http::Method::GET))
			.unwrap();
		assert_eq!(route.path_template, "/api/ping");
	}

	#[test]
	fn websocket_pseudo_method_is_distinct() {
		let mut router = Router::new();
		router
			.route("/ws", vec![RouteMethod::WebSocket], noop_handler())
			.unwrap();

		assert!(router.lookup("/ws", &RouteMethod::Http(http::Method::GET)).is_err());
		assert!(router.lookup("/ws", &RouteMethod::WebSocket).is_ok());
	}

	#[test]
	fn unknown_param_type_fails_registration() {
		let mut router = Router::new();
		let error = router
			.route(
				"/x/{id:blob}",
				vec![get(http::Method::GET)],
				noop_handler(),
			)
			.unwrap_err();
		assert!(matches!(error, RouteError::UnknownParamType(_, _)));
	}

	#[test]
	fn url_for_substitutes_params() {
		let mut router = Router::new();
		router
			.route_named(
				"/users/{id:int}",
				vec![get(http::Method::GET)],
				Some("user_detail".to_owned()),
				noop_handler(),
			)
			.unwrap();

		let mut params = HashMap::new();
		params.insert("id".to_owned(), "7".to_owned());

		assert_eq!(router.url_for("user_detail", &params).unwrap(), "/users/7");
	}

	#[test]
	fn path_type_consumes_remaining_segments() {
		let mut router = Router::new();
		router
			.route(
				"/files/{rest:path}",
				vec![get(http::Method::GET)],
				noop_handler(),
			)
			.unwrap();

		let (route, params) = router
			.lookup("/files/a/b/c.txt", &RouteMethod::Http(http::Method::GET))
			.unwrap();
		assert_eq!(route.path_template, "/files/{rest:path}");
		assert_eq!(
			params.get("rest"),
			Some(&PathParamValue::Str("a/b/c.txt".to_owned()))
		);
	}
}
