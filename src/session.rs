//! Server-side sessions: the session view, the pluggable backend trait, and two backends (§4.7).
//!
//! Grounded on `original_source/src/thor/session.py` for the data model (a created/accessed
//! timestamp pair plus a flash sub-map) and on `examples/argan-rs-argan/src/middleware/mod.rs`
//! for the function-wrapping middleware shape this module's [`SessionMiddleware`] follows.

// ----------

use std::{
	collections::HashMap,
	path::PathBuf,
	sync::Arc,
	time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
	cookie::CookieOptions,
	error::ThorError,
	handler::{BoxFuture, BoxHandler, Handler, Middleware},
	request::RequestContext,
	token::TokenCodec,
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const FLASH_KEY: &str = "_flash";

/// Default lifetime of both the session cookie and the stored record (14 days, §4.7).
pub const DEFAULT_SESSION_LIFETIME: Duration = Duration::from_secs(14 * 24 * 60 * 60);

fn now_unix() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
}

// --------------------------------------------------
// SessionRecord

/// The durable, backend-stored form of a session: data plus the two timestamps (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
	pub data: HashMap<String, Value>,
	pub created_at: u64,
	pub accessed_at: u64,
}

impl SessionRecord {
	fn fresh() -> Self {
		let now = now_unix();
		Self {
			data: HashMap::new(),
			created_at: now,
			accessed_at: now,
		}
	}
}

// --------------------------------------------------
// Session

/// The per-request session view a handler reads and writes through [`RequestContext`] (§4.7).
///
/// `is_new` is true for a session minted this request (no valid cookie, or a cookie whose token
/// failed to verify); `modified` tracks whether anything changed that needs to be written back
/// and re-cookied when the request finishes.
#[derive(Debug, Clone)]
pub struct Session {
	id: String,
	record: SessionRecord,
	is_new: bool,
	modified: bool,
}

impl Session {
	fn new(id: String, record: SessionRecord, is_new: bool) -> Self {
		Self {
			id,
			record,
			is_new,
			modified: is_new,
		}
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn is_new(&self) -> bool {
		self.is_new
	}

	pub fn is_modified(&self) -> bool {
		self.modified
	}

	pub fn created_at(&self) -> u64 {
		self.record.created_at
	}

	pub fn accessed_at(&self) -> u64 {
		self.record.accessed_at
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.record.data.get(key)
	}

	pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
		self.record.data.insert(key.into(), value.into());
		self.modified = true;
	}

	pub fn remove(&mut self, key: &str) -> Option<Value> {
		let removed = self.record.data.remove(key);
		if removed.is_some() {
			self.modified = true;
		}

		removed
	}

	pub fn clear(&mut self) {
		if !self.record.data.is_empty() {
			self.record.data.clear();
			self.modified = true;
		}
	}

	/// Queues a one-shot value, readable exactly once by the next request's [`Session::get_flash`]
	/// (§4.7).
	pub fn flash(&mut self, key: impl Into<String>, value: impl Into<Value>) {
		let bucket = self
			.record
			.data
			.entry(FLASH_KEY.to_owned())
			.or_insert_with(|| Value::Object(Default::default()));

		if let Value::Object(map) = bucket {
			map.insert(key.into(), value.into());
			self.modified = true;
		}
	}

	/// Reads and removes a flashed value set during a prior request.
	pub fn get_flash(&mut self, key: &str) -> Option<Value> {
		let Some(Value::Object(map)) = self.record.data.get_mut(FLASH_KEY) else {
			return None;
		};

		let value = map.remove(key);
		if value.is_some() {
			self.modified = true;
		}

		value
	}

	fn record(&self) -> &SessionRecord {
		&self.record
	}
}

// --------------------------------------------------
// SessionBackend

/// Storage interface a session backend implements: load, save, delete, and periodic cleanup
/// (§4.7).
pub trait SessionBackend: Send + Sync {
	fn load<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<SessionRecord>>;

	fn save<'a>(&'a self, id: &'a str, record: &'a SessionRecord) -> BoxFuture<'a, Result<(), ThorError>>;

	fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), ThorError>>;

	/// Removes records whose `accessed_at` is older than `max_age`, for a backend whose storage
	/// doesn't expire entries on its own.
	fn cleanup(&self, max_age: Duration) -> BoxFuture<'_, Result<(), ThorError>>;
}

// --------------------------------------------------
// InMemorySessionBackend

/// A mutex-guarded in-process session store; sessions do not survive a restart (§4.7).
#[derive(Default)]
pub struct InMemorySessionBackend {
	records: Mutex<HashMap<String, SessionRecord>>,
}

impl InMemorySessionBackend {
	pub fn new() -> Self {
		Self::default()
	}
}

impl SessionBackend for InMemorySessionBackend {
	fn load<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<SessionRecord>> {
		Box::pin(async move { self.records.lock().get(id).cloned() })
	}

	fn save<'a>(&'a self, id: &'a str, record: &'a SessionRecord) -> BoxFuture<'a, Result<(), ThorError>> {
		Box::pin(async move {
			self.records.lock().insert(id.to_owned(), record.clone());
			Ok(())
		})
	}

	fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), ThorError>> {
		Box::pin(async move {
			self.records.lock().remove(id);
			Ok(())
		})
	}

	fn cleanup(&self, max_age: Duration) -> BoxFuture<'_, Result<(), ThorError>> {
		Box::pin(async move {
			let cutoff = now_unix().saturating_sub(max_age.as_secs());
			self.records.lock().retain(|_, record| record.accessed_at >= cutoff);
			Ok(())
		})
	}
}

// --------------------------------------------------
// FileSessionBackend

/// An atomic-file session store: one JSON file per session id, under a directory, written via a
/// write-temp-then-rename so a reader never observes a half-written record (§4.7).
pub struct FileSessionBackend {
	directory: PathBuf,
}

impl FileSessionBackend {
	pub fn new(directory: impl Into<PathBuf>) -> Self {
		Self {
			directory: directory.into(),
		}
	}

	/// Rejects anything but a plain alphanumeric id, so a forged cookie can never walk the session
	/// id out of `directory` (`../../etc/passwd` style traversal).
	fn path_for(&self, id: &str) -> Option<PathBuf> {
		if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
			return None;
		}

		Some(self.directory.join(format!("{id}.json")))
	}
}

impl SessionBackend for FileSessionBackend {
	fn load<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<SessionRecord>> {
		Box::pin(async move {
			let path = self.path_for(id)?;
			let bytes = tokio::fs::read(&path).await.ok()?;

			serde_json::from_slice(&bytes).ok()
		})
	}

	fn save<'a>(&'a self, id: &'a str, record: &'a SessionRecord) -> BoxFuture<'a, Result<(), ThorError>> {
		Box::pin(async move {
			let path = self
				.path_for(id)
				.ok_or_else(|| ThorError::bad_request("invalid session id"))?;

			tokio::fs::create_dir_all(&self.directory)
				.await
				.map_err(ThorError::internal)?;

			let tmp_path = path.with_extension("json.tmp");
			let bytes = serde_json::to_vec(record).map_err(ThorError::internal)?;

			tokio::fs::write(&tmp_path, &bytes).await.map_err(ThorError::internal)?;
			tokio::fs::rename(&tmp_path, &path).await.map_err(ThorError::internal)?;

			Ok(())
		})
	}

	fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), ThorError>> {
		Box::pin(async move {
			if let Some(path) = self.path_for(id) {
				match tokio::fs::remove_file(&path).await {
					Ok(()) => Ok(()),
					Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
					Err(error) => Err(ThorError::internal(error)),
				}
			} else {
				Ok(())
			}
		})
	}

	fn cleanup(&self, max_age: Duration) -> BoxFuture<'_, Result<(), ThorError>> {
		Box::pin(async move {
			let cutoff = now_unix().saturating_sub(max_age.as_secs());

			let mut entries = match tokio::fs::read_dir(&self.directory).await {
				Ok(entries) => entries,
				Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
				Err(error) => return Err(ThorError::internal(error)),
			};

			while let Some(entry) = entries.next_entry().await.map_err(ThorError::internal)? {
				let path = entry.path();
				if path.extension().and_then(|e| e.to_str()) != Some("json") {
					continue;
				}

				if let Ok(bytes) = tokio::fs::read(&path).await {
					if let Ok(record) = serde_json::from_slice::<SessionRecord>(&bytes) {
						if record.accessed_at < cutoff {
							tokio::fs::remove_file(&path).await.ok();
						}
					}
				}
			}

			Ok(())
		})
	}
}

// --------------------------------------------------
// SessionMiddleware

fn generate_session_id() -> String {
	use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
	use rand::Rng;

	let bytes: [u8; 32] = rand::thread_rng().gen();
	URL_SAFE_NO_PAD.encode(bytes)
}

/// Configuration for [`SessionMiddleware`]: the cookie it reads/writes, the backend it persists
/// to, and the token codec used to sign the cookie's session id (§4.7).
pub struct SessionMiddleware {
	backend: Arc<dyn SessionBackend>,
	codec: Arc<TokenCodec>,
	cookie_name: String,
	lifetime: Duration,
	cookie_options: CookieOptions,
}

impl SessionMiddleware {
	pub fn new(backend: Arc<dyn SessionBackend>, codec: Arc<TokenCodec>) -> Self {
		Self {
			backend,
			codec,
			cookie_name: "thor_session".to_owned(),
			lifetime: DEFAULT_SESSION_LIFETIME,
			cookie_options: CookieOptions::default().with_max_age(DEFAULT_SESSION_LIFETIME),
		}
	}

	pub fn cookie_name(mut self, name: impl Into<String>) -> Self {
		self.cookie_name = name.into();
		self
	}

	pub fn lifetime(mut self, lifetime: Duration) -> Self {
		self.lifetime = lifetime;
		self
	}

	pub fn cookie_options(mut self, options: CookieOptions) -> Self {
		self.cookie_options = options;
		self
	}

	/// Builds the [`Middleware`] value; register with the application's middleware chain (§4.5).
	pub fn build(self) -> Middleware {
		let state = Arc::new(self);

		crate::handler::middleware_fn(move |next: BoxHandler| {
			let state = state.clone();

			crate::handler::handler_fn(move |ctx: Arc<RequestContext>| {
				let state = state.clone();
				let next = next.clone();

				async move {
					let cookie_token = ctx.request.cookie(&state.cookie_name).map(str::to_owned);

					let (id, record, is_new) = match cookie_token
						.as_deref()
						.and_then(|token| state.codec.unsign(token, Some(state.lifetime)))
					{
						Some(id) => match state.backend.load(&id).await {
							Some(mut record) => {
								record.accessed_at = now_unix();
								(id, record, false)
							}
							None => (generate_session_id(), SessionRecord::fresh(), true),
						},
						None => (generate_session_id(), SessionRecord::fresh(), true),
					};

					ctx.set_session(Session::new(id, record, is_new));

					let response = next.call(ctx.clone()).await;

					let Some(mut session) = ctx.take_session() else {
						return response;
					};

					let mut response = response?;

					if session.is_modified() || session.is_new() {
						session.record.accessed_at = now_unix();
						state.backend.save(&session.id, session.record()).await?;

						let signed = state.codec.sign(&session.id);
						response.set_cookie(&state.cookie_name, &signed, &state.cookie_options);
					}

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

	#[test]
	fn flash_is_read_once() {
		let mut session = Session::new("id".to_owned(), SessionRecord::fresh(), true);
		session.flash("notice", "saved");

		assert_eq!(session.get_flash("notice"), Some(Value::String("saved".to_owned())));
		assert_eq!(session.get_flash("notice"), None);
	}

	#[test]
	fn set_marks_modified() {
		let mut session = Session::new("id".to_owned(), SessionRecord::fresh(), false);
		assert!(!session.is_modified());
		session.set("views", 1);
		assert!(session.is_modified());
	}

	#[tokio::test]
	async fn in_memory_backend_round_trips() {
		let backend = InMemorySessionBackend::new();
		let record = SessionRecord::fresh();
		backend.save("abc", &record).await.unwrap();

		let loaded = backend.load("abc").await.unwrap();
		assert_eq!(loaded.created_at, record.created_at);

		backend.delete("abc").await.unwrap();
		assert!(backend.load("abc").await.is_none());
	}

	#[tokio::test]
	async fn file_backend_round_trips() {
		let dir = std::env::temp_dir().join(format!("thor-session-test-{}", std::process::id()));
		let backend = FileSessionBackend::new(&dir);

		let mut record = SessionRecord::fresh();
		record.data.insert("k".to_owned(), Value::String("v".to_owned()));
		backend.save("session-one", &record).await.unwrap();

		let loaded = backend.load("session-one").await.unwrap();
		assert_eq!(loaded.data.get("k"), Some(&Value::String("v".to_owned())));

		backend.delete("session-one").await.unwrap();
		assert!(backend.load("session-one").await.is_none());

		tokio::fs::remove_dir_all(&dir).await.ok();
	}

	#[tokio::test]
	async fn file_backend_rejects_traversal_ids() {
		let dir = std::env::temp_dir().join(format!("thor-session-test-trav-{}", std::process::id()));
		let backend = FileSessionBackend::new(&dir);

		assert!(backend.load("../../etc/passwd").await.is_none());

		tokio::fs::remove_dir_all(&dir).await.ok();
	}
}
