//! Environment-driven application configuration (§4.17).
//!
//! Grounded in style only on `examples/argan-rs-argan/src/common/config.rs`'s config-option
//! pattern; the env/default layering itself uses the `config` crate rather than hand-rolled
//! parsing, per DESIGN.md's dependency notes.

// ----------

use std::{net::SocketAddr, time::Duration};

use serde::Deserialize;

use crate::{
	cookie::CookieOptions,
	token::{SecretKeyTooShort, MIN_SECRET_KEY_LEN},
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// The environment variable prefix configuration values are overlaid from, e.g. `THOR_BIND`,
/// `THOR_MAX_BODY_SIZE` (§4.17).
pub const ENV_PREFIX: &str = "THOR";

const DEFAULT_BIND: &str = "127.0.0.1:8080";
const DEFAULT_MAX_BODY_SIZE: usize = crate::request::DEFAULT_MAX_BODY_SIZE;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TRACING_FILTER: &str = "info";

/// Raised when a configuration value fails to load or validate (§4.17).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to load configuration: {0}")]
	Source(#[from] config::ConfigError),
	#[error("invalid bind address {0:?}: {1}")]
	InvalidBindAddress(String, std::net::AddrParseError),
	#[error(transparent)]
	SecretKey(#[from] SecretKeyTooShort),
}

/// The subset of configuration loaded through the `config` crate's env/default layering; the
/// secret key and cookie defaults are supplied directly by the application builder rather than
/// read from the environment, since a signing key has no business living in a shell's env dump
/// alongside ordinary tuning knobs.
#[derive(Debug, Deserialize)]
struct RawConfig {
	bind: String,
	max_body_size: usize,
	shutdown_timeout_secs: u64,
	tracing_filter: String,
}

impl Default for RawConfig {
	fn default() -> Self {
		Self {
			bind: DEFAULT_BIND.to_owned(),
			max_body_size: DEFAULT_MAX_BODY_SIZE,
			shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
			tracing_filter: DEFAULT_TRACING_FILTER.to_owned(),
		}
	}
}

/// The fully resolved application configuration (§4.17).
pub struct AppConfig {
	pub secret_key: Option<Vec<u8>>,
	pub bind: SocketAddr,
	pub max_body_size: usize,
	pub shutdown_timeout: Duration,
	pub session_cookie_options: CookieOptions,
	pub csrf_cookie_options: CookieOptions,
	pub tracing_filter: String,
}

impl AppConfig {
	/// Loads `bind`/`max_body_size`/`shutdown_timeout_secs`/`tracing_filter` from `THOR_*`
	/// environment variables, falling back to hardcoded defaults, then pairs them with the given
	/// secret key, when one is given, validated to be at least [`MIN_SECRET_KEY_LEN`] bytes,
	/// matching the token codec's own requirement (§4.17).
	///
	/// An application with no secret key at all can still be built and run; it can just never
	/// register [`crate::session::SessionMiddleware`] or [`crate::middleware::csrf::CsrfMiddleware`],
	/// both of which need one to sign their cookies.
	pub fn load(secret_key: Option<impl AsRef<[u8]>>) -> Result<Self, ConfigError> {
		let secret_key = match secret_key {
			Some(key) => {
				let key = key.as_ref();
				if key.len() < MIN_SECRET_KEY_LEN {
					return Err(SecretKeyTooShort.into());
				}
				Some(key.to_vec())
			}
			None => None,
		};

		let source = config::Config::builder()
			.set_default("bind", DEFAULT_BIND)?
			.set_default("max_body_size", DEFAULT_MAX_BODY_SIZE as i64)?
			.set_default("shutdown_timeout_secs", DEFAULT_SHUTDOWN_TIMEOUT_SECS)?
			.set_default("tracing_filter", DEFAULT_TRACING_FILTER)?
			.add_source(config::Environment::with_prefix(ENV_PREFIX))
			.build()?;

		let raw: RawConfig = source.try_deserialize().unwrap_or_default();

		let bind = raw
			.bind
			.parse()
			.map_err(|error| ConfigError::InvalidBindAddress(raw.bind.clone(), error))?;

		Ok(Self {
			secret_key,
			bind,
			max_body_size: raw.max_body_size,
			shutdown_timeout: Duration::from_secs(raw.shutdown_timeout_secs),
			session_cookie_options: CookieOptions::default(),
			csrf_cookie_options: CookieOptions::default().with_http_only(false),
			tracing_filter: raw.tracing_filter,
		})
	}

	pub fn with_bind(mut self, bind: SocketAddr) -> Self {
		self.bind = bind;
		self
	}

	pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
		self.max_body_size = max_body_size;
		self
	}

	pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
		self.shutdown_timeout = shutdown_timeout;
		self
	}

	pub fn with_session_cookie_options(mut self, options: CookieOptions) -> Self {
		self.session_cookie_options = options;
		self
	}

	pub fn with_csrf_cookie_options(mut self, options: CookieOptions) -> Self {
		self.csrf_cookie_options = options;
		self
	}
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_short_secret_keys() {
		assert!(matches!(
			AppConfig::load(Some("short")),
			Err(ConfigError::SecretKey(_))
		));
	}

	#[test]
	fn no_secret_key_is_allowed() {
		let config = AppConfig::load(None::<&[u8]>).unwrap();
		assert!(config.secret_key.is_none());
	}

	#[test]
	fn defaults_apply_with_no_environment_overrides() {
		let config = AppConfig::load(Some("0123456789abcdef")).unwrap();
		assert_eq!(config.bind, DEFAULT_BIND.parse().unwrap());
		assert_eq!(config.max_body_size, DEFAULT_MAX_BODY_SIZE);
		assert_eq!(config.shutdown_timeout, Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS));
		assert_eq!(config.tracing_filter, DEFAULT_TRACING_FILTER);
	}

	#[test]
	fn builder_overrides_apply_on_top_of_load() {
		let config = AppConfig::load(Some("0123456789abcdef"))
			.unwrap()
			.with_max_body_size(2048);
		assert_eq!(config.max_body_size, 2048);
	}
}
