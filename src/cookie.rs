//! Cookie header parsing and `Set-Cookie` formatting (§4.2).
//!
//! Grounded on `original_source/src/thor/cookies.py`. The attribute emission order is exact and
//! not left to a general-purpose cookie jar's own ordering, which is why this is hand-rolled here
//! rather than built on the `cookie` crate (see DESIGN.md's dependency notes).

// ----------

use std::{
	collections::HashMap,
	fmt::{self, Display, Formatter},
	time::{Duration, SystemTime},
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Splits a `Cookie` request header into a name-to-value map.
///
/// An empty header yields an empty map. Each `;`-separated part is trimmed and split on its
/// first `=`; parts without an `=` are ignored.
pub fn parse_cookies(header: &str) -> HashMap<String, String> {
	let mut cookies = HashMap::new();

	if header.is_empty() {
		return cookies;
	}

	for part in header.split(';') {
		let part = part.trim();
		if part.is_empty() {
			continue;
		}

		if let Some((name, value)) = part.split_once('=') {
			cookies.insert(name.trim().to_owned(), value.trim().to_owned());
		}
	}

	cookies
}

// --------------------------------------------------
// SameSite

/// The `SameSite` cookie attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
	Strict,
	Lax,
	None,
}

impl Display for SameSite {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			SameSite::Strict => f.write_str("Strict"),
			SameSite::Lax => f.write_str("Lax"),
			SameSite::None => f.write_str("None"),
		}
	}
}

// --------------------------------------------------
// CookieOptions

/// Attributes for a `Set-Cookie` header, with the defaults §4.2 specifies.
#[derive(Debug, Clone)]
pub struct CookieOptions {
	pub max_age: Option<Duration>,
	pub path: String,
	pub domain: Option<String>,
	pub secure: bool,
	pub http_only: bool,
	pub same_site: SameSite,
}

impl Default for CookieOptions {
	fn default() -> Self {
		Self {
			max_age: None,
			path: "/".to_owned(),
			domain: None,
			secure: true,
			http_only: true,
			same_site: SameSite::Lax,
		}
	}
}

impl CookieOptions {
	pub fn with_max_age(mut self, max_age: Duration) -> Self {
		self.max_age = Some(max_age);
		self
	}

	pub fn with_path(mut self, path: impl Into<String>) -> Self {
		self.path = path.into();
		self
	}

	pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
		self.domain = Some(domain.into());
		self
	}

	pub fn with_secure(mut self, secure: bool) -> Self {
		self.secure = secure;
		self
	}

	pub fn with_http_only(mut self, http_only: bool) -> Self {
		self.http_only = http_only;
		self
	}

	pub fn with_same_site(mut self, same_site: SameSite) -> Self {
		self.same_site = same_site;
		self
	}

	/// An options set appropriate for immediately expiring a cookie already sent to the client.
	pub fn expired(mut self) -> Self {
		self.max_age = Some(Duration::ZERO);
		self
	}
}

/// Formats a complete `Set-Cookie` header value.
///
/// Attributes are emitted in the fixed order `Max-Age; Expires; Path; Domain; Secure; HttpOnly;
/// SameSite`.
pub fn format_set_cookie(name: &str, value: &str, options: &CookieOptions) -> String {
	let mut cookie = format!("{name}={value}");

	if let Some(max_age) = options.max_age {
		cookie.push_str(&format!("; Max-Age={}", max_age.as_secs()));

		let expires_at = SystemTime::now() + max_age;
		cookie.push_str(&format!("; Expires={}", httpdate::fmt_http_date(expires_at)));
	}

	cookie.push_str(&format!("; Path={}", options.path));

	if let Some(domain) = &options.domain {
		cookie.push_str(&format!("; Domain={domain}"));
	}

	if options.secure {
		cookie.push_str("; Secure");
	}

	if options.http_only {
		cookie.push_str("; HttpOnly");
	}

	cookie.push_str(&format!("; SameSite={}", options.same_site));

	cookie
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_empty_header() {
		assert!(parse_cookies("").is_empty());
	}

	#[test]
	fn parses_multiple_cookies() {
		let cookies = parse_cookies("a=1; b=2 ; c = 3");
		assert_eq!(cookies.get("a").map(String::as_str), Some("1"));
		assert_eq!(cookies.get("b").map(String::as_str), Some("2"));
		assert_eq!(cookies.get("c").map(String::as_str), Some("3"));
	}

	#[test]
	fn formats_attribute_order() {
		let options = CookieOptions::default()
			.with_max_age(Duration::from_secs(60))
			.with_domain("example.com");

		let set_cookie = format_set_cookie("thor_session", "abc", &options);

		let max_age_pos = set_cookie.find("Max-Age").unwrap();
		let expires_pos = set_cookie.find("Expires").unwrap();
		let path_pos = set_cookie.find("Path").unwrap();
		let domain_pos = set_cookie.find("Domain").unwrap();
		let secure_pos = set_cookie.find("Secure").unwrap();
		let http_only_pos = set_cookie.find("HttpOnly").unwrap();
		let same_site_pos = set_cookie.find("SameSite").unwrap();

		assert!(max_age_pos < expires_pos);
		assert!(expires_pos < path_pos);
		assert!(path_pos < domain_pos);
		assert!(domain_pos < secure_pos);
		assert!(secure_pos < http_only_pos);
		assert!(http_only_pos < same_site_pos);
	}

	#[test]
	fn default_attributes() {
		let set_cookie = format_set_cookie("thor_csrf", "tok", &CookieOptions::default());
		assert!(set_cookie.contains("Path=/"));
		assert!(set_cookie.contains("Secure"));
		assert!(set_cookie.contains("HttpOnly"));
		assert!(set_cookie.contains("SameSite=Lax"));
	}
}
