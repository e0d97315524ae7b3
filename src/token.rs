//! HMAC-signed, timestamped tokens (§4.1).
//!
//! Grounded on the reference implementation's `SecureCookie` (`original_source/src/thor/cookies.py`):
//! sign a payload together with a timestamp, verify in constant time, and never distinguish
//! failure modes (parse error, forged signature, expiry) to an upstream caller.

// ----------

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Serialize};
use sha2::Sha256;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

type HmacSha256 = Hmac<Sha256>;

/// Minimum secret key length the token codec accepts, in bytes.
pub const MIN_SECRET_KEY_LEN: usize = 16;

// --------------------------------------------------
// TokenCodec

/// An HMAC-SHA256 signer/verifier for opaque, timestamped tokens.
///
/// A token's textual form is `<unix-timestamp>:<payload>:<hmac-sha256-b64url>`. The signed-value
/// syntax is defined only over colon-free payloads: `encode`'s base64url alphabet never produces
/// a `:`, so splitting the textual form on its last two colons is unambiguous. A bare [`sign`]
/// call on a colon-containing payload is a caller error this codec is not obligated to round-trip
/// (see DESIGN.md's Open Question note on this).
///
/// [`sign`]: TokenCodec::sign
#[derive(Clone)]
pub struct TokenCodec {
	secret_key: Vec<u8>,
}

/// Returned when a secret key shorter than [`MIN_SECRET_KEY_LEN`] is given to [`TokenCodec::new`].
#[derive(Debug, thiserror::Error)]
#[error("secret key must be at least {MIN_SECRET_KEY_LEN} bytes long")]
pub struct SecretKeyTooShort;

impl TokenCodec {
	pub fn new(secret_key: impl AsRef<[u8]>) -> Result<Self, SecretKeyTooShort> {
		let secret_key = secret_key.as_ref();
		if secret_key.len() < MIN_SECRET_KEY_LEN {
			return Err(SecretKeyTooShort);
		}

		Ok(Self {
			secret_key: secret_key.to_vec(),
		})
	}

	fn mac(&self) -> HmacSha256 {
		// The key length was validated in `new`; `new_from_slice` only fails on zero-length keys.
		HmacSha256::new_from_slice(&self.secret_key).expect("secret key validated non-empty in new")
	}

	/// Signs a colon-free `payload`, returning `<timestamp>:<payload>:<mac>`.
	pub fn sign(&self, payload: &str) -> String {
		let timestamp = now_unix();
		let signing_input = format!("{timestamp}:{payload}");

		let mut mac = self.mac();
		mac.update(signing_input.as_bytes());
		let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

		format!("{signing_input}:{signature}")
	}

	/// Verifies and strips the signature and timestamp from `token`, returning the payload.
	///
	/// Returns `None` on any malformed input, signature mismatch, or (when `max_age` is given)
	/// expiry — never distinguishing which, so a timing or error-message side channel can't leak
	/// which check failed.
	pub fn unsign(&self, token: &str, max_age: Option<Duration>) -> Option<String> {
		let (timestamp_and_payload, signature) = token.rsplit_once(':')?;
		let (timestamp_str, payload) = timestamp_and_payload.split_once(':')?;
		let timestamp: u64 = timestamp_str.parse().ok()?;

		let expected_signature = URL_SAFE_NO_PAD.decode(signature).ok()?;

		let mut mac = self.mac();
		mac.update(timestamp_and_payload.as_bytes());
		mac.verify_slice(&expected_signature).ok()?;

		if let Some(max_age) = max_age {
			let now = now_unix();
			if now.saturating_sub(timestamp) > max_age.as_secs() {
				return None;
			}
		}

		Some(payload.to_owned())
	}

	/// JSON-serializes `value`, base64url-encodes it (so the payload stays colon-free), and signs.
	pub fn encode<T: Serialize>(&self, value: &T) -> Result<String, serde_json::Error> {
		let json = serde_json::to_vec(value)?;
		let payload = URL_SAFE_NO_PAD.encode(json);

		Ok(self.sign(&payload))
	}

	/// The inverse of [`encode`](TokenCodec::encode); returns `None` on any failure.
	pub fn decode<T: DeserializeOwned>(&self, token: &str, max_age: Option<Duration>) -> Option<T> {
		let payload = self.unsign(token, max_age)?;
		let json = URL_SAFE_NO_PAD.decode(payload).ok()?;

		serde_json::from_slice(&json).ok()
	}
}

fn now_unix() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock is before the Unix epoch")
		.as_secs()
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	fn codec() -> TokenCodec {
		TokenCodec::new("0123456789abcdef").unwrap()
	}

	#[test]
	fn rejects_short_keys() {
		assert!(TokenCodec::new("short").is_err());
	}

	#[test]
	fn round_trips_through_encode_decode() {
		let codec = codec();
		let token = codec.encode(&42u32).unwrap();
		let value: u32 = codec.decode(&token, None).unwrap();
		assert_eq!(value, 42);
	}

	#[test]
	fn rejects_tampered_token() {
		let codec = codec();
		let mut token = codec.encode(&"hello".to_owned()).unwrap();
		token.push('x');
		assert!(codec.decode::<String>(&token, None).is_none());
	}

	#[test]
	fn rejects_expired_token() {
		let codec = codec();
		let token = codec.sign("payload");
		assert!(codec.unsign(&token, Some(Duration::from_secs(60))).is_some());
		std::thread::sleep(Duration::from_millis(1100));
		assert!(codec.unsign(&token, Some(Duration::from_secs(1))).is_none());
	}

	#[test]
	fn different_keys_do_not_cross_verify() {
		let codec_a = codec();
		let codec_b = TokenCodec::new("fedcba9876543210").unwrap();
		let token = codec_a.sign("payload");
		assert!(codec_b.unsign(&token, None).is_none());
	}
}
