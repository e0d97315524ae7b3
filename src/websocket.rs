//! WebSocket upgrade handshake and framing (§4.14).
//!
//! Grounded on `original_source/src/thor/websocket.py` for the operation surface
//! (`accept`/`close`/`send_*`/`receive_*`, the `disconnect` exception); the upgrade itself rides
//! `hyper_util`'s `TokioIo` over `hyper::upgrade::Upgraded`, the way
//! `examples/argan-rs-argan/src/server.rs` drives its own hyper connections, with a hand-rolled
//! accept-key computation and frame codec in place of a general-purpose websocket crate (see
//! DESIGN.md's dependency notes). Only single-frame (non-fragmented) messages are read and
//! written — continuation frames are not assembled.

// ----------

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use bytes::{Bytes, BytesMut};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{error::ThorError, request::Request, response::Response};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const ACCEPT_KEY_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn compute_accept_key(sec_websocket_key: &str) -> String {
	let mut hasher = Sha1::new();
	hasher.update(sec_websocket_key.as_bytes());
	hasher.update(ACCEPT_KEY_GUID.as_bytes());

	BASE64_STANDARD.encode(hasher.finalize())
}

/// Whether `request` carries the `Upgrade: websocket` header the host adapter checks before the
/// router's HTTP branch (§4.15).
pub fn is_upgrade_request(request: &Request) -> bool {
	request
		.header("upgrade")
		.is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

/// Builds the `101 Switching Protocols` handshake response for a valid upgrade request, or a
/// `bad-request` error if the required headers are missing or malformed (§4.14).
///
/// This only constructs the handshake response; the caller is responsible for completing the
/// hyper upgrade (`hyper::upgrade::on`) after sending it and handing the resulting [`Upgraded`]
/// IO to [`WebSocket::from_upgraded`].
pub fn accept_handshake(request: &Request, subprotocol: Option<&str>) -> Result<Response, ThorError> {
	let key = request
		.header("sec-websocket-key")
		.ok_or_else(|| ThorError::bad_request("missing Sec-WebSocket-Key"))?;

	let version = request.header("sec-websocket-version");
	if version != Some("13") {
		return Err(ThorError::bad_request("unsupported Sec-WebSocket-Version"));
	}

	let accept_key = compute_accept_key(key);

	let mut response = Response::new(http::StatusCode::SWITCHING_PROTOCOLS);
	response.insert_header(http::header::UPGRADE, http::HeaderValue::from_static("websocket"));
	response.insert_header(http::header::CONNECTION, http::HeaderValue::from_static("Upgrade"));
	response.insert_header(
		http::HeaderName::from_static("sec-websocket-accept"),
		http::HeaderValue::from_str(&accept_key).map_err(ThorError::internal)?,
	);

	if let Some(subprotocol) = subprotocol {
		response.insert_header(
			http::HeaderName::from_static("sec-websocket-protocol"),
			http::HeaderValue::from_str(subprotocol).map_err(ThorError::internal)?,
		);
	}

	Ok(response)
}

/// A `close{code=1008}` response, emitted when an incoming WebSocket scope matches no route
/// (§4.14).
pub fn no_route_close_response() -> Response {
	let mut response = Response::new(http::StatusCode::NOT_FOUND);
	response.insert_header(
		http::HeaderName::from_static("x-websocket-close-code"),
		http::HeaderValue::from_static("1008"),
	);

	response
}

// --------------------------------------------------
// Frames

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opcode {
	Continuation,
	Text,
	Binary,
	Close,
	Ping,
	Pong,
}

impl Opcode {
	fn from_byte(byte: u8) -> Option<Self> {
		match byte {
			0x0 => Some(Self::Continuation),
			0x1 => Some(Self::Text),
			0x2 => Some(Self::Binary),
			0x8 => Some(Self::Close),
			0x9 => Some(Self::Ping),
			0xA => Some(Self::Pong),
			_ => None,
		}
	}

	fn as_byte(self) -> u8 {
		match self {
			Self::Continuation => 0x0,
			Self::Text => 0x1,
			Self::Binary => 0x2,
			Self::Close => 0x8,
			Self::Ping => 0x9,
			Self::Pong => 0xA,
		}
	}
}

/// A received or sent WebSocket message (§4.14).
#[derive(Debug, Clone)]
pub enum Message {
	Text(String),
	Bytes(Bytes),
	Ping(Bytes),
	Pong(Bytes),
}

/// Raised from a `receive_*` call when the peer closed the connection (§4.14), carrying the close
/// code it sent (or `1005` if the peer sent no code at all).
#[derive(Debug, thiserror::Error)]
#[error("websocket disconnected, code {code}")]
pub struct Disconnect {
	pub code: u16,
}

// --------------------------------------------------
// WebSocket

/// A thin framing layer over an already-upgraded connection (§4.14).
pub struct WebSocket {
	io: TokioIo<Upgraded>,
}

impl WebSocket {
	pub fn from_upgraded(upgraded: Upgraded) -> Self {
		Self {
			io: TokioIo::new(upgraded),
		}
	}

	pub async fn send_text(&mut self, text: &str) -> Result<(), ThorError> {
		self.write_frame(Opcode::Text, text.as_bytes()).await
	}

	pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), ThorError> {
		self.write_frame(Opcode::Binary, bytes).await
	}

	pub async fn send_json<T: serde::Serialize>(&mut self, value: &T) -> Result<(), ThorError> {
		let text = serde_json::to_string(value).map_err(ThorError::internal)?;
		self.send_text(&text).await
	}

	pub async fn send_ping(&mut self, payload: &[u8]) -> Result<(), ThorError> {
		self.write_frame(Opcode::Ping, payload).await
	}

	pub async fn send_pong(&mut self, payload: &[u8]) -> Result<(), ThorError> {
		self.write_frame(Opcode::Pong, payload).await
	}

	/// Sends a close frame and shuts the underlying connection down (§4.14).
	pub async fn close(&mut self, code: u16, reason: &str) -> Result<(), ThorError> {
		let mut payload = Vec::with_capacity(2 + reason.len());
		payload.extend_from_slice(&code.to_be_bytes());
		payload.extend_from_slice(reason.as_bytes());

		self.write_frame(Opcode::Close, &payload).await?;
		self.io.shutdown().await.map_err(ThorError::internal)
	}

	/// Reads one message, transparently answering pings with pongs and surfacing a close frame as
	/// [`Disconnect`] rather than an ordinary message (§4.14).
	pub async fn receive(&mut self) -> Result<Message, ThorError> {
		loop {
			let (opcode, payload) = self.read_frame().await?;

			match opcode {
				Opcode::Text => {
					let text = String::from_utf8(payload).map_err(|_| {
						ThorError::bad_request("received a text frame that was not valid UTF-8")
					})?;
					return Ok(Message::Text(text));
				}
				Opcode::Binary => return Ok(Message::Bytes(Bytes::from(payload))),
				Opcode::Ping => {
					self.write_frame(Opcode::Pong, &payload).await?;
					continue;
				}
				Opcode::Pong => return Ok(Message::Pong(Bytes::from(payload))),
				Opcode::Close => {
					let code = if payload.len() >= 2 {
						u16::from_be_bytes([payload[0], payload[1]])
					} else {
						1005
					};

					return Err(ThorError::internal(Disconnect { code }));
				}
				Opcode::Continuation => {
					return Err(ThorError::bad_request("fragmented websocket messages are not supported"))
				}
			}
		}
	}

	pub async fn receive_text(&mut self) -> Result<String, ThorError> {
		match self.receive().await? {
			Message::Text(text) => Ok(text),
			_ => Err(ThorError::bad_request("expected a text frame")),
		}
	}

	pub async fn receive_bytes(&mut self) -> Result<Bytes, ThorError> {
		match self.receive().await? {
			Message::Bytes(bytes) => Ok(bytes),
			_ => Err(ThorError::bad_request("expected a binary frame")),
		}
	}

	pub async fn receive_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T, ThorError> {
		let text = self.receive_text().await?;
		serde_json::from_str(&text).map_err(|error| ThorError::bad_request(format!("invalid JSON frame: {error}")))
	}

	async fn write_frame(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), ThorError> {
		let mut frame = BytesMut::with_capacity(payload.len() + 10);
		frame.extend_from_slice(&[0x80 | opcode.as_byte()]);

		let len = payload.len();
		if len < 126 {
			frame.extend_from_slice(&[len as u8]);
		} else if len <= u16::MAX as usize {
			frame.extend_from_slice(&[126]);
			frame.extend_from_slice(&(len as u16).to_be_bytes());
		} else {
			frame.extend_from_slice(&[127]);
			frame.extend_from_slice(&(len as u64).to_be_bytes());
		}

		frame.extend_from_slice(payload);

		self.io.write_all(&frame).await.map_err(ThorError::internal)?;
		self.io.flush().await.map_err(ThorError::internal)
	}

	/// Reads one unmasked-on-the-wire-to-us frame, unmasking it (every client→server frame MUST be
	/// masked per RFC 6455) before returning its payload.
	async fn read_frame(&mut self) -> Result<(Opcode, Vec<u8>), ThorError> {
		let mut header = [0u8; 2];
		self.io.read_exact(&mut header).await.map_err(ThorError::internal)?;

		let opcode = Opcode::from_byte(header[0] & 0x0F)
			.ok_or_else(|| ThorError::bad_request("unknown websocket opcode"))?;
		let masked = header[1] & 0x80 != 0;
		let mut len = (header[1] & 0x7F) as u64;

		if len == 126 {
			let mut buf = [0u8; 2];
			self.io.read_exact(&mut buf).await.map_err(ThorError::internal)?;
			len = u16::from_be_bytes(buf) as u64;
		} else if len == 127 {
			let mut buf = [0u8; 8];
			self.io.read_exact(&mut buf).await.map_err(ThorError::internal)?;
			len = u64::from_be_bytes(buf);
		}

		let mask = if masked {
			let mut key = [0u8; 4];
			self.io.read_exact(&mut key).await.map_err(ThorError::internal)?;
			Some(key)
		} else {
			None
		};

		let mut payload = vec![0u8; len as usize];
		self.io.read_exact(&mut payload).await.map_err(ThorError::internal)?;

		if let Some(key) = mask {
			for (i, byte) in payload.iter_mut().enumerate() {
				*byte ^= key[i % 4];
			}
		}

		Ok((opcode, payload))
	}
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use http::HeaderMap;

	#[test]
	fn accept_key_matches_rfc6455_example() {
		// The worked example from RFC 6455 §1.3.
		let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
		assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
	}

	#[test]
	fn upgrade_request_is_detected() {
		let mut headers = HeaderMap::new();
		headers.insert("upgrade", "websocket".parse().unwrap());

		let request = Request::without_body(
			http::Method::GET,
			"/ws".to_owned(),
			String::new(),
			headers,
			None,
			"http".to_owned(),
			crate::request::DEFAULT_MAX_BODY_SIZE,
		);

		assert!(is_upgrade_request(&request));
	}

	#[test]
	fn handshake_rejects_missing_key() {
		let request = Request::without_body(
			http::Method::GET,
			"/ws".to_owned(),
			String::new(),
			HeaderMap::new(),
			None,
			"http".to_owned(),
			crate::request::DEFAULT_MAX_BODY_SIZE,
		);

		assert!(accept_handshake(&request, None).is_err());
	}

	#[test]
	fn handshake_builds_switching_protocols_response() {
		let mut headers = HeaderMap::new();
		headers.insert("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==".parse().unwrap());
		headers.insert("sec-websocket-version", "13".parse().unwrap());

		let request = Request::without_body(
			http::Method::GET,
			"/ws".to_owned(),
			String::new(),
			headers,
			None,
			"http".to_owned(),
			crate::request::DEFAULT_MAX_BODY_SIZE,
		);

		let response = accept_handshake(&request, None).unwrap();
		assert_eq!(response.status(), http::StatusCode::SWITCHING_PROTOCOLS);
		assert_eq!(
			response.headers().get("sec-websocket-accept").unwrap(),
			"s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
		);
	}
}
