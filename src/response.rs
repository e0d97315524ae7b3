//! The outbound response type, `IntoResponse` coercion, and streaming/file responses (§4.4).
//!
//! Grounded on `original_source/src/thor/response.py` for the data model and on
//! `examples/argan-rs-argan/src/response/mod.rs` for the boxed-body streaming idiom.

// ----------

use std::{path::Path, pin::Pin};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, StreamBody};
use serde::Serialize;

use crate::{
	body::Body,
	cookie::{format_set_cookie, CookieOptions},
	error::ThorError,
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Default chunk size used when streaming a [`Response::file`] body (§4.4).
pub const DEFAULT_FILE_CHUNK_SIZE: usize = 64 * 1024;

// --------------------------------------------------
// Response

/// An outbound HTTP response (§3).
///
/// Status and headers are finalized before any body bytes are produced: nothing in this type
/// lets a caller emit body data ahead of the status line, matching the "emitted exactly once,
/// before any body bytes" invariant.
pub struct Response {
	status: StatusCode,
	headers: HeaderMap,
	cookies: Vec<String>,
	body: Body,
}

impl Response {
	pub fn new(status: StatusCode) -> Self {
		Self {
			status,
			headers: HeaderMap::new(),
			cookies: Vec::new(),
			body: Body::default(),
		}
	}

	pub fn empty() -> Self {
		Self::new(StatusCode::NO_CONTENT)
	}

	pub fn text(body: impl Into<String>) -> Self {
		let mut response = Self::new(StatusCode::OK);
		response.set_content_type("text/plain; charset=utf-8");
		response.body = Body::from(body.into());

		response
	}

	pub fn html(body: impl Into<String>) -> Self {
		let mut response = Self::new(StatusCode::OK);
		response.set_content_type("text/html; charset=utf-8");
		response.body = Body::from(body.into());

		response
	}

	/// Serializes `value` as a JSON response body (§4.4).
	pub fn json<T: Serialize>(value: &T) -> Result<Self, ThorError> {
		let bytes =
			serde_json::to_vec(value).map_err(|error| ThorError::internal(error))?;

		let mut response = Self::new(StatusCode::OK);
		response.set_content_type("application/json");
		response.body = Body::from(Bytes::from(bytes));

		Ok(response)
	}

	/// A streaming response body, emitted as an indefinite sequence of chunks (§4.4).
	pub fn stream<S>(status: StatusCode, stream: S) -> Self
	where
		S: Stream<Item = Result<Bytes, crate::BoxedError>> + Send + 'static,
	{
		let mut response = Self::new(status);
		let frame_stream = stream.map(|chunk| chunk.map(http_body::Frame::data));
		response.body = Body::new(StreamBody::new(frame_stream));

		response
	}

	/// Streams the file at `requested_path`, resolved against `base_directory`, rejecting any
	/// resolved path that would escape that base (§4.4, §8 S6).
	pub async fn file(
		requested_path: impl AsRef<Path>,
		base_directory: impl AsRef<Path>,
		download_filename: Option<&str>,
	) -> Result<Self, ThorError> {
		let base_directory = tokio::fs::canonicalize(base_directory.as_ref())
			.await
			.map_err(|error| ThorError::internal(error))?;

		let joined = base_directory.join(requested_path.as_ref());

		let resolved = tokio::fs::canonicalize(&joined).await.map_err(|error| {
			if error.kind() == std::io::ErrorKind::NotFound {
				ThorError::NotFound
			} else {
				ThorError::internal(error)
			}
		})?;

		if !resolved.starts_with(&base_directory) {
			return Err(ThorError::forbidden("resolved path escapes the base directory"));
		}

		let metadata = tokio::fs::metadata(&resolved)
			.await
			.map_err(|_| ThorError::NotFound)?;

		if !metadata.is_file() {
			return Err(ThorError::NotFound);
		}

		let file = tokio::fs::File::open(&resolved)
			.await
			.map_err(|error| ThorError::internal(error))?;

		let mut response = Self::new(StatusCode::OK);
		response.insert_header(
			http::header::CONTENT_LENGTH,
			HeaderValue::from_str(&metadata.len().to_string()).expect("numeric header value"),
		);

		if let Some(filename) = download_filename {
			response.insert_header(
				http::header::CONTENT_DISPOSITION,
				HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
					.unwrap_or_else(|_| HeaderValue::from_static("attachment")),
			);
		}

		response.body = Body::new(StreamBody::new(file_chunk_stream(
			file,
			DEFAULT_FILE_CHUNK_SIZE,
		)));

		Ok(response)
	}

	pub fn status(&self) -> StatusCode {
		self.status
	}

	pub fn set_status(&mut self, status: StatusCode) {
		self.status = status;
	}

	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	pub fn headers_mut(&mut self) -> &mut HeaderMap {
		&mut self.headers
	}

	pub fn insert_header(&mut self, name: HeaderName, value: HeaderValue) {
		self.headers.insert(name, value);
	}

	pub fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
		self.headers.append(name, value);
	}

	fn set_content_type(&mut self, value: &'static str) {
		self.insert_header(http::header::CONTENT_TYPE, HeaderValue::from_static(value));
	}

	/// Queues a `Set-Cookie` header, emitted (in registration order) at `start` time.
	pub fn set_cookie(&mut self, name: &str, value: &str, options: &CookieOptions) {
		self.cookies.push(format_set_cookie(name, value, options));
	}

	pub fn cookies(&self) -> &[String] {
		&self.cookies
	}

	pub fn body(self) -> Body {
		self.body
	}

	pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
		self.insert_header(name, value);
		self
	}

	/// Converts into the boxed `http::Response` the transport adapter sends on the wire,
	/// flattening queued cookies into `Set-Cookie` headers in registration order.
	pub fn into_http_response(self) -> http::Response<BoxBody<Bytes, crate::BoxedError>> {
		let Response {
			status,
			mut headers,
			cookies,
			body,
		} = self;

		for cookie in cookies {
			if let Ok(value) = HeaderValue::from_str(&cookie) {
				headers.append(http::header::SET_COOKIE, value);
			}
		}

		let mut builder = http::Response::builder().status(status);
		*builder.headers_mut().expect("builder has no error yet") = headers;

		builder
			.body(body.boxed())
			.expect("status and headers were already validated")
	}
}

fn file_chunk_stream(
	mut file: tokio::fs::File,
	chunk_size: usize,
) -> impl Stream<Item = Result<http_body::Frame<Bytes>, crate::BoxedError>> {
	futures_util::stream::poll_fn(move |cx| {
		use std::task::Poll;
		use tokio::io::AsyncRead;

		let mut buffer = BytesMut::zeroed(chunk_size);
		let mut read_buf = tokio::io::ReadBuf::new(&mut buffer);

		match Pin::new(&mut file).poll_read(cx, &mut read_buf) {
			Poll::Ready(Ok(())) => {
				let filled = read_buf.filled().len();
				if filled == 0 {
					Poll::Ready(None)
				} else {
					buffer.truncate(filled);
					Poll::Ready(Some(Ok(http_body::Frame::data(buffer.freeze()))))
				}
			}
			Poll::Ready(Err(error)) => Poll::Ready(Some(Err(Box::new(error) as crate::BoxedError))),
			Poll::Pending => Poll::Pending,
		}
	})
}

// --------------------------------------------------
// IntoResponse

/// Coerces a raw handler return value into a [`Response`] (§4.4).
pub trait IntoResponse {
	fn into_response(self) -> Response;
}

impl IntoResponse for Response {
	fn into_response(self) -> Response {
		self
	}
}

impl IntoResponse for () {
	fn into_response(self) -> Response {
		Response::empty()
	}
}

impl IntoResponse for String {
	fn into_response(self) -> Response {
		Response::text(self)
	}
}

impl IntoResponse for &'static str {
	fn into_response(self) -> Response {
		Response::text(self)
	}
}

impl IntoResponse for serde_json::Value {
	fn into_response(self) -> Response {
		Response::json(&self).unwrap_or_else(|_| Response::new(StatusCode::INTERNAL_SERVER_ERROR))
	}
}

impl IntoResponse for StatusCode {
	fn into_response(self) -> Response {
		Response::new(self)
	}
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn text_response_sets_content_type() {
		let response = Response::text("hi");
		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(
			response.headers().get(http::header::CONTENT_TYPE).unwrap(),
			"text/plain; charset=utf-8"
		);
	}

	#[test]
	fn json_response_serializes_value() {
		let response = Response::json(&serde_json::json!({"a": 1})).unwrap();
		assert_eq!(
			response.headers().get(http::header::CONTENT_TYPE).unwrap(),
			"application/json"
		);
	}

	#[test]
	fn cookies_are_flattened_in_order() {
		let mut response = Response::empty();
		response.set_cookie("a", "1", &CookieOptions::default());
		response.set_cookie("b", "2", &CookieOptions::default());

		let http_response = response.into_http_response();
		let values: Vec<_> = http_response
			.headers()
			.get_all(http::header::SET_COOKIE)
			.iter()
			.collect();
		assert_eq!(values.len(), 2);
		assert!(values[0].to_str().unwrap().starts_with("a=1"));
		assert!(values[1].to_str().unwrap().starts_with("b=2"));
	}

	#[tokio::test]
	async fn file_response_rejects_traversal() {
		let root = std::env::temp_dir().join(format!("thor-test-{}", std::process::id()));
		let base = root.join("public");
		tokio::fs::create_dir_all(&base).await.unwrap();
		tokio::fs::write(root.join("secret.txt"), b"secret").await.unwrap();

		let outside = Path::new("..").join("secret.txt");
		let result = Response::file(outside, &base, None).await;
		assert!(matches!(result, Err(ThorError::Forbidden(_))));

		tokio::fs::remove_dir_all(&root).await.ok();
	}

	#[tokio::test]
	async fn file_response_serves_file_within_base() {
		let base = std::env::temp_dir().join(format!("thor-test-ok-{}", std::process::id()));
		tokio::fs::create_dir_all(&base).await.unwrap();
		tokio::fs::write(base.join("a.txt"), b"file body").await.unwrap();

		let response = Response::file("a.txt", &base, None).await.unwrap();
		assert_eq!(response.status(), StatusCode::OK);

		tokio::fs::remove_dir_all(&base).await.ok();
	}
}
