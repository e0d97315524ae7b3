//! Form bodies: the `multipart/form-data` parser and the plain field/upload data model (§4.4).
//!
//! Grounded on `original_source/src/thor/multipart.py`. The corpus's own low-level HTTP parser
//! (`httparse`, pulled in by argan's `data/multipart_form.rs`) is not used here — the outer
//! request is already parsed by hyper, and a part's header block is a handful of `Name: value`
//! lines, simple enough to split by hand without a second parser dependency (see DESIGN.md).

// ----------

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::ThorError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// One or more string values collected for a form field (§4.4).
///
/// A field seen once stays a scalar; a field repeated under the same name is promoted to a list
/// on its second occurrence, with every later occurrence appended to that list.
#[derive(Debug, Clone, PartialEq)]
pub enum FormValue {
	Single(String),
	Multi(Vec<String>),
}

impl FormValue {
	pub fn first(&self) -> &str {
		match self {
			FormValue::Single(value) => value,
			FormValue::Multi(values) => values.first().map(String::as_str).unwrap_or_default(),
		}
	}

	pub fn all(&self) -> Vec<&str> {
		match self {
			FormValue::Single(value) => vec![value.as_str()],
			FormValue::Multi(values) => values.iter().map(String::as_str).collect(),
		}
	}
}

/// An uploaded file from a `multipart/form-data` part that carried a `filename` attribute.
#[derive(Debug, Clone)]
pub struct Upload {
	pub filename: String,
	pub content_type: String,
	pub headers: Vec<(String, String)>,
	pub bytes: Bytes,
}

/// A parsed form body: named fields plus any file uploads (§4.4).
#[derive(Debug, Clone, Default)]
pub struct Form {
	fields: HashMap<String, FormValue>,
	uploads: HashMap<String, Vec<Upload>>,
}

impl Form {
	pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
		let mut form = Form::default();
		for (name, value) in pairs {
			form.insert_field(name, value);
		}

		form
	}

	fn insert_field(&mut self, name: String, value: String) {
		self
			.fields
			.entry(name)
			.and_modify(|existing| match existing {
				FormValue::Single(first) => {
					*existing = FormValue::Multi(vec![first.clone(), value.clone()]);
				}
				FormValue::Multi(values) => values.push(value.clone()),
			})
			.or_insert_with(|| FormValue::Single(value));
	}

	fn insert_upload(&mut self, name: String, upload: Upload) {
		self.uploads.entry(name).or_default().push(upload);
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self.fields.get(name).map(FormValue::first)
	}

	pub fn get_all(&self, name: &str) -> Vec<&str> {
		self.fields.get(name).map(FormValue::all).unwrap_or_default()
	}

	pub fn upload(&self, name: &str) -> Option<&Upload> {
		self.uploads.get(name).and_then(|uploads| uploads.first())
	}

	pub fn uploads(&self, name: &str) -> &[Upload] {
		self.uploads.get(name).map(Vec::as_slice).unwrap_or(&[])
	}
}

// --------------------------------------------------
// Content-Type boundary extraction

/// Extracts the `boundary` parameter from a `multipart/form-data` `Content-Type` value.
pub fn multipart_boundary(content_type: &str) -> Option<String> {
	let mut parts = content_type.split(';');
	let media_type = parts.next()?.trim();
	if !media_type.eq_ignore_ascii_case("multipart/form-data") {
		return None;
	}

	for param in parts {
		let param = param.trim();
		if let Some(value) = param.strip_prefix("boundary=") {
			return Some(value.trim_matches('"').to_owned());
		}
	}

	None
}

// --------------------------------------------------
// Multipart body parsing

/// Parses a `multipart/form-data` body into a [`Form`] (§4.4).
pub fn parse_multipart(body: &[u8], boundary: &str) -> Result<Form, ThorError> {
	let delimiter = format!("--{boundary}");
	let delimiter_bytes = delimiter.as_bytes();

	let positions = find_all(body, delimiter_bytes);
	if positions.is_empty() {
		return Err(ThorError::bad_request("malformed multipart body: no boundary found"));
	}

	let mut form = Form::default();

	for (i, &position) in positions.iter().enumerate() {
		let after_delimiter = position + delimiter_bytes.len();
		if body[after_delimiter..].starts_with(b"--") {
			// The closing `--boundary--` marker; nothing more to parse.
			break;
		}

		let content_start = after_delimiter + skip_leading_crlf(&body[after_delimiter..]);
		let content_end = positions
			.get(i + 1)
			.copied()
			.unwrap_or(body.len());

		if content_start > content_end {
			continue;
		}

		let part = strip_trailing_crlf(&body[content_start..content_end]);
		parse_part(part, &mut form)?;
	}

	Ok(form)
}

fn parse_part(part: &[u8], form: &mut Form) -> Result<(), ThorError> {
	let header_end = find_all(part, b"\r\n\r\n")
		.first()
		.map(|&index| (index, 4))
		.or_else(|| find_all(part, b"\n\n").first().map(|&index| (index, 2)));

	let Some((split_at, sep_len)) = header_end else {
		return Err(ThorError::bad_request("malformed multipart part: no header terminator"));
	};

	let header_block = String::from_utf8_lossy(&part[..split_at]);
	let part_body = &part[split_at + sep_len..];

	let mut headers = Vec::new();
	let mut some_name = None;
	let mut some_filename = None;
	let mut content_type = None;

	for line in header_block.split("\r\n").flat_map(|l| l.split('\n')) {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}

		let Some((header_name, header_value)) = line.split_once(':') else {
			continue;
		};
		let header_name = header_name.trim();
		let header_value = header_value.trim();

		if header_name.eq_ignore_ascii_case("content-disposition") {
			some_name = extract_quoted_param(header_value, "name");
			some_filename = extract_quoted_param(header_value, "filename");
		} else if header_name.eq_ignore_ascii_case("content-type") {
			content_type = Some(header_value.to_owned());
		}

		headers.push((header_name.to_owned(), header_value.to_owned()));
	}

	let Some(name) = some_name else {
		return Err(ThorError::bad_request(
			"malformed multipart part: missing Content-Disposition name",
		));
	};

	if let Some(filename) = some_filename {
		form.insert_upload(
			name,
			Upload {
				filename,
				content_type: content_type.unwrap_or_else(|| "application/octet-stream".to_owned()),
				headers,
				bytes: Bytes::copy_from_slice(part_body),
			},
		);
	} else {
		form.insert_field(name, String::from_utf8_lossy(part_body).into_owned());
	}

	Ok(())
}

fn extract_quoted_param(header_value: &str, param: &str) -> Option<String> {
	let needle = format!("{param}=\"");
	let start = header_value.find(&needle)? + needle.len();
	let end = header_value[start..].find('"')? + start;

	Some(header_value[start..end].to_owned())
}

fn skip_leading_crlf(bytes: &[u8]) -> usize {
	if bytes.starts_with(b"\r\n") {
		2
	} else if bytes.starts_with(b"\n") {
		1
	} else {
		0
	}
}

fn strip_trailing_crlf(bytes: &[u8]) -> &[u8] {
	if bytes.ends_with(b"\r\n") {
		&bytes[..bytes.len() - 2]
	} else if bytes.ends_with(b"\n") {
		&bytes[..bytes.len() - 1]
	} else {
		bytes
	}
}

fn find_all(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
	if needle.is_empty() || haystack.len() < needle.len() {
		return Vec::new();
	}

	let mut positions = Vec::new();
	let mut start = 0;
	while start + needle.len() <= haystack.len() {
		if &haystack[start..start + needle.len()] == needle {
			positions.push(start);
			start += needle.len();
		} else {
			start += 1;
		}
	}

	positions
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn extracts_boundary() {
		let boundary = multipart_boundary("multipart/form-data; boundary=XYZ").unwrap();
		assert_eq!(boundary, "XYZ");
	}

	#[test]
	fn non_multipart_content_type_yields_none() {
		assert!(multipart_boundary("application/json").is_none());
	}

	#[test]
	fn parses_fields_and_file() {
		let body = concat!(
			"--XYZ\r\n",
			"Content-Disposition: form-data; name=\"title\"\r\n",
			"\r\n",
			"hello\r\n",
			"--XYZ\r\n",
			"Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n",
			"Content-Type: text/plain\r\n",
			"\r\n",
			"file contents\r\n",
			"--XYZ--\r\n",
		);

		let form = parse_multipart(body.as_bytes(), "XYZ").unwrap();
		assert_eq!(form.get("title"), Some("hello"));

		let upload = form.upload("file").unwrap();
		assert_eq!(upload.filename, "a.txt");
		assert_eq!(upload.content_type, "text/plain");
		assert_eq!(&upload.bytes[..], b"file contents");
	}

	#[test]
	fn repeated_field_names_aggregate_in_order() {
		let body = concat!(
			"--B\r\n",
			"Content-Disposition: form-data; name=\"tag\"\r\n",
			"\r\n",
			"a\r\n",
			"--B\r\n",
			"Content-Disposition: form-data; name=\"tag\"\r\n",
			"\r\n",
			"b\r\n",
			"--B\r\n",
			"Content-Disposition: form-data; name=\"tag\"\r\n",
			"\r\n",
			"c\r\n",
			"--B--\r\n",
		);

		let form = parse_multipart(body.as_bytes(), "B").unwrap();
		assert_eq!(form.get_all("tag"), vec!["a", "b", "c"]);
	}
}
