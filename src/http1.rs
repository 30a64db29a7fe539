//! HTTP/1.1 wire codec.
//!
//! Messages are fully buffered: bodies are read into [`Bytes`] and
//! re-framed with `Content-Length` when written back out.
use crate::errors::{new_io_error, Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound for a request or status line plus all header lines
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Upper bound for a buffered message body
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

const HOP_BY_HOP: [&str; 9] = [
  "connection",
  "keep-alive",
  "proxy-connection",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// Read one request from `reader`.
///
/// Returns `Ok(None)` when the peer closed the connection before sending
/// anything, which ends a keep-alive loop cleanly.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request<Bytes>>>
where
  R: AsyncBufRead + Unpin,
{
  let mut head_size = 0usize;
  let mut line = Vec::new();
  // tolerate stray CRLFs between pipelined requests
  loop {
    line.clear();
    let n = read_head_line(reader, &mut line, &mut head_size).await?;
    if n == 0 {
      return Ok(None);
    }
    if line != CR_LF && line != b"\n" {
      break;
    }
  }
  let (method, target, version) = parser_request_line(&line)?;
  let headers = read_headers(reader, &mut head_size).await?;
  let body = if method == Method::CONNECT {
    Bytes::new()
  } else {
    read_request_body(reader, &headers).await?
  };
  let mut builder = Request::builder()
    .method(method)
    .uri(target)
    .version(version);
  if let Some(h) = builder.headers_mut() {
    *h = headers;
  }
  Ok(Some(builder.body(body)?))
}

/// Read one response from `reader`, skipping interim `1xx` responses.
///
/// `method` is the method of the request being answered; responses to
/// `HEAD` never carry a body.
pub async fn read_response<R>(reader: &mut R, method: &Method) -> Result<Response<Bytes>>
where
  R: AsyncBufRead + Unpin,
{
  loop {
    let mut head_size = 0usize;
    let mut line = Vec::new();
    let n = read_head_line(reader, &mut line, &mut head_size).await?;
    if n == 0 {
      return Err(new_io_error(
        ErrorKind::UnexpectedEof,
        "connection closed before response",
      ));
    }
    let (version, status) = parser_version(&line)?;
    let headers = read_headers(reader, &mut head_size).await?;
    if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
      continue;
    }
    let body = if method == Method::HEAD
      || status.is_informational()
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED
    {
      Bytes::new()
    } else {
      read_response_body(reader, &headers).await?
    };
    let mut builder = Response::builder().status(status).version(version);
    if let Some(h) = builder.headers_mut() {
      *h = headers;
    }
    return Ok(builder.body(body)?);
  }
}

/// Serialize a request in origin form, adding `Host` when missing and
/// framing the body with `Content-Length`.
pub fn request_to_raw(request: &Request<Bytes>) -> Bytes {
  let mut raw = Vec::with_capacity(256 + request.body().len());
  raw.extend(request.method().as_str().as_bytes());
  raw.extend(SPACE);
  if request.method() == Method::CONNECT {
    raw.extend(authority_of(request).unwrap_or_default().as_bytes());
  } else {
    raw.extend(
      request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .as_bytes(),
    );
  }
  raw.extend(SPACE);
  raw.extend(b"HTTP/1.1");
  raw.extend(CR_LF);
  if !request.headers().contains_key(header::HOST) {
    if let Some(authority) = request.uri().authority() {
      raw.extend(header::HOST.as_str().as_bytes());
      raw.extend(COLON_SPACE);
      raw.extend(authority.as_str().as_bytes());
      raw.extend(CR_LF);
    }
  }
  let mut headers = request.headers().clone();
  headers.remove(header::TRANSFER_ENCODING);
  let needs_length = !request.body().is_empty()
    || matches!(*request.method(), Method::POST | Method::PUT | Method::PATCH);
  if needs_length {
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(request.body().len()));
  } else {
    headers.remove(header::CONTENT_LENGTH);
  }
  write_headers(&mut raw, &headers);
  raw.extend(CR_LF);
  raw.extend(request.body().as_ref());
  Bytes::from(raw)
}

/// Serialize a response, framing the body with `Content-Length`.
pub fn response_to_raw(response: &Response<Bytes>) -> Bytes {
  let mut raw = Vec::with_capacity(256 + response.body().len());
  raw.extend(b"HTTP/1.1");
  raw.extend(SPACE);
  raw.extend(response.status().as_str().as_bytes());
  raw.extend(SPACE);
  raw.extend(
    response
      .status()
      .canonical_reason()
      .unwrap_or("Unknown")
      .as_bytes(),
  );
  raw.extend(CR_LF);
  let mut headers = response.headers().clone();
  headers.remove(header::TRANSFER_ENCODING);
  headers.insert(header::CONTENT_LENGTH, HeaderValue::from(response.body().len()));
  write_headers(&mut raw, &headers);
  raw.extend(CR_LF);
  raw.extend(response.body().as_ref());
  Bytes::from(raw)
}

/// Remove connection-scoped headers, including those named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
  let named: Vec<HeaderName> = headers
    .get_all(header::CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
    .collect();
  for name in named {
    headers.remove(name);
  }
  for name in HOP_BY_HOP {
    headers.remove(name);
  }
}

/// Whether the client asked to close the connection after this exchange.
pub fn wants_close(request: &Request<Bytes>) -> bool {
  let connection = request
    .headers()
    .get(header::CONNECTION)
    .or_else(|| request.headers().get("proxy-connection"))
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase());
  match request.version() {
    http::Version::HTTP_10 | http::Version::HTTP_09 => {
      connection.as_deref() != Some("keep-alive")
    }
    _ => connection.as_deref() == Some("close"),
  }
}

/// `host:port` the request is addressed to, from the URI or the `Host` header.
pub fn authority_of<B>(request: &Request<B>) -> Option<String> {
  if let Some(authority) = request.uri().authority() {
    return Some(authority.as_str().to_string());
  }
  request
    .headers()
    .get(header::HOST)
    .and_then(|h| h.to_str().ok())
    .map(|h| h.to_string())
}

/// Split `host[:port]`, falling back to `default_port`. Handles bracketed IPv6.
pub fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
  let authority = authority.trim();
  if let Some(rest) = authority.strip_prefix('[') {
    let (host, tail) = rest
      .split_once(']')
      .ok_or_else(|| Error::invalid_request(format!("invalid authority: {}", authority)))?;
    let port = match tail.strip_prefix(':') {
      Some(p) => p
        .parse::<u16>()
        .map_err(|_| Error::invalid_request(format!("invalid port: {}", p)))?,
      None => default_port,
    };
    return Ok((host.to_string(), port));
  }
  match authority.rsplit_once(':') {
    Some((host, port)) if !host.contains(':') => {
      let port = port
        .parse::<u16>()
        .map_err(|_| Error::invalid_request(format!("invalid port: {}", port)))?;
      Ok((host.to_string(), port))
    }
    _ if authority.is_empty() => Err(Error::invalid_request("empty authority")),
    _ => Ok((authority.to_string(), default_port)),
  }
}

/// A response with `status` and no body
pub fn empty_response(status: StatusCode) -> Response<Bytes> {
  let mut response = Response::new(Bytes::new());
  *response.status_mut() = status;
  response
}

fn write_headers(raw: &mut Vec<u8>, headers: &HeaderMap) {
  for (k, v) in headers.iter() {
    raw.extend(k.as_str().as_bytes());
    raw.extend(COLON_SPACE);
    raw.extend(v.as_bytes());
    raw.extend(CR_LF);
  }
}

fn parser_request_line(line: &[u8]) -> Result<(Method, http::Uri, http::Version)> {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  let mut parts = line.split(|b| b == &b' ').filter(|p| !p.is_empty());
  let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
  else {
    return Err(Error::invalid_request("invalid request line"));
  };
  let method = Method::from_bytes(method)
    .map_err(|_| Error::invalid_request("invalid request method"))?;
  let target = http::Uri::try_from(target)
    .map_err(|e| Error::invalid_request(format!("invalid request target: {}", e)))?;
  let version = parser_http_version(version)
    .map_err(|_| Error::invalid_request("invalid request version"))?;
  Ok((method, target, version))
}

fn parser_version(line: &[u8]) -> Result<(http::Version, StatusCode)> {
  let line = line.strip_suffix(CR_LF).unwrap_or(line);
  let mut parts = line.splitn(3, |b| b == &b' ');
  let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
    return Err(new_io_error(
      ErrorKind::InvalidData,
      "invalid http version and status_code data",
    ));
  };
  let version = parser_http_version(version)?;
  let status = StatusCode::from_bytes(status).map_err(|x| Error::Http(http::Error::from(x)))?;
  Ok((version, status))
}

fn parser_http_version(version: &[u8]) -> Result<http::Version> {
  match version {
    b"HTTP/0.9" => Ok(http::Version::HTTP_09),
    b"HTTP/1.0" => Ok(http::Version::HTTP_10),
    b"HTTP/1.1" => Ok(http::Version::HTTP_11),
    _ => Err(new_io_error(ErrorKind::InvalidData, "invalid http version")),
  }
}

async fn read_headers<R>(reader: &mut R, head_size: &mut usize) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut header_line = Vec::new();
  loop {
    header_line.clear();
    let length = read_head_line(reader, &mut header_line, head_size).await?;
    if length == 0 || header_line == CR_LF || header_line == b"\n" {
      break;
    }
    if let (Some(k), Some(v)) = parser_headers(&header_line)? {
      headers.append(k, v);
    }
  }
  Ok(headers)
}

pub(crate) fn parser_headers(buffer: &[u8]) -> Result<(Option<HeaderName>, Option<HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\r").unwrap_or(buffer);
  for (index, h) in buffer.splitn(2, |s| s == &b':').enumerate() {
    let h = h.trim_ascii();
    match index {
      0 => {
        k = Some(HeaderName::from_bytes(h).map_err(|_| {
          Error::invalid_request(format!("invalid header name: {}", String::from_utf8_lossy(h)))
        })?)
      }
      1 => {
        v = Some(
          HeaderValue::from_bytes(h).map_err(|_| Error::invalid_request("invalid header value"))?,
        )
      }
      _ => {}
    }
  }
  Ok((k, v))
}

/// Read one head line, counting it against [`MAX_HEAD_SIZE`].
///
/// At most the remaining head budget is buffered; a line that has not ended
/// by then is rejected.
async fn read_head_line<R>(reader: &mut R, line: &mut Vec<u8>, head_size: &mut usize) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let remaining = MAX_HEAD_SIZE.saturating_sub(*head_size);
  if remaining == 0 {
    return Err(Error::invalid_request("message head too large"));
  }
  let n = (&mut *reader)
    .take(remaining as u64)
    .read_until(b'\n', line)
    .await?;
  *head_size += n;
  if n == remaining && line.last() != Some(&b'\n') {
    return Err(Error::invalid_request("message head too large"));
  }
  Ok(n)
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(header::TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .any(|v| v.to_ascii_lowercase().contains("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>> {
  match headers.get(header::CONTENT_LENGTH) {
    None => Ok(None),
    Some(v) => {
      let length = v
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .ok_or_else(|| Error::invalid_request("invalid content-length"))?;
      if length > MAX_BODY_SIZE {
        return Err(Error::invalid_request("body too large"));
      }
      Ok(Some(length))
    }
  }
}

async fn read_request_body<R>(reader: &mut R, headers: &HeaderMap) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  if is_chunked(headers) {
    return read_chunked_body(reader).await;
  }
  match content_length(headers)? {
    Some(length) => read_exact_body(reader, length).await,
    None => Ok(Bytes::new()),
  }
}

async fn read_response_body<R>(reader: &mut R, headers: &HeaderMap) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  if is_chunked(headers) {
    return read_chunked_body(reader).await;
  }
  match content_length(headers)? {
    Some(length) => read_exact_body(reader, length).await,
    None => {
      // delimited by connection close
      let mut body = Vec::new();
      (&mut *reader)
        .take(MAX_BODY_SIZE as u64 + 1)
        .read_to_end(&mut body)
        .await?;
      if body.len() > MAX_BODY_SIZE {
        return Err(Error::invalid_request("body too large"));
      }
      Ok(Bytes::from(body))
    }
  }
}

async fn read_exact_body<R>(reader: &mut R, length: usize) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = vec![0; length];
  reader.read_exact(&mut body).await?;
  Ok(Bytes::from(body))
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let mut body: Vec<u8> = Vec::new();
  let mut line = Vec::new();
  // chunk-size lines and trailers share one head budget
  let mut meta_size = 0usize;
  loop {
    line.clear();
    if read_head_line(reader, &mut line, &mut meta_size).await? == 0 {
      return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated chunked body"));
    }
    let size = String::from_utf8_lossy(&line);
    let size = size.split(';').next().unwrap_or_default().trim();
    if size.is_empty() {
      continue;
    }
    let size = usize::from_str_radix(size, 16)
      .map_err(|_| Error::invalid_request(format!("invalid chunk size: {}", size)))?;
    if size == 0 {
      break;
    }
    let start = body.len();
    let end = start
      .checked_add(size)
      .filter(|end| *end <= MAX_BODY_SIZE)
      .ok_or_else(|| Error::invalid_request("body too large"))?;
    body.resize(end, 0);
    reader.read_exact(&mut body[start..]).await?;
  }
  // trailers
  loop {
    line.clear();
    let n = read_head_line(reader, &mut line, &mut meta_size).await?;
    if n == 0 || line == CR_LF || line == b"\n" {
      break;
    }
  }
  Ok(Bytes::from(body))
}
