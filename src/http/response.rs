//! HTTP response values, body variants and serialization.

use crate::{
    errors::{Error, ErrorKind},
    http::types::{HeaderMap, StatusCode},
    limits::RespLimits,
};
use chrono::{DateTime, Utc};
use futures_util::{stream::BoxStream, StreamExt};
use serde::Serialize;
use std::{fmt, io, io::Write, path::Path};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Response body, resolved once when the response is constructed.
///
/// - [`Bytes`](Body::Bytes): written in one piece together with the head;
///   `Content-Length` is computed when the header is missing.
/// - [`Stream`](Body::Stream): read in
///   [`chunk_size`](RespLimits::chunk_size) pieces until exhausted.
/// - [`Chunks`](Body::Chunks): a finite, non-restartable sequence of chunks,
///   each one written and flushed as soon as it is produced.
///
/// Structured (JSON) values are encoded into `Bytes` at construction, see
/// [`Response::json`].
pub enum Body {
    Bytes(Vec<u8>),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    Chunks(BoxStream<'static, io::Result<Vec<u8>>>),
}

impl Body {
    #[inline]
    pub const fn empty() -> Self {
        Body::Bytes(Vec::new())
    }

    /// Streams `reader` until it returns end of file.
    pub fn from_reader<R: AsyncRead + Send + Unpin + 'static>(reader: R) -> Self {
        Body::Stream(Box::new(reader))
    }

    /// Writes every chunk produced by `stream`.
    ///
    /// # Examples
    /// ```
    /// use futures_util::stream;
    /// use nanodot::Body;
    ///
    /// let body = Body::from_chunks(stream::iter(
    ///     ["<li>1</li>", "<li>2</li>"].map(|c| Ok(c.as_bytes().to_vec())),
    /// ));
    /// assert!(body.known_len().is_none());
    /// ```
    pub fn from_chunks<S>(stream: S) -> Self
    where
        S: futures_util::Stream<Item = io::Result<Vec<u8>>> + Send + 'static,
    {
        Body::Chunks(stream.boxed())
    }

    /// Length in bytes when it is known up front.
    pub fn known_len(&self) -> Option<usize> {
        match self {
            Body::Bytes(bytes) => Some(bytes.len()),
            _ => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Body::Stream(_) => f.write_str("Stream"),
            Body::Chunks(_) => f.write_str("Chunks"),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::empty()
    }
}

impl From<&'static str> for Body {
    fn from(value: &'static str) -> Self {
        Body::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::Bytes(value.into_bytes())
    }
}

impl From<&'static [u8]> for Body {
    fn from(value: &'static [u8]) -> Self {
        Body::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::Bytes(value)
    }
}

/// An HTTP response: status, optional custom reason phrase, ordered
/// headers and a [`Body`].
///
/// Handlers build one with the consuming builder methods, or return any
/// [`IntoResponse`] value converted with
/// [`into_response`](IntoResponse::into_response).
///
/// # Examples
/// ```
/// use nanodot::{Response, StatusCode};
///
/// let resp = Response::new("<h1>Hello World</h1>")
///     .status(StatusCode::Ok)
///     .header("Content-Type", "text/html")
///     .header("X-Request-Id", 128);
///
/// assert_eq!(resp.headers().get("content-type"), Some("text/html"));
/// assert_eq!(resp.headers().get("x-request-id"), Some("128"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    body: Body,
}

impl Default for Response {
    fn default() -> Self {
        Response::new(Body::empty())
    }
}

impl Response {
    /// `200 OK` response with `body` and no headers.
    #[inline]
    pub fn new<B: Into<Body>>(body: B) -> Self {
        Self {
            status: StatusCode::Ok,
            reason: None,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Bodyless response with the given status.
    #[inline]
    pub fn empty(status: StatusCode) -> Self {
        Response::new(Body::empty()).status(status)
    }

    /// Response whose body is `value` encoded as JSON, with
    /// `Content-Type: application/json`.
    ///
    /// # Examples
    /// ```
    /// use nanodot::Response;
    ///
    /// #[derive(serde::Serialize)]
    /// struct Pump { id: u8, running: bool }
    ///
    /// let resp = Response::json(&Pump { id: 2, running: true }).unwrap();
    /// assert_eq!(resp.headers().get("Content-Type"), Some("application/json"));
    /// assert_eq!(resp.body().known_len(), Some(23)); // {"id":2,"running":true}
    /// ```
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, Error> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Response::new(bytes).header("Content-Type", "application/json"))
    }

    /// `302 Found` redirect to `location`.
    ///
    /// # Errors
    /// [`ErrorKind::InvalidInput`] if `location` contains a carriage return
    /// or a line feed.
    #[inline]
    pub fn redirect(location: &str) -> Result<Self, Error> {
        Response::redirect_with(location, StatusCode::Found)
    }

    /// Redirect to `location` with an explicit status (`301`, `303`, ...).
    pub fn redirect_with(location: &str, status: StatusCode) -> Result<Self, Error> {
        if location.contains(['\r', '\n']) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "redirect location contains a line break",
            ));
        }

        Ok(Response::empty(status).header("Location", location))
    }

    /// Response streaming the file at `path`.
    ///
    /// Without an explicit `content_type` the type is derived from the file
    /// extension (`css`, `gif`, `html`, `jpg`, `js`, `json`, `png`, `txt`),
    /// falling back to `application/octet-stream`.
    ///
    /// # Errors
    /// [`ErrorKind::Io`] if the file cannot be opened.
    pub async fn send_file<P: AsRef<Path>>(
        path: P,
        status: StatusCode,
        content_type: Option<&str>,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        let content_type = content_type.unwrap_or_else(|| mime_type(path));
        let file = tokio::fs::File::open(path).await?;

        Ok(Response::new(Body::from_reader(file))
            .status(status)
            .header("Content-Type", content_type))
    }
}

// Builder
impl Response {
    #[inline]
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Replaces the canonical reason phrase of the status line.
    #[inline]
    #[track_caller]
    pub fn reason<R: Into<String>>(mut self, reason: R) -> Self {
        let reason = reason.into();
        debug_assert!(
            !reason.contains(['\r', '\n']),
            "Reason phrase must not contain line breaks"
        );

        self.reason = Some(reason);
        self
    }

    /// Sets a header, replacing previous values of the same name.
    ///
    /// `Content-Length` is computed automatically for byte bodies and
    /// `Content-Type` defaults to `text/plain`.
    ///
    /// # Panics
    /// Panics in `debug` mode when the name or the value contains a line
    /// break. Release builds refuse to write such a response instead.
    #[inline]
    #[track_caller]
    pub fn header<V: fmt::Display>(mut self, name: &str, value: V) -> Self {
        let value = value.to_string();
        debug_header(name, &value);

        self.headers.set(name, value);
        self
    }

    /// Adds a header value, keeping previous ones; each value is sent as
    /// its own header line.
    #[inline]
    #[track_caller]
    pub fn append_header<V: fmt::Display>(mut self, name: &str, value: V) -> Self {
        let value = value.to_string();
        debug_header(name, &value);

        self.headers.append(name, value);
        self
    }

    /// Appends a `Set-Cookie` header.
    ///
    /// # Errors
    /// [`ErrorKind::InvalidInput`] if the name, value, path or domain
    /// contains a line break; the response is left unchanged.
    ///
    /// # Examples
    /// ```
    /// use nanodot::{CookieOptions, Response};
    ///
    /// let mut resp = Response::new("ok");
    /// resp.set_cookie("session", "abc", &CookieOptions {
    ///     path: Some("/".into()),
    ///     http_only: true,
    ///     ..CookieOptions::default()
    /// })?
    /// .set_cookie("theme", "dark", &CookieOptions::default())?;
    ///
    /// assert_eq!(
    ///     resp.headers().get_all("Set-Cookie"),
    ///     ["session=abc; Path=/; HttpOnly", "theme=dark"]
    /// );
    /// # Ok::<(), nanodot::Error>(())
    /// ```
    pub fn set_cookie(
        &mut self,
        name: &str,
        value: &str,
        options: &CookieOptions,
    ) -> Result<&mut Self, Error> {
        let parts = [Some(name), Some(value), options.path.as_deref(), options.domain.as_deref()];
        if parts.into_iter().flatten().any(has_line_break) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "cookie contains a line break",
            ));
        }

        let mut cookie = format!("{name}={value}");

        if let Some(path) = &options.path {
            cookie.push_str("; Path=");
            cookie.push_str(path);
        }
        if let Some(domain) = &options.domain {
            cookie.push_str("; Domain=");
            cookie.push_str(domain);
        }
        if let Some(expires) = &options.expires {
            cookie.push_str("; Expires=");
            cookie.push_str(&expires.format("%a, %d %b %Y %H:%M:%S GMT").to_string());
        }
        if let Some(max_age) = options.max_age {
            cookie.push_str("; Max-Age=");
            cookie.push_str(&max_age.to_string());
        }
        if options.secure {
            cookie.push_str("; Secure");
        }
        if options.http_only {
            cookie.push_str("; HttpOnly");
        }

        self.headers.append("Set-Cookie", cookie);
        Ok(self)
    }
}

// Accessors
impl Response {
    #[inline(always)]
    pub const fn status_code(&self) -> StatusCode {
        self.status
    }

    /// Reason phrase sent in the status line.
    #[inline]
    pub fn reason_phrase(&self) -> &str {
        self.reason.as_deref().unwrap_or(self.status.reason())
    }

    #[inline(always)]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[inline(always)]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    #[inline(always)]
    pub const fn body(&self) -> &Body {
        &self.body
    }

    #[inline(always)]
    pub fn into_body(self) -> Body {
        self.body
    }
}

// Serialization
impl Response {
    /// Adds the headers every response must carry.
    pub(crate) fn complete(&mut self) {
        if let Body::Bytes(bytes) = &self.body {
            if !self.headers.contains("Content-Length") {
                self.headers.set("Content-Length", bytes.len().to_string());
            }
        }

        if !self.headers.contains("Content-Type") {
            self.headers.set("Content-Type", "text/plain");
        }
    }

    /// Writes the status line, headers and body to `writer`.
    ///
    /// A reason phrase or header containing a line break is refused with
    /// [`io::ErrorKind::InvalidData`] before anything is written.
    pub(crate) async fn write_to<W>(mut self, writer: &mut W, limits: &RespLimits) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.complete();

        let broken_header = self
            .headers
            .iter()
            .any(|(name, value)| name.contains(':') || has_line_break(name) || has_line_break(value));
        if broken_header || has_line_break(self.reason_phrase()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response head contains a line break",
            ));
        }

        let mut head = Vec::with_capacity(limits.default_capacity);
        write!(
            head,
            "HTTP/1.0 {} {}\r\n",
            self.status.as_u16(),
            self.reason_phrase()
        )?;
        for (name, value) in self.headers.iter() {
            write!(head, "{name}: {value}\r\n")?;
        }
        head.extend_from_slice(b"\r\n");

        match self.body {
            Body::Bytes(bytes) => {
                head.extend_from_slice(&bytes);
                writer.write_all(&head).await?;
            }
            Body::Stream(mut reader) => {
                writer.write_all(&head).await?;

                let mut chunk = vec![0; limits.chunk_size.max(1)];
                loop {
                    let read = reader.read(&mut chunk).await?;
                    if read == 0 {
                        break;
                    }
                    writer.write_all(&chunk[..read]).await?;
                }
            }
            Body::Chunks(mut chunks) => {
                writer.write_all(&head).await?;

                while let Some(chunk) = chunks.next().await {
                    writer.write_all(&chunk?).await?;
                    writer.flush().await?;
                }
            }
        }

        writer.flush().await
    }
}

#[inline(always)]
fn has_line_break(text: &str) -> bool {
    text.contains(['\r', '\n'])
}

#[inline(always)]
#[track_caller]
fn debug_header(name: &str, value: &str) {
    debug_assert!(
        !name.is_empty() && !name.contains([':', '\r', '\n']),
        "Invalid header name: {name:?}"
    );
    debug_assert!(
        !value.contains(['\r', '\n']),
        "Header value must not contain line breaks"
    );
}

/// Content type for `path` based on its extension.
pub(crate) fn mime_type(path: &Path) -> &'static str {
    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

    match extension.to_ascii_lowercase().as_str() {
        "css" => "text/css",
        "gif" => "image/gif",
        "html" => "text/html",
        "jpg" => "image/jpeg",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Attributes of a cookie set with [`Response::set_cookie`].
#[derive(Debug, Clone, Default)]
pub struct CookieOptions {
    pub path: Option<String>,
    pub domain: Option<String>,
    /// Sent as an RFC 1123 date, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
    pub expires: Option<DateTime<Utc>>,
    /// Lifetime in seconds.
    pub max_age: Option<u64>,
    pub secure: bool,
    pub http_only: bool,
}

//

/// Conversion of handler output into a [`Response`].
///
/// | Value | Response |
/// |---|---|
/// | `&'static str`, `String` | `200`, text body |
/// | `Vec<u8>`, `&'static [u8]` | `200`, byte body |
/// | [`serde_json::Value`] | `200`, JSON body, `Content-Type: application/json` |
/// | [`Body`] | `200` with that body |
/// | `()` | `204 No Content` |
/// | `(T, StatusCode)` | `T` with the status replaced |
/// | `(T, StatusCode, HeaderMap)` | as above, headers merged over `T`'s |
///
/// # Examples
/// ```
/// use nanodot::{HeaderMap, IntoResponse, StatusCode};
///
/// let headers: HeaderMap = [("Retry-After", "5")].into_iter().collect();
/// let resp = ("busy", StatusCode::ServiceUnavailable, headers).into_response();
///
/// assert_eq!(resp.status_code(), StatusCode::ServiceUnavailable);
/// assert_eq!(resp.headers().get("retry-after"), Some("5"));
/// ```
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    #[inline(always)]
    fn into_response(self) -> Response {
        self
    }
}

impl IntoResponse for Body {
    #[inline]
    fn into_response(self) -> Response {
        Response::new(self)
    }
}

macro_rules! impl_into_response_for_body {
    ($($ty:ty),+) => {$(
        impl IntoResponse for $ty {
            #[inline]
            fn into_response(self) -> Response {
                Response::new(self)
            }
        }
    )+};
}

impl_into_response_for_body!(&'static str, String, &'static [u8], Vec<u8>);

impl IntoResponse for serde_json::Value {
    fn into_response(self) -> Response {
        Response::new(self.to_string()).header("Content-Type", "application/json")
    }
}

impl IntoResponse for () {
    #[inline]
    fn into_response(self) -> Response {
        Response::empty(StatusCode::NoContent)
    }
}

impl<T: IntoResponse> IntoResponse for (T, StatusCode) {
    #[inline]
    fn into_response(self) -> Response {
        self.0.into_response().status(self.1)
    }
}

impl<T: IntoResponse> IntoResponse for (T, StatusCode, HeaderMap) {
    fn into_response(self) -> Response {
        let mut resp = self.0.into_response().status(self.1);
        resp.headers.merge(self.2);
        resp
    }
}
