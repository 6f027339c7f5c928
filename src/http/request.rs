use crate::{
    errors::{Error, ErrorKind, ProtocolError},
    http::types::{slice_to_usize, HeaderMap},
    limits::ReqLimits,
    query::Query,
    server::server_impl::Shutdown,
    Method, MultiDict, Version,
};
use serde::de::DeserializeOwned;
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    net::SocketAddr,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, Take};

/// Reader over the request body, bounded by `Content-Length`.
pub type BodyStream = Take<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;

/// One inbound HTTP request.
///
/// Created by the worker for each accepted connection and dropped once the
/// response has been written.
///
/// # Wire format
///
/// ```text
/// [METHOD] SP [TARGET] SP "HTTP/" [VERSION] CRLF
/// [NAME] ":" [VALUE] CRLF      (zero or more)
/// CRLF
/// [BODY]                       (exactly Content-Length bytes)
/// ```
///
/// - Lines are read with a bounded read of
///   [`max_line_length`](ReqLimits::max_line_length) bytes; a longer line
///   makes the request malformed.
/// - `[TARGET]` is split at the first `?` into the path and the query
///   string; the query string is decoded into [`args`](Request::args).
/// - A repeated header name overwrites the previous value.
/// - `Content-Length`, `Content-Type` and `Cookie` are interpreted while
///   the headers are scanned. All other headers are kept verbatim.
///
/// # Body access
///
/// Nothing past the blank line is read until the application asks for it.
/// [`body`](Request::body) buffers the whole body in memory (up to
/// [`max_body_length`](ReqLimits::max_body_length));
/// [`stream`](Request::stream) hands out the raw reader. A request can use
/// one or the other, never both.
pub struct Request {
    method: Method,
    path: String,
    query_string: Option<String>,
    args: MultiDict,
    version: Version,

    headers: HeaderMap,
    cookies: HashMap<String, String>,
    content_length: usize,
    content_type: Option<String>,

    stream: BodyStream,
    body: Option<Vec<u8>>,
    body_used: bool,
    stream_used: bool,
    json: Option<serde_json::Value>,
    form: Option<MultiDict>,

    context: Context,
    client_addr: SocketAddr,
    shutdown: Shutdown,
    pub(crate) limits: ReqLimits,
}

impl Request {
    /// Reads the request line and headers from `reader`.
    ///
    /// Returns `Ok(None)` when the peer sent an empty request line (or
    /// closed the connection without sending anything).
    pub(crate) async fn create<R>(
        reader: R,
        client_addr: SocketAddr,
        limits: &ReqLimits,
        shutdown: Shutdown,
    ) -> Result<Option<Self>, ProtocolError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        let mut reader = BufReader::new(boxed);
        let mut line = Vec::with_capacity(128);

        // Request line
        read_line(&mut reader, &mut line, limits.max_line_length).await?;
        let first_line = utf8(trim(&line))?;
        if first_line.is_empty() {
            return Ok(None);
        }

        let mut parts = first_line.split_ascii_whitespace();
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtocolError::InvalidRequestLine);
        };

        let method = Method::from_bytes(method.as_bytes())?;
        let version = Version::from_bytes(version.as_bytes())?;
        let (path, query_string) = match target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (target.to_owned(), None),
        };
        let args = match &query_string {
            Some(query) => Query::parse(query.as_bytes())?,
            None => MultiDict::new(),
        };

        // Headers
        let mut headers = HeaderMap::new();
        let mut count = 0;
        loop {
            read_line(&mut reader, &mut line, limits.max_line_length).await?;
            let raw = utf8(trim(&line))?;
            if raw.is_empty() {
                break;
            }

            count += 1;
            if count > limits.header_count {
                return Err(ProtocolError::TooManyHeaders(limits.header_count));
            }

            let (name, value) = raw.split_once(':').ok_or(ProtocolError::InvalidHeader)?;
            let name = name.trim();
            if name.is_empty() {
                return Err(ProtocolError::InvalidHeader);
            }

            headers.set(name, value.trim());
        }

        let content_length = match headers.get("content-length") {
            Some(value) => {
                slice_to_usize(value.as_bytes()).ok_or(ProtocolError::InvalidContentLength)?
            }
            None => 0,
        };
        let content_type = headers.get("content-type").map(str::to_owned);
        let cookies = parse_cookies(headers.get("cookie"));

        Ok(Some(Request {
            method,
            path,
            query_string,
            args,
            version,

            headers,
            cookies,
            content_length,
            content_type,

            stream: reader.take(content_length as u64),
            body: None,
            body_used: false,
            stream_used: false,
            json: None,
            form: None,

            context: Context::default(),
            client_addr,
            shutdown,
            limits: limits.clone(),
        }))
    }
}

// Public API
impl Request {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Path portion of the request target, without the query string.
    #[inline(always)]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw (undecoded) query string, if the target contained a `?`.
    #[inline(always)]
    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    /// Decoded query string arguments.
    #[inline(always)]
    pub const fn args(&self) -> &MultiDict {
        &self.args
    }

    #[inline(always)]
    pub const fn http_version(&self) -> Version {
        self.version
    }

    #[inline(always)]
    pub const fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    #[inline(always)]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Header value with case-insensitive name matching.
    #[inline(always)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    #[inline(always)]
    pub const fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    #[inline(always)]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Declared `Content-Length`, `0` when absent.
    #[inline(always)]
    pub const fn content_length(&self) -> usize {
        self.content_length
    }

    #[inline(always)]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Per-request storage for application data (see [`Context`]).
    #[inline(always)]
    pub const fn context(&self) -> &Context {
        &self.context
    }

    #[inline(always)]
    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Handle used to stop the server once this response is written.
    ///
    /// ```
    /// # async fn handler(req: &mut nanodot::Request) {
    /// req.shutdown().request();
    /// # }
    /// ```
    #[inline(always)]
    pub const fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// The whole body, read and buffered on first access.
    ///
    /// # Errors
    /// - [`ErrorKind::BodyConflict`] if [`stream`](Request::stream) was used.
    /// - [`ErrorKind::BodyTooLarge`] if `Content-Length` exceeds
    ///   [`max_body_length`](ReqLimits::max_body_length). Nothing is read in
    ///   that case, so the body stays available through `stream`.
    /// - [`ErrorKind::Io`] if the peer closes before sending the full body.
    pub async fn body(&mut self) -> Result<&[u8], Error> {
        if self.stream_used {
            return Err(Error::new(
                ErrorKind::BodyConflict,
                "cannot use both stream and body",
            ));
        }

        if self.body.is_none() {
            if self.content_length > self.limits.max_body_length {
                return Err(Error::new(
                    ErrorKind::BodyTooLarge,
                    format!(
                        "body of {} bytes exceeds the {} bytes buffer limit",
                        self.content_length, self.limits.max_body_length
                    ),
                ));
            }

            let mut buffer = vec![0; self.content_length];
            self.stream.read_exact(&mut buffer).await?;

            self.body_used = self.content_length > 0;
            self.body = Some(buffer);
        }

        Ok(self.body.as_deref().unwrap_or_default())
    }

    /// Raw body reader, limited to `Content-Length` bytes.
    ///
    /// # Errors
    /// [`ErrorKind::BodyConflict`] if [`body`](Request::body) already
    /// consumed the body.
    pub fn stream(&mut self) -> Result<&mut BodyStream, Error> {
        if self.body_used {
            return Err(Error::new(
                ErrorKind::BodyConflict,
                "cannot use both stream and body",
            ));
        }

        self.stream_used = true;
        Ok(&mut self.stream)
    }

    /// Body parsed as JSON, or `None` unless the content type is
    /// `application/json`.
    pub async fn json(&mut self) -> Result<Option<&serde_json::Value>, Error> {
        if self.json.is_none() {
            if !self.has_mime("application/json") {
                return Ok(None);
            }

            let value: serde_json::Value = serde_json::from_slice(self.body().await?)?;
            self.json = Some(value);
        }

        Ok(self.json.as_ref())
    }

    /// Body deserialized into `T`, or `None` unless the content type is
    /// `application/json`.
    pub async fn json_as<T: DeserializeOwned>(&mut self) -> Result<Option<T>, Error> {
        match self.json().await? {
            Some(value) => Ok(Some(T::deserialize(value)?)),
            None => Ok(None),
        }
    }

    /// Body parsed as a urlencoded form, or `None` unless the content type
    /// is `application/x-www-form-urlencoded`.
    pub async fn form(&mut self) -> Result<Option<&MultiDict>, Error> {
        if self.form.is_none() {
            if !self.has_mime("application/x-www-form-urlencoded") {
                return Ok(None);
            }

            let form: MultiDict = Query::parse(self.body().await?)?;
            self.form = Some(form);
        }

        Ok(self.form.as_ref())
    }

    #[inline]
    fn has_mime(&self, mime: &str) -> bool {
        self.content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|ct| ct.trim().eq_ignore_ascii_case(mime))
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query_string", &self.query_string)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .field("client_addr", &self.client_addr)
            .finish_non_exhaustive()
    }
}

// Parsing helpers

async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>, max: usize) -> Result<(), ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let read = (&mut *reader)
        .take(max as u64 + 1)
        .read_until(b'\n', line)
        .await?;

    if read > max {
        return Err(ProtocolError::LineTooLong(max));
    }

    Ok(())
}

#[inline]
fn trim(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if !first.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    while let [rest @ .., last] = bytes {
        if !last.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    bytes
}

#[inline]
fn utf8(bytes: &[u8]) -> Result<&str, ProtocolError> {
    simdutf8::basic::from_utf8(bytes).map_err(|_| ProtocolError::InvalidEncoding)
}

fn parse_cookies(header: Option<&str>) -> HashMap<String, String> {
    header
        .into_iter()
        .flat_map(|value| value.split(';'))
        .filter_map(|cookie| cookie.trim().split_once('='))
        .map(|(name, value)| (name.to_owned(), value.to_owned()))
        .collect()
}

//

/// Free-form per-request storage, keyed by type.
///
/// Before-handlers typically use it to pass data (an authenticated user, a
/// timer) to the route handler and after-handlers.
///
/// # Examples
/// ```
/// use nanodot::Context;
///
/// struct User(&'static str);
///
/// let mut ctx = Context::default();
/// ctx.insert(User("admin"));
/// ctx.insert(7u32);
///
/// assert_eq!(ctx.get::<User>().map(|u| u.0), Some("admin"));
/// *ctx.get_mut::<u32>().unwrap() += 1;
/// assert_eq!(ctx.remove::<u32>(), Some(8));
/// assert!(!ctx.contains::<u32>());
/// ```
#[derive(Default)]
pub struct Context {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Context {
    /// Stores `value`, returning the previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref())
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.values
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut())
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("len", &self.values.len())
            .finish()
    }
}

#[cfg(test)]
mod parse_tests {
    use super::*;
    use crate::tools::*;

    #[tokio::test]
    async fn parse_valid_request() {
        #[rustfmt::skip]
        let cases = vec![
            (
                "GET / HTTP/1.1\r\n\r\n",
                (Method::Get, "/", None, Version::Http11, vec![], 0),
            ),
            (
                "GET /api/qwe/name HTTP/1.0\r\n\r\n",
                (Method::Get, "/api/qwe/name", None, Version::Http10, vec![], 0),
            ),
            (
                "POST /test?a=1 HTTP/1.0\r\nHOST: 127.0.0.1\r\n\r\n",
                (
                    Method::Post, "/test", Some("a=1"), Version::Http10,
                    vec![("HOST", "127.0.0.1")], 0,
                ),
            ),
            (
                "PUT /qwe HTTP/1.1\r\nHost: a\r\nUser-Agent:   curl  \r\nContent-Length: 3\r\n\r\nabc",
                (
                    Method::Put, "/qwe", None, Version::Http11,
                    vec![("Host", "a"), ("User-Agent", "curl"), ("Content-Length", "3")], 3,
                ),
            ),
            (
                "DELETE /x HTTP/1.0\nX-Lf-Only: yes\n\n",
                (Method::Delete, "/x", None, Version::Http10, vec![("X-Lf-Only", "yes")], 0),
            ),
            (
                "OPTIONS /empty HTTP/1.1\r\nX-Empty:\r\n\r\n",
                (Method::Options, "/empty", None, Version::Http11, vec![("X-Empty", "")], 0),
            ),
        ];

        for (raw, (method, path, query, version, headers, length)) in cases {
            let req = request(raw).await;

            assert_eq!(req.method(), method, "{raw:?}");
            assert_eq!(req.path(), path, "{raw:?}");
            assert_eq!(req.query_string(), query, "{raw:?}");
            assert_eq!(req.http_version(), version, "{raw:?}");
            assert_eq!(req.headers().iter().collect::<Vec<_>>(), headers, "{raw:?}");
            assert_eq!(req.content_length(), length, "{raw:?}");
        }
    }

    #[tokio::test]
    async fn parse_invalid_request() {
        #[rustfmt::skip]
        let cases: [&[u8]; 10] = [
            b"GET /\r\n\r\n",
            b"GET / HTTP/1.1 extra\r\n\r\n",
            b"FETCH / HTTP/1.1\r\n\r\n",
            b"GET / HTTP/2.0\r\n\r\n",
            b"GET / HTTP/1.1\r\nNoColon\r\n\r\n",
            b"GET / HTTP/1.1\r\n: value\r\n\r\n",
            b"GET / HTTP/1.1\r\nContent-Length: -1\r\n\r\n",
            b"GET / HTTP/1.1\r\nContent-Length: ten\r\n\r\n",
            b"GET /?q=%zz HTTP/1.1\r\n\r\n",
            b"GET /\xff HTTP/1.1\r\n\r\n",
        ];

        for raw in cases {
            assert!(try_request(raw, ReqLimits::default()).await.is_err(), "{raw:?}");
        }
    }

    #[tokio::test]
    async fn empty_request_is_absent() {
        for raw in ["", "\r\n", "   \r\n"] {
            assert!(try_request(raw.as_bytes(), ReqLimits::default())
                .await
                .unwrap()
                .is_none());
        }
    }

    #[tokio::test]
    async fn line_length_limit() {
        let limits = ReqLimits {
            max_line_length: 32,
            ..ReqLimits::default()
        };

        // 30 bytes + CRLF = 32
        let fits = format!("GET /{} HTTP/1.0\r\n\r\n", "a".repeat(16));
        assert!(try_request(fits.as_bytes(), limits.clone()).await.unwrap().is_some());

        let long_line = format!("GET /{} HTTP/1.0\r\n\r\n", "a".repeat(17));
        assert!(matches!(
            try_request(long_line.as_bytes(), limits.clone()).await,
            Err(ProtocolError::LineTooLong(32))
        ));

        let long_header = format!("GET / HTTP/1.0\r\nX: {}\r\n\r\n", "b".repeat(40));
        assert!(matches!(
            try_request(long_header.as_bytes(), limits).await,
            Err(ProtocolError::LineTooLong(32))
        ));
    }

    #[tokio::test]
    async fn header_count_limit() {
        let limits = ReqLimits {
            header_count: 2,
            ..ReqLimits::default()
        };

        let ok = "GET / HTTP/1.0\r\nA: 1\r\nB: 2\r\n\r\n";
        assert!(try_request(ok.as_bytes(), limits.clone()).await.is_ok());

        let too_many = "GET / HTTP/1.0\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n";
        assert!(matches!(
            try_request(too_many.as_bytes(), limits).await,
            Err(ProtocolError::TooManyHeaders(2))
        ));
    }

    #[tokio::test]
    async fn query_args() {
        let req = request("GET /search?a=1&a=2&b=x&name=J%C3%B6rg+M HTTP/1.0\r\n\r\n").await;

        assert_eq!(req.path(), "/search");
        assert_eq!(req.query_string(), Some("a=1&a=2&b=x&name=J%C3%B6rg+M"));
        assert_eq!(req.args().get("a"), Some("1"));
        assert_eq!(req.args().get_list("a"), ["1", "2"]);
        assert_eq!(req.args().get("b"), Some("x"));
        assert_eq!(req.args().get("name"), Some("Jörg M"));
    }

    #[tokio::test]
    async fn duplicate_headers_overwrite() {
        let req = request("GET / HTTP/1.0\r\nX-Id: 1\r\nx-id: 2\r\n\r\n").await;

        assert_eq!(req.headers().len(), 1);
        assert_eq!(req.header("X-ID"), Some("2"));
    }

    #[tokio::test]
    async fn cookies() {
        let req = request(
            "GET / HTTP/1.0\r\nCookie: session=abc; theme=dark ;broken; token=a=b\r\n\r\n",
        )
        .await;

        assert_eq!(req.cookies().len(), 3);
        assert_eq!(req.cookie("session"), Some("abc"));
        assert_eq!(req.cookie("theme"), Some("dark"));
        assert_eq!(req.cookie("token"), Some("a=b"));
        assert_eq!(req.cookie("broken"), None);
    }
}
