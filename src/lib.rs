//! nanodot - minimal embedded HTTP/1.0 server core
//!
//! A small application server for devices and internal tools: typed URL
//! routing, before/after request hooks, error handlers keyed by status code
//! or error kind, and responses with byte, JSON, file or streamed bodies.
//!
//! # Protocol Support
//!
//! - **HTTP/1.0 framing**: one request per connection; the connection is
//!   closed once the response is written
//! - **HTTP/1.1 requests** are accepted and answered the same way
//! - No keep-alive, no chunked transfer encoding, no TLS
//!
//! # Characteristics
//!
//! - **Lazy bodies** - nothing past the headers is read until a handler asks
//!   for [`body`](Request::body), [`json`](Request::json),
//!   [`form`](Request::form) or [`stream`](Request::stream)
//! - **Bounded parsing** - line length, header count and body size limits,
//!   all set per server ([`limits`])
//! - **Selectable concurrency** - a task per connection, a fixed worker
//!   pool, or fully sequential handling
//!   ([`Concurrency`](limits::Concurrency))
//! - **Contained failures** - handler errors and panics become error
//!   responses; the server keeps accepting
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use nanodot::{App, IntoResponse};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let mut app = App::new();
//!     app.get("/", |_, _| Box::pin(async { Ok("Hello World!".into_response()) }))
//!         .unwrap();
//!
//!     app.run("0.0.0.0", 5000, true).await
//! }
//! ```
//! Routes, hooks and error handlers:
//! ```no_run
//! use nanodot::{App, Error, ErrorKind, IntoResponse, Response, StatusCode};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let mut app = App::new();
//!
//!     app.get("/valves/<int:id>", |_, args| Box::pin(async move {
//!         match args.int("id") {
//!             Some(id @ 1..=8) => Ok(json!({"valve": id, "open": false}).into_response()),
//!             _ => Err(Error::custom("valve", "no such valve")),
//!         }
//!     }))
//!     .unwrap();
//!
//!     app.put("/valves/<int:id>", |req, args| {
//!         let id = args.int("id");
//!         Box::pin(async move {
//!             let state: Option<serde_json::Value> = req.json_as().await?;
//!             Response::json(&json!({"valve": id, "state": state}))
//!         })
//!     })
//!     .unwrap();
//!
//!     app.after_request(|_, resp| Box::pin(async move {
//!         Ok(resp.header("Server", "nanodot"))
//!     }));
//!
//!     app.exception_handler(ErrorKind::Custom("valve"), |_, err| {
//!         let message = err.message().to_owned();
//!         Box::pin(async move { Ok((message, StatusCode::NotFound).into_response()) })
//!     });
//!
//!     app.run("0.0.0.0", 5000, false).await
//! }
//! ```
//! Advanced configuration:
//! ```no_run
//! use nanodot::{App, Server, limits::{Concurrency, ReqLimits, RespLimits, ServerLimits}};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     Server::builder()
//!         .app(App::new())
//!         .bind("0.0.0.0", 8080)
//!         .debug(true)
//!         .server_limits(ServerLimits {
//!             concurrency: Concurrency::Sequential,
//!             ..ServerLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             max_line_length: 4 * 1024, // long query strings
//!             header_count: 16,
//!             ..ReqLimits::default()
//!         })
//!         .response_limits(RespLimits {
//!             chunk_size: 4 * 1024, // larger reads for send_file
//!             ..RespLimits::default()
//!         })
//!         .build()?
//!         .launch()
//!         .await
//! }
//! ```
//!
//! # Logging
//!
//! The crate logs through [`tracing`]: server start and stop at `INFO`,
//! malformed requests at `WARN`, failing handlers at `ERROR`, and one access
//! line per request (`INFO` in debug mode, `DEBUG` otherwise). Install any
//! subscriber to see them.

pub(crate) mod http {
    pub(crate) mod multidict;
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod app;
    pub(crate) mod connection;
    pub(crate) mod router;
    pub(crate) mod server_impl;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::{Error, ErrorKind},
    http::{
        multidict::MultiDict,
        query,
        request::{BodyStream, Context, Request},
        response::{Body, CookieOptions, IntoResponse, Response},
        types::{HeaderMap, Method, StatusCode, Version},
    },
    server::{
        app::App,
        router::{PathArgs, PathValue, PatternError, UrlPattern},
        server_impl::{Server, ServerBuilder, Shutdown},
    },
};
pub use futures_util::future::BoxFuture;

#[cfg(test)]
pub(crate) mod tools {
    pub(crate) use crate::limits::ReqLimits;
    use crate::{errors::ProtocolError, server::server_impl::Shutdown, Body, Request, Response};
    use std::{io::Cursor, net::SocketAddr, str::from_utf8};

    #[inline]
    pub(crate) fn client_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    pub(crate) async fn try_request(
        raw: &[u8],
        limits: ReqLimits,
    ) -> Result<Option<Request>, ProtocolError> {
        Request::create(
            Cursor::new(raw.to_vec()),
            client_addr(),
            &limits,
            Shutdown::default(),
        )
        .await
    }

    pub(crate) async fn request_with(raw: &str, limits: ReqLimits) -> Request {
        try_request(raw.as_bytes(), limits).await.unwrap().unwrap()
    }

    pub(crate) async fn request(raw: &str) -> Request {
        request_with(raw, ReqLimits::default()).await
    }

    #[inline]
    pub(crate) fn text(resp: &Response) -> &str {
        match resp.body() {
            Body::Bytes(bytes) => from_utf8(bytes).unwrap(),
            other => panic!("expected a byte body, got {other:?}"),
        }
    }
}
