//! Server configuration limits and the concurrency strategy
//!
//! Every value here is handed to the [`Server`](crate::Server) at build
//! time and travels with it; there are no process-wide tunables.
//!
//! # Examples
//!
//! ```no_run
//! use nanodot::{App, Server, limits::{Concurrency, ReqLimits, ServerLimits}};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     Server::builder()
//!         .app(App::new())
//!         .bind("0.0.0.0", 5000)
//!         .server_limits(ServerLimits {
//!             concurrency: Concurrency::Sequential, // single-core target
//!             ..ServerLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             max_content_length: 1024 * 1024, // firmware uploads
//!             max_body_length: 4 * 1024,       // larger bodies via `stream()`
//!             ..ReqLimits::default()
//!         })
//!         .build()?
//!         .launch()
//!         .await
//! }
//! ```

use std::time::Duration;

/// Server-level behaviour: how accepted connections are turned into workers.
#[derive(Debug, Clone, Default)]
pub struct ServerLimits {
    /// Worker dispatch strategy (default: [`Concurrency::PerConnection`]).
    ///
    /// Chosen once when the server is built; it never changes per request.
    pub concurrency: Concurrency,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

/// Strategy used to run one worker per accepted connection.
///
/// ```text
///                     [------------]
///                     [ Tcp accept ]
///                     [------------]
///                           ||
///        /==================##===================\
///        ||                 ||                  ||
///  PerConnection          Pool              Sequential
///  tokio::spawn     push to SegQueue,      handled inline,
///  per connection   N workers pop it       accept waits
/// ```
#[derive(Debug, Clone, Default)]
pub enum Concurrency {
    /// One spawned task per accepted connection, fully concurrent.
    #[default]
    PerConnection,

    /// A fixed set of worker tasks, created once, pulling accepted
    /// connections from a shared lock-free queue.
    Pool {
        /// Number of worker tasks.
        workers: usize,
        /// How idle workers wait for the queue to refill.
        wait: WaitStrategy,
    },

    /// No concurrency: each connection is handled to completion inside the
    /// accept loop before the next one is accepted.
    Sequential,
}

impl Concurrency {
    pub(crate) const fn name(&self) -> &'static str {
        match self {
            Concurrency::PerConnection => "threaded",
            Concurrency::Pool { .. } => "pooled",
            Concurrency::Sequential => "sync",
        }
    }
}

/// Strategy for pool workers waiting when no connections are queued
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`tokio::task::yield_now()`]
    ///
    /// Lowest latency, keeps a core busy.
    Yield,

    /// While waiting, uses [`tokio::time::sleep()`]
    Sleep(Duration),
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::Sleep(Duration::from_micros(50))
    }
}

/// Request parsing limits.
///
/// Lines are read one at a time with a bounded read; nothing beyond the
/// head is buffered until the application asks for the body.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Largest accepted `Content-Length` (default: `16 KiB`).
    ///
    /// Larger requests are answered with `413 Payload Too Large` before any
    /// application handler runs.
    pub max_content_length: usize,

    /// Largest body buffered by [`Request::body`](crate::Request::body)
    /// (default: `16 KiB`).
    ///
    /// Bodies between this value and `max_content_length` are accepted but
    /// must be consumed through [`Request::stream`](crate::Request::stream).
    pub max_body_length: usize,

    /// Longest request line or header line, terminator included
    /// (default: `2 KiB`). Longer lines make the request malformed (`400`).
    pub max_line_length: usize,

    /// Maximum number of header lines (default: `32`).
    pub header_count: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            max_content_length: 16 * 1024,
            max_body_length: 16 * 1024,
            max_line_length: 2 * 1024,
            header_count: 32,

            _priv: (),
        }
    }
}

/// Response serialization limits.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial capacity of the buffer holding the status line and headers
    /// (default: `1024 B`).
    pub default_capacity: usize,

    /// Read size used when streaming a reader body, e.g. a file sent with
    /// [`Response::send_file`](crate::Response::send_file) (default: `1024 B`).
    pub chunk_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            chunk_size: 1024,

            _priv: (),
        }
    }
}
