use crate::{
    limits::{Concurrency, ReqLimits, RespLimits, ServerLimits, WaitStrategy},
    server::{app::App, connection::Worker},
};
use crossbeam::queue::SegQueue;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Notify,
    task::{yield_now, JoinError, JoinSet},
    time::sleep as tokio_sleep,
};
use tracing::{debug, error, info};

/// Pending connections queued by the kernel before `accept`.
const LISTEN_BACKLOG: i32 = 5;

/// Cooperative server stop signal.
///
/// Cloning is cheap; every clone controls the same server. A handler calls
/// [`request`](Shutdown::request) on [`Request::shutdown`](crate::Request::shutdown);
/// once the response of that request has been written the accept loop
/// stops and the listening socket is closed. Requests already being
/// handled by other workers run to completion before
/// [`Server::launch`] returns.
///
/// A handle taken from [`App::shutdown`] or [`Server::shutdown`] is not
/// tied to a request: calling `request` on it stops accepting right away.
///
/// # Examples
/// ```no_run
/// use nanodot::{App, IntoResponse};
///
/// # async fn run() -> std::io::Result<()> {
/// let mut app = App::new();
/// app.post("/shutdown", |req, _| Box::pin(async move {
///     req.shutdown().request();
///     Ok("The server is shutting down...".into_response())
/// })).unwrap();
///
/// app.run("0.0.0.0", 5000, false).await
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownState>,
    /// Set when this request's handler asked for shutdown; `None` for
    /// handles that are not bound to a request.
    triggered: Option<Arc<AtomicBool>>,
}

#[derive(Debug, Default)]
struct ShutdownState {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    /// Asks the server to stop after the current response.
    #[inline]
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::Release);

        match &self.triggered {
            Some(triggered) => triggered.store(true, Ordering::Release),
            None => self.wake(),
        }
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    /// Handle for one request; the worker serving it wakes the accept loop
    /// only if this handle was used.
    #[inline]
    pub(crate) fn for_request(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            triggered: Some(Arc::new(AtomicBool::new(false))),
        }
    }

    #[inline]
    pub(crate) fn triggered(&self) -> bool {
        self.triggered
            .as_ref()
            .is_some_and(|triggered| triggered.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn reset(&self) {
        self.inner.requested.store(false, Ordering::Release);
    }

    /// Wakes the accept loop; the wake-up is kept if nobody waits yet.
    #[inline]
    pub(crate) fn wake(&self) {
        self.inner.notify.notify_one();
    }

    #[inline]
    pub(crate) async fn woken(&self) {
        self.inner.notify.notified().await
    }
}

/// An HTTP server serving one [`App`].
///
/// # Examples
///
/// ```no_run
/// use nanodot::{App, IntoResponse, Server};
///
/// #[tokio::main]
/// async fn main() -> std::io::Result<()> {
///     let mut app = App::new();
///     app.get("/", |_, _| Box::pin(async { Ok("Hello world!".into_response()) }))
///         .unwrap();
///
///     Server::builder()
///         .app(app)
///         .bind("127.0.0.1", 8080)
///         .build()?
///         .launch()
///         .await
/// }
/// ```
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    app: App,
    debug: bool,

    server_limits: ServerLimits,
    request_limits: ReqLimits,
    response_limits: RespLimits,
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            app: None,
            listener: None,
            bind: None,
            debug: false,

            server_limits: None,
            request_limits: None,
            response_limits: None,
        }
    }

    /// Address the listening socket is bound to.
    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle stopping this server from outside a request, see [`Shutdown`].
    #[inline]
    pub fn shutdown(&self) -> Shutdown {
        self.app.shutdown().clone()
    }

    /// Accepts connections until shutdown is requested, then waits for
    /// every in-flight worker to write its response.
    ///
    /// # Errors
    /// An accept failure other than a connection aborted by the peer
    /// stops the server and is returned, once the running workers are done.
    pub async fn launch(self) -> io::Result<()> {
        let shutdown = self.app.shutdown().clone();
        shutdown.reset();

        let concurrency = self.server_limits.concurrency.clone();
        let addr = self.listener.local_addr()?;
        let worker = Arc::new(Worker::new(
            self.app,
            self.request_limits,
            self.response_limits,
            self.debug,
        ));
        let mut launcher = Launcher::start(&concurrency, worker);

        info!("Starting {} server on {addr}", concurrency.name());

        let mut result = Ok(());
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.woken() => match shutdown.is_requested() {
                    true => break,
                    // Stale wake-up from a previous run
                    false => continue,
                },
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, client_addr)) => launcher.dispatch(stream, client_addr).await,
                Err(err) if err.kind() == io::ErrorKind::ConnectionAborted => {
                    debug!("connection aborted before accept: {err}");
                }
                Err(err) => {
                    error!("accept failed, stopping server: {err}");
                    result = Err(err);
                    break;
                }
            }
        }

        // Close
        drop(self.listener);
        launcher.finish().await;

        info!("Server on {addr} stopped");
        result
    }
}

/// Hands accepted connections to workers.
enum Launcher {
    PerConnection {
        worker: Arc<Worker>,
        tasks: JoinSet<()>,
    },
    Pool {
        queue: TcpQueue,
        closed: Arc<AtomicBool>,
        tasks: JoinSet<()>,
    },
    Sequential(Arc<Worker>),
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;

impl Launcher {
    fn start(concurrency: &Concurrency, worker: Arc<Worker>) -> Self {
        match concurrency {
            Concurrency::PerConnection => Launcher::PerConnection {
                worker,
                tasks: JoinSet::new(),
            },
            Concurrency::Pool { workers, wait } => {
                let queue = Arc::new(SegQueue::new());
                let closed = Arc::new(AtomicBool::new(false));
                let mut tasks = JoinSet::new();

                for _ in 0..(*workers).max(1) {
                    let (queue, worker, closed) = (queue.clone(), worker.clone(), closed.clone());
                    let wait = wait.clone();

                    tasks.spawn(async move {
                        while let Some((stream, client_addr)) =
                            Self::next_stream(&queue, &wait, &closed).await
                        {
                            worker.serve(stream, client_addr).await;
                        }
                    });
                }

                Launcher::Pool {
                    queue,
                    closed,
                    tasks,
                }
            }
            Concurrency::Sequential => Launcher::Sequential(worker),
        }
    }

    #[inline]
    async fn dispatch(&mut self, stream: TcpStream, client_addr: SocketAddr) {
        match self {
            Launcher::PerConnection { worker, tasks } => {
                // Reap finished connections so the set stays small
                while let Some(joined) = tasks.try_join_next() {
                    log_join(joined);
                }

                let worker = worker.clone();
                tasks.spawn(async move { worker.serve(stream, client_addr).await });
            }
            Launcher::Pool { queue, .. } => queue.push((stream, client_addr)),
            Launcher::Sequential(worker) => worker.serve(stream, client_addr).await,
        }
    }

    /// Waits for every worker; pool workers first drain the queue.
    async fn finish(self) {
        let mut tasks = match self {
            Launcher::PerConnection { tasks, .. } => tasks,
            Launcher::Pool { closed, tasks, .. } => {
                closed.store(true, Ordering::Release);
                tasks
            }
            Launcher::Sequential(_) => return,
        };

        if !tasks.is_empty() {
            debug!("waiting for {} workers", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
    }

    /// Next queued connection; `None` once the launcher is closed and the
    /// queue is drained.
    #[inline]
    async fn next_stream(
        queue: &TcpQueue,
        wait: &WaitStrategy,
        closed: &AtomicBool,
    ) -> Option<(TcpStream, SocketAddr)> {
        loop {
            if let Some(value) = queue.pop() {
                return Some(value);
            }
            if closed.load(Ordering::Acquire) {
                return None;
            }

            match wait {
                WaitStrategy::Yield => yield_now().await,
                WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
            }
        }
    }
}

#[inline]
fn log_join(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        error!("worker task failed: {err}");
    }
}

/// Binds `host:port` with address reuse and the fixed backlog.
pub(crate) fn bind_listener(host: &str, port: u16) -> io::Result<TcpListener> {
    let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("`{host}` did not resolve to any address"),
        )
    })?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    TcpListener::from_std(socket.into())
}

//

/// Builder for configuring and creating [`Server`] instances.
#[derive(Debug)]
pub struct ServerBuilder {
    app: Option<App>,
    listener: Option<TcpListener>,
    bind: Option<(String, u16)>,
    debug: bool,

    server_limits: Option<ServerLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
}

impl ServerBuilder {
    /// Sets the application to serve.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn app(mut self, app: App) -> Self {
        self.app = Some(app);
        self
    }

    /// Uses an already bound listener; takes precedence over
    /// [`bind`](Self::bind).
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # #[tokio::main]
    /// # async fn main() -> std::io::Result<()> {
    /// use nanodot::{App, Server};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:0").await?)
    ///     .app(App::new())
    ///     .build()?;
    /// println!("listening on {}", server.local_addr()?);
    /// # Ok(())
    /// # }
    /// ```
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Binds a new listening socket on `host:port` when the server is built.
    ///
    /// The socket has `SO_REUSEADDR` set and a backlog of 5.
    #[inline(always)]
    pub fn bind(mut self, host: &str, port: u16) -> Self {
        self.bind = Some((host.to_owned(), port));
        self
    }

    /// Emits the access log at `INFO` instead of `DEBUG` level.
    #[inline(always)]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Configures the concurrency strategy.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # #[tokio::main]
    /// # async fn main() -> std::io::Result<()> {
    /// use nanodot::{App, Server, limits::{Concurrency, ServerLimits, WaitStrategy}};
    ///
    /// let server = Server::builder()
    ///     .app(App::new())
    ///     .bind("127.0.0.1", 8080)
    ///     .server_limits(ServerLimits {
    ///         concurrency: Concurrency::Pool {
    ///             workers: 4,
    ///             wait: WaitStrategy::Yield,
    ///         },
    ///         ..ServerLimits::default()
    ///     })
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures request parsing limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures response serialization limits.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Finalizes the builder, binding the socket if needed.
    ///
    /// # Errors
    /// - [`io::ErrorKind::InvalidInput`] when [`app`](Self::app) was not
    ///   called, or neither [`listener`](Self::listener) nor
    ///   [`bind`](Self::bind).
    /// - Any error raised while resolving or binding the address.
    pub fn build(self) -> io::Result<Server> {
        let app = self.app.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "The `app` method must be called to create",
            )
        })?;

        let listener = match (self.listener, self.bind) {
            (Some(listener), _) => listener,
            (None, Some((host, port))) => bind_listener(&host, port)?,
            (None, None) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "The `listener` or `bind` method must be called to create",
                ))
            }
        };

        Ok(Server {
            listener,
            app,
            debug: self.debug,

            server_limits: self.server_limits.unwrap_or_default(),
            request_limits: self.request_limits.unwrap_or_default(),
            response_limits: self.response_limits.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_handle() {
        let shutdown = Shutdown::default();
        let clone = shutdown.clone();

        assert!(!shutdown.is_requested());
        clone.request();
        assert!(shutdown.is_requested());

        // A wake-up sent before anyone waits is not lost
        clone.wake();
        tokio::time::timeout(std::time::Duration::from_secs(1), shutdown.woken())
            .await
            .unwrap();

        shutdown.reset();
        assert!(!clone.is_requested());
    }

    #[tokio::test]
    async fn bind_reuses_address() {
        let listener = bind_listener("127.0.0.1", 0).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn builder_requires_parts() {
        let err = Server::builder().bind("127.0.0.1", 0).build().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = Server::builder().app(App::new()).build().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let server = Server::builder()
            .app(App::new())
            .bind("127.0.0.1", 0)
            .build()
            .unwrap();
        assert!(server.local_addr().unwrap().port() != 0);
    }

    #[tokio::test]
    async fn pool_workers_drain_then_exit() {
        let queue: TcpQueue = Arc::new(SegQueue::new());
        let closed = AtomicBool::new(false);

        let pending = Launcher::next_stream(&queue, &WaitStrategy::Yield, &closed);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), pending)
                .await
                .is_err(),
            "an open pool keeps waiting"
        );

        closed.store(true, Ordering::Release);
        let next = Launcher::next_stream(&queue, &WaitStrategy::Yield, &closed).await;
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn request_handles_only_mark_their_request() {
        let root = Shutdown::default();
        let first = root.for_request();
        let second = root.for_request();

        first.request();
        assert!(root.is_requested() && second.is_requested());
        assert!(first.triggered());
        assert!(!second.triggered() && !root.triggered());

        // A request-bound handle leaves waking to its worker
        let quiet = tokio::time::timeout(std::time::Duration::from_millis(20), root.woken()).await;
        assert!(quiet.is_err());

        // The root handle wakes the accept loop directly
        root.request();
        tokio::time::timeout(std::time::Duration::from_secs(1), root.woken())
            .await
            .unwrap();
    }
}
