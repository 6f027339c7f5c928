//! Route table, request hooks and the dispatch pipeline.

use crate::{
    errors::{Error, ErrorKind},
    server::{
        router::{PathArgs, PatternError, UrlPattern},
        server_impl::{Server, Shutdown},
    },
    Method, Request, Response, StatusCode,
};
use futures_util::{future::BoxFuture, FutureExt};
use std::{any::Any, collections::HashMap, fmt, future::Future, io, panic::AssertUnwindSafe};
use tracing::error;

type RouteFn = Box<
    dyn for<'a> Fn(&'a mut Request, &'a PathArgs) -> BoxFuture<'a, Result<Response, Error>>
        + Send
        + Sync,
>;
type BeforeFn = Box<
    dyn for<'a> Fn(&'a mut Request) -> BoxFuture<'a, Result<Option<Response>, Error>> + Send + Sync,
>;
type AfterFn =
    Box<dyn for<'a> Fn(&'a mut Request, Response) -> BoxFuture<'a, Result<Response, Error>> + Send + Sync>;
type StatusFn = Box<dyn for<'a> Fn(&'a mut Request) -> BoxFuture<'a, Result<Response, Error>> + Send + Sync>;
type KindFn =
    Box<dyn for<'a> Fn(&'a mut Request, &'a Error) -> BoxFuture<'a, Result<Response, Error>> + Send + Sync>;

struct Route {
    methods: Vec<Method>,
    pattern: UrlPattern,
    handler: RouteFn,
}

/// The application: routes, hooks and error handlers.
///
/// Everything is registered once, before the server starts; while serving
/// the tables are only read.
///
/// # Pipeline
///
/// For every parsed request:
/// 1. `Content-Length` above
///    [`max_content_length`](crate::limits::ReqLimits::max_content_length)
///    is answered with `413` before any application code runs.
/// 2. Before-handlers run in registration order. The first one returning
///    a response short-circuits: neither the remaining before-handlers nor
///    the route handler run.
/// 3. Otherwise the first route accepting the method and matching the path
///    is called. No such route gives `404` (a path registered under another
///    method gets `404` too, not `405`).
/// 4. After-handlers run in registration order and may replace the response.
///
/// A failure in steps 2 to 4 (an `Err` or a panic) is logged and resolved by
/// the [exception handler](App::exception_handler) registered for its
/// [`ErrorKind`], else by the [error handler](App::error_handler) for
/// `500`, else by a plain `500 Internal Server Error`. A failing error
/// handler is logged and skipped.
///
/// # Handlers
///
/// Handlers are closures returning a boxed future borrowing the request:
///
/// ```
/// use nanodot::{App, IntoResponse, Response, StatusCode};
///
/// let mut app = App::new();
///
/// app.get("/users/<int:id>", |_req, args| Box::pin(async move {
///     let id = args.int("id").unwrap_or_default();
///     Ok(format!("user {id}").into_response())
/// }))?;
///
/// app.post("/echo", |req, _| Box::pin(async move {
///     let body = req.body().await?.to_vec();
///     Ok(Response::new(body).status(StatusCode::Created))
/// }))?;
///
/// app.before_request(|req| Box::pin(async move {
///     match req.header("Authorization") {
///         Some(_) => Ok(None),
///         None => Ok(Some(("login first", StatusCode::Unauthorized).into_response())),
///     }
/// }));
/// # Ok::<(), nanodot::PatternError>(())
/// ```
pub struct App {
    routes: Vec<Route>,
    before: Vec<BeforeFn>,
    after: Vec<AfterFn>,
    status_handlers: HashMap<StatusCode, StatusFn>,
    kind_handlers: HashMap<ErrorKind, KindFn>,
    shutdown: Shutdown,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field(
                "routes",
                &self.routes.iter().map(|r| r.pattern.as_str()).collect::<Vec<_>>(),
            )
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .field("status_handlers", &self.status_handlers.keys().collect::<Vec<_>>())
            .field("kind_handlers", &self.kind_handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// Registration
impl App {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            status_handlers: HashMap::new(),
            kind_handlers: HashMap::new(),
            shutdown: Shutdown::default(),
        }
    }

    /// Registers `handler` for `pattern` under `methods`.
    ///
    /// An empty method list means `GET`. Routes are tried in registration
    /// order and the first match wins, so register specific patterns first.
    ///
    /// # Errors
    /// The pattern does not compile, see [`UrlPattern::new`].
    pub fn route<F>(&mut self, pattern: &str, methods: &[Method], handler: F) -> Result<&mut Self, PatternError>
    where
        F: for<'a> Fn(&'a mut Request, &'a PathArgs) -> BoxFuture<'a, Result<Response, Error>>
            + Send
            + Sync
            + 'static,
    {
        let methods = match methods.is_empty() {
            true => vec![Method::Get],
            false => methods.to_vec(),
        };

        self.routes.push(Route {
            methods,
            pattern: UrlPattern::new(pattern)?,
            handler: Box::new(handler),
        });
        Ok(self)
    }

    /// Shorthand for [`route`](App::route) with `GET`.
    #[inline]
    pub fn get<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self, PatternError>
    where
        F: for<'a> Fn(&'a mut Request, &'a PathArgs) -> BoxFuture<'a, Result<Response, Error>>
            + Send
            + Sync
            + 'static,
    {
        self.route(pattern, &[Method::Get], handler)
    }

    /// Shorthand for [`route`](App::route) with `POST`.
    #[inline]
    pub fn post<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self, PatternError>
    where
        F: for<'a> Fn(&'a mut Request, &'a PathArgs) -> BoxFuture<'a, Result<Response, Error>>
            + Send
            + Sync
            + 'static,
    {
        self.route(pattern, &[Method::Post], handler)
    }

    /// Shorthand for [`route`](App::route) with `PUT`.
    #[inline]
    pub fn put<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self, PatternError>
    where
        F: for<'a> Fn(&'a mut Request, &'a PathArgs) -> BoxFuture<'a, Result<Response, Error>>
            + Send
            + Sync
            + 'static,
    {
        self.route(pattern, &[Method::Put], handler)
    }

    /// Shorthand for [`route`](App::route) with `PATCH`.
    #[inline]
    pub fn patch<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self, PatternError>
    where
        F: for<'a> Fn(&'a mut Request, &'a PathArgs) -> BoxFuture<'a, Result<Response, Error>>
            + Send
            + Sync
            + 'static,
    {
        self.route(pattern, &[Method::Patch], handler)
    }

    /// Shorthand for [`route`](App::route) with `DELETE`.
    #[inline]
    pub fn delete<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self, PatternError>
    where
        F: for<'a> Fn(&'a mut Request, &'a PathArgs) -> BoxFuture<'a, Result<Response, Error>>
            + Send
            + Sync
            + 'static,
    {
        self.route(pattern, &[Method::Delete], handler)
    }

    /// Adds a hook run before the route handler.
    ///
    /// Returning `Ok(Some(response))` short-circuits the request with that
    /// response (after-handlers still run).
    pub fn before_request<F>(&mut self, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Request) -> BoxFuture<'a, Result<Option<Response>, Error>>
            + Send
            + Sync
            + 'static,
    {
        self.before.push(Box::new(handler));
        self
    }

    /// Adds a hook run after the route handler; it receives the response
    /// and returns the one to send.
    pub fn after_request<F>(&mut self, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Request, Response) -> BoxFuture<'a, Result<Response, Error>>
            + Send
            + Sync
            + 'static,
    {
        self.after.push(Box::new(handler));
        self
    }

    /// Sets the handler producing the response for `status`.
    ///
    /// Consulted for `404` (no route), `413` (payload too large) and `500`
    /// (failure without a matching exception handler). Registering again
    /// replaces the previous handler.
    pub fn error_handler<F>(&mut self, status: StatusCode, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Request) -> BoxFuture<'a, Result<Response, Error>> + Send + Sync + 'static,
    {
        self.status_handlers.insert(status, Box::new(handler));
        self
    }

    /// Sets the handler for failures of `kind`.
    ///
    /// # Examples
    /// ```
    /// use nanodot::{App, ErrorKind, IntoResponse, StatusCode};
    ///
    /// let mut app = App::new();
    /// app.exception_handler(ErrorKind::Custom("valve"), |_req, err| {
    ///     let message = err.message().to_owned();
    ///     Box::pin(async move { Ok((message, StatusCode::Conflict).into_response()) })
    /// });
    /// ```
    pub fn exception_handler<F>(&mut self, kind: ErrorKind, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Request, &'a Error) -> BoxFuture<'a, Result<Response, Error>>
            + Send
            + Sync
            + 'static,
    {
        self.kind_handlers.insert(kind, Box::new(handler));
        self
    }

    /// Handle stopping the server from outside a request: accepting stops
    /// right away and in-flight requests finish.
    ///
    /// Handlers use [`Request::shutdown`] instead, which stops the server
    /// once their own response is written.
    #[inline]
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Serves the application on `host:port` until shutdown is requested.
    ///
    /// With `debug` the access log is emitted at `INFO` level.
    ///
    /// ```no_run
    /// # async fn run() -> std::io::Result<()> {
    /// nanodot::App::new().run("0.0.0.0", 5000, false).await
    /// # }
    /// ```
    pub async fn run(self, host: &str, port: u16, debug: bool) -> io::Result<()> {
        Server::builder()
            .app(self)
            .bind(host, port)
            .debug(debug)
            .build()?
            .launch()
            .await
    }
}

// Dispatch
impl App {
    /// First route accepting `method` whose pattern matches `path`.
    fn find_route(&self, method: Method, path: &str) -> Option<(&Route, PathArgs)> {
        self.routes
            .iter()
            .filter(|route| route.methods.contains(&method))
            .find_map(|route| route.pattern.matches(path).map(|args| (route, args)))
    }

    /// Answer to a request that could not be parsed.
    pub(crate) fn bad_request() -> Response {
        Response::new("Bad request").status(StatusCode::BadRequest)
    }

    /// Runs the whole pipeline for `req`; never fails.
    pub(crate) async fn dispatch(&self, req: &mut Request) -> Response {
        if req.content_length() > req.limits.max_content_length {
            return self
                .status_response(req, StatusCode::PayloadTooLarge, "Payload too large")
                .await;
        }

        match guarded(self.handle(req)).await {
            Ok(resp) => resp,
            Err(err) => {
                error!(
                    method = %req.method(),
                    path = req.path(),
                    kind = %err.kind(),
                    "request failed: {err}"
                );
                self.recover(req, &err).await
            }
        }
    }

    async fn handle(&self, req: &mut Request) -> Result<Response, Error> {
        let mut short_circuit = None;
        for before in &self.before {
            if let Some(resp) = before(req).await? {
                short_circuit = Some(resp);
                break;
            }
        }

        let mut resp = match short_circuit {
            Some(resp) => resp,
            None => {
                let Some((route, args)) = self.find_route(req.method(), req.path()) else {
                    return Ok(self.status_response(req, StatusCode::NotFound, "Not found").await);
                };
                (route.handler)(req, &args).await?
            }
        };

        for after in &self.after {
            resp = after(req, resp).await?;
        }

        Ok(resp)
    }

    async fn recover(&self, req: &mut Request, err: &Error) -> Response {
        if let Some(handler) = self.kind_handlers.get(&err.kind()) {
            let reborrowed = &mut *req;
            match guarded(async move { handler(reborrowed, err).await }).await {
                Ok(resp) => return resp,
                Err(failure) => error!(kind = %err.kind(), "exception handler failed: {failure}"),
            }
        }

        self.status_response(req, StatusCode::InternalServerError, "Internal Server Error")
            .await
    }

    /// Response of the handler registered for `status`, or `fallback`.
    async fn status_response(&self, req: &mut Request, status: StatusCode, fallback: &'static str) -> Response {
        if let Some(handler) = self.status_handlers.get(&status) {
            let reborrowed = &mut *req;
            match guarded(async move { handler(reborrowed).await }).await {
                Ok(resp) => return resp,
                Err(failure) => error!(status = status.as_u16(), "error handler failed: {failure}"),
            }
        }

        Response::new(fallback).status(status)
    }
}

/// Awaits `future`, turning a panic into an [`ErrorKind::Panic`] error.
async fn guarded<F, T>(future: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(panic_error(panic)),
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> Error {
    let message = match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => match panic.downcast_ref::<&'static str>() {
            Some(message) => (*message).to_owned(),
            None => "handler panicked".to_owned(),
        },
    };

    Error::new(ErrorKind::Panic, message)
}
