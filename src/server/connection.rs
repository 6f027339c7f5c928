use crate::{
    http::request::Request,
    limits::{ReqLimits, RespLimits},
    server::app::App,
};
use std::{io, net::SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Serves one connection end to end: parse, dispatch, write, close.
#[derive(Debug)]
pub(crate) struct Worker {
    app: App,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
    debug: bool,
}

impl Worker {
    #[inline]
    pub(crate) fn new(app: App, req_limits: ReqLimits, resp_limits: RespLimits, debug: bool) -> Self {
        Self {
            app,
            req_limits,
            resp_limits,
            debug,
        }
    }

    /// Runs the connection, logging a failure that ends it early.
    #[inline]
    pub(crate) async fn serve<S>(&self, stream: S, client_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if let Err(err) = self.run(stream, client_addr).await {
            warn!(%client_addr, "connection failed: {err}");
        }
    }

    pub(crate) async fn run<S>(&self, stream: S, client_addr: SocketAddr) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let shutdown = self.app.shutdown().for_request();

        let mut request =
            match Request::create(reader, client_addr, &self.req_limits, shutdown.clone()).await {
                Ok(request) => request,
                Err(err) => {
                    warn!(%client_addr, "malformed request: {err}");
                    None
                }
            };

        let response = match &mut request {
            Some(req) => self.app.dispatch(req).await,
            None => App::bad_request(),
        };
        let status = response.status_code();

        let written = match response.write_to(&mut writer, &self.resp_limits).await {
            Ok(()) => Ok(()),
            Err(err) if is_disconnect(&err) => {
                debug!(%client_addr, "peer closed the connection: {err}");
                Ok(())
            }
            Err(err) => Err(err),
        };

        let (method, path) = match &request {
            Some(req) => (req.method().as_str(), req.path()),
            None => ("-", "-"),
        };
        match self.debug {
            true => info!(%client_addr, "{method} {path} {}", status.as_u16()),
            false => debug!(%client_addr, "{method} {path} {}", status.as_u16()),
        }

        // Close
        drop(request);
        let _ = writer.shutdown().await;

        // Only the request that asked for shutdown stops the accept loop
        if shutdown.triggered() {
            shutdown.wake();
        }

        written
    }
}

#[inline(always)]
fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IntoResponse, Response, StatusCode};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    fn worker(app: App) -> Worker {
        Worker::new(app, ReqLimits::default(), RespLimits::default(), true)
    }

    async fn exchange(worker: &Worker, raw: &[u8]) -> String {
        let (mut client, server) = duplex(64 * 1024);
        client.write_all(raw).await.unwrap();
        client.shutdown().await.unwrap();

        worker
            .run(server, "127.0.0.1:5000".parse().unwrap())
            .await
            .unwrap();

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out
    }

    fn echo_app() -> App {
        let mut app = App::new();
        app.post("/echo", |req, _| {
            Box::pin(async move {
                let body = req.body().await?.to_vec();
                Ok(Response::new(body).header("Content-Type", "application/octet-stream"))
            })
        })
        .unwrap();
        app.get("/stop", |req, _| {
            req.shutdown().request();
            Box::pin(async { Ok("bye".into_response()) })
        })
        .unwrap();
        app
    }

    #[tokio::test]
    async fn full_exchange() {
        let worker = worker(echo_app());

        #[rustfmt::skip]
        let cases: [(&[u8], &str); 4] = [
            (
                b"POST /echo HTTP/1.1\r\nContent-Length: 4\r\n\r\nping",
                "HTTP/1.0 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: 4\r\n\r\nping",
            ),
            (
                b"GET /missing HTTP/1.0\r\n\r\n",
                "HTTP/1.0 404 Not Found\r\nContent-Length: 9\r\nContent-Type: text/plain\r\n\r\nNot found",
            ),
            (
                b"BREW /pot HTTP/1.0\r\n\r\n",
                "HTTP/1.0 400 Bad Request\r\nContent-Length: 11\r\nContent-Type: text/plain\r\n\r\nBad request",
            ),
            (
                b"",
                "HTTP/1.0 400 Bad Request\r\nContent-Length: 11\r\nContent-Type: text/plain\r\n\r\nBad request",
            ),
        ];

        for (raw, expected) in cases {
            assert_eq!(exchange(&worker, raw).await, expected);
        }
    }

    #[tokio::test]
    async fn shutdown_wakes_after_write() {
        let worker = worker(echo_app());
        let shutdown = worker.app.shutdown().clone();

        let out = exchange(&worker, b"GET /stop HTTP/1.0\r\n\r\n").await;
        assert!(out.ends_with("\r\n\r\nbye"));
        assert!(shutdown.is_requested());
        tokio::time::timeout(Duration::from_secs(1), shutdown.woken())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn other_requests_do_not_wake() {
        let worker = worker(echo_app());
        let shutdown = worker.app.shutdown().clone();

        // Another request asked for shutdown and is still running
        shutdown.for_request().request();

        let out = exchange(&worker, b"POST /echo HTTP/1.0\r\nContent-Length: 2\r\n\r\nhi").await;
        assert!(out.ends_with("\r\n\r\nhi"));
        assert!(tokio::time::timeout(Duration::from_millis(50), shutdown.woken())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn peer_disconnect_is_absorbed() {
        let mut app = App::new();
        app.get("/", |_, _| {
            Box::pin(async { Ok(vec![b'x'; 256 * 1024].into_response()) })
        })
        .unwrap();
        let worker = worker(app);

        let (mut client, server) = duplex(1024);
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();

        let task = tokio::spawn(async move {
            worker.run(server, "127.0.0.1:5000".parse().unwrap()).await
        });
        let mut partial = [0; 16];
        client.read_exact(&mut partial).await.unwrap();
        drop(client);

        assert!(task.await.unwrap().is_ok());
        assert_eq!(&partial[..], b"HTTP/1.0 200 OK\r");
    }

    #[test]
    fn disconnect_kinds() {
        #[rustfmt::skip]
        let cases = [
            (io::ErrorKind::BrokenPipe, true),
            (io::ErrorKind::ConnectionReset, true),
            (io::ErrorKind::ConnectionAborted, true),
            (io::ErrorKind::TimedOut, false),
            (io::ErrorKind::Other, false),
        ];

        for (kind, expected) in cases {
            assert_eq!(is_disconnect(&io::Error::from(kind)), expected, "{kind:?}");
        }
    }

    #[test]
    fn status_of_bad_request() {
        assert_eq!(App::bad_request().status_code(), StatusCode::BadRequest);
    }
}
