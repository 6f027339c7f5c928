use nanodot::{
    limits::{Concurrency, ServerLimits, WaitStrategy},
    App, Error, ErrorKind, IntoResponse, Server, StatusCode,
};
use std::{net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    task::JoinHandle,
    time::timeout,
};

fn app() -> App {
    let mut app = App::new();

    app.get("/users/<int:id>", |_, args| {
        let id = args.int("id").unwrap_or_default();
        Box::pin(async move { Ok(format!("user {id}").into_response()) })
    })
    .unwrap();

    app.get("/fail", |_, _| {
        Box::pin(async { Err(Error::new(ErrorKind::InvalidInput, "unhandled")) })
    })
    .unwrap();

    app.post("/echo", |req, _| {
        Box::pin(async move { Ok(req.body().await?.to_vec().into_response()) })
    })
    .unwrap();

    app.get("/slow", |_, _| {
        Box::pin(async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok("slow done".into_response())
        })
    })
    .unwrap();

    app.post("/slow-shutdown", |req, _| {
        req.shutdown().request();
        Box::pin(async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok("stopping".into_response())
        })
    })
    .unwrap();

    app.post("/shutdown", |req, _| {
        req.shutdown().request();
        Box::pin(async { Ok("bye".into_response()) })
    })
    .unwrap();

    app.error_handler(StatusCode::NotFound, |req| {
        let path = req.path().to_owned();
        Box::pin(async move { Ok((format!("no {path}"), StatusCode::NotFound).into_response()) })
    });

    app
}

fn build(concurrency: Concurrency) -> Server {
    Server::builder()
        .app(app())
        .bind("127.0.0.1", 0)
        .server_limits(ServerLimits {
            concurrency,
            ..ServerLimits::default()
        })
        .build()
        .unwrap()
}

fn start(concurrency: Concurrency) -> (SocketAddr, JoinHandle<std::io::Result<()>>) {
    let server = build(concurrency);
    let addr = server.local_addr().unwrap();
    (addr, tokio::spawn(server.launch()))
}

async fn send(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut out = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut out))
        .await
        .unwrap()
        .unwrap();
    out
}

fn strategies() -> [Concurrency; 4] {
    [
        Concurrency::PerConnection,
        Concurrency::Pool {
            workers: 2,
            wait: WaitStrategy::Yield,
        },
        Concurrency::Pool {
            workers: 0,
            wait: WaitStrategy::Sleep(Duration::from_micros(100)),
        },
        Concurrency::Sequential,
    ]
}

async fn stop(addr: SocketAddr, server: JoinHandle<std::io::Result<()>>) {
    let out = send(addr, "POST /shutdown HTTP/1.0\r\n\r\n").await;
    assert!(out.ends_with("\r\n\r\nbye"), "{out}");

    timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn serves_under_every_strategy() {
    for concurrency in strategies() {
        let name = format!("{concurrency:?}");
        let (addr, server) = start(concurrency);

        #[rustfmt::skip]
        let cases = [
            ("GET /users/7 HTTP/1.0\r\n\r\n", "HTTP/1.0 200 OK\r\n", "user 7"),
            ("GET /users/seven HTTP/1.0\r\n\r\n", "HTTP/1.0 404 Not Found\r\n", "no /users/seven"),
            ("GET /fail HTTP/1.0\r\n\r\n", "HTTP/1.0 500 Internal Server Error\r\n", "Internal Server Error"),
            ("POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello", "HTTP/1.0 200 OK\r\n", "hello"),
            ("FETCH / HTTP/1.0\r\n\r\n", "HTTP/1.0 400 Bad Request\r\n", "Bad request"),
            ("GET /users/8?x=1 HTTP/1.1\r\nHost: localhost\r\n\r\n", "HTTP/1.0 200 OK\r\n", "user 8"),
        ];

        for (raw, head, body) in cases {
            let out = send(addr, raw).await;
            assert!(out.starts_with(head), "{name}: {out}");
            assert!(out.ends_with(body), "{name}: {out}");
        }

        stop(addr, server).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_clients() {
    let (addr, server) = start(Concurrency::Pool {
        workers: 4,
        wait: WaitStrategy::Yield,
    });

    let clients: Vec<_> = (0..16)
        .map(|id| tokio::spawn(async move { (id, send(addr, &format!("GET /users/{id} HTTP/1.0\r\n\r\n")).await) }))
        .collect();

    for client in clients {
        let (id, out) = client.await.unwrap();
        assert!(out.ends_with(&format!("user {id}")), "{out}");
    }

    stop(addr, server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_request_is_rejected() {
    let (addr, server) = start(Concurrency::Sequential);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"POST /echo HTTP/1.0\r\nContent-Length: 1000000\r\n\r\n")
        .await
        .unwrap();

    let mut out = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut out))
        .await
        .unwrap()
        .unwrap();
    assert!(out.starts_with("HTTP/1.0 413 Payload Too Large\r\n"), "{out}");
    assert!(out.ends_with("Payload too large"), "{out}");

    stop(addr, server).await;
}

fn concurrent_strategies() -> [Concurrency; 2] {
    [
        Concurrency::PerConnection,
        Concurrency::Pool {
            workers: 2,
            wait: WaitStrategy::Yield,
        },
    ]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listener_stays_open_until_trigger_is_written() {
    for concurrency in concurrent_strategies() {
        let name = format!("{concurrency:?}");
        let (addr, server) = start(concurrency);

        let stopping = tokio::spawn(send(addr, "POST /slow-shutdown HTTP/1.0\r\n\r\n"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Requests finishing while the trigger is still running keep the server up
        let quick = send(addr, "GET /users/1 HTTP/1.0\r\n\r\n").await;
        assert!(quick.ends_with("user 1"), "{name}: {quick}");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let later = send(addr, "GET /users/2 HTTP/1.0\r\n\r\n").await;
        assert!(later.ends_with("user 2"), "{name}: {later}");
        assert!(!server.is_finished(), "{name}");

        let out = stopping.await.unwrap();
        assert!(out.ends_with("\r\n\r\nstopping"), "{name}: {out}");

        timeout(Duration::from_secs(5), server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
        assert!(TcpStream::connect(addr).await.is_err(), "{name}");
    }
}

#[test]
fn launch_waits_for_in_flight_requests() {
    for concurrency in concurrent_strategies() {
        let name = format!("{concurrency:?}");
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();

        // The server owns its runtime, which is dropped as soon as launch returns
        let server_thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async move {
                let server = build(concurrency);
                addr_tx.send(server.local_addr().unwrap()).unwrap();
                server.launch().await
            })
        });
        let addr = addr_rx.recv().unwrap();

        let client = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let slow = client.block_on(async move {
            let slow = tokio::spawn(send(addr, "GET /slow HTTP/1.0\r\n\r\n"));
            tokio::time::sleep(Duration::from_millis(100)).await;

            let out = send(addr, "POST /shutdown HTTP/1.0\r\n\r\n").await;
            assert!(out.ends_with("\r\n\r\nbye"), "{out}");
            slow.await.unwrap()
        });

        server_thread.join().unwrap().unwrap();
        assert!(slow.ends_with("\r\n\r\nslow done"), "{name}: {slow:?}");
    }
}
