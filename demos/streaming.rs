use futures_util::{stream, StreamExt};
use nanodot::{
    limits::{Concurrency, RespLimits, ServerLimits, WaitStrategy},
    App, Body, IntoResponse, Response, Server, StatusCode,
};
use std::{
    path::{Component, Path},
    time::Duration,
};
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Only plain relative paths below the working directory are served.
fn is_plain_relative(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|part| matches!(part, Component::Normal(_)))
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nanodot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut app = App::new();

    // curl http://127.0.0.1:5000/files/Cargo.toml
    app.get("/files/<path:name>", |_, args| {
        let name = args.str("name").unwrap_or_default().to_owned();
        Box::pin(async move {
            if !is_plain_relative(&name) {
                return Ok(("forbidden", StatusCode::Forbidden).into_response());
            }
            Response::send_file(name, StatusCode::Ok, None).await
        })
    })
    .unwrap();

    // curl http://127.0.0.1:5000/count/5
    app.get("/count/<int:n>", |_, args| {
        let n = args.int("n").unwrap_or_default().clamp(0, 100);
        Box::pin(async move {
            let lines = stream::iter(0..n).then(|i| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, std::io::Error>(format!("line {i}\n").into_bytes())
            });
            Ok(Body::from_chunks(lines).into_response())
        })
    })
    .unwrap();

    // curl --data-binary @big.bin http://127.0.0.1:5000/upload
    app.post("/upload", |req, _| {
        Box::pin(async move {
            let mut total = 0;
            let mut chunk = [0; 4096];
            let stream = req.stream()?;
            loop {
                let read = stream.read(&mut chunk).await?;
                if read == 0 {
                    break;
                }
                total += read;
            }
            Ok(format!("received {total} bytes").into_response())
        })
    })
    .unwrap();

    Server::builder()
        .app(app)
        .bind("127.0.0.1", 5000)
        .server_limits(ServerLimits {
            concurrency: Concurrency::Pool {
                workers: 4,
                wait: WaitStrategy::Sleep(Duration::from_micros(200)),
            },
            ..ServerLimits::default()
        })
        .response_limits(RespLimits {
            chunk_size: 8 * 1024,
            ..RespLimits::default()
        })
        .build()?
        .launch()
        .await
}
