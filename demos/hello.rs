use nanodot::{
    App, CookieOptions, Error, ErrorKind, IntoResponse, Response, Server, StatusCode,
};
use serde_json::json;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct Started(Instant);

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nanodot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut app = App::new();

    app.get("/", |req, _| {
        let name = req.args().get_or("name", "world").to_owned();
        Box::pin(async move { Ok(format!("Hello, {name}!").into_response()) })
    })
    .unwrap();

    app.get("/pumps/<int:id>", |_, args| {
        let id = args.int("id").unwrap_or_default();
        Box::pin(async move {
            match id {
                1..=4 => Ok(json!({"pump": id, "running": id % 2 == 0}).into_response()),
                _ => Err(Error::custom("pump", format!("pump {id} does not exist"))),
            }
        })
    })
    .unwrap();

    app.post("/login", |req, _| {
        Box::pin(async move {
            let user = match req.form().await? {
                Some(form) => form.get_or("user", "guest").to_owned(),
                None => "guest".to_owned(),
            };

            let mut resp = Response::redirect("/")?;
            resp.set_cookie(
                "user",
                &user,
                &CookieOptions {
                    path: Some("/".into()),
                    http_only: true,
                    ..CookieOptions::default()
                },
            )?;
            Ok(resp)
        })
    })
    .unwrap();

    app.post("/shutdown", |req, _| {
        req.shutdown().request();
        Box::pin(async { Ok("The server is shutting down...".into_response()) })
    })
    .unwrap();

    app.before_request(|req| {
        req.context_mut().insert(Started(Instant::now()));
        Box::pin(async { Ok(None) })
    });

    app.after_request(|req, resp| {
        let elapsed = req.context().get::<Started>().map(|s| s.0.elapsed());
        Box::pin(async move {
            Ok(resp.header("X-Elapsed-Us", elapsed.unwrap_or_default().as_micros()))
        })
    });

    app.exception_handler(ErrorKind::Custom("pump"), |_, err| {
        let message = err.message().to_owned();
        Box::pin(async move { Ok((json!({"error": message}), StatusCode::NotFound).into_response()) })
    });

    app.error_handler(StatusCode::NotFound, |req| {
        let path = req.path().to_owned();
        Box::pin(async move { Ok((format!("{path} not found"), StatusCode::NotFound).into_response()) })
    });

    Server::builder()
        .app(app)
        .bind("127.0.0.1", 5000)
        .debug(true)
        .build()?
        .launch()
        .await
}
