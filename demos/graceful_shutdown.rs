use async_io::Timer;
use axum::routing::get;
use futures_lite::future;
use lunarc::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    let server = Arc::new(WebServer::new(
        ServerConfig::new(DEFAULT_PORT),
        axum::Router::new()
            .route("/", get(hello_handler))
            .route("/slow", get(slow_handler)),
    ));

    println!("Graceful Shutdown Demo");
    println!("1. Server runs on port {} for 10 seconds", DEFAULT_PORT);
    println!("2. Stop is requested: the listener closes, idle connections are closed");
    println!("3. Requests still in flight finish before the server reports completion");
    println!();
    println!("Try making requests to /slow right before shutdown to see graceful handling!");

    let stopper = {
        let server = Arc::clone(&server);
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(10));
            println!("Requesting graceful shutdown...");
            future::block_on(server.stop_and_wait())
        })
    };

    future::block_on(server.start())?;

    let clean = stopper
        .join()
        .map_err(|_| anyhow::anyhow!("shutdown thread panicked"))?;
    println!("Server stopped (clean: {})", clean);
    Ok(())
}

async fn hello_handler() -> axum::response::Html<&'static str> {
    axum::response::Html("<h1>Hello World!</h1><p>This is a quick response.</p>")
}

async fn slow_handler() -> axum::response::Html<&'static str> {
    println!("Slow request started, will take 5 seconds...");
    Timer::after(Duration::from_secs(5)).await;
    println!("Slow request completed!");
    axum::response::Html("<h1>Slow Response</h1><p>This response took 5 seconds to generate.</p>")
}
