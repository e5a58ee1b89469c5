//! Drives a synthetic burst through the full middleware stack and prints the
//! metrics snapshot.
//!
//! ```sh
//! RUST_LOG=cadence=debug cargo run --example platform
//! ```

use std::time::Duration;

use cadence::context::Context;
use cadence::http::{Method, Request, Response, StatusCode};
use cadence::{Config, SetOptions, Services};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let mut config = Config::from_env()?;
    config.rate_limit.rules.auth.max = 3;
    let services = Services::from_config(config)?;
    services.start();

    let cache = services.cache.clone();
    let pipeline = services.pipeline(move |ctx: Context| {
        let cache = cache.clone();
        async move {
            let path = ctx.request().path();
            if path.starts_with("/api/weather") {
                return Response::new(StatusCode::BAD_GATEWAY);
            }
            let recipe = cache.get_or_insert_with(path, SetOptions::in_segment("recipes"), || {
                json!({ "path": path, "title": "Overnight oats" })
            });
            Response::new(StatusCode::OK).json(&recipe)
        }
    });

    let traffic = [
        (Method::Get, "/api/recipes/1", "203.0.113.7"),
        (Method::Get, "/api/recipes/1", "203.0.113.7"),
        (Method::Get, "/api/recipes/2", "198.51.100.2"),
        (Method::Get, "/api/weather/today", "198.51.100.2"),
    ];
    for (method, path, ip) in traffic {
        let response = pipeline
            .handle(Request::new(method, path).header("X-Forwarded-For", ip))
            .await;
        info!(%path, status = response.status().as_u16(), "served");
    }

    // Hammer the login route until the limiter escalates to a block.
    for attempt in 1..=10 {
        let request =
            Request::new(Method::Post, "/api/auth/login").header("X-Forwarded-For", "192.0.2.66");
        let response = pipeline.handle(request).await;
        info!(
            attempt,
            status = response.status().as_u16(),
            retry_after = response.headers().get("retry-after"),
            "login attempt"
        );
    }
    info!(blocked = services.limiter.is_blocked("ip:192.0.2.66"), "limiter state");

    tokio::time::sleep(Duration::from_millis(50)).await;
    services.stop();

    let snapshot = services.metrics.get_metrics(true);
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    println!("{}", serde_json::to_string_pretty(&services.limiter.stats())?);
    Ok(())
}
