//! Our HTTP front door.

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    http::header::CONTENT_TYPE, response::IntoResponse, routing::get, Extension,
    Router,
};
use hyper::{Body, Request, Response};
use metrics::{describe_gauge, gauge, Unit};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    buffer_pool::BufferPool, dictionaries::DictionaryCache, proxy::Proxy, Result,
};

/// How long we wait for in-flight response bodies when shutting down.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Served at `/robots.txt` on every site.
const ROBOTS_TXT: &str = "User-agent: *\nDisallow: /\n";

/// Build our application.
pub fn app(proxy: Arc<Proxy>) -> Router {
    Router::new()
        .route("/robots.txt", get(handle_robots_txt))
        .fallback(handle_proxy)
        .layer(Extension(proxy))
}

/// Run the server until `shutdown` completes, then wait for in-flight bodies.
pub async fn run_server(
    listen_addr: &str,
    proxy: Arc<Proxy>,
    sweep_interval: Duration,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let listen_addr = listen_addr.parse().with_context(|| {
        format!("could not parse listen address: {:?}", listen_addr)
    })?;

    let sweeper = tokio::spawn(run_sweeper(
        proxy.cache().clone(),
        proxy.pool().clone(),
        sweep_interval,
    ));

    info!("listening on {}", listen_addr);
    let result = axum::Server::try_bind(&listen_addr)
        .with_context(|| format!("could not listen on {}", listen_addr))?
        .serve(app(proxy.clone()).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server failed");
    sweeper.abort();

    // No new bodies can start once we've stopped accepting requests.
    let tasks = proxy.tasks();
    tasks.close();
    if !tasks.is_empty() {
        info!("waiting for {} response bodies to finish", tasks.len());
    }
    if timeout(SHUTDOWN_GRACE_PERIOD, tasks.wait()).await.is_err() {
        warn!(
            "gave up on {} response bodies after {:?}",
            tasks.len(),
            SHUTDOWN_GRACE_PERIOD
        );
    }
    result
}

/// Periodically evict idle dictionaries and report on our shared resources.
/// Runs until aborted.
async fn run_sweeper(cache: Arc<DictionaryCache>, pool: Arc<BufferPool>, every: Duration) {
    describe_gauge!(
        "dictproxy.dictionary_cache.entries",
        "Prepared dictionaries in memory"
    );
    describe_gauge!(
        "dictproxy.dictionary_cache.bytes",
        Unit::Bytes,
        "Raw size of the prepared dictionaries in memory"
    );
    describe_gauge!(
        "dictproxy.buffers_outstanding.count",
        "Pool buffers checked out by compression sessions"
    );
    describe_gauge!("dictproxy.buffers_idle.count", "Pool buffers on the free list");

    let mut ticks = interval(every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately, and there's nothing to sweep yet.
    ticks.tick().await;
    loop {
        ticks.tick().await;
        let evicted = cache.sweep();
        let remaining = cache.len();
        debug!(evicted, remaining, "swept dictionary cache");
        gauge!("dictproxy.dictionary_cache.entries", remaining as f64);
        gauge!("dictproxy.dictionary_cache.bytes", cache.total_size() as f64);
        gauge!("dictproxy.buffers_outstanding.count", pool.outstanding() as f64);
        gauge!("dictproxy.buffers_idle.count", pool.idle() as f64);
    }
}

/// GET /robots.txt
async fn handle_robots_txt() -> impl IntoResponse {
    ([(CONTENT_TYPE, "text/plain; charset=utf-8")], ROBOTS_TXT)
}

/// Everything else.
async fn handle_proxy(
    Extension(proxy): Extension<Arc<Proxy>>,
    req: Request<Body>,
) -> Response<Body> {
    proxy.handle(req).await
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use hyper::StatusCode;

    use super::*;
    use crate::{
        buffer_pool::{BUFFER_SIZE, MAX_IDLE_BUFFERS},
        dictionaries::{tests::MemoryAssets, CacheOptions},
        origin::Origin,
        proxy::ProxyOptions,
        sites::SiteTable,
    };

    struct NoOrigin;

    #[async_trait]
    impl Origin for NoOrigin {
        async fn fetch(&self, _req: Request<Body>) -> Result<Response<Body>> {
            Err(anyhow::format_err!("no origin"))
        }
    }

    fn empty_proxy() -> Arc<Proxy> {
        let cache = DictionaryCache::new(
            Arc::new(MemoryAssets::default()),
            CacheOptions::default(),
        );
        Arc::new(
            Proxy::new(
                SiteTable::default(),
                Arc::new(NoOrigin),
                cache,
                BufferPool::new(BUFFER_SIZE, MAX_IDLE_BUFFERS),
                ProxyOptions::default(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn serves_robots_txt() {
        let res = handle_robots_txt().await.into_response();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
        assert_eq!(&body[..], ROBOTS_TXT.as_bytes());
    }

    #[tokio::test]
    async fn unknown_hosts_are_not_found() {
        let req = Request::builder()
            .uri("/")
            .header("host", "nowhere.example.com")
            .body(Body::empty())
            .unwrap();
        let res = handle_proxy(Extension(empty_proxy()), req).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_idle_dictionaries() {
        let cache = DictionaryCache::new(
            Arc::new(MemoryAssets::with("a", b"dictionary")),
            CacheOptions {
                ttl: Duration::from_secs(10),
                ..CacheOptions::default()
            },
        );
        assert!(cache.load("a").await.is_some());
        let pool = BufferPool::new(BUFFER_SIZE, MAX_IDLE_BUFFERS);
        let sweeper = tokio::spawn(run_sweeper(cache.clone(), pool, Duration::from_secs(5)));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.len(), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(cache.len(), 0);
        sweeper.abort();
    }
}
