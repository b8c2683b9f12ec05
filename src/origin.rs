//! Talking to origin servers.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use hyper::{client::HttpConnector, Body, Client, Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use tracing::instrument;

use crate::{errors::hyper_error_description_for_metrics, Result};

/// A `hyper` client shared between all requests.
pub type SharedHttpClient = Arc<Client<HttpsConnector<HttpConnector>>>;

pub fn shared_http_client(max_idle_per_host: usize) -> SharedHttpClient {
    // Create a shared `hyper::Client` with a connection pool, so that we can
    // use keep-alive.
    Arc::new(
        Client::builder()
            .pool_max_idle_per_host(max_idle_per_host)
            .build(
                HttpsConnectorBuilder::new()
                    .with_native_roots()
                    .https_only()
                    .enable_http1()
                    .enable_http2()
                    .build(),
            ),
    )
}

/// Something which can answer requests on behalf of an origin.
///
/// Requests arrive with an absolute URI already pointing at the origin.
/// Implementations must not follow redirects, because we rewrite them.
#[async_trait]
pub trait Origin: Send + Sync + 'static {
    /// Send `req` to the origin and return its response, with the body
    /// still streaming.
    async fn fetch(&self, req: Request<Body>) -> Result<Response<Body>>;
}

/// An origin reached over HTTPS.
pub struct HttpsOrigin {
    client: SharedHttpClient,
}

impl HttpsOrigin {
    /// Create a new origin client.
    pub fn new(client: SharedHttpClient) -> HttpsOrigin {
        describe_histogram!(
            "dictproxy.origin_request.duration_seconds",
            Unit::Seconds,
            "Time until the origin returned response headers"
        );
        describe_counter!(
            "dictproxy.origin_errors.total",
            "Errors talking to origins, labeled by cause"
        );
        HttpsOrigin { client }
    }
}

#[async_trait]
impl Origin for HttpsOrigin {
    #[instrument(
        name = "HttpsOrigin::fetch",
        level = "debug",
        skip_all,
        fields(uri = %req.uri())
    )]
    async fn fetch(&self, req: Request<Body>) -> Result<Response<Body>> {
        let start = Instant::now();
        let res = match self.client.request(req).await {
            Ok(res) => res,
            Err(err) => {
                // Errors that occur here are being reported by our local HTTP
                // stack, not the remote server.
                let desc = hyper_error_description_for_metrics(&err);
                counter!(
                    "dictproxy.origin_errors.total",
                    1,
                    "component" => "origin",
                    "cause" => desc
                );
                return Err(err.into());
            }
        };
        histogram!(
            "dictproxy.origin_request.duration_seconds",
            (Instant::now() - start).as_secs_f64(),
        );
        Ok(res)
    }
}
