//! Deciding how to answer each request, and assembling the response.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{format_err, Context};
use hyper::{
    header::{
        HeaderMap, HeaderValue, ACCEPT_ENCODING, CACHE_CONTROL,
        CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, LINK, LOCATION, VARY,
    },
    http::response::Parts,
    Body, Request, Response, StatusCode, Uri,
};
use metrics::{counter, describe_counter};
use strum_macros::EnumString;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::{
    buffer_pool::BufferPool,
    compression,
    dictionaries::{DictionaryCache, DictionaryHash},
    origin::Origin,
    pipeline::{spawn_body_pipeline, Compressor, Stages},
    rewrite::{is_rewritable, Rewriter},
    sites::{SiteConfig, SiteTable},
    Result,
};

/// Default URL prefix for dictionary downloads.
pub const DEFAULT_DICTIONARY_PATH: &str = "/dictionary/";

/// Default `Cache-Control` lifetime for dictionary downloads.
pub const DEFAULT_DICTIONARY_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// The `Vary` value for any response whose body depends on what the client
/// advertised.
const VARY_DICTIONARY: &str = "Accept-Encoding, Available-Dictionary";

/// Headers which only apply to a single connection.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const AVAILABLE_DICTIONARY: &str = "available-dictionary";
const DICTIONARY_ID: &str = "dictionary-id";
const ORIGIN_TRIAL: &str = "origin-trial";
const SEC_FETCH_DEST: &str = "sec-fetch-dest";
const USE_AS_DICTIONARY: &str = "use-as-dictionary";

/// Proxy configuration which isn't per-site.
#[derive(Clone, Debug)]
pub struct ProxyOptions {
    /// URL prefix under which we serve dictionaries, with leading and
    /// trailing `/`.
    pub dictionary_path: String,
    /// `Cache-Control: max-age` for dictionary downloads.
    pub dictionary_max_age: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        ProxyOptions {
            dictionary_path: DEFAULT_DICTIONARY_PATH.to_owned(),
            dictionary_max_age: DEFAULT_DICTIONARY_MAX_AGE,
        }
    }
}

/// The values of `sec-fetch-dest` which mean a page load. We rewrite and
/// maybe compress these.
#[derive(Clone, Copy, Debug, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FetchDest {
    Document,
    Frame,
    Iframe,
}

impl FetchDest {
    /// Parse the `sec-fetch-dest` header. Returns `None` if it's missing or
    /// names some other kind of resource.
    fn from_headers(headers: &HeaderMap) -> Option<FetchDest> {
        headers
            .get(SEC_FETCH_DEST)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

/// How we answered a request. Used for metrics and logs.
#[derive(Clone, Copy, Debug, strum_macros::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
enum Strategy {
    Dictionary,
    Proxy,
    Rewrite,
    Compress,
}

/// Response headers we attach for a site, built once at startup.
#[derive(Debug)]
struct SiteHeaders {
    /// Tells clients where to find our dictionary.
    link: HeaderValue,
    /// Tells clients how to use our dictionary once downloaded.
    use_as_dictionary: HeaderValue,
    /// Optional origin trial token.
    origin_trial: Option<HeaderValue>,
}

impl SiteHeaders {
    fn new(site: &SiteConfig, dictionary_path: &str) -> Result<SiteHeaders> {
        let link = HeaderValue::try_from(format!(
            "<{}{}>; rel=\"compression-dictionary\"",
            dictionary_path, site.dictionary
        ))
        .with_context(|| format!("invalid dictionary id for {}", site.host))?;
        let use_as_dictionary = HeaderValue::try_from(format!(
            "id=\"{}\", match=\"/*\", match-dest=(\"document\" \"frame\")",
            site.dictionary
        ))
        .with_context(|| format!("invalid dictionary id for {}", site.host))?;
        let origin_trial = site
            .origin_trial
            .as_deref()
            .map(HeaderValue::from_str)
            .transpose()
            .with_context(|| format!("invalid origin trial token for {}", site.host))?;
        Ok(SiteHeaders {
            link,
            use_as_dictionary,
            origin_trial,
        })
    }
}

/// Our reverse proxy.
pub struct Proxy {
    sites: SiteTable,
    site_headers: HashMap<String, SiteHeaders>,
    origin: Arc<dyn Origin>,
    cache: Arc<DictionaryCache>,
    pool: Arc<BufferPool>,
    tasks: TaskTracker,
    options: ProxyOptions,
}

impl Proxy {
    /// Create a new proxy.
    pub fn new(
        sites: SiteTable,
        origin: Arc<dyn Origin>,
        cache: Arc<DictionaryCache>,
        pool: Arc<BufferPool>,
        options: ProxyOptions,
    ) -> Result<Proxy> {
        describe_counter!(
            "dictproxy.requests.total",
            "Requests handled, labeled by response strategy"
        );
        describe_counter!(
            "dictproxy.compression_fallbacks.total",
            "Compressible responses we sent uncompressed, labeled by reason"
        );

        if !options.dictionary_path.starts_with('/') || !options.dictionary_path.ends_with('/') {
            return Err(format_err!(
                "dictionary path {:?} must start and end with '/'",
                options.dictionary_path
            ));
        }
        let site_headers = sites
            .iter()
            .map(|site| {
                let headers = SiteHeaders::new(site, &options.dictionary_path)?;
                Ok((site.host.clone(), headers))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(Proxy {
            sites,
            site_headers,
            origin,
            cache,
            pool,
            tasks: TaskTracker::new(),
            options,
        })
    }

    /// Tracks our in-flight response bodies.
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Our dictionary cache.
    pub fn cache(&self) -> &Arc<DictionaryCache> {
        &self.cache
    }

    /// Our compression buffers.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Answer a request. Never fails: problems become error statuses.
    #[instrument(
        name = "Proxy::handle",
        level = "debug",
        skip_all,
        fields(method = %req.method(), uri = %req.uri())
    )]
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().host());
        let site = match host.and_then(|h| self.sites.resolve(h)) {
            Some(site) => site,
            None => {
                debug!(?host, "unknown host");
                return text_response(StatusCode::NOT_FOUND, "Unknown host\n");
            }
        };
        let headers = match self.site_headers.get(&site.host) {
            Some(headers) => headers,
            None => return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error\n"),
        };

        let strategy = self.choose_strategy(&req);
        let label: &'static str = strategy.into();
        counter!("dictproxy.requests.total", 1, "strategy" => label);
        debug!(?strategy, site = %site.host, "routing request");

        let result = match strategy {
            Strategy::Dictionary => self.serve_dictionary(site, headers, &req).await,
            Strategy::Proxy => self.proxy(site, req).await,
            Strategy::Rewrite => self.rewrite_only(site, headers, req).await,
            Strategy::Compress => self.compress(site, headers, req).await,
        };
        match result {
            Ok(res) => res,
            Err(err) => {
                warn!("error talking to origin {}: {:#}", site.origin, err);
                text_response(StatusCode::BAD_GATEWAY, "Bad gateway\n")
            }
        }
    }

    /// Pick one of our four ways to answer.
    fn choose_strategy(&self, req: &Request<Body>) -> Strategy {
        if req.uri().path().starts_with(&self.options.dictionary_path) {
            return Strategy::Dictionary;
        }
        if FetchDest::from_headers(req.headers()).is_none() {
            Strategy::Proxy
        } else if client_dictionary(req.headers()).is_some() {
            Strategy::Compress
        } else {
            Strategy::Rewrite
        }
    }

    /// Serve the raw bytes of a site's dictionary.
    #[instrument(level = "debug", skip_all, fields(site = %site.host))]
    async fn serve_dictionary(
        &self,
        site: &SiteConfig,
        headers: &SiteHeaders,
        req: &Request<Body>,
    ) -> Result<Response<Body>> {
        let id = &req.uri().path()[self.options.dictionary_path.len()..];
        if id != site.dictionary {
            return Ok(text_response(StatusCode::NOT_FOUND, "Not found\n"));
        }
        let data = match self.cache.assets().fetch(id).await? {
            Some(data) => data,
            None => {
                warn!("dictionary {:?} is configured but missing", id);
                return Ok(text_response(StatusCode::NOT_FOUND, "Not found\n"));
            }
        };
        let mut res = Response::new(Body::from(data));
        let res_headers = res.headers_mut();
        res_headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=UTF-8"),
        );
        res_headers.insert(
            CACHE_CONTROL,
            HeaderValue::try_from(format!(
                "public, max-age={}",
                self.options.dictionary_max_age.as_secs()
            ))?,
        );
        res_headers.insert(USE_AS_DICTIONARY, headers.use_as_dictionary.clone());
        Ok(res)
    }

    /// Forward a request verbatim.
    async fn proxy(&self, site: &SiteConfig, req: Request<Body>) -> Result<Response<Body>> {
        let req = origin_request(site, req, false)?;
        let res = self.origin.fetch(req).await?;
        let (mut parts, body) = res.into_parts();
        clean_response_headers(site, &mut parts.headers);
        Ok(Response::from_parts(parts, body))
    }

    /// Rewrite a page and tell the client about our dictionary.
    async fn rewrite_only(
        &self,
        site: &SiteConfig,
        headers: &SiteHeaders,
        req: Request<Body>,
    ) -> Result<Response<Body>> {
        let req = origin_request(site, req, true)?;
        let res = self.origin.fetch(req).await?;
        Ok(self.rewritten_response(site, headers, res))
    }

    /// Build a rewritten, uncompressed response with a discovery header.
    fn rewritten_response(
        &self,
        site: &SiteConfig,
        headers: &SiteHeaders,
        res: Response<Body>,
    ) -> Response<Body> {
        let (mut parts, body) = res.into_parts();
        clean_response_headers(site, &mut parts.headers);

        let body = if is_transformable(&parts) && !parts.status.is_redirection() {
            parts.headers.remove(CONTENT_LENGTH);
            let stages = Stages {
                rewriter: Some(Rewriter::for_site(&site.host, &site.origin)),
                compressor: None,
            };
            spawn_body_pipeline(&self.tasks, body, stages)
        } else {
            body
        };

        parts.headers.append(LINK, headers.link.clone());
        parts
            .headers
            .append(VARY, HeaderValue::from_static(VARY_DICTIONARY));
        add_origin_trial(headers, &mut parts.headers);
        Response::from_parts(parts, body)
    }

    /// Rewrite and compress a page using the dictionary the client has.
    async fn compress(
        &self,
        site: &SiteConfig,
        headers: &SiteHeaders,
        req: Request<Body>,
    ) -> Result<Response<Body>> {
        let expected = match client_dictionary(req.headers()) {
            Some(advertised) if advertised.id == site.dictionary => advertised.hash,
            _ => {
                // The client has some other site's dictionary.
                counter!("dictproxy.compression_fallbacks.total", 1, "reason" => "wrong_id");
                return self.rewrite_only(site, headers, req).await;
            }
        };

        let req = origin_request(site, req, true)?;
        // Usually the dictionary is loaded already, and we don't need to wait.
        let cached = self.cache.resolve(&site.dictionary, &expected);
        let dictionary = async {
            match cached {
                Some(pin) => Some(pin),
                None => self.cache.acquire(&site.dictionary, &expected).await,
            }
        };
        let (res, pin) = tokio::join!(self.origin.fetch(req), dictionary);
        let res = res?;

        let status = res.status();
        if !status.is_success() {
            let (mut parts, body) = res.into_parts();
            clean_response_headers(site, &mut parts.headers);
            add_origin_trial(headers, &mut parts.headers);
            return Ok(Response::from_parts(parts, body));
        }

        let pin = match pin {
            Some(pin) => pin,
            None => {
                counter!(
                    "dictproxy.compression_fallbacks.total",
                    1,
                    "reason" => "unusable_dictionary"
                );
                debug!(
                    advertised = %expected.to_header_value(),
                    "client dictionary is unusable, sending uncompressed"
                );
                return Ok(self.rewritten_response(site, headers, res));
            }
        };
        let (mut parts, body) = res.into_parts();
        if !is_transformable(&parts) {
            clean_response_headers(site, &mut parts.headers);
            add_origin_trial(headers, &mut parts.headers);
            return Ok(Response::from_parts(parts, body));
        }
        let compressor = match Compressor::reserve(pin, &self.pool) {
            Ok(compressor) => compressor,
            Err(err) => {
                counter!("dictproxy.compression_fallbacks.total", 1, "reason" => "no_buffers");
                warn!("cannot compress response: {:#}", err);
                return Ok(self.rewritten_response(
                    site,
                    headers,
                    Response::from_parts(parts, body),
                ));
            }
        };

        clean_response_headers(site, &mut parts.headers);
        parts.headers.remove(CONTENT_LENGTH);
        parts.headers.insert(
            CONTENT_ENCODING,
            HeaderValue::from_static(compression::CONTENT_ENCODING),
        );
        parts
            .headers
            .append(VARY, HeaderValue::from_static(VARY_DICTIONARY));
        add_origin_trial(headers, &mut parts.headers);

        let stages = Stages {
            rewriter: Some(Rewriter::for_site(&site.host, &site.origin)),
            compressor: Some(compressor),
        };
        let body = spawn_body_pipeline(&self.tasks, body, stages);
        Ok(Response::from_parts(parts, body))
    }
}

/// A dictionary advertised by the client.
#[derive(Debug)]
struct ClientDictionary {
    id: String,
    hash: DictionaryHash,
}

/// Does the client accept `dcz`, and if so, what dictionary does it have?
fn client_dictionary(headers: &HeaderMap) -> Option<ClientDictionary> {
    if !accepts_encoding(headers, compression::CONTENT_ENCODING) {
        return None;
    }
    let hash = DictionaryHash::from_header_value(
        headers.get(AVAILABLE_DICTIONARY)?.to_str().ok()?,
    )?;
    let id = headers.get(DICTIONARY_ID)?.to_str().ok()?.trim();
    let id = id
        .strip_prefix('"')
        .and_then(|id| id.strip_suffix('"'))
        .unwrap_or(id);
    Some(ClientDictionary {
        id: id.to_owned(),
        hash,
    })
}

/// Does `Accept-Encoding` allow `encoding`?
fn accepts_encoding(headers: &HeaderMap, encoding: &str) -> bool {
    headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| {
            let mut params = item.split(';').map(str::trim);
            let name = params.next().unwrap_or("");
            let refused = params.any(|p| {
                p.strip_prefix("q=")
                    .and_then(|q| q.parse::<f32>().ok())
                    .map(|q| q <= 0.0)
                    .unwrap_or(false)
            });
            name.eq_ignore_ascii_case(encoding) && !refused
        })
}

/// Turn an incoming request into one addressed to the site's origin. If
/// `identity` is set, ask the origin for an unencoded body so we can
/// transform it.
fn origin_request(site: &SiteConfig, req: Request<Body>, identity: bool) -> Result<Request<Body>> {
    let (mut parts, body) = req.into_parts();
    let uri = Uri::builder()
        .scheme("https")
        .authority(site.origin.as_str())
        .path_and_query(
            parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/"),
        )
        .build()
        .with_context(|| format!("cannot build origin URL for {}", site.origin))?;
    parts.uri = uri;
    strip_hop_by_hop(&mut parts.headers);
    parts.headers.insert(
        HOST,
        HeaderValue::from_str(&site.origin)
            .with_context(|| format!("invalid origin host {:?}", site.origin))?,
    );
    if identity {
        parts.headers.remove(ACCEPT_ENCODING);
    }
    Ok(Request::from_parts(parts, body))
}

/// Can we rewrite (and maybe compress) this response body? Byte ranges
/// can't be rewritten without corrupting them.
fn is_transformable(parts: &Parts) -> bool {
    if parts.status == StatusCode::PARTIAL_CONTENT {
        return false;
    }
    let encoded = parts
        .headers
        .get(CONTENT_ENCODING)
        .map(|ce| !ce.as_bytes().eq_ignore_ascii_case(b"identity"))
        .unwrap_or(false);
    let content_type = parts.headers.get(CONTENT_TYPE).and_then(|ct| ct.to_str().ok());
    !encoded && is_rewritable(content_type)
}

/// Fix up origin response headers for our client.
fn clean_response_headers(site: &SiteConfig, headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
    if let Some(location) = headers.get(LOCATION).and_then(|l| l.to_str().ok()) {
        if let Some(rewritten) = rewrite_location(location, site) {
            headers.insert(LOCATION, rewritten);
        }
    }
}

/// Point an absolute `Location` at the origin back at the public host.
/// Relative and third-party locations are left alone.
fn rewrite_location(location: &str, site: &SiteConfig) -> Option<HeaderValue> {
    let mut url = Url::parse(location).ok()?;
    if !url
        .host_str()
        .map(|h| h.eq_ignore_ascii_case(&site.origin))
        .unwrap_or(false)
    {
        return None;
    }
    url.set_host(Some(&site.host)).ok()?;
    HeaderValue::try_from(url.as_str()).ok()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn add_origin_trial(headers: &SiteHeaders, out: &mut HeaderMap) {
    if let Some(token) = &headers.origin_trial {
        out.append(ORIGIN_TRIAL, token.clone());
    }
}

/// A short plain-text response.
pub fn text_response(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut res = Response::new(Body::from(body));
    *res.status_mut() = status;
    res.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Mutex};

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use hyper::header::HeaderName;

    use super::*;
    use crate::buffer_pool::{BUFFER_SIZE, MAX_IDLE_BUFFERS};
    use crate::compression::{
        tests::{decode, DICT},
        HEADER_LEN, MAGIC,
    };
    use crate::dictionaries::{tests::MemoryAssets, CacheOptions};

    const PUBLIC_HOST: &str = "a.example.com";
    const ORIGIN: &str = "origin.example.com";

    const PAGE: &str = concat!(
        "<html><head><link rel=\"canonical\" href=\"https://origin.example.com/page\">",
        "<link rel=\"alternate\" href=\"https://origin.example.com/fr/page\"></head>",
        "<body><a href=\"https://origin.example.com/next\">origin.example.com</a></body></html>",
    );
    const REWRITTEN: &str = concat!(
        "<html><head><link rel=\"canonical\" href=\"https://origin.example.com/page\">",
        "<link rel=\"alternate\" href=\"https://origin.example.com/fr/page\"></head>",
        "<body><a href=\"https://a.example.com/next\">a.example.com</a></body></html>",
    );

    /// An origin which returns a canned response and records what it saw.
    struct FakeOrigin {
        status: StatusCode,
        headers: Vec<(HeaderName, &'static str)>,
        body: &'static str,
        fail: bool,
        seen: Mutex<Vec<(Uri, HeaderMap)>>,
    }

    impl FakeOrigin {
        fn html(body: &'static str) -> FakeOrigin {
            FakeOrigin {
                status: StatusCode::OK,
                headers: vec![
                    (CONTENT_TYPE, "text/html; charset=utf-8"),
                    (CONTENT_LENGTH, "9999"),
                ],
                body,
                fail: false,
                seen: Mutex::new(vec![]),
            }
        }

        fn last_request(&self) -> (Uri, HeaderMap) {
            self.seen.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Origin for FakeOrigin {
        async fn fetch(&self, req: Request<Body>) -> Result<Response<Body>> {
            self.seen
                .lock()
                .unwrap()
                .push((req.uri().clone(), req.headers().clone()));
            if self.fail {
                return Err(format_err!("connection refused"));
            }
            // Split the body into small chunks to exercise streaming.
            let chunks = self
                .body
                .as_bytes()
                .chunks(5)
                .map(|c| Ok::<_, io::Error>(Bytes::copy_from_slice(c)))
                .collect::<Vec<_>>();
            let mut res = Response::new(Body::wrap_stream(stream::iter(chunks)));
            *res.status_mut() = self.status;
            for (name, value) in &self.headers {
                res.headers_mut()
                    .insert(name.clone(), HeaderValue::from_static(value));
            }
            Ok(res)
        }
    }

    fn proxy_with(origin: Arc<FakeOrigin>) -> Proxy {
        let sites = SiteTable::new(vec![SiteConfig {
            host: PUBLIC_HOST.to_owned(),
            origin: ORIGIN.to_owned(),
            dictionary: "a".to_owned(),
            origin_trial: Some("trial-token".to_owned()),
        }])
        .unwrap();
        let cache = DictionaryCache::new(
            Arc::new(MemoryAssets::with("a", DICT)),
            CacheOptions::default(),
        );
        let pool = BufferPool::new(BUFFER_SIZE, MAX_IDLE_BUFFERS);
        Proxy::new(sites, origin, cache, pool, ProxyOptions::default()).unwrap()
    }

    fn request(path: &str, headers: &[(&str, &str)]) -> Request<Body> {
        // Like a real HTTP/1.1 request, the URI has no authority, so the site
        // comes from the `Host` header.
        let mut builder = Request::builder().uri(path).header(HOST, PUBLIC_HOST);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn document_request(extra: &[(&str, &str)]) -> Request<Body> {
        let mut headers = vec![
            ("sec-fetch-dest", "document"),
            ("accept-encoding", "gzip, br, zstd, dcz"),
        ];
        headers.extend_from_slice(extra);
        request("/page?q=1", &headers)
    }

    fn header<'a>(res: &'a Response<Body>, name: &str) -> Option<&'a str> {
        res.headers().get(name).map(|v| v.to_str().unwrap())
    }

    async fn body_string(res: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(res.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn document_without_dictionary_gets_discovery_header() {
        let origin = Arc::new(FakeOrigin::html(PAGE));
        let proxy = proxy_with(origin.clone());

        let res = proxy.handle(document_request(&[])).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            header(&res, "link"),
            Some("</dictionary/a>; rel=\"compression-dictionary\""),
        );
        assert_eq!(header(&res, "origin-trial"), Some("trial-token"));
        assert_eq!(header(&res, "vary"), Some(VARY_DICTIONARY));
        assert!(header(&res, "content-encoding").is_none());
        assert!(header(&res, "content-length").is_none());
        assert_eq!(body_string(res).await, REWRITTEN);

        let (uri, headers) = origin.last_request();
        assert_eq!(uri.to_string(), "https://origin.example.com/page?q=1");
        assert_eq!(headers.get(HOST).unwrap(), ORIGIN);
        assert!(headers.get(ACCEPT_ENCODING).is_none());
    }

    #[tokio::test]
    async fn document_with_dictionary_is_compressed() {
        let origin = Arc::new(FakeOrigin::html(PAGE));
        let proxy = proxy_with(origin);
        let hash = DictionaryHash::digest(DICT);
        let advertised = hash.to_header_value();

        let res = proxy
            .handle(document_request(&[
                ("available-dictionary", advertised.as_str()),
                ("dictionary-id", "\"a\""),
            ]))
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(header(&res, "content-encoding"), Some("dcz"));
        assert_eq!(header(&res, "vary"), Some(VARY_DICTIONARY));
        assert_eq!(header(&res, "origin-trial"), Some("trial-token"));
        assert!(header(&res, "link").is_none());
        assert!(header(&res, "content-length").is_none());

        let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
        assert_eq!(&body[..MAGIC.len()], &MAGIC);
        assert_eq!(&body[MAGIC.len()..HEADER_LEN], hash.as_bytes());
        assert_eq!(String::from_utf8(decode(&body, DICT)).unwrap(), REWRITTEN);

        proxy.tasks().close();
        proxy.tasks().wait().await;
        assert_eq!(proxy.pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn redirects_point_at_public_host() {
        let origin = Arc::new(FakeOrigin {
            status: StatusCode::MOVED_PERMANENTLY,
            headers: vec![
                (LOCATION, "https://origin.example.com/new?x=origin.example.com"),
                (CONTENT_TYPE, "text/html"),
            ],
            body: "moved to origin.example.com",
            fail: false,
            seen: Mutex::new(vec![]),
        });
        let proxy = proxy_with(origin);
        let hash = DictionaryHash::digest(DICT).to_header_value();

        for req in [
            document_request(&[]),
            document_request(&[
                ("available-dictionary", hash.as_str()),
                ("dictionary-id", "\"a\""),
            ]),
        ] {
            let res = proxy.handle(req).await;
            assert_eq!(res.status(), StatusCode::MOVED_PERMANENTLY);
            assert_eq!(
                header(&res, "location"),
                Some("https://a.example.com/new?x=origin.example.com"),
            );
            assert!(header(&res, "content-encoding").is_none());
            assert_eq!(body_string(res).await, "moved to origin.example.com");
        }
    }

    #[tokio::test]
    async fn origin_errors_are_not_transformed() {
        let origin = Arc::new(FakeOrigin {
            status: StatusCode::NOT_FOUND,
            headers: vec![
                (CONTENT_TYPE, "text/html"),
                (CONTENT_LENGTH, "31"),
                (HeaderName::from_static("connection"), "close"),
            ],
            body: "not found at origin.example.com",
            fail: false,
            seen: Mutex::new(vec![]),
        });
        let proxy = proxy_with(origin);
        let hash = DictionaryHash::digest(DICT).to_header_value();

        let res = proxy
            .handle(document_request(&[
                ("available-dictionary", hash.as_str()),
                ("dictionary-id", "\"a\""),
            ]))
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(header(&res, "content-encoding").is_none());
        assert!(header(&res, "connection").is_none());
        assert_eq!(header(&res, "content-length"), Some("31"));
        assert_eq!(header(&res, "origin-trial"), Some("trial-token"));
        assert_eq!(body_string(res).await, "not found at origin.example.com");
        assert!(proxy.tasks().is_empty());
        assert_eq!(proxy.pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn partial_content_is_not_transformed() {
        let origin = Arc::new(FakeOrigin {
            status: StatusCode::PARTIAL_CONTENT,
            headers: vec![
                (CONTENT_TYPE, "text/html"),
                (HeaderName::from_static("content-range"), "bytes 0-17/100"),
            ],
            body: "origin.example.com",
            fail: false,
            seen: Mutex::new(vec![]),
        });
        let proxy = proxy_with(origin);
        let hash = DictionaryHash::digest(DICT).to_header_value();

        for req in [
            document_request(&[]),
            document_request(&[
                ("available-dictionary", hash.as_str()),
                ("dictionary-id", "\"a\""),
            ]),
        ] {
            let res = proxy.handle(req).await;
            assert_eq!(res.status(), StatusCode::PARTIAL_CONTENT);
            assert!(header(&res, "content-encoding").is_none());
            assert_eq!(body_string(res).await, "origin.example.com");
        }
    }

    #[test]
    fn transformable_responses() {
        let parts = |status: StatusCode, encoding: Option<&'static str>| {
            let mut builder = Response::builder()
                .status(status)
                .header(CONTENT_TYPE, "text/html; charset=utf-8");
            if let Some(encoding) = encoding {
                builder = builder.header(CONTENT_ENCODING, encoding);
            }
            builder.body(()).unwrap().into_parts().0
        };
        assert!(is_transformable(&parts(StatusCode::OK, None)));
        assert!(is_transformable(&parts(StatusCode::OK, Some("identity"))));
        assert!(is_transformable(&parts(StatusCode::OK, Some("IDENTITY"))));
        assert!(!is_transformable(&parts(StatusCode::OK, Some("gzip"))));
        assert!(!is_transformable(&parts(StatusCode::PARTIAL_CONTENT, None)));
    }

    #[tokio::test]
    async fn host_header_selects_the_site() {
        let proxy = proxy_with(Arc::new(FakeOrigin::html(PAGE)));

        let req = Request::builder()
            .uri("/page")
            .header(HOST, "A.Example.COM:8443")
            .header("sec-fetch-dest", "document")
            .body(Body::empty())
            .unwrap();
        let res = proxy.handle(req).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_string(res).await, REWRITTEN);

        // The `Host` header wins over the URI authority.
        let req = Request::builder()
            .uri("http://a.example.com/page")
            .header(HOST, "b.example.com")
            .body(Body::empty())
            .unwrap();
        assert_eq!(proxy.handle(req).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wrong_hash_falls_back_to_rewriting() {
        let proxy = proxy_with(Arc::new(FakeOrigin::html(PAGE)));
        let wrong = DictionaryHash::digest(b"some other dictionary").to_header_value();

        let res = proxy
            .handle(document_request(&[
                ("available-dictionary", wrong.as_str()),
                ("dictionary-id", "\"a\""),
            ]))
            .await;
        assert!(header(&res, "content-encoding").is_none());
        assert!(header(&res, "link").is_some());
        assert_eq!(body_string(res).await, REWRITTEN);
    }

    #[tokio::test]
    async fn wrong_id_or_encoding_falls_back_to_rewriting() {
        let proxy = proxy_with(Arc::new(FakeOrigin::html(PAGE)));
        let hash = DictionaryHash::digest(DICT).to_header_value();

        let wrong_id = document_request(&[
            ("available-dictionary", hash.as_str()),
            ("dictionary-id", "\"b\""),
        ]);
        let no_dcz = request(
            "/page",
            &[
                ("sec-fetch-dest", "document"),
                ("accept-encoding", "gzip, dcz;q=0"),
                ("available-dictionary", hash.as_str()),
                ("dictionary-id", "\"a\""),
            ],
        );

        for req in [wrong_id, no_dcz] {
            let res = proxy.handle(req).await;
            assert!(header(&res, "content-encoding").is_none());
            assert_eq!(body_string(res).await, REWRITTEN);
        }
    }

    #[tokio::test]
    async fn subresources_are_proxied_verbatim() {
        let origin = Arc::new(FakeOrigin {
            status: StatusCode::OK,
            headers: vec![(CONTENT_TYPE, "text/css"), (CONTENT_LENGTH, "26")],
            body: "a{url(origin.example.com)}",
            fail: false,
            seen: Mutex::new(vec![]),
        });
        let proxy = proxy_with(origin.clone());

        let res = proxy
            .handle(request(
                "/s.css",
                &[("sec-fetch-dest", "style"), ("accept-encoding", "br")],
            ))
            .await;
        assert!(header(&res, "link").is_none());
        assert_eq!(header(&res, "content-length"), Some("26"));
        assert_eq!(body_string(res).await, "a{url(origin.example.com)}");

        let (_, headers) = origin.last_request();
        assert_eq!(headers.get(ACCEPT_ENCODING).unwrap(), "br");
    }

    #[tokio::test]
    async fn non_html_documents_are_not_rewritten() {
        let origin = Arc::new(FakeOrigin {
            status: StatusCode::OK,
            headers: vec![(CONTENT_TYPE, "application/pdf")],
            body: "%PDF origin.example.com",
            fail: false,
            seen: Mutex::new(vec![]),
        });
        let proxy = proxy_with(origin);
        let res = proxy.handle(document_request(&[])).await;
        assert!(header(&res, "link").is_some());
        assert_eq!(body_string(res).await, "%PDF origin.example.com");
    }

    #[tokio::test]
    async fn serves_dictionary_assets() {
        let proxy = proxy_with(Arc::new(FakeOrigin::html(PAGE)));

        let res = proxy.handle(request("/dictionary/a", &[])).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(header(&res, "content-type"), Some("text/plain; charset=UTF-8"));
        assert_eq!(header(&res, "cache-control"), Some("public, max-age=2592000"));
        assert_eq!(
            header(&res, "use-as-dictionary"),
            Some("id=\"a\", match=\"/*\", match-dest=(\"document\" \"frame\")"),
        );
        let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
        assert_eq!(&body[..], DICT);

        let res = proxy.handle(request("/dictionary/b", &[])).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_hosts_and_origin_failures() {
        let mut failing = FakeOrigin::html(PAGE);
        failing.fail = true;
        let proxy = proxy_with(Arc::new(failing));

        let req = Request::builder()
            .uri("http://b.example.com/")
            .header(HOST, "b.example.com")
            .body(Body::empty())
            .unwrap();
        assert_eq!(proxy.handle(req).await.status(), StatusCode::NOT_FOUND);

        let res = proxy.handle(document_request(&[])).await;
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn parses_fetch_dest() {
        let mut headers = HeaderMap::new();
        assert_eq!(FetchDest::from_headers(&headers), None);
        for (value, dest) in [
            ("document", Some(FetchDest::Document)),
            ("Document", Some(FetchDest::Document)),
            ("iframe", Some(FetchDest::Iframe)),
            ("frame", Some(FetchDest::Frame)),
            ("image", None),
            ("empty", None),
        ] {
            headers.insert(SEC_FETCH_DEST, HeaderValue::from_static(value));
            assert_eq!(FetchDest::from_headers(&headers), dest, "{}", value);
        }
    }

    #[test]
    fn parses_accept_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, DCZ;q=0.5"));
        assert!(accepts_encoding(&headers, "dcz"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, dcz;q=0"));
        assert!(!accepts_encoding(&headers, "dcz"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, dczz"));
        assert!(!accepts_encoding(&headers, "dcz"));
    }

    #[test]
    fn location_rewriting_only_touches_origin() {
        let site = SiteConfig {
            host: PUBLIC_HOST.to_owned(),
            origin: ORIGIN.to_owned(),
            dictionary: "a".to_owned(),
            origin_trial: None,
        };
        assert_eq!(
            rewrite_location("https://origin.example.com/x", &site).unwrap(),
            "https://a.example.com/x"
        );
        assert!(rewrite_location("/relative", &site).is_none());
        assert!(rewrite_location("https://other.example.com/", &site).is_none());
    }
}
