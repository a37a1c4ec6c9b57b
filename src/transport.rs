//! HTTP transport with per-phase timing.
//!
//! A [`Client`] owns a cookie jar and the idle connections it opened, keyed
//! by origin. Requests are driven through hyper's connection-level API so
//! DNS, connect, TLS, request write, first byte and body read are observed
//! on the connection itself. Redirects are followed by hand so each hop
//! feeds the jar and adds to the phase totals.

mod connect;
mod tls;
mod trace;

pub use tls::client_config;
pub use trace::Stage;

use crate::cookie::{CookieJar, ResponseCookie};
use crate::error::{ErrorKind, RequestError};
use crate::model::{Phases, StepFlags};
use bytes::Bytes;
use connect::Conn;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use parking_lot::Mutex;
use rustls::ClientConfig;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use url::{Position, Url};

/// Redirect hops followed before giving up.
pub const MAX_REDIRECTS: usize = 10;

const MAX_IDLE_PER_ORIGIN: usize = 8;

const USER_AGENT: &str = concat!("surge/", env!("CARGO_PKG_VERSION"));

/// Proxy a request is routed through.
#[derive(Clone)]
pub struct ProxyTarget {
    pub url: Url,
    /// Used when the proxy itself speaks https.
    pub tls: Arc<ClientConfig>,
}

/// A fully injected request, ready to go on the wire.
#[derive(Clone)]
pub struct Outgoing {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub timeout: Duration,
    pub flags: StepFlags,
    pub tls: Arc<ClientConfig>,
    pub proxy: Option<ProxyTarget>,
}

/// The final response after redirects.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    /// URL and method of the last hop.
    pub url: Url,
    pub method: Method,
    /// Headers sent on the last hop.
    pub request_headers: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub cookies: Vec<ResponseCookie>,
    /// Decoded body.
    pub body: Bytes,
    /// Bytes read off the wire for the last hop.
    pub content_length: u64,
    pub phases: Phases,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    scheme: String,
    host: String,
    port: u16,
    proxy: Option<String>,
    sni: Option<String>,
    tls: usize,
}

impl PoolKey {
    fn new(req: &Outgoing, url: &Url) -> Self {
        Self {
            scheme: url.scheme().to_string(),
            host: url.host_str().unwrap_or_default().to_string(),
            port: url.port_or_known_default().unwrap_or_default(),
            proxy: req.proxy.as_ref().map(|p| p.url.to_string()),
            sni: req.flags.hostname.clone(),
            tls: Arc::as_ptr(&req.tls) as usize,
        }
    }
}

struct Hop {
    status: StatusCode,
    request_headers: BTreeMap<String, String>,
    headers: HeaderMap,
    raw_len: u64,
    body: Bytes,
    phases: Phases,
}

/// An HTTP client with its own cookie jar and connections.
pub struct Client {
    jar: CookieJar,
    idle: Mutex<HashMap<PoolKey, Vec<Conn>>>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(CookieJar::new())
    }
}

impl Client {
    pub fn new(jar: CookieJar) -> Self {
        Self {
            jar,
            idle: Mutex::new(HashMap::new()),
        }
    }

    pub fn jar(&self) -> &CookieJar {
        &self.jar
    }

    /// Drop every idle connection.
    pub fn close_idle(&self) {
        self.idle.lock().clear();
    }

    /// Send `req`, following redirects unless disabled. The step timeout
    /// covers the whole exchange.
    pub async fn execute(&self, req: &Outgoing) -> Result<Response, RequestError> {
        let stage = Mutex::new(Stage::Dns);
        let started = Instant::now();
        match tokio::time::timeout(req.timeout, self.follow(req, &stage)).await {
            Ok(result) => result.map(|mut response| {
                response.duration = started.elapsed();
                response
            }),
            Err(_) => {
                let stage = *stage.lock();
                let kind = match stage {
                    Stage::Proxy => ErrorKind::Proxy,
                    s if s.is_connecting() => ErrorKind::ConnTimeout,
                    _ => ErrorKind::ReadTimeout,
                };
                Err(RequestError::new(
                    kind,
                    format!("no response within {:?}", req.timeout),
                ))
            }
        }
    }

    async fn follow(&self, req: &Outgoing, stage: &Mutex<Stage>) -> Result<Response, RequestError> {
        let mut url = req.url.clone();
        let mut method = req.method.clone();
        let mut body = req.body.clone();
        let mut headers = req.headers.clone();
        let mut phases = Phases::default();

        for hop_no in 0..=MAX_REDIRECTS {
            let hop = self.round_trip(req, &method, &url, &headers, &body, stage).await?;
            phases.add(&hop.phases);

            let cookies: Vec<ResponseCookie> = hop
                .headers
                .get_all(header::SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .filter_map(ResponseCookie::parse)
                .collect();
            self.jar.set_cookies(&url, &cookies);

            let next = if req.flags.disable_redirect {
                None
            } else {
                redirect_target(hop.status, &hop.headers, &url)
            };
            let Some(next) = next else {
                return Ok(Response {
                    status: hop.status,
                    url,
                    method,
                    request_headers: hop.request_headers,
                    headers: flatten_headers(&hop.headers),
                    cookies,
                    body: hop.body,
                    content_length: hop.raw_len,
                    phases,
                    duration: Duration::ZERO,
                });
            };

            trace!(from = %url, to = %next, hop = hop_no + 1, "following redirect");
            if !matches!(hop.status.as_u16(), 307 | 308)
                && method != Method::GET
                && method != Method::HEAD
            {
                method = Method::GET;
            }
            if !matches!(hop.status.as_u16(), 307 | 308) {
                body = None;
                headers.retain(|(name, _)| {
                    !name.eq_ignore_ascii_case("content-type")
                        && !name.eq_ignore_ascii_case("content-length")
                });
            }
            if next.host_str() != url.host_str() {
                headers.retain(|(name, _)| {
                    !name.eq_ignore_ascii_case("authorization")
                        && !name.eq_ignore_ascii_case("cookie")
                });
            }
            url = next;
        }

        Err(RequestError::new(
            ErrorKind::Unknown,
            format!("stopped after {MAX_REDIRECTS} redirects"),
        ))
    }

    async fn round_trip(
        &self,
        req: &Outgoing,
        method: &Method,
        url: &Url,
        headers: &[(String, String)],
        body: &Option<Bytes>,
        stage: &Mutex<Stage>,
    ) -> Result<Hop, RequestError> {
        let key = PoolKey::new(req, url);
        let mut idle = self.take_idle(&key);
        let (conn, mut phases, response, sent, decode, sent_at) = loop {
            let reused = idle.is_some();
            let (mut conn, phases) = match idle.take() {
                Some(conn) => (conn, Phases::default()),
                None => connect::dial(req, url, stage).await?,
            };

            let (request, sent, decode) =
                self.build_request(req, &conn, method, url, headers, body)?;

            *stage.lock() = Stage::Write;
            conn.trace.lock().reset();
            let sent_at = Instant::now();
            match conn.send(request).await {
                Ok(response) => break (conn, phases, response, sent, decode, sent_at),
                // The server closed an idle connection; redial once.
                Err(e) if reused && is_stale(&e) => {
                    debug!(%url, error = %e, "pooled connection went away, redialing");
                }
                Err(e) => {
                    return Err(RequestError::new(classify(Stage::Write, &e), e.to_string()))
                }
            }
        };

        *stage.lock() = Stage::Read;
        let (parts, incoming) = response.into_parts();
        let raw = incoming
            .collect()
            .await
            .map_err(|e| RequestError::new(classify(Stage::Read, &e), e.to_string()))?
            .to_bytes();
        let done = Instant::now();

        let (written, first_byte) = conn.trace.lock().marks();
        let written = written.unwrap_or(sent_at);
        let first_byte = first_byte.unwrap_or(done).max(written);
        phases.write = written.saturating_duration_since(sent_at);
        phases.server_processing = first_byte.saturating_duration_since(written);
        phases.read = done.saturating_duration_since(first_byte);

        let closing = parts
            .headers
            .get(header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("close"));
        if req.flags.keep_alive && !closing {
            self.put_idle(key, conn);
        }

        let raw_len = raw.len() as u64;
        let body = if decode {
            let encoding = parts
                .headers
                .get(header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok());
            decompress(encoding, raw).map_err(|e| {
                RequestError::new(ErrorKind::Unknown, format!("failed to decode body: {e}"))
            })?
        } else {
            raw
        };

        Ok(Hop {
            status: parts.status,
            request_headers: sent,
            headers: parts.headers,
            raw_len,
            body,
            phases,
        })
    }

    /// Assemble the wire request. Returns it with the headers actually sent
    /// and whether the body should be decompressed.
    fn build_request(
        &self,
        req: &Outgoing,
        conn: &Conn,
        method: &Method,
        url: &Url,
        headers: &[(String, String)],
        body: &Option<Bytes>,
    ) -> Result<(http::Request<Full<Bytes>>, BTreeMap<String, String>, bool), RequestError> {
        let invalid = |detail: String| RequestError::new(ErrorKind::InvalidRequest, detail);

        let uri = if conn.is_h2() || conn.via_proxy {
            url.as_str()
        } else {
            &url[Position::BeforePath..Position::AfterQuery]
        };

        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| invalid(format!("header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| invalid(format!("header '{name}': {e}")))?;
            map.append(name, value);
        }

        if !conn.is_h2() && !map.contains_key(header::HOST) {
            let host = &url[Position::BeforeHost..Position::AfterPort];
            map.insert(header::HOST, header_value(host)?);
        }
        if let Some(cookies) = self.jar.header_for(url) {
            let merged = match map.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
                Some(existing) => format!("{existing}; {cookies}"),
                None => cookies,
            };
            map.insert(header::COOKIE, header_value(&merged)?);
        }
        let decode = !req.flags.disable_compression && !map.contains_key(header::ACCEPT_ENCODING);
        if decode {
            map.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));
        }
        if !map.contains_key(header::USER_AGENT) {
            map.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        }
        if !req.flags.keep_alive && !conn.is_h2() {
            map.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        if let Some(auth) = &conn.proxy_auth {
            map.insert(header::PROXY_AUTHORIZATION, header_value(auth)?);
        }
        if let Some(body) = body {
            if !map.contains_key(header::CONTENT_LENGTH) {
                map.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
            }
        }

        let sent = flatten_headers(&map);
        let mut builder = http::Request::builder().method(method.clone()).uri(uri);
        if let Some(h) = builder.headers_mut() {
            *h = map;
        }
        let request = builder
            .body(Full::new(body.clone().unwrap_or_default()))
            .map_err(|e| invalid(format!("{url}: {e}")))?;
        Ok((request, sent, decode))
    }

    fn take_idle(&self, key: &PoolKey) -> Option<Conn> {
        let mut idle = self.idle.lock();
        let conns = idle.get_mut(key)?;
        while let Some(conn) = conns.pop() {
            if conn.is_open() {
                return Some(conn);
            }
        }
        None
    }

    fn put_idle(&self, key: PoolKey, conn: Conn) {
        if !conn.is_open() {
            return;
        }
        let mut idle = self.idle.lock();
        let conns = idle.entry(key).or_default();
        if conns.len() < MAX_IDLE_PER_ORIGIN {
            conns.push(conn);
        }
    }
}

/// The connection was closed before any response came back.
fn is_stale(err: &hyper::Error) -> bool {
    err.is_canceled() || err.is_closed() || err.is_incomplete_message()
}

fn header_value(value: &str) -> Result<HeaderValue, RequestError> {
    HeaderValue::from_str(value)
        .map_err(|e| RequestError::new(ErrorKind::InvalidRequest, format!("header value: {e}")))
}

/// Lower-cased header names; repeated headers are joined with `", "`.
fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}

fn redirect_target(status: StatusCode, headers: &HeaderMap, url: &Url) -> Option<Url> {
    if !matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308) {
        return None;
    }
    let location = headers.get(header::LOCATION)?.to_str().ok()?;
    url.join(location).ok()
}

fn decompress(encoding: Option<&str>, raw: Bytes) -> io::Result<Bytes> {
    let mut out = Vec::new();
    match encoding.map(str::trim) {
        Some(e) if e.eq_ignore_ascii_case("gzip") => {
            GzDecoder::new(raw.as_ref()).read_to_end(&mut out)?;
        }
        Some(e) if e.eq_ignore_ascii_case("deflate") => {
            // Servers send both zlib-wrapped and raw deflate under this name.
            if ZlibDecoder::new(raw.as_ref()).read_to_end(&mut out).is_err() {
                out.clear();
                DeflateDecoder::new(raw.as_ref()).read_to_end(&mut out)?;
            }
        }
        _ => return Ok(raw),
    }
    Ok(Bytes::from(out))
}

/// Map a transport failure to an [`ErrorKind`], looking through the error
/// chain for the underlying I/O error.
pub(crate) fn classify(stage: Stage, err: &(dyn std::error::Error + 'static)) -> ErrorKind {
    match stage {
        Stage::Proxy => return ErrorKind::Proxy,
        Stage::Dns => return ErrorKind::Dns,
        _ => {}
    }

    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<io::Error>() {
            match io.kind() {
                io::ErrorKind::ConnectionRefused => return ErrorKind::ConnRefused,
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => return ErrorKind::ConnReset,
                io::ErrorKind::TimedOut if stage.is_connecting() => {
                    return ErrorKind::ConnTimeout
                }
                io::ErrorKind::TimedOut => return ErrorKind::ReadTimeout,
                _ => {}
            }
        }
        if let Some(h) = e.downcast_ref::<hyper::Error>() {
            if h.is_incomplete_message() || h.is_closed() || h.is_canceled() {
                return ErrorKind::ConnReset;
            }
        }
        source = e.source();
    }
    debug!(?stage, error = %err, "unclassified transport error");
    ErrorKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const OK: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok";

    async fn read_head(socket: &mut tokio::net::TcpStream) {
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "client hung up");
            head.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_stale_pooled_connection_is_redialed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // First connection answers once, then drops the next request.
            let (mut first, _) = listener.accept().await.unwrap();
            read_head(&mut first).await;
            first.write_all(OK).await.unwrap();
            read_head(&mut first).await;
            drop(first);

            let (mut second, _) = listener.accept().await.unwrap();
            read_head(&mut second).await;
            second.write_all(OK).await.unwrap();
        });

        let url = Url::parse(&format!("http://{addr}/")).unwrap();
        let req = Outgoing {
            method: Method::GET,
            url,
            headers: Vec::new(),
            body: None,
            timeout: Duration::from_secs(5),
            flags: StepFlags::default(),
            tls: Arc::new(client_config(&Default::default(), false).unwrap()),
            proxy: None,
        };
        let client = Client::default();

        let first = client.execute(&req).await.unwrap();
        assert_eq!(first.status, StatusCode::OK);
        let second = client.execute(&req).await.unwrap();
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(second.body, Bytes::from("ok"));
    }

    #[test]
    fn test_classify_io_errors() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(classify(Stage::Connect, &refused), ErrorKind::ConnRefused);

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(classify(Stage::Read, &reset), ErrorKind::ConnReset);

        let timeout = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(classify(Stage::Tls, &timeout), ErrorKind::ConnTimeout);
        assert_eq!(classify(Stage::Read, &timeout), ErrorKind::ReadTimeout);

        let other = io::Error::other("boom");
        assert_eq!(classify(Stage::Dns, &other), ErrorKind::Dns);
        assert_eq!(classify(Stage::Proxy, &other), ErrorKind::Proxy);
        assert_eq!(classify(Stage::Write, &other), ErrorKind::Unknown);
    }

    #[test]
    fn test_redirect_target() {
        let url = Url::parse("http://a.test/x/y").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("/login"));
        assert_eq!(
            redirect_target(StatusCode::FOUND, &headers, &url).unwrap().as_str(),
            "http://a.test/login"
        );
        assert!(redirect_target(StatusCode::OK, &headers, &url).is_none());
        assert!(redirect_target(StatusCode::FOUND, &HeaderMap::new(), &url).is_none());
    }

    #[test]
    fn test_decompress_gzip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello world").unwrap();
        let gz = Bytes::from(encoder.finish().unwrap());

        assert_eq!(decompress(Some("gzip"), gz).unwrap(), Bytes::from("hello world"));
        assert_eq!(
            decompress(None, Bytes::from("plain")).unwrap(),
            Bytes::from("plain")
        );
        assert!(decompress(Some("gzip"), Bytes::from("not gzip")).is_err());
    }

    #[test]
    fn test_flatten_headers_joins_repeats() {
        let mut headers = HeaderMap::new();
        headers.append("x-a", HeaderValue::from_static("1"));
        headers.append("x-a", HeaderValue::from_static("2"));
        let flat = flatten_headers(&headers);
        assert_eq!(flat.get("x-a").map(String::as_str), Some("1, 2"));
    }
}
