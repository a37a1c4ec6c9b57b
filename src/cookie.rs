//! Cookie jar carried by each client.
//!
//! Cookies are keyed by `(name, domain, path)`; a later `Set-Cookie` with
//! the same key overwrites the stored one. `Secure` cookies are neither
//! accepted from nor sent to plain `http` URLs.

use crate::value::Value;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// Upper bound on a cookie lifetime, in seconds (400 days).
const MAX_AGE_CAP: i64 = 400 * 24 * 60 * 60;

/// A cookie as received in one `Set-Cookie` header.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub raw: String,
}

impl ResponseCookie {
    /// Parse a `Set-Cookie` header value. Unknown attributes are ignored;
    /// a header without `name=value` yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = ResponseCookie {
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            domain: None,
            path: None,
            expires: None,
            max_age: None,
            secure: false,
            http_only: false,
            raw: raw.to_string(),
        };

        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => {
                    cookie.domain = Some(val.trim_start_matches('.').to_ascii_lowercase())
                }
                "path" if val.starts_with('/') => cookie.path = Some(val.to_string()),
                "expires" => cookie.expires = parse_http_date(val),
                "max-age" => cookie.max_age = val.parse().ok(),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            }
        }
        Some(cookie)
    }

    /// One attribute as a typed value, as exposed to captures.
    pub fn field(&self, field: &str) -> Option<Value> {
        let opt = |v: &Option<String>| v.clone().map(Value::String).unwrap_or(Value::Null);
        Some(match field {
            "name" => Value::String(self.name.clone()),
            "value" => Value::String(self.value.clone()),
            "domain" => opt(&self.domain),
            "path" => opt(&self.path),
            "expires" => self
                .expires
                .map(|t| Value::Time(t.fixed_offset()))
                .unwrap_or(Value::Null),
            "max_age" => self.max_age.map(Value::Int).unwrap_or(Value::Null),
            "secure" => Value::Bool(self.secure),
            "http_only" => Value::Bool(self.http_only),
            "raw" => Value::String(self.raw.clone()),
            _ => return None,
        })
    }

    /// All attributes as a map, the shape assertions see under `cookies.<name>`.
    pub fn to_value(&self) -> Value {
        let fields = [
            "name", "value", "domain", "path", "expires", "max_age", "secure", "http_only", "raw",
        ];
        Value::Map(
            fields
                .iter()
                .filter_map(|f| self.field(f).map(|v| (f.to_string(), v)))
                .collect(),
        )
    }
}

fn parse_http_date(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc2822(text) {
        return Some(t.with_timezone(&Utc));
    }
    // Netscape style: Wed, 21-Oct-2015 07:28:00 GMT
    NaiveDateTime::parse_from_str(text, "%a, %d-%b-%Y %H:%M:%S GMT")
        .ok()
        .map(|t| t.and_utc())
}

/// A cookie supplied in the plan to pre-seed every fresh jar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
}

fn default_path() -> String {
    "/".to_string()
}

#[derive(Debug, Clone)]
struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    host_only: bool,
    path: String,
    expires: Option<DateTime<Utc>>,
    secure: bool,
}

impl StoredCookie {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|t| t <= now)
    }

    fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let host_ok = if self.host_only {
            host == self.domain
        } else {
            domain_match(&host, &self.domain)
        };
        host_ok && path_match(url.path(), &self.path) && (!self.secure || url.scheme() == "https")
    }
}

fn domain_match(host: &str, domain: &str) -> bool {
    host == domain
        || (host.ends_with(domain)
            && host.as_bytes().get(host.len() - domain.len() - 1) == Some(&b'.'))
}

fn path_match(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

/// Expiry for a `Max-Age` attribute. The age is capped so hostile values
/// cannot overflow the clock.
fn expiry_after(now: DateTime<Utc>, age: i64) -> DateTime<Utc> {
    let age = age.min(MAX_AGE_CAP);
    Duration::try_seconds(age)
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Directory of the request path, the default cookie path.
fn default_cookie_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Mutex<Vec<StoredCookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a jar pre-seeded with `seeds`. `Secure` seeds are dropped
    /// unless `target` is an https URL.
    pub fn seeded(seeds: &[SeedCookie], target: &Url) -> Self {
        let jar = Self::new();
        let https = target.scheme() == "https";
        {
            let mut cookies = jar.cookies.lock();
            for seed in seeds.iter().filter(|s| !s.secure || https) {
                let expires = seed.expires.as_deref().and_then(|e| {
                    DateTime::parse_from_rfc3339(e)
                        .ok()
                        .map(|t| t.with_timezone(&Utc))
                        .or_else(|| parse_http_date(e))
                });
                cookies.push(StoredCookie {
                    name: seed.name.clone(),
                    value: seed.value.clone(),
                    domain: seed.domain.trim_start_matches('.').to_ascii_lowercase(),
                    host_only: !seed.domain.starts_with('.'),
                    path: seed.path.clone(),
                    expires,
                    secure: seed.secure,
                });
            }
        }
        jar
    }

    /// Store the cookies a response to `url` set.
    pub fn set_cookies(&self, url: &Url, received: &[ResponseCookie]) {
        if url.scheme().is_empty() {
            return;
        }
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return;
        };
        let now = Utc::now();
        let mut cookies = self.cookies.lock();

        for rc in received {
            if rc.secure && url.scheme() != "https" {
                continue;
            }
            let (domain, host_only) = match &rc.domain {
                Some(d) if domain_match(&host, d) => (d.clone(), false),
                Some(_) => continue,
                None => (host.clone(), true),
            };
            let path = rc.path.clone().unwrap_or_else(|| default_cookie_path(url));
            let expires = match rc.max_age {
                Some(age) => Some(expiry_after(now, age)),
                None => rc.expires,
            };

            cookies.retain(|c| !(c.name == rc.name && c.domain == domain && c.path == path));
            let stored = StoredCookie {
                name: rc.name.clone(),
                value: rc.value.clone(),
                domain,
                host_only,
                path,
                expires,
                secure: rc.secure,
            };
            if !stored.is_expired(now) {
                cookies.push(stored);
            }
        }
    }

    /// Cookies to send to `url`, longest path first.
    pub fn cookies_for(&self, url: &Url) -> Vec<(String, String)> {
        let now = Utc::now();
        let mut cookies = self.cookies.lock();
        cookies.retain(|c| !c.is_expired(now));

        let mut matching: Vec<&StoredCookie> = cookies.iter().filter(|c| c.matches(url)).collect();
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        matching
            .into_iter()
            .map(|c| (c.name.clone(), c.value.clone()))
            .collect()
    }

    /// Value for a `Cookie` request header, if any cookie applies.
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let pairs = self.cookies_for(url);
        if pairs.is_empty() {
            return None;
        }
        Some(
            pairs
                .iter()
                .map(|(n, v)| format!("{n}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn len(&self) -> usize {
        self.cookies.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Index response cookies by name for the assertion environment.
pub fn cookie_map(cookies: &[ResponseCookie]) -> BTreeMap<String, Value> {
    cookies
        .iter()
        .map(|c| (c.name.clone(), c.to_value()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn set(jar: &CookieJar, u: &str, header: &str) {
        jar.set_cookies(&url(u), &[ResponseCookie::parse(header).unwrap()]);
    }

    #[test]
    fn test_parse_set_cookie() {
        let c = ResponseCookie::parse(
            "sid=abc; Domain=.Example.com; Path=/app; Max-Age=60; Secure; HttpOnly",
        )
        .unwrap();
        assert_eq!(c.name, "sid");
        assert_eq!(c.value, "abc");
        assert_eq!(c.domain.as_deref(), Some("example.com"));
        assert_eq!(c.path.as_deref(), Some("/app"));
        assert_eq!(c.max_age, Some(60));
        assert!(c.secure && c.http_only);
        assert_eq!(c.field("secure"), Some(Value::Bool(true)));
        assert_eq!(c.field("bogus"), None);
        assert!(ResponseCookie::parse("novalue").is_none());
    }

    #[test]
    fn test_parse_expires() {
        let c = ResponseCookie::parse("a=1; Expires=Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        assert_eq!(c.expires.unwrap().to_rfc3339(), "2015-10-21T07:28:00+00:00");
    }

    #[test]
    fn test_overwrite_same_key() {
        let jar = CookieJar::new();
        set(&jar, "http://a.test/", "sid=A; Path=/");
        set(&jar, "http://a.test/", "sid=B; Path=/");
        assert_eq!(jar.len(), 1);
        assert_eq!(jar.header_for(&url("http://a.test/x")).as_deref(), Some("sid=B"));
    }

    #[test]
    fn test_secure_only_over_https() {
        let jar = CookieJar::new();
        set(&jar, "http://a.test/", "s=1; Secure");
        assert!(jar.is_empty());
        set(&jar, "https://a.test/", "s=1; Secure; Path=/");
        assert!(jar.header_for(&url("http://a.test/")).is_none());
        assert_eq!(jar.header_for(&url("https://a.test/")).as_deref(), Some("s=1"));
    }

    #[test]
    fn test_domain_and_path_matching() {
        let jar = CookieJar::new();
        set(&jar, "http://www.a.test/app/login", "d=1; Domain=a.test; Path=/app");
        set(&jar, "http://www.a.test/app/login", "h=2");
        assert_eq!(jar.cookies_for(&url("http://api.a.test/app/x")).len(), 1);
        assert_eq!(jar.cookies_for(&url("http://www.a.test/app/y")).len(), 2);
        assert!(jar.cookies_for(&url("http://www.a.test/other")).is_empty());
        // foreign domain attribute is rejected
        set(&jar, "http://www.a.test/", "x=1; Domain=b.test");
        assert!(jar.cookies_for(&url("http://b.test/")).is_empty());
    }

    #[test]
    fn test_expired_cookie_is_removed() {
        let jar = CookieJar::new();
        set(&jar, "http://a.test/", "sid=A; Path=/");
        set(&jar, "http://a.test/", "sid=gone; Path=/; Max-Age=0");
        assert!(jar.is_empty());
    }

    #[test]
    fn test_huge_max_age_is_capped() {
        let jar = CookieJar::new();
        set(&jar, "http://a.test/", "a=1; Max-Age=99999999999999");
        assert_eq!(jar.header_for(&url("http://a.test/")).as_deref(), Some("a=1"));

        let expires = jar.cookies.lock()[0].expires.unwrap();
        assert!(expires <= Utc::now() + Duration::days(401));

        set(&jar, "http://a.test/", "a=1; Max-Age=-99999999999999");
        assert!(jar.is_empty());
    }

    #[test]
    fn test_seeded_filters_secure_by_scheme() {
        let seeds = vec![
            SeedCookie {
                name: "plain".into(),
                value: "1".into(),
                domain: "a.test".into(),
                path: "/".into(),
                expires: None,
                http_only: false,
                secure: false,
            },
            SeedCookie {
                name: "sec".into(),
                value: "2".into(),
                domain: "a.test".into(),
                path: "/".into(),
                expires: None,
                http_only: false,
                secure: true,
            },
        ];
        assert_eq!(CookieJar::seeded(&seeds, &url("http://a.test/")).len(), 1);
        assert_eq!(CookieJar::seeded(&seeds, &url("https://a.test/")).len(), 2);
    }
}
