//! Fetching remote JSON-LD documents
//!
//! The loader is the single funnel for remote reads: actor documents, keys,
//! collections, webfinger targets. Every fetch is URL-guarded, size-limited
//! and bounded in redirects; an authenticated variant signs its GETs so
//! peers with authorized-fetch enabled answer them.

use crate::{
    error::Error,
    kv::{KvKey, KvStore},
    reqwest_shim::ResponseExt,
    signatures::{
        double_knock::SpecMemory,
        sign_request,
        SignatureSpec,
        SignerIdentity,
    },
    url_guard::{classify, verify_url, UrlKind},
};
use async_trait::async_trait;
use http::{header, HeaderMap, Method};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tracing::debug;
use url::Url;

/// `Accept` header for document fetches.
pub static DOCUMENT_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// The JSON-LD context link relation in `Link` headers.
const CONTEXT_REL: &str = "http://www.w3.org/ns/json-ld#context";

/// A fetched JSON-LD document.
#[derive(Clone, Debug)]
pub struct RemoteDocument {
    /// Final URL the document was fetched from, after redirects.
    pub document_url: Url,
    /// Context URL advertised via a `Link` header, if any.
    pub context_url: Option<Url>,
    /// The parsed document.
    pub document: Value,
}

/// Loads a URL and returns its parsed JSON-LD document.
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    /// Fetch `url`.
    async fn load(&self, url: &Url) -> Result<RemoteDocument, Error>;
}

/// Options shared by the fetching loaders.
#[derive(Clone, Debug)]
pub struct DocumentLoaderOptions {
    /// `User-Agent` sent with every request.
    pub user_agent: String,
    /// Allow fetching private addresses (tests and local development).
    pub allow_private: bool,
    /// Redirect hops (including HTML alternate hops) before giving up.
    pub max_redirects: usize,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Response body size limit.
    pub body_limit: usize,
}

impl Default for DocumentLoaderOptions {
    fn default() -> Self {
        DocumentLoaderOptions {
            user_agent: concat!("fedikit/", env!("CARGO_PKG_VERSION")).to_string(),
            allow_private: false,
            max_redirects: 5,
            timeout: Duration::from_secs(30),
            body_limit: 1024 * 1024,
        }
    }
}

struct LoaderSigner {
    identity: SignerIdentity,
    memory: Option<SpecMemory>,
}

/// [DocumentLoader] that fetches over HTTP.
///
/// The client must not follow redirects itself; the loader re-applies the
/// URL guard on every hop.
pub struct FetchDocumentLoader {
    client: ClientWithMiddleware,
    options: DocumentLoaderOptions,
    signer: Option<LoaderSigner>,
}

impl FetchDocumentLoader {
    /// A loader issuing anonymous GETs.
    pub fn new(client: ClientWithMiddleware, options: DocumentLoaderOptions) -> Self {
        FetchDocumentLoader {
            client,
            options,
            signer: None,
        }
    }

    /// A loader that signs every GET with `identity`.
    ///
    /// The first GET to an origin is signed under the legacy dialect;
    /// when `memory` is given, an origin's remembered dialect is used
    /// instead. Requests to private addresses are never signed.
    pub fn authenticated(
        client: ClientWithMiddleware,
        options: DocumentLoaderOptions,
        identity: SignerIdentity,
        memory: Option<SpecMemory>,
    ) -> Self {
        FetchDocumentLoader {
            client,
            options,
            signer: Some(LoaderSigner { identity, memory }),
        }
    }

    async fn fetch_once(&self, url: &Url) -> Result<reqwest::Response, Error> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static(DOCUMENT_ACCEPT));
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_str(&self.options.user_agent).map_err(Error::other)?,
        );
        if let Some(signer) = &self.signer {
            // GETs to private addresses are never signed.
            if classify(url)? == UrlKind::Public {
                let spec = match &signer.memory {
                    Some(memory) => memory
                        .get(&url.origin().ascii_serialization())
                        .await
                        .unwrap_or(SignatureSpec::DraftCavage),
                    None => SignatureSpec::DraftCavage,
                };
                sign_request(spec, &mut headers, &Method::GET, url, None, &signer.identity)?;
            }
        }
        self.client
            .get(url.as_str())
            .headers(headers)
            .timeout(self.options.timeout)
            .send()
            .await
            .map_err(|e| Error::fetch(url, e))
    }
}

#[async_trait]
impl DocumentLoader for FetchDocumentLoader {
    async fn load(&self, url: &Url) -> Result<RemoteDocument, Error> {
        // An authenticated loader refuses plain http targets; there is no
        // point signing requests an eavesdropper can replay.
        if self.signer.is_some() && url.scheme() == "http" && !self.options.allow_private {
            return Err(Error::UrlVerification(
                "authenticated fetch requires https",
            ));
        }

        let mut url = url.clone();
        let mut hops = 0usize;
        loop {
            verify_url(&url, self.options.allow_private).await?;
            debug!("fetching remote document {url}");
            let response = self.fetch_once(&url).await?;

            if response.status().is_redirection() {
                let Some(location) = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Err(Error::fetch(
                        &url,
                        anyhow::anyhow!("redirect without a location header"),
                    ));
                };
                // A relative Location resolves against the current URL.
                let target = url.join(location).map_err(Error::UrlParse)?;
                if target.scheme() != url.scheme() {
                    return Err(Error::UrlVerification("redirect changed the url scheme"));
                }
                hops += 1;
                if hops > self.options.max_redirects {
                    return Err(Error::TooManyRedirects(url));
                }
                url = target;
                continue;
            }

            if !response.status().is_success() {
                let status = response.status();
                return Err(Error::fetch(
                    &url,
                    anyhow::anyhow!("unexpected status {status}"),
                ));
            }

            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_ascii_lowercase();
            let context_url = link_header_target(response.headers(), CONTEXT_REL)
                .and_then(|href| url.join(&href).ok());

            if is_html(&content_type) {
                // Some servers advertise the AP representation in a Link
                // header rather than the markup.
                if let Some(alternate) = link_header_alternate(response.headers()) {
                    let target = url.join(&alternate).map_err(Error::UrlParse)?;
                    hops += 1;
                    if hops > self.options.max_redirects {
                        return Err(Error::TooManyRedirects(url));
                    }
                    url = target;
                    continue;
                }
                let body = response.text_limited(self.options.body_limit).await?;
                let Some(alternate) = html_alternate(&body) else {
                    return Err(Error::BadContentType(content_type));
                };
                let target = url.join(&alternate).map_err(Error::UrlParse)?;
                hops += 1;
                if hops > self.options.max_redirects {
                    return Err(Error::TooManyRedirects(url));
                }
                url = target;
                continue;
            }

            let bytes = response.bytes_limited(self.options.body_limit).await?;
            // Anything that parses as JSON is accepted, even under a wrong
            // content type; plenty of servers mislabel their AP documents.
            let document: Value = match serde_json::from_slice(&bytes) {
                Ok(document) => document,
                Err(_) if !is_json(&content_type) => {
                    return Err(Error::BadContentType(content_type));
                }
                Err(e) => return Err(Error::Json(e)),
            };
            return Ok(RemoteDocument {
                document_url: url,
                context_url,
                document,
            });
        }
    }
}

fn is_json(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    essence == "application/json" || essence.ends_with("+json")
}

fn is_html(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    essence == "text/html" || essence == "application/xhtml+xml"
}

/// Find the target of a `Link` header entry with the given `rel`.
fn link_header_target(headers: &HeaderMap, rel: &str) -> Option<String> {
    for value in headers.get_all(header::LINK) {
        let value = value.to_str().ok()?;
        for entry in value.split(',') {
            let mut parts = entry.split(';');
            let target = parts.next()?.trim();
            let target = target.strip_prefix('<')?.strip_suffix('>')?;
            for param in parts {
                let (key, val) = param.trim().split_once('=')?;
                if key.trim().eq_ignore_ascii_case("rel")
                    && val.trim().trim_matches('"') == rel
                {
                    return Some(target.to_string());
                }
            }
        }
    }
    None
}

/// Find an `alternate` Link header entry with an ActivityPub media type.
fn link_header_alternate(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(header::LINK) {
        let value = value.to_str().ok()?;
        for entry in value.split(',') {
            let mut parts = entry.split(';');
            let target = parts.next()?.trim();
            let Some(target) = target.strip_prefix('<').and_then(|t| t.strip_suffix('>')) else {
                continue;
            };
            let mut rel_alternate = false;
            let mut ap_type = false;
            for param in parts {
                let Some((key, val)) = param.trim().split_once('=') else {
                    continue;
                };
                let val = val.trim().trim_matches('"');
                match key.trim().to_ascii_lowercase().as_str() {
                    "rel" => rel_alternate = val.split_whitespace().any(|r| r == "alternate"),
                    "type" => ap_type = is_activity_type(val),
                    _ => {}
                }
            }
            if rel_alternate && ap_type {
                return Some(target.to_string());
            }
        }
    }
    None
}

fn is_activity_type(media_type: &str) -> bool {
    let essence = media_type.split(';').next().unwrap_or_default().trim();
    essence == "application/activity+json" || essence == "application/ld+json"
}

static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(?:link|a)\b[^>]*>").expect("compile regex"));
static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)([a-z][a-z0-9-]*)\s*=\s*("[^"]*"|'[^']*')"#).expect("compile regex")
});

/// Scan HTML for `<link rel="alternate" type="application/activity+json">`
/// (or an equivalent `<a>`), returning its `href`.
fn html_alternate(html: &str) -> Option<String> {
    for tag in TAG_RE.find_iter(html) {
        let mut rel_alternate = false;
        let mut ap_type = false;
        let mut href: Option<String> = None;
        for attr in ATTR_RE.captures_iter(tag.as_str()) {
            let name = attr[1].to_ascii_lowercase();
            let value = attr[2].trim_matches(|c| c == '"' || c == '\'');
            match name.as_str() {
                "rel" => {
                    rel_alternate = value
                        .split_whitespace()
                        .any(|r| r.eq_ignore_ascii_case("alternate"));
                }
                "type" => ap_type = is_activity_type(value),
                "href" => href = Some(value.to_string()),
                _ => {}
            }
        }
        if rel_alternate && ap_type {
            if let Some(href) = href {
                return Some(href);
            }
        }
    }
    None
}

/// One caching rule: URLs matching `pattern` are cached for `ttl`.
///
/// Patterns match the full URL (scheme, host, port, path and query) with `*`
/// as a wildcard. Among matching rules the longest pattern wins; a zero TTL
/// disables caching for its pattern.
#[derive(Clone, Debug)]
pub struct CacheRule {
    pattern: String,
    regex: Regex,
    ttl: Duration,
}

impl CacheRule {
    /// Compile a rule from a glob-style pattern.
    pub fn new(pattern: &str, ttl: Duration) -> Result<CacheRule, Error> {
        let mut escaped = String::with_capacity(pattern.len() + 8);
        escaped.push('^');
        for c in pattern.chars() {
            if c == '*' {
                escaped.push_str(".*");
            } else {
                if c.is_ascii() && !c.is_ascii_alphanumeric() {
                    escaped.push('\\');
                }
                escaped.push(c);
            }
        }
        escaped.push('$');
        Ok(CacheRule {
            pattern: pattern.to_string(),
            regex: Regex::new(&escaped).map_err(Error::other)?,
            ttl,
        })
    }

    fn matches(&self, url: &Url) -> bool {
        self.regex.is_match(url.as_str())
    }
}

/// Wraps a loader with a TTL cache in the KV store.
///
/// Only successful loads are cached; failures always propagate and are
/// retried on the next call.
pub struct CachedDocumentLoader {
    inner: Arc<dyn DocumentLoader>,
    kv: Arc<dyn KvStore>,
    prefix: KvKey,
    rules: Vec<CacheRule>,
    default_ttl: Duration,
}

impl CachedDocumentLoader {
    /// Wrap `inner`, caching under `prefix`. URLs matching no rule are
    /// cached for `default_ttl`.
    pub fn new(
        inner: Arc<dyn DocumentLoader>,
        kv: Arc<dyn KvStore>,
        prefix: KvKey,
        rules: Vec<CacheRule>,
        default_ttl: Duration,
    ) -> Self {
        CachedDocumentLoader {
            inner,
            kv,
            prefix,
            rules,
            default_ttl,
        }
    }

    fn ttl_for(&self, url: &Url) -> Duration {
        self.rules
            .iter()
            .filter(|rule| rule.matches(url))
            .max_by_key(|rule| rule.pattern.len())
            .map_or(self.default_ttl, |rule| rule.ttl)
    }
}

#[async_trait]
impl DocumentLoader for CachedDocumentLoader {
    async fn load(&self, url: &Url) -> Result<RemoteDocument, Error> {
        let ttl = self.ttl_for(url);
        if ttl.is_zero() {
            return self.inner.load(url).await;
        }
        let key = self.prefix.join(url.as_str());
        if let Ok(Some(cached)) = self.kv.get(&key).await {
            if let Some(document) = document_from_cache(&cached) {
                return Ok(document);
            }
        }
        let document = self.inner.load(url).await?;
        let entry = json!({
            "documentUrl": document.document_url.as_str(),
            "contextUrl": document.context_url.as_ref().map(Url::as_str),
            "document": document.document,
        });
        if let Err(error) = self.kv.set(&key, entry, Some(ttl)).await {
            debug!("document cache write failed for {url}: {error}");
        }
        Ok(document)
    }
}

fn document_from_cache(cached: &Value) -> Option<RemoteDocument> {
    Some(RemoteDocument {
        document_url: Url::parse(cached.get("documentUrl")?.as_str()?).ok()?,
        context_url: cached
            .get("contextUrl")
            .and_then(Value::as_str)
            .and_then(|s| Url::parse(s).ok()),
        document: cached.get("document")?.clone(),
    })
}
