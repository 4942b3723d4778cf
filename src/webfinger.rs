//! Resolves identifiers of the form `name@example.com` via the WebFinger protocol

use crate::{
    error::Error,
    reqwest_shim::ResponseExt,
    url_guard::verify_url,
};
use http::header;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};
use tracing::debug;
use url::Url;

/// The content-type for webfinger responses.
pub static WEBFINGER_CONTENT_TYPE: &str = "application/jrd+json";

/// `Accept` header sent with webfinger lookups.
static WEBFINGER_ACCEPT: &str = "application/jrd+json, application/json";

/// Response body limit for JRD documents.
const JRD_BODY_LIMIT: usize = 64 * 1024;

/// A webfinger response with information about a `Person` or other actor.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Webfinger {
    /// The resource which is described here, for example `acct:alice@example.com`
    pub subject: String,
    /// Links where further data about `subject` can be retrieved
    #[serde(default)]
    pub links: Vec<WebfingerLink>,
    /// Other Urls which identify the same actor as the `subject`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<Url>,
    /// Additional data about the subject
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<Url, String>,
}

/// A single link included as part of a [Webfinger] response.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct WebfingerLink {
    /// Relationship of the link, such as `self` or `http://webfinger.net/rel/profile-page`
    pub rel: Option<String>,
    /// Media type of the target resource
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Url pointing to the target resource
    pub href: Option<Url>,
    /// Used for remote follow external interaction url
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Additional data about the link
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<Url, String>,
}

impl Webfinger {
    /// The `self` link with an ActivityPub media type, the actor id.
    pub fn self_link(&self) -> Option<Url> {
        self.links
            .iter()
            .filter(|link| link.rel.as_deref() == Some("self"))
            .filter(|link| {
                link.kind
                    .as_deref()
                    .is_some_and(|kind| kind.starts_with("application/"))
            })
            .find_map(|link| link.href.clone())
    }
}

/// Options for [lookup_webfinger].
#[derive(Clone, Debug)]
pub struct WebFingerOptions {
    /// `User-Agent` for the lookup requests.
    pub user_agent: String,
    /// Redirects to follow before answering `None`.
    pub max_redirection: usize,
    /// Allow lookups against private addresses.
    pub allow_private: bool,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for WebFingerOptions {
    fn default() -> Self {
        WebFingerOptions {
            user_agent: concat!("fedikit/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirection: 5,
            allow_private: false,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Look up a webfinger resource.
///
/// `resource` is an `acct:user@host` identifier (with or without the
/// scheme) or an `http(s)://` URL. Redirects are followed up to
/// `max_redirection` hops, each subject to the URL guard. Anything that is
/// not eventually a 200 with a parseable JRD yields `Ok(None)`.
pub async fn lookup_webfinger(
    client: &ClientWithMiddleware,
    resource: &str,
    options: &WebFingerOptions,
) -> Result<Option<Webfinger>, Error> {
    let (resource, mut url) = webfinger_query_url(resource)?;
    debug!("fetching webfinger url: {url}");

    for _hop in 0..=options.max_redirection {
        verify_url(&url, options.allow_private).await?;
        let response = client
            .get(url.as_str())
            .header(header::ACCEPT, WEBFINGER_ACCEPT)
            .header(header::USER_AGENT, &options.user_agent)
            .timeout(options.timeout)
            .send()
            .await
            .map_err(|e| Error::fetch(&url, e))?;

        if response.status().is_redirection() {
            let Some(location) = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                return Ok(None);
            };
            url = url.join(location).map_err(Error::UrlParse)?;
            continue;
        }
        if response.status().as_u16() != 200 {
            debug!("webfinger lookup of {resource} answered {}", response.status());
            return Ok(None);
        }
        return Ok(response.json_limited::<Webfinger>(JRD_BODY_LIMIT).await.ok());
    }
    debug!("webfinger lookup of {resource} exceeded the redirection limit");
    Ok(None)
}

/// Canonicalize a resource and derive the well-known query URL for it.
fn webfinger_query_url(resource: &str) -> Result<(String, Url), Error> {
    let (canonical, base) = if let Some(rest) = resource.strip_prefix("acct:") {
        (format!("acct:{rest}"), acct_base(rest)?)
    } else if resource.starts_with("http://") || resource.starts_with("https://") {
        let url = Url::parse(resource).map_err(Error::UrlParse)?;
        let mut base = url.clone();
        base.set_path("");
        base.set_query(None);
        base.set_fragment(None);
        (url.to_string(), base)
    } else if resource.contains('@') {
        (format!("acct:{resource}"), acct_base(resource)?)
    } else {
        return Err(Error::UrlVerification("unsupported webfinger resource"));
    };

    let mut query_url = base
        .join("/.well-known/webfinger")
        .map_err(Error::UrlParse)?;
    query_url
        .query_pairs_mut()
        .append_pair("resource", &canonical);
    Ok((canonical, query_url))
}

fn acct_base(identifier: &str) -> Result<Url, Error> {
    let (_, host) = identifier
        .rsplit_once('@')
        .ok_or(Error::UrlVerification("acct resource without a host"))?;
    Url::parse(&format!("https://{host}/")).map_err(Error::UrlParse)
}

/// Extracts the username from a webfinger resource parameter.
///
/// Use this in the `.well-known/webfinger` handler. For a query of the form
/// `acct:gargron@mastodon.social` it returns `gargron`. Returns an error if
/// the query does not match the local `host`.
pub fn extract_webfinger_name<'i>(query: &'i str, host: &str) -> Result<&'i str, Error> {
    static WEBFINGER_REGEX: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^acct:([\p{L}0-9_\.\-]+)@(.*)$").expect("compile regex"));
    // Supports different alphabets using `\p{L}`.
    let captures = WEBFINGER_REGEX
        .captures(query)
        .ok_or(Error::WebfingerResolveFailed)?;

    let account_name = captures
        .get(1)
        .ok_or(Error::WebfingerResolveFailed)?;

    if captures.get(2).map(|m| m.as_str()) != Some(host) {
        return Err(Error::WebfingerResolveFailed);
    }
    Ok(account_name.as_str())
}

/// Builds a webfinger response for one or more actor URLs sharing a subject.
///
/// The URL is assumed to serve both the HTML profile and the ActivityPub
/// representation, which is the common content-negotiated setup. The second
/// tuple item is an optional actor type such as `"Person"`.
pub fn build_webfinger_response(
    subject: String,
    urls: Vec<(Url, Option<&str>)>,
) -> Webfinger {
    Webfinger {
        subject,
        links: urls.iter().fold(vec![], |mut acc, (url, kind)| {
            let properties: HashMap<Url, String> = kind
                .map(|kind| {
                    HashMap::from([(
                        "https://www.w3.org/ns/activitystreams#type"
                            .parse()
                            .expect("parse url"),
                        kind.to_string(),
                    )])
                })
                .unwrap_or_default();
            acc.push(WebfingerLink {
                rel: Some("http://webfinger.net/rel/profile-page".to_string()),
                kind: Some("text/html".to_string()),
                href: Some(url.clone()),
                ..Default::default()
            });
            acc.push(WebfingerLink {
                rel: Some("self".to_string()),
                kind: Some(crate::FEDERATION_CONTENT_TYPE.to_string()),
                href: Some(url.clone()),
                properties,
                ..Default::default()
            });
            acc
        }),
        aliases: vec![],
        properties: Default::default(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::{
        extract::Query,
        http::StatusCode,
        response::IntoResponse,
        routing::get,
        Router,
    };
    use serde_json::json;

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client() -> ClientWithMiddleware {
        ClientWithMiddleware::from(
            reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .unwrap(),
        )
    }

    fn options(max_redirection: usize) -> WebFingerOptions {
        WebFingerOptions {
            max_redirection,
            allow_private: true,
            ..WebFingerOptions::default()
        }
    }

    fn jrd_app() -> Router {
        Router::new().route(
            "/.well-known/webfinger",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                let resource = params.get("resource").cloned().unwrap_or_default();
                (
                    [("content-type", WEBFINGER_CONTENT_TYPE)],
                    json!({
                        "subject": resource,
                        "links": [{
                            "rel": "self",
                            "type": "application/activity+json",
                            "href": "https://example.com/users/alice",
                        }]
                    })
                    .to_string(),
                )
            }),
        )
    }

    #[tokio::test]
    async fn test_lookup_url_resource() {
        let base = spawn(jrd_app()).await;
        let resource = format!("{base}/users/alice");
        let jrd = lookup_webfinger(&client(), &resource, &options(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(jrd.subject, resource);
        assert_eq!(
            jrd.self_link().unwrap().as_str(),
            "https://example.com/users/alice"
        );
    }

    #[tokio::test]
    async fn test_redirection_limit() {
        // Three hops before the JRD; null with limit 2, success with limit 3.
        let app = Router::new()
            .route(
                "/.well-known/webfinger",
                get(|| async { (StatusCode::FOUND, [("location", "/hop1")]).into_response() }),
            )
            .route(
                "/hop1",
                get(|| async { (StatusCode::FOUND, [("location", "/hop2")]).into_response() }),
            )
            .route(
                "/hop2",
                get(|| async { (StatusCode::FOUND, [("location", "/final")]).into_response() }),
            )
            .route(
                "/final",
                get(|| async {
                    (
                        [("content-type", WEBFINGER_CONTENT_TYPE)],
                        json!({"subject": "acct:alice@example.com", "links": []}).to_string(),
                    )
                        .into_response()
                }),
            );
        let base = spawn(app).await;
        let resource = format!("{base}/users/alice");

        let jrd = lookup_webfinger(&client(), &resource, &options(2))
            .await
            .unwrap();
        assert!(jrd.is_none());

        let jrd = lookup_webfinger(&client(), &resource, &options(3))
            .await
            .unwrap();
        assert_eq!(jrd.unwrap().subject, "acct:alice@example.com");
    }

    #[tokio::test]
    async fn test_non_200_and_invalid_jrd_yield_none() {
        let app = Router::new()
            .route(
                "/.well-known/webfinger",
                get(|Query(params): Query<HashMap<String, String>>| async move {
                    match params.get("resource").map(String::as_str) {
                        Some(r) if r.contains("missing") => {
                            StatusCode::NOT_FOUND.into_response()
                        }
                        _ => ([("content-type", "text/html")], "<html>nope</html>")
                            .into_response(),
                    }
                }),
            );
        let base = spawn(app).await;

        let missing = format!("{base}/users/missing");
        assert!(lookup_webfinger(&client(), &missing, &options(5))
            .await
            .unwrap()
            .is_none());

        let garbled = format!("{base}/users/alice");
        assert!(lookup_webfinger(&client(), &garbled, &options(5))
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_query_url_encoding() {
        let (canonical, url) = webfinger_query_url("alice@example.com").unwrap();
        assert_eq!(canonical, "acct:alice@example.com");
        assert_eq!(
            url.as_str(),
            "https://example.com/.well-known/webfinger?resource=acct%3Aalice%40example.com"
        );

        let (_, url) = webfinger_query_url("acct:alice@example.com").unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.com/.well-known/webfinger?resource=acct%3Aalice%40example.com"
        );

        let (_, url) =
            webfinger_query_url("https://example.com/users/alice?x=1#frag").unwrap();
        assert!(url
            .as_str()
            .starts_with("https://example.com/.well-known/webfinger?resource=https%3A%2F%2F"));

        assert!(webfinger_query_url("just-a-name").is_err());
    }

    #[test]
    fn test_webfinger_extract_name() {
        assert_eq!(
            extract_webfinger_name("acct:test123@example.com", "example.com").unwrap(),
            "test123"
        );
        assert_eq!(
            extract_webfinger_name("acct:Владимир@example.com", "example.com").unwrap(),
            "Владимир"
        );
        assert_eq!(
            extract_webfinger_name("acct:da-sh@example.com", "example.com").unwrap(),
            "da-sh"
        );
        assert!(extract_webfinger_name("acct:alice@other.com", "example.com").is_err());
        assert!(extract_webfinger_name("alice@example.com", "example.com").is_err());
    }

    #[test]
    fn test_build_webfinger_response() {
        let url = Url::parse("https://example.com/users/alice").unwrap();
        let jrd = build_webfinger_response(
            "acct:alice@example.com".to_string(),
            vec![(url.clone(), Some("Person"))],
        );
        assert_eq!(jrd.subject, "acct:alice@example.com");
        assert_eq!(jrd.links.len(), 2);
        assert_eq!(jrd.self_link().unwrap(), url);
    }
}
