//! Negotiating which signature dialect a peer accepts
//!
//! A delivery is first signed under the dialect we expect the peer to
//! support (remembered per origin, RFC 9421 by default). If the peer rejects
//! it, the same bytes are re-signed under the other dialect and sent again:
//! the "double knock". The surviving dialect is recorded so later deliveries
//! to that origin skip the wasted first attempt.

use crate::{
    error::Error,
    kv::{KvKey, KvStore},
    signatures::{sign_request, SignatureSpec, SignerIdentity},
};
use bytes::Bytes;
use http::{HeaderMap, Method};
use reqwest_middleware::ClientWithMiddleware;
use serde_json::Value;
use std::{str::FromStr, sync::Arc, time::Duration};
use tracing::debug;
use url::Url;

/// Remembers the last signature dialect that worked per origin.
#[derive(Clone)]
pub struct SpecMemory {
    kv: Arc<dyn KvStore>,
    prefix: KvKey,
}

impl SpecMemory {
    /// Create a memory over `kv` under `prefix`.
    pub fn new(kv: Arc<dyn KvStore>, prefix: KvKey) -> SpecMemory {
        SpecMemory { kv, prefix }
    }

    /// The remembered dialect for `origin`, if any.
    pub async fn get(&self, origin: &str) -> Option<SignatureSpec> {
        let value = self.kv.get(&self.prefix.join(origin)).await.ok()??;
        let token = value.as_str()?;
        SignatureSpec::from_str(token).ok()
    }

    /// Record that `origin` accepted `spec`.
    pub async fn set(&self, origin: &str, spec: SignatureSpec) {
        let key = self.prefix.join(origin);
        if let Err(error) = self
            .kv
            .set(&key, Value::String(spec.to_string()), None)
            .await
        {
            debug!("failed to record signature spec for {origin}: {error}");
        }
    }
}

/// Options for [double_knock].
#[derive(Clone, Debug)]
pub struct DoubleKnockOptions {
    /// Dialect to try first when nothing is remembered for the origin.
    pub first_knock: SignatureSpec,
    /// Redirect hops to follow before giving up.
    pub max_redirects: usize,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for DoubleKnockOptions {
    fn default() -> Self {
        DoubleKnockOptions {
            first_knock: SignatureSpec::Rfc9421,
            max_redirects: 5,
            timeout: Duration::from_secs(30),
        }
    }
}

/// POST `body` to `url`, signed, negotiating the signature dialect.
///
/// The body is carried as [Bytes] so it can be re-signed for every redirect
/// hop and dialect retry without re-consuming any stream. At most two signed
/// attempts are made per redirect hop. The final response is returned as-is;
/// callers classify its status.
///
/// The supplied client must not follow redirects itself; redirect handling
/// here re-signs against the new target URL.
pub async fn double_knock(
    client: &ClientWithMiddleware,
    url: Url,
    base_headers: &HeaderMap,
    body: Bytes,
    identity: &SignerIdentity,
    memory: &SpecMemory,
    options: &DoubleKnockOptions,
) -> Result<reqwest::Response, Error> {
    let mut url = url;
    let mut hops = 0usize;
    // After a dialect survives a hop it stays pinned for the rest of the chain.
    let mut pinned: Option<SignatureSpec> = None;

    loop {
        let origin = url.origin().ascii_serialization();
        let first = match pinned {
            Some(spec) => spec,
            None => memory.get(&origin).await.unwrap_or(options.first_knock),
        };

        let response = send_signed(client, &url, base_headers, &body, identity, first, options).await?;
        if let Some(location) = redirect_location(&response, &url)? {
            hops += 1;
            if hops > options.max_redirects {
                return Err(Error::TooManyRedirects(url));
            }
            debug!("delivery to {url} redirected to {location}");
            pinned = Some(first);
            url = location;
            continue;
        }

        let status = response.status().as_u16();
        if status == 400 || status == 401 || status >= 402 {
            // Second knock under the other dialect. 5xx is included because
            // some peers answer a server error to signatures in the dialect
            // they do not implement.
            let second = first.other();
            debug!("{url} answered {status} to a {first} signature, retrying with {second}");
            let response =
                send_signed(client, &url, base_headers, &body, identity, second, options).await?;
            if let Some(location) = redirect_location(&response, &url)? {
                hops += 1;
                if hops > options.max_redirects {
                    return Err(Error::TooManyRedirects(url));
                }
                pinned = Some(second);
                url = location;
                continue;
            }
            let status = response.status();
            if !status.is_client_error() && !status.is_server_error() {
                memory.set(&origin, second).await;
            }
            return Ok(response);
        }

        memory.set(&origin, first).await;
        return Ok(response);
    }
}

async fn send_signed(
    client: &ClientWithMiddleware,
    url: &Url,
    base_headers: &HeaderMap,
    body: &Bytes,
    identity: &SignerIdentity,
    spec: SignatureSpec,
    options: &DoubleKnockOptions,
) -> Result<reqwest::Response, Error> {
    let mut headers = base_headers.clone();
    sign_request(spec, &mut headers, &Method::POST, url, Some(body.as_ref()), identity)?;
    client
        .post(url.as_str())
        .headers(headers)
        .timeout(options.timeout)
        .body(body.clone())
        .send()
        .await
        .map_err(|e| Error::fetch(url, e))
}

/// The resolved redirect target, when the response is a redirect with a
/// usable `Location`. Cross-scheme redirects are refused.
fn redirect_location(response: &reqwest::Response, current: &Url) -> Result<Option<Url>, Error> {
    if !response.status().is_redirection() {
        return Ok(None);
    }
    let Some(location) = response
        .headers()
        .get(http::header::LOCATION)
        .and_then(|value| value.to_str().ok())
    else {
        return Ok(None);
    };
    let target = current.join(location).map_err(Error::UrlParse)?;
    if target.scheme() != current.scheme() {
        return Err(Error::UrlVerification("redirect changed the url scheme"));
    }
    Ok(Some(target))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        keys::generate_rsa_keypair,
        kv::MemoryKvStore,
        signatures::draft::tests::test_identity,
    };
    use axum::{
        body::Bytes as AxumBytes,
        extract::State,
        http::{HeaderMap as AxumHeaderMap, StatusCode},
        response::IntoResponse,
        routing::post,
        Router,
    };
    use std::sync::{Arc, Mutex};

    type RecordedRequest = (String, bool, Vec<u8>);

    #[derive(Clone, Default)]
    struct Seen {
        requests: Arc<Mutex<Vec<RecordedRequest>>>,
    }

    impl Seen {
        fn record(&self, path: &str, headers: &AxumHeaderMap, body: &[u8]) {
            self.requests.lock().unwrap().push((
                path.to_string(),
                headers.contains_key("signature-input"),
                body.to_vec(),
            ));
        }
    }

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn no_redirect_client() -> ClientWithMiddleware {
        ClientWithMiddleware::from(
            reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .unwrap(),
        )
    }

    fn memory() -> SpecMemory {
        SpecMemory::new(
            Arc::new(MemoryKvStore::new()),
            KvKey::new(["spec"]).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_fallback_to_draft_is_remembered() {
        // Scenario: peer rejects RFC 9421 with 401, accepts draft with 202.
        let seen = Seen::default();
        let app = Router::new()
            .route(
                "/inbox",
                post(
                    |State(seen): State<Seen>, headers: AxumHeaderMap, body: AxumBytes| async move {
                        seen.record("/inbox", &headers, &body);
                        if headers.contains_key("signature-input") {
                            StatusCode::UNAUTHORIZED
                        } else {
                            StatusCode::ACCEPTED
                        }
                    },
                ),
            )
            .with_state(seen.clone());
        let base = spawn(app).await;

        let pair = generate_rsa_keypair().unwrap();
        let identity = test_identity(&pair.private_key);
        let memory = memory();
        let url = Url::parse(&format!("{base}/inbox")).unwrap();

        let response = double_knock(
            &no_redirect_client(),
            url.clone(),
            &HeaderMap::new(),
            Bytes::from_static(b"{\"type\":\"Create\"}"),
            &identity,
            &memory,
            &DoubleKnockOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(response.status().as_u16(), 202);

        let requests = seen.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].1, "first knock is RFC 9421");
        assert!(!requests[1].1, "second knock is draft");

        let origin = url.origin().ascii_serialization();
        assert_eq!(memory.get(&origin).await, Some(SignatureSpec::DraftCavage));
    }

    #[tokio::test]
    async fn test_remembered_spec_skips_first_knock() {
        let seen = Seen::default();
        let app = Router::new()
            .route(
                "/inbox",
                post(
                    |State(seen): State<Seen>, headers: AxumHeaderMap, body: AxumBytes| async move {
                        seen.record("/inbox", &headers, &body);
                        if headers.contains_key("signature-input") {
                            StatusCode::UNAUTHORIZED
                        } else {
                            StatusCode::ACCEPTED
                        }
                    },
                ),
            )
            .with_state(seen.clone());
        let base = spawn(app).await;

        let pair = generate_rsa_keypair().unwrap();
        let identity = test_identity(&pair.private_key);
        let memory = memory();
        let url = Url::parse(&format!("{base}/inbox")).unwrap();
        memory
            .set(&url.origin().ascii_serialization(), SignatureSpec::DraftCavage)
            .await;

        let response = double_knock(
            &no_redirect_client(),
            url,
            &HeaderMap::new(),
            Bytes::from_static(b"{}"),
            &identity,
            &memory,
            &DoubleKnockOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(response.status().as_u16(), 202);
        assert_eq!(seen.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_redirect_preserves_body_and_resigns() {
        // Scenario: 302 to a second URL, then 202; the body must be
        // bit-identical and the signature made against the new URL.
        let seen = Seen::default();
        let app = Router::new()
            .route(
                "/old",
                post(|| async {
                    (StatusCode::FOUND, [("location", "/new")]).into_response()
                }),
            )
            .route(
                "/new",
                post(
                    |State(seen): State<Seen>, headers: AxumHeaderMap, body: AxumBytes| async move {
                        seen.record("/new", &headers, &body);
                        StatusCode::ACCEPTED
                    },
                ),
            )
            .with_state(seen.clone());
        let base = spawn(app).await;

        let pair = generate_rsa_keypair().unwrap();
        let identity = test_identity(&pair.private_key);
        let memory = memory();
        let body = Bytes::from_static(b"{\"id\":\"https://example.com/a/1\"}");

        let response = double_knock(
            &no_redirect_client(),
            Url::parse(&format!("{base}/old")).unwrap(),
            &HeaderMap::new(),
            body.clone(),
            &identity,
            &memory,
            &DoubleKnockOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(response.status().as_u16(), 202);

        let requests = seen.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].2, body.to_vec());
    }

    #[tokio::test]
    async fn test_redirect_loop_bounded() {
        let app = Router::new().route(
            "/loop",
            post(|| async { (StatusCode::FOUND, [("location", "/loop")]).into_response() }),
        );
        let base = spawn(app).await;

        let pair = generate_rsa_keypair().unwrap();
        let identity = test_identity(&pair.private_key);
        let result = double_knock(
            &no_redirect_client(),
            Url::parse(&format!("{base}/loop")).unwrap(),
            &HeaderMap::new(),
            Bytes::from_static(b"{}"),
            &identity,
            &memory(),
            &DoubleKnockOptions {
                max_redirects: 2,
                ..DoubleKnockOptions::default()
            },
        )
        .await;
        assert!(matches!(result, Err(Error::TooManyRedirects(_))));
    }

    #[tokio::test]
    async fn test_success_records_first_knock_spec() {
        let app = Router::new().route("/inbox", post(|| async { StatusCode::ACCEPTED }));
        let base = spawn(app).await;

        let pair = generate_rsa_keypair().unwrap();
        let identity = test_identity(&pair.private_key);
        let memory = memory();
        let url = Url::parse(&format!("{base}/inbox")).unwrap();

        double_knock(
            &no_redirect_client(),
            url.clone(),
            &HeaderMap::new(),
            Bytes::from_static(b"{}"),
            &identity,
            &memory,
            &DoubleKnockOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(
            memory.get(&url.origin().ascii_serialization()).await,
            Some(SignatureSpec::Rfc9421)
        );
    }
}
