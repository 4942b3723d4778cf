//! The federation middleware: request dispatch, inbox handling and delivery
//!
//! A [Federation] is configured once through
//! [FederationBuilder](builder::FederationBuilder), after which it is
//! immutable and cheap to share. Incoming requests enter through
//! [Federation::fetch] with framework-neutral `http` types; outgoing
//! activities enter through [Context::send_activity](crate::federation::context::Context::send_activity)
//! and are worked off by [Federation::process_queue].

pub mod builder;
pub mod context;
mod delivery;
mod inbox;
mod negotiation;

use crate::{
    config::FederationConfig,
    entity::{Entity, ACTIVITYSTREAMS_NS},
    error::Error,
    nodeinfo::{NodeInfo, NodeInfoVersion},
    queue::OutboxTask,
    router::Router,
    signatures::SignerIdentity,
    webfinger::{build_webfinger_response, extract_webfinger_name, WEBFINGER_CONTENT_TYPE},
    FEDERATION_CONTENT_TYPE, LD_JSON_CONTENT_TYPE,
};
use bytes::Bytes;
use context::Context;
use futures::future::BoxFuture;
use http::{header, Method, Request, Response, StatusCode};
use negotiation::Negotiated;
use serde_json::{Map, Value};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;
use url::Url;

/// Dispatcher returning the actor document for a local identifier.
pub type ActorDispatcher<T> =
    Arc<dyn Fn(Context<T>, String) -> BoxFuture<'static, Result<Option<Entity>, Error>> + Send + Sync>;

/// Dispatcher returning the signing key pairs of a local actor.
pub type KeyPairsDispatcher<T> =
    Arc<dyn Fn(Context<T>, String) -> BoxFuture<'static, Result<Vec<SignerIdentity>, Error>> + Send + Sync>;

/// Dispatcher returning an object document for the captured route values.
pub type ObjectDispatcher<T> = Arc<
    dyn Fn(Context<T>, HashMap<String, String>) -> BoxFuture<'static, Result<Option<Entity>, Error>>
        + Send
        + Sync,
>;

/// Dispatcher returning a collection document for a local identifier.
pub type CollectionDispatcher<T> =
    Arc<dyn Fn(Context<T>, String) -> BoxFuture<'static, Result<Option<Entity>, Error>> + Send + Sync>;

/// Dispatcher returning a user-defined collection for the captured values.
pub type CustomCollectionDispatcher<T> = Arc<
    dyn Fn(Context<T>, HashMap<String, String>) -> BoxFuture<'static, Result<Option<Entity>, Error>>
        + Send
        + Sync,
>;

/// Dispatcher returning this node's NodeInfo.
pub type NodeInfoDispatcher<T> =
    Arc<dyn Fn(Context<T>) -> BoxFuture<'static, Result<NodeInfo, Error>> + Send + Sync>;

/// Listener invoked for one received activity.
pub type InboxListener<T> =
    Arc<dyn Fn(Context<T>, Entity) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Callback fired when a delivery fails permanently.
pub type DeliveryErrorHandler = Arc<dyn Fn(&OutboxTask, &Error) + Send + Sync>;

pub(crate) struct Handlers<T: Clone> {
    pub(crate) actor: Option<ActorDispatcher<T>>,
    pub(crate) key_pairs: Option<KeyPairsDispatcher<T>>,
    pub(crate) objects: HashMap<String, ObjectDispatcher<T>>,
    pub(crate) collections: HashMap<String, CollectionDispatcher<T>>,
    pub(crate) custom_collections: HashMap<String, CustomCollectionDispatcher<T>>,
    pub(crate) inbox_listeners: HashMap<String, InboxListener<T>>,
    pub(crate) nodeinfo: Option<NodeInfoDispatcher<T>>,
    pub(crate) on_delivery_error: Option<DeliveryErrorHandler>,
}

impl<T: Clone> Default for Handlers<T> {
    fn default() -> Self {
        Handlers {
            actor: None,
            key_pairs: None,
            objects: HashMap::new(),
            collections: HashMap::new(),
            custom_collections: HashMap::new(),
            inbox_listeners: HashMap::new(),
            nodeinfo: None,
            on_delivery_error: None,
        }
    }
}

pub(crate) struct FederationInner<T: Clone> {
    pub(crate) config: FederationConfig<T>,
    pub(crate) router: Router,
    pub(crate) handlers: Handlers<T>,
}

/// Callback producing a response for a request the dispatcher cannot serve.
pub type ResponseCallback = Box<dyn Fn() -> Response<Bytes> + Send + Sync>;

/// Overrides for the default 404/406 responses of [Federation::fetch].
#[derive(Default)]
pub struct FetchCallbacks {
    /// Invoked when no route matches; defaults to a plain 404.
    pub on_not_found: Option<ResponseCallback>,
    /// Invoked when content negotiation picks a representation we do not
    /// serve; defaults to 406 with `Vary: Accept`.
    pub on_not_acceptable: Option<ResponseCallback>,
}

/// The compiled, immutable federation. Created once per process through
/// [FederationBuilder](builder::FederationBuilder); cloning shares the
/// configuration, route table and dispatchers.
pub struct Federation<T: Clone>(pub(crate) Arc<FederationInner<T>>);

impl<T: Clone> Clone for Federation<T> {
    fn clone(&self) -> Self {
        Federation(self.0.clone())
    }
}

impl<T: Clone + Send + Sync + 'static> Federation<T> {
    /// A context bound to the configured canonical origin, for use outside
    /// any request (queue workers, CLI-driven sends).
    pub fn context(&self) -> Context<T> {
        Context {
            federation: self.0.clone(),
            origin: self.0.config.origin.clone(),
            data: Arc::new(self.0.config.to_request_data()),
        }
    }

    fn request_context(&self, request_url: &Url) -> Context<T> {
        let origin = self.0.config.origin.clone().or_else(|| {
            Url::parse(&request_url.origin().ascii_serialization()).ok()
        });
        Context {
            federation: self.0.clone(),
            origin,
            data: Arc::new(self.0.config.to_request_data()),
        }
    }

    /// Handle one HTTP request with the default callbacks.
    pub async fn fetch(&self, request: Request<Bytes>) -> Response<Bytes> {
        self.fetch_with(request, FetchCallbacks::default()).await
    }

    /// Handle one HTTP request, routing it to the registered dispatchers.
    pub async fn fetch_with(
        &self,
        request: Request<Bytes>,
        callbacks: FetchCallbacks,
    ) -> Response<Bytes> {
        let url = match self.request_url(&request) {
            Ok(url) => url,
            Err(_) => return status_response(StatusCode::BAD_REQUEST),
        };
        match self.dispatch(&request, &url, &callbacks).await {
            Ok(response) => response,
            Err(error) => {
                debug!("request to {url} failed: {error}");
                match error {
                    Error::NotFound => not_found(&callbacks),
                    Error::Json(_) | Error::UrlParse(_) => {
                        status_response(StatusCode::BAD_REQUEST)
                    }
                    _ => status_response(StatusCode::INTERNAL_SERVER_ERROR),
                }
            }
        }
    }

    fn request_url(&self, request: &Request<Bytes>) -> Result<Url, Error> {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map_or("/", http::uri::PathAndQuery::as_str);
        if let Some(origin) = &self.0.config.origin {
            return origin.join(path_and_query).map_err(Error::UrlParse);
        }
        if request.uri().scheme().is_some() {
            return Url::parse(&request.uri().to_string()).map_err(Error::UrlParse);
        }
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .ok_or(Error::UrlVerification("request without host"))?;
        Url::parse(&format!("https://{host}{path_and_query}")).map_err(Error::UrlParse)
    }

    async fn dispatch(
        &self,
        request: &Request<Bytes>,
        url: &Url,
        callbacks: &FetchCallbacks,
    ) -> Result<Response<Bytes>, Error> {
        let Some(matched) = self.0.router.route(url.path()) else {
            return Ok(not_found(callbacks));
        };
        let ctx = self.request_context(url);

        match matched.name.as_str() {
            "webfinger" => self.handle_webfinger(ctx, request, url).await,
            "nodeInfoJrd" => self.handle_nodeinfo_jrd(ctx, callbacks).await,
            "nodeInfo" => {
                self.handle_nodeinfo(ctx, &matched.values, callbacks).await
            }
            "inbox" | "sharedInbox" => {
                if request.method() != Method::POST {
                    return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED));
                }
                let identifier = matched.values.get("identifier").cloned();
                Ok(inbox::receive_inbox(self, ctx, request, url, identifier).await)
            }
            "actor" => {
                let Some(dispatcher) = self.0.handlers.actor.clone() else {
                    return Ok(not_found(callbacks));
                };
                let identifier = matched
                    .values
                    .get("identifier")
                    .cloned()
                    .unwrap_or_default();
                self.serve_entity(
                    request,
                    callbacks,
                    dispatcher(ctx, identifier).await?,
                )
            }
            name if name.starts_with("object:") => {
                let Some(dispatcher) = self.0.handlers.objects.get(name).cloned() else {
                    return Ok(not_found(callbacks));
                };
                self.serve_entity(
                    request,
                    callbacks,
                    dispatcher(ctx, matched.values).await?,
                )
            }
            name @ ("outbox" | "following" | "followers" | "liked" | "featured"
            | "featuredTags") => {
                let Some(dispatcher) = self.0.handlers.collections.get(name).cloned() else {
                    return Ok(not_found(callbacks));
                };
                let identifier = matched
                    .values
                    .get("identifier")
                    .cloned()
                    .unwrap_or_default();
                self.serve_entity(
                    request,
                    callbacks,
                    dispatcher(ctx, identifier).await?,
                )
            }
            name if name.starts_with("collection:") => {
                let Some(dispatcher) = self.0.handlers.custom_collections.get(name).cloned()
                else {
                    return Ok(not_found(callbacks));
                };
                self.serve_entity(
                    request,
                    callbacks,
                    dispatcher(ctx, matched.values).await?,
                )
            }
            _ => Ok(not_found(callbacks)),
        }
    }

    /// Serialize a dispatched entity as negotiated JSON-LD.
    fn serve_entity(
        &self,
        request: &Request<Bytes>,
        callbacks: &FetchCallbacks,
        entity: Option<Entity>,
    ) -> Result<Response<Bytes>, Error> {
        let Some(entity) = entity else {
            return Ok(not_found(callbacks));
        };
        let accept = request
            .headers()
            .get(header::ACCEPT)
            .and_then(|value| value.to_str().ok());
        let content_type = match negotiation::negotiate(accept) {
            Negotiated::ActivityJson => FEDERATION_CONTENT_TYPE,
            Negotiated::LdJson => LD_JSON_CONTENT_TYPE,
            Negotiated::Unacceptable => return Ok(not_acceptable(callbacks)),
        };
        json_response(
            StatusCode::OK,
            content_type,
            &with_default_context(entity.to_json_ld()),
        )
    }

    async fn handle_webfinger(
        &self,
        ctx: Context<T>,
        request: &Request<Bytes>,
        url: &Url,
    ) -> Result<Response<Bytes>, Error> {
        if request.method() != Method::GET {
            return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED));
        }
        let Some(resource) = url
            .query_pairs()
            .find(|(key, _)| key == "resource")
            .map(|(_, value)| value.into_owned())
        else {
            return Ok(status_response(StatusCode::BAD_REQUEST));
        };
        let Some(origin) = ctx.origin().cloned() else {
            return Err(Error::NotFound);
        };
        let authority = authority_of(&origin);

        let identifier = if resource.starts_with("acct:") {
            match extract_webfinger_name(&resource, &authority) {
                Ok(name) => name.to_string(),
                Err(_) => return Err(Error::NotFound),
            }
        } else if let Ok(resource_url) = Url::parse(&resource) {
            match ctx.parse_uri(&resource_url) {
                Some(context::ParsedUri::Actor { identifier }) => identifier,
                _ => return Err(Error::NotFound),
            }
        } else {
            return Ok(status_response(StatusCode::BAD_REQUEST));
        };

        let Some(dispatcher) = self.0.handlers.actor.clone() else {
            return Err(Error::NotFound);
        };
        let Some(actor) = dispatcher(ctx.clone(), identifier.clone()).await? else {
            return Err(Error::NotFound);
        };

        let actor_uri = actor
            .id()
            .or_else(|| ctx.actor_uri(&identifier))
            .ok_or(Error::NotFound)?;
        let subject = format!("acct:{identifier}@{authority}");
        let jrd = build_webfinger_response(subject, vec![(actor_uri, actor.type_name())]);
        json_response(
            StatusCode::OK,
            WEBFINGER_CONTENT_TYPE,
            &serde_json::to_value(&jrd)?,
        )
    }

    async fn handle_nodeinfo_jrd(
        &self,
        ctx: Context<T>,
        callbacks: &FetchCallbacks,
    ) -> Result<Response<Bytes>, Error> {
        if self.0.handlers.nodeinfo.is_none() || !self.0.router.has("nodeInfo") {
            return Ok(not_found(callbacks));
        }
        let Some(origin) = ctx.origin().cloned() else {
            return Ok(not_found(callbacks));
        };
        let links: Vec<Value> = [NodeInfoVersion::V2_0, NodeInfoVersion::V2_1]
            .iter()
            .filter_map(|version| {
                let values =
                    HashMap::from([("version".to_string(), version.to_string())]);
                let path = self.0.router.build("nodeInfo", &values)?;
                let href = origin.join(&path).ok()?;
                Some(serde_json::json!({
                    "rel": version.schema_url(),
                    "href": href.to_string(),
                }))
            })
            .collect();
        json_response(
            StatusCode::OK,
            WEBFINGER_CONTENT_TYPE,
            &serde_json::json!({ "links": links }),
        )
    }

    async fn handle_nodeinfo(
        &self,
        ctx: Context<T>,
        values: &HashMap<String, String>,
        callbacks: &FetchCallbacks,
    ) -> Result<Response<Bytes>, Error> {
        let Some(dispatcher) = self.0.handlers.nodeinfo.clone() else {
            return Ok(not_found(callbacks));
        };
        let Some(version) = values
            .get("version")
            .and_then(|segment| NodeInfoVersion::from_path_segment(segment))
        else {
            return Ok(not_found(callbacks));
        };
        let info = dispatcher(ctx).await?;
        json_response(
            StatusCode::OK,
            "application/json",
            &info.to_document(version),
        )
    }
}

/// `host[:port]` of a URL, as used in webfinger subjects.
fn authority_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Prepend the default `@context` when the document has none.
fn with_default_context(document: &Value) -> Value {
    if document.get("@context").is_some() {
        return document.clone();
    }
    let mut out = Map::new();
    out.insert(
        "@context".to_string(),
        Value::String(ACTIVITYSTREAMS_NS.to_string()),
    );
    if let Value::Object(fields) = document {
        for (key, value) in fields {
            out.insert(key.clone(), value.clone());
        }
    }
    Value::Object(out)
}

pub(crate) fn json_response(
    status: StatusCode,
    content_type: &str,
    body: &Value,
) -> Result<Response<Bytes>, Error> {
    let bytes = serde_json::to_vec(body).map_err(Error::Json)?;
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Bytes::from(bytes))
        .map_err(Error::other)
}

pub(crate) fn status_response(status: StatusCode) -> Response<Bytes> {
    Response::builder()
        .status(status)
        .body(Bytes::new())
        .unwrap_or_default()
}

fn not_found(callbacks: &FetchCallbacks) -> Response<Bytes> {
    match &callbacks.on_not_found {
        Some(callback) => callback(),
        None => status_response(StatusCode::NOT_FOUND),
    }
}

fn not_acceptable(callbacks: &FetchCallbacks) -> Response<Bytes> {
    match &callbacks.on_not_acceptable {
        Some(callback) => callback(),
        None => Response::builder()
            .status(StatusCode::NOT_ACCEPTABLE)
            .header(header::VARY, "Accept")
            .body(Bytes::new())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::builder::FederationBuilder;
    use super::*;
    use crate::{
        entity::PublicKeyJson,
        keys::{generate_rsa_keypair, Keypair, PrivateKey},
        nodeinfo::{NodeInfoSoftware, NodeInfoUsage, SoftwareVersion},
        queue::{cancellation, RecipientsSpec},
        signatures::draft,
    };
    use axum::{routing::get, Router as AxumRouter};
    use serde_json::json;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    fn actor_entity(origin: &str, identifier: &str) -> Entity {
        Entity::from_json_ld(json!({
            "id": format!("{origin}/users/{identifier}"),
            "type": "Person",
            "preferredUsername": identifier,
            "inbox": format!("{origin}/users/{identifier}/inbox"),
        }))
        .unwrap()
    }

    fn test_federation(origin: &str, allow_private: bool) -> Federation<Arc<AtomicUsize>> {
        let listener_count: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let config = crate::config::FederationConfig::builder()
            .app_data(listener_count)
            .origin(origin.parse::<Url>().unwrap())
            .allow_private_addresses(allow_private)
            .build()
            .unwrap();

        let origin_string = origin.to_string();
        let mut builder = FederationBuilder::new();
        builder
            .set_actor_dispatcher("/users/{identifier}", move |_ctx, identifier| {
                let origin = origin_string.clone();
                async move {
                    if identifier == "alice" {
                        Ok(Some(actor_entity(&origin, &identifier)))
                    } else {
                        Ok(None)
                    }
                }
            })
            .unwrap();
        builder
            .set_inbox("/users/{identifier}/inbox", Some("/inbox"))
            .unwrap();
        builder
            .on_activity("Create", |ctx: Context<Arc<AtomicUsize>>, _activity| async move {
                ctx.fetch_add(1, Ordering::SeqCst);
                Ok::<(), Error>(())
            })
            .unwrap();
        builder
            .set_nodeinfo_dispatcher("/nodeinfo/{version}", |_ctx| async move {
                Ok(crate::nodeinfo::NodeInfo {
                    software: NodeInfoSoftware {
                        name: "fedikit-test".to_string(),
                        version: SoftwareVersion { major: 0, minor: 1, patch: 0 },
                        repository: None,
                        homepage: None,
                    },
                    protocols: vec!["activitypub".to_string()],
                    services: Default::default(),
                    open_registrations: false,
                    usage: NodeInfoUsage::default(),
                    metadata: Default::default(),
                })
            })
            .unwrap();
        builder.build(config).unwrap()
    }

    fn get_request(path: &str, accept: Option<&str>) -> Request<Bytes> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(accept) = accept {
            builder = builder.header(header::ACCEPT, accept);
        }
        builder.body(Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn test_actor_get_renders_json_ld() {
        let federation = test_federation("https://local.example", false);
        let response = federation
            .fetch(get_request("/users/alice", Some("application/activity+json")))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            FEDERATION_CONTENT_TYPE
        );
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["@context"], ACTIVITYSTREAMS_NS);
        assert_eq!(body["preferredUsername"], "alice");
    }

    #[tokio::test]
    async fn test_actor_negotiation_and_missing() {
        let federation = test_federation("https://local.example", false);

        // Browser-style Accept prefers HTML: 406 with Vary.
        let response = federation
            .fetch(get_request(
                "/users/alice",
                Some("text/html,application/xhtml+xml,*/*;q=0.8"),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
        assert_eq!(response.headers().get(header::VARY).unwrap(), "Accept");

        // Unknown actor 404s.
        let response = federation.fetch(get_request("/users/zoe", None)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Unrouted path invokes the not-found callback.
        let callbacks = FetchCallbacks {
            on_not_found: Some(Box::new(|| {
                status_response(StatusCode::GONE)
            })),
            on_not_acceptable: None,
        };
        let response = federation
            .fetch_with(get_request("/nope", None), callbacks)
            .await;
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn test_ld_json_negotiated_content_type() {
        let federation = test_federation("https://local.example", false);
        let response = federation
            .fetch(get_request(
                "/users/alice",
                Some("application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\""),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            LD_JSON_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn test_webfinger_acct_and_url_forms() {
        let federation = test_federation("https://local.example", false);

        let response = federation
            .fetch(get_request(
                "/.well-known/webfinger?resource=acct%3Aalice%40local.example",
                None,
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let jrd: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(jrd["subject"], "acct:alice@local.example");
        let self_href = jrd["links"]
            .as_array()
            .unwrap()
            .iter()
            .find(|link| link["rel"] == "self")
            .unwrap()["href"]
            .clone();
        assert_eq!(self_href, "https://local.example/users/alice");

        let response = federation
            .fetch(get_request(
                "/.well-known/webfinger?resource=https%3A%2F%2Flocal.example%2Fusers%2Falice",
                None,
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        // Unknown user and foreign domain yield 404.
        let response = federation
            .fetch(get_request(
                "/.well-known/webfinger?resource=acct%3Azoe%40local.example",
                None,
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = federation
            .fetch(get_request(
                "/.well-known/webfinger?resource=acct%3Aalice%40other.example",
                None,
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_nodeinfo_discovery_and_document() {
        let federation = test_federation("https://local.example", false);

        let response = federation
            .fetch(get_request("/.well-known/nodeinfo", None))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let jrd: Value = serde_json::from_slice(response.body()).unwrap();
        let links = jrd["links"].as_array().unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(
            links[0]["href"],
            "https://local.example/nodeinfo/2.0"
        );

        let response = federation.fetch(get_request("/nodeinfo/2.1", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let doc: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(doc["version"], "2.1");
        assert_eq!(doc["software"]["name"], "fedikit-test");
        assert_eq!(doc["openRegistrations"], false);

        let response = federation.fetch(get_request("/nodeinfo/1.0", None)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    async fn spawn_peer(keypair: &Keypair) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let origin = format!("http://{addr}");
        let public_key_pem = keypair.public_key.clone();
        let actor_origin = origin.clone();
        let app = AxumRouter::new().route(
            "/actor",
            get(move || {
                let pem = public_key_pem.clone();
                let origin = actor_origin.clone();
                async move {
                    let actor = json!({
                        "id": format!("{origin}/actor"),
                        "type": "Person",
                        "publicKey": {
                            "id": format!("{origin}/actor#main-key"),
                            "owner": format!("{origin}/actor"),
                            "publicKeyPem": pem,
                        },
                    });
                    ([("content-type", "application/activity+json")], actor.to_string())
                }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        origin
    }

    fn signed_inbox_request(
        target: &Url,
        body: &[u8],
        keypair: &Keypair,
        key_id: &str,
    ) -> Request<Bytes> {
        let identity = SignerIdentity::new(
            Url::parse(key_id).unwrap(),
            PrivateKey::import_pem(&keypair.private_key).unwrap(),
        )
        .unwrap();
        let mut headers = http::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static(FEDERATION_CONTENT_TYPE),
        );
        draft::sign_request(&mut headers, &Method::POST, target, Some(body), &identity).unwrap();

        let mut builder = Request::builder().method(Method::POST).uri(target.path());
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        builder.body(Bytes::copy_from_slice(body)).unwrap()
    }

    #[tokio::test]
    async fn test_signed_inbox_post_dispatches_once() {
        let keypair = generate_rsa_keypair().unwrap();
        let peer = spawn_peer(&keypair).await;
        let key_id = format!("{peer}/actor#main-key");

        let federation = test_federation("https://local.example", true);
        let (handle, cancel) = cancellation();
        let worker = {
            let federation = federation.clone();
            tokio::spawn(async move { federation.process_queue(cancel).await })
        };

        let activity = json!({
            "id": format!("{peer}/activities/1"),
            "type": "Create",
            "actor": format!("{peer}/actor"),
            "object": {"type": "Note", "content": "hi"},
        });
        let body = serde_json::to_vec(&activity).unwrap();
        let target = Url::parse("https://local.example/users/alice/inbox").unwrap();

        let response = federation
            .fetch(signed_inbox_request(&target, &body, &keypair, &key_id))
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        tokio::time::sleep(Duration::from_millis(300)).await;

        // The same activity again is acknowledged but not re-dispatched.
        let response = federation
            .fetch(signed_inbox_request(&target, &body, &keypair, &key_id))
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        tokio::time::sleep(Duration::from_millis(300)).await;

        handle.cancel();
        worker.await.unwrap().unwrap();

        let count = federation.0.config.app_data.load(Ordering::SeqCst);
        assert_eq!(count, 1, "listener must run exactly once");
    }

    #[tokio::test]
    async fn test_unsigned_inbox_post_rejected() {
        let federation = test_federation("https://local.example", true);
        let request = Request::builder()
            .method(Method::POST)
            .uri("/users/alice/inbox")
            .header(header::CONTENT_TYPE, FEDERATION_CONTENT_TYPE)
            .body(Bytes::from_static(b"{\"type\":\"Create\"}"))
            .unwrap();
        let response = federation.fetch(request).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_tampered_inbox_post_rejected() {
        let keypair = generate_rsa_keypair().unwrap();
        let peer = spawn_peer(&keypair).await;
        let key_id = format!("{peer}/actor#main-key");
        let federation = test_federation("https://local.example", true);

        let activity = json!({
            "id": format!("{peer}/activities/2"),
            "type": "Create",
            "actor": format!("{peer}/actor"),
        });
        let body = serde_json::to_vec(&activity).unwrap();
        let target = Url::parse("https://local.example/users/alice/inbox").unwrap();
        let mut request = signed_inbox_request(&target, &body, &keypair, &key_id);
        // Swap the body after signing.
        *request.body_mut() = Bytes::from_static(b"{\"type\":\"Delete\"}");
        let response = federation.fetch(request).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_context_uri_builders_and_parse() {
        let federation = test_federation("https://local.example", false);
        let ctx = federation.context();
        assert_eq!(
            ctx.actor_uri("alice").unwrap().as_str(),
            "https://local.example/users/alice"
        );
        assert_eq!(
            ctx.inbox_uri("alice").unwrap().as_str(),
            "https://local.example/users/alice/inbox"
        );
        assert_eq!(
            ctx.shared_inbox_uri().unwrap().as_str(),
            "https://local.example/inbox"
        );
        assert_eq!(
            ctx.parse_uri(&"https://local.example/users/bob".parse().unwrap()),
            Some(context::ParsedUri::Actor {
                identifier: "bob".to_string()
            })
        );
        assert_eq!(
            ctx.parse_uri(&"https://local.example/inbox".parse().unwrap()),
            Some(context::ParsedUri::SharedInbox)
        );
        assert_eq!(
            ctx.parse_uri(&"https://other.example/users/bob".parse().unwrap()),
            None
        );
    }

    #[tokio::test]
    async fn test_send_activity_requires_keys() {
        let federation = test_federation("https://local.example", false);
        let ctx = federation.context();
        let activity = Entity::from_json_ld(json!({
            "id": "https://local.example/activities/1",
            "type": "Create",
            "actor": "https://local.example/users/alice",
        }))
        .unwrap();
        // No key pairs dispatcher registered.
        let result = ctx
            .send_activity("alice", RecipientsSpec::Inboxes(vec![]), &activity)
            .await;
        assert!(matches!(result, Err(Error::MissingOption(_))));
    }

    #[test]
    fn test_with_default_context() {
        let doc = json!({"type": "Note"});
        let wrapped = with_default_context(&doc);
        assert_eq!(wrapped["@context"], ACTIVITYSTREAMS_NS);
        assert_eq!(wrapped["type"], "Note");

        let doc = json!({"@context": "https://example.com/custom", "type": "Note"});
        assert_eq!(with_default_context(&doc), doc);
    }

    #[test]
    fn test_public_key_json_shape() {
        let key = PublicKeyJson::new(
            Url::parse("https://local.example/users/alice").unwrap(),
            "PEM".to_string(),
        );
        let value = serde_json::to_value(&key).unwrap();
        assert_eq!(value["id"], "https://local.example/users/alice#main-key");
        assert_eq!(value["publicKeyPem"], "PEM");
        assert!(value.get("publicKeyMultibase").is_none());
    }
}

