//! Configuration for this library, with various federation settings
//!
//! Use [FederationConfig::builder](crate::config::FederationConfig::builder) to initialize it.
//!
//! ```
//! # use fedikit::config::FederationConfig;
//! let config = FederationConfig::builder()
//!     .origin("https://example.com".parse::<url::Url>()?)
//!     .app_data(())
//!     .build()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::{
    document_loader::CacheRule,
    error::Error,
    kv::{KvPrefixes, KvStore, MemoryKvStore},
    queue::{retry::RetryPolicy, InProcessMessageQueue, MessageQueue},
    signatures::SignatureSpec,
    url_guard::verify_url,
};
use async_trait::async_trait;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use reqwest_middleware::ClientWithMiddleware;
use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use url::Url;

/// Configuration for this library, with various federation related settings
#[derive(Builder, Clone)]
#[builder(build_fn(private, name = "partial_build"))]
pub struct FederationConfig<T: Clone> {
    /// Data which the application requires in handlers, such as database
    /// connection or configuration.
    pub(crate) app_data: T,
    /// Canonical web origin of this instance. When set it overrides the
    /// `Host` of incoming requests for URI construction; background workers
    /// require it to build local URIs at all.
    #[builder(setter(into, strip_option), default)]
    pub(crate) origin: Option<Url>,
    /// Key-value store for caches, idempotence records and signature spec
    /// memory.
    #[builder(default = "Arc::new(MemoryKvStore::new())")]
    pub(crate) kv: Arc<dyn KvStore>,
    /// Key prefixes for the namespaces kept in `kv`.
    #[builder(default)]
    pub(crate) kv_prefixes: KvPrefixes,
    /// Message queue backing the delivery pipeline.
    #[builder(default = "Arc::new(InProcessMessageQueue::new())")]
    pub(crate) queue: Arc<dyn MessageQueue>,
    /// Concurrent queue handler invocations.
    #[builder(default = "5")]
    pub(crate) queue_parallelism: usize,
    /// Allow requests to private addresses. For tests and local development.
    #[builder(default = "false")]
    pub(crate) allow_private_addresses: bool,
    /// Let routes match with one trailing slash more or less.
    #[builder(default = "false")]
    pub(crate) trailing_slash_insensitive: bool,
    /// Signature dialect for the first delivery attempt to an unknown peer.
    #[builder(default = "SignatureSpec::Rfc9421")]
    pub(crate) first_knock: SignatureSpec,
    /// `User-Agent` for all outgoing requests.
    #[builder(setter(into), default = "default_user_agent()")]
    pub(crate) user_agent: String,
    /// HTTP client used for all outgoing requests. Must not follow
    /// redirects itself: the document loader and the delivery path do their
    /// own redirect handling with per-hop re-signing and URL guarding.
    #[builder(default = "default_client()")]
    pub(crate) client: ClientWithMiddleware,
    /// Timeout for outgoing HTTP requests.
    #[builder(default = "Duration::from_secs(30)")]
    pub(crate) request_timeout: Duration,
    /// Allowed clock skew when verifying signature timestamps. `None`
    /// disables the check.
    #[builder(default = "Some(Duration::from_secs(60 * 60))")]
    pub(crate) signature_time_window: Option<Duration>,
    /// Backoff schedule for failed deliveries.
    #[builder(default)]
    pub(crate) retry_policy: RetryPolicy,
    /// Time budget for one queue task; an invocation exceeding it is
    /// cancelled and its task re-queued.
    #[builder(default = "Duration::from_secs(10 * 60)")]
    pub(crate) task_timeout: Duration,
    /// Maximum number of outgoing HTTP requests per incoming HTTP request,
    /// guarding against recursive-object denial of service.
    #[builder(default = "20")]
    pub(crate) http_fetch_limit: u32,
    /// Size limit for incoming inbox POST bodies.
    #[builder(default = "10 * 1024 * 1024")]
    pub(crate) inbox_body_limit: usize,
    /// Size limit for fetched remote documents.
    #[builder(default = "1024 * 1024")]
    pub(crate) fetch_body_limit: usize,
    /// TTL rules for the remote document cache, longest pattern wins.
    #[builder(default = "Vec::new()")]
    pub(crate) document_cache_rules: Vec<CacheRule>,
    /// Cache TTL for remote documents matching no rule.
    #[builder(default = "Duration::from_secs(5 * 60)")]
    pub(crate) document_cache_ttl: Duration,
    /// Function used to verify that urls are valid, See [UrlVerifier] for
    /// details.
    #[builder(default = "Box::new(DefaultUrlVerifier())")]
    pub(crate) url_verifier: Box<dyn UrlVerifier + Sync>,
}

impl<T: Clone + std::fmt::Debug> std::fmt::Debug for FederationConfig<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationConfig")
            .field("app_data", &self.app_data)
            .field("origin", &self.origin)
            .field("kv_prefixes", &self.kv_prefixes)
            .field("queue_parallelism", &self.queue_parallelism)
            .field("allow_private_addresses", &self.allow_private_addresses)
            .field(
                "trailing_slash_insensitive",
                &self.trailing_slash_insensitive,
            )
            .field("first_knock", &self.first_knock)
            .field("user_agent", &self.user_agent)
            .field("request_timeout", &self.request_timeout)
            .field("signature_time_window", &self.signature_time_window)
            .field("retry_policy", &self.retry_policy)
            .field("task_timeout", &self.task_timeout)
            .field("http_fetch_limit", &self.http_fetch_limit)
            .field("inbox_body_limit", &self.inbox_body_limit)
            .field("fetch_body_limit", &self.fetch_body_limit)
            .field("document_cache_rules", &self.document_cache_rules)
            .field("document_cache_ttl", &self.document_cache_ttl)
            .finish_non_exhaustive()
    }
}

fn default_user_agent() -> String {
    concat!("fedikit/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_client() -> ClientWithMiddleware {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap_or_default()
        .into()
}

impl<T: Clone> FederationConfig<T> {
    /// Returns a new config builder with default values.
    pub fn builder() -> FederationConfigBuilder<T> {
        FederationConfigBuilder::default()
    }

    /// Perform security checks on a URL before fetching or delivering to it:
    /// scheme, private-address classification and the user-supplied
    /// [UrlVerifier].
    pub(crate) async fn verify_url_valid(&self, url: &Url) -> Result<(), Error> {
        // Urls which use our own origin are not a security risk, no further
        // verification needed.
        if self.is_local_url(url) {
            return Ok(());
        }
        verify_url(url, self.allow_private_addresses).await?;
        self.url_verifier
            .verify(url)
            .await
            .map_err(Error::UrlVerification)?;
        Ok(())
    }

    /// Returns true if the url refers to this instance.
    pub(crate) fn is_local_url(&self, url: &Url) -> bool {
        match &self.origin {
            Some(origin) => origin.origin() == url.origin(),
            None => false,
        }
    }

    /// The configured canonical origin, if any.
    pub fn origin(&self) -> Option<&Url> {
        self.origin.as_ref()
    }
}

impl<T: Clone> FederationConfigBuilder<T> {
    /// Constructs a new config instance with the values supplied to builder.
    /// Values which are not explicitly specified use the defaults.
    pub fn build(&mut self) -> Result<FederationConfig<T>, Error> {
        self.partial_build()
            .map_err(|e| Error::MissingOption(match e {
                FederationConfigBuilderError::UninitializedField(field) => field,
                FederationConfigBuilderError::ValidationError(_) => "validation",
            }))
    }
}

impl<T: Clone> Deref for FederationConfig<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.app_data
    }
}

/// Handler for validating URLs.
///
/// This is used for implementing domain blocklists and similar
/// functionality. It is called for newly received activity ids, before
/// fetching remote data from a given URL and before delivering to an inbox.
/// If processing for this URL should be aborted, return an error.
#[async_trait]
pub trait UrlVerifier: DynClone + Send {
    /// Should return Ok iff the given url is valid for processing.
    async fn verify(&self, url: &Url) -> Result<(), &'static str>;
}

/// Default URL verifier which does nothing.
#[derive(Clone)]
struct DefaultUrlVerifier();

#[async_trait]
impl UrlVerifier for DefaultUrlVerifier {
    async fn verify(&self, _url: &Url) -> Result<(), &'static str> {
        Ok(())
    }
}

clone_trait_object!(UrlVerifier);

/// Stores data for handling one specific HTTP request or one queue task.
///
/// It gives access to the `app_data` which was passed to
/// [FederationConfig::builder]. Additionally it contains a counter for
/// outgoing HTTP requests, to prevent denial of service through recursive
/// object fetching.
pub struct Data<T: Clone> {
    pub(crate) config: FederationConfig<T>,
    pub(crate) request_counter: AtomicU32,
}

impl<T: Clone> Data<T> {
    /// Returns the data which was stored in
    /// [FederationConfigBuilder::app_data].
    pub fn app_data(&self) -> &T {
        &self.config.app_data
    }

    /// Count one outgoing request, failing once the fetch limit is reached.
    pub(crate) fn count_request(&self) -> Result<(), Error> {
        let counter = self.request_counter.fetch_add(1, Ordering::SeqCst);
        if counter >= self.config.http_fetch_limit {
            return Err(Error::RequestLimit);
        }
        Ok(())
    }

    /// Total number of outgoing HTTP requests made with this data.
    pub fn request_count(&self) -> u32 {
        self.request_counter.load(Ordering::Relaxed)
    }
}

impl<T: Clone> FederationConfig<T> {
    /// Create new [Data] from this config.
    pub fn to_request_data(&self) -> Data<T> {
        Data {
            config: self.clone(),
            request_counter: Default::default(),
        }
    }
}

impl<T: Clone> Deref for Data<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.config.app_data
    }
}
