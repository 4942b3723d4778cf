#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

/// Configuration for this library
pub mod config;
/// Fetching remote JSON-LD documents with guarding, caching and signing
pub mod document_loader;
/// JSON-LD entities and their well-known field accessors
pub mod entity;
/// Error messages returned by this library
pub mod error;
/// The federation middleware: builder, request dispatch and delivery
pub mod federation;
/// Importing, exporting and validating signing keys
pub mod keys;
/// Key-value storage abstraction for caches and cross-request state
pub mod kv;
/// Resolving identifiers to objects and walking collections
pub mod lookup;
/// NodeInfo documents and discovery
pub mod nodeinfo;
/// Message queue abstraction behind the delivery pipeline
pub mod queue;
mod reqwest_shim;
/// Named URL pattern router
pub mod router;
/// HTTP message signatures in both wire dialects
pub mod signatures;
/// Constant-time comparison
pub mod timing;
/// Public/private URL destination classification
pub mod url_guard;
/// Resolves identifiers of the form `name@example.com`
pub mod webfinger;

/// Mime type for ActivityPub, used for `Accept` and `Content-Type` HTTP headers
pub static FEDERATION_CONTENT_TYPE: &str = "application/activity+json";

/// The `application/ld+json` content type with the ActivityStreams profile
pub static LD_JSON_CONTENT_TYPE: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";
