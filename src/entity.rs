//! JSON-LD entities and the small protocol structs embedded in them
//!
//! The vocabulary proper (Person, Note, Create, ...) lives outside this crate;
//! everything here treats an entity as a JSON-LD document with accessors for
//! the handful of fields the dispatch and delivery machinery needs.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// The ActivityStreams namespace that bare type names resolve against.
pub const ACTIVITYSTREAMS_NS: &str = "https://www.w3.org/ns/activitystreams";

/// Default `@context` for outgoing documents.
const DEFAULT_CONTEXT: &str = ACTIVITYSTREAMS_NS;

/// An opaque vocabulary entity: a JSON-LD object with typed accessors.
///
/// Lossless by construction; [Entity::to_json_ld] returns exactly the
/// document the entity was built from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(Value);

impl Entity {
    /// Wrap a JSON-LD document. Fails unless the value is a JSON object.
    pub fn from_json_ld(document: Value) -> Result<Entity, Error> {
        if document.is_object() {
            Ok(Entity(document))
        } else {
            Err(Error::Json(serde::de::Error::custom(
                "JSON-LD entity must be an object",
            )))
        }
    }

    /// The underlying JSON-LD document.
    pub fn to_json_ld(&self) -> &Value {
        &self.0
    }

    /// Consume the entity, returning its document.
    pub fn into_json_ld(self) -> Value {
        self.0
    }

    fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    fn url_field(&self, field: &str) -> Option<Url> {
        str_or_id(self.get(field)?)
    }

    /// `id` of the entity.
    pub fn id(&self) -> Option<Url> {
        self.url_field("id")
    }

    /// The declared `type` name (first entry when several are listed).
    pub fn type_name(&self) -> Option<&str> {
        match self.get("type")? {
            Value::String(s) => Some(s),
            Value::Array(a) => a.first().and_then(Value::as_str),
            _ => None,
        }
    }

    /// Stable type identifier URI: the `type` as-is when it already is a
    /// URI, otherwise resolved against the ActivityStreams namespace.
    pub fn type_id(&self) -> Option<Url> {
        let name = self.type_name()?;
        if name.contains(':') {
            Url::parse(name).ok()
        } else {
            Url::parse(&format!("{ACTIVITYSTREAMS_NS}#{name}")).ok()
        }
    }

    /// `actor` of an activity.
    pub fn actor(&self) -> Option<Url> {
        self.url_field("actor")
    }

    /// `object` of an activity.
    pub fn object(&self) -> Option<Url> {
        self.url_field("object")
    }

    /// `target` of an activity.
    pub fn target(&self) -> Option<Url> {
        self.url_field("target")
    }

    /// All recipient URLs across `to`, `cc`, `bto`, `bcc` and `audience`,
    /// in document order, duplicates retained.
    pub fn recipients(&self) -> Vec<Url> {
        let mut out = Vec::new();
        for field in ["to", "cc", "bto", "bcc", "audience"] {
            match self.get(field) {
                Some(Value::Array(items)) => {
                    out.extend(items.iter().filter_map(str_or_id));
                }
                Some(single) => out.extend(str_or_id(single)),
                None => {}
            }
        }
        out
    }

    /// `inbox` of an actor.
    pub fn inbox(&self) -> Option<Url> {
        self.url_field("inbox")
    }

    /// `endpoints.sharedInbox` of an actor.
    pub fn shared_inbox(&self) -> Option<Url> {
        str_or_id(self.get("endpoints")?.get("sharedInbox")?)
    }

    /// `preferredUsername` of an actor.
    pub fn preferred_username(&self) -> Option<&str> {
        self.get("preferredUsername")?.as_str()
    }

    /// The embedded `publicKey` object, if any (first entry when several).
    pub fn public_key(&self) -> Option<PublicKeyJson> {
        let value = match self.get("publicKey")? {
            Value::Array(a) => a.first()?,
            other => other,
        };
        serde_json::from_value(value.clone()).ok()
    }

    /// `first` page of a collection.
    pub fn first(&self) -> Option<Url> {
        self.url_field("first")
    }

    /// `next` page of a collection page.
    pub fn next(&self) -> Option<Url> {
        self.url_field("next")
    }

    /// `totalItems` of a collection.
    pub fn total_items(&self) -> Option<u64> {
        self.get("totalItems")?.as_u64()
    }

    /// The `items` / `orderedItems` of a collection page.
    pub fn items(&self) -> Vec<Value> {
        for field in ["orderedItems", "items"] {
            match self.get(field) {
                Some(Value::Array(items)) => return items.clone(),
                Some(single) => return vec![single.clone()],
                None => {}
            }
        }
        Vec::new()
    }
}

/// Read a URL from a value that is either a string or an object with `id`.
pub(crate) fn str_or_id(value: &Value) -> Option<Url> {
    match value {
        Value::String(s) => Url::parse(s).ok(),
        Value::Object(map) => map.get("id").and_then(Value::as_str).and_then(|s| Url::parse(s).ok()),
        _ => None,
    }
}

/// Wrapper for outgoing documents which handles the `@context` field.
///
/// It avoids repeating `@context` on every struct and getting multiple
/// contexts in nested objects.
#[derive(Serialize, Deserialize, Debug)]
pub struct WithContext<T> {
    #[serde(rename = "@context")]
    context: Value,
    #[serde(flatten)]
    inner: T,
}

impl<T> WithContext<T> {
    /// Wrap with the default ActivityStreams context.
    pub fn new_default(inner: T) -> WithContext<T> {
        WithContext::new(inner, Value::String(DEFAULT_CONTEXT.to_string()))
    }

    /// Wrap with a custom context, for use with extensions.
    pub fn new(inner: T, context: Value) -> WithContext<T> {
        WithContext { context, inner }
    }

    /// Returns the wrapped object.
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

/// Public key of actors which is used for HTTP signatures, as federated in
/// the `publicKey` field.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyJson {
    /// Id of this key, conventionally `{owner}#main-key`
    pub id: String,
    /// ID of the actor that this public key belongs to
    pub owner: Url,
    /// The key in PEM (SPKI) format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_pem: Option<String>,
    /// The key in multibase form, used by Multikey documents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_multibase: Option<String>,
}

impl PublicKeyJson {
    /// Create a PEM key entry for `owner` with the standard `#main-key` id.
    pub fn new(owner: Url, public_key_pem: String) -> Self {
        let id = main_key_id(&owner);
        PublicKeyJson {
            id,
            owner,
            public_key_pem: Some(public_key_pem),
            public_key_multibase: None,
        }
    }
}

/// The conventional key id for an actor's main key.
pub fn main_key_id(owner: &Url) -> String {
    format!("{}#main-key", owner)
}

/// Check that two URLs share scheme, host and port.
///
/// An activity whose `id` and `actor` live on different origins is forged or
/// misrouted and is rejected before any listener runs.
pub fn verify_origins_match(a: &Url, b: &Url) -> Result<(), Error> {
    if a.scheme() == b.scheme() && a.host() == b.host() && a.port_or_known_default() == b.port_or_known_default()
    {
        Ok(())
    } else {
        Err(Error::UrlVerification("origins do not match"))
    }
}
