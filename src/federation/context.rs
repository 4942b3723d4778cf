//! Per-request and per-task context handed to dispatchers and listeners

use crate::{
    config::Data,
    document_loader::{
        CachedDocumentLoader,
        DocumentLoader,
        DocumentLoaderOptions,
        FetchDocumentLoader,
    },
    entity::Entity,
    error::Error,
    federation::FederationInner,
    lookup,
    queue::{FanoutTask, Message, MessageQueue, RecipientsSpec, SenderKey},
    signatures::{double_knock::SpecMemory, SignerIdentity},
    webfinger::WebFingerOptions,
};
use std::{collections::HashMap, ops::Deref, sync::Arc};
use url::Url;
use uuid::Uuid;

/// What a local URL refers to, as resolved by [Context::parse_uri].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParsedUri {
    /// An actor document
    Actor {
        /// The actor identifier captured from the route
        identifier: String,
    },
    /// An object document
    Object {
        /// Type id the object dispatcher was registered under
        type_id: String,
        /// Route variables
        values: HashMap<String, String>,
    },
    /// A personal inbox
    Inbox {
        /// The actor identifier
        identifier: String,
    },
    /// The shared inbox
    SharedInbox,
    /// An actor's outbox collection
    Outbox {
        /// The actor identifier
        identifier: String,
    },
    /// An actor's following collection
    Following {
        /// The actor identifier
        identifier: String,
    },
    /// An actor's followers collection
    Followers {
        /// The actor identifier
        identifier: String,
    },
    /// An actor's liked collection
    Liked {
        /// The actor identifier
        identifier: String,
    },
    /// An actor's featured collection
    Featured {
        /// The actor identifier
        identifier: String,
    },
    /// An actor's featured tags collection
    FeaturedTags {
        /// The actor identifier
        identifier: String,
    },
    /// A user-defined collection
    Collection {
        /// The collection key it was registered under
        name: String,
        /// Route variables
        values: HashMap<String, String>,
    },
}

/// Context handed to every dispatcher, listener and queue worker.
///
/// Exposes the app data, URI construction over the route table, object
/// lookup, and activity sending.
pub struct Context<T: Clone> {
    pub(crate) federation: Arc<FederationInner<T>>,
    pub(crate) origin: Option<Url>,
    pub(crate) data: Arc<Data<T>>,
}

impl<T: Clone> Clone for Context<T> {
    fn clone(&self) -> Self {
        Context {
            federation: self.federation.clone(),
            origin: self.origin.clone(),
            data: self.data.clone(),
        }
    }
}

impl<T: Clone> Deref for Context<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.data.app_data()
    }
}

impl<T: Clone + Send + Sync + 'static> Context<T> {
    /// The canonical origin for URI construction: the configured one, or the
    /// origin of the request this context was created for.
    pub fn origin(&self) -> Option<&Url> {
        self.origin.as_ref()
    }

    fn build_uri(&self, name: &str, values: &HashMap<String, String>) -> Option<Url> {
        let path = self.federation.router.build(name, values)?;
        self.origin.as_ref()?.join(&path).ok()
    }

    fn identifier_values(identifier: &str) -> HashMap<String, String> {
        HashMap::from([("identifier".to_string(), identifier.to_string())])
    }

    /// URI of the actor with the given identifier.
    pub fn actor_uri(&self, identifier: &str) -> Option<Url> {
        self.build_uri("actor", &Self::identifier_values(identifier))
    }

    /// URI of an object registered under `type_id`.
    pub fn object_uri(&self, type_id: &str, values: &HashMap<String, String>) -> Option<Url> {
        self.build_uri(&format!("object:{type_id}"), values)
    }

    /// URI of the actor's inbox.
    pub fn inbox_uri(&self, identifier: &str) -> Option<Url> {
        self.build_uri("inbox", &Self::identifier_values(identifier))
    }

    /// URI of the shared inbox.
    pub fn shared_inbox_uri(&self) -> Option<Url> {
        self.build_uri("sharedInbox", &HashMap::new())
    }

    /// URI of the actor's outbox collection.
    pub fn outbox_uri(&self, identifier: &str) -> Option<Url> {
        self.build_uri("outbox", &Self::identifier_values(identifier))
    }

    /// URI of the actor's following collection.
    pub fn following_uri(&self, identifier: &str) -> Option<Url> {
        self.build_uri("following", &Self::identifier_values(identifier))
    }

    /// URI of the actor's followers collection.
    pub fn followers_uri(&self, identifier: &str) -> Option<Url> {
        self.build_uri("followers", &Self::identifier_values(identifier))
    }

    /// URI of the actor's liked collection.
    pub fn liked_uri(&self, identifier: &str) -> Option<Url> {
        self.build_uri("liked", &Self::identifier_values(identifier))
    }

    /// URI of the actor's featured collection.
    pub fn featured_uri(&self, identifier: &str) -> Option<Url> {
        self.build_uri("featured", &Self::identifier_values(identifier))
    }

    /// URI of the actor's featured tags collection.
    pub fn featured_tags_uri(&self, identifier: &str) -> Option<Url> {
        self.build_uri("featuredTags", &Self::identifier_values(identifier))
    }

    /// URI of a user-defined collection.
    pub fn collection_uri(&self, name: &str, values: &HashMap<String, String>) -> Option<Url> {
        self.build_uri(&format!("collection:{name}"), values)
    }

    /// Reverse-route a local URL to what it addresses. Returns `None` for
    /// foreign origins and unrouted paths.
    pub fn parse_uri(&self, url: &Url) -> Option<ParsedUri> {
        let origin = self.origin.as_ref()?;
        if origin.origin() != url.origin() {
            return None;
        }
        let matched = self.federation.router.route(url.path())?;
        let identifier = || {
            matched
                .values
                .get("identifier")
                .cloned()
                .unwrap_or_default()
        };
        Some(match matched.name.as_str() {
            "actor" => ParsedUri::Actor {
                identifier: identifier(),
            },
            "inbox" => ParsedUri::Inbox {
                identifier: identifier(),
            },
            "sharedInbox" => ParsedUri::SharedInbox,
            "outbox" => ParsedUri::Outbox {
                identifier: identifier(),
            },
            "following" => ParsedUri::Following {
                identifier: identifier(),
            },
            "followers" => ParsedUri::Followers {
                identifier: identifier(),
            },
            "liked" => ParsedUri::Liked {
                identifier: identifier(),
            },
            "featured" => ParsedUri::Featured {
                identifier: identifier(),
            },
            "featuredTags" => ParsedUri::FeaturedTags {
                identifier: identifier(),
            },
            name => {
                if let Some(type_id) = name.strip_prefix("object:") {
                    ParsedUri::Object {
                        type_id: type_id.to_string(),
                        values: matched.values,
                    }
                } else if let Some(collection) = name.strip_prefix("collection:") {
                    ParsedUri::Collection {
                        name: collection.to_string(),
                        values: matched.values,
                    }
                } else {
                    return None;
                }
            }
        })
    }

    /// The signing identities of a local actor, through the key-pairs
    /// dispatcher.
    pub async fn actor_key_pairs(&self, identifier: &str) -> Result<Vec<SignerIdentity>, Error> {
        let dispatcher = self
            .federation
            .handlers
            .key_pairs
            .as_ref()
            .ok_or(Error::MissingOption("key pairs dispatcher"))?;
        dispatcher(self.clone(), identifier.to_string()).await
    }

    /// A document loader with caching but without request signing.
    pub fn document_loader(&self) -> Arc<dyn DocumentLoader> {
        self.make_loader(None)
    }

    /// A document loader that signs its GETs with `identity`.
    pub fn authenticated_document_loader(
        &self,
        identity: &SignerIdentity,
    ) -> Arc<dyn DocumentLoader> {
        self.make_loader(Some(identity.clone()))
    }

    fn make_loader(&self, identity: Option<SignerIdentity>) -> Arc<dyn DocumentLoader> {
        let config = &self.federation.config;
        let options = DocumentLoaderOptions {
            user_agent: config.user_agent.clone(),
            allow_private: config.allow_private_addresses,
            max_redirects: 5,
            timeout: config.request_timeout,
            body_limit: config.fetch_body_limit,
        };
        let fetcher: Arc<dyn DocumentLoader> = match identity {
            Some(identity) => Arc::new(FetchDocumentLoader::authenticated(
                config.client.clone(),
                options,
                identity,
                Some(SpecMemory::new(
                    config.kv.clone(),
                    config.kv_prefixes.http_message_signatures_spec.clone(),
                )),
            )),
            None => Arc::new(FetchDocumentLoader::new(config.client.clone(), options)),
        };
        Arc::new(CachedDocumentLoader::new(
            fetcher,
            config.kv.clone(),
            config.kv_prefixes.remote_document.clone(),
            config.document_cache_rules.clone(),
            config.document_cache_ttl,
        ))
    }

    /// Options for webfinger lookups made from this context.
    pub(crate) fn webfinger_options(&self) -> WebFingerOptions {
        let config = &self.federation.config;
        WebFingerOptions {
            user_agent: config.user_agent.clone(),
            max_redirection: 5,
            allow_private: config.allow_private_addresses,
            timeout: config.request_timeout,
        }
    }

    /// Resolve a URL or `user@host` handle to an entity.
    pub async fn lookup_object(&self, identifier: &str) -> Result<Entity, Error> {
        self.data.count_request()?;
        lookup::lookup_object(
            &self.federation.config.client,
            &self.document_loader(),
            identifier,
            &self.webfinger_options(),
        )
        .await
    }

    /// Queue an activity for delivery on behalf of a local actor.
    ///
    /// Expansion to per-inbox deliveries happens in the background fanout
    /// worker; this only serializes the call and enqueues it.
    pub async fn send_activity(
        &self,
        identifier: &str,
        recipients: RecipientsSpec,
        activity: &Entity,
    ) -> Result<(), Error> {
        if activity.id().is_none() {
            return Err(Error::UrlVerification("activity has no id"));
        }
        let keys = self.actor_key_pairs(identifier).await?;
        if keys.is_empty() {
            return Err(Error::MissingOption("actor has no signing keys"));
        }
        let keys: Vec<SenderKey> = keys
            .into_iter()
            .map(|identity| {
                Ok(SenderKey {
                    key_id: identity.key_id,
                    private_key_pem: identity.private_key.to_pem()?,
                })
            })
            .collect::<Result<_, Error>>()?;
        let task = FanoutTask {
            actor_identifier: identifier.to_string(),
            activity: activity.to_json_ld().clone(),
            recipients,
            keys,
            trace: Uuid::new_v4(),
        };
        self.federation
            .config
            .queue
            .enqueue(Message::Fanout(task), None)
            .await
    }
}
