//! Staged configuration of a [Federation]
//!
//! Dispatchers are registered during a single configuration phase; `build`
//! compiles them together with a [FederationConfig] into the immutable
//! [Federation]. Registering two dispatchers under the same route name, or
//! two collections under the same key, fails with
//! [Error::DuplicateRegistration].

use crate::{
    config::FederationConfig,
    entity::{Entity, ACTIVITYSTREAMS_NS},
    error::Error,
    federation::{
        context::Context,
        DeliveryErrorHandler,
        Federation,
        FederationInner,
        Handlers,
    },
    nodeinfo::NodeInfo,
    router::Router,
    signatures::SignerIdentity,
};
use futures::Future;
use std::{collections::HashMap, sync::Arc};

/// Builder for a [Federation]. See the module documentation.
pub struct FederationBuilder<T: Clone> {
    router: Router,
    handlers: Handlers<T>,
}

impl<T: Clone + Send + Sync + 'static> Default for FederationBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> FederationBuilder<T> {
    /// A builder with the well-known discovery routes pre-registered.
    pub fn new() -> Self {
        let mut router = Router::new(false);
        router
            .add("webfinger", "/.well-known/webfinger")
            .expect("register webfinger route");
        router
            .add("nodeInfoJrd", "/.well-known/nodeinfo")
            .expect("register nodeinfo discovery route");
        FederationBuilder {
            router,
            handlers: Handlers::default(),
        }
    }

    /// Register the actor dispatcher under `template`, e.g.
    /// `/users/{identifier}`.
    pub fn set_actor_dispatcher<F, Fut>(
        &mut self,
        template: &str,
        dispatcher: F,
    ) -> Result<&mut Self, Error>
    where
        F: Fn(Context<T>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Entity>, Error>> + Send + 'static,
    {
        self.router.add("actor", template)?;
        self.handlers.actor = Some(Arc::new(move |ctx, identifier| {
            Box::pin(dispatcher(ctx, identifier))
        }));
        Ok(self)
    }

    /// Register the dispatcher producing an actor's signing key pairs.
    pub fn set_key_pairs_dispatcher<F, Fut>(&mut self, dispatcher: F) -> &mut Self
    where
        F: Fn(Context<T>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<SignerIdentity>, Error>> + Send + 'static,
    {
        self.handlers.key_pairs = Some(Arc::new(move |ctx, identifier| {
            Box::pin(dispatcher(ctx, identifier))
        }));
        self
    }

    /// Register an object dispatcher for `type_id` under `template`, e.g.
    /// (`Note`, `/users/{identifier}/notes/{id}`).
    pub fn set_object_dispatcher<F, Fut>(
        &mut self,
        type_id: &str,
        template: &str,
        dispatcher: F,
    ) -> Result<&mut Self, Error>
    where
        F: Fn(Context<T>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Entity>, Error>> + Send + 'static,
    {
        let name = format!("object:{type_id}");
        self.router.add(name.clone(), template)?;
        self.handlers.objects.insert(
            name,
            Arc::new(move |ctx, values| Box::pin(dispatcher(ctx, values))),
        );
        Ok(self)
    }

    /// Register the inbox routes: the personal inbox template (e.g.
    /// `/users/{identifier}/inbox`) and optionally a shared inbox path.
    pub fn set_inbox(
        &mut self,
        inbox_template: &str,
        shared_inbox_template: Option<&str>,
    ) -> Result<&mut Self, Error> {
        self.router.add("inbox", inbox_template)?;
        if let Some(shared) = shared_inbox_template {
            self.router.add("sharedInbox", shared)?;
        }
        Ok(self)
    }

    /// Register a listener for one activity type. `type_name` is either a
    /// bare ActivityStreams name (`Follow`) or a full type id URI.
    ///
    /// Listeners are not serialized per inbox; a listener that needs
    /// ordering must serialize on the recipient identifier itself.
    pub fn on_activity<F, Fut>(&mut self, type_name: &str, listener: F) -> Result<&mut Self, Error>
    where
        F: Fn(Context<T>, Entity) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let type_id = if type_name.contains(':') {
            type_name.to_string()
        } else {
            format!("{ACTIVITYSTREAMS_NS}#{type_name}")
        };
        if self.handlers.inbox_listeners.contains_key(&type_id) {
            return Err(Error::DuplicateRegistration(type_id));
        }
        self.handlers.inbox_listeners.insert(
            type_id,
            Arc::new(move |ctx, activity| Box::pin(listener(ctx, activity))),
        );
        Ok(self)
    }

    fn set_collection<F, Fut>(
        &mut self,
        name: &'static str,
        template: &str,
        dispatcher: F,
    ) -> Result<&mut Self, Error>
    where
        F: Fn(Context<T>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Entity>, Error>> + Send + 'static,
    {
        self.router.add(name, template)?;
        self.handlers.collections.insert(
            name.to_string(),
            Arc::new(move |ctx, identifier| Box::pin(dispatcher(ctx, identifier))),
        );
        Ok(self)
    }

    /// Register the outbox collection dispatcher.
    pub fn set_outbox_dispatcher<F, Fut>(
        &mut self,
        template: &str,
        dispatcher: F,
    ) -> Result<&mut Self, Error>
    where
        F: Fn(Context<T>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Entity>, Error>> + Send + 'static,
    {
        self.set_collection("outbox", template, dispatcher)
    }

    /// Register the following collection dispatcher.
    pub fn set_following_dispatcher<F, Fut>(
        &mut self,
        template: &str,
        dispatcher: F,
    ) -> Result<&mut Self, Error>
    where
        F: Fn(Context<T>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Entity>, Error>> + Send + 'static,
    {
        self.set_collection("following", template, dispatcher)
    }

    /// Register the followers collection dispatcher. Fan-out to
    /// `"followers"` recipients enumerates this collection.
    pub fn set_followers_dispatcher<F, Fut>(
        &mut self,
        template: &str,
        dispatcher: F,
    ) -> Result<&mut Self, Error>
    where
        F: Fn(Context<T>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Entity>, Error>> + Send + 'static,
    {
        self.set_collection("followers", template, dispatcher)
    }

    /// Register the liked collection dispatcher.
    pub fn set_liked_dispatcher<F, Fut>(
        &mut self,
        template: &str,
        dispatcher: F,
    ) -> Result<&mut Self, Error>
    where
        F: Fn(Context<T>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Entity>, Error>> + Send + 'static,
    {
        self.set_collection("liked", template, dispatcher)
    }

    /// Register the featured collection dispatcher.
    pub fn set_featured_dispatcher<F, Fut>(
        &mut self,
        template: &str,
        dispatcher: F,
    ) -> Result<&mut Self, Error>
    where
        F: Fn(Context<T>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Entity>, Error>> + Send + 'static,
    {
        self.set_collection("featured", template, dispatcher)
    }

    /// Register the featured tags collection dispatcher.
    pub fn set_featured_tags_dispatcher<F, Fut>(
        &mut self,
        template: &str,
        dispatcher: F,
    ) -> Result<&mut Self, Error>
    where
        F: Fn(Context<T>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Entity>, Error>> + Send + 'static,
    {
        self.set_collection("featuredTags", template, dispatcher)
    }

    /// Register a user-defined collection under an opaque `key`.
    pub fn set_collection_dispatcher<F, Fut>(
        &mut self,
        key: &str,
        template: &str,
        dispatcher: F,
    ) -> Result<&mut Self, Error>
    where
        F: Fn(Context<T>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Entity>, Error>> + Send + 'static,
    {
        let name = format!("collection:{key}");
        self.router.add(name.clone(), template)?;
        self.handlers.custom_collections.insert(
            name,
            Arc::new(move |ctx, values| Box::pin(dispatcher(ctx, values))),
        );
        Ok(self)
    }

    /// Register the NodeInfo dispatcher under `template`, which must carry a
    /// `{version}` variable, e.g. `/nodeinfo/{version}`.
    pub fn set_nodeinfo_dispatcher<F, Fut>(
        &mut self,
        template: &str,
        dispatcher: F,
    ) -> Result<&mut Self, Error>
    where
        F: Fn(Context<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NodeInfo, Error>> + Send + 'static,
    {
        self.router.add("nodeInfo", template)?;
        self.handlers.nodeinfo = Some(Arc::new(move |ctx| Box::pin(dispatcher(ctx))));
        Ok(self)
    }

    /// Install a callback fired for every permanently failed delivery.
    pub fn on_delivery_error(&mut self, handler: DeliveryErrorHandler) -> &mut Self {
        self.handlers.on_delivery_error = Some(handler);
        self
    }

    /// Compile the registrations and `config` into an immutable
    /// [Federation].
    pub fn build(mut self, config: FederationConfig<T>) -> Result<Federation<T>, Error> {
        self.router
            .set_trailing_slash_insensitive(config.trailing_slash_insensitive);
        Ok(Federation(Arc::new(FederationInner {
            config,
            router: self.router,
            handlers: self.handlers,
        })))
    }
}
