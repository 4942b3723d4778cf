//! Resolving identifiers to vocabulary objects and walking collections

use crate::{
    document_loader::DocumentLoader,
    entity::Entity,
    error::Error,
    webfinger::{lookup_webfinger, WebFingerOptions},
};
use futures::{Stream, StreamExt};
use reqwest_middleware::ClientWithMiddleware;
use serde_json::Value;
use std::{collections::VecDeque, sync::Arc};
use tracing::debug;
use url::Url;

/// Resolve `identifier` to an entity.
///
/// Accepts a URL, an `acct:` URI or a bare `user@host` handle. Handles go
/// through WebFinger first; every `application/*` link is tried in order
/// until one dereferences.
pub async fn lookup_object(
    client: &ClientWithMiddleware,
    loader: &Arc<dyn DocumentLoader>,
    identifier: &str,
    webfinger_options: &WebFingerOptions,
) -> Result<Entity, Error> {
    if identifier.starts_with("http://") || identifier.starts_with("https://") {
        let url = Url::parse(identifier).map_err(Error::UrlParse)?;
        let document = loader.load(&url).await?;
        return Entity::from_json_ld(document.document);
    }

    let jrd = lookup_webfinger(client, identifier, webfinger_options)
        .await?
        .ok_or(Error::WebfingerResolveFailed)?;
    let candidates: Vec<Url> = jrd
        .links
        .iter()
        .filter(|link| {
            link.kind
                .as_deref()
                .is_some_and(|kind| kind.starts_with("application/"))
        })
        .filter_map(|link| link.href.clone())
        .collect();

    for candidate in candidates {
        match loader.load(&candidate).await {
            Ok(document) => return Entity::from_json_ld(document.document),
            Err(error) => debug!("failed to dereference webfinger link {candidate}: {error}"),
        }
    }
    Err(Error::WebfingerResolveFailed)
}

struct TraversalState {
    loader: Arc<dyn DocumentLoader>,
    items: VecDeque<Value>,
    next: Option<Url>,
    pages_left: usize,
}

/// Lazily iterate the items of a possibly paginated collection.
///
/// Embedded items are yielded first; further pages are fetched on demand
/// through `first`/`next` links, up to `max_pages`. Bare URL items are
/// yielded as id-only entities for the caller to dereference when needed.
pub fn traverse_collection(
    loader: Arc<dyn DocumentLoader>,
    collection: &Entity,
    max_pages: usize,
) -> impl Stream<Item = Result<Entity, Error>> {
    let state = TraversalState {
        loader,
        items: collection.items().into(),
        next: collection.first().or_else(|| collection.next()),
        pages_left: max_pages,
    };
    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.items.pop_front() {
                let entity = match item {
                    Value::String(url) => {
                        Entity::from_json_ld(serde_json::json!({ "id": url }))
                    }
                    other => Entity::from_json_ld(other),
                };
                return Some((entity, state));
            }
            let next = state.next.take()?;
            if state.pages_left == 0 {
                return None;
            }
            state.pages_left -= 1;
            match state.loader.load(&next).await {
                Ok(document) => match Entity::from_json_ld(document.document) {
                    Ok(page) => {
                        state.items = page.items().into();
                        state.next = page.next();
                    }
                    Err(error) => return Some((Err(error), state)),
                },
                Err(error) => return Some((Err(error), state)),
            }
        }
    })
}

/// Collect a whole collection into memory. Convenience over
/// [traverse_collection] for bounded collections such as follower lists.
pub async fn collect_collection(
    loader: Arc<dyn DocumentLoader>,
    collection: &Entity,
    max_pages: usize,
) -> Result<Vec<Entity>, Error> {
    let stream = traverse_collection(loader, collection, max_pages);
    futures::pin_mut!(stream);
    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        items.push(item?);
    }
    Ok(items)
}
