//! Receiving activities: verification, idempotence and handoff to the queue

use crate::{
    entity::{verify_origins_match, Entity},
    error::Error,
    federation::{context::Context, status_response, Federation},
    kv::{KvKey, KvStore},
    queue::{InboxTask, Message, MessageQueue},
    signatures::{draft, key_ring::KeyRing, rfc9421, VerifyOptions},
};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;
use uuid::Uuid;

/// Idempotence records expire after seven days.
pub(crate) const IDEMPOTENCE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Key under which an `(recipient, activity)` dispatch is recorded.
pub(crate) fn idempotence_key(
    prefix: &KvKey,
    identifier: Option<&str>,
    activity_id: &Url,
) -> KvKey {
    prefix
        .join(identifier.unwrap_or("~shared"))
        .join(activity_id.as_str())
}

/// Handle a POST to an inbox route: verify, check idempotence, enqueue, 202.
///
/// Signature and validation failures answer 401 without detail; the peer
/// learns nothing about local state.
pub(crate) async fn receive_inbox<T: Clone + Send + Sync + 'static>(
    federation: &Federation<T>,
    ctx: Context<T>,
    request: &Request<Bytes>,
    url: &Url,
    identifier: Option<String>,
) -> Response<Bytes> {
    let config = &federation.0.config;
    let body: &[u8] = request.body();
    if body.len() > config.inbox_body_limit {
        return status_response(StatusCode::PAYLOAD_TOO_LARGE);
    }

    // Resolve the signing key through the loader, with caching.
    let ring = KeyRing::new(
        ctx.document_loader(),
        config.kv.clone(),
        config.kv_prefixes.public_key.clone(),
    );
    let options = VerifyOptions {
        current_time: None,
        time_window: config.signature_time_window,
    };
    let headers = request.headers();
    let method = request.method();

    let mut verified = None;
    if headers.contains_key("signature-input") {
        verified =
            rfc9421::verify_request(headers, method, url, Some(body), &ring, &options).await;
    }
    if verified.is_none() && headers.contains_key("signature") {
        verified = draft::verify_request(headers, method, url, Some(body), &ring, &options).await;
    }
    let Some(key) = verified else {
        debug!("inbox POST to {url} had no valid signature");
        return status_response(StatusCode::UNAUTHORIZED);
    };

    let activity = match serde_json::from_slice(body).map_err(Error::Json) {
        Ok(document) => match Entity::from_json_ld(document) {
            Ok(entity) => entity,
            Err(_) => return status_response(StatusCode::BAD_REQUEST),
        },
        Err(_) => return status_response(StatusCode::BAD_REQUEST),
    };
    let (Some(activity_id), Some(actor)) = (activity.id(), activity.actor()) else {
        return status_response(StatusCode::BAD_REQUEST);
    };

    // The activity must come from the origin it claims, the signing key
    // must belong to that origin, and local activities do not arrive from
    // outside.
    if verify_origins_match(&activity_id, &actor).is_err() {
        debug!("activity {activity_id} and actor {actor} have different origins");
        return status_response(StatusCode::UNAUTHORIZED);
    }
    if let Some(owner) = &key.owner {
        if verify_origins_match(owner, &actor).is_err() {
            debug!("signing key owner {owner} does not match actor {actor}");
            return status_response(StatusCode::UNAUTHORIZED);
        }
    }
    if config.is_local_url(&activity_id) {
        debug!("refusing activity {activity_id} claiming to originate locally");
        return status_response(StatusCode::UNAUTHORIZED);
    }
    if config.verify_url_valid(&activity_id).await.is_err() {
        return status_response(StatusCode::UNAUTHORIZED);
    }

    // Already dispatched within the idempotence window: acknowledge without
    // queueing again.
    let key = idempotence_key(
        &config.kv_prefixes.activity_idempotence,
        identifier.as_deref(),
        &activity_id,
    );
    if let Ok(Some(_)) = config.kv.get(&key).await {
        debug!("activity {activity_id} already handled, acknowledging");
        return status_response(StatusCode::ACCEPTED);
    }

    let task = InboxTask {
        identifier,
        activity: activity.into_json_ld(),
        attempt: 0,
        trace: Uuid::new_v4(),
    };
    if let Err(error) = config.queue.enqueue(Message::Inbox(task), None).await {
        debug!("failed to enqueue inbox task for {activity_id}: {error}");
        return status_response(StatusCode::INTERNAL_SERVER_ERROR);
    }
    status_response(StatusCode::ACCEPTED)
}
