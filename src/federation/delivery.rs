//! Background workers for the three-stage delivery pipeline

use crate::{
    entity::Entity,
    error::Error,
    federation::{
        inbox::{idempotence_key, IDEMPOTENCE_TTL},
        Federation,
    },
    keys::{KeyAlgorithm, PrivateKey},
    kv::KvStore,
    lookup::collect_collection,
    queue::{
        CancelSignal,
        FanoutTask,
        InboxTask,
        Message,
        MessageHandler,
        MessageQueue,
        OutboxTask,
        ParallelMessageQueue,
        RecipientsSpec,
        SenderKey,
    },
    signatures::{
        double_knock::{double_knock, DoubleKnockOptions, SpecMemory},
        SignerIdentity,
    },
    FEDERATION_CONTENT_TYPE,
};
use http::{header, HeaderMap, HeaderValue};
use itertools::Itertools;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Pages of a followers collection walked during fan-out.
const FANOUT_PAGE_LIMIT: usize = 50;

impl<T: Clone + Send + Sync + 'static> Federation<T> {
    /// Run the delivery workers until `cancel` fires.
    ///
    /// Listens on the configured queue with the configured parallelism and
    /// processes fanout, outbox and inbox tasks. Resolves once the signal
    /// fires and in-flight handlers finish.
    pub async fn process_queue(&self, cancel: CancelSignal) -> Result<(), Error> {
        let queue = ParallelMessageQueue::new(
            self.0.config.queue.clone(),
            self.0.config.queue_parallelism,
        );
        let federation = self.clone();
        let handler: MessageHandler = Arc::new(move |message| {
            let federation = federation.clone();
            Box::pin(async move {
                let budget = federation.0.config.task_timeout;
                match tokio::time::timeout(budget, federation.handle_message(message.clone()))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("queue task exceeded its {budget:?} budget, re-queueing");
                        federation.requeue_timed_out(message).await
                    }
                }
            })
        });
        queue.listen(handler, cancel).await
    }

    /// Put a timed-out task back on the queue, counting the attempt.
    async fn requeue_timed_out(&self, message: Message) -> Result<(), Error> {
        let policy = self.0.config.retry_policy;
        match message {
            Message::Outbox(task) if task.attempt + 1 < policy.max_attempts => {
                let delay = policy.delay(task.attempt);
                let retried = OutboxTask {
                    attempt: task.attempt + 1,
                    ..task
                };
                self.0
                    .config
                    .queue
                    .enqueue(Message::Outbox(retried), Some(delay))
                    .await
            }
            Message::Inbox(task) if task.attempt + 1 < policy.max_attempts => {
                let delay = policy.delay(task.attempt);
                let retried = InboxTask {
                    attempt: task.attempt + 1,
                    ..task
                };
                self.0
                    .config
                    .queue
                    .enqueue(Message::Inbox(retried), Some(delay))
                    .await
            }
            // Fanout carries no attempt counter; a hung fanout is dropped
            // rather than looped forever.
            _ => Ok(()),
        }
    }

    async fn handle_message(&self, message: Message) -> Result<(), Error> {
        match message {
            Message::Fanout(task) => self.handle_fanout(task).await,
            Message::Outbox(task) => self.handle_outbox(task).await,
            Message::Inbox(task) => self.handle_inbox_task(task).await,
        }
    }

    /// Expand a captured send into per-inbox outbox tasks.
    async fn handle_fanout(&self, task: FanoutTask) -> Result<(), Error> {
        let config = &self.0.config;
        let activity_id = task.activity.get("id").and_then(Value::as_str).map(String::from);

        let raw_targets: Vec<Url> = match &task.recipients {
            RecipientsSpec::Inboxes(urls) => urls.clone(),
            RecipientsSpec::Followers => {
                self.expand_followers(&task.actor_identifier).await?
            }
        };

        // Deduplicate by inbox URL, drop local inboxes, guard the rest.
        let mut inboxes = Vec::new();
        for inbox in raw_targets.into_iter().unique() {
            if config.is_local_url(&inbox) {
                continue;
            }
            if let Err(error) = config.verify_url_valid(&inbox).await {
                debug!("inbox url invalid, skipping: {inbox}: {error}");
                continue;
            }
            inboxes.push(inbox);
        }

        debug!(
            trace = %task.trace,
            "fanout of {} expands to {} inboxes",
            activity_id.as_deref().unwrap_or("activity"),
            inboxes.len(),
        );
        let messages: Vec<Message> = inboxes
            .into_iter()
            .map(|inbox| {
                Message::Outbox(OutboxTask {
                    keys: task.keys.clone(),
                    inbox,
                    activity: task.activity.clone(),
                    activity_id: activity_id.as_deref().and_then(|id| Url::parse(id).ok()),
                    attempt: 0,
                    trace: task.trace,
                })
            })
            .collect();
        config.queue.enqueue_many(messages, None).await
    }

    /// Resolve the followers collection into inbox URLs, preferring the
    /// shared inbox when recipients advertise one. Deduplication happens in
    /// the caller, which collapses identical shared inboxes into a single
    /// delivery.
    async fn expand_followers(&self, identifier: &str) -> Result<Vec<Url>, Error> {
        let ctx = self.context();
        let dispatcher = self
            .0
            .handlers
            .collections
            .get("followers")
            .cloned()
            .ok_or(Error::MissingOption("followers dispatcher"))?;
        let Some(collection) = dispatcher(ctx.clone(), identifier.to_string()).await? else {
            return Ok(Vec::new());
        };

        let loader = ctx.document_loader();
        let members = collect_collection(loader.clone(), &collection, FANOUT_PAGE_LIMIT).await?;

        let mut targets = Vec::new();
        for member in members {
            // An id-only member needs its actor document fetched to find an
            // inbox.
            let member = if member.inbox().is_none() && member.shared_inbox().is_none() {
                match member.id() {
                    Some(id) => match loader.load(&id).await {
                        Ok(document) => Entity::from_json_ld(document.document)?,
                        Err(error) => {
                            debug!("failed to resolve follower {id}: {error}");
                            continue;
                        }
                    },
                    None => continue,
                }
            } else {
                member
            };
            if let Some(shared) = member.shared_inbox() {
                targets.push(shared);
            } else if let Some(inbox) = member.inbox() {
                targets.push(inbox);
            }
        }
        Ok(targets)
    }

    /// Sign and POST one activity to one inbox, with retry classification.
    async fn handle_outbox(&self, task: OutboxTask) -> Result<(), Error> {
        let config = &self.0.config;
        let identity = match signing_identity(&task.keys) {
            Ok(identity) => identity,
            Err(error) => {
                self.surface_delivery_failure(&task, &error);
                return Ok(());
            }
        };

        let body = match serde_json::to_vec(&task.activity) {
            Ok(body) => bytes::Bytes::from(body),
            Err(error) => {
                self.surface_delivery_failure(&task, &Error::Json(error));
                return Ok(());
            }
        };
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(FEDERATION_CONTENT_TYPE),
        );
        if let Ok(user_agent) = HeaderValue::from_str(&config.user_agent) {
            headers.insert(header::USER_AGENT, user_agent);
        }

        let memory = SpecMemory::new(
            config.kv.clone(),
            config.kv_prefixes.http_message_signatures_spec.clone(),
        );
        let options = DoubleKnockOptions {
            first_knock: config.first_knock,
            max_redirects: 5,
            timeout: config.request_timeout,
        };

        let outcome = double_knock(
            &config.client,
            task.inbox.clone(),
            &headers,
            body,
            &identity,
            &memory,
            &options,
        )
        .await;

        match outcome {
            Ok(response) if response.status().is_success() => {
                info!(
                    trace = %task.trace,
                    "delivered {} to {}",
                    task.activity_id.as_ref().map_or("activity", Url::as_str),
                    task.inbox,
                );
                Ok(())
            }
            Ok(response) => {
                let status = response.status().as_u16();
                let transient = matches!(status, 408 | 429) || (500..600).contains(&status);
                if transient {
                    self.retry_delivery(task, &format!("status {status}")).await
                } else {
                    let error = Error::PermanentDelivery(
                        task.inbox.clone(),
                        format!("peer answered status {status}"),
                    );
                    self.surface_delivery_failure(&task, &error);
                    Ok(())
                }
            }
            Err(error) => {
                if is_transient(&error) {
                    self.retry_delivery(task, &error.to_string()).await
                } else {
                    self.surface_delivery_failure(&task, &error);
                    Ok(())
                }
            }
        }
    }

    async fn retry_delivery(&self, task: OutboxTask, reason: &str) -> Result<(), Error> {
        let policy = self.0.config.retry_policy;
        if task.attempt + 1 >= policy.max_attempts {
            let error = Error::PermanentDelivery(
                task.inbox.clone(),
                format!("gave up after {} attempts: {reason}", task.attempt + 1),
            );
            self.surface_delivery_failure(&task, &error);
            return Ok(());
        }
        let delay = policy.delay(task.attempt);
        debug!(
            trace = %task.trace,
            "delivery to {} failed ({reason}), retry {} in {delay:?}",
            task.inbox,
            task.attempt + 1,
        );
        let retried = OutboxTask {
            attempt: task.attempt + 1,
            ..task
        };
        self.0
            .config
            .queue
            .enqueue(Message::Outbox(retried), Some(delay))
            .await
    }

    fn surface_delivery_failure(&self, task: &OutboxTask, error: &Error) {
        warn!(
            trace = %task.trace,
            "dropping delivery to {}: {error}",
            task.inbox,
        );
        if let Some(callback) = &self.0.handlers.on_delivery_error {
            callback(task, error);
        }
    }

    /// Dispatch a received activity to its listener, at most once per
    /// `(recipient, activity)` within the idempotence window.
    async fn handle_inbox_task(&self, task: InboxTask) -> Result<(), Error> {
        let config = &self.0.config;
        let ctx = self.context();
        let activity = Entity::from_json_ld(task.activity.clone())?;
        let Some(activity_id) = activity.id() else {
            debug!("dropping inbox task without an activity id");
            return Ok(());
        };

        let key = idempotence_key(
            &config.kv_prefixes.activity_idempotence,
            task.identifier.as_deref(),
            &activity_id,
        );
        if let Ok(Some(_)) = config.kv.get(&key).await {
            debug!("activity {activity_id} already dispatched to its listeners");
            return Ok(());
        }

        let Some(listener) = activity
            .type_id()
            .and_then(|type_id| self.0.handlers.inbox_listeners.get(type_id.as_str()).cloned())
        else {
            debug!(
                "no inbox listener for activity type {:?}",
                activity.type_name(),
            );
            return Ok(());
        };

        match listener(ctx, activity).await {
            Ok(()) => {
                config
                    .kv
                    .set(&key, json!(true), Some(IDEMPOTENCE_TTL))
                    .await?;
                Ok(())
            }
            Err(error) => {
                let policy = config.retry_policy;
                if task.attempt + 1 >= policy.max_attempts {
                    warn!(
                        "inbox listener for {activity_id} kept failing, dropping: {error}"
                    );
                    return Ok(());
                }
                debug!("inbox listener for {activity_id} failed, retrying: {error}");
                let delay = policy.delay(task.attempt);
                let retried = InboxTask {
                    attempt: task.attempt + 1,
                    ..task
                };
                config
                    .queue
                    .enqueue(Message::Inbox(retried), Some(delay))
                    .await
            }
        }
    }
}

/// Pick the signing identity for a delivery: the draft dialect only speaks
/// RSA, so an RSA key is preferred when the task carries several.
fn signing_identity(keys: &[SenderKey]) -> Result<SignerIdentity, Error> {
    let mut identities = Vec::with_capacity(keys.len());
    for key in keys {
        identities.push(SignerIdentity::new(
            key.key_id.clone(),
            PrivateKey::import_pem(&key.private_key_pem)?,
        )?);
    }
    identities
        .iter()
        .find(|identity| identity.private_key.algorithm() == KeyAlgorithm::RsaSha256)
        .or_else(|| identities.first())
        .cloned()
        .ok_or(Error::MissingOption("delivery task carries no keys"))
}

/// Whether a delivery error is worth retrying. Timeouts, resets and other
/// transport hiccups are; DNS and TLS failures against public hosts are
/// permanent.
fn is_transient(error: &Error) -> bool {
    match error {
        Error::Fetch { source, .. } => {
            let text = format!("{source:#}").to_ascii_lowercase();
            !(text.contains("dns error") || text.contains("certificate"))
        }
        _ => false,
    }
}
