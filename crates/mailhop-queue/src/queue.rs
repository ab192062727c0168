use crate::QueueError;
use async_trait::async_trait;
use mailhop_core::QueueEvent;
use mailhop_storage::KvStore;
use std::fmt::Display;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const POP_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Named durable FIFO of [`QueueEvent`]s.
///
/// Popping removes the event before anyone handles it; there is no
/// acknowledgement and no redelivery.
#[derive(Clone)]
pub struct EventQueue {
    kv: KvStore,
    list_key: String,
}

impl EventQueue {
    pub fn new(kv: KvStore, list_key: impl Into<String>) -> Self {
        Self {
            kv,
            list_key: list_key.into(),
        }
    }

    pub fn list_key(&self) -> &str {
        &self.list_key
    }

    pub async fn publish(&self, event: &QueueEvent) -> Result<(), QueueError> {
        let payload = serde_json::to_string(event)?;
        self.kv.push_back(&self.list_key, &payload).await?;
        tracing::debug!(email_id = %event.email_id, queue = %self.list_key, "published event");
        Ok(())
    }

    /// Waits up to `timeout` for the next event. A payload that does not
    /// decode is still removed from the list and reported as
    /// [`QueueError::InvalidPayload`].
    pub async fn consume(&self, timeout: Duration) -> Result<Option<QueueEvent>, QueueError> {
        let Some(payload) = self.kv.pop_front(&self.list_key, timeout).await? else {
            return Ok(None);
        };

        serde_json::from_str(&payload)
            .map(Some)
            .map_err(|source| QueueError::InvalidPayload { payload, source })
    }

    pub async fn len(&self) -> Result<u64, QueueError> {
        Ok(self.kv.list_len(&self.list_key).await?)
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    type Error: Display + Send;

    async fn handle(&self, event: QueueEvent) -> Result<(), Self::Error>;
}

/// Single worker draining an [`EventQueue`] into one handler, one event at a
/// time.
pub struct QueueConsumer<H> {
    queue: EventQueue,
    handler: H,
    pop_timeout: Duration,
}

impl<H: EventHandler> QueueConsumer<H> {
    pub fn new(queue: EventQueue, handler: H, pop_timeout: Duration) -> Self {
        Self {
            queue,
            handler,
            pop_timeout,
        }
    }

    /// Runs until `cancel` fires. Cancellation is checked between pops, so
    /// shutdown waits for at most one pop timeout plus one handler call.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(queue = %self.queue.list_key(), "queue consumer started");

        while !cancel.is_cancelled() {
            match self.queue.consume(self.pop_timeout).await {
                Ok(Some(event)) => {
                    if let Err(err) = self.handler.handle(event).await {
                        tracing::error!(
                            email_id = %event.email_id,
                            account_id = %event.account_id,
                            "dropping event after handler failure: {err}"
                        );
                    }
                }
                Ok(None) => {}
                Err(QueueError::InvalidPayload { payload, source }) => {
                    tracing::error!(payload = %payload, "skipping undecodable event: {source}");
                }
                Err(err) => {
                    tracing::warn!("queue pop failed: {err}");
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(POP_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        tracing::info!(queue = %self.queue.list_key(), "queue consumer stopped");
    }
}
