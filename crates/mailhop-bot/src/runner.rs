use crate::BotHandler;
use mailhop_notify::TelegramClient;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Long-polls the Bot API and feeds updates to a [`BotHandler`] one at a
/// time, in arrival order.
pub struct BotRunner {
    client: TelegramClient,
    handler: Arc<BotHandler>,
    poll_timeout: Duration,
}

impl BotRunner {
    pub fn new(client: TelegramClient, handler: Arc<BotHandler>, poll_timeout: Duration) -> Self {
        Self {
            client,
            handler,
            poll_timeout,
        }
    }

    /// Runs until `cancel` fires. An in-flight long poll is abandoned on
    /// cancellation; an update being handled is finished first.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("chat bot started");
        let mut offset = 0_i64;

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.client.get_updates(offset, self.poll_timeout) => polled,
            };

            match polled {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        if let Err(err) = self.handler.handle_update(&update).await {
                            tracing::error!(update_id = update.update_id, "update handling failed: {err}");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!("getUpdates failed: {err}");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        tracing::info!("chat bot stopped");
    }
}
