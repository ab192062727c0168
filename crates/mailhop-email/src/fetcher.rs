use crate::{Poller, PushWatcher};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The per-account fetch strategy.
pub enum Fetcher {
    Poll(Poller),
    Push(PushWatcher),
}

impl Fetcher {
    pub fn account_id(&self) -> Uuid {
        match self {
            Self::Poll(poller) => poller.account_id(),
            Self::Push(watcher) => watcher.account_id(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Poll(_) => "poll",
            Self::Push(_) => "push",
        }
    }

    pub fn as_push(&self) -> Option<&PushWatcher> {
        match self {
            Self::Push(watcher) => Some(watcher),
            Self::Poll(_) => None,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        match self {
            Self::Poll(poller) => poller.run(cancel).await,
            Self::Push(watcher) => watcher.run(cancel).await,
        }
    }
}
