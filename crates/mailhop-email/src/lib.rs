mod connector;
mod error;
mod fetcher;
mod gmail;
mod imap_source;
mod ingest;
mod manager;
mod normalizer;
mod poller;
mod pubsub;
mod push;
mod reply;
mod sanitizer;
mod source;

pub use connector::{MailboxConnector, ProviderConnector};
pub use error::EmailError;
pub use fetcher::Fetcher;
pub use gmail::{GmailMailbox, GmailSettings, GMAIL_API_BASE};
pub use imap_source::ImapSource;
pub use ingest::{IngestOutcome, IngestSummary, Ingestor};
pub use manager::{FetchManager, FetchSettings};
pub use normalizer::{message_id_from_raw, CanonicalMessage, Normalizer};
pub use poller::Poller;
pub use pubsub::{parse_push_payload, PubSubListener, PushNotification, PUBSUB_API_BASE};
pub use push::PushWatcher;
pub use reply::{OutgoingReply, ReplySender, SmtpReplySender};
pub use sanitizer::HtmlSanitizer;
pub use source::{
    HistoryRecord, MessageOrigin, PushMailbox, RawMessage, UnseenSource, WatchRegistration,
};
