mod error;
mod handler;
mod link;
mod runner;
mod session;

pub use error::BotError;
pub use handler::{BotHandler, BotSettings, CallbackAction, Command, FetcherControl};
pub use link::{advance, imap_account, smtp_port_for, LinkAdvance, LinkDetails};
pub use runner::BotRunner;
pub use session::{
    link_session_key, reply_session_key, LinkSession, LinkStep, SessionStore, StoredLink,
};
