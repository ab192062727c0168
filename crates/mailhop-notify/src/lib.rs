mod consumer;
mod error;
mod formatter;
mod telegram;

pub use consumer::{summary_cache_key, NotificationConsumer};
pub use error::NotifyError;
pub use formatter::{strip_html, NotificationFormatter, PREVIEW_CHARS};
pub use telegram::{
    CallbackQuery, Chat, ChatMessage, ChatSender, IncomingMessage, InlineButton, InlineKeyboard,
    TelegramClient, TelegramUser, Update,
};
