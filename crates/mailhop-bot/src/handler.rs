use crate::link::{advance, imap_account, LinkAdvance, LinkDetails, LINK_START_PROMPT, SESSION_EXPIRED};
use crate::{BotError, LinkSession, SessionStore, StoredLink};
use async_trait::async_trait;
use chrono::Utc;
use mailhop_core::{Account, MailMessage, SentReply, User, ViewToken};
use mailhop_email::{FetchManager, OutgoingReply, ReplySender};
use mailhop_notify::{
    CallbackQuery, ChatMessage, ChatSender, IncomingMessage, InlineButton, InlineKeyboard,
    TelegramUser, Update,
};
use mailhop_security::CredentialCipher;
use mailhop_storage::Storage;
use std::fmt::Write;
use std::sync::Arc;
use uuid::Uuid;

const WELCOME: &str = "Welcome to mailhop!

This bot forwards your emails to this chat and lets you reply directly.

Commands:
/link - Link an email account
/accounts - List your linked accounts
/unlink - Unlink an email account
/cancel - Abort linking or replying
/help - Show this help message

Get started by linking an email account with /link";

const HELP: &str = "mailhop commands:

/start - Show welcome message
/link - Link an email account over IMAP
/accounts - List all linked email accounts
/unlink - Remove an email account
/cancel - Abort linking or replying

When you receive an email, you'll get a notification with:
• Subject and sender
• A summary or preview of the content
• Buttons to view the full email, reply or mark it read

To reply to an email, press [Reply] and send your message.";

const FALLBACK: &str = "I don't understand. Use /help to see available commands.";
const SAVE_FAILED: &str = "Failed to save account. Please try again.";

/// Lets the chat front end start and stop fetchers when it shares a process
/// with the fetch manager.
#[async_trait]
pub trait FetcherControl: Send + Sync {
    async fn account_linked(&self, account_id: Uuid);

    async fn account_unlinked(&self, account_id: Uuid);
}

#[async_trait]
impl FetcherControl for FetchManager {
    async fn account_linked(&self, account_id: Uuid) {
        if let Err(err) = self.start_fetcher_for_account(account_id).await {
            tracing::warn!(account_id = %account_id, "could not start fetcher for linked account: {err}");
        }
    }

    async fn account_unlinked(&self, account_id: Uuid) {
        self.stop_fetcher_for_account(account_id).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Link,
    Accounts,
    Unlink,
    Cancel,
}

impl Command {
    /// Recognizes `/name` and `/name@botname`, ignoring arguments.
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.split_whitespace().next()?.strip_prefix('/')?;
        let name = word.split('@').next().unwrap_or(word);
        match name.to_ascii_lowercase().as_str() {
            "start" => Some(Self::Start),
            "help" => Some(Self::Help),
            "link" => Some(Self::Link),
            "accounts" => Some(Self::Accounts),
            "unlink" => Some(Self::Unlink),
            "cancel" => Some(Self::Cancel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Cancel,
    LinkGmail,
    LinkImap,
    Unlink(Uuid),
    View(Uuid),
    Reply(Uuid),
    MarkRead(Uuid),
}

impl CallbackAction {
    pub fn parse(data: &str) -> Option<Self> {
        let id = |rest: &str| Uuid::parse_str(rest).ok();
        match data {
            "cancel" => Some(Self::Cancel),
            "link_gmail" => Some(Self::LinkGmail),
            "link_imap" => Some(Self::LinkImap),
            _ => {
                if let Some(rest) = data.strip_prefix("unlink_") {
                    id(rest).map(Self::Unlink)
                } else if let Some(rest) = data.strip_prefix("view_") {
                    id(rest).map(Self::View)
                } else if let Some(rest) = data.strip_prefix("reply_") {
                    id(rest).map(Self::Reply)
                } else if let Some(rest) = data.strip_prefix("mark_read_") {
                    id(rest).map(Self::MarkRead)
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BotSettings {
    pub web_base_url: String,
    pub view_token_ttl: chrono::Duration,
}

/// Routes chat updates: commands, button presses, and free text feeding the
/// link and reply sessions.
pub struct BotHandler {
    storage: Storage,
    sessions: SessionStore,
    chat: Arc<dyn ChatSender>,
    replies: Arc<dyn ReplySender>,
    cipher: CredentialCipher,
    settings: BotSettings,
    fetchers: Option<Arc<dyn FetcherControl>>,
}

impl BotHandler {
    pub fn new(
        storage: Storage,
        sessions: SessionStore,
        chat: Arc<dyn ChatSender>,
        replies: Arc<dyn ReplySender>,
        cipher: CredentialCipher,
        settings: BotSettings,
    ) -> Self {
        Self {
            storage,
            sessions,
            chat,
            replies,
            cipher,
            settings,
            fetchers: None,
        }
    }

    pub fn with_fetcher_control(mut self, fetchers: Arc<dyn FetcherControl>) -> Self {
        self.fetchers = Some(fetchers);
        self
    }

    pub async fn handle_update(&self, update: &Update) -> Result<(), BotError> {
        if let Some(callback) = &update.callback_query {
            return self.handle_callback(callback).await;
        }
        if let Some(message) = &update.message {
            return self.handle_message(message).await;
        }
        Ok(())
    }

    async fn register(&self, chat_id: i64, from: &TelegramUser) -> Result<User, BotError> {
        Ok(self
            .storage
            .get_or_create_user(
                chat_id,
                from.username.as_deref(),
                from.first_name.as_deref(),
                from.last_name.as_deref(),
            )
            .await?)
    }

    async fn say(&self, chat_id: i64, text: impl Into<String>) -> Result<(), BotError> {
        self.chat
            .send_message(chat_id, &ChatMessage::plain(text))
            .await?;
        Ok(())
    }

    /// Replaces the text of the message that carried the pressed button, or
    /// sends a new one when that message is unknown.
    async fn edit_or_say(
        &self,
        chat_id: i64,
        origin: Option<i64>,
        message: ChatMessage,
    ) -> Result<(), BotError> {
        match origin {
            Some(message_id) => self.chat.edit_message(chat_id, message_id, &message).await?,
            None => self.chat.send_message(chat_id, &message).await?,
        }
        Ok(())
    }

    async fn handle_message(&self, message: &IncomingMessage) -> Result<(), BotError> {
        let Some(from) = &message.from else {
            return Ok(());
        };
        let Some(text) = message.text.as_deref().filter(|text| !text.trim().is_empty()) else {
            return Ok(());
        };

        let user = self.register(message.chat.id, from).await?;
        tracing::debug!(chat_id = user.chat_id, user_id = %user.id, "received message");

        match Command::parse(text) {
            Some(command) => self.handle_command(&user, command).await,
            None => self.handle_text(&user, text).await,
        }
    }

    async fn handle_command(&self, user: &User, command: Command) -> Result<(), BotError> {
        let chat_id = user.chat_id;
        match command {
            Command::Start => self.say(chat_id, WELCOME).await,
            Command::Help => self.say(chat_id, HELP).await,
            Command::Link => {
                let keyboard = InlineKeyboard::default()
                    .row(vec![InlineButton::callback("Gmail (OAuth2)", "link_gmail")])
                    .row(vec![InlineButton::callback("IMAP (QQmail, etc.)", "link_imap")])
                    .row(vec![InlineButton::callback("Cancel", "cancel")]);
                self.chat
                    .send_message(
                        chat_id,
                        &ChatMessage::plain("Choose how to link your email account:")
                            .with_keyboard(keyboard),
                    )
                    .await?;
                Ok(())
            }
            Command::Accounts => {
                let accounts = self.storage.list_accounts_for_user(user.id).await?;
                self.say(chat_id, render_accounts(&accounts)).await
            }
            Command::Unlink => {
                let accounts = self.storage.list_accounts_for_user(user.id).await?;
                if accounts.is_empty() {
                    return self
                        .say(chat_id, "You don't have any linked email accounts.")
                        .await;
                }

                let mut keyboard = InlineKeyboard::default();
                for account in &accounts {
                    keyboard = keyboard.row(vec![InlineButton::callback(
                        format!("{} ({})", account.email_address, account.provider),
                        format!("unlink_{}", account.id),
                    )]);
                }
                keyboard = keyboard.row(vec![InlineButton::callback("Cancel", "cancel")]);

                self.chat
                    .send_message(
                        chat_id,
                        &ChatMessage::plain("Select an account to unlink:").with_keyboard(keyboard),
                    )
                    .await?;
                Ok(())
            }
            Command::Cancel => {
                let link = self.sessions.clear_link(chat_id).await?;
                let reply = self.sessions.clear_reply(chat_id).await?;
                if link || reply {
                    self.say(chat_id, "Cancelled.").await
                } else {
                    self.say(chat_id, "Nothing to cancel.").await
                }
            }
        }
    }

    /// Free text answers the link session first, then the reply session.
    async fn handle_text(&self, user: &User, text: &str) -> Result<(), BotError> {
        match self.sessions.link(user.chat_id).await? {
            Some(StoredLink::Active(session)) => {
                return self.continue_link(user, &session, text).await;
            }
            Some(StoredLink::Invalid) => return self.say(user.chat_id, SESSION_EXPIRED).await,
            None => {}
        }
        if let Some(email_id) = self.sessions.reply_target(user.chat_id).await? {
            return self.send_reply(user, email_id, text).await;
        }
        self.say(user.chat_id, FALLBACK).await
    }

    async fn continue_link(
        &self,
        user: &User,
        session: &LinkSession,
        text: &str,
    ) -> Result<(), BotError> {
        let chat_id = user.chat_id;
        match advance(session, text) {
            LinkAdvance::Next { session, prompt } => {
                if self.sessions.save_link(chat_id, &session).await? {
                    self.say(chat_id, prompt).await
                } else {
                    self.say(chat_id, SESSION_EXPIRED).await
                }
            }
            LinkAdvance::Rejected { prompt } => self.say(chat_id, prompt).await,
            LinkAdvance::Incomplete => {
                self.sessions.clear_link(chat_id).await?;
                self.say(chat_id, SESSION_EXPIRED).await
            }
            LinkAdvance::Complete(details) => self.complete_link(user, &details).await,
        }
    }

    async fn complete_link(&self, user: &User, details: &LinkDetails) -> Result<(), BotError> {
        let chat_id = user.chat_id;
        let password = match self.cipher.encrypt(&details.password) {
            Ok(password) => password,
            Err(err) => {
                tracing::error!(user_id = %user.id, "failed to encrypt password: {err}");
                return self.say(chat_id, SAVE_FAILED).await;
            }
        };

        let account = imap_account(user.id, details, password);
        if let Err(err) = self.storage.create_account(&account).await {
            tracing::error!(user_id = %user.id, "failed to create account: {err}");
            return self.say(chat_id, SAVE_FAILED).await;
        }

        self.sessions.clear_link(chat_id).await?;
        tracing::info!(
            account_id = %account.id,
            email = %account.email_address,
            "linked imap account"
        );

        if let Some(fetchers) = &self.fetchers {
            fetchers.account_linked(account.id).await;
        }

        self.say(
            chat_id,
            format!(
                "Successfully linked {}!\n\nYou'll start receiving email notifications shortly.",
                account.email_address
            ),
        )
        .await
    }

    /// A stored message together with its account, when that account
    /// belongs to `user`.
    async fn owned_message(
        &self,
        user: &User,
        email_id: Uuid,
    ) -> Result<Option<(MailMessage, Account)>, BotError> {
        let Some(message) = self.storage.get_message(email_id).await? else {
            return Ok(None);
        };
        let Some(account) = self.storage.get_account(message.account_id).await? else {
            return Ok(None);
        };
        if account.user_id != user.id {
            tracing::warn!(user_id = %user.id, email_id = %email_id, "message belongs to another user");
            return Ok(None);
        }
        Ok(Some((message, account)))
    }

    async fn send_reply(&self, user: &User, email_id: Uuid, body: &str) -> Result<(), BotError> {
        let chat_id = user.chat_id;
        let Some((original, account)) = self.owned_message(user, email_id).await? else {
            self.sessions.clear_reply(chat_id).await?;
            return self
                .say(chat_id, "Original email not found. Reply cancelled.")
                .await;
        };

        let reply = OutgoingReply::to_message(&account, &original, body);
        let outcome = self.replies.send_reply(&account, &reply).await;

        let record = SentReply {
            id: Uuid::new_v4(),
            user_id: user.id,
            original_email_id: Some(original.id),
            account_id: account.id,
            to_address: reply.to.address.clone(),
            subject: reply.subject.clone(),
            body: reply.body.clone(),
            error: outcome.as_ref().err().map(ToString::to_string),
            sent_at: Utc::now(),
        };
        if let Err(err) = self.storage.create_sent_reply(&record).await {
            tracing::warn!(user_id = %user.id, email_id = %email_id, "failed to record reply: {err}");
        }
        self.sessions.clear_reply(chat_id).await?;

        match outcome {
            Ok(()) => {
                tracing::info!(
                    user_id = %user.id,
                    email_id = %email_id,
                    to = %reply.to.address,
                    "sent email reply"
                );
                self.say(chat_id, "Reply sent successfully!").await
            }
            Err(err) => {
                tracing::error!(user_id = %user.id, email_id = %email_id, "failed to send reply: {err}");
                self.say(chat_id, format!("Failed to send reply: {err}")).await
            }
        }
    }

    async fn handle_callback(&self, callback: &CallbackQuery) -> Result<(), BotError> {
        let chat_id = callback
            .message
            .as_ref()
            .map(|message| message.chat.id)
            .unwrap_or(callback.from.id);
        let origin = callback.message.as_ref().map(|message| message.message_id);
        let user = self.register(chat_id, &callback.from).await?;
        let data = callback.data.as_deref().unwrap_or_default();
        tracing::debug!(chat_id, user_id = %user.id, data, "received callback");

        let Some(action) = CallbackAction::parse(data) else {
            self.chat
                .answer_callback(&callback.id, Some("Unknown action"), false)
                .await?;
            return Ok(());
        };

        let (answer, alert): (Option<String>, bool) = match action {
            CallbackAction::Cancel => {
                self.sessions.clear_link(chat_id).await?;
                self.sessions.clear_reply(chat_id).await?;
                self.edit_or_say(chat_id, origin, ChatMessage::plain("Cancelled."))
                    .await?;
                (None, false)
            }
            CallbackAction::LinkGmail => {
                self.edit_or_say(
                    chat_id,
                    origin,
                    ChatMessage::plain(
                        "Gmail OAuth2 linking is not available from the chat.\n\nFor now, please use IMAP linking.",
                    ),
                )
                .await?;
                (None, false)
            }
            CallbackAction::LinkImap => {
                self.sessions.start_link(chat_id).await?;
                self.edit_or_say(chat_id, origin, ChatMessage::plain(LINK_START_PROMPT))
                    .await?;
                (None, false)
            }
            CallbackAction::Unlink(account_id) => {
                let text = self.unlink(&user, account_id).await?;
                self.edit_or_say(chat_id, origin, ChatMessage::plain(text))
                    .await?;
                (None, false)
            }
            CallbackAction::View(email_id) => self.view_link(&user, email_id).await?,
            CallbackAction::Reply(email_id) => {
                if self.owned_message(&user, email_id).await?.is_some() {
                    self.sessions.start_reply(chat_id, email_id).await?;
                    (
                        Some("Reply mode activated. Send your reply message.".to_string()),
                        true,
                    )
                } else {
                    (Some("Email not found".to_string()), false)
                }
            }
            CallbackAction::MarkRead(email_id) => {
                if self.owned_message(&user, email_id).await?.is_some()
                    && self.storage.mark_message_read(email_id).await?
                {
                    (Some("Marked as read".to_string()), false)
                } else {
                    (Some("Email not found".to_string()), false)
                }
            }
        };

        self.chat
            .answer_callback(&callback.id, answer.as_deref(), alert)
            .await?;
        Ok(())
    }

    async fn unlink(&self, user: &User, account_id: Uuid) -> Result<String, BotError> {
        let account = self
            .storage
            .get_account(account_id)
            .await?
            .filter(|account| account.user_id == user.id);
        let Some(account) = account else {
            return Ok("Account not found.".to_string());
        };

        if let Some(fetchers) = &self.fetchers {
            fetchers.account_unlinked(account.id).await;
        }

        match self.storage.delete_account(account.id).await {
            Ok(_) => {
                tracing::info!(
                    account_id = %account.id,
                    email = %account.email_address,
                    "unlinked email account"
                );
                Ok(format!("Successfully unlinked {}", account.email_address))
            }
            Err(err) => {
                tracing::error!(account_id = %account.id, "failed to delete account: {err}");
                Ok("Failed to unlink account. Please try again.".to_string())
            }
        }
    }

    /// Issues a view token and answers with the browser link.
    async fn view_link(&self, user: &User, email_id: Uuid) -> Result<(Option<String>, bool), BotError> {
        if self.owned_message(user, email_id).await?.is_none() {
            return Ok((Some("Email not found".to_string()), false));
        }

        let now = Utc::now();
        let token = ViewToken {
            id: Uuid::new_v4(),
            email_id,
            token: Uuid::new_v4().simple().to_string(),
            expires_at: now + self.settings.view_token_ttl,
            view_count: 0,
            created_at: now,
        };

        if let Err(err) = self.storage.create_view_token(&token).await {
            tracing::error!(email_id = %email_id, "failed to create view token: {err}");
            return Ok((Some("Failed to generate link".to_string()), false));
        }

        let url = format!(
            "{}/email/{}",
            self.settings.web_base_url.trim_end_matches('/'),
            token.token
        );
        Ok((Some(format!("View email: {url}")), true))
    }
}

fn render_accounts(accounts: &[Account]) -> String {
    if accounts.is_empty() {
        return "You don't have any linked email accounts.\n\nUse /link to add one.".to_string();
    }

    let mut text = String::from("Your linked email accounts:\n\n");
    for (index, account) in accounts.iter().enumerate() {
        let status = if account.is_active { "Active" } else { "Inactive" };
        let _ = writeln!(
            text,
            "{}. {} ({}) - {status}",
            index + 1,
            account.email_address,
            account.provider
        );
        if let Some(at) = account.last_fetch_at {
            let _ = writeln!(text, "   Last fetched: {}", at.format("%Y-%m-%d %H:%M:%S"));
        }
        if let Some(error) = account.last_error.as_deref().filter(|error| !error.is_empty()) {
            let _ = writeln!(text, "   Error: {error}");
        }
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::{render_accounts, BotHandler, BotSettings, CallbackAction, Command, FetcherControl};
    use crate::SessionStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use mailhop_core::{Account, MailAddress, MailMessage, Provider, SummaryFields, User};
    use mailhop_email::{EmailError, OutgoingReply, ReplySender};
    use mailhop_notify::{ChatMessage, ChatSender, NotifyError, Update};
    use mailhop_security::CredentialCipher;
    use mailhop_storage::{KvStore, Storage};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use uuid::Uuid;

    const CHAT: i64 = 4242;

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Message(i64, ChatMessage),
        Edit(i64, i64, String),
        Answer(String, Option<String>, bool),
    }

    #[derive(Default)]
    struct RecordingChat {
        sent: Mutex<Vec<Sent>>,
    }

    impl RecordingChat {
        fn take(&self) -> Vec<Sent> {
            std::mem::take(&mut *self.sent.lock().expect("sent lock"))
        }

        fn last_text(&self) -> String {
            match self.sent.lock().expect("sent lock").last() {
                Some(Sent::Message(_, message)) => message.text.clone(),
                Some(Sent::Edit(_, _, text)) => text.clone(),
                Some(Sent::Answer(_, text, _)) => text.clone().unwrap_or_default(),
                None => String::new(),
            }
        }
    }

    #[async_trait]
    impl ChatSender for RecordingChat {
        async fn send_message(&self, chat_id: i64, message: &ChatMessage) -> Result<(), NotifyError> {
            self.sent
                .lock()
                .expect("sent lock")
                .push(Sent::Message(chat_id, message.clone()));
            Ok(())
        }

        async fn edit_message(
            &self,
            chat_id: i64,
            message_id: i64,
            message: &ChatMessage,
        ) -> Result<(), NotifyError> {
            self.sent
                .lock()
                .expect("sent lock")
                .push(Sent::Edit(chat_id, message_id, message.text.clone()));
            Ok(())
        }

        async fn answer_callback(
            &self,
            callback_id: &str,
            text: Option<&str>,
            show_alert: bool,
        ) -> Result<(), NotifyError> {
            self.sent.lock().expect("sent lock").push(Sent::Answer(
                callback_id.to_string(),
                text.map(str::to_string),
                show_alert,
            ));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeReplies {
        sent: Mutex<Vec<OutgoingReply>>,
        fail: bool,
    }

    #[async_trait]
    impl ReplySender for FakeReplies {
        async fn send_reply(&self, _account: &Account, reply: &OutgoingReply) -> Result<(), EmailError> {
            if self.fail {
                return Err(EmailError::Smtp("connection refused".to_string()));
            }
            self.sent.lock().expect("replies lock").push(reply.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFetchers {
        linked: Mutex<Vec<Uuid>>,
        unlinked: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl FetcherControl for FakeFetchers {
        async fn account_linked(&self, account_id: Uuid) {
            self.linked.lock().expect("linked lock").push(account_id);
        }

        async fn account_unlinked(&self, account_id: Uuid) {
            self.unlinked.lock().expect("unlinked lock").push(account_id);
        }
    }

    struct Fixture {
        storage: Storage,
        kv: KvStore,
        chat: Arc<RecordingChat>,
        replies: Arc<FakeReplies>,
        fetchers: Arc<FakeFetchers>,
        cipher: CredentialCipher,
        handler: BotHandler,
    }

    async fn fixture_with(link_ttl: Duration, failing_replies: bool) -> Fixture {
        let storage = Storage::in_memory().await.expect("storage");
        let kv = KvStore::new(storage.pool().clone());
        let chat = Arc::new(RecordingChat::default());
        let replies = Arc::new(FakeReplies {
            fail: failing_replies,
            ..FakeReplies::default()
        });
        let fetchers = Arc::new(FakeFetchers::default());
        let cipher = CredentialCipher::from_key_bytes(&[7u8; 32]).expect("cipher");

        let handler = BotHandler::new(
            storage.clone(),
            SessionStore::new(kv.clone(), link_ttl, Duration::from_secs(600)),
            chat.clone(),
            replies.clone(),
            cipher.clone(),
            BotSettings {
                web_base_url: "https://mail.example/".to_string(),
                view_token_ttl: chrono::Duration::hours(24),
            },
        )
        .with_fetcher_control(fetchers.clone());

        Fixture {
            storage,
            kv,
            chat,
            replies,
            fetchers,
            cipher,
            handler,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(Duration::from_secs(600), false).await
    }

    fn text_update(chat_id: i64, text: &str) -> Update {
        serde_json::from_value(json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "chat": {"id": chat_id},
                "from": {"id": chat_id, "is_bot": false, "first_name": "Ann", "username": "ann"},
                "text": text
            }
        }))
        .expect("text update")
    }

    fn callback_update(chat_id: i64, data: &str) -> Update {
        serde_json::from_value(json!({
            "update_id": 2,
            "callback_query": {
                "id": "cb-1",
                "from": {"id": chat_id, "is_bot": false},
                "message": {"message_id": 77, "chat": {"id": chat_id}},
                "data": data
            }
        }))
        .expect("callback update")
    }

    async fn say(fixture: &Fixture, text: &str) -> String {
        fixture
            .handler
            .handle_update(&text_update(CHAT, text))
            .await
            .expect("handle text");
        fixture.chat.last_text()
    }

    async fn press(fixture: &Fixture, chat_id: i64, data: &str) -> Vec<Sent> {
        fixture
            .handler
            .handle_update(&callback_update(chat_id, data))
            .await
            .expect("handle callback");
        fixture.chat.take()
    }

    async fn user(fixture: &Fixture, chat_id: i64) -> User {
        fixture
            .storage
            .get_or_create_user(chat_id, None, None, None)
            .await
            .expect("user")
    }

    async fn stored_message(fixture: &Fixture, owner: &User) -> (Account, MailMessage) {
        let account = Account::new(owner.id, Provider::Imap, "me@example.com");
        fixture.storage.create_account(&account).await.expect("account");

        let message = MailMessage {
            id: Uuid::new_v4(),
            account_id: account.id,
            provider_message_id: "<lunch@example.com>".to_string(),
            message_id_header: Some("<lunch@example.com>".to_string()),
            thread_id: None,
            gmail_id: None,
            imap_uid: Some(3),
            from: MailAddress {
                name: Some("Alice".to_string()),
                address: "alice@example.com".to_string(),
            },
            to: Vec::new(),
            subject: Some("Lunch?".to_string()),
            sent_at: None,
            body_text: Some("Noon?".to_string()),
            body_html: None,
            sanitized_html: None,
            in_reply_to: None,
            references: None,
            attachments: Vec::new(),
            is_read: false,
            is_notified: true,
            notified_at: None,
            summary: SummaryFields::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        fixture.storage.create_message(&message).await.expect("message");
        (account, message)
    }

    #[test]
    fn commands_and_callbacks_parse() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse(" /link@mailhop_bot now"), Some(Command::Link));
        assert_eq!(Command::parse("/search x"), None);
        assert_eq!(Command::parse("hello"), None);

        let id = Uuid::new_v4();
        assert_eq!(
            CallbackAction::parse(&format!("mark_read_{id}")),
            Some(CallbackAction::MarkRead(id))
        );
        assert_eq!(
            CallbackAction::parse(&format!("unlink_{id}")),
            Some(CallbackAction::Unlink(id))
        );
        assert_eq!(CallbackAction::parse("link_imap"), Some(CallbackAction::LinkImap));
        assert_eq!(CallbackAction::parse("view_not-a-uuid"), None);
        assert_eq!(CallbackAction::parse("bogus"), None);
    }

    #[tokio::test]
    async fn imap_link_flow_creates_account() {
        let fixture = fixture().await;

        fixture
            .handler
            .handle_update(&text_update(CHAT, "/link"))
            .await
            .expect("link command");
        match fixture.chat.take().last() {
            Some(Sent::Message(_, message)) => {
                let keyboard = message.keyboard.as_ref().expect("keyboard");
                assert_eq!(keyboard.rows[1][0].callback_data.as_deref(), Some("link_imap"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let sent = press(&fixture, CHAT, "link_imap").await;
        assert_eq!(
            sent[0],
            Sent::Edit(CHAT, 77, super::LINK_START_PROMPT.to_string())
        );
        assert_eq!(sent[1], Sent::Answer("cb-1".to_string(), None, false));

        assert!(say(&fixture, "me@qq.com").await.starts_with("Email address saved."));
        assert!(say(&fixture, "imap.qq.com").await.starts_with("IMAP server saved."));
        assert!(say(&fixture, "nine").await.starts_with("Invalid port."));
        assert!(say(&fixture, "993").await.starts_with("Port saved."));
        assert!(say(&fixture, "me@qq.com").await.starts_with("Username saved."));
        assert_eq!(
            say(&fixture, "hunter2").await,
            "Successfully linked me@qq.com!\n\nYou'll start receiving email notifications shortly."
        );

        let owner = user(&fixture, CHAT).await;
        let accounts = fixture
            .storage
            .list_accounts_for_user(owner.id)
            .await
            .expect("accounts");
        assert_eq!(accounts.len(), 1);
        let account = &accounts[0];
        assert_eq!(account.provider, Provider::Imap);
        let imap = account.credentials.imap.as_ref().expect("imap");
        assert_eq!(imap.host, "imap.qq.com");
        assert_eq!(imap.port, 993);
        assert_ne!(imap.password_encrypted, "hunter2");
        assert_eq!(
            fixture.cipher.decrypt(&imap.password_encrypted).expect("decrypt"),
            "hunter2"
        );
        assert_eq!(account.credentials.smtp.as_ref().expect("smtp").port, 465);

        assert!(fixture.kv.get("link_imap:4242").await.expect("kv").is_none());
        assert_eq!(*fixture.fetchers.linked.lock().expect("linked"), vec![account.id]);
        assert_eq!(
            say(&fixture, "anything").await,
            "I don't understand. Use /help to see available commands."
        );
    }

    #[tokio::test]
    async fn link_session_expires_from_its_start_not_its_last_step() {
        let fixture = fixture_with(Duration::from_millis(300), false).await;
        press(&fixture, CHAT, "link_imap").await;

        tokio::time::sleep(Duration::from_millis(180)).await;
        assert!(say(&fixture, "me@qq.com").await.starts_with("Email address saved."));

        tokio::time::sleep(Duration::from_millis(180)).await;
        assert_eq!(
            say(&fixture, "imap.qq.com").await,
            "I don't understand. Use /help to see available commands."
        );
    }

    #[tokio::test]
    async fn corrupted_link_session_asks_to_start_over() {
        let fixture = fixture().await;
        fixture
            .kv
            .set("link_imap:4242", r#"{"step":"smtp_server"}"#, None)
            .await
            .expect("set");

        assert_eq!(
            say(&fixture, "imap.qq.com").await,
            "Session expired. Please start over with /link"
        );
        assert_eq!(
            say(&fixture, "imap.qq.com").await,
            "I don't understand. Use /help to see available commands."
        );
    }

    #[tokio::test]
    async fn cancel_drops_sessions() {
        let fixture = fixture().await;
        press(&fixture, CHAT, "link_imap").await;
        assert_eq!(say(&fixture, "/cancel").await, "Cancelled.");
        assert_eq!(say(&fixture, "/cancel").await, "Nothing to cancel.");
    }

    #[tokio::test]
    async fn reply_flow_sends_and_records() {
        let fixture = fixture().await;
        let owner = user(&fixture, CHAT).await;
        let (account, message) = stored_message(&fixture, &owner).await;

        let sent = press(&fixture, CHAT, &format!("reply_{}", message.id)).await;
        assert_eq!(
            sent,
            vec![Sent::Answer(
                "cb-1".to_string(),
                Some("Reply mode activated. Send your reply message.".to_string()),
                true
            )]
        );

        assert_eq!(say(&fixture, "See you at noon").await, "Reply sent successfully!");

        let replies = fixture.replies.sent.lock().expect("replies").clone();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].subject, "Re: Lunch?");
        assert_eq!(replies[0].to.address, "alice@example.com");
        assert_eq!(replies[0].from.address, account.email_address);
        assert_eq!(replies[0].in_reply_to.as_deref(), Some("<lunch@example.com>"));

        let records = fixture
            .storage
            .list_sent_replies_for_user(owner.id)
            .await
            .expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_email_id, Some(message.id));
        assert!(records[0].error.is_none());
        assert!(fixture.kv.get("reply:4242").await.expect("kv").is_none());
    }

    #[tokio::test]
    async fn failed_reply_is_recorded_with_error() {
        let fixture = fixture_with(Duration::from_secs(600), true).await;
        let owner = user(&fixture, CHAT).await;
        let (_account, message) = stored_message(&fixture, &owner).await;

        press(&fixture, CHAT, &format!("reply_{}", message.id)).await;
        let answer = say(&fixture, "ok").await;
        assert!(answer.starts_with("Failed to send reply:"));

        let records = fixture
            .storage
            .list_sent_replies_for_user(owner.id)
            .await
            .expect("records");
        assert_eq!(records.len(), 1);
        assert!(records[0]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("connection refused")));
        assert!(fixture.kv.get("reply:4242").await.expect("kv").is_none());
    }

    #[tokio::test]
    async fn view_button_issues_token_link() {
        let fixture = fixture().await;
        let owner = user(&fixture, CHAT).await;
        let (_account, message) = stored_message(&fixture, &owner).await;

        let sent = press(&fixture, CHAT, &format!("view_{}", message.id)).await;
        let Some(Sent::Answer(_, Some(text), true)) = sent.last() else {
            panic!("expected alert, got {sent:?}");
        };
        let token = text
            .strip_prefix("View email: https://mail.example/email/")
            .expect("link");
        let stored = fixture
            .storage
            .get_view_token(token)
            .await
            .expect("token")
            .expect("live token");
        assert_eq!(stored.email_id, message.id);
        assert!(stored.expires_at > Utc::now() + chrono::Duration::hours(23));
    }

    #[tokio::test]
    async fn mark_read_only_touches_own_messages() {
        let fixture = fixture().await;
        let owner = user(&fixture, CHAT).await;
        let (_account, message) = stored_message(&fixture, &owner).await;

        let sent = press(&fixture, 999, &format!("mark_read_{}", message.id)).await;
        assert_eq!(
            sent,
            vec![Sent::Answer("cb-1".to_string(), Some("Email not found".to_string()), false)]
        );
        let stored = fixture.storage.get_message(message.id).await.expect("get").expect("message");
        assert!(!stored.is_read);

        let sent = press(&fixture, CHAT, &format!("mark_read_{}", message.id)).await;
        assert_eq!(
            sent,
            vec![Sent::Answer("cb-1".to_string(), Some("Marked as read".to_string()), false)]
        );
        let stored = fixture.storage.get_message(message.id).await.expect("get").expect("message");
        assert!(stored.is_read);
    }

    #[tokio::test]
    async fn unlink_stops_fetcher_and_deletes_account() {
        let fixture = fixture().await;
        let owner = user(&fixture, CHAT).await;
        let (account, message) = stored_message(&fixture, &owner).await;

        let sent = press(&fixture, 999, &format!("unlink_{}", account.id)).await;
        assert_eq!(sent[0], Sent::Edit(999, 77, "Account not found.".to_string()));
        assert!(fixture.storage.get_account(account.id).await.expect("get").is_some());

        let sent = press(&fixture, CHAT, &format!("unlink_{}", account.id)).await;
        assert_eq!(
            sent[0],
            Sent::Edit(CHAT, 77, "Successfully unlinked me@example.com".to_string())
        );
        assert_eq!(*fixture.fetchers.unlinked.lock().expect("unlinked"), vec![account.id]);
        assert!(fixture.storage.get_account(account.id).await.expect("get").is_none());
        assert!(fixture.storage.get_message(message.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn unknown_callback_is_answered() {
        let fixture = fixture().await;
        let sent = press(&fixture, CHAT, "search_1").await;
        assert_eq!(
            sent,
            vec![Sent::Answer("cb-1".to_string(), Some("Unknown action".to_string()), false)]
        );
    }

    #[test]
    fn accounts_are_listed_with_status() {
        assert_eq!(
            render_accounts(&[]),
            "You don't have any linked email accounts.\n\nUse /link to add one."
        );

        let mut first = Account::new(Uuid::new_v4(), Provider::Imap, "a@example.com");
        first.last_fetch_at = Some(Utc.with_ymd_and_hms(2024, 2, 1, 8, 30, 0).unwrap());
        let mut second = Account::new(Uuid::new_v4(), Provider::Gmail, "b@gmail.com");
        second.is_active = false;
        second.last_error = Some("IMAP credentials not configured".to_string());

        assert_eq!(
            render_accounts(&[first, second]),
            "Your linked email accounts:\n\n\
             1. a@example.com (imap) - Active\n   Last fetched: 2024-02-01 08:30:00\n\n\
             2. b@gmail.com (gmail) - Inactive\n   Error: IMAP credentials not configured\n\n"
        );
    }
}
