use crate::StorageError;
use chrono::{DateTime, Utc};
use mailhop_core::{
    Account, MailAddress, MailMessage, PushCursor, SentReply, SummaryFields, User, ViewToken,
};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

const ACCOUNT_COLUMNS: &str = r#"
    id, user_id, provider, email_address, display_name, credentials_json,
    history_id, watch_expires_at, is_active, last_fetch_at, last_error,
    created_at, updated_at
"#;

const MESSAGE_COLUMNS: &str = r#"
    id, account_id, provider_message_id, message_id_header, thread_id, gmail_id, imap_uid,
    from_address, from_name, to_json, subject, sent_at,
    body_text, body_html, sanitized_html, in_reply_to, references_header, attachments_json,
    is_read, is_notified, notified_at,
    ai_summary, ai_extracted_json, ai_model, ai_summarized_at, ai_error,
    created_at, updated_at
"#;

/// Persistence gateway shared by the fetcher, notifier and bot processes.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn connect(db_path: &Path, max_connections: u32) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30))
            .pragma("temp_store", "memory");

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Private in-memory database, used by tests across the workspace.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get_or_create_user(
        &self,
        chat_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> Result<User, StorageError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO users (
              id, chat_id, username, first_name, last_name, is_active, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
            ON CONFLICT(chat_id) DO UPDATE SET
              username = COALESCE(excluded.username, users.username),
              first_name = COALESCE(excluded.first_name, users.first_name),
              last_name = COALESCE(excluded.last_name, users.last_name),
              updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(chat_id)
        .bind(username)
        .bind(first_name)
        .bind(last_name)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_user_by_chat_id(chat_id)
            .await?
            .ok_or_else(|| StorageError::Data(format!("user for chat {chat_id} vanished")))
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, chat_id, username, first_name, last_name, is_active, created_at, updated_at
            FROM users
            WHERE id = ?1
            "#,
        )
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_user).transpose()
    }

    pub async fn get_user_by_chat_id(&self, chat_id: i64) -> Result<Option<User>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, chat_id, username, first_name, last_name, is_active, created_at, updated_at
            FROM users
            WHERE chat_id = ?1
            "#,
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_user).transpose()
    }

    pub async fn create_account(&self, account: &Account) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO email_accounts (
              id, user_id, provider, email_address, display_name, credentials_json,
              history_id, watch_expires_at, is_active, last_fetch_at, last_error,
              created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(account.id.to_string())
        .bind(account.user_id.to_string())
        .bind(account.provider.as_str())
        .bind(&account.email_address)
        .bind(&account.display_name)
        .bind(serde_json::to_string(&account.credentials)?)
        .bind(history_to_db(account.cursor.history_id)?)
        .bind(account.cursor.watch_expires_at.map(|value| value.to_rfc3339()))
        .bind(account.is_active)
        .bind(account.last_fetch_at.map(|value| value.to_rfc3339()))
        .bind(&account.last_error)
        .bind(account.created_at.to_rfc3339())
        .bind(account.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|err| map_unique_violation(err, "email_accounts"))?;

        Ok(())
    }

    pub async fn update_account(&self, account: &Account) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE email_accounts SET
              provider = ?2,
              email_address = ?3,
              display_name = ?4,
              credentials_json = ?5,
              history_id = ?6,
              watch_expires_at = ?7,
              is_active = ?8,
              last_fetch_at = ?9,
              last_error = ?10,
              updated_at = ?11
            WHERE id = ?1
            "#,
        )
        .bind(account.id.to_string())
        .bind(account.provider.as_str())
        .bind(&account.email_address)
        .bind(&account.display_name)
        .bind(serde_json::to_string(&account.credentials)?)
        .bind(history_to_db(account.cursor.history_id)?)
        .bind(account.cursor.watch_expires_at.map(|value| value.to_rfc3339()))
        .bind(account.is_active)
        .bind(account.last_fetch_at.map(|value| value.to_rfc3339()))
        .bind(&account.last_error)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM email_accounts WHERE id = ?1"
        ))
        .bind(account_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_account).transpose()
    }

    /// Returns whether a row was removed. Messages go with it.
    pub async fn delete_account(&self, account_id: Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM email_accounts WHERE id = ?1")
            .bind(account_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_active_accounts(&self) -> Result<Vec<Account>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM email_accounts WHERE is_active = 1 ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_account).collect()
    }

    pub async fn list_accounts_for_user(&self, user_id: Uuid) -> Result<Vec<Account>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM email_accounts WHERE user_id = ?1 ORDER BY created_at"
        ))
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_account).collect()
    }

    pub async fn find_active_account_by_email(
        &self,
        email_address: &str,
    ) -> Result<Option<Account>, StorageError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {ACCOUNT_COLUMNS} FROM email_accounts
            WHERE is_active = 1 AND lower(email_address) = lower(?1)
            ORDER BY created_at
            LIMIT 1
            "#
        ))
        .bind(email_address)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_account).transpose()
    }

    pub async fn record_fetch_success(
        &self,
        account_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE email_accounts
            SET last_fetch_at = ?2, last_error = NULL, updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(account_id.to_string())
        .bind(at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_fetch_error(
        &self,
        account_id: Uuid,
        message: &str,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE email_accounts SET last_error = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(account_id.to_string())
            .bind(message)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn update_push_cursor(
        &self,
        account_id: Uuid,
        cursor: &PushCursor,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE email_accounts
            SET history_id = ?2, watch_expires_at = ?3, updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(account_id.to_string())
        .bind(history_to_db(cursor.history_id)?)
        .bind(cursor.watch_expires_at.map(|value| value.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Inserts a new message. A second insert for the same
    /// `(account_id, provider_message_id)` fails with [`StorageError::Duplicate`].
    pub async fn create_message(&self, message: &MailMessage) -> Result<(), StorageError> {
        let extracted = match &message.summary.extracted {
            Some(extracted) => Some(serde_json::to_string(extracted)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO email_messages (
              id, account_id, provider_message_id, message_id_header, thread_id, gmail_id, imap_uid,
              from_address, from_name, to_json, subject, sent_at,
              body_text, body_html, sanitized_html, in_reply_to, references_header, attachments_json,
              is_read, is_notified, notified_at,
              ai_summary, ai_extracted_json, ai_model, ai_summarized_at, ai_error,
              created_at, updated_at
            ) VALUES (
              ?1, ?2, ?3, ?4, ?5, ?6, ?7,
              ?8, ?9, ?10, ?11, ?12,
              ?13, ?14, ?15, ?16, ?17, ?18,
              ?19, ?20, ?21,
              ?22, ?23, ?24, ?25, ?26,
              ?27, ?28
            )
            "#,
        )
        .bind(message.id.to_string())
        .bind(message.account_id.to_string())
        .bind(&message.provider_message_id)
        .bind(&message.message_id_header)
        .bind(&message.thread_id)
        .bind(&message.gmail_id)
        .bind(message.imap_uid.map(i64::from))
        .bind(&message.from.address)
        .bind(&message.from.name)
        .bind(serde_json::to_string(&message.to)?)
        .bind(&message.subject)
        .bind(message.sent_at.map(|value| value.to_rfc3339()))
        .bind(&message.body_text)
        .bind(&message.body_html)
        .bind(&message.sanitized_html)
        .bind(&message.in_reply_to)
        .bind(&message.references)
        .bind(serde_json::to_string(&message.attachments)?)
        .bind(message.is_read)
        .bind(message.is_notified)
        .bind(message.notified_at.map(|value| value.to_rfc3339()))
        .bind(&message.summary.summary)
        .bind(extracted)
        .bind(&message.summary.model)
        .bind(message.summary.summarized_at.map(|value| value.to_rfc3339()))
        .bind(&message.summary.error)
        .bind(message.created_at.to_rfc3339())
        .bind(message.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|err| map_unique_violation(err, "email_messages"))?;

        Ok(())
    }

    pub async fn get_message(&self, message_id: Uuid) -> Result<Option<MailMessage>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM email_messages WHERE id = ?1"
        ))
        .bind(message_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_message).transpose()
    }

    pub async fn get_message_by_provider_id(
        &self,
        account_id: Uuid,
        provider_message_id: &str,
    ) -> Result<Option<MailMessage>, StorageError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM email_messages
            WHERE account_id = ?1 AND provider_message_id = ?2
            "#
        ))
        .bind(account_id.to_string())
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_message).transpose()
    }

    pub async fn count_messages_for_account(&self, account_id: Uuid) -> Result<u64, StorageError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM email_messages WHERE account_id = ?1")
                .bind(account_id.to_string())
                .fetch_one(&self.pool)
                .await?;

        Ok(count.max(0) as u64)
    }

    /// IMAP UIDs of every message already stored for the account.
    pub async fn stored_imap_uids(&self, account_id: Uuid) -> Result<HashSet<u32>, StorageError> {
        let uids: Vec<i64> = sqlx::query_scalar(
            "SELECT imap_uid FROM email_messages WHERE account_id = ?1 AND imap_uid IS NOT NULL",
        )
        .bind(account_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(uids
            .into_iter()
            .filter_map(|uid| u32::try_from(uid).ok())
            .collect())
    }

    pub async fn mark_message_notified(&self, message_id: Uuid) -> Result<(), StorageError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE email_messages
            SET is_notified = 1, notified_at = ?2, updated_at = ?2
            WHERE id = ?1
            "#,
        )
        .bind(message_id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns whether the message exists.
    pub async fn mark_message_read(&self, message_id: Uuid) -> Result<bool, StorageError> {
        let result =
            sqlx::query("UPDATE email_messages SET is_read = 1, updated_at = ?2 WHERE id = ?1")
                .bind(message_id.to_string())
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn update_message_summary(
        &self,
        message_id: Uuid,
        fields: &SummaryFields,
    ) -> Result<(), StorageError> {
        let extracted = match &fields.extracted {
            Some(extracted) => Some(serde_json::to_string(extracted)?),
            None => None,
        };

        sqlx::query(
            r#"
            UPDATE email_messages SET
              ai_summary = ?2,
              ai_extracted_json = ?3,
              ai_model = ?4,
              ai_summarized_at = ?5,
              ai_error = ?6,
              updated_at = ?7
            WHERE id = ?1
            "#,
        )
        .bind(message_id.to_string())
        .bind(&fields.summary)
        .bind(extracted)
        .bind(&fields.model)
        .bind(fields.summarized_at.map(|value| value.to_rfc3339()))
        .bind(&fields.error)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn create_view_token(&self, token: &ViewToken) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO email_view_tokens (id, email_id, token, expires_at, view_count, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(token.id.to_string())
        .bind(token.email_id.to_string())
        .bind(&token.token)
        .bind(token.expires_at.to_rfc3339())
        .bind(i64::from(token.view_count))
        .bind(token.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Expired tokens read as absent.
    pub async fn get_view_token(&self, token: &str) -> Result<Option<ViewToken>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, email_id, token, expires_at, view_count, created_at
            FROM email_view_tokens
            WHERE token = ?1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let token = Self::row_to_view_token(row)?;
        if token.expires_at <= Utc::now() {
            return Ok(None);
        }
        Ok(Some(token))
    }

    pub async fn create_sent_reply(&self, reply: &SentReply) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO sent_replies (
              id, user_id, original_email_id, account_id, to_address,
              subject, body, error, sent_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(reply.id.to_string())
        .bind(reply.user_id.to_string())
        .bind(reply.original_email_id.map(|id| id.to_string()))
        .bind(reply.account_id.to_string())
        .bind(&reply.to_address)
        .bind(&reply.subject)
        .bind(&reply.body)
        .bind(&reply.error)
        .bind(reply.sent_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_sent_replies_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<SentReply>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, original_email_id, account_id, to_address,
                   subject, body, error, sent_at
            FROM sent_replies
            WHERE user_id = ?1
            ORDER BY sent_at
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_sent_reply).collect()
    }

    fn row_to_user(row: SqliteRow) -> Result<User, StorageError> {
        let id_raw: String = row.try_get("id")?;
        let created_raw: String = row.try_get("created_at")?;
        let updated_raw: String = row.try_get("updated_at")?;

        Ok(User {
            id: parse_uuid(&id_raw, "users.id")?,
            chat_id: row.try_get("chat_id")?,
            username: row.try_get("username")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            is_active: row.try_get::<i64, _>("is_active")? == 1,
            created_at: parse_datetime(&created_raw, "users.created_at")?,
            updated_at: parse_datetime(&updated_raw, "users.updated_at")?,
        })
    }

    fn row_to_account(row: SqliteRow) -> Result<Account, StorageError> {
        let id_raw: String = row.try_get("id")?;
        let user_raw: String = row.try_get("user_id")?;
        let provider_raw: String = row.try_get("provider")?;
        let credentials_raw: String = row.try_get("credentials_json")?;
        let history_raw: Option<i64> = row.try_get("history_id")?;
        let watch_raw: Option<String> = row.try_get("watch_expires_at")?;
        let last_fetch_raw: Option<String> = row.try_get("last_fetch_at")?;
        let created_raw: String = row.try_get("created_at")?;
        let updated_raw: String = row.try_get("updated_at")?;

        Ok(Account {
            id: parse_uuid(&id_raw, "email_accounts.id")?,
            user_id: parse_uuid(&user_raw, "email_accounts.user_id")?,
            provider: provider_raw.into(),
            email_address: row.try_get("email_address")?,
            display_name: row.try_get("display_name")?,
            credentials: parse_json(&credentials_raw, "email_accounts.credentials_json")?,
            cursor: PushCursor {
                history_id: history_raw.map(|value| value.max(0) as u64),
                watch_expires_at: parse_optional_datetime(
                    watch_raw.as_deref(),
                    "email_accounts.watch_expires_at",
                )?,
            },
            is_active: row.try_get::<i64, _>("is_active")? == 1,
            last_fetch_at: parse_optional_datetime(
                last_fetch_raw.as_deref(),
                "email_accounts.last_fetch_at",
            )?,
            last_error: row.try_get("last_error")?,
            created_at: parse_datetime(&created_raw, "email_accounts.created_at")?,
            updated_at: parse_datetime(&updated_raw, "email_accounts.updated_at")?,
        })
    }

    fn row_to_message(row: SqliteRow) -> Result<MailMessage, StorageError> {
        let id_raw: String = row.try_get("id")?;
        let account_raw: String = row.try_get("account_id")?;
        let uid_raw: Option<i64> = row.try_get("imap_uid")?;
        let to_raw: String = row.try_get("to_json")?;
        let sent_raw: Option<String> = row.try_get("sent_at")?;
        let attachments_raw: String = row.try_get("attachments_json")?;
        let notified_raw: Option<String> = row.try_get("notified_at")?;
        let extracted_raw: Option<String> = row.try_get("ai_extracted_json")?;
        let summarized_raw: Option<String> = row.try_get("ai_summarized_at")?;
        let created_raw: String = row.try_get("created_at")?;
        let updated_raw: String = row.try_get("updated_at")?;

        Ok(MailMessage {
            id: parse_uuid(&id_raw, "email_messages.id")?,
            account_id: parse_uuid(&account_raw, "email_messages.account_id")?,
            provider_message_id: row.try_get("provider_message_id")?,
            message_id_header: row.try_get("message_id_header")?,
            thread_id: row.try_get("thread_id")?,
            gmail_id: row.try_get("gmail_id")?,
            imap_uid: uid_raw.and_then(|value| u32::try_from(value).ok()),
            from: MailAddress {
                name: row.try_get("from_name")?,
                address: row.try_get("from_address")?,
            },
            to: parse_json(&to_raw, "email_messages.to_json")?,
            subject: row.try_get("subject")?,
            sent_at: parse_optional_datetime(sent_raw.as_deref(), "email_messages.sent_at")?,
            body_text: row.try_get("body_text")?,
            body_html: row.try_get("body_html")?,
            sanitized_html: row.try_get("sanitized_html")?,
            in_reply_to: row.try_get("in_reply_to")?,
            references: row.try_get("references_header")?,
            attachments: parse_json(&attachments_raw, "email_messages.attachments_json")?,
            is_read: row.try_get::<i64, _>("is_read")? == 1,
            is_notified: row.try_get::<i64, _>("is_notified")? == 1,
            notified_at: parse_optional_datetime(
                notified_raw.as_deref(),
                "email_messages.notified_at",
            )?,
            summary: SummaryFields {
                summary: row.try_get("ai_summary")?,
                extracted: extracted_raw
                    .as_deref()
                    .map(|raw| parse_json(raw, "email_messages.ai_extracted_json"))
                    .transpose()?,
                model: row.try_get("ai_model")?,
                summarized_at: parse_optional_datetime(
                    summarized_raw.as_deref(),
                    "email_messages.ai_summarized_at",
                )?,
                error: row.try_get("ai_error")?,
            },
            created_at: parse_datetime(&created_raw, "email_messages.created_at")?,
            updated_at: parse_datetime(&updated_raw, "email_messages.updated_at")?,
        })
    }

    fn row_to_view_token(row: SqliteRow) -> Result<ViewToken, StorageError> {
        let id_raw: String = row.try_get("id")?;
        let email_raw: String = row.try_get("email_id")?;
        let expires_raw: String = row.try_get("expires_at")?;
        let created_raw: String = row.try_get("created_at")?;

        Ok(ViewToken {
            id: parse_uuid(&id_raw, "email_view_tokens.id")?,
            email_id: parse_uuid(&email_raw, "email_view_tokens.email_id")?,
            token: row.try_get("token")?,
            expires_at: parse_datetime(&expires_raw, "email_view_tokens.expires_at")?,
            view_count: row.try_get::<i64, _>("view_count")?.max(0) as u32,
            created_at: parse_datetime(&created_raw, "email_view_tokens.created_at")?,
        })
    }

    fn row_to_sent_reply(row: SqliteRow) -> Result<SentReply, StorageError> {
        let id_raw: String = row.try_get("id")?;
        let user_raw: String = row.try_get("user_id")?;
        let original_raw: Option<String> = row.try_get("original_email_id")?;
        let account_raw: String = row.try_get("account_id")?;
        let sent_raw: String = row.try_get("sent_at")?;

        Ok(SentReply {
            id: parse_uuid(&id_raw, "sent_replies.id")?,
            user_id: parse_uuid(&user_raw, "sent_replies.user_id")?,
            original_email_id: original_raw
                .as_deref()
                .map(|raw| parse_uuid(raw, "sent_replies.original_email_id"))
                .transpose()?,
            account_id: parse_uuid(&account_raw, "sent_replies.account_id")?,
            to_address: row.try_get("to_address")?,
            subject: row.try_get("subject")?,
            body: row.try_get("body")?,
            error: row.try_get("error")?,
            sent_at: parse_datetime(&sent_raw, "sent_replies.sent_at")?,
        })
    }
}

fn map_unique_violation(err: sqlx::Error, table: &str) -> StorageError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StorageError::Duplicate(format!("{table}: {}", db.message()))
        }
        _ => StorageError::Sqlx(err),
    }
}

fn history_to_db(history_id: Option<u64>) -> Result<Option<i64>, StorageError> {
    history_id
        .map(|value| {
            i64::try_from(value)
                .map_err(|_| StorageError::Data(format!("history id {value} out of range")))
        })
        .transpose()
}

fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(raw)
        .map_err(|err| StorageError::Data(format!("invalid uuid for {field}: {err}")))
}

fn parse_datetime(raw: &str, field: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Data(format!("invalid datetime for {field}: {err}")))
}

fn parse_optional_datetime(
    raw: Option<&str>,
    field: &str,
) -> Result<Option<DateTime<Utc>>, StorageError> {
    raw.map(|raw| parse_datetime(raw, field)).transpose()
}

fn parse_json<T>(raw: &str, field: &str) -> Result<T, StorageError>
where
    T: DeserializeOwned,
{
    serde_json::from_str(raw)
        .map_err(|err| StorageError::Data(format!("invalid json for {field}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::Storage;
    use crate::StorageError;
    use chrono::{Duration, Utc};
    use mailhop_core::{
        Account, ExtractedData, MailAddress, MailMessage, Provider, PushCursor, ServerCredentials,
        SummaryFields, ViewToken,
    };
    use uuid::Uuid;

    fn sample_message(account_id: Uuid, provider_message_id: &str) -> MailMessage {
        let now = Utc::now();
        MailMessage {
            id: Uuid::new_v4(),
            account_id,
            provider_message_id: provider_message_id.to_string(),
            message_id_header: Some(provider_message_id.to_string()),
            thread_id: None,
            gmail_id: None,
            imap_uid: Some(42),
            from: MailAddress {
                name: Some("Alice".to_string()),
                address: "alice@example.com".to_string(),
            },
            to: vec![MailAddress {
                name: None,
                address: "bob@example.com".to_string(),
            }],
            subject: Some("Hello".to_string()),
            sent_at: Some(now),
            body_text: Some("Hi Bob".to_string()),
            body_html: None,
            sanitized_html: None,
            in_reply_to: None,
            references: None,
            attachments: Vec::new(),
            is_read: false,
            is_notified: false,
            notified_at: None,
            summary: SummaryFields::default(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn seeded_account(storage: &Storage) -> Account {
        let user = storage
            .get_or_create_user(1001, Some("bob"), None, None)
            .await
            .expect("user");
        let mut account = Account::new(user.id, Provider::Imap, "bob@example.com");
        account.credentials.imap = Some(ServerCredentials {
            host: "imap.example.com".to_string(),
            port: 993,
            username: "bob@example.com".to_string(),
            password_encrypted: "sealed".to_string(),
        });
        storage.create_account(&account).await.expect("account");
        account
    }

    #[tokio::test]
    async fn users_are_created_once_per_chat() {
        let storage = Storage::in_memory().await.expect("storage");
        let first = storage
            .get_or_create_user(77, Some("carol"), Some("Carol"), None)
            .await
            .expect("user");
        let second = storage
            .get_or_create_user(77, None, None, Some("Doe"))
            .await
            .expect("user");

        assert_eq!(first.id, second.id);
        assert_eq!(second.username.as_deref(), Some("carol"));
        assert_eq!(second.last_name.as_deref(), Some("Doe"));
        assert!(storage.get_user(first.id).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn account_fetch_state_and_cursor_round_trip() {
        let storage = Storage::in_memory().await.expect("storage");
        let account = seeded_account(&storage).await;

        storage
            .record_fetch_error(account.id, "connection refused")
            .await
            .expect("error recorded");
        let loaded = storage.get_account(account.id).await.expect("get").expect("some");
        assert_eq!(loaded.last_error.as_deref(), Some("connection refused"));
        assert_eq!(loaded.credentials, account.credentials);

        storage
            .record_fetch_success(account.id, Utc::now())
            .await
            .expect("success recorded");
        let cursor = PushCursor {
            history_id: Some(98765),
            watch_expires_at: Some(Utc::now() + Duration::days(7)),
        };
        storage.update_push_cursor(account.id, &cursor).await.expect("cursor");

        let loaded = storage.get_account(account.id).await.expect("get").expect("some");
        assert!(loaded.last_error.is_none());
        assert!(loaded.last_fetch_at.is_some());
        assert_eq!(loaded.cursor.history_id, Some(98765));
        assert!(loaded.cursor.watch_expires_at.is_some());
    }

    #[tokio::test]
    async fn only_active_accounts_are_listed() {
        let storage = Storage::in_memory().await.expect("storage");
        let active = seeded_account(&storage).await;
        let mut inactive = Account::new(active.user_id, Provider::Gmail, "other@example.com");
        inactive.is_active = false;
        storage.create_account(&inactive).await.expect("account");

        let listed = storage.list_active_accounts().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, active.id);
        assert_eq!(
            storage
                .list_accounts_for_user(active.user_id)
                .await
                .expect("list")
                .len(),
            2
        );
        assert!(storage
            .find_active_account_by_email("BOB@example.com")
            .await
            .expect("find")
            .is_some());
    }

    #[tokio::test]
    async fn duplicate_provider_message_id_is_rejected() {
        let storage = Storage::in_memory().await.expect("storage");
        let account = seeded_account(&storage).await;

        let first = sample_message(account.id, "<m1@example.com>");
        storage.create_message(&first).await.expect("insert");

        let second = sample_message(account.id, "<m1@example.com>");
        let err = storage.create_message(&second).await.expect_err("duplicate");
        assert!(matches!(err, StorageError::Duplicate(_)));
        assert_eq!(
            storage
                .count_messages_for_account(account.id)
                .await
                .expect("count"),
            1
        );

        let found = storage
            .get_message_by_provider_id(account.id, "<m1@example.com>")
            .await
            .expect("lookup")
            .expect("some");
        assert_eq!(found.id, first.id);
        assert_eq!(found.imap_uid, Some(42));

        let uids = storage.stored_imap_uids(account.id).await.expect("uids");
        assert_eq!(uids.into_iter().collect::<Vec<_>>(), vec![42]);
        assert!(storage
            .stored_imap_uids(Uuid::new_v4())
            .await
            .expect("uids")
            .is_empty());
    }

    #[tokio::test]
    async fn notification_read_and_summary_updates() {
        let storage = Storage::in_memory().await.expect("storage");
        let account = seeded_account(&storage).await;
        let message = sample_message(account.id, "<m2@example.com>");
        storage.create_message(&message).await.expect("insert");

        let fields = SummaryFields {
            summary: Some("Your code is 1234".to_string()),
            extracted: Some(ExtractedData {
                verification_codes: vec!["1234".to_string()],
                ..ExtractedData::default()
            }),
            model: Some("gpt-4o-mini".to_string()),
            summarized_at: Some(Utc::now()),
            error: None,
        };
        storage
            .update_message_summary(message.id, &fields)
            .await
            .expect("summary");
        storage.mark_message_notified(message.id).await.expect("notified");
        assert!(storage.mark_message_read(message.id).await.expect("read"));
        assert!(!storage.mark_message_read(Uuid::new_v4()).await.expect("read"));

        let loaded = storage.get_message(message.id).await.expect("get").expect("some");
        assert!(loaded.is_notified);
        assert!(loaded.notified_at.is_some());
        assert!(loaded.is_read);
        assert_eq!(loaded.summary.summary, fields.summary);
        assert_eq!(loaded.summary.extracted, fields.extracted);
    }

    #[tokio::test]
    async fn expired_view_tokens_read_as_absent() {
        let storage = Storage::in_memory().await.expect("storage");
        let account = seeded_account(&storage).await;
        let message = sample_message(account.id, "<m3@example.com>");
        storage.create_message(&message).await.expect("insert");

        let now = Utc::now();
        for (token, expires_at) in [
            ("live", now + Duration::hours(24)),
            ("stale", now - Duration::minutes(1)),
        ] {
            storage
                .create_view_token(&ViewToken {
                    id: Uuid::new_v4(),
                    email_id: message.id,
                    token: token.to_string(),
                    expires_at,
                    view_count: 0,
                    created_at: now,
                })
                .await
                .expect("token");
        }

        assert!(storage.get_view_token("live").await.expect("get").is_some());
        assert!(storage.get_view_token("stale").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn deleting_an_account_removes_its_messages() {
        let storage = Storage::in_memory().await.expect("storage");
        let account = seeded_account(&storage).await;
        let message = sample_message(account.id, "<m4@example.com>");
        storage.create_message(&message).await.expect("insert");

        assert!(storage.delete_account(account.id).await.expect("delete"));
        assert!(storage.get_message(message.id).await.expect("get").is_none());
        assert!(!storage.delete_account(account.id).await.expect("delete again"));
    }
}
