use crate::EmailError;
use async_trait::async_trait;
use lettre::message::{Mailbox, SinglePart};
use lettre::{
    transport::smtp::authentication::Credentials, AsyncSmtpTransport, AsyncTransport, Message,
    Tokio1Executor,
};
use mailhop_core::{Account, MailAddress, MailMessage};
use mailhop_security::CredentialCipher;

const IMPLICIT_TLS_PORT: u16 = 465;

/// A plain-text answer to a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingReply {
    pub from: MailAddress,
    pub to: MailAddress,
    pub subject: String,
    pub body: String,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
}

impl OutgoingReply {
    /// Threads the reply onto `original`: `Re:` subject, `In-Reply-To` set
    /// to its Message-ID and that id appended to its `References`.
    pub fn to_message(account: &Account, original: &MailMessage, body: impl Into<String>) -> Self {
        let subject = original.subject.as_deref().unwrap_or_default();
        let subject = if subject.get(..3).is_some_and(|prefix| prefix.eq_ignore_ascii_case("re:")) {
            subject.to_string()
        } else {
            format!("Re: {subject}")
        };

        let references = match (&original.references, &original.message_id_header) {
            (Some(existing), Some(id)) => Some(format!("{existing} {id}")),
            (None, Some(id)) => Some(id.clone()),
            (Some(existing), None) => Some(existing.clone()),
            (None, None) => None,
        };

        Self {
            from: MailAddress {
                name: account.display_name.clone(),
                address: account.email_address.clone(),
            },
            to: MailAddress {
                name: None,
                address: original.from.address.clone(),
            },
            subject,
            body: body.into(),
            in_reply_to: original.message_id_header.clone(),
            references,
        }
    }

    pub fn build(&self) -> Result<Message, EmailError> {
        let mut builder = Message::builder()
            .from(to_mailbox(&self.from)?)
            .to(to_mailbox(&self.to)?)
            .subject(self.subject.clone());

        if let Some(id) = &self.in_reply_to {
            builder = builder.in_reply_to(id.clone());
        }
        if let Some(references) = &self.references {
            builder = builder.references(references.clone());
        }

        builder
            .singlepart(SinglePart::plain(self.body.clone()))
            .map_err(|err| EmailError::Build(err.to_string()))
    }
}

#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn send_reply(&self, account: &Account, reply: &OutgoingReply) -> Result<(), EmailError>;
}

/// Sends through the account's SMTP server with its stored credentials.
pub struct SmtpReplySender {
    cipher: CredentialCipher,
}

impl SmtpReplySender {
    pub fn new(cipher: CredentialCipher) -> Self {
        Self { cipher }
    }
}

#[async_trait]
impl ReplySender for SmtpReplySender {
    async fn send_reply(&self, account: &Account, reply: &OutgoingReply) -> Result<(), EmailError> {
        let smtp = account
            .credentials
            .smtp
            .as_ref()
            .filter(|creds| creds.is_complete())
            .ok_or_else(|| EmailError::Config("SMTP credentials not configured".to_string()))?;
        let password = self.cipher.decrypt(&smtp.password_encrypted)?;
        let message = reply.build()?;

        // 465 speaks TLS from the first byte; other submission ports upgrade.
        let builder = if smtp.port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
        };
        let transport = builder
            .map_err(|err| EmailError::Smtp(err.to_string()))?
            .port(smtp.port)
            .credentials(Credentials::new(smtp.username.clone(), password))
            .build();

        transport
            .send(message)
            .await
            .map_err(|err| EmailError::Smtp(err.to_string()))?;

        tracing::info!(account_id = %account.id, to = %reply.to.address, "reply sent");
        Ok(())
    }
}

fn to_mailbox(address: &MailAddress) -> Result<Mailbox, EmailError> {
    let email = address
        .address
        .parse()
        .map_err(|err| EmailError::Build(format!("invalid email {}: {err}", address.address)))?;

    Ok(Mailbox::new(address.name.clone(), email))
}

#[cfg(test)]
mod tests {
    use super::OutgoingReply;
    use chrono::Utc;
    use mailhop_core::{Account, MailAddress, MailMessage, Provider, SummaryFields};
    use uuid::Uuid;

    fn original(subject: Option<&str>, references: Option<&str>) -> MailMessage {
        MailMessage {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            provider_message_id: "<orig@example.com>".to_string(),
            message_id_header: Some("<orig@example.com>".to_string()),
            thread_id: None,
            gmail_id: None,
            imap_uid: Some(1),
            from: MailAddress {
                name: Some("Alice".to_string()),
                address: "alice@example.com".to_string(),
            },
            to: Vec::new(),
            subject: subject.map(str::to_string),
            sent_at: None,
            body_text: Some("hi".to_string()),
            body_html: None,
            sanitized_html: None,
            in_reply_to: None,
            references: references.map(str::to_string),
            attachments: Vec::new(),
            is_read: false,
            is_notified: true,
            notified_at: None,
            summary: SummaryFields::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn reply_is_threaded_onto_the_original() {
        let account = Account::new(Uuid::new_v4(), Provider::Imap, "me@example.com");
        let reply = OutgoingReply::to_message(
            &account,
            &original(Some("Lunch?"), Some("<root@example.com>")),
            "Sure",
        );

        assert_eq!(reply.subject, "Re: Lunch?");
        assert_eq!(reply.to.address, "alice@example.com");
        assert_eq!(reply.from.address, "me@example.com");
        assert_eq!(reply.in_reply_to.as_deref(), Some("<orig@example.com>"));
        assert_eq!(
            reply.references.as_deref(),
            Some("<root@example.com> <orig@example.com>")
        );

        let message = reply.build().expect("build");
        let formatted = String::from_utf8(message.formatted()).expect("utf8");
        assert!(formatted.contains("In-Reply-To: <orig@example.com>"));
        assert!(formatted.contains("Subject: Re: Lunch?"));
    }

    #[test]
    fn existing_re_prefix_is_not_doubled() {
        let account = Account::new(Uuid::new_v4(), Provider::Imap, "me@example.com");
        let reply = OutgoingReply::to_message(&account, &original(Some("RE: Lunch?"), None), "ok");
        assert_eq!(reply.subject, "RE: Lunch?");
        assert_eq!(reply.references.as_deref(), Some("<orig@example.com>"));
    }
}
