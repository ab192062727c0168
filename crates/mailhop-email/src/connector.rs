use crate::{EmailError, GmailMailbox, GmailSettings, ImapSource, PushMailbox, UnseenSource};
use mailhop_core::Account;
use mailhop_security::{CredentialCipher, OAuthRefresher};
use std::sync::Arc;

/// Builds provider clients for an account. Errors returned here are
/// configuration problems; the account's fetcher is not started.
pub trait MailboxConnector: Send + Sync {
    fn unseen_source(&self, account: &Account) -> Result<Arc<dyn UnseenSource>, EmailError>;

    fn push_mailbox(&self, account: &Account) -> Result<Arc<dyn PushMailbox>, EmailError>;
}

/// Connector for the real IMAP and Gmail backends.
pub struct ProviderConnector {
    cipher: CredentialCipher,
    imap: Arc<ImapSource>,
    gmail: Option<GmailSettings>,
    refresher: Option<OAuthRefresher>,
    http: reqwest::Client,
}

impl ProviderConnector {
    pub fn new(cipher: CredentialCipher) -> Self {
        Self {
            imap: Arc::new(ImapSource::new(cipher.clone())),
            cipher,
            gmail: None,
            refresher: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_gmail(mut self, settings: GmailSettings, refresher: Option<OAuthRefresher>) -> Self {
        self.gmail = Some(settings);
        self.refresher = refresher;
        self
    }
}

impl MailboxConnector for ProviderConnector {
    fn unseen_source(&self, account: &Account) -> Result<Arc<dyn UnseenSource>, EmailError> {
        let configured = account
            .credentials
            .imap
            .as_ref()
            .is_some_and(|creds| creds.is_complete());
        if !configured {
            return Err(EmailError::Config("IMAP credentials not configured".to_string()));
        }

        Ok(self.imap.clone())
    }

    fn push_mailbox(&self, account: &Account) -> Result<Arc<dyn PushMailbox>, EmailError> {
        let settings = self
            .gmail
            .clone()
            .ok_or_else(|| EmailError::Config("Gmail push is not configured".to_string()))?;

        let mailbox = GmailMailbox::new(
            account,
            &self.cipher,
            settings,
            self.refresher.clone(),
            self.http.clone(),
        )?;
        Ok(Arc::new(mailbox))
    }
}
