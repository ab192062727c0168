use crate::{message_id_from_raw, EmailError, MessageOrigin, RawMessage, UnseenSource};
use async_trait::async_trait;
use mailhop_core::Account;
use mailhop_security::CredentialCipher;
use std::collections::HashSet;
use tokio::task;

/// Polls INBOX over IMAPS for messages without the `\Seen` flag.
///
/// Bodies are fetched with `BODY.PEEK[]` so polling never marks anything
/// read on the server. The unseen set therefore does not drain, so UIDs
/// already stored are dropped before any body is requested.
pub struct ImapSource {
    cipher: CredentialCipher,
}

struct ImapLogin {
    host: String,
    port: u16,
    username: String,
    password: String,
}

impl ImapSource {
    pub fn new(cipher: CredentialCipher) -> Self {
        Self { cipher }
    }

    fn login_for(&self, account: &Account) -> Result<ImapLogin, EmailError> {
        let creds = account
            .credentials
            .imap
            .as_ref()
            .filter(|creds| creds.is_complete())
            .ok_or_else(|| EmailError::Config("IMAP credentials not configured".to_string()))?;

        Ok(ImapLogin {
            host: creds.host.clone(),
            port: creds.port,
            username: creds.username.clone(),
            password: self.cipher.decrypt(&creds.password_encrypted)?,
        })
    }
}

#[async_trait]
impl UnseenSource for ImapSource {
    async fn fetch_unseen(
        &self,
        account: &Account,
        stored_uids: &HashSet<u32>,
    ) -> Result<Vec<RawMessage>, EmailError> {
        let login = self.login_for(account)?;
        let stored_uids = stored_uids.clone();
        task::spawn_blocking(move || fetch_unseen_imap(&login, &stored_uids))
            .await
            .map_err(|err| EmailError::Data(format!("imap fetch task failed: {err}")))?
    }
}

fn fetch_unseen_imap(
    login: &ImapLogin,
    stored_uids: &HashSet<u32>,
) -> Result<Vec<RawMessage>, EmailError> {
    let client = imap::ClientBuilder::new(login.host.as_str(), login.port)
        .connect()
        .map_err(imap_error_to_email)?;
    let mut session = client
        .login(login.username.as_str(), login.password.as_str())
        .map_err(|err| imap_error_to_email(err.0))?;

    session.select("INBOX").map_err(imap_error_to_email)?;
    let unseen = session.uid_search("UNSEEN").map_err(imap_error_to_email)?;
    let Some(sequence) = new_uid_sequence(unseen, stored_uids) else {
        let _ = session.logout();
        return Ok(Vec::new());
    };

    let fetches = session
        .uid_fetch(sequence, "(UID BODY.PEEK[])")
        .map_err(imap_error_to_email)?;

    let mut messages = Vec::new();
    for fetched in fetches.iter() {
        let (Some(uid), Some(body)) = (fetched.uid, fetched.body()) else {
            continue;
        };

        messages.push(RawMessage {
            provider_message_id: message_id_from_raw(body).unwrap_or_else(|| format!("uid:{uid}")),
            origin: MessageOrigin::Imap { uid },
            raw: body.to_vec(),
        });
    }

    let _ = session.logout();
    Ok(messages)
}

/// Comma-separated `UID FETCH` set of the unseen UIDs not yet stored, in
/// ascending order. `None` when nothing is new.
fn new_uid_sequence(
    unseen: impl IntoIterator<Item = u32>,
    stored_uids: &HashSet<u32>,
) -> Option<String> {
    let mut uids: Vec<u32> = unseen
        .into_iter()
        .filter(|uid| !stored_uids.contains(uid))
        .collect();
    if uids.is_empty() {
        return None;
    }

    uids.sort_unstable();
    Some(
        uids.iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(","),
    )
}

fn imap_error_to_email(error: imap::Error) -> EmailError {
    EmailError::Imap(error.to_string())
}
