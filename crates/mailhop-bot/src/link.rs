use crate::{LinkSession, LinkStep};
use mailhop_core::{Account, Provider, ServerCredentials};
use uuid::Uuid;

pub const LINK_START_PROMPT: &str = "Let's link your IMAP account.\n\nPlease send your email address:";
pub const SESSION_EXPIRED: &str = "Session expired. Please start over with /link";

/// Result of feeding one chat answer into a link session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAdvance {
    /// The answer was stored and the session moved on.
    Next {
        session: LinkSession,
        prompt: &'static str,
    },
    /// The answer was not usable; the session stays on its step.
    Rejected { prompt: &'static str },
    /// The password arrived and every earlier answer is present.
    Complete(LinkDetails),
    /// The password arrived but earlier answers are missing.
    Incomplete,
}

#[derive(Clone, PartialEq, Eq)]
pub struct LinkDetails {
    pub email: String,
    pub imap_server: String,
    pub imap_port: u16,
    pub imap_username: String,
    pub password: String,
}

impl std::fmt::Debug for LinkDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkDetails")
            .field("email", &self.email)
            .field("imap_server", &self.imap_server)
            .field("imap_port", &self.imap_port)
            .field("imap_username", &self.imap_username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

fn question(step: LinkStep) -> &'static str {
    match step {
        LinkStep::Email => "Please send your email address:",
        LinkStep::ImapServer => "Enter your IMAP server (e.g., imap.qq.com):",
        LinkStep::ImapPort => "Enter IMAP port (usually 993):",
        LinkStep::ImapUsername => "Enter your IMAP username (usually your email address):",
        LinkStep::ImapPassword => "Enter your IMAP password:",
    }
}

/// Applies `answer` to the current step. Field answers are trimmed; the
/// password is taken verbatim.
pub fn advance(session: &LinkSession, answer: &str) -> LinkAdvance {
    let trimmed = answer.trim();
    if trimmed.is_empty() {
        return LinkAdvance::Rejected {
            prompt: question(session.step),
        };
    }

    match session.step {
        LinkStep::Email => answer_email(session, trimmed),
        LinkStep::ImapServer => answer_imap_server(session, trimmed),
        LinkStep::ImapPort => answer_imap_port(session, trimmed),
        LinkStep::ImapUsername => answer_imap_username(session, trimmed),
        LinkStep::ImapPassword => answer_imap_password(session, answer),
    }
}

fn answer_email(session: &LinkSession, email: &str) -> LinkAdvance {
    LinkAdvance::Next {
        session: LinkSession {
            step: LinkStep::ImapServer,
            email: Some(email.to_string()),
            ..session.clone()
        },
        prompt: "Email address saved.\n\nNow enter your IMAP server (e.g., imap.qq.com):",
    }
}

fn answer_imap_server(session: &LinkSession, server: &str) -> LinkAdvance {
    LinkAdvance::Next {
        session: LinkSession {
            step: LinkStep::ImapPort,
            imap_server: Some(server.to_string()),
            ..session.clone()
        },
        prompt: "IMAP server saved.\n\nEnter IMAP port (usually 993):",
    }
}

fn answer_imap_port(session: &LinkSession, port: &str) -> LinkAdvance {
    let Some(port) = port.parse::<u16>().ok().filter(|port| *port != 0) else {
        return LinkAdvance::Rejected {
            prompt: "Invalid port. Enter a number between 1 and 65535 (usually 993):",
        };
    };

    LinkAdvance::Next {
        session: LinkSession {
            step: LinkStep::ImapUsername,
            imap_port: Some(port),
            ..session.clone()
        },
        prompt: "Port saved.\n\nEnter your IMAP username (usually your email address):",
    }
}

fn answer_imap_username(session: &LinkSession, username: &str) -> LinkAdvance {
    LinkAdvance::Next {
        session: LinkSession {
            step: LinkStep::ImapPassword,
            imap_username: Some(username.to_string()),
            ..session.clone()
        },
        prompt: "Username saved.\n\nEnter your IMAP password:",
    }
}

fn answer_imap_password(session: &LinkSession, password: &str) -> LinkAdvance {
    match (
        &session.email,
        &session.imap_server,
        session.imap_port,
        &session.imap_username,
    ) {
        (Some(email), Some(imap_server), Some(imap_port), Some(imap_username)) => {
            LinkAdvance::Complete(LinkDetails {
                email: email.clone(),
                imap_server: imap_server.clone(),
                imap_port,
                imap_username: imap_username.clone(),
                password: password.to_string(),
            })
        }
        _ => LinkAdvance::Incomplete,
    }
}

/// Submission port matching an IMAP port: implicit TLS pairs with 465,
/// plain IMAP with 587, anything else is assumed to be shared.
pub fn smtp_port_for(imap_port: u16) -> u16 {
    match imap_port {
        993 => 465,
        143 => 587,
        other => other,
    }
}

/// IMAP account for a finished link. SMTP reuses the IMAP host, username
/// and password.
pub fn imap_account(user_id: Uuid, details: &LinkDetails, password_encrypted: String) -> Account {
    let mut account = Account::new(user_id, Provider::Imap, details.email.clone());
    account.credentials.imap = Some(ServerCredentials {
        host: details.imap_server.clone(),
        port: details.imap_port,
        username: details.imap_username.clone(),
        password_encrypted: password_encrypted.clone(),
    });
    account.credentials.smtp = Some(ServerCredentials {
        host: details.imap_server.clone(),
        port: smtp_port_for(details.imap_port),
        username: details.imap_username.clone(),
        password_encrypted,
    });
    account
}
