use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mailhop-daemon", version, about = "Mail to chat notification bridge")]
pub(crate) struct Cli {
    /// Config file; defaults to the platform config directory.
    #[arg(short, long, global = true)]
    pub(crate) config: Option<PathBuf>,
    #[command(subcommand)]
    pub(crate) command: Role,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Watch linked mailboxes and queue new mail.
    Fetcher,
    /// Deliver queued mail as chat notifications.
    Notifier,
    /// Serve chat commands and account linking.
    Bot,
    /// Run fetcher, notifier and bot in one process.
    All,
}

impl Role {
    pub(crate) fn runs_fetcher(self) -> bool {
        matches!(self, Self::Fetcher | Self::All)
    }

    pub(crate) fn runs_notifier(self) -> bool {
        matches!(self, Self::Notifier | Self::All)
    }

    pub(crate) fn runs_bot(self) -> bool {
        matches!(self, Self::Bot | Self::All)
    }
}
