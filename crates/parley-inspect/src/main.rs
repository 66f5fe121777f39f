//! # parley-inspect
//!
//! Read-only command line view of a Parley database.
//!
//! The database location and every other setting come from the `PARLEY_*`
//! environment variables (see `SyncConfig`). Output is JSON on stdout.

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use parley_shared::{ConversationId, UserId};
use parley_sync::telemetry::{init_tracing, DEFAULT_DIRECTIVES};
use parley_sync::SyncConfig;

/// Dump conversation summaries, messages or cached contacts as JSON.
#[derive(Parser, Debug)]
#[command(name = "parley-inspect", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Conversation list as seen by a user.
    Summaries {
        /// User whose read cursors, pins and mutes apply.
        user: String,
    },
    /// Messages of one conversation in display order.
    Messages {
        conversation: String,
        /// Only the newest LIMIT messages.
        limit: Option<u32>,
    },
    /// Cached address book contacts.
    Contacts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(DEFAULT_DIRECTIVES);

    let config = SyncConfig::from_env();
    info!(path = ?config.database_path, "Opening store");
    let store = config.open_store().context("failed to open the Parley database")?;

    let output = match cli.command {
        Command::Summaries { user } => {
            let summaries = store
                .conversation_summaries(&UserId::from(user), Utc::now())
                .await?;
            serde_json::to_string_pretty(&summaries)?
        }
        Command::Messages {
            conversation,
            limit,
        } => {
            let messages = store
                .query_messages(&ConversationId::from(conversation), limit)
                .await?;
            serde_json::to_string_pretty(&messages)?
        }
        Command::Contacts => {
            let contacts = store.with_db(|db| db.list_contacts()).await?;
            serde_json::to_string_pretty(&contacts)?
        }
    };

    println!("{output}");
    Ok(())
}
