use std::path::PathBuf;

use clap::{Parser, Subcommand};
use squadlink_cli::cli::{run, CliCommand, CliConfig};
use squadlink_core::models::ConversationKey;

#[derive(Parser)]
#[command(name = "squadlink")]
#[command(about = "Command-line client for squadlink chat")]
struct Cli {
    /// Pretty-print JSON output
    #[arg(long, short)]
    pretty: bool,

    /// Path to JSON config file (contains dataDir, apiBaseUrl, pushUrl, credentials)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List conversations with previews and unread counts
    Conversations,

    /// Print the message history of a conversation (marks it seen)
    History {
        /// Conversation key: dm:<user id> or team:<team id>
        key: ConversationKey,
    },

    /// Send a message
    Send {
        key: ConversationKey,
        content: String,
        /// Id of the message being replied to
        #[arg(long, short = 'r')]
        reply_to: Option<String>,
    },

    /// Edit one of your messages
    Edit {
        key: ConversationKey,
        id: String,
        content: String,
    },

    /// Delete one of your messages
    Delete { key: ConversationKey, id: String },

    /// List pinned messages
    Pins { key: ConversationKey },

    /// Pin a message
    Pin {
        key: ConversationKey,
        message_id: String,
    },

    /// Remove a pin (its author or a team captain/admin only)
    Unpin { key: ConversationKey, pin_id: String },

    /// Stay connected and print events for a conversation until Ctrl-C
    Watch { key: ConversationKey },
}

impl From<Commands> for CliCommand {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Conversations => CliCommand::ListConversations,
            Commands::History { key } => CliCommand::History { key },
            Commands::Send {
                key,
                content,
                reply_to,
            } => CliCommand::Send {
                key,
                content,
                reply_to,
            },
            Commands::Edit { key, id, content } => CliCommand::Edit { key, id, content },
            Commands::Delete { key, id } => CliCommand::Delete { key, id },
            Commands::Pins { key } => CliCommand::ListPins { key },
            Commands::Pin { key, message_id } => CliCommand::Pin { key, message_id },
            Commands::Unpin { key, pin_id } => CliCommand::Unpin { key, pin_id },
            Commands::Watch { key } => CliCommand::Watch { key },
        }
    }
}

#[tokio::main]
async fn main() {
    squadlink_core::tracing_setup::init_tracing_with_default("warn");
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match CliConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {:#}", e);
                std::process::exit(1);
            }
        },
        None => CliConfig::default(),
    };

    if let Err(e) = run(cli.command.into(), &config, cli.pretty).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
