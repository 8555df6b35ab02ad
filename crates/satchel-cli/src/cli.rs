use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "satchel")]
#[command(about = "Study records on this device, synced through your Supabase project")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create or replace a record
    Put {
        /// Collection name (e.g. decks, cards)
        collection: String,
        /// Record ID
        id: String,
        /// Record body as a JSON object
        json: String,
    },
    /// Delete a record
    #[command(alias = "rm")]
    Delete {
        /// Collection name
        collection: String,
        /// Record ID
        id: String,
    },
    /// List records
    #[command(alias = "ls")]
    List {
        /// Only show this collection
        collection: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage the device-local API key (never synced)
    ApiKey {
        #[command(subcommand)]
        command: ApiKeyCommands,
    },
    /// Run one sync pass now
    Sync {
        /// Compare timestamps even when neither side looks changed
        #[arg(long)]
        force: bool,
    },
    /// Show sync configuration, identity, and bookkeeping
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the background sync engine until Ctrl-C
    Watch {
        /// Sync a copy of the local data against an in-memory backend
        #[arg(long)]
        ephemeral: bool,
    },
    /// Authenticate with Supabase
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[derive(Subcommand)]
pub enum ApiKeyCommands {
    /// Store the API key on this device
    Set {
        /// API key value
        key: String,
    },
    /// Show the stored API key (masked)
    Show,
    /// Remove the stored API key
    Clear,
}

#[derive(Subcommand)]
pub enum AuthCommands {
    /// Sign in with email/password or an OAuth provider and store the session in the keychain
    Login {
        /// Supabase account email
        #[arg(long, value_name = "EMAIL", requires = "password", conflicts_with = "oauth")]
        email: Option<String>,
        /// Supabase account password
        #[arg(long, value_name = "PASSWORD", requires = "email")]
        password: Option<String>,
        /// OAuth provider name (e.g. github, google)
        #[arg(long, value_name = "PROVIDER")]
        oauth: Option<String>,
        /// Print the OAuth URL instead of opening a browser
        #[arg(long, requires = "oauth")]
        no_browser: bool,
    },
    /// Show auth status
    Status,
    /// Sign out and clear the stored session
    Logout,
}
