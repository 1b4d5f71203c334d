use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "claude-gateway")]
#[command(about = "Per-thread gateway to the claude CLI with searchable session memory", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Read `<thread> <message>` lines from stdin and relay them to the assistant.
    Serve,

    /// Run one indexing pass over pending transcripts.
    Index,

    /// Search past sessions.
    Search {
        query: String,
        #[arg(long = "top-k")]
        top_k: Option<usize>,
        #[arg(long)]
        json: bool,
    },

    /// Show memory status.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// List the persisted thread → session map.
    Sessions {
        #[arg(long)]
        json: bool,
    },
}
