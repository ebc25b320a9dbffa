use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

mod handlers;

pub use handlers::*;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Store directory. Defaults to $EXPERTDB_BASE_PATH, then ~/.local/share/expertdb
    #[clap(long, global = true)]
    pub base_path: Option<PathBuf>,

    /// Debug logging
    #[clap(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// One `{"id", "content", "metadata"}` object per line
    Jsonl,
    /// JSON array of processed LinkedIn profiles
    Linkedin,
    /// Scholar export: `{"query", "articles", "authors"}`
    Scholar,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the HTTP API.
    Daemon {
        #[clap(long, default_value = "0.0.0.0:8080")]
        addr: String,
    },
    /// Embed and store documents from a file
    Ingest {
        file: PathBuf,

        #[clap(short, long, value_enum, default_value = "jsonl")]
        format: InputFormat,

        /// Commit a version once the batch is written
        #[clap(long, default_value = "false")]
        version: bool,

        /// Where the documents came from, recorded in the version
        #[clap(long)]
        source: Option<String>,

        /// Version message. Generated when omitted
        #[clap(short, long)]
        message: Option<String>,
    },
    /// Search the collection
    Search {
        query: String,

        /// Candidates fetched by vector search
        #[clap(long)]
        initial_k: Option<usize>,

        /// Results returned after reranking
        #[clap(short = 'k', long)]
        final_k: Option<usize>,

        /// Metadata filter as JSON, e.g. '{"years_experience": {"$gte": 5}}'
        #[clap(long)]
        filter: Option<String>,
    },
    /// List versions, newest first
    Versions {
        #[clap(short = 'n', long)]
        max_entries: Option<usize>,
    },
    /// Restore the collection to a version
    Restore { commit_id: String },
    /// Recompute credibility statistics
    RefreshStats {},
    /// Print the number of documents
    Count {},
    /// Delete every document
    Reset {
        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
    /// List the distinct values of a metadata field
    Values { field: String },
}
