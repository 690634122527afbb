use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// YAML config file. Environment variables override its values.
    #[clap(long, global = true, env = "SEARCH_SERVICE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the event consumer and the HTTP API
    Serve,

    /// Run only the event consumer
    Consume,

    /// Index a JSONL event file and exit
    Replay {
        /// Event file, one JSON object per line ("-" reads stdin)
        #[clap(short, long)]
        file: PathBuf,
    },

    /// Semantic search over indexed content
    Search {
        /// Free-text query
        query: String,

        /// Number of results (1-50)
        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Content related to an indexed post
    Related {
        post_id: i64,

        /// Number of results (1-20)
        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Print the stored record for a post
    Show { post_id: i64 },

    /// Create the store schema and download the model
    Init,

    /// Rebuild the similarity index
    Reindex,
}
