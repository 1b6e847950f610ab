//! CLI command definitions.

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a structure file
    Validate {
        /// Path to the structure file
        #[arg(default_value = "cruise.yaml")]
        path: String,
    },

    /// Print the scheduling tree
    Tree {
        /// Path to the structure file
        #[arg(default_value = "cruise.yaml")]
        path: String,

        /// Print the status snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the JSON schema of structure files
    Schema,

    /// Run requests through the tree with simulated builds
    Simulate {
        /// Path to the structure file
        path: String,

        /// Projects to request, in order
        #[arg(short, long = "request", num_args = 1.., required = true)]
        requests: Vec<String>,

        /// Duration of each simulated build
        #[arg(long, default_value_t = 50)]
        build_ms: u64,

        /// Projects whose simulated builds fail
        #[arg(long)]
        fail: Vec<String>,

        /// Give up on admission after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}
