use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "converge")]
#[command(version)]
#[command(about = "Deploy declared resources in dependency order", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: ~/.config/converge/config.toml)
    #[arg(long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Parse and validate a version file
    Validate {
        /// Version file (JSON)
        file: PathBuf,
    },

    /// Apply a version and deploy until idle
    Deploy(DeployArgs),

    /// Report what a version would change without deploying
    Dryrun {
        /// Version file (JSON)
        #[arg(required_unless_present = "model_version")]
        file: Option<PathBuf>,

        /// Dry run a version recorded by an earlier deploy instead
        #[arg(long, value_name = "N", conflicts_with = "file")]
        model_version: Option<u64>,
    },

    /// Show recorded actions of a resource
    History {
        /// Resource id, e.g. std::File[host1,path=/etc/motd]
        resource: String,

        /// Number of actions to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show recorded resource status
    Status {
        /// Show status and facts of a single resource
        resource: Option<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser)]
pub struct DeployArgs {
    /// Version file (JSON)
    pub file: PathBuf,

    /// Repair every resource, compliant or not
    #[arg(long)]
    pub repair: bool,

    /// Give up waiting after this many seconds
    #[arg(long, default_value = "3600")]
    pub timeout: u64,

    /// Collect facts of every resource after deploying
    #[arg(long)]
    pub facts: bool,
}
