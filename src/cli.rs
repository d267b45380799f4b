mod help_text;

use crate::config::Redundancy;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Protect directory trees against bit rot with recovery files
#[derive(Parser, Debug)]
#[command(name = "partree", version, about, long_about = help_text::ROOT_LONG_ABOUT)]
pub struct Cli {
    /// Change to directory before operating
    #[arg(short = 'C', value_name = "DIRECTORY", global = true)]
    pub directory: Option<PathBuf>,

    /// Increase logging verbosity (-v info, -vv debug). Takes precedence over RUST_LOG.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Set the log level explicitly. Takes precedence over RUST_LOG.
    #[arg(
        long,
        value_name = "LEVEL",
        global = true,
        conflicts_with = "verbose",
        value_parser = ["off", "error", "warn", "info", "debug", "trace"]
    )]
    pub log_level: Option<String>,

    /// Recovery engine executable
    #[arg(long, value_name = "PATH", global = true)]
    pub engine: Option<PathBuf>,

    /// Settings file [default: $PARTREE_CONFIG or ~/.config/partree.toml]
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show protection and verification state of directories
    Status {
        /// Directory to show
        #[arg(value_name = "PATH", default_value = ".")]
        path: PathBuf,

        /// Show every directory, not only protected ones
        #[arg(long)]
        all: bool,
    },

    /// Protect a directory with a recovery file
    #[command(long_about = help_text::PROTECT_LONG_ABOUT)]
    Protect {
        /// Directory to protect
        #[arg(value_name = "PATH")]
        path: PathBuf,

        /// Size of the recovery data relative to the protected data
        #[arg(long, value_name = "PERCENT")]
        redundancy: Option<Redundancy>,
    },

    /// Stop protecting a directory and delete its recovery files
    Unprotect {
        /// Directory to unprotect
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// Rebuild the recovery files of protected directories
    Recreate {
        /// Directory to rebuild recovery files for
        #[arg(value_name = "PATH", default_value = ".")]
        path: PathBuf,

        /// Size of the recovery data relative to the protected data
        #[arg(long, value_name = "PERCENT")]
        redundancy: Option<Redundancy>,
    },

    /// Verify protected directories, exit with success if nothing is damaged
    #[command(long_about = help_text::VERIFY_LONG_ABOUT)]
    Verify {
        /// Directory to verify
        #[arg(value_name = "PATH", default_value = ".")]
        path: PathBuf,
    },

    /// Repair damaged or missing files from their recovery files
    Repair {
        /// Directory to repair
        #[arg(value_name = "PATH", default_value = ".")]
        path: PathBuf,
    },

    /// Delete recovery files of directories that are no longer protected
    Clean {
        /// Directory to clean up below
        #[arg(value_name = "PATH", default_value = ".")]
        path: PathBuf,
    },

    /// List files added to protected directories after their recovery file
    NewFiles {
        /// Directory to search
        #[arg(value_name = "PATH", default_value = ".")]
        path: PathBuf,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
