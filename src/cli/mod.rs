use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

use crate::target::{TargetRequest, DEFAULT_DB_ALIAS};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// File or directory to back up.
    ///
    /// Without a path and without `--db` the targets of the config file run.
    #[arg(conflicts_with = "db")]
    pub path: Option<PathBuf>,

    /// Folder the artifacts and the manifest are written to. Defaults to the
    /// current working directory.
    #[arg(long, short = 'd', env = "BACKUP_DESTINATION")]
    pub destination: Option<PathBuf>,

    /// Dump the configured database instance.
    #[arg(long, requires = "user")]
    pub db: bool,

    /// Database user. The password is read from `$BACKUP_DB_PASSWORD`.
    #[arg(long, short = 'u')]
    pub user: Option<String>,

    /// Configured database instance to dump, `default` if omitted.
    #[arg(long, requires = "db")]
    pub alias: Option<String>,

    /// Configuration file. Created with defaults if missing.
    #[arg(long, short = 'c', default_value = "backup.toml")]
    pub config: PathBuf,

    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Print the last successful backup of each target instead of running.
    #[arg(long)]
    pub status: bool,
}

impl Cli {
    /// Requests named on the command line; empty if the configured
    /// targets should run.
    pub fn requests(&self) -> Vec<TargetRequest> {
        if self.db {
            vec![TargetRequest::database(
                self.alias.as_deref().unwrap_or(DEFAULT_DB_ALIAS),
            )]
        } else if let Some(path) = &self.path {
            vec![TargetRequest::path(path)]
        } else {
            Vec::new()
        }
    }
}
