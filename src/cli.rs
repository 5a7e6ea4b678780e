use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
};

use clap::{Parser, Subcommand};
use log::LevelFilter;

use crate::AIRLOCK_VERSION;

#[derive(Parser, Debug)]
#[clap(version = AIRLOCK_VERSION)]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Info)]
    pub verbosity: LevelFilter,

    /// Path to the local service configuration
    #[clap(global = true, short, long, default_value = "/etc/airlock/config.yaml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Query the persisted staging state
    #[clap(name = "get")]
    Get {
        /// What data to retrieve
        #[clap(default_value = "sessions")]
        kind: GetKind,

        /// Path to save the resulting output
        #[clap(short, long)]
        outfile: Option<PathBuf>,
    },

    /// Validate a session parameters file
    Validate {
        /// Path to a session parameters file
        #[clap(index = 1)]
        params: PathBuf,
    },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Get { .. } => "get",
            Commands::Validate { .. } => "validate",
        }
    }
}

impl Display for Commands {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.name())
    }
}

#[derive(clap::ValueEnum, Copy, Clone, Debug, Eq, PartialEq)]
pub enum GetKind {
    /// Every persisted session record
    Sessions,
    /// The failure reason recorded by the last boot, if any
    Journal,
}
