use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Error};
use clap::Parser;
use log::info;

use airlock::{
    api::session::{InstallFlag, SessionParams},
    cli::{Cli, Commands, GetKind},
    config::ServiceConfig,
    datastore::Datastore,
    journal::FailureJournal,
    platform::SessionRecorder,
};

fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    let config = ServiceConfig::load(&cli.config)
        .map_err(|e| e.unstructured("Failed to load configuration"))?;
    airlock::logging::init(cli.verbosity, config.background_log_path.as_deref());

    info!("Running command '{}'", cli.command);
    match cli.command {
        Commands::Get { kind, outfile } => {
            let output = match kind {
                GetKind::Sessions => {
                    let datastore = Datastore::open(&config.datastore_path())
                        .context("Failed to open session datastore")?;
                    let sessions = datastore
                        .load_all()
                        .context("Failed to load persisted sessions")?;
                    serde_yaml::to_string(&sessions)
                        .context("Failed to serialize session records")?
                }
                GetKind::Journal => FailureJournal::new(config.journal_path())
                    .read()
                    .unwrap_or_else(|| "no failure recorded".to_owned()),
            };
            match outfile {
                Some(path) => fs::write(&path, output)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => println!("{output}"),
            }
        }
        Commands::Validate { params } => {
            validate_params(&params)?;
            println!("Session parameters in {} are valid", params.display());
        }
    }
    Ok(())
}

fn validate_params(path: &Path) -> Result<(), Error> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let params: SessionParams =
        serde_yaml::from_str(&contents).context("Failed to parse session parameters")?;

    if !params.flags.contains(InstallFlag::Staged) {
        bail!("Session parameters do not request a staged install");
    }
    if params.package_name.is_none() && params.parent.is_none() {
        bail!("A non-child session needs a package name to commit");
    }
    if let Some(staging_dir) = &params.staging_dir {
        if !staging_dir.is_dir() {
            bail!("Staging directory {} does not exist", staging_dir.display());
        }
    }
    Ok(())
}
