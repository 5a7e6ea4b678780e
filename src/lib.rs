//! Staged, reboot-spanning package installation. Sessions are verified
//! before the reboot, activated by the privileged module daemon across it,
//! and reconciled against the filesystem checkpoint when the device comes
//! back up.

use const_format::concatcp;

pub mod cli;
pub mod config;
pub mod constraints;
pub mod datastore;
pub mod journal;
pub mod logging;
pub mod platform;
pub mod progress;
pub mod service;

mod archive;
mod conflict;
mod reconcile;
mod store;
mod verify;

pub use airlock_api as api;
pub use service::StagedInstallService;

pub const AIRLOCK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// State the service owns across reboots.
pub const AIRLOCK_STATE_DIR: &str = "/data/system/airlock";

pub const AIRLOCK_DATASTORE_PATH: &str = concatcp!(AIRLOCK_STATE_DIR, "/sessions.sqlite");

/// The failure-reason journal must live on a partition the checkpoint does
/// not cover, so it survives the revert reboot.
pub const AIRLOCK_JOURNAL_PATH: &str = "/metadata/airlock/failure";
