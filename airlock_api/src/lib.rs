pub mod constraints;
pub mod error;
pub mod session;

/// Identifier of a staged session. Allocated once per install request and
/// unique for the lifetime of the device.
pub type SessionId = u32;

/// Identifier of a rollback prepared by the rollback manager for a staged
/// install.
pub type RollbackId = i64;
