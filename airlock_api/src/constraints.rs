use enumflags2::bitflags;
use serde::{Deserialize, Serialize};

/// Device and app-state predicates an install request can wait on. A check
/// is satisfied when every enabled clause holds simultaneously.
#[bitflags]
#[repr(u8)]
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InstallConstraint {
    RequireDeviceIdle,
    RequireAppNotForeground,
    RequireAppNotInteracting,
    RequireAppNotTopVisible,
    RequireNotInCall,
}

/// Outcome of a constraint check. Delivered exactly once per request,
/// either when the constraints are first observed satisfied or at the
/// request's deadline with whatever held at that moment.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConstraintsResult {
    pub satisfied: bool,
}
