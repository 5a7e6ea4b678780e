use std::path::PathBuf;

use enumflags2::{bitflags, BitFlags};
use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;

use crate::{RollbackId, SessionId};

fn bitflags_is_empty(flags: &BitFlags<InstallFlag>) -> bool {
    flags.is_empty()
}

/// Install flags carried by a session. Mirrors the flag word of the install
/// request that created the session.
#[bitflags]
#[repr(u8)]
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InstallFlag {
    /// The session takes effect only after a reboot.
    Staged,
    /// The payload is a container-format system module, activated by the
    /// module daemon rather than the ordinary installer.
    Module,
    /// A rollback must be prepared before the session is applied.
    EnableRollback,
    /// Skip archive verification. Set internally on the re-materialized
    /// install session created while applying a staged session.
    DisableVerification,
    /// Permit installing a version older than the active one.
    AllowDowngrade,
    /// Marks an installer session that was re-materialized from a staged
    /// session during boot-time apply.
    StagedInstall,
}

/// Why the install was requested.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InstallReason {
    #[default]
    Normal,
    Rollback,
}

/// Lifecycle state of a staged session.
///
/// `Applied` and `Failed` are terminal. Destruction is tracked separately on
/// the session, since a session can be destroyed from any non-terminal state.
#[derive(
    Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq, IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SessionState {
    /// Created but not yet committed.
    #[default]
    Created,
    /// Committed; pre-reboot verification in progress.
    Verifying,
    /// Verified and staged; will be applied on the next boot.
    Ready,
    /// Applied successfully after a reboot.
    Applied,
    /// Rejected during verification or apply.
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Applied | SessionState::Failed)
    }
}

/// Classification of a failed session, surfaced to the installer that owns
/// the session and recorded alongside the failure message.
#[derive(
    Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FailureCode {
    /// Pre-reboot verification rejected the session.
    VerificationFailed,
    /// Boot-time apply could not take effect.
    ActivationFailed,
    /// Another staged session owning the same package was preempted by a
    /// rollback.
    Conflict,
    /// Another staged session already covers the same package, or multiple
    /// root sessions were staged without checkpoint support.
    OtherStagedInProgress,
    /// Storage or checkpoint queries failed; last-resort classification.
    Unknown,
    /// The session was committed without a package name.
    InvalidArchive,
}

/// Failure details attached to a session in the `Failed` state. The message
/// is always non-empty.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SessionFailure {
    pub code: FailureCode,
    pub message: String,
}

/// The immutable-ish description of one staged install request. Cloning
/// deep-copies all strings and the flag set.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionParams {
    /// Package name; unknown until the payload has been parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,

    #[serde(default, skip_serializing_if = "bitflags_is_empty")]
    pub flags: BitFlags<InstallFlag>,

    #[serde(default)]
    pub reason: InstallReason,

    /// When set, the currently-installed version must match exactly for the
    /// install to proceed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_installed_version: Option<i64>,

    /// Identity of the installer that created the session.
    #[serde(default)]
    pub installer: String,

    /// User the install targets.
    #[serde(default)]
    pub user_id: u32,

    /// Per-session directory holding the staged archives and modules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,

    /// Parent session, for children of a multi-package session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<SessionId>,
}

/// One staged session as owned by the session store. Children are referenced
/// by id and resolved through the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StagedSession {
    pub id: SessionId,

    pub params: SessionParams,

    /// Ordered, duplicate-free ids of child sessions. Child lists form a
    /// tree of depth one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SessionId>,

    pub state: SessionState,

    /// Set when the session has been abandoned; cleanup then aborts it. Can
    /// be observed from any non-terminal state.
    #[serde(default)]
    pub destroyed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<SessionFailure>,

    /// Rollback id resolved during verification, when rollback is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_id: Option<RollbackId>,
}

impl StagedSession {
    pub fn new(id: SessionId, params: SessionParams) -> Self {
        Self {
            id,
            params,
            children: Vec::new(),
            state: SessionState::Created,
            destroyed: false,
            failure: None,
            rollback_id: None,
        }
    }

    /// Whether this session itself carries a module payload.
    pub fn is_module_bearing(&self) -> bool {
        self.params.flags.contains(InstallFlag::Module)
    }

    /// Whether this session is a multi-package wrapper.
    pub fn is_multi(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn parent(&self) -> Option<SessionId> {
        self.params.parent
    }

    /// Record a failure and move to the `Failed` state. An empty message is
    /// replaced with the failure code's name so that failed sessions always
    /// carry a reason.
    pub fn set_failed(&mut self, code: FailureCode, message: impl Into<String>) {
        let mut message = message.into();
        if message.is_empty() {
            message = <&str>::from(&code).to_owned();
        }
        self.state = SessionState::Failed;
        self.failure = Some(SessionFailure { code, message });
    }

    pub fn failure_code(&self) -> Option<FailureCode> {
        self.failure.as_ref().map(|f| f.code)
    }
}

/// Derived shape of a session, computed by scanning its children.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionKind {
    ArchiveOnly,
    ModuleOnly,
    Mixed,
    /// A multi-package wrapper with no children recorded yet.
    Parent,
}

/// Consistent snapshot of a root session together with its children, taken
/// under the session store lock.
#[derive(Clone, Debug)]
pub struct SessionTree {
    pub root: StagedSession,
    pub children: Vec<StagedSession>,
}

impl SessionTree {
    pub fn leaf(root: StagedSession) -> Self {
        Self {
            root,
            children: Vec::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.root.id
    }

    /// True if the root or any child carries a module payload.
    pub fn contains_module(&self) -> bool {
        if self.root.is_multi() {
            self.children.iter().any(|c| c.is_module_bearing())
        } else {
            self.root.is_module_bearing()
        }
    }

    /// True if the root or any child carries an ordinary archive payload.
    pub fn contains_archive(&self) -> bool {
        if self.root.is_multi() {
            self.children.iter().any(|c| !c.is_module_bearing())
        } else {
            !self.root.is_module_bearing()
        }
    }

    pub fn kind(&self) -> SessionKind {
        if !self.root.is_multi() {
            return if self.root.is_module_bearing() {
                SessionKind::ModuleOnly
            } else {
                SessionKind::ArchiveOnly
            };
        }
        match (self.contains_module(), self.contains_archive()) {
            (true, true) => SessionKind::Mixed,
            (true, false) => SessionKind::ModuleOnly,
            (false, true) => SessionKind::ArchiveOnly,
            (false, false) => SessionKind::Parent,
        }
    }

    pub fn module_children(&self) -> Vec<&StagedSession> {
        if self.root.is_multi() {
            self.children
                .iter()
                .filter(|c| c.is_module_bearing())
                .collect()
        } else if self.root.is_module_bearing() {
            vec![&self.root]
        } else {
            Vec::new()
        }
    }

    pub fn archive_children(&self) -> Vec<&StagedSession> {
        if self.root.is_multi() {
            self.children
                .iter()
                .filter(|c| !c.is_module_bearing())
                .collect()
        } else if !self.root.is_module_bearing() {
            vec![&self.root]
        } else {
            Vec::new()
        }
    }
}
