use std::fmt::{Debug, Write};
use std::{borrow::Cow, panic::Location};

use serde::{ser::SerializeStruct, Serialize};
use strum_macros::IntoStaticStr;

use crate::SessionId;

/// The service failed to initialize.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InitializationError {
    #[error("Failed to load local configuration")]
    LoadLocalConfig,
    #[error("Failed to parse local configuration")]
    ParseLocalConfig,
    #[error("Failed to load session datastore from '{path}'")]
    DatastoreLoad { path: String },
    #[error("Failed to restore persisted sessions")]
    RestoreSessions,
    #[error("Failed to read the failure-reason journal")]
    JournalRead,
}

/// A session could not be created or committed. These surface synchronously
/// to the caller of the session API.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum CommitError {
    #[error("Session {id} already exists")]
    DuplicateSessionId { id: SessionId },
    #[error("Session {id} does not exist")]
    SessionNotFound { id: SessionId },
    #[error("Parent session {parent} of session {id} does not exist")]
    ParentNotFound { id: SessionId, parent: SessionId },
    #[error("Session {parent} is itself a child; child lists form a tree of depth one")]
    GrandchildSession { parent: SessionId },
    #[error("Session {id} cannot be committed from state '{state}'")]
    NotCommittable { id: SessionId, state: &'static str },
    #[error("Session {id} has no package name")]
    PackageNameMissing { id: SessionId },
    #[error("Package '{package}' is already covered by staged session {other}")]
    OtherStagedInProgress { package: String, other: SessionId },
    #[error("Cannot stage multiple root sessions without checkpoint support")]
    MultipleStagedRoots,
    #[error("Session {id} must be destroyed before it is abandoned")]
    NotDestroyed { id: SessionId },
}

/// A constraint-check request was malformed. Unsatisfied constraints are not
/// errors; they complete the request with `satisfied: false`.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ConstraintError {
    #[error("Constraint check requires at least one package")]
    EmptyPackageList,
    #[error("Constraint timeout cannot be negative")]
    NegativeTimeout,
}

/// A collaborator call failed. The operation name identifies the call site.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformError {
    #[error("Module daemon call '{op}' failed")]
    ModuleDaemon { op: &'static str },
    #[error("Storage call '{op}' failed")]
    Storage { op: &'static str },
    #[error("Rollback manager call '{op}' failed")]
    RollbackManager { op: &'static str },
    #[error("Archive installer call '{op}' failed")]
    Installer { op: &'static str },
    #[error("Timed out waiting for archive commit of session {id}")]
    CommitTimeout { id: SessionId },
    #[error("Failed to parse signature of '{path}'")]
    SignatureParse { path: String },
    #[error("Package registry call '{op}' failed")]
    PackageRegistry { op: &'static str },
}

#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum DatastoreError {
    #[error("Failed to create datastore directory")]
    CreateDatastoreDirectory,
    #[error("Failed to open datastore")]
    OpenDatastore,
    #[error("Failed to initialize datastore")]
    DatastoreInit,
    #[error("Failed to serialize session record")]
    SerializeSession,
    #[error("Failed to write to datastore")]
    DatastoreWrite,
    #[error("Failed to allocate a session id")]
    AllocateSessionId,
    #[error("Attempted to write to closed datastore")]
    DatastoreClosed,
}

#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InternalError {
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

/// Each variant of `ErrorKind` corresponds to a different category of error.
/// The categories are user-meaningful and identify who needs to act: the
/// caller, the platform, or this service.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    /// The service failed to initialize.
    #[error(transparent)]
    Initialization(#[from] InitializationError),

    /// The caller submitted a session that cannot be created or committed.
    #[error(transparent)]
    Commit(#[from] CommitError),

    /// The caller submitted a malformed constraint check.
    #[error(transparent)]
    Constraint(#[from] ConstraintError),

    /// A collaborating service failed.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// Session persistence failed.
    #[error(transparent)]
    Datastore(#[from] DatastoreError),

    /// A bug was encountered. This indicates a problem with this service.
    #[error(transparent)]
    Internal(#[from] InternalError),
}

#[derive(Debug)]
struct AirlockErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

pub struct AirlockError(Box<AirlockErrorInner>);
impl AirlockError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        AirlockError(Box::new(AirlockErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn internal(message: &'static str) -> Self {
        Self::new(InternalError::Internal(message))
    }

    pub fn unstructured(self, context: impl Into<Cow<'static, str>>) -> anyhow::Error {
        match self.0.source {
            Some(source) => source.context(self.0.kind).context(context.into()),
            None => anyhow::Error::from(self.0.kind).context(context.into()),
        }
    }

    /// Returns a reference to the inner ErrorKind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }
}

pub trait ReportError<T, K> {
    /// Convert this error into a structured AirlockError.
    fn structured(self, kind: K) -> Result<T, AirlockError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, AirlockError> {
        match self {
            Some(t) => Ok(t),
            None => Err(AirlockError(Box::new(AirlockErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: None,
                context: Vec::new(),
            }))),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, AirlockError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(AirlockError(Box::new(AirlockErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: Some(e.into()),
                context: Vec::new(),
            }))),
        }
    }
}

pub trait AirlockResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, AirlockError>;

    /// Convert the error into an unstructured error.
    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error>;
}
impl<T> AirlockResultExt<T> for Result<T, AirlockError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, AirlockError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }

    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error> {
        self.map_err(|e| e.unstructured(context))
    }
}

impl Serialize for AirlockError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("airlock-error", 5)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        match self.0.kind {
            ErrorKind::Initialization(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Commit(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Constraint(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Platform(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Datastore(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Internal(ref e) => state.serialize_field("error", e)?,
        }
        state.serialize_field("category", <&str>::from(&self.0.kind))?;
        state.serialize_field(
            "location",
            &format!("{}:{}", self.0.location.file(), self.0.location.line()),
        )?;
        match self.0.source {
            Some(ref e) => state.serialize_field("cause", &Some(format!("{:?}", e)))?,
            None => state.serialize_field("cause", &None::<String>)?,
        }
        state.end()
    }
}

impl Debug for AirlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                for (j, line) in context.split('\n').enumerate() {
                    if j == 0 {
                        write!(f, "{: >5}: ", i)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                writeln!(f, " at {}:{}", location.file(), location.line())?;
            }
        }

        if let Some(ref source) = self.0.source {
            writeln!(f, "\n\nCaused by:")?;
            let mut index = 0;
            let mut source: Option<&dyn std::error::Error> = Some(source.as_ref());
            while let Some(e) = source {
                for (i, line) in e.to_string().split('\n').enumerate() {
                    if i == 0 {
                        write!(f, "{: >5}: ", index)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                f.write_char('\n')?;
                source = e.source();
                index += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use serde_yaml::Value;

    use super::*;

    #[test]
    fn test_error_serialize() {
        let e = AirlockError(Box::new(AirlockErrorInner {
            kind: ErrorKind::Commit(CommitError::PackageNameMissing { id: 42 }),
            location: Location::caller(),
            source: Some(
                std::fs::read("/non-existent-file")
                    .context("failed to read file")
                    .unwrap_err(),
            ),
            context: Vec::new(),
        }));
        match serde_yaml::to_value(e).unwrap() {
            Value::Mapping(m) => {
                assert_eq!(m.len(), 5);
                assert_eq!(m["category"], Value::String("commit".into()));
                assert!(matches!(m["cause"], Value::String(_)));
                assert_eq!(
                    m["message"],
                    Value::String("Session 42 has no package name".into())
                );
                match m["location"] {
                    Value::String(ref s) => assert!(s.contains("error.rs:")),
                    _ => panic!("location isn't string"),
                }
            }
            _ => panic!("value isn't mapping"),
        }
    }

    #[test]
    fn test_error_debug() {
        let error = Err::<(), _>(anyhow::anyhow!("z"))
            .context("x\ny")
            .structured(InternalError::Internal("w"))
            .unwrap_err();
        assert_eq!(
            format!("{:?}", error),
            format!(
                "Internal error: w at {}:{}\n\nCaused by:\n    0: x\n       y\n    1: z\n",
                error.0.location.file(),
                error.0.location.line(),
            ),
        );
    }

    #[test]
    fn test_commit_error_kind_roundtrip() {
        let error = AirlockError::new(CommitError::OtherStagedInProgress {
            package: "com.example.net".into(),
            other: 9,
        });
        assert!(matches!(
            error.kind(),
            ErrorKind::Commit(CommitError::OtherStagedInProgress { other: 9, .. })
        ));
    }
}
