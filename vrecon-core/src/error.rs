//! Error types for the hypervisor client layer and the reconciler.

use thiserror::Error;

use crate::types::{Identity, ObjectKind};

/// Errors reported by a [`HypervisorClient`](crate::traits::HypervisorClient).
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// Failed to connect to the hypervisor, or the connection dropped.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// No object with this identity exists.
    #[error("{kind} not found: {id}")]
    NotFound { kind: ObjectKind, id: String },

    /// The object is in a state that does not allow the operation
    /// (e.g. shutting down a domain that is already off).
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// The hypervisor rejected the request (bad descriptor, name clash, ...).
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The handle was already released or never issued by this client.
    #[error("Unknown handle {0}")]
    UnknownHandle(u64),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HypervisorError {
    /// Whether this error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_))
    }
}

/// Result type alias for hypervisor client operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;

/// A descriptor that does not satisfy its kind's schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Malformed {kind} descriptor: {reason}")]
    Malformed { kind: ObjectKind, reason: String },

    #[error("{kind} descriptor is empty")]
    Empty { kind: ObjectKind },

    #[error("Expected <{expected}> root element, found <{found}>")]
    WrongRoot { expected: ObjectKind, found: String },

    #[error("Invalid {kind} uuid '{value}': {reason}")]
    InvalidIdentity {
        kind: ObjectKind,
        value: String,
        reason: String,
    },

    #[error("{kind} descriptor declares {count} <uuid> elements")]
    DuplicateIdentity { kind: ObjectKind, count: usize },
}

impl ParseError {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Malformed { kind, .. }
            | Self::Empty { kind }
            | Self::InvalidIdentity { kind, .. }
            | Self::DuplicateIdentity { kind, .. } => *kind,
            Self::WrongRoot { expected, .. } => *expected,
        }
    }
}

/// Categorized failure of a reconcile operation.
///
/// Every variant that involves the hypervisor carries the object kind, the
/// identity when one is known, and the underlying client error.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The descriptor failed validation. No hypervisor call was made.
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Failed to define {kind}: {source}")]
    Define {
        kind: ObjectKind,
        #[source]
        source: HypervisorError,
    },

    #[error("Failed to redefine {kind} {identity}: {source}")]
    Redefine {
        kind: ObjectKind,
        identity: Identity,
        #[source]
        source: HypervisorError,
    },

    /// Definition succeeded but activation failed. The object exists under
    /// `identity` and the caller decides whether to delete it.
    #[error("Failed to start {kind} {identity}: {source}")]
    Start {
        kind: ObjectKind,
        identity: Identity,
        #[source]
        source: HypervisorError,
    },

    #[error("Failed to signal shutdown to {kind} {identity}: {source}")]
    Signal {
        kind: ObjectKind,
        identity: Identity,
        #[source]
        source: HypervisorError,
    },

    #[error("Failed to destroy {kind} {identity}: {source}")]
    Destroy {
        kind: ObjectKind,
        identity: Identity,
        #[source]
        source: HypervisorError,
    },

    #[error("Failed to undefine {kind} {identity}: {source}")]
    Undefine {
        kind: ObjectKind,
        identity: Identity,
        #[source]
        source: HypervisorError,
    },

    #[error("{kind} {identity} not found")]
    NotFound { kind: ObjectKind, identity: Identity },

    #[error("Failed to look up {kind} {identity}: {source}")]
    Lookup {
        kind: ObjectKind,
        identity: Identity,
        #[source]
        source: HypervisorError,
    },

    #[error("Failed to query {kind} {identity}: {source}")]
    Query {
        kind: ObjectKind,
        identity: Identity,
        #[source]
        source: HypervisorError,
    },
}

impl ReconcileError {
    /// The kind of object the failed operation targeted.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Parse(e) => e.kind(),
            Self::Define { kind, .. }
            | Self::Redefine { kind, .. }
            | Self::Start { kind, .. }
            | Self::Signal { kind, .. }
            | Self::Destroy { kind, .. }
            | Self::Undefine { kind, .. }
            | Self::NotFound { kind, .. }
            | Self::Lookup { kind, .. }
            | Self::Query { kind, .. } => *kind,
        }
    }

    /// The identity of the object, if the operation got far enough to know it.
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Parse(_) | Self::Define { .. } => None,
            Self::Redefine { identity, .. }
            | Self::Start { identity, .. }
            | Self::Signal { identity, .. }
            | Self::Destroy { identity, .. }
            | Self::Undefine { identity, .. }
            | Self::NotFound { identity, .. }
            | Self::Lookup { identity, .. }
            | Self::Query { identity, .. } => Some(identity),
        }
    }

    /// The hypervisor error underneath, if any.
    pub fn hypervisor_error(&self) -> Option<&HypervisorError> {
        match self {
            Self::Parse(_) | Self::NotFound { .. } => None,
            Self::Define { source, .. }
            | Self::Redefine { source, .. }
            | Self::Start { source, .. }
            | Self::Signal { source, .. }
            | Self::Destroy { source, .. }
            | Self::Undefine { source, .. }
            | Self::Lookup { source, .. }
            | Self::Query { source, .. } => Some(source),
        }
    }

    /// Whether the caller may retry the operation unchanged.
    ///
    /// Only connection-level failures qualify; rejections and parse errors
    /// will fail the same way again.
    pub fn is_transient(&self) -> bool {
        self.hypervisor_error()
            .map(HypervisorError::is_transient)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let identity = Identity::generate();

        let err = ReconcileError::Lookup {
            kind: ObjectKind::Domain,
            identity,
            source: HypervisorError::ConnectionFailed("socket closed".to_string()),
        };
        assert!(err.is_transient());
        assert_eq!(err.identity(), Some(&identity));

        let err = ReconcileError::Redefine {
            kind: ObjectKind::Network,
            identity,
            source: HypervisorError::Rejected("bridge name in use".to_string()),
        };
        assert!(!err.is_transient());
        assert_eq!(err.kind(), ObjectKind::Network);
    }

    #[test]
    fn test_parse_error_is_not_transient() {
        let err = ReconcileError::from(ParseError::Empty {
            kind: ObjectKind::Domain,
        });
        assert!(!err.is_transient());
        assert!(err.identity().is_none());
        assert_eq!(err.to_string(), "domain descriptor is empty");
    }
}
