//! Type definitions shared by the client layer and the reconciler.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// OBJECT KIND
// =============================================================================

/// The hypervisor object kinds this crate reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Domain,
    Network,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Network => "network",
        }
    }

    /// Name of the root element a descriptor of this kind must have.
    pub fn root_element(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "domain" => Ok(Self::Domain),
            "network" => Ok(Self::Network),
            other => Err(format!("unknown object kind '{}' (expected domain or network)", other)),
        }
    }
}

// =============================================================================
// IDENTITY
// =============================================================================

/// Hypervisor-assigned identity of a live object.
///
/// Always rendered in lowercase hyphenated form, which is what libvirt
/// reports and accepts for lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(Uuid);

impl Identity {
    /// Fresh random identity. Only hypervisor backends assign identities.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for Identity {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// =============================================================================
// DOMAIN STATE
// =============================================================================

/// Domain lifecycle state, numbered as libvirt's `virDomainState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    /// The guest acknowledged a shutdown request and is going down.
    ShuttingDown,
    ShutOff,
    Crashed,
    PmSuspended,
    /// A code this crate does not know about.
    Unknown(u32),
}

impl DomainState {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::NoState,
            1 => Self::Running,
            2 => Self::Blocked,
            3 => Self::Paused,
            4 => Self::ShuttingDown,
            5 => Self::ShutOff,
            6 => Self::Crashed,
            7 => Self::PmSuspended,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::NoState => 0,
            Self::Running => 1,
            Self::Blocked => 2,
            Self::Paused => 3,
            Self::ShuttingDown => 4,
            Self::ShutOff => 5,
            Self::Crashed => 6,
            Self::PmSuspended => 7,
            Self::Unknown(code) => *code,
        }
    }

    /// Whether the guest is executing (or scheduled to).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Blocked | Self::ShuttingDown | Self::Paused)
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoState => f.write_str("no-state"),
            Self::Running => f.write_str("running"),
            Self::Blocked => f.write_str("blocked"),
            Self::Paused => f.write_str("paused"),
            Self::ShuttingDown => f.write_str("shutting-down"),
            Self::ShutOff => f.write_str("shutoff"),
            Self::Crashed => f.write_str("crashed"),
            Self::PmSuspended => f.write_str("pm-suspended"),
            Self::Unknown(code) => write!(f, "unknown({})", code),
        }
    }
}

// =============================================================================
// LIVE HANDLE
// =============================================================================

/// Handle to a live object, issued by `define` or `lookup`.
///
/// Not `Clone`: a handle is released exactly once, normally by dropping the
/// [`HandleGuard`](crate::handle::HandleGuard) that owns it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct LiveHandle {
    kind: ObjectKind,
    identity: Identity,
    slot: u64,
}

impl LiveHandle {
    /// Backends call this with a slot number unique within the client.
    pub fn new(kind: ObjectKind, identity: Identity, slot: u64) -> Self {
        Self { kind, identity, slot }
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn slot(&self) -> u64 {
        self.slot
    }
}
