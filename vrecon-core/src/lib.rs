//! # vrecon Core
//!
//! Reconciliation engine for libvirt domains and networks.
//!
//! Each object is described by a single XML descriptor. The engine keeps the
//! hypervisor in line with that descriptor:
//! - **Canonicalizer** - deterministic re-serialization so drift detection is stable
//! - **Identity binder** - pins the hypervisor-assigned UUID into redefinitions
//! - **Reconciler** - create / read / update / delete per object kind
//! - **Shutdown machine** - bounded graceful shutdown with forced escalation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Reconciler                 │
//! │   (create, read, update, delete)        │
//! └──────┬──────────────┬───────────────────┘
//!        │              │
//!        ▼              ▼
//! ┌─────────────┐ ┌───────────────────┐
//! │ descriptor  │ │  ShutdownMachine  │──── Clock
//! └─────────────┘ └─────────┬─────────┘
//!                           ▼
//!             ┌─────────────────────────┐
//!             │  HypervisorClient trait │
//!             └──────┬───────────┬──────┘
//!                    ▼           ▼
//!            LibvirtClient   MockClient
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vrecon_core::{MockClient, ObjectKind, Reconciler};
//!
//! #[tokio::main]
//! async fn main() {
//!     let reconciler = Reconciler::new(Arc::new(MockClient::new()));
//!
//!     let created = reconciler
//!         .create(ObjectKind::Domain, "<domain><name>vm1</name></domain>")
//!         .await
//!         .unwrap();
//!
//!     reconciler.delete(ObjectKind::Domain, &created.identity).await.unwrap();
//! }
//! ```

pub mod clock;
pub mod descriptor;
pub mod error;
pub mod handle;
pub mod libvirt;
pub mod mock;
pub mod reconciler;
pub mod shutdown;
pub mod traits;
pub mod types;

pub use clock::{Clock, ManualClock, TokioClock};
pub use descriptor::{bind_identity, canonicalize, validate, Descriptor};
pub use error::{HypervisorError, ParseError, ReconcileError};
pub use handle::HandleGuard;
pub use mock::{MockClient, MockOp, ShutdownBehavior};
pub use reconciler::{
    Created, DeleteOutcome, DomainStartPolicy, NetworkPolicy, ReadOutcome, Reconciler,
    ReconcilerConfig, UpdateOutcome,
};
pub use shutdown::{
    EscalationReason, PollStatus, ShutdownMachine, ShutdownOutcome, ShutdownPolicy,
    ShutdownReport,
};
pub use traits::HypervisorClient;
pub use types::{DomainState, Identity, LiveHandle, ObjectKind};

// Re-export libvirt client when available
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtClient;
