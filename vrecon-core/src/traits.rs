//! Hypervisor client abstraction.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::*;

/// Connection to a hypervisor, able to manage domains and networks.
///
/// The reconciler borrows one long-lived client for every operation and
/// never closes it. Every [`LiveHandle`] returned by [`define`] or
/// [`lookup`] must be passed to [`release`] exactly once.
///
/// [`define`]: HypervisorClient::define
/// [`lookup`]: HypervisorClient::lookup
/// [`release`]: HypervisorClient::release
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// Check if the hypervisor connection is healthy.
    async fn health_check(&self) -> Result<bool>;

    // =========================================================================
    // Definition & Lookup
    // =========================================================================

    /// Define (or redefine, when the descriptor carries an existing uuid) a
    /// persistent object. Does not start it.
    async fn define(&self, kind: ObjectKind, xml: &str) -> Result<LiveHandle>;

    /// Look up an object by identity.
    ///
    /// Returns [`HypervisorError::NotFound`](crate::HypervisorError::NotFound)
    /// when no such object exists.
    async fn lookup(&self, kind: ObjectKind, identity: &Identity) -> Result<LiveHandle>;

    /// Current descriptor of the object as the hypervisor reports it.
    async fn descriptor(&self, handle: &LiveHandle) -> Result<String>;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start (activate) a defined object.
    async fn start(&self, handle: &LiveHandle) -> Result<()>;

    /// Mark the object to start when the host boots.
    async fn set_autostart(&self, handle: &LiveHandle, enabled: bool) -> Result<()>;

    /// Whether the object is active (running domain, started network).
    async fn is_active(&self, handle: &LiveHandle) -> Result<bool>;

    /// Lifecycle state of a domain.
    async fn domain_state(&self, handle: &LiveHandle) -> Result<DomainState>;

    /// Ask the guest to shut down. Returns as soon as the request is
    /// delivered; it does not wait for the guest.
    async fn shutdown(&self, handle: &LiveHandle) -> Result<()>;

    /// Stop the object immediately.
    ///
    /// With `graceful` set, the hypervisor gives the guest a last chance to
    /// flush before powering it off instead of killing it outright.
    async fn destroy(&self, handle: &LiveHandle, graceful: bool) -> Result<()>;

    /// Remove the persistent definition.
    ///
    /// With `clear_ancillary` set, managed-save images, snapshot and
    /// checkpoint metadata and NVRAM go away together with the definition.
    async fn undefine(&self, handle: &LiveHandle, clear_ancillary: bool) -> Result<()>;

    // =========================================================================
    // Handles
    // =========================================================================

    /// Release the hypervisor resources held by a handle.
    fn release(&self, handle: &LiveHandle) -> Result<()>;
}
