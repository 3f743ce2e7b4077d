//! Scoped ownership of live-object handles.

use tracing::warn;

use crate::traits::HypervisorClient;
use crate::types::{Identity, LiveHandle, ObjectKind};

/// Owns a [`LiveHandle`] and releases it when dropped.
///
/// Release happens on every exit path, including early returns through `?`.
/// A failed release is logged and never replaces the operation's own result.
pub struct HandleGuard<'a> {
    client: &'a dyn HypervisorClient,
    handle: LiveHandle,
}

impl<'a> HandleGuard<'a> {
    pub fn new(client: &'a dyn HypervisorClient, handle: LiveHandle) -> Self {
        Self { client, handle }
    }

    pub fn handle(&self) -> &LiveHandle {
        &self.handle
    }

    pub fn identity(&self) -> Identity {
        self.handle.identity()
    }

    pub fn kind(&self) -> ObjectKind {
        self.handle.kind()
    }
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.client.release(&self.handle) {
            warn!(
                kind = %self.handle.kind(),
                identity = %self.handle.identity(),
                error = %e,
                "Failed to release handle"
            );
        }
    }
}
