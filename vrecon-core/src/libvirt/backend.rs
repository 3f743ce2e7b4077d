//! Libvirt client implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::ErrorNumber;
use virt::network::Network;
use virt::sys;

use crate::error::{HypervisorError, Result};
use crate::traits::HypervisorClient;
use crate::types::*;

/// Domain descriptors are read in migratable form: host-specific runtime
/// details are left out, so the text is stable across reads.
const DOMAIN_XML_FLAGS: sys::virDomainXMLFlags = sys::VIR_DOMAIN_XML_MIGRATABLE;

/// Domain definitions are checked against the schema, so unknown elements
/// are rejected instead of silently dropped.
const DOMAIN_DEFINE_FLAGS: sys::virDomainDefineFlags = sys::VIR_DOMAIN_DEFINE_VALIDATE;

/// Undefine removes the definition together with managed-save images,
/// snapshot and checkpoint metadata and NVRAM.
const UNDEFINE_ALL: sys::virDomainUndefineFlagsValues = sys::VIR_DOMAIN_UNDEFINE_MANAGED_SAVE
    | sys::VIR_DOMAIN_UNDEFINE_SNAPSHOTS_METADATA
    | sys::VIR_DOMAIN_UNDEFINE_NVRAM
    | sys::VIR_DOMAIN_UNDEFINE_CHECKPOINTS_METADATA;

enum LiveObject {
    Domain(Domain),
    Network(Network),
}

/// Libvirt/QEMU hypervisor client.
///
/// Libvirt object pointers are kept in a handle table; a [`LiveHandle`]
/// only carries the slot number. Releasing the handle frees the pointer.
pub struct LibvirtClient {
    uri: String,
    connection: Connect,
    handles: Mutex<HashMap<u64, LiveObject>>,
    next_slot: AtomicU64,
}

impl LibvirtClient {
    /// Connect to the libvirt daemon at `uri`.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu:///session` - User session QEMU
    /// - `qemu+ssh://user@host/system` - Remote via SSH
    pub async fn connect(uri: &str) -> Result<Self> {
        info!(uri = %uri, "Connecting to libvirt");

        let connection = Connect::open(Some(uri))
            .map_err(|e| HypervisorError::ConnectionFailed(e.to_string()))?;

        info!("Connected to libvirt");

        Ok(Self {
            uri: uri.to_string(),
            connection,
            handles: Mutex::new(HashMap::new()),
            next_slot: AtomicU64::new(1),
        })
    }

    /// Map a libvirt error, turning "no such object" into `NotFound`.
    fn map_error(kind: ObjectKind, id: &str, e: virt::error::Error) -> HypervisorError {
        match e.code() {
            ErrorNumber::NoDomain | ErrorNumber::NoNetwork => HypervisorError::NotFound {
                kind,
                id: id.to_string(),
            },
            ErrorNumber::OperationInvalid => HypervisorError::InvalidState(e.to_string()),
            ErrorNumber::NoConnect | ErrorNumber::SystemError | ErrorNumber::Rpc => {
                HypervisorError::ConnectionFailed(e.to_string())
            }
            _ => HypervisorError::Rejected(e.to_string()),
        }
    }

    fn store(&self, kind: ObjectKind, uuid: &str, object: LiveObject) -> Result<LiveHandle> {
        let identity = Identity::parse(uuid)
            .map_err(|e| HypervisorError::Internal(format!("libvirt returned bad uuid '{}': {}", uuid, e)))?;

        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        self.handles
            .lock()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?
            .insert(slot, object);

        debug!(slot, identity = %identity, "Handle acquired");
        Ok(LiveHandle::new(kind, identity, slot))
    }

    /// Run `f` against the libvirt object behind a handle.
    fn with_object<T>(
        &self,
        handle: &LiveHandle,
        f: impl FnOnce(&LiveObject) -> std::result::Result<T, virt::error::Error>,
    ) -> Result<T> {
        let handles = self
            .handles
            .lock()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        let object = handles
            .get(&handle.slot())
            .ok_or(HypervisorError::UnknownHandle(handle.slot()))?;

        f(object).map_err(|e| Self::map_error(handle.kind(), &handle.identity().to_string(), e))
    }

    fn with_domain<T>(
        &self,
        handle: &LiveHandle,
        f: impl FnOnce(&Domain) -> std::result::Result<T, virt::error::Error>,
    ) -> Result<T> {
        let handles = self
            .handles
            .lock()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;

        match handles.get(&handle.slot()) {
            Some(LiveObject::Domain(domain)) => f(domain)
                .map_err(|e| Self::map_error(handle.kind(), &handle.identity().to_string(), e)),
            Some(LiveObject::Network(_)) => Err(HypervisorError::InvalidState(
                "operation only applies to domains".to_string(),
            )),
            None => Err(HypervisorError::UnknownHandle(handle.slot())),
        }
    }
}

impl Drop for LibvirtClient {
    fn drop(&mut self) {
        if let Ok(mut handles) = self.handles.lock() {
            if !handles.is_empty() {
                warn!(count = handles.len(), "Freeing handles that were never released");
            }
            for (_, object) in handles.drain() {
                if let Err(e) = free(object) {
                    warn!(error = %e, "Failed to free handle");
                }
            }
        }
        if let Err(e) = self.connection.close() {
            warn!(uri = %self.uri, error = %e, "Failed to close libvirt connection");
        }
    }
}

fn free(object: LiveObject) -> std::result::Result<(), virt::error::Error> {
    match object {
        LiveObject::Domain(mut domain) => domain.free(),
        LiveObject::Network(mut network) => network.free(),
    }
}

#[async_trait]
impl HypervisorClient for LibvirtClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<bool> {
        match self.connection.is_alive() {
            Ok(alive) => Ok(alive),
            Err(_) => Ok(false),
        }
    }

    #[instrument(skip(self, xml), fields(kind = %kind))]
    async fn define(&self, kind: ObjectKind, xml: &str) -> Result<LiveHandle> {
        debug!(xml = %xml, "Defining from descriptor");

        match kind {
            ObjectKind::Domain => {
                let domain = Domain::define_xml_flags(&self.connection, xml, DOMAIN_DEFINE_FLAGS)
                    .map_err(|e| Self::map_error(kind, "<new>", e))?;
                let uuid = domain
                    .get_uuid_string()
                    .map_err(|e| HypervisorError::Internal(e.to_string()))?;
                self.store(kind, &uuid, LiveObject::Domain(domain))
            }
            ObjectKind::Network => {
                let network = Network::define_xml(&self.connection, xml)
                    .map_err(|e| Self::map_error(kind, "<new>", e))?;
                let uuid = network
                    .get_uuid_string()
                    .map_err(|e| HypervisorError::Internal(e.to_string()))?;
                self.store(kind, &uuid, LiveObject::Network(network))
            }
        }
    }

    #[instrument(skip(self), fields(kind = %kind, identity = %identity))]
    async fn lookup(&self, kind: ObjectKind, identity: &Identity) -> Result<LiveHandle> {
        let id = identity.to_string();

        let object = match kind {
            ObjectKind::Domain => Domain::lookup_by_uuid_string(&self.connection, &id)
                .map(LiveObject::Domain),
            ObjectKind::Network => Network::lookup_by_uuid_string(&self.connection, &id)
                .map(LiveObject::Network),
        }
        .map_err(|e| Self::map_error(kind, &id, e))?;

        self.store(kind, &id, object)
    }

    async fn descriptor(&self, handle: &LiveHandle) -> Result<String> {
        self.with_object(handle, |object| match object {
            LiveObject::Domain(domain) => domain.get_xml_desc(DOMAIN_XML_FLAGS),
            LiveObject::Network(network) => network.get_xml_desc(0),
        })
    }

    #[instrument(skip(self, handle), fields(identity = %handle.identity()))]
    async fn start(&self, handle: &LiveHandle) -> Result<()> {
        info!(kind = %handle.kind(), "Starting");
        self.with_object(handle, |object| match object {
            LiveObject::Domain(domain) => domain.create().map(|_| ()),
            LiveObject::Network(network) => network.create().map(|_| ()),
        })
    }

    async fn set_autostart(&self, handle: &LiveHandle, enabled: bool) -> Result<()> {
        self.with_object(handle, |object| match object {
            LiveObject::Domain(domain) => domain.set_autostart(enabled).map(|_| ()),
            LiveObject::Network(network) => network.set_autostart(enabled).map(|_| ()),
        })
    }

    async fn is_active(&self, handle: &LiveHandle) -> Result<bool> {
        self.with_object(handle, |object| match object {
            LiveObject::Domain(domain) => domain.is_active(),
            LiveObject::Network(network) => network.is_active(),
        })
    }

    async fn domain_state(&self, handle: &LiveHandle) -> Result<DomainState> {
        let (state, _reason) = self.with_domain(handle, |domain| domain.get_state())?;
        Ok(DomainState::from_code(state as u32))
    }

    #[instrument(skip(self, handle), fields(identity = %handle.identity()))]
    async fn shutdown(&self, handle: &LiveHandle) -> Result<()> {
        info!("Sending ACPI shutdown");
        self.with_domain(handle, |domain| domain.shutdown().map(|_| ()))
    }

    #[instrument(skip(self, handle), fields(identity = %handle.identity()))]
    async fn destroy(&self, handle: &LiveHandle, graceful: bool) -> Result<()> {
        info!(graceful, kind = %handle.kind(), "Destroying");
        self.with_object(handle, |object| match object {
            LiveObject::Domain(domain) => {
                let flags = if graceful {
                    sys::VIR_DOMAIN_DESTROY_GRACEFUL
                } else {
                    sys::VIR_DOMAIN_DESTROY_DEFAULT
                };
                domain.destroy_flags(flags).map(|_| ())
            }
            LiveObject::Network(network) => network.destroy(),
        })
    }

    #[instrument(skip(self, handle), fields(identity = %handle.identity()))]
    async fn undefine(&self, handle: &LiveHandle, clear_ancillary: bool) -> Result<()> {
        info!(clear_ancillary, kind = %handle.kind(), "Undefining");
        self.with_object(handle, |object| match object {
            LiveObject::Domain(domain) => {
                let flags = if clear_ancillary { UNDEFINE_ALL } else { 0 };
                domain.undefine_flags(flags)
            }
            LiveObject::Network(network) => network.undefine(),
        })
    }

    fn release(&self, handle: &LiveHandle) -> Result<()> {
        let object = self
            .handles
            .lock()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?
            .remove(&handle.slot())
            .ok_or(HypervisorError::UnknownHandle(handle.slot()))?;

        debug!(slot = handle.slot(), "Handle released");
        free(object).map_err(|e| HypervisorError::Internal(format!("failed to free handle: {}", e)))
    }
}
