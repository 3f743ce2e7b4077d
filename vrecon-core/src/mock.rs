//! Mock hypervisor client for testing and development.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument};

use crate::descriptor::Descriptor;
use crate::error::{HypervisorError, Result};
use crate::traits::HypervisorClient;
use crate::types::*;

/// Client calls the mock counts and can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Define,
    Lookup,
    Descriptor,
    Start,
    SetAutostart,
    IsActive,
    DomainState,
    Shutdown,
    Destroy,
    Undefine,
    Release,
}

/// How a mock domain reacts to a shutdown request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownBehavior {
    /// Report shutoff on the n-th state query after the request (1 = first).
    AfterPolls(u32),
    /// Stay in the shutting-down state until destroyed.
    Never,
    /// Keep shutting down through every poll, then reach shutoff just before
    /// a destroy lands, so the destroy finds nothing running.
    RacesDestroy,
}

impl Default for ShutdownBehavior {
    fn default() -> Self {
        Self::AfterPolls(1)
    }
}

/// Mock hypervisor client.
///
/// Keeps domains and networks in memory and mimics the libvirt behaviors the
/// reconciler depends on:
/// - defining a descriptor whose uuid exists replaces that object in place
/// - defining a second object under an existing name is rejected
/// - shutting down a domain that is not running is an invalid operation
///
/// Every call is counted so tests can assert on exactly what was issued.
pub struct MockClient {
    objects: RwLock<HashMap<(ObjectKind, Identity), MockObject>>,
    handles: Mutex<HandleTable>,
    calls: Mutex<HashMap<MockOp, usize>>,
    faults: Mutex<HashSet<MockOp>>,
    last_destroy_graceful: Mutex<Option<bool>>,
}

struct MockObject {
    name: Option<String>,
    xml: String,
    state: DomainState,
    autostart: bool,
    shutdown: ShutdownBehavior,
    polls_since_shutdown: Option<u32>,
}

#[derive(Default)]
struct HandleTable {
    next_slot: u64,
    open: HashSet<u64>,
}

fn lock_poisoned<T>(_: T) -> HypervisorError {
    HypervisorError::Internal("Lock poisoned".to_string())
}

impl MockClient {
    /// Create a new mock client.
    pub fn new() -> Self {
        info!("Creating mock hypervisor client");
        Self {
            objects: RwLock::new(HashMap::new()),
            handles: Mutex::new(HandleTable::default()),
            calls: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashSet::new()),
            last_destroy_graceful: Mutex::new(None),
        }
    }

    // =========================================================================
    // Test controls
    // =========================================================================

    /// Make the next call of `op` fail with a rejection.
    pub fn fail_next(&self, op: MockOp) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(op);
        }
    }

    /// Number of times `op` was called.
    pub fn calls(&self, op: MockOp) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Total number of client calls of any kind.
    pub fn total_calls(&self) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.values().sum())
            .unwrap_or(0)
    }

    /// Forget all recorded calls.
    pub fn reset_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    /// The `graceful` flag of the most recent destroy call.
    pub fn last_destroy_graceful(&self) -> Option<bool> {
        self.last_destroy_graceful.lock().ok().and_then(|flag| *flag)
    }

    /// Handles issued but not yet released.
    pub fn open_handles(&self) -> usize {
        self.handles.lock().map(|t| t.open.len()).unwrap_or(0)
    }

    /// Number of objects of `kind` currently defined.
    pub fn count(&self, kind: ObjectKind) -> usize {
        self.objects
            .read()
            .map(|objects| objects.keys().filter(|(k, _)| *k == kind).count())
            .unwrap_or(0)
    }

    /// Lifecycle state of an object, if it exists.
    pub fn state_of(&self, kind: ObjectKind, identity: &Identity) -> Option<DomainState> {
        self.objects
            .read()
            .ok()
            .and_then(|objects| objects.get(&(kind, *identity)).map(|o| o.state))
    }

    /// Whether an object is marked autostart.
    pub fn autostart_of(&self, kind: ObjectKind, identity: &Identity) -> Option<bool> {
        self.objects
            .read()
            .ok()
            .and_then(|objects| objects.get(&(kind, *identity)).map(|o| o.autostart))
    }

    /// Force an object into a lifecycle state.
    pub fn set_state(&self, kind: ObjectKind, identity: &Identity, state: DomainState) -> Result<()> {
        self.with_object(kind, identity, |obj| {
            obj.state = state;
            obj.polls_since_shutdown = None;
            Ok(())
        })
    }

    /// Choose how a domain reacts to the next shutdown request.
    pub fn set_shutdown_behavior(&self, identity: &Identity, behavior: ShutdownBehavior) -> Result<()> {
        self.with_object(ObjectKind::Domain, identity, |obj| {
            obj.shutdown = behavior;
            Ok(())
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn record(&self, op: MockOp) -> Result<()> {
        let mut calls = self.calls.lock().map_err(lock_poisoned)?;
        *calls.entry(op).or_insert(0) += 1;
        drop(calls);

        let mut faults = self.faults.lock().map_err(lock_poisoned)?;
        if faults.remove(&op) {
            debug!(?op, "Injected failure");
            return Err(HypervisorError::Rejected(format!("injected {:?} failure", op)));
        }
        Ok(())
    }

    fn issue_handle(&self, kind: ObjectKind, identity: Identity) -> Result<LiveHandle> {
        let mut table = self.handles.lock().map_err(lock_poisoned)?;
        table.next_slot += 1;
        let slot = table.next_slot;
        table.open.insert(slot);
        Ok(LiveHandle::new(kind, identity, slot))
    }

    fn check_handle(&self, handle: &LiveHandle) -> Result<()> {
        let table = self.handles.lock().map_err(lock_poisoned)?;
        if table.open.contains(&handle.slot()) {
            Ok(())
        } else {
            Err(HypervisorError::UnknownHandle(handle.slot()))
        }
    }

    fn with_object<T>(
        &self,
        kind: ObjectKind,
        identity: &Identity,
        f: impl FnOnce(&mut MockObject) -> Result<T>,
    ) -> Result<T> {
        let mut objects = self.objects.write().map_err(lock_poisoned)?;
        let obj = objects
            .get_mut(&(kind, *identity))
            .ok_or_else(|| HypervisorError::NotFound {
                kind,
                id: identity.to_string(),
            })?;
        f(obj)
    }

    fn with_handle<T>(&self, handle: &LiveHandle, f: impl FnOnce(&mut MockObject) -> Result<T>) -> Result<T> {
        self.check_handle(handle)?;
        self.with_object(handle.kind(), &handle.identity(), f)
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorClient for MockClient {
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    #[instrument(skip(self, xml), fields(kind = %kind))]
    async fn define(&self, kind: ObjectKind, xml: &str) -> Result<LiveHandle> {
        self.record(MockOp::Define)?;

        let mut descriptor =
            Descriptor::parse(xml, kind).map_err(|e| HypervisorError::Rejected(e.to_string()))?;
        let name = descriptor.name();
        let identity = descriptor.identity().unwrap_or_else(Identity::generate);
        descriptor.set_identity(&identity);
        let xml = descriptor.to_canonical();

        let mut objects = self.objects.write().map_err(lock_poisoned)?;

        let clash = objects.iter().find(|((k, id), obj)| {
            *k == kind && *id != identity && name.is_some() && obj.name == name
        });
        if let Some(((_, other), _)) = clash {
            return Err(HypervisorError::Rejected(format!(
                "{} '{}' already exists with uuid {}",
                kind,
                name.unwrap_or_default(),
                other
            )));
        }

        match objects.get_mut(&(kind, identity)) {
            Some(existing) => {
                existing.name = name;
                existing.xml = xml;
                info!(identity = %identity, "Mock object redefined");
            }
            None => {
                objects.insert(
                    (kind, identity),
                    MockObject {
                        name,
                        xml,
                        state: DomainState::ShutOff,
                        autostart: false,
                        shutdown: ShutdownBehavior::default(),
                        polls_since_shutdown: None,
                    },
                );
                info!(identity = %identity, "Mock object defined");
            }
        }
        drop(objects);

        self.issue_handle(kind, identity)
    }

    async fn lookup(&self, kind: ObjectKind, identity: &Identity) -> Result<LiveHandle> {
        self.record(MockOp::Lookup)?;

        let exists = self
            .objects
            .read()
            .map_err(lock_poisoned)?
            .contains_key(&(kind, *identity));
        if !exists {
            return Err(HypervisorError::NotFound {
                kind,
                id: identity.to_string(),
            });
        }
        self.issue_handle(kind, *identity)
    }

    async fn descriptor(&self, handle: &LiveHandle) -> Result<String> {
        self.record(MockOp::Descriptor)?;
        self.with_handle(handle, |obj| Ok(obj.xml.clone()))
    }

    async fn start(&self, handle: &LiveHandle) -> Result<()> {
        self.record(MockOp::Start)?;
        self.with_handle(handle, |obj| {
            if obj.state.is_active() {
                return Err(HypervisorError::InvalidState(format!(
                    "{} is already active",
                    handle.kind()
                )));
            }
            obj.state = DomainState::Running;
            obj.polls_since_shutdown = None;
            Ok(())
        })
    }

    async fn set_autostart(&self, handle: &LiveHandle, enabled: bool) -> Result<()> {
        self.record(MockOp::SetAutostart)?;
        self.with_handle(handle, |obj| {
            obj.autostart = enabled;
            Ok(())
        })
    }

    async fn is_active(&self, handle: &LiveHandle) -> Result<bool> {
        self.record(MockOp::IsActive)?;
        self.with_handle(handle, |obj| Ok(obj.state.is_active()))
    }

    async fn domain_state(&self, handle: &LiveHandle) -> Result<DomainState> {
        self.record(MockOp::DomainState)?;
        self.with_handle(handle, |obj| {
            if let Some(polls) = obj.polls_since_shutdown.as_mut() {
                *polls += 1;
                if let ShutdownBehavior::AfterPolls(n) = obj.shutdown {
                    if *polls >= n {
                        obj.state = DomainState::ShutOff;
                        obj.polls_since_shutdown = None;
                    }
                }
            }
            Ok(obj.state)
        })
    }

    async fn shutdown(&self, handle: &LiveHandle) -> Result<()> {
        self.record(MockOp::Shutdown)?;
        self.with_handle(handle, |obj| match obj.state {
            DomainState::Running | DomainState::Blocked => {
                obj.state = DomainState::ShuttingDown;
                obj.polls_since_shutdown = Some(0);
                Ok(())
            }
            other => Err(HypervisorError::InvalidState(format!(
                "domain is not running (state: {})",
                other
            ))),
        })
    }

    async fn destroy(&self, handle: &LiveHandle, graceful: bool) -> Result<()> {
        self.record(MockOp::Destroy)?;
        debug!(graceful, "Mock destroy");
        *self.last_destroy_graceful.lock().map_err(lock_poisoned)? = Some(graceful);

        self.with_handle(handle, |obj| {
            if obj.shutdown == ShutdownBehavior::RacesDestroy && obj.state == DomainState::ShuttingDown {
                obj.state = DomainState::ShutOff;
                obj.polls_since_shutdown = None;
            }
            if !obj.state.is_active() {
                return Err(HypervisorError::InvalidState(format!(
                    "{} is not running",
                    handle.kind()
                )));
            }
            obj.state = DomainState::ShutOff;
            obj.polls_since_shutdown = None;
            Ok(())
        })
    }

    async fn undefine(&self, handle: &LiveHandle, clear_ancillary: bool) -> Result<()> {
        self.record(MockOp::Undefine)?;
        self.check_handle(handle)?;
        debug!(clear_ancillary, "Mock undefine");

        let mut objects = self.objects.write().map_err(lock_poisoned)?;
        objects
            .remove(&(handle.kind(), handle.identity()))
            .map(|_| ())
            .ok_or_else(|| HypervisorError::NotFound {
                kind: handle.kind(),
                id: handle.identity().to_string(),
            })
    }

    fn release(&self, handle: &LiveHandle) -> Result<()> {
        self.record(MockOp::Release)?;
        let mut table = self.handles.lock().map_err(lock_poisoned)?;
        if table.open.remove(&handle.slot()) {
            Ok(())
        } else {
            Err(HypervisorError::UnknownHandle(handle.slot()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_define_assigns_identity() {
        let client = MockClient::new();

        let handle = client
            .define(ObjectKind::Domain, "<domain><name>vm1</name></domain>")
            .await
            .unwrap();
        let xml = client.descriptor(&handle).await.unwrap();
        assert!(xml.contains(&format!("<uuid>{}</uuid>", handle.identity())));
        assert_eq!(client.state_of(ObjectKind::Domain, &handle.identity()), Some(DomainState::ShutOff));

        client.release(&handle).unwrap();
        assert_eq!(client.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_define_same_name_without_uuid_is_rejected() {
        let client = MockClient::new();

        let first = client
            .define(ObjectKind::Network, "<network><name>lan</name></network>")
            .await
            .unwrap();
        let err = client
            .define(ObjectKind::Network, "<network><name>lan</name><bridge name='br1'/></network>")
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::Rejected(_)));

        // Same name under the same uuid is a redefinition
        let xml = format!("<network><name>lan</name><uuid>{}</uuid><bridge name='br1'/></network>", first.identity());
        let second = client.define(ObjectKind::Network, &xml).await.unwrap();
        assert_eq!(second.identity(), first.identity());
        assert_eq!(client.count(ObjectKind::Network), 1);

        client.release(&first).unwrap();
        client.release(&second).unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_after_polls() {
        let client = MockClient::new();
        let handle = client
            .define(ObjectKind::Domain, "<domain><name>vm1</name></domain>")
            .await
            .unwrap();
        let id = handle.identity();

        client.start(&handle).await.unwrap();
        client.set_shutdown_behavior(&id, ShutdownBehavior::AfterPolls(2)).unwrap();
        client.shutdown(&handle).await.unwrap();

        assert_eq!(client.domain_state(&handle).await.unwrap(), DomainState::ShuttingDown);
        assert_eq!(client.domain_state(&handle).await.unwrap(), DomainState::ShutOff);

        // Already off
        let err = client.shutdown(&handle).await.unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidState(_)));

        client.release(&handle).unwrap();
    }

    #[tokio::test]
    async fn test_released_handle_is_unusable() {
        let client = MockClient::new();
        let handle = client
            .define(ObjectKind::Domain, "<domain><name>vm1</name></domain>")
            .await
            .unwrap();

        client.release(&handle).unwrap();
        assert!(matches!(client.release(&handle), Err(HypervisorError::UnknownHandle(_))));
        assert!(client.descriptor(&handle).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_next_is_one_shot() {
        let client = MockClient::new();
        client.fail_next(MockOp::Define);

        assert!(client
            .define(ObjectKind::Domain, "<domain><name>vm1</name></domain>")
            .await
            .is_err());
        let handle = client
            .define(ObjectKind::Domain, "<domain><name>vm1</name></domain>")
            .await
            .unwrap();

        assert_eq!(client.calls(MockOp::Define), 2);
        assert_eq!(client.count(ObjectKind::Domain), 1);
        client.release(&handle).unwrap();
    }
}
