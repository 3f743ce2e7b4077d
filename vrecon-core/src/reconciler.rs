//! Lifecycle reconciler for domains and networks.
//!
//! Every operation is independent and safe to retry. The reconciler keeps no
//! state of its own: the caller stores the identity and the last canonical
//! descriptor between calls and hands them back in.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::clock::{Clock, TokioClock};
use crate::descriptor::{self, Descriptor};
use crate::error::ReconcileError;
use crate::handle::HandleGuard;
use crate::shutdown::{ShutdownMachine, ShutdownOutcome, ShutdownPolicy, ShutdownReport};
use crate::traits::HypervisorClient;
use crate::types::{Identity, ObjectKind};

type Result<T> = std::result::Result<T, ReconcileError>;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// What happens to a domain right after it is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainStartPolicy {
    /// Boot the domain.
    pub start: bool,
    /// Mark the domain to boot with the host.
    pub autostart: bool,
}

impl Default for DomainStartPolicy {
    fn default() -> Self {
        Self {
            start: true,
            autostart: false,
        }
    }
}

/// Network-specific behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkPolicy {
    /// Stop an active network before undefining it. Without this an active
    /// network outlives its definition as a transient one.
    pub stop_before_undefine: bool,
}

/// Reconciler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcilerConfig {
    pub shutdown: ShutdownPolicy,
    pub domain: DomainStartPolicy,
    pub network: NetworkPolicy,
}

// =============================================================================
// OUTCOMES
// =============================================================================

/// A newly created object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Created {
    pub kind: ObjectKind,
    pub identity: Identity,
    /// Canonical form of the caller's descriptor, for drift comparison.
    pub canonical: String,
    /// Descriptor as the hypervisor reports it after creation.
    pub live: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReadOutcome {
    Found {
        /// Descriptor as the hypervisor reports it.
        descriptor: String,
        canonical: String,
    },
    /// The object is gone and must be recreated.
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// Canonical form matches the last recorded one; nothing was sent.
    Unchanged,
    Redefined { canonical: String, live: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted { shutdown: Option<ShutdownReport> },
    /// Nothing to delete.
    AlreadyAbsent,
}

// =============================================================================
// RECONCILER
// =============================================================================

/// Reconciles domains and networks against a hypervisor.
///
/// Operations on different identities may run concurrently. Operations on
/// the same identity must be serialized by the caller.
pub struct Reconciler {
    client: Arc<dyn HypervisorClient>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a reconciler on top of a client, with default settings and the
    /// tokio clock.
    pub fn new(client: Arc<dyn HypervisorClient>) -> Self {
        Self {
            client,
            clock: Arc::new(TokioClock),
            config: ReconcilerConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Define and activate a new object.
    ///
    /// The identity is always assigned by the hypervisor; a `<uuid>` in the
    /// descriptor is dropped before definition.
    #[instrument(skip(self, descriptor), fields(kind = %kind))]
    pub async fn create(&self, kind: ObjectKind, descriptor: &str) -> Result<Created> {
        let mut parsed = Descriptor::parse(descriptor, kind)?;
        let canonical = parsed.to_canonical();
        if parsed.clear_identity() {
            warn!("Ignoring uuid in create descriptor, the hypervisor assigns one");
        }

        info!(name = ?parsed.name(), "Defining object");
        let handle = self
            .client
            .define(kind, &parsed.to_canonical())
            .await
            .map_err(|source| ReconcileError::Define { kind, source })?;
        let guard = HandleGuard::new(self.client.as_ref(), handle);
        let identity = guard.identity();

        match kind {
            ObjectKind::Domain => self.activate_domain(&guard).await?,
            ObjectKind::Network => self.activate_network(&guard).await?,
        }

        let live = self.live_descriptor(&guard).await?;
        info!(identity = %identity, "Object created");

        Ok(Created {
            kind,
            identity,
            canonical,
            live,
        })
    }

    /// Current descriptor of an object, or `NotFound` when it is gone.
    #[instrument(skip(self), fields(kind = %kind, identity = %identity))]
    pub async fn read(&self, kind: ObjectKind, identity: &Identity) -> Result<ReadOutcome> {
        let Some(guard) = self.lookup(kind, identity).await? else {
            info!("Object not found");
            return Ok(ReadOutcome::NotFound);
        };

        let descriptor = self.live_descriptor(&guard).await?;
        let canonical = descriptor::canonicalize(&descriptor, kind)?;
        Ok(ReadOutcome::Found {
            descriptor,
            canonical,
        })
    }

    /// Whether an object with this identity exists.
    #[instrument(skip(self), fields(kind = %kind, identity = %identity))]
    pub async fn exists(&self, kind: ObjectKind, identity: &Identity) -> Result<bool> {
        Ok(self.lookup(kind, identity).await?.is_some())
    }

    /// Redefine an object in place from a new descriptor.
    ///
    /// When `last_canonical` equals the canonical form of `descriptor` no
    /// hypervisor call is made.
    #[instrument(skip(self, descriptor, last_canonical), fields(kind = %kind, identity = %identity))]
    pub async fn update(
        &self,
        kind: ObjectKind,
        identity: &Identity,
        descriptor: &str,
        last_canonical: Option<&str>,
    ) -> Result<UpdateOutcome> {
        let canonical = descriptor::canonicalize(descriptor, kind)?;
        if last_canonical == Some(canonical.as_str()) {
            info!("Descriptor unchanged");
            return Ok(UpdateOutcome::Unchanged);
        }

        let bound = descriptor::bind_identity(descriptor, kind, identity)?;

        // Without this check a vanished object would be silently recreated
        // under the old identity.
        let existing = self.lookup(kind, identity).await?;
        if existing.is_none() {
            return Err(ReconcileError::NotFound {
                kind,
                identity: *identity,
            });
        }
        drop(existing);

        info!("Redefining object");
        let handle = self
            .client
            .define(kind, &bound)
            .await
            .map_err(|source| ReconcileError::Redefine {
                kind,
                identity: *identity,
                source,
            })?;
        let guard = HandleGuard::new(self.client.as_ref(), handle);

        let live = self.live_descriptor(&guard).await?;
        info!("Object redefined");
        Ok(UpdateOutcome::Redefined { canonical, live })
    }

    /// Remove an object. Deleting an absent object succeeds.
    #[instrument(skip(self), fields(kind = %kind, identity = %identity))]
    pub async fn delete(&self, kind: ObjectKind, identity: &Identity) -> Result<DeleteOutcome> {
        let Some(guard) = self.lookup(kind, identity).await? else {
            info!("Object already absent");
            return Ok(DeleteOutcome::AlreadyAbsent);
        };

        let shutdown = match kind {
            ObjectKind::Domain => {
                let report = ShutdownMachine::new(
                    self.client.as_ref(),
                    self.clock.as_ref(),
                    self.config.shutdown,
                )
                .run(guard.handle())
                .await?;

                if report.outcome == ShutdownOutcome::Vanished {
                    info!("Domain disappeared during shutdown");
                    return Ok(DeleteOutcome::AlreadyAbsent);
                }
                Some(report)
            }
            ObjectKind::Network => {
                self.stop_network(&guard).await?;
                None
            }
        };

        let clear_ancillary = kind == ObjectKind::Domain;
        self.client
            .undefine(guard.handle(), clear_ancillary)
            .await
            .map_err(|source| ReconcileError::Undefine {
                kind,
                identity: *identity,
                source,
            })?;

        info!("Object deleted");
        Ok(DeleteOutcome::Deleted { shutdown })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Look up an object, mapping absence to `None`.
    async fn lookup(&self, kind: ObjectKind, identity: &Identity) -> Result<Option<HandleGuard<'_>>> {
        match self.client.lookup(kind, identity).await {
            Ok(handle) => Ok(Some(HandleGuard::new(self.client.as_ref(), handle))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(source) => Err(ReconcileError::Lookup {
                kind,
                identity: *identity,
                source,
            }),
        }
    }

    async fn live_descriptor(&self, guard: &HandleGuard<'_>) -> Result<String> {
        self.client
            .descriptor(guard.handle())
            .await
            .map_err(|source| ReconcileError::Query {
                kind: guard.kind(),
                identity: guard.identity(),
                source,
            })
    }

    async fn activate_domain(&self, guard: &HandleGuard<'_>) -> Result<()> {
        let policy = self.config.domain;
        let start_error = |source| ReconcileError::Start {
            kind: ObjectKind::Domain,
            identity: guard.identity(),
            source,
        };

        if policy.autostart {
            self.client
                .set_autostart(guard.handle(), true)
                .await
                .map_err(start_error)?;
        }
        if policy.start {
            self.client.start(guard.handle()).await.map_err(start_error)?;
            info!(identity = %guard.identity(), "Domain started");
        }
        Ok(())
    }

    async fn activate_network(&self, guard: &HandleGuard<'_>) -> Result<()> {
        let start_error = |source| ReconcileError::Start {
            kind: ObjectKind::Network,
            identity: guard.identity(),
            source,
        };

        let active = self.client.is_active(guard.handle()).await.map_err(start_error)?;
        if !active {
            self.client.start(guard.handle()).await.map_err(start_error)?;
            info!(identity = %guard.identity(), "Network started");
        }
        Ok(())
    }

    async fn stop_network(&self, guard: &HandleGuard<'_>) -> Result<()> {
        if !self.config.network.stop_before_undefine {
            return Ok(());
        }

        let active = self
            .client
            .is_active(guard.handle())
            .await
            .map_err(|source| ReconcileError::Query {
                kind: ObjectKind::Network,
                identity: guard.identity(),
                source,
            })?;
        if active {
            self.client
                .destroy(guard.handle(), false)
                .await
                .map_err(|source| ReconcileError::Destroy {
                    kind: ObjectKind::Network,
                    identity: guard.identity(),
                    source,
                })?;
            info!(identity = %guard.identity(), "Network stopped");
        }
        Ok(())
    }
}
