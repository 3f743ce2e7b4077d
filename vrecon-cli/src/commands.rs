//! Subcommand execution.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use vrecon_common::TimedOperation;
use vrecon_core::{
    descriptor, DeleteOutcome, HypervisorClient, Identity, MockClient, ObjectKind, ReadOutcome,
    Reconciler, ShutdownReport, UpdateOutcome,
};

use crate::cli::Command;
use crate::config::{Config, HypervisorBackend, HypervisorConfig};

/// What a caller stores about an object between runs.
#[derive(Debug, Serialize)]
pub struct ResourceState {
    pub kind: ObjectKind,
    /// `None` once the object is gone.
    pub identity: Option<Identity>,
    /// Canonical descriptor to compare against on the next update.
    pub descriptor: Option<String>,
    pub status: Status,
    /// Descriptor as the hypervisor reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<ShutdownReport>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Valid,
    Created,
    Present,
    Unchanged,
    Updated,
    Deleted,
    Absent,
}

impl ResourceState {
    fn new(kind: ObjectKind, status: Status) -> Self {
        Self {
            kind,
            identity: None,
            descriptor: None,
            status,
            live: None,
            shutdown: None,
            observed_at: Utc::now(),
        }
    }
}

/// Run one subcommand and return what should be printed.
pub async fn execute(command: Command, config: &Config) -> Result<ResourceState> {
    let op = TimedOperation::start(command.name());

    let result = if command.is_offline() {
        run_offline(command)
    } else {
        match connect(&config.hypervisor).await {
            Ok(client) => {
                let reconciler = Reconciler::new(client).with_config(config.to_reconciler_config());
                run(command, &reconciler).await
            }
            Err(e) => Err(e),
        }
    };

    match &result {
        Ok(_) => op.finish(),
        Err(e) => op.fail(e),
    }
    result
}

/// Commands that only look at descriptor text.
fn run_offline(command: Command) -> Result<ResourceState> {
    match command {
        Command::Validate { kind, file } => {
            let raw = read_descriptor(&file)?;
            descriptor::validate(&raw, kind)?;
            Ok(ResourceState::new(kind, Status::Valid))
        }
        Command::Canonicalize { kind, file } => {
            let raw = read_descriptor(&file)?;
            let mut state = ResourceState::new(kind, Status::Valid);
            state.descriptor = Some(descriptor::canonicalize(&raw, kind)?);
            Ok(state)
        }
        other => anyhow::bail!("{} needs a hypervisor connection", other.name()),
    }
}

/// Commands that go through the reconciler.
pub async fn run(command: Command, reconciler: &Reconciler) -> Result<ResourceState> {
    let outcome = match command {
        Command::Create { kind, file } => {
            let raw = read_descriptor(&file)?;
            let created = reconciler.create(kind, &raw).await;
            let created = log_failure(created)?;

            let mut state = ResourceState::new(kind, Status::Created);
            state.identity = Some(created.identity);
            state.descriptor = Some(created.canonical);
            state.live = Some(created.live);
            state
        }

        Command::Read { kind, id } => match log_failure(reconciler.read(kind, &id).await)? {
            ReadOutcome::Found {
                descriptor,
                canonical,
            } => {
                let mut state = ResourceState::new(kind, Status::Present);
                state.identity = Some(id);
                state.descriptor = Some(canonical);
                state.live = Some(descriptor);
                state
            }
            ReadOutcome::NotFound => ResourceState::new(kind, Status::Absent),
        },

        Command::Update {
            kind,
            id,
            file,
            last,
        } => {
            let raw = read_descriptor(&file)?;
            let last = match last {
                Some(path) => Some(descriptor::canonicalize(&read_descriptor(&path)?, kind)?),
                None => None,
            };

            let outcome = reconciler.update(kind, &id, &raw, last.as_deref()).await;
            let mut state = match log_failure(outcome)? {
                UpdateOutcome::Unchanged => {
                    let mut state = ResourceState::new(kind, Status::Unchanged);
                    state.descriptor = last;
                    state
                }
                UpdateOutcome::Redefined { canonical, live } => {
                    let mut state = ResourceState::new(kind, Status::Updated);
                    state.descriptor = Some(canonical);
                    state.live = Some(live);
                    state
                }
            };
            state.identity = Some(id);
            state
        }

        Command::Delete { kind, id } => match log_failure(reconciler.delete(kind, &id).await)? {
            DeleteOutcome::Deleted { shutdown } => {
                let mut state = ResourceState::new(kind, Status::Deleted);
                state.shutdown = shutdown;
                state
            }
            DeleteOutcome::AlreadyAbsent => ResourceState::new(kind, Status::Absent),
        },

        offline => run_offline(offline)?,
    };

    Ok(outcome)
}

fn log_failure<T>(result: Result<T, vrecon_core::ReconcileError>) -> Result<T> {
    result.map_err(|e| {
        error!(
            error = %e,
            kind = %e.kind(),
            identity = ?e.identity(),
            transient = e.is_transient(),
            "Reconcile failed"
        );
        e.into()
    })
}

/// Build the hypervisor client named by the configuration.
pub async fn connect(config: &HypervisorConfig) -> Result<Arc<dyn HypervisorClient>> {
    let client: Arc<dyn HypervisorClient> = match config.backend {
        HypervisorBackend::Mock => {
            warn!("Using mock hypervisor, nothing is persisted between runs");
            Arc::new(MockClient::new())
        }
        HypervisorBackend::Libvirt => connect_libvirt(&config.uri).await?,
    };

    if !client.health_check().await? {
        anyhow::bail!("hypervisor at {} is not responding", config.uri);
    }
    Ok(client)
}

#[cfg(feature = "libvirt")]
async fn connect_libvirt(uri: &str) -> Result<Arc<dyn HypervisorClient>> {
    let client = vrecon_core::LibvirtClient::connect(uri)
        .await
        .with_context(|| format!("Failed to connect to libvirt at {}", uri))?;
    info!(uri = %uri, "Using libvirt hypervisor");
    Ok(Arc::new(client))
}

#[cfg(not(feature = "libvirt"))]
async fn connect_libvirt(uri: &str) -> Result<Arc<dyn HypervisorClient>> {
    anyhow::bail!(
        "libvirt support is not compiled in (uri {}); rebuild with --features libvirt or pass --dev",
        uri
    )
}

/// Read a descriptor from a file, or from stdin when the path is `-`.
fn read_descriptor(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("Failed to read descriptor from stdin")?;
        return Ok(raw);
    }

    info!(path = %path.display(), "Reading descriptor");
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read descriptor: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use vrecon_core::ManualClock;

    fn write_temp(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("vrecon-{}-{}", std::process::id(), name));
        std::fs::write(&path, content).unwrap();
        path
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(Arc::new(MockClient::new())).with_clock(Arc::new(ManualClock::new()))
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let reconciler = reconciler();
        let file = write_temp("vm.xml", "<domain type='kvm'><name>vm1</name></domain>");

        let created = run(
            Command::Create {
                kind: ObjectKind::Domain,
                file: file.clone(),
            },
            &reconciler,
        )
        .await
        .unwrap();
        assert_eq!(created.status, Status::Created);
        let id = created.identity.unwrap();

        let last = write_temp("vm.last.xml", created.descriptor.as_deref().unwrap());
        let updated = run(
            Command::Update {
                kind: ObjectKind::Domain,
                id,
                file: file.clone(),
                last: Some(last.clone()),
            },
            &reconciler,
        )
        .await
        .unwrap();
        assert_eq!(updated.status, Status::Unchanged);

        let deleted = run(Command::Delete { kind: ObjectKind::Domain, id }, &reconciler)
            .await
            .unwrap();
        assert_eq!(deleted.status, Status::Deleted);
        assert!(deleted.shutdown.is_some());

        let read = run(Command::Read { kind: ObjectKind::Domain, id }, &reconciler)
            .await
            .unwrap();
        assert_eq!(read.status, Status::Absent);
        assert!(read.identity.is_none());

        std::fs::remove_file(file).ok();
        std::fs::remove_file(last).ok();
    }

    #[tokio::test]
    async fn test_offline_commands() {
        let config = Config::default();
        let file = write_temp("lan.xml", "<network>\n<name>lan</name>\n</network>");

        let state = execute(
            Command::Canonicalize {
                kind: ObjectKind::Network,
                file: file.clone(),
            },
            &config,
        )
        .await
        .unwrap();
        assert_eq!(
            state.descriptor.as_deref(),
            Some("<network>\n  <name>lan</name>\n</network>\n")
        );

        let err = execute(
            Command::Validate {
                kind: ObjectKind::Domain,
                file: file.clone(),
            },
            &config,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("domain"));

        std::fs::remove_file(file).ok();
    }

    #[test]
    fn test_missing_file() {
        let err = run_offline(Command::Validate {
            kind: ObjectKind::Domain,
            file: PathBuf::from("/nonexistent/vm.xml"),
        })
        .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/vm.xml"));
    }

    #[test]
    fn test_state_serializes() {
        let state = ResourceState::new(ObjectKind::Network, Status::Absent);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["kind"], "network");
        assert_eq!(json["status"], "absent");
        assert!(json["identity"].is_null());
        assert!(json.get("live").is_none());
    }
}
