//! Command-line argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vrecon_core::{Identity, ObjectKind};

/// vrecon - Desired-state reconciler for libvirt domains and networks
#[derive(Parser, Debug)]
#[command(name = "vrecon")]
#[command(about = "vrecon - Desired-state reconciler for libvirt domains and networks")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Libvirt connection URI (e.g., qemu:///system)
    #[arg(long, env = "LIBVIRT_DEFAULT_URI", global = true)]
    pub uri: Option<String>,

    /// Enable development mode (in-memory mock hypervisor)
    #[arg(long, global = true)]
    pub dev: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Check that a descriptor is well-formed for its kind
    Validate {
        /// Object kind (domain, network)
        kind: ObjectKind,
        /// Descriptor file, or - for stdin
        file: PathBuf,
    },

    /// Print the canonical form of a descriptor
    Canonicalize {
        kind: ObjectKind,
        file: PathBuf,
    },

    /// Define and start a new object
    Create {
        kind: ObjectKind,
        file: PathBuf,
    },

    /// Show the current descriptor of an object
    Read {
        kind: ObjectKind,
        id: Identity,
    },

    /// Redefine an object in place
    Update {
        kind: ObjectKind,
        id: Identity,
        file: PathBuf,
        /// Descriptor last applied; the update is skipped when unchanged
        #[arg(long)]
        last: Option<PathBuf>,
    },

    /// Shut down and remove an object
    Delete {
        kind: ObjectKind,
        id: Identity,
    },
}

impl Command {
    /// Whether the command works on descriptor text alone.
    pub fn is_offline(&self) -> bool {
        matches!(self, Self::Validate { .. } | Self::Canonicalize { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Validate { .. } => "validate",
            Self::Canonicalize { .. } => "canonicalize",
            Self::Create { .. } => "create",
            Self::Read { .. } => "read",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "4dea22b3-1d52-d8f3-2516-782e98ab3fa0";

    #[test]
    fn test_parse_delete() {
        let args = Args::try_parse_from(["vrecon", "--dev", "delete", "domain", ID]).unwrap();

        assert!(args.dev);
        assert_eq!(
            args.command,
            Command::Delete {
                kind: ObjectKind::Domain,
                id: Identity::parse(ID).unwrap(),
            }
        );
        assert!(!args.command.is_offline());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from([
            "vrecon", "update", "network", ID, "lan.xml", "--last", "lan.old.xml", "-l", "debug",
        ])
        .unwrap();

        assert_eq!(args.log_level.as_deref(), Some("debug"));
        match args.command {
            Command::Update { kind, last, .. } => {
                assert_eq!(kind, ObjectKind::Network);
                assert_eq!(last, Some(PathBuf::from("lan.old.xml")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_kind_and_identity() {
        assert!(Args::try_parse_from(["vrecon", "validate", "pool", "p.xml"]).is_err());
        assert!(Args::try_parse_from(["vrecon", "read", "domain", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_offline_commands() {
        let args = Args::try_parse_from(["vrecon", "canonicalize", "Domain", "-"]).unwrap();
        assert!(args.command.is_offline());
        assert_eq!(args.command.name(), "canonicalize");
    }
}
