//! Seedkeep Core Library
//!
//! This crate tracks BitTorrent transfers on top of an injected protocol
//! engine: it parses descriptors, keeps the in-memory registry, persists
//! transfers to SQLite, reconciles live progress and enforces the VPN kill
//! switch. It is transport-agnostic; frontends drive it through the
//! [`Manager`] trait or the service channels.

pub mod db;
pub mod descriptor;
pub mod engine;
pub mod engine_adapter;
pub mod error;
pub mod network_policy;
pub mod reconciler;
pub mod registry;
pub mod service;
pub mod types;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use db::{get_db_path, init_database, Database, SettingsDb, TransfersDb};
pub use engine::{EngineError, EngineHandle, ProtocolEngine};
pub use engine_adapter::{derive_status, Manager, RestoreReport, TorrentManager};
pub use error::{Error, ErrorKind, Result};
pub use network_policy::{InterfaceProbe, NetworkPolicyGate, SystemInterfaceProbe};
pub use reconciler::{ProgressReconciler, TickReport};
pub use registry::{LockFreeRegistry, LockedRegistry, TransferRegistry};
pub use service::{ServiceCommand, ServiceContext, ServiceEvent, TransferService};
pub use types::*;
pub use utils::{calculate_progress, format_bytes, format_speed};
