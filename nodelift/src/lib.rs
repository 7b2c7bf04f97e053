//! Nodelift - cluster node autoscaling core
//!
//! Nodelift decides, continuously and incrementally, which compute nodes
//! should be created, kept, or removed so that a declared set of workloads
//! can run while minimizing cost and respecting user-declared constraints.
//!
//! The crate is built from two tightly coupled subsystems:
//!
//! - [`scheduling`] - a single-threaded placement simulator. Given a set of
//!   unschedulable pods, live nodes, and node pool templates with flexible
//!   instance-type catalogs, it produces an assignment of pods to existing
//!   nodes and to new nodes with a narrowed set of eligible instance types.
//! - [`disruption`] - a reconciler that decides which nodes to remove or
//!   replace: consolidation (single- and multi-node), drift reclamation, and
//!   emptiness reclamation, each validated against a fresh re-simulation
//!   before an orchestration queue executes the decision.
//!
//! Cloud interaction goes exclusively through the [`provider::CloudProvider`]
//! trait; durable objects live behind [`state::ObjectStore`]. Nothing in this
//! crate persists state of its own.

pub mod api;
pub mod config;
pub mod disruption;
pub mod events;
pub mod metrics;
pub mod provider;
pub mod provisioning;
pub mod resources;
pub mod scheduling;
pub mod state;

pub use config::Options;
pub use events::{Event, EventRecorder};
pub use provider::CloudProvider;
pub use provisioning::Provisioner;
pub use resources::{Quantity, ResourceList};
pub use state::ClusterState;
