//! The scheduling simulator.
//!
//! Given unschedulable pods, live nodes, and node pool templates with
//! instance-type catalogs, produce a placement: which pods land on which
//! existing nodes, and which new nodes (with narrowed instance options) must
//! be created.

pub mod daemons;
pub mod error;
pub mod existing_node;
pub mod host_ports;
pub mod instance_type;
pub mod new_node;
pub mod preferences;
pub mod queue;
pub mod requirements;
pub mod scheduler;
pub mod topology;
pub mod volume_usage;

pub use error::{Result, SchedulingError};
pub use existing_node::ExistingNode;
pub use instance_type::{InstanceType, InstanceTypes, Offering, Offerings};
pub use new_node::{NewNode, NodeClaimTemplate};
pub use preferences::Preferences;
pub use requirements::{Requirement, Requirements};
pub use scheduler::{PodData, Results, Scheduler};
pub use topology::{ScheduledPod, Topology, TopologyGroup, TopologyType};
