//! Scheduling error types

use thiserror::Error;

/// Scheduling result type
pub type Result<T> = std::result::Result<T, SchedulingError>;

/// Why a pod could not be placed on a node or template
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulingError {
    /// Pod does not tolerate a node taint
    #[error("did not tolerate taint {taint}")]
    Untolerated { taint: String },

    /// Requested host port already bound on the node
    #[error("host port {port} is already in use on {ip}")]
    HostPortConflict { ip: String, port: u16 },

    /// Adding the pod's volumes would exceed a driver's attach limit
    #[error("would exceed volume limit of {limit} for driver {driver}")]
    VolumeLimitExceeded { driver: String, limit: usize },

    /// Node does not have room for the pod's requests
    #[error("exceeds node resources ({})", resources.join(", "))]
    ExceedsNodeResources { resources: Vec<String> },

    /// Two requirements for the same key have an empty intersection
    #[error("incompatible requirements, key {key}, {incoming} not in {existing}")]
    Incompatible { key: String, incoming: String, existing: String },

    /// A required label has no known values on the other side
    #[error("label {key:?} does not have known values")]
    UndefinedLabel { key: String },

    /// Gt/Lt requirement with a non-numeric or multi-valued operand
    #[error("invalid operand for {operator} on key {key}, expected a single non-negative integer")]
    InvalidBound { key: String, operator: String },

    /// A topology group left no viable domain for its key
    #[error("unsatisfiable topology constraint for {group}, no viable domain in {node_domains}")]
    TopologyConflict { group: String, node_domains: String },

    /// No instance type survived requirement, resource, and offering filtering
    #[error("{}", no_instance_type_message(*requirements_ok, *resources_ok, *offerings_ok, *cpu_hint))]
    NoInstanceType {
        /// Some type was compatible with the requirements
        requirements_ok: bool,
        /// Some type had room for the requests
        resources_ok: bool,
        /// Some type had a compatible available offering
        offerings_ok: bool,
        /// Requests looked like a units typo
        cpu_hint: bool,
    },

    /// Instance-type flexibility dropped below a minimum-values constraint
    #[error("minimum flexibility requirement is not met for label(s) ({})", keys.join(", "))]
    MinValuesNotMet { keys: Vec<String> },

    /// The scheduler could not make progress on this pod
    #[error("no templates remained after relaxing preferences")]
    NoTemplateFit,

    /// A simulated placement would depend on a node that has not finished
    /// initializing; building on fragile state cascades badly
    #[error("would schedule against uninitialized node {node}")]
    UninitializedNode { node: String },

    /// A pool's remaining resource limits exclude every instance type
    #[error("node pool {node_pool} resource limits exclude all instance types")]
    PoolLimitExceeded { node_pool: String },

    /// Every node pool rejected the pod, with one reason each
    #[error("incompatible with every node pool: {}", failures.iter().map(|(pool, reason)| format!("nodepool {pool:?}: {reason}")).collect::<Vec<_>>().join("; "))]
    NoPoolFit { failures: Vec<(String, String)> },
}

fn no_instance_type_message(
    requirements_ok: bool,
    resources_ok: bool,
    offerings_ok: bool,
    cpu_hint: bool,
) -> String {
    let mut failures = Vec::new();
    if !requirements_ok {
        failures.push("no instance type matched the scheduling requirements");
    }
    if !resources_ok {
        failures.push("no instance type has enough resources");
    }
    if !offerings_ok {
        failures.push("no instance type has a required offering");
    }
    let mut message = if failures.is_empty() {
        // every check passed individually but no type passed all of them together
        "no single instance type satisfied all of requirements, resources, and offerings"
            .to_string()
    } else {
        failures.join(" and ")
    };
    if cpu_hint {
        message.push_str(" (CPU request >= 1 Million, m vs M typo?)");
    }
    message
}
