//! Well-known node label keys and their canonical aliases

/// Topology zone of a node
pub const ZONE: &str = "topology.kubernetes.io/zone";
/// Topology region of a node
pub const REGION: &str = "topology.kubernetes.io/region";
/// Hostname, unique per node
pub const HOSTNAME: &str = "kubernetes.io/hostname";
/// CPU architecture
pub const ARCH: &str = "kubernetes.io/arch";
/// Operating system
pub const OS: &str = "kubernetes.io/os";
/// Concrete instance type name
pub const INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";

/// Capacity type of the offering backing a node
pub const CAPACITY_TYPE: &str = "nodelift.dev/capacity-type";
/// Instance family, e.g. "c5"
pub const INSTANCE_FAMILY: &str = "nodelift.dev/instance-family";
/// Instance size within a family, e.g. "xlarge"
pub const INSTANCE_SIZE: &str = "nodelift.dev/instance-size";
/// The node pool a node was created for
pub const NODE_POOL: &str = "nodelift.dev/nodepool";

/// On-demand capacity type value
pub const CAPACITY_TYPE_ON_DEMAND: &str = "on-demand";
/// Spot capacity type value
pub const CAPACITY_TYPE_SPOT: &str = "spot";

/// Taint placed on nodes while a disruption command is executing
pub const DISRUPTION_TAINT_KEY: &str = "nodelift.dev/disrupted";

/// Annotation opting a pod or node out of disruption
pub const DO_NOT_DISRUPT_ANNOTATION: &str = "nodelift.dev/do-not-disrupt";
/// Annotation weighting a pod's eviction cost
pub const EVICTION_COST_ANNOTATION: &str = "nodelift.dev/pod-eviction-cost";

const WELL_KNOWN: &[&str] = &[
    ZONE,
    REGION,
    HOSTNAME,
    ARCH,
    OS,
    INSTANCE_TYPE,
    CAPACITY_TYPE,
    INSTANCE_FAMILY,
    INSTANCE_SIZE,
    NODE_POOL,
];

const ALIASES: &[(&str, &str)] = &[
    ("failure-domain.beta.kubernetes.io/zone", ZONE),
    ("failure-domain.beta.kubernetes.io/region", REGION),
    ("beta.kubernetes.io/arch", ARCH),
    ("beta.kubernetes.io/os", OS),
    ("beta.kubernetes.io/instance-type", INSTANCE_TYPE),
];

/// Map deprecated label keys onto their canonical form
pub fn canonical(key: &str) -> &str {
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(key)
}

/// True for labels whose values the autoscaler itself defines
pub fn is_well_known(key: &str) -> bool {
    WELL_KNOWN.contains(&key)
}
