//! Workload unit model: pods, affinity, topology spread, disruption budgets

use super::taints::Toleration;
use super::{labels, LabelSelector, ObjectMeta, Operator, Uid};
use crate::resources::ResourceList;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// A schedulable workload unit
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub affinity: Option<Affinity>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
    /// Aggregate resource requests across the pod's containers
    #[serde(default)]
    pub requests: ResourceList,
    #[serde(default)]
    pub host_ports: Vec<HostPort>,
    #[serde(default)]
    pub volumes: Vec<PodVolume>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl Pod {
    pub fn uid(&self) -> &Uid {
        &self.metadata.uid
    }

    pub fn is_scheduled(&self) -> bool {
        self.spec.node_name.is_some()
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status.phase, PodPhase::Succeeded | PodPhase::Failed)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status.phase, PodPhase::Pending)
    }

    /// Active pods count against capacity and topology domains
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && !self.is_terminating()
    }

    /// Owned by a daemon controller, so present on every eligible node
    pub fn is_daemon(&self) -> bool {
        self.metadata.controller().is_some_and(|r| r.kind == "DaemonSet")
    }

    /// Controlled by something that will recreate it if evicted
    pub fn is_owned(&self) -> bool {
        self.metadata.controller().is_some()
    }

    pub fn has_do_not_disrupt(&self) -> bool {
        self.metadata
            .annotations
            .get(labels::DO_NOT_DISRUPT_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    /// A pod we would have to find a new home for if its node went away
    pub fn is_reschedulable(&self) -> bool {
        self.is_active() && self.is_owned() && !self.is_daemon()
    }

    /// Pods excluded when seeding topology domain counts
    pub fn ignored_for_topology(&self) -> bool {
        self.is_terminal() || self.is_terminating()
    }

    pub fn has_required_pod_anti_affinity(&self) -> bool {
        self.spec
            .affinity
            .as_ref()
            .and_then(|a| a.pod_anti_affinity.as_ref())
            .is_some_and(|a| !a.required.is_empty())
    }

    pub fn has_preferred_node_affinity(&self) -> bool {
        self.spec
            .affinity
            .as_ref()
            .and_then(|a| a.node_affinity.as_ref())
            .is_some_and(|a| !a.preferred.is_empty())
    }
}

/// Affinity tree of a pod
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Affinity {
    #[serde(default)]
    pub node_affinity: Option<NodeAffinity>,
    #[serde(default)]
    pub pod_affinity: Option<PodAffinity>,
    #[serde(default)]
    pub pod_anti_affinity: Option<PodAntiAffinity>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeAffinity {
    #[serde(default)]
    pub required: Option<NodeSelector>,
    #[serde(default)]
    pub preferred: Vec<PreferredSchedulingTerm>,
}

/// OR of node selector terms
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeSelector {
    pub terms: Vec<NodeSelectorTerm>,
}

/// AND of match expressions
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeSelectorTerm {
    #[serde(default)]
    pub match_expressions: Vec<NodeSelectorRequirement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferredSchedulingTerm {
    pub weight: i32,
    pub preference: NodeSelectorTerm,
}

/// One node label requirement.
///
/// `min_values` is only meaningful on node pool templates, where it demands
/// flexibility: the final instance-type selection must retain at least that
/// many distinct values for the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeSelectorRequirement {
    pub key: String,
    pub operator: Operator,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_values: Option<usize>,
}

impl NodeSelectorRequirement {
    pub fn new_in(key: impl Into<String>, values: Vec<String>) -> Self {
        NodeSelectorRequirement {
            key: key.into(),
            operator: Operator::In,
            values,
            min_values: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PodAffinity {
    #[serde(default)]
    pub required: Vec<PodAffinityTerm>,
    #[serde(default)]
    pub preferred: Vec<WeightedPodAffinityTerm>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PodAntiAffinity {
    #[serde(default)]
    pub required: Vec<PodAffinityTerm>,
    #[serde(default)]
    pub preferred: Vec<WeightedPodAffinityTerm>,
}

/// Co-location (or exclusion) of this pod with pods matched by the selector
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PodAffinityTerm {
    #[serde(default)]
    pub label_selector: LabelSelector,
    /// Namespaces the selector applies to; empty means the pod's own
    #[serde(default)]
    pub namespaces: Vec<String>,
    pub topology_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedPodAffinityTerm {
    pub weight: i32,
    pub term: PodAffinityTerm,
}

/// Even-spread constraint across the domains of a topology key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySpreadConstraint {
    pub max_skew: i32,
    pub topology_key: String,
    pub when_unsatisfiable: UnsatisfiableAction,
    #[serde(default)]
    pub label_selector: LabelSelector,
    #[serde(default)]
    pub min_domains: Option<u32>,
    #[serde(default)]
    pub node_affinity_policy: Option<NodeInclusionPolicy>,
    #[serde(default)]
    pub node_taints_policy: Option<NodeInclusionPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnsatisfiableAction {
    DoNotSchedule,
    ScheduleAnyway,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeInclusionPolicy {
    Honor,
    Ignore,
}

/// A host port the pod binds on its node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    #[serde(default)]
    pub ip: Option<IpAddr>,
    pub port: u16,
    #[serde(default = "HostPort::default_protocol")]
    pub protocol: Protocol,
}

impl HostPort {
    fn default_protocol() -> Protocol {
        Protocol::Tcp
    }

    pub fn tcp(port: u16) -> Self {
        HostPort { ip: None, port, protocol: Protocol::Tcp }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A volume mounted by a pod. Only claim-backed volumes constrain scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodVolume {
    pub name: String,
    #[serde(default)]
    pub claim_name: Option<String>,
}

/// Limits how many pods matched by the selector may be disrupted at once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodDisruptionBudget {
    pub metadata: ObjectMeta,
    pub selector: LabelSelector,
    pub disruptions_allowed: i32,
}

impl PodDisruptionBudget {
    /// True when evicting `pod` would violate this budget
    pub fn blocks(&self, pod: &Pod) -> bool {
        self.metadata.namespace == pod.metadata.namespace
            && self.selector.matches(&pod.metadata.labels)
            && self.disruptions_allowed <= 0
    }
}
