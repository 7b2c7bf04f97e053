//! Object shapes the core reads from and patches into the control plane.
//!
//! The control-plane store itself is an external collaborator; these types
//! define only the fields the autoscaling core consumes.

pub mod labels;
pub mod node;
pub mod node_claim;
pub mod node_pool;
pub mod pod;
pub mod storage;
pub mod taints;

pub use node::Node;
pub use node_claim::{NodeClaim, NodeClaimSpec, NodeClaimStatus};
pub use node_pool::{BudgetValue, ConsolidationPolicy, DisruptionBudget, NodePool, NodePoolSpec};
pub use pod::{
    Affinity, HostPort, NodeAffinity, NodeInclusionPolicy, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, Pod, PodAffinity, PodAffinityTerm, PodAntiAffinity, PodDisruptionBudget,
    PodPhase, PodSpec, PodStatus, PodVolume, PreferredSchedulingTerm, Protocol,
    TopologySpreadConstraint, UnsatisfiableAction, WeightedPodAffinityTerm,
};
pub use storage::{PersistentVolume, PersistentVolumeClaim, StorageClass, VolumeResolver};
pub use taints::{Taint, TaintEffect, Toleration, TolerationOperator};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stable object identity
pub type Uid = String;

/// Common object metadata
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: Uid,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        ObjectMeta { uid: name.clone(), name, ..Default::default() }
    }

    /// The owner that controls this object, if any
    pub fn controller(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }
}

/// Reference from an object to its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub controller: bool,
}

/// Selector operators shared by node selectors and label selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operator::In => write!(f, "In"),
            Operator::NotIn => write!(f, "NotIn"),
            Operator::Exists => write!(f, "Exists"),
            Operator::DoesNotExist => write!(f, "DoesNotExist"),
            Operator::Gt => write!(f, "Gt"),
            Operator::Lt => write!(f, "Lt"),
        }
    }
}

/// A label query over a set of objects
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    pub fn matching(labels: BTreeMap<String, String>) -> Self {
        LabelSelector { match_labels: labels, match_expressions: Vec::new() }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        for (key, value) in &self.match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
        self.match_expressions.iter().all(|req| req.matches(labels))
    }
}

/// One expression of a [`LabelSelector`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: Operator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelSelectorRequirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::In => value.is_some_and(|v| self.values.iter().any(|x| x == v)),
            Operator::NotIn => !value.is_some_and(|v| self.values.iter().any(|x| x == v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
            Operator::Gt => Self::numeric(value) > Self::numeric(self.values.first().map(|s| s.as_str())),
            Operator::Lt => Self::numeric(value) < Self::numeric(self.values.first().map(|s| s.as_str())),
        }
    }

    fn numeric<S: AsRef<str>>(value: Option<S>) -> i64 {
        value.and_then(|v| v.as_ref().parse().ok()).unwrap_or(i64::MIN)
    }
}

/// Status condition on a node claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub condition_type: ConditionType,
    pub status: bool,
    #[serde(default)]
    pub reason: Option<String>,
    pub last_transition: DateTime<Utc>,
}

/// Condition kinds tracked on node claims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Launched,
    Initialized,
    Drifted,
    Consolidatable,
    Disrupted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_selector_matches() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());
        labels.insert("tier".to_string(), "frontend".to_string());

        let selector = LabelSelector::matching([("app".to_string(), "web".to_string())].into());
        assert!(selector.matches(&labels));

        let selector = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![LabelSelectorRequirement {
                key: "tier".to_string(),
                operator: Operator::NotIn,
                values: vec!["backend".to_string()],
            }],
        };
        assert!(selector.matches(&labels));

        let selector = LabelSelector::matching([("app".to_string(), "db".to_string())].into());
        assert!(!selector.matches(&labels));
    }
}
