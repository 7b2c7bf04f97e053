//! Node pools: named templates for families of nodes

use super::pod::NodeSelectorRequirement;
use super::taints::Taint;
use super::ObjectMeta;
use crate::resources::ResourceList;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A named specification for a family of nodes
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodePool {
    pub metadata: ObjectMeta,
    pub spec: NodePoolSpec,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodePoolSpec {
    /// Pools with higher weight are tried first
    #[serde(default)]
    pub weight: Option<i32>,
    pub template: NodePoolTemplate,
    /// Total resources the pool may hold across all of its nodes
    #[serde(default)]
    pub limits: Option<ResourceList>,
    #[serde(default)]
    pub disruption: DisruptionSpec,
    /// Bound on eventual-class disruption of pods that block gracefully
    #[serde(default)]
    pub termination_grace_period: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodePoolTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub requirements: Vec<NodeSelectorRequirement>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub startup_taints: Vec<Taint>,
    /// Nodes live at most this long before they are considered expired
    #[serde(default)]
    pub expire_after: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisruptionSpec {
    #[serde(default)]
    pub consolidation_policy: ConsolidationPolicy,
    /// How long a node must be idle/underutilized before consolidation
    #[serde(default)]
    pub consolidate_after: Option<Duration>,
    #[serde(default)]
    pub budgets: Vec<DisruptionBudget>,
}

impl Default for DisruptionSpec {
    fn default() -> Self {
        DisruptionSpec {
            consolidation_policy: ConsolidationPolicy::WhenEmptyOrUnderutilized,
            consolidate_after: None,
            budgets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConsolidationPolicy {
    WhenEmpty,
    #[default]
    WhenEmptyOrUnderutilized,
}

/// How many nodes in the pool may be disrupting at once, by reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisruptionBudget {
    pub nodes: BudgetValue,
    /// Reasons this budget applies to; empty means all
    #[serde(default)]
    pub reasons: Vec<crate::disruption::DisruptionReason>,
}

/// An absolute node count or a percentage of pool size
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetValue {
    Count(u32),
    Percent(u32),
}

impl BudgetValue {
    /// Resolve against the pool's current node count, rounding percentages down
    pub fn resolve(&self, total_nodes: usize) -> usize {
        match self {
            BudgetValue::Count(n) => *n as usize,
            BudgetValue::Percent(p) => (total_nodes * (*p as usize)) / 100,
        }
    }
}

impl std::fmt::Display for BudgetValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetValue::Count(n) => write!(f, "{n}"),
            BudgetValue::Percent(p) => write!(f, "{p}%"),
        }
    }
}

impl std::str::FromStr for BudgetValue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(percent) = s.strip_suffix('%') {
            let p: u32 = percent.parse().map_err(|_| format!("unparseable budget {s:?}"))?;
            if p > 100 {
                return Err(format!("budget percentage {p} exceeds 100"));
            }
            return Ok(BudgetValue::Percent(p));
        }
        s.parse().map(BudgetValue::Count).map_err(|_| format!("unparseable budget {s:?}"))
    }
}

impl Serialize for BudgetValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BudgetValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl NodePool {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// True when the pool consolidates nodes that still hold pods
    pub fn consolidates_underutilized(&self) -> bool {
        self.spec.disruption.consolidation_policy == ConsolidationPolicy::WhenEmptyOrUnderutilized
    }

    /// The smallest budget matching `reason`, resolved against pool size.
    ///
    /// Pools without budgets allow unbounded disruption.
    pub fn allowed_disruptions(
        &self,
        reason: crate::disruption::DisruptionReason,
        total_nodes: usize,
    ) -> usize {
        self.spec
            .disruption
            .budgets
            .iter()
            .filter(|b| b.reasons.is_empty() || b.reasons.contains(&reason))
            .map(|b| b.nodes.resolve(total_nodes))
            .min()
            .unwrap_or(total_nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disruption::DisruptionReason;

    #[test]
    fn budget_values_parse_and_resolve() {
        let count: BudgetValue = "10".parse().unwrap();
        assert_eq!(count.resolve(100), 10);

        let percent: BudgetValue = "50%".parse().unwrap();
        assert_eq!(percent.resolve(9), 4); // rounds down

        assert!("150%".parse::<BudgetValue>().is_err());
        assert!("ten".parse::<BudgetValue>().is_err());
    }

    #[test]
    fn allowed_disruptions_takes_minimum_matching_budget() {
        let mut pool = NodePool::default();
        pool.spec.disruption.budgets = vec![
            DisruptionBudget { nodes: BudgetValue::Count(5), reasons: vec![] },
            DisruptionBudget {
                nodes: BudgetValue::Count(2),
                reasons: vec![DisruptionReason::Drifted],
            },
        ];
        assert_eq!(pool.allowed_disruptions(DisruptionReason::Drifted, 10), 2);
        assert_eq!(pool.allowed_disruptions(DisruptionReason::Underutilized, 10), 5);

        pool.spec.disruption.budgets.clear();
        assert_eq!(pool.allowed_disruptions(DisruptionReason::Empty, 10), 10);
    }
}
