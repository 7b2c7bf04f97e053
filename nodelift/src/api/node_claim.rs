//! Node claims: desired nodes not yet (or just) realized by the cloud provider

use super::pod::NodeSelectorRequirement;
use super::taints::Taint;
use super::{Condition, ConditionType, ObjectMeta};
use crate::resources::ResourceList;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A desired node known to the control plane
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeClaim {
    pub metadata: ObjectMeta,
    pub spec: NodeClaimSpec,
    #[serde(default)]
    pub status: NodeClaimStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeClaimSpec {
    /// Node pool this claim was created for
    pub node_pool: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub requirements: Vec<NodeSelectorRequirement>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// Taints removed automatically once the node initializes
    #[serde(default)]
    pub startup_taints: Vec<Taint>,
    /// Resource requests the claim was sized for
    #[serde(default)]
    pub resources: ResourceList,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeClaimStatus {
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl NodeClaim {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.status.conditions.iter().find(|c| c.condition_type == condition_type)
    }

    pub fn has_condition(&self, condition_type: ConditionType) -> bool {
        self.condition(condition_type).is_some_and(|c| c.status)
    }

    pub fn is_launched(&self) -> bool {
        self.has_condition(ConditionType::Launched)
    }

    pub fn is_initialized(&self) -> bool {
        self.has_condition(ConditionType::Initialized)
    }

    pub fn is_drifted(&self) -> bool {
        self.has_condition(ConditionType::Drifted)
    }

    pub fn is_consolidatable(&self) -> bool {
        self.has_condition(ConditionType::Consolidatable)
    }

    /// When the claim was last marked drifted, if it is
    pub fn drifted_since(&self) -> Option<DateTime<Utc>> {
        self.condition(ConditionType::Drifted).filter(|c| c.status).map(|c| c.last_transition)
    }

    /// Set or replace a status condition
    pub fn set_condition(&mut self, condition_type: ConditionType, status: bool, reason: Option<String>) {
        let condition = Condition {
            condition_type,
            status,
            reason,
            last_transition: Utc::now(),
        };
        match self.status.conditions.iter_mut().find(|c| c.condition_type == condition_type) {
            Some(existing) => *existing = condition,
            None => self.status.conditions.push(condition),
        }
    }

    /// Drop a status condition entirely
    pub fn clear_condition(&mut self, condition_type: ConditionType) {
        self.status.conditions.retain(|c| c.condition_type != condition_type);
    }
}
