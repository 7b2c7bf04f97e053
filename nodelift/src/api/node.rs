//! Live compute node model

use super::taints::Taint;
use super::ObjectMeta;
use crate::resources::ResourceList;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A node registered with the control plane
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Node {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub capacity: ResourceList,
    #[serde(default)]
    pub allocatable: ResourceList,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub provider_id: String,
    /// Maximum attachable volumes per CSI driver
    #[serde(default)]
    pub volume_limits: BTreeMap<String, usize>,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.metadata.labels
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.get(key).map(|s| s.as_str())
    }
}
