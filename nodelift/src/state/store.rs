//! The object-store boundary.
//!
//! Durable objects live in the control plane's store; the core reads them
//! and patches status, taints, and deletions through this trait. Nothing
//! else crosses the boundary.

use super::error::Result;
use crate::api::{
    ConditionType, NodeClaim, NodePool, Pod, PodDisruptionBudget, Taint, VolumeResolver,
};
use async_trait::async_trait;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_pods(&self) -> Result<Vec<Pod>>;

    async fn list_node_pools(&self) -> Result<Vec<NodePool>>;

    async fn list_pod_disruption_budgets(&self) -> Result<Vec<PodDisruptionBudget>>;

    async fn get_node_claim(&self, name: &str) -> Result<NodeClaim>;

    /// Add a taint to a node, idempotently
    async fn taint_node(&self, node_name: &str, taint: Taint) -> Result<()>;

    /// Remove every taint with the given key from a node, idempotently
    async fn remove_node_taint(&self, node_name: &str, taint_key: &str) -> Result<()>;

    async fn set_node_claim_condition(
        &self,
        name: &str,
        condition_type: ConditionType,
        status: bool,
        reason: Option<String>,
    ) -> Result<()>;

    async fn clear_node_claim_condition(
        &self,
        name: &str,
        condition_type: ConditionType,
    ) -> Result<()>;

    /// Request deletion of a node claim; the termination controller drains
    /// and removes the backing node
    async fn delete_node_claim(&self, name: &str) -> Result<()>;

    /// Snapshot of volume objects for claim-to-driver resolution
    async fn volume_resolver(&self) -> Result<VolumeResolver>;
}
