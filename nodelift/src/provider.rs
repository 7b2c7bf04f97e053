//! The cloud-provider boundary.
//!
//! Three operations: list what can be bought, buy it, return it. Pricing,
//! zones, and availability arrive embedded in the instance types.

use crate::api::{NodeClaim, NodeClaimSpec, NodePool};
use crate::scheduling::InstanceType;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    /// The provider has no capacity for any eligible instance type
    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    /// The referenced object no longer exists provider-side
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    /// Any other provider API failure; retryable
    #[error("provider error: {0}")]
    Api(String),
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Instance types purchasable for this pool, with offerings and pricing
    async fn get_instance_types(&self, node_pool: &NodePool) -> Result<Vec<Arc<InstanceType>>>;

    /// Begin creating a node for the claim; returns the claim as registered,
    /// including its assigned name and provider id
    async fn create(&self, claim: &NodeClaimSpec) -> Result<NodeClaim>;

    /// Terminate the node backing the named claim
    async fn delete(&self, claim_name: &str) -> Result<()>;
}
