//! Turning live nodes into disruption candidates

use super::{DisruptionClass, DisruptionContext, DisruptionMethod};
use crate::api::{labels, NodePool, Pod, PodDisruptionBudget};
use crate::scheduling::InstanceType;
use crate::state::StateNode;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// A live node that a method may want to remove or replace
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Deep-copied state; mutating it never touches the projection
    pub state: StateNode,
    pub node_pool: NodePool,
    pub instance_type: Option<Arc<InstanceType>>,
    pub capacity_type: String,
    pub zone: String,
    /// Pods that must find a new home if this node goes away
    pub pods: Vec<Pod>,
    /// Lower cost means safer to disrupt; candidates are visited in order
    pub disruption_cost: f64,
}

impl Candidate {
    pub fn name(&self) -> &str {
        self.state.name()
    }

    pub fn provider_id(&self) -> &str {
        self.state.provider_id()
    }

    pub fn claim_name(&self) -> Option<&str> {
        self.state.node_claim.as_ref().map(|c| c.name())
    }

    /// What this node currently costs, from its exact offering
    pub fn price(&self) -> Option<f64> {
        let instance_type = self.instance_type.as_ref()?;
        instance_type
            .offerings
            .for_zone_and_capacity(&self.zone, &self.capacity_type)
            .map(|o| o.price)
            .or_else(|| {
                instance_type.cheapest_price(&crate::scheduling::Requirements::new())
            })
    }

    pub fn is_spot(&self) -> bool {
        self.capacity_type == labels::CAPACITY_TYPE_SPOT
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}

/// Build the cost-ordered candidate list for one method.
///
/// A node qualifies only when it is managed, initialized, not deleting, not
/// already queued for disruption, not nominated for a pending pod, and its
/// pods can actually be evicted under the method's disruption class.
pub async fn build_candidates(
    ctx: &DisruptionContext,
    method: &dyn DisruptionMethod,
) -> super::Result<Vec<Candidate>> {
    let pdbs = ctx.store.list_pod_disruption_budgets().await?;
    let pools: HashMap<String, NodePool> = ctx
        .store
        .list_node_pools()
        .await?
        .into_iter()
        .map(|p| (p.name().to_string(), p))
        .collect();
    let mut instance_types: HashMap<String, HashMap<String, Arc<InstanceType>>> = HashMap::new();
    for pool in pools.values() {
        let types = ctx.provider.get_instance_types(pool).await?;
        instance_types.insert(
            pool.name().to_string(),
            types.into_iter().map(|it| (it.name.clone(), it)).collect(),
        );
    }

    let mut candidates = Vec::new();
    for state in ctx.cluster.nodes() {
        let Some(candidate) =
            make_candidate(ctx, state, &pools, &instance_types, &pdbs, method.class())
        else {
            continue;
        };
        if method.should_disrupt(&candidate) {
            candidates.push(candidate);
        }
    }
    candidates.sort_by(|a, b| a.disruption_cost.total_cmp(&b.disruption_cost));
    Ok(candidates)
}

fn make_candidate(
    ctx: &DisruptionContext,
    state: StateNode,
    pools: &HashMap<String, NodePool>,
    instance_types: &HashMap<String, HashMap<String, Arc<InstanceType>>>,
    pdbs: &[PodDisruptionBudget],
    class: DisruptionClass,
) -> Option<Candidate> {
    if !state.managed() || !state.initialized() || state.deleting() {
        return None;
    }
    let pool = pools.get(state.node_pool()?)?.clone();
    if ctx.queue.contains(state.provider_id()) {
        trace!(node = state.name(), "skipping candidate already in the disruption queue");
        return None;
    }
    if ctx.cluster.is_nominated(state.provider_id()) {
        trace!(node = state.name(), "skipping candidate nominated for a pending pod");
        return None;
    }

    let pods = state.reschedulable_pods();
    // eventual disruption with a grace period may override pod-level blocks
    let blockable = class == DisruptionClass::Graceful
        || pool.spec.termination_grace_period.is_none();
    if blockable {
        for pod in &pods {
            if pod.has_do_not_disrupt() {
                trace!(node = state.name(), pod = %pod.metadata.name, "skipping candidate with do-not-disrupt pod");
                return None;
            }
            if pdbs.iter().any(|pdb| pdb.blocks(pod)) {
                trace!(node = state.name(), pod = %pod.metadata.name, "skipping candidate with blocking pod disruption budget");
                return None;
            }
        }
    }

    let node_labels = state.labels();
    let instance_type = node_labels
        .get(labels::INSTANCE_TYPE)
        .and_then(|name| instance_types.get(pool.name())?.get(name))
        .cloned();
    let capacity_type =
        node_labels.get(labels::CAPACITY_TYPE).cloned().unwrap_or_default();
    let zone = node_labels.get(labels::ZONE).cloned().unwrap_or_default();

    let disruption_cost = rescheduling_cost(&pods) * lifetime_remaining(&pool, &state);
    Some(Candidate {
        state,
        node_pool: pool,
        instance_type,
        capacity_type,
        zone,
        pods,
        disruption_cost,
    })
}

/// Sum of per-pod eviction weights. One per pod, plus whatever the workload
/// declares through its eviction-cost annotation.
pub fn rescheduling_cost(pods: &[Pod]) -> f64 {
    pods.iter()
        .map(|pod| {
            let declared = pod
                .metadata
                .annotations
                .get(labels::EVICTION_COST_ANNOTATION)
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0)
                .clamp(0.0, 100.0);
            1.0 + declared
        })
        .sum()
}

/// Fraction of the node's configured lifetime still ahead of it. Disrupting
/// a node that is about to expire anyway is nearly free.
pub fn lifetime_remaining(pool: &NodePool, state: &StateNode) -> f64 {
    let Some(expire_after) = pool.spec.template.expire_after else { return 1.0 };
    let Some(created) = state.creation_timestamp() else { return 1.0 };
    let age = (Utc::now() - created).to_std().unwrap_or_default();
    let ratio = age.as_secs_f64() / expire_after.as_secs_f64().max(f64::MIN_POSITIVE);
    (1.0 - ratio).clamp(0.0, 1.0)
}
