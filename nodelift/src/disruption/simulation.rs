//! Re-running the scheduler with candidates withheld

use super::candidate::Candidate;
use super::{DisruptionContext, DisruptionError};
use crate::api::{Pod, Uid};
use crate::scheduling::{Results, SchedulingError};
use crate::state::StateNode;
use std::collections::HashSet;

/// Simulate the cluster without `candidates`: can their pods, plus the pods
/// of any node already deleting, land on the remaining and new nodes?
pub async fn simulate(
    ctx: &DisruptionContext,
    candidates: &[Candidate],
) -> super::Result<Results> {
    let candidate_ids: HashSet<&str> =
        candidates.iter().map(|c| c.provider_id()).collect();
    let nodes = ctx.cluster.nodes();

    // a candidate that started deleting since selection invalidates the plan
    if nodes.iter().any(|n| n.deleting() && candidate_ids.contains(n.provider_id())) {
        return Err(DisruptionError::CandidateDeleting);
    }

    let deleting: Vec<&StateNode> = nodes.iter().filter(|n| n.deleting()).collect();
    let deleting_pod_uids: HashSet<Uid> = deleting
        .iter()
        .flat_map(|n| n.reschedulable_pods())
        .map(|p| p.uid().clone())
        .collect();

    let state_nodes: Vec<StateNode> = nodes
        .iter()
        .filter(|n| !n.deleting() && !candidate_ids.contains(n.provider_id()))
        .cloned()
        .collect();

    let mut pods: Vec<Pod> = candidates.iter().flat_map(|c| c.pods.clone()).collect();
    pods.extend(deleting.iter().flat_map(|n| n.reschedulable_pods()));

    let scheduler = ctx.provisioner.new_scheduler(&state_nodes, &pods).await?;
    let mut results = scheduler.solve(pods);

    // relying on a node that has not initialized is building on sand, unless
    // the pod was already adrift on a deleting node
    let mut uninitialized_errors = Vec::new();
    for node in &results.existing_nodes {
        if node.initialized {
            continue;
        }
        for pod in &node.pods {
            if !deleting_pod_uids.contains(pod.uid()) {
                uninitialized_errors.push((
                    pod.clone(),
                    SchedulingError::UninitializedNode { node: node.name.clone() },
                ));
            }
        }
    }
    results.pod_errors.extend(uninitialized_errors);
    Ok(results)
}
