//! Multi-node consolidation: binary search for the largest removable prefix

use super::budgets::BudgetMapping;
use super::candidate::Candidate;
use super::consolidation::{compute, consolidatable, ConsolidationDecision};
use super::{
    Command, DisruptionClass, DisruptionContext, DisruptionError, DisruptionMethod,
    DisruptionReason,
};
use crate::metrics;
use crate::scheduling::{InstanceTypes, NewNode, Results};
use async_trait::async_trait;
use std::collections::HashSet;
use tokio::time::Instant;
use tracing::{debug, warn};

pub struct MultiNodeConsolidation;

#[async_trait]
impl DisruptionMethod for MultiNodeConsolidation {
    fn reason(&self) -> DisruptionReason {
        DisruptionReason::Underutilized
    }

    fn class(&self) -> DisruptionClass {
        DisruptionClass::Graceful
    }

    fn consolidation_type(&self) -> &'static str {
        "multi"
    }

    fn should_disrupt(&self, candidate: &Candidate) -> bool {
        consolidatable(candidate, true)
    }

    async fn compute_command(
        &self,
        ctx: &DisruptionContext,
        budgets: &mut BudgetMapping,
        candidates: Vec<Candidate>,
    ) -> super::Result<(Command, Option<Results>)> {
        // budget filter preserves cost order; empty nodes are not ours
        let mut constrained = Vec::new();
        for candidate in candidates {
            if candidate.is_empty() {
                continue;
            }
            if budgets.consume(candidate.node_pool.name()) {
                constrained.push(candidate);
            }
        }
        let max_n = constrained.len().min(ctx.options.max_consolidation_candidates);
        if max_n == 0 {
            return Ok((Command::no_op(self.reason(), self.consolidation_type()), None));
        }

        let deadline = Instant::now() + ctx.options.multi_node_timeout;
        let mut best: Option<(Command, Results)> = None;
        let (mut lo, mut hi) = (1usize, max_n);
        while lo <= hi {
            if Instant::now() >= deadline {
                metrics::counter_inc(
                    metrics::CONSOLIDATION_TIMEOUTS_TOTAL,
                    &[("consolidation_type", self.consolidation_type())],
                );
                if best.is_none() {
                    warn!("multi-node consolidation timed out without finding a valid command");
                }
                break;
            }
            let mid = (lo + hi) / 2;
            let subset = &constrained[..mid];
            let (decision, results) = match compute(ctx, subset).await {
                Ok(outcome) => outcome,
                Err(DisruptionError::CandidateDeleting) => {
                    return Ok((Command::no_op(self.reason(), self.consolidation_type()), None))
                }
                Err(error) => return Err(error),
            };
            let valid = match decision {
                ConsolidationDecision::Delete => Some(Command::new(
                    subset.to_vec(),
                    Vec::new(),
                    self.reason(),
                    self.consolidation_type(),
                )),
                ConsolidationDecision::Replace(mut replacement) => {
                    if filter_out_same_type(&mut replacement, subset) {
                        Some(Command::new(
                            subset.to_vec(),
                            vec![replacement],
                            self.reason(),
                            self.consolidation_type(),
                        ))
                    } else {
                        None
                    }
                }
                ConsolidationDecision::NoOp => None,
            };
            match (valid, results) {
                (Some(command), Some(results)) => {
                    debug!(nodes = mid, "multi-node consolidation can remove a larger prefix");
                    best = Some((command, results));
                    lo = mid + 1;
                }
                _ => {
                    if mid == 1 {
                        break;
                    }
                    hi = mid - 1;
                }
            }
        }
        match best {
            Some((command, results)) => Ok((command, Some(results))),
            None => Ok((Command::no_op(self.reason(), self.consolidation_type()), None)),
        }
    }
}

/// Guard against sham consolidations that remove one of N identical nodes.
///
/// When the replacement's eligible list shares a type name with the removed
/// candidates, keep only types strictly cheaper than the cheapest node being
/// removed. Returns false when nothing useful remains.
fn filter_out_same_type(replacement: &mut NewNode, candidates: &[Candidate]) -> bool {
    let existing: HashSet<&str> = candidates
        .iter()
        .filter_map(|c| c.instance_type.as_ref())
        .map(|it| it.name.as_str())
        .collect();
    let overlaps = replacement.instance_types.iter().any(|it| existing.contains(it.name.as_str()));
    if !overlaps {
        return !replacement.instance_types.is_empty();
    }
    let mut min_existing_price = f64::MAX;
    for candidate in candidates {
        if let Some(price) = candidate.price() {
            min_existing_price = min_existing_price.min(price);
        }
    }
    match replacement
        .instance_types
        .remove_by_price(&replacement.requirements, min_existing_price)
    {
        Ok(cheaper) if !cheaper.is_empty() => {
            replacement.instance_types = InstanceTypes::new(cheaper.0);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{labels, NodePool, ObjectMeta};
    use crate::resources::{Quantity, ResourceList, CPU, MEMORY, PODS};
    use crate::scheduling::{
        InstanceType, NodeClaimTemplate, Offering, Offerings, Requirement, Requirements, Topology,
    };
    use crate::state::StateNode;
    use std::sync::Arc;

    fn shape(name: &str, cpu: i64, price: f64) -> Arc<InstanceType> {
        let mut capacity = ResourceList::new();
        capacity.insert(CPU, Quantity::from_units(cpu));
        capacity.insert(MEMORY, Quantity::from_gi(cpu * 2));
        capacity.insert(PODS, Quantity::from_units(110));
        let mut requirements = Requirements::new();
        requirements.add(Requirement::new_in(labels::INSTANCE_TYPE, [name]));
        requirements.add(Requirement::new_in(labels::ZONE, ["a"]));
        requirements.add(Requirement::new_in(
            labels::CAPACITY_TYPE,
            [labels::CAPACITY_TYPE_ON_DEMAND],
        ));
        Arc::new(InstanceType {
            name: name.to_string(),
            requirements,
            capacity: capacity.clone(),
            allocatable: capacity,
            offerings: Offerings(vec![Offering::new(
                "a",
                labels::CAPACITY_TYPE_ON_DEMAND,
                price,
            )]),
        })
    }

    fn candidate_of(it: Arc<InstanceType>) -> Candidate {
        let mut node = crate::api::Node::default();
        node.metadata = ObjectMeta::named(format!("node-{}", it.name));
        node.metadata.labels.insert(labels::INSTANCE_TYPE.to_string(), it.name.clone());
        node.metadata.labels.insert(labels::ZONE.to_string(), "a".to_string());
        node.metadata
            .labels
            .insert(labels::CAPACITY_TYPE.to_string(), labels::CAPACITY_TYPE_ON_DEMAND.to_string());
        node.provider_id = format!("provider://{}", it.name);
        Candidate {
            state: StateNode { node: Some(node), ..Default::default() },
            node_pool: NodePool::default(),
            instance_type: Some(it),
            capacity_type: labels::CAPACITY_TYPE_ON_DEMAND.to_string(),
            zone: "a".to_string(),
            pods: vec![],
            disruption_cost: 0.0,
        }
    }

    fn replacement_with(types: Vec<Arc<InstanceType>>) -> NewNode {
        let mut pool = NodePool::default();
        pool.metadata = ObjectMeta::named("default");
        let template = Arc::new(NodeClaimTemplate::from_pool(&pool).unwrap());
        let mut topology =
            Topology::new(vec![], std::collections::HashMap::new(), std::collections::HashSet::new())
                .unwrap();
        NewNode::new(template, &mut topology, ResourceList::new(), InstanceTypes::new(types))
    }

    #[test]
    fn same_type_filter_drops_types_at_or_above_cheapest_removed() {
        let small = shape("small", 2, 1.0);
        let large = shape("large", 8, 4.0);
        // removing two larges; replacement offers small, large
        let candidates = vec![candidate_of(large.clone()), candidate_of(large.clone())];
        let mut replacement = replacement_with(vec![small.clone(), large.clone()]);

        assert!(filter_out_same_type(&mut replacement, &candidates));
        // "large" is priced at the removed set's minimum (4.0), so only the
        // strictly cheaper "small" survives
        assert_eq!(replacement.instance_types.names(), vec!["small"]);
    }

    #[test]
    fn no_overlap_leaves_replacement_untouched() {
        let small = shape("small", 2, 1.0);
        let medium = shape("medium", 4, 2.0);
        let large = shape("large", 8, 4.0);
        let candidates = vec![candidate_of(large)];
        let mut replacement = replacement_with(vec![small, medium]);

        assert!(filter_out_same_type(&mut replacement, &candidates));
        assert_eq!(replacement.instance_types.names(), vec!["small", "medium"]);
    }

    #[test]
    fn filter_fails_when_nothing_cheaper_remains() {
        let large = shape("large", 8, 4.0);
        let candidates = vec![candidate_of(large.clone())];
        let mut replacement = replacement_with(vec![large]);
        assert!(!filter_out_same_type(&mut replacement, &candidates));
    }
}
