//! Shared consolidation machinery: simulate, compare prices, gate spot churn

use super::candidate::Candidate;
use super::simulation::simulate;
use super::DisruptionContext;
use crate::api::labels;
use crate::events::Event;
use crate::scheduling::{NewNode, Results};
use tracing::debug;

/// What a consolidation simulation concluded for a candidate set
#[derive(Debug)]
pub enum ConsolidationDecision {
    NoOp,
    Delete,
    Replace(NewNode),
}

/// Whether consolidation may touch this candidate at all.
///
/// `underutilized` distinguishes the consolidation planners (which need the
/// pool to allow removing non-empty nodes) from emptiness. Pools with a
/// consolidate-after delay require the lifecycle-managed `Consolidatable`
/// condition before a node becomes fair game.
pub fn consolidatable(candidate: &Candidate, underutilized: bool) -> bool {
    if underutilized && !candidate.node_pool.consolidates_underutilized() {
        return false;
    }
    if candidate.node_pool.spec.disruption.consolidate_after.is_some() {
        return candidate
            .state
            .node_claim
            .as_ref()
            .is_some_and(|claim| claim.is_consolidatable());
    }
    true
}

/// Simulate removing `candidates` and decide what that buys.
///
/// - every reschedulable pod must land somewhere, or nothing happens;
/// - zero new nodes means the candidates can simply be deleted;
/// - exactly one new node can replace them, but only when its worst-case
///   launch is strictly cheaper than what the candidates cost today.
pub async fn compute(
    ctx: &DisruptionContext,
    candidates: &[Candidate],
) -> super::Result<(ConsolidationDecision, Option<Results>)> {
    let results = simulate(ctx, candidates).await?;

    if !results.all_non_pending_pods_scheduled() {
        let reasons = results.non_pending_errors().join("; ");
        for candidate in candidates {
            ctx.recorder.publish(Event::Unconsolidatable {
                node: candidate.name().to_string(),
                reason: format!("not all pods would schedule, {reasons}"),
            });
        }
        return Ok((ConsolidationDecision::NoOp, Some(results)));
    }

    if results.new_nodes.is_empty() {
        return Ok((ConsolidationDecision::Delete, Some(results)));
    }
    if results.new_nodes.len() != 1 {
        // replacing many with many is churn, not consolidation
        return Ok((ConsolidationDecision::NoOp, Some(results)));
    }

    let mut current_total = 0.0;
    for candidate in candidates {
        let Some(price) = candidate.price() else {
            ctx.recorder.publish(Event::Unconsolidatable {
                node: candidate.name().to_string(),
                reason: "unable to determine the current offering price".to_string(),
            });
            return Ok((ConsolidationDecision::NoOp, Some(results)));
        };
        current_total += price;
    }

    let mut replacement = results.new_nodes[0].clone();
    let ordered = replacement.instance_types.order_by_price(&replacement.requirements);
    let cheaper = match ordered.remove_by_price(&replacement.requirements, current_total) {
        Ok(cheaper) => cheaper,
        Err(error) => {
            for candidate in candidates {
                ctx.recorder.publish(Event::Unconsolidatable {
                    node: candidate.name().to_string(),
                    reason: error.to_string(),
                });
            }
            return Ok((ConsolidationDecision::NoOp, Some(results)));
        }
    };
    if cheaper.is_empty() {
        for candidate in candidates {
            ctx.recorder.publish(Event::Unconsolidatable {
                node: candidate.name().to_string(),
                reason: "can't replace with a cheaper node".to_string(),
            });
        }
        return Ok((ConsolidationDecision::NoOp, Some(results)));
    }
    replacement.instance_types = cheaper;

    if candidates.iter().all(Candidate::is_spot) && only_spot(&replacement) {
        if let Some(decision) =
            gate_spot_to_spot(ctx, candidates, &mut replacement, &results)?
        {
            return Ok((decision, Some(results)));
        }
    }

    debug!(
        candidates = candidates.len(),
        options = replacement.instance_types.len(),
        "consolidation found a cheaper replacement"
    );
    Ok((ConsolidationDecision::Replace(replacement), Some(results)))
}

/// True when the replacement could only ever launch as spot capacity
fn only_spot(replacement: &NewNode) -> bool {
    if let Some(req) = replacement.requirements.get(labels::CAPACITY_TYPE) {
        if !req.has(labels::CAPACITY_TYPE_SPOT) {
            return false;
        }
        if req.cardinality() == Some(1) {
            return true;
        }
    }
    replacement.instance_types.iter().all(|it| it.only_spot(&replacement.requirements))
}

/// Spot placement is cost-and-availability driven; replacing spot with spot
/// off a short list just oscillates. Demand enough flexibility, and truncate
/// to exactly that bound so later launches keep the same freedom.
fn gate_spot_to_spot(
    ctx: &DisruptionContext,
    candidates: &[Candidate],
    replacement: &mut NewNode,
    _results: &Results,
) -> super::Result<Option<ConsolidationDecision>> {
    let mut required = ctx.options.spot_min_flexibility;
    if replacement.requirements.has_min_values() {
        match replacement
            .requirements
            .satisfies_min_values(&replacement.instance_types.0)
        {
            Ok(prefix) => required = required.max(prefix),
            Err(error) => {
                for candidate in candidates {
                    ctx.recorder.publish(Event::Unconsolidatable {
                        node: candidate.name().to_string(),
                        reason: error.to_string(),
                    });
                }
                return Ok(Some(ConsolidationDecision::NoOp));
            }
        }
    }
    if replacement.instance_types.len() < required {
        for candidate in candidates {
            ctx.recorder.publish(Event::Unconsolidatable {
                node: candidate.name().to_string(),
                reason: format!(
                    "spot-to-spot consolidation requires {} cheaper instance type options than the current candidate, got {}",
                    required,
                    replacement.instance_types.len()
                ),
            });
        }
        return Ok(Some(ConsolidationDecision::NoOp));
    }
    replacement.instance_types = crate::scheduling::InstanceTypes::new(
        replacement.instance_types.0.iter().take(required).cloned().collect(),
    );
    Ok(None)
}
