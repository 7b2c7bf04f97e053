//! Command validation: re-simulate before acting.
//!
//! A command is only as good as the cluster it was planned against. After a
//! stabilization wait, candidates are re-fetched under the same filters and
//! the simulation is re-run; candidate validation brackets the command
//! validation to catch a pod nominated between the two steps.

use super::budgets::build_budget_mapping;
use super::candidate::{build_candidates, Candidate};
use super::simulation::simulate;
use super::{Command, DisruptionContext, DisruptionError, DisruptionMethod};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Full validation gate: candidates, then the command, then candidates again
pub async fn validate(
    ctx: &DisruptionContext,
    method: &dyn DisruptionMethod,
    command: &Command,
) -> super::Result<()> {
    tokio::time::sleep(ctx.options.validation_stabilization).await;
    let validated = validate_candidates(ctx, method, command).await?;
    validate_command(ctx, command, &validated).await?;
    validate_candidates(ctx, method, command).await?;
    debug!(command = %command.id, "command survived validation");
    Ok(())
}

/// Re-fetch candidates under the method's filters and confirm every one of
/// the command's candidates is still present and still within budget
async fn validate_candidates(
    ctx: &DisruptionContext,
    method: &dyn DisruptionMethod,
    command: &Command,
) -> super::Result<Vec<Candidate>> {
    for candidate in &command.candidates {
        if ctx.cluster.is_nominated(candidate.provider_id()) {
            return Err(DisruptionError::Validation(format!(
                "candidate {} was nominated during validation",
                candidate.name()
            )));
        }
    }

    let fresh = build_candidates(ctx, method).await?;
    let by_id: HashMap<&str, &Candidate> =
        fresh.iter().map(|c| (c.provider_id(), c)).collect();
    let mut validated = Vec::with_capacity(command.candidates.len());
    let mut missing = 0usize;
    for candidate in &command.candidates {
        match by_id.get(candidate.provider_id()) {
            Some(current) => validated.push((*current).clone()),
            None => missing += 1,
        }
    }
    if missing > 0 {
        return Err(DisruptionError::Validation(format!(
            "{missing} candidates are no longer valid"
        )));
    }

    let budgets = build_budget_mapping(ctx, command.reason).await?;
    let mut per_pool: HashMap<&str, usize> = HashMap::new();
    for candidate in &command.candidates {
        *per_pool.entry(candidate.node_pool.name()).or_insert(0) += 1;
    }
    for (pool, count) in per_pool {
        if count > budgets.allows(pool) {
            return Err(DisruptionError::Validation(format!(
                "disruption budget for nodepool {pool:?} no longer allows this command"
            )));
        }
    }
    Ok(validated)
}

/// Re-simulate with the validated candidates removed and require the same
/// shape of outcome the planner promised
async fn validate_command(
    ctx: &DisruptionContext,
    command: &Command,
    candidates: &[Candidate],
) -> super::Result<()> {
    let results = match simulate(ctx, candidates).await {
        Ok(results) => results,
        Err(DisruptionError::CandidateDeleting) => {
            return Err(DisruptionError::Validation(
                "candidate began deleting during validation".to_string(),
            ))
        }
        Err(error) => return Err(error),
    };
    if !results.all_non_pending_pods_scheduled() {
        return Err(DisruptionError::Validation(format!(
            "not all pods would reschedule, {}",
            results.non_pending_errors().join("; ")
        )));
    }
    if results.new_nodes.len() != command.replacements.len() {
        return Err(DisruptionError::Validation(format!(
            "simulation produced {} new nodes, command expected {}",
            results.new_nodes.len(),
            command.replacements.len()
        )));
    }
    if command.replacements.len() == 1 {
        // same-or-cheaper invariant: everything the command offered must
        // still be achievable
        let produced: HashSet<&str> =
            results.new_nodes[0].instance_types.names().into_iter().collect();
        let unachievable = command.replacements[0]
            .instance_types
            .names()
            .into_iter()
            .any(|name| !produced.contains(name));
        if unachievable {
            return Err(DisruptionError::Validation(
                "replacement instance types are no longer achievable".to_string(),
            ));
        }
    }
    Ok(())
}
