//! Replacing nodes whose realized configuration no longer matches their pool

use super::budgets::BudgetMapping;
use super::candidate::Candidate;
use super::simulation::simulate;
use super::{
    Command, DisruptionClass, DisruptionContext, DisruptionError, DisruptionMethod,
    DisruptionReason,
};
use crate::events::Event;
use crate::scheduling::Results;
use async_trait::async_trait;
use tracing::debug;

pub struct Drift;

#[async_trait]
impl DisruptionMethod for Drift {
    fn reason(&self) -> DisruptionReason {
        DisruptionReason::Drifted
    }

    fn class(&self) -> DisruptionClass {
        DisruptionClass::Graceful
    }

    fn consolidation_type(&self) -> &'static str {
        ""
    }

    fn should_disrupt(&self, candidate: &Candidate) -> bool {
        candidate.state.node_claim.as_ref().is_some_and(|c| c.is_drifted())
    }

    async fn compute_command(
        &self,
        ctx: &DisruptionContext,
        budgets: &mut BudgetMapping,
        candidates: Vec<Candidate>,
    ) -> super::Result<(Command, Option<Results>)> {
        // oldest drift first; it has waited the longest
        let mut candidates = candidates;
        candidates.sort_by_key(|c| c.state.node_claim.as_ref().and_then(|claim| claim.drifted_since()));

        for candidate in candidates {
            if budgets.allows(candidate.node_pool.name()) == 0 {
                continue;
            }
            let results = match simulate(ctx, std::slice::from_ref(&candidate)).await {
                Ok(results) => results,
                Err(DisruptionError::CandidateDeleting) => continue,
                Err(error) => return Err(error),
            };
            if !results.all_non_pending_pods_scheduled() {
                ctx.recorder.publish(Event::Blocked {
                    node: candidate.name().to_string(),
                    reason: format!(
                        "pods would fail to reschedule, {}",
                        results.non_pending_errors().join("; ")
                    ),
                });
                continue;
            }
            debug!(node = candidate.name(), replacements = results.new_nodes.len(), "replacing drifted node");
            let command = Command::new(
                vec![candidate],
                results.new_nodes.clone(),
                self.reason(),
                self.consolidation_type(),
            );
            return Ok((command, Some(results)));
        }
        Ok((Command::no_op(self.reason(), self.consolidation_type()), None))
    }
}
