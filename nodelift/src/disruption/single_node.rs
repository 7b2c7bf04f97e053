//! Single-node consolidation: delete or replace one node at a time

use super::budgets::BudgetMapping;
use super::candidate::Candidate;
use super::consolidation::{compute, consolidatable, ConsolidationDecision};
use super::{
    Command, DisruptionClass, DisruptionContext, DisruptionError, DisruptionMethod,
    DisruptionReason,
};
use crate::metrics;
use crate::scheduling::Results;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

pub struct SingleNodeConsolidation;

#[async_trait]
impl DisruptionMethod for SingleNodeConsolidation {
    fn reason(&self) -> DisruptionReason {
        DisruptionReason::Underutilized
    }

    fn class(&self) -> DisruptionClass {
        DisruptionClass::Graceful
    }

    fn consolidation_type(&self) -> &'static str {
        "single"
    }

    fn should_disrupt(&self, candidate: &Candidate) -> bool {
        consolidatable(candidate, true)
    }

    /// Walk candidates cheapest-to-disrupt first until one yields a delete
    /// or a strictly cheaper replacement, bounded by a pass-wide timeout
    async fn compute_command(
        &self,
        ctx: &DisruptionContext,
        budgets: &mut BudgetMapping,
        candidates: Vec<Candidate>,
    ) -> super::Result<(Command, Option<Results>)> {
        let deadline = Instant::now() + ctx.options.single_node_timeout;
        for candidate in candidates {
            if Instant::now() >= deadline {
                metrics::counter_inc(
                    metrics::CONSOLIDATION_TIMEOUTS_TOTAL,
                    &[("consolidation_type", self.consolidation_type())],
                );
                warn!("single-node consolidation timed out before finishing the candidate list");
                break;
            }
            // empty nodes belong to the emptiness planner; if one is still
            // here, budgets held it back there too
            if candidate.is_empty() {
                continue;
            }
            if budgets.allows(candidate.node_pool.name()) == 0 {
                continue;
            }
            let (decision, results) = match compute(ctx, std::slice::from_ref(&candidate)).await {
                Ok(outcome) => outcome,
                Err(DisruptionError::CandidateDeleting) => continue,
                Err(error) => return Err(error),
            };
            match decision {
                ConsolidationDecision::NoOp => continue,
                ConsolidationDecision::Delete => {
                    debug!(node = candidate.name(), "consolidating node away entirely");
                    return Ok((
                        Command::new(
                            vec![candidate],
                            Vec::new(),
                            self.reason(),
                            self.consolidation_type(),
                        ),
                        results,
                    ));
                }
                ConsolidationDecision::Replace(replacement) => {
                    debug!(node = candidate.name(), "consolidating node into a cheaper replacement");
                    return Ok((
                        Command::new(
                            vec![candidate],
                            vec![replacement],
                            self.reason(),
                            self.consolidation_type(),
                        ),
                        results,
                    ));
                }
            }
        }
        Ok((Command::no_op(self.reason(), self.consolidation_type()), None))
    }
}
