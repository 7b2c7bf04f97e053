//! Reclaiming nodes with nothing left to reschedule

use super::budgets::BudgetMapping;
use super::candidate::Candidate;
use super::consolidation::consolidatable;
use super::{Command, DisruptionClass, DisruptionContext, DisruptionMethod, DisruptionReason};
use crate::scheduling::Results;
use async_trait::async_trait;
use tracing::debug;

pub struct Emptiness;

#[async_trait]
impl DisruptionMethod for Emptiness {
    fn reason(&self) -> DisruptionReason {
        DisruptionReason::Empty
    }

    fn class(&self) -> DisruptionClass {
        DisruptionClass::Graceful
    }

    fn consolidation_type(&self) -> &'static str {
        "empty"
    }

    fn should_disrupt(&self, candidate: &Candidate) -> bool {
        candidate.is_empty() && consolidatable(candidate, false)
    }

    /// Empty nodes need no simulation; delete as many as budgets allow
    async fn compute_command(
        &self,
        _ctx: &DisruptionContext,
        budgets: &mut BudgetMapping,
        candidates: Vec<Candidate>,
    ) -> super::Result<(Command, Option<Results>)> {
        let mut chosen = Vec::new();
        for candidate in candidates.into_iter().filter(Candidate::is_empty) {
            if budgets.consume(candidate.node_pool.name()) {
                chosen.push(candidate);
            }
        }
        if chosen.is_empty() {
            return Ok((Command::no_op(self.reason(), self.consolidation_type()), None));
        }
        debug!(count = chosen.len(), "deleting empty nodes");
        Ok((
            Command::new(chosen, Vec::new(), self.reason(), self.consolidation_type()),
            None,
        ))
    }
}
