//! The disruption loop: one singleton reconciler on a polling period

use super::budgets::build_budget_mapping;
use super::candidate::build_candidates;
use super::drift::Drift;
use super::emptiness::Emptiness;
use super::multi_node::MultiNodeConsolidation;
use super::single_node::SingleNodeConsolidation;
use super::validation::validate;
use super::{Decision, DisruptionContext, DisruptionMethod};
use crate::metrics;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct DisruptionController {
    ctx: DisruptionContext,
    methods: Vec<Box<dyn DisruptionMethod>>,
}

impl DisruptionController {
    /// The standard method order: cheap certain wins first, then the
    /// consolidations that need simulation
    pub fn new(ctx: DisruptionContext) -> Self {
        DisruptionController {
            ctx,
            methods: vec![
                Box::new(Emptiness),
                Box::new(Drift),
                Box::new(MultiNodeConsolidation),
                Box::new(SingleNodeConsolidation),
            ],
        }
    }

    pub fn with_methods(ctx: DisruptionContext, methods: Vec<Box<dyn DisruptionMethod>>) -> Self {
        DisruptionController { ctx, methods }
    }

    /// Poll until shutdown. Each tick tries the methods in order; the first
    /// command emitted wins the tick.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.ctx.options.polling_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(true) => debug!("disruption tick emitted a command"),
                        Ok(false) => {}
                        Err(error) => warn!(%error, "disruption tick failed"),
                    }
                }
            }
        }
    }

    /// One pass over the methods; true when a command was enqueued
    pub async fn tick(&self) -> super::Result<bool> {
        if !self.ctx.cluster.synced() {
            debug!("waiting for cluster state to sync");
            return Ok(false);
        }
        self.sweep_orphaned_taints().await;
        for method in &self.methods {
            if self.disrupt(method.as_ref()).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// A restart can leave disruption taints on nodes whose command no
    /// longer exists. Queue state transitions are idempotent, so stripping
    /// the leftovers here restores those nodes to a clean slate.
    async fn sweep_orphaned_taints(&self) {
        for node in self.ctx.cluster.nodes() {
            let tainted = node.node.as_ref().is_some_and(|n| {
                n.taints.iter().any(|t| t.key == crate::api::labels::DISRUPTION_TAINT_KEY)
            });
            if !tainted || self.ctx.queue.contains(node.provider_id()) {
                continue;
            }
            warn!(node = node.name(), "removing orphaned disruption taint");
            if let Err(error) = self
                .ctx
                .store
                .remove_node_taint(node.name(), crate::api::labels::DISRUPTION_TAINT_KEY)
                .await
            {
                warn!(node = node.name(), %error, "failed to remove orphaned disruption taint");
                continue;
            }
            if let Some(claim) = node.node_claim.as_ref() {
                let _ = self
                    .ctx
                    .store
                    .clear_node_claim_condition(
                        claim.name(),
                        crate::api::ConditionType::Disrupted,
                    )
                    .await;
            }
            self.ctx.cluster.unmark_for_deletion(&[node.provider_id().to_string()]);
        }
    }

    async fn disrupt(&self, method: &dyn DisruptionMethod) -> super::Result<bool> {
        let candidates = build_candidates(&self.ctx, method).await?;
        metrics::gauge_set(
            metrics::ELIGIBLE_NODES,
            &[("reason", method.reason().as_str())],
            candidates.len() as f64,
        );
        if candidates.is_empty() {
            return Ok(false);
        }

        let mut budgets = build_budget_mapping(&self.ctx, method.reason()).await?;
        let (command, results) =
            method.compute_command(&self.ctx, &mut budgets, candidates).await?;
        if command.decision() == Decision::NoOp {
            return Ok(false);
        }

        if let Err(error) = validate(&self.ctx, method, &command).await {
            if error.is_validation() {
                // abandoned, never retried; the next tick starts fresh
                warn!(%error, "abandoning command that failed validation");
                return Ok(false);
            }
            return Err(error);
        }

        let decision = command.decision();
        let reason = command.reason;
        let consolidation_type = command.consolidation_type;
        self.ctx.queue.add(command, results.as_ref()).await?;
        info!(
            decision = decision.as_str(),
            reason = reason.as_str(),
            consolidation_type,
            "disruption command enqueued"
        );
        metrics::counter_inc(
            metrics::DECISIONS_TOTAL,
            &[
                ("decision", decision.as_str()),
                ("reason", reason.as_str()),
                ("consolidation_type", consolidation_type),
            ],
        );
        Ok(true)
    }
}
