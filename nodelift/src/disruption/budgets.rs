//! Per-pool disruption allowances

use super::{DisruptionContext, DisruptionReason};
use crate::api::labels;
use crate::events::Event;
use crate::metrics;
use std::collections::HashMap;

/// How many more nodes each pool may begin disrupting right now
#[derive(Debug, Clone, Default)]
pub struct BudgetMapping {
    allowed: HashMap<String, usize>,
}

impl BudgetMapping {
    pub fn allows(&self, node_pool: &str) -> usize {
        self.allowed.get(node_pool).copied().unwrap_or(0)
    }

    /// Take one unit of budget; false when exhausted
    pub fn consume(&mut self, node_pool: &str) -> bool {
        match self.allowed.get_mut(node_pool) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    /// Take up to `want` units, returning how many were granted
    pub fn consume_up_to(&mut self, node_pool: &str, want: usize) -> usize {
        let granted = want.min(self.allows(node_pool));
        if let Some(remaining) = self.allowed.get_mut(node_pool) {
            *remaining -= granted;
        }
        granted
    }

    #[cfg(test)]
    pub fn fixed(entries: &[(&str, usize)]) -> Self {
        BudgetMapping {
            allowed: entries.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }
}

/// Resolve every pool's budget for `reason` against the current node count,
/// subtracting nodes already disrupting. Floored at zero.
pub async fn build_budget_mapping(
    ctx: &DisruptionContext,
    reason: DisruptionReason,
) -> super::Result<BudgetMapping> {
    let mut total: HashMap<String, usize> = HashMap::new();
    let mut disrupting: HashMap<String, usize> = HashMap::new();
    for node in ctx.cluster.nodes() {
        if !node.managed() || !node.initialized() || node.node.is_none() {
            continue;
        }
        let Some(pool) = node.node_pool().map(String::from) else { continue };
        *total.entry(pool.clone()).or_insert(0) += 1;
        let tainted = node
            .node
            .as_ref()
            .is_some_and(|n| n.taints.iter().any(|t| t.key == labels::DISRUPTION_TAINT_KEY));
        if node.deleting() || tainted {
            *disrupting.entry(pool).or_insert(0) += 1;
        }
    }

    let mut allowed = HashMap::new();
    for pool in ctx.store.list_node_pools().await? {
        let name = pool.name().to_string();
        let nodes = total.get(&name).copied().unwrap_or(0);
        let budget = pool.allowed_disruptions(reason, nodes);
        let remaining = budget.saturating_sub(disrupting.get(&name).copied().unwrap_or(0));
        metrics::gauge_set(
            metrics::NODEPOOL_ALLOWED_DISRUPTIONS,
            &[("nodepool", &name), ("reason", reason.as_str())],
            remaining as f64,
        );
        if budget == 0 && nodes > 0 {
            ctx.recorder.publish(Event::NodePoolBlockedForDisruptionReason {
                node_pool: name.clone(),
                reason: reason.to_string(),
            });
        }
        allowed.insert(name, remaining);
    }
    Ok(BudgetMapping { allowed })
}
