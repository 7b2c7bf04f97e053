//! The disruption controller.
//!
//! Decides which nodes to remove or replace: consolidation (single- and
//! multi-node), drift reclamation, and emptiness reclamation. Every emitted
//! command is validated against a fresh re-simulation before the
//! orchestration queue executes it.

pub mod budgets;
pub mod candidate;
pub mod consolidation;
pub mod controller;
pub mod drift;
pub mod emptiness;
pub mod error;
pub mod multi_node;
pub mod orchestration;
pub mod simulation;
pub mod single_node;
pub mod validation;

pub use budgets::BudgetMapping;
pub use candidate::Candidate;
pub use controller::DisruptionController;
pub use error::{DisruptionError, Result};
pub use orchestration::OrchestrationQueue;

use crate::api::Taint;
use crate::config::Options;
use crate::events::EventRecorder;
use crate::provider::CloudProvider;
use crate::provisioning::Provisioner;
use crate::scheduling::{NewNode, Results};
use crate::state::{ClusterState, ObjectStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Why a node is being disrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisruptionReason {
    Underutilized,
    Empty,
    Drifted,
}

impl DisruptionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisruptionReason::Underutilized => "underutilized",
            DisruptionReason::Empty => "empty",
            DisruptionReason::Drifted => "drifted",
        }
    }
}

impl std::fmt::Display for DisruptionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Graceful disruption honors pod disruption budgets and opt-outs; eventual
/// disruption is bounded by the pool's termination grace period instead
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisruptionClass {
    Graceful,
    Eventual,
}

/// What a command does, derived from its candidate and replacement lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    NoOp,
    Delete,
    Replace,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::NoOp => "no-op",
            Decision::Delete => "delete",
            Decision::Replace => "replace",
        }
    }
}

/// A planned disruption: remove `candidates`, create `replacements`.
/// Success is tracked by the orchestration queue once the command executes.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: Uuid,
    pub candidates: Vec<Candidate>,
    pub replacements: Vec<NewNode>,
    pub reason: DisruptionReason,
    pub consolidation_type: &'static str,
    pub created: DateTime<Utc>,
}

impl Command {
    pub fn new(
        candidates: Vec<Candidate>,
        replacements: Vec<NewNode>,
        reason: DisruptionReason,
        consolidation_type: &'static str,
    ) -> Self {
        Command {
            id: Uuid::new_v4(),
            candidates,
            replacements,
            reason,
            consolidation_type,
            created: Utc::now(),
        }
    }

    pub fn no_op(reason: DisruptionReason, consolidation_type: &'static str) -> Self {
        Command::new(Vec::new(), Vec::new(), reason, consolidation_type)
    }

    pub fn decision(&self) -> Decision {
        match (self.candidates.is_empty(), self.replacements.is_empty()) {
            (true, _) => Decision::NoOp,
            (false, true) => Decision::Delete,
            (false, false) => Decision::Replace,
        }
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.candidates.iter().map(|c| c.provider_id().to_string()).collect()
    }
}

/// Shared dependencies for one disruption loop
#[derive(Clone)]
pub struct DisruptionContext {
    pub cluster: Arc<ClusterState>,
    pub store: Arc<dyn ObjectStore>,
    pub provider: Arc<dyn CloudProvider>,
    pub recorder: Arc<dyn EventRecorder>,
    pub provisioner: Arc<Provisioner>,
    pub queue: Arc<OrchestrationQueue>,
    pub options: Options,
}

/// One way of disrupting nodes. The controller tries each method per tick;
/// the first to emit a command wins the tick.
#[async_trait]
pub trait DisruptionMethod: Send + Sync {
    fn reason(&self) -> DisruptionReason;

    fn class(&self) -> DisruptionClass;

    fn consolidation_type(&self) -> &'static str;

    /// Cheap per-candidate predicate applied during candidate construction
    fn should_disrupt(&self, candidate: &Candidate) -> bool;

    /// Plan a command from the filtered, cost-ordered candidates. Returns
    /// the scheduling results the command was derived from, when simulation
    /// was involved.
    async fn compute_command(
        &self,
        ctx: &DisruptionContext,
        budgets: &mut BudgetMapping,
        candidates: Vec<Candidate>,
    ) -> Result<(Command, Option<Results>)>;
}

/// The taint placed on candidates while their command executes
pub fn disruption_taint() -> Taint {
    Taint::new(crate::api::labels::DISRUPTION_TAINT_KEY, crate::api::TaintEffect::NoSchedule)
}
