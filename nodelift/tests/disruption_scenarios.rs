//! End-to-end disruption scenarios: consolidation, drift, validation races

mod common;

use common::*;
use nodelift::api::labels;
use nodelift::disruption::budgets::build_budget_mapping;
use nodelift::disruption::candidate::build_candidates;
use nodelift::disruption::multi_node::MultiNodeConsolidation;
use nodelift::disruption::single_node::SingleNodeConsolidation;
use nodelift::disruption::validation::validate;
use nodelift::disruption::{Decision, DisruptionController, DisruptionMethod};

#[tokio::test(start_paused = true)]
async fn single_node_consolidation_replaces_with_cheaper_shape() {
    let h = harness();
    let medium = shape("medium", 4, 8, 4.0, &["a"], &[labels::CAPACITY_TYPE_ON_DEMAND]);
    let small = shape("small", 3, 6, 2.0, &["a"], &[labels::CAPACITY_TYPE_ON_DEMAND]);
    add_pool(&h, pool("default"), vec![small, medium.clone()]);

    // two identical nodes, each too full for its pods to fit on the other,
    // but each cheap enough to re-home onto a smaller shape
    live_node(&h, "n1", &medium, "a", labels::CAPACITY_TYPE_ON_DEMAND, "default");
    live_node(&h, "n2", &medium, "a", labels::CAPACITY_TYPE_ON_DEMAND, "default");
    running_pod(&h, "w1", 2500, "n1");
    running_pod(&h, "w2", 2500, "n2");

    let controller =
        DisruptionController::with_methods(h.ctx.clone(), vec![Box::new(SingleNodeConsolidation)]);
    assert!(controller.tick().await.unwrap());

    // exactly one candidate was replaced
    assert_eq!(h.queue.len(), 1);
    let command = h
        .queue
        .command_for("fake://n1")
        .or_else(|| h.queue.command_for("fake://n2"))
        .expect("one of the nodes is being disrupted");
    assert_eq!(command.decision(), Decision::Replace);
    assert_eq!(command.candidates.len(), 1);
    assert_eq!(command.replacements.len(), 1);

    // the replacement's cheapest launch must undercut the candidate's price
    let replacement = &command.replacements[0];
    let cheapest = replacement.instance_types.cheapest_price(&replacement.requirements).unwrap();
    let candidate_price = command.candidates[0].price().unwrap();
    assert!(cheapest < candidate_price, "{cheapest} >= {candidate_price}");

    // the replacement claim was actually requested from the provider
    assert_eq!(h.provider.created.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn multi_node_consolidation_applies_the_same_type_guard() {
    let h = harness();
    let s = shape("s", 2, 4, 1.0, &["a"], &[labels::CAPACITY_TYPE_ON_DEMAND]);
    let xl = shape("xl", 4, 8, 4.0, &["a"], &[labels::CAPACITY_TYPE_ON_DEMAND]);
    let l = shape("l", 6, 12, 4.5, &["a"], &[labels::CAPACITY_TYPE_ON_DEMAND]);
    add_pool(&h, pool("default"), vec![s.clone(), xl.clone(), l]);

    // two xl nodes with one light pod each, one s node with two pods
    live_node(&h, "n1", &xl, "a", labels::CAPACITY_TYPE_ON_DEMAND, "default");
    live_node(&h, "n2", &xl, "a", labels::CAPACITY_TYPE_ON_DEMAND, "default");
    live_node(&h, "n3", &s, "a", labels::CAPACITY_TYPE_ON_DEMAND, "default");
    running_pod(&h, "w1", 700, "n1");
    running_pod(&h, "w2", 700, "n2");
    running_pod(&h, "w3", 700, "n3");
    running_pod(&h, "w4", 700, "n3");

    let controller =
        DisruptionController::with_methods(h.ctx.clone(), vec![Box::new(MultiNodeConsolidation)]);
    assert!(controller.tick().await.unwrap());

    // the two xl nodes go; the s node stays
    let command = h.queue.command_for("fake://n1").expect("n1 disrupted");
    assert_eq!(command.decision(), Decision::Replace);
    assert_eq!(command.candidates.len(), 2);
    let candidate_names: Vec<&str> = command.candidates.iter().map(|c| c.name()).collect();
    assert!(candidate_names.contains(&"n1") && candidate_names.contains(&"n2"));
    assert!(!h.queue.contains("fake://n3"));

    // the same-type guard stripped every shape priced at or above the
    // cheapest node being removed, leaving only the small shape
    assert_eq!(command.replacements.len(), 1);
    assert_eq!(command.replacements[0].instance_types.names(), vec!["s"]);
}

#[tokio::test(start_paused = true)]
async fn spot_to_spot_requires_fifteen_cheaper_options() {
    let h = harness();
    let candidate_shape = shape("spot-xl", 4, 8, 10.0, &["a"], &[labels::CAPACITY_TYPE_SPOT]);
    let mut catalog = vec![candidate_shape.clone()];
    // only ten cheaper spot shapes exist
    for i in 0..10 {
        catalog.push(shape(
            &format!("spot-{i}"),
            4,
            8,
            1.0 + i as f64 * 0.5,
            &["a"],
            &[labels::CAPACITY_TYPE_SPOT],
        ));
    }
    add_pool(&h, pool("default"), catalog);
    live_node(&h, "n1", &candidate_shape, "a", labels::CAPACITY_TYPE_SPOT, "default");
    running_pod(&h, "w1", 500, "n1");

    let controller =
        DisruptionController::with_methods(h.ctx.clone(), vec![Box::new(SingleNodeConsolidation)]);
    assert!(!controller.tick().await.unwrap());

    assert!(h.queue.is_empty());
    assert!(h.provider.created.lock().is_empty());
    let reasons = h.recorder.unconsolidatable_reasons();
    assert!(
        reasons.iter().any(|r| r.contains("15 cheaper instance type options")),
        "got: {reasons:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn nomination_during_validation_abandons_the_command() {
    let h = harness();
    let medium = shape("medium", 4, 8, 4.0, &["a"], &[labels::CAPACITY_TYPE_ON_DEMAND]);
    let small = shape("small", 3, 6, 2.0, &["a"], &[labels::CAPACITY_TYPE_ON_DEMAND]);
    add_pool(&h, pool("default"), vec![small, medium.clone()]);
    live_node(&h, "n1", &medium, "a", labels::CAPACITY_TYPE_ON_DEMAND, "default");
    live_node(&h, "n2", &medium, "a", labels::CAPACITY_TYPE_ON_DEMAND, "default");
    running_pod(&h, "w1", 2500, "n1");
    running_pod(&h, "w2", 2500, "n2");

    let method = SingleNodeConsolidation;
    let candidates = build_candidates(&h.ctx, &method).await.unwrap();
    let mut budgets = build_budget_mapping(&h.ctx, method.reason()).await.unwrap();
    let (command, _results) =
        method.compute_command(&h.ctx, &mut budgets, candidates).await.unwrap();
    assert_eq!(command.decision(), Decision::Replace);

    // a pending pod gets pointed at the candidate while the command waits
    // out its stabilization window
    h.cluster.nominate(command.candidates[0].provider_id());

    let error = validate(&h.ctx, &method, &command).await.unwrap_err();
    assert!(
        error.to_string().contains("was nominated during validation"),
        "got: {error}"
    );
    // nothing was enqueued and no side effects happened
    assert!(h.queue.is_empty());
    assert!(h.provider.created.lock().is_empty());
    assert!(h.store.taints_on("n1").is_empty());
    assert!(h.store.taints_on("n2").is_empty());
}

#[tokio::test(start_paused = true)]
async fn empty_nodes_are_deleted_without_replacements() {
    let h = harness();
    let medium = shape("medium", 4, 8, 4.0, &["a"], &[labels::CAPACITY_TYPE_ON_DEMAND]);
    add_pool(&h, pool("default"), vec![medium.clone()]);
    live_node(&h, "n1", &medium, "a", labels::CAPACITY_TYPE_ON_DEMAND, "default");

    let controller = DisruptionController::new(h.ctx.clone());
    assert!(controller.tick().await.unwrap());

    let command = h.queue.command_for("fake://n1").expect("empty node disrupted");
    assert_eq!(command.decision(), Decision::Delete);
    assert!(command.replacements.is_empty());
    assert!(h.provider.created.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn drifted_nodes_are_replaced() {
    let h = harness();
    let medium = shape("medium", 4, 8, 4.0, &["a"], &[labels::CAPACITY_TYPE_ON_DEMAND]);
    add_pool(&h, pool("default"), vec![medium.clone()]);
    live_node(&h, "n1", &medium, "a", labels::CAPACITY_TYPE_ON_DEMAND, "default");
    running_pod(&h, "w1", 2500, "n1");
    mark_drifted(&h, "n1");

    let controller = DisruptionController::new(h.ctx.clone());
    assert!(controller.tick().await.unwrap());

    let command = h.queue.command_for("fake://n1").expect("drifted node disrupted");
    assert_eq!(command.decision(), Decision::Replace);
    assert_eq!(command.reason, nodelift::disruption::DisruptionReason::Drifted);
    assert_eq!(h.provider.created.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_budgets_block_disruption() {
    let h = harness();
    let medium = shape("medium", 4, 8, 4.0, &["a"], &[labels::CAPACITY_TYPE_ON_DEMAND]);
    let mut limited = pool("default");
    limited.spec.disruption.budgets = vec![nodelift::api::DisruptionBudget {
        nodes: nodelift::api::BudgetValue::Count(0),
        reasons: vec![],
    }];
    add_pool(&h, limited, vec![medium.clone()]);
    live_node(&h, "n1", &medium, "a", labels::CAPACITY_TYPE_ON_DEMAND, "default");

    let controller = DisruptionController::new(h.ctx.clone());
    assert!(!controller.tick().await.unwrap());
    assert!(h.queue.is_empty());
    let blocked = h.recorder.events().into_iter().any(|e| {
        matches!(e, nodelift::events::Event::NodePoolBlockedForDisruptionReason { .. })
    });
    assert!(blocked, "budget exhaustion should be surfaced");
}
