//! Per-template daemon overhead.
//!
//! Daemon pods run on every node a template produces, so their requests are
//! a fixed cost added to each new node before any workload is placed.

use super::preferences::Preferences;
use super::requirements::Requirements;
use crate::api::{taints, Pod, Taint};
use crate::resources::ResourceList;

/// Whether a daemon pod would land on nodes cut from this template.
///
/// Preferences are relaxed aggressively: `PreferNoSchedule` taints are
/// pre-tolerated, and required node-affinity terms are dropped one by one,
/// since a daemon controller keeps retrying until its pod fits.
pub fn daemon_schedules_to(
    template_taints: &[Taint],
    template_requirements: &Requirements,
    daemon: &Pod,
) -> bool {
    let mut pod = daemon.clone();
    Preferences::tolerate_prefer_no_schedule_taints(&mut pod, template_taints);
    loop {
        if taints::first_untolerated(template_taints, &pod.spec.tolerations).is_some() {
            return false;
        }
        match Requirements::for_pod_strict(&pod) {
            Err(_) => return false,
            Ok(reqs) => {
                if template_requirements.compatible(&reqs, true).is_ok() {
                    return true;
                }
            }
        }
        if Preferences::remove_required_node_affinity_term(&mut pod).is_none() {
            return false;
        }
    }
}

/// Sum of requests of every daemon compatible with the template
pub fn overhead_for(
    template_taints: &[Taint],
    template_requirements: &Requirements,
    daemons: &[Pod],
) -> ResourceList {
    ResourceList::for_pods(
        daemons
            .iter()
            .filter(|d| daemon_schedules_to(template_taints, template_requirements, d)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        labels, Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
        ObjectMeta, TaintEffect,
    };
    use crate::resources::{Quantity, CPU};
    use crate::scheduling::requirements::Requirement;

    fn daemon(name: &str, cpu_millis: i64) -> Pod {
        let mut pod = Pod { metadata: ObjectMeta::named(name), ..Default::default() };
        pod.spec.requests.insert(CPU, Quantity::from_millis(cpu_millis));
        pod
    }

    fn template_requirements(zone: &str) -> Requirements {
        let mut reqs = Requirements::new();
        reqs.add(Requirement::new_in(labels::ZONE, [zone]));
        reqs
    }

    #[test]
    fn untolerated_taints_exclude_daemons() {
        let taints = vec![Taint::new("dedicated", TaintEffect::NoSchedule)];
        assert!(!daemon_schedules_to(&taints, &Requirements::new(), &daemon("d", 100)));

        let mut tolerant = daemon("d", 100);
        tolerant.spec.tolerations = vec![crate::api::Toleration::exists("dedicated")];
        assert!(daemon_schedules_to(&taints, &Requirements::new(), &tolerant));
    }

    #[test]
    fn prefer_no_schedule_taints_are_pre_tolerated() {
        let taints = vec![Taint::new("soft", TaintEffect::PreferNoSchedule)];
        assert!(daemon_schedules_to(&taints, &Requirements::new(), &daemon("d", 100)));
    }

    #[test]
    fn incompatible_required_affinity_is_dropped_term_by_term() {
        let mut picky = daemon("d", 100);
        picky.spec.affinity = Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required: Some(NodeSelector {
                    terms: vec![NodeSelectorTerm {
                        match_expressions: vec![NodeSelectorRequirement::new_in(
                            labels::ZONE,
                            vec!["other-zone".to_string()],
                        )],
                    }],
                }),
                preferred: vec![],
            }),
            ..Default::default()
        });
        // incompatible as written, but the affinity term relaxes away
        assert!(daemon_schedules_to(&[], &template_requirements("zone-a"), &picky));
    }

    #[test]
    fn overhead_sums_surviving_daemons() {
        let taints = vec![Taint::new("dedicated", TaintEffect::NoSchedule)];
        let mut tolerant = daemon("tolerant", 200);
        tolerant.spec.tolerations = vec![crate::api::Toleration::exists("dedicated")];
        let excluded = daemon("excluded", 500);

        let overhead = overhead_for(&taints, &Requirements::new(), &[tolerant, excluded]);
        assert_eq!(overhead.cpu(), Quantity::from_millis(200));
        assert_eq!(overhead.pods(), Quantity::from_units(1));
    }
}
