//! Ordered relaxation of a pod's soft scheduling preferences.
//!
//! When a pod fails to schedule, exactly one relaxation is applied per
//! attempt, in a fixed order from softest to most consequential. The
//! scheduler holds the mutated copy; the stored object is never touched.

use crate::api::{Pod, Taint, TaintEffect, Toleration, UnsatisfiableAction};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct Preferences {
    /// Also relax by tolerating `PreferNoSchedule` taints seen on templates
    pub tolerate_prefer_no_schedule: bool,
}

impl Preferences {
    /// Apply the first still-applicable relaxation. Returns a description of
    /// what changed, or `None` when nothing is left to relax.
    pub fn relax(&self, pod: &mut Pod, prefer_no_schedule_taints: &[Taint]) -> Option<String> {
        let relaxed = self
            .tolerate_prefer_no_schedule
            .then(|| Self::tolerate_prefer_no_schedule_taints(pod, prefer_no_schedule_taints))
            .flatten()
            .or_else(|| Self::remove_preferred_pod_affinity_term(pod))
            .or_else(|| Self::remove_preferred_pod_anti_affinity_term(pod))
            .or_else(|| Self::remove_required_node_affinity_term(pod))
            .or_else(|| Self::remove_preferred_node_affinity_terms(pod))
            .or_else(|| Self::remove_schedule_anyway_spread(pod));
        if let Some(reason) = &relaxed {
            debug!(pod = %pod.metadata.name, %reason, "relaxing soft constraints for pod since it previously failed to schedule");
        }
        relaxed
    }

    /// Tolerate every `PreferNoSchedule` taint present on some template.
    /// Idempotent, so this fires at most once per scheduling loop.
    pub fn tolerate_prefer_no_schedule_taints(
        pod: &mut Pod,
        taints: &[Taint],
    ) -> Option<String> {
        let mut added = Vec::new();
        for taint in taints.iter().filter(|t| t.effect == TaintEffect::PreferNoSchedule) {
            if pod.spec.tolerations.iter().any(|t| t.tolerates(taint)) {
                continue;
            }
            pod.spec.tolerations.push(Toleration {
                key: Some(taint.key.clone()),
                operator: crate::api::TolerationOperator::Exists,
                value: None,
                effect: Some(TaintEffect::PreferNoSchedule),
            });
            added.push(taint.key.clone());
        }
        if added.is_empty() {
            None
        } else {
            Some(format!("tolerating PreferNoSchedule taints [{}]", added.join(", ")))
        }
    }

    fn remove_preferred_pod_affinity_term(pod: &mut Pod) -> Option<String> {
        let affinity = pod.spec.affinity.as_mut()?.pod_affinity.as_mut()?;
        let (idx, term) = affinity
            .preferred
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| t.weight)
            .map(|(i, t)| (i, t.term.topology_key.clone()))?;
        affinity.preferred.remove(idx);
        Some(format!("removing preferred pod affinity on {term}"))
    }

    fn remove_preferred_pod_anti_affinity_term(pod: &mut Pod) -> Option<String> {
        let affinity = pod.spec.affinity.as_mut()?.pod_anti_affinity.as_mut()?;
        let (idx, term) = affinity
            .preferred
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| t.weight)
            .map(|(i, t)| (i, t.term.topology_key.clone()))?;
        affinity.preferred.remove(idx);
        Some(format!("removing preferred pod anti-affinity on {term}"))
    }

    /// Drop the leftmost match expression of the first required node-affinity
    /// term. Terms are ORed, so an emptied term falls away and the next one
    /// takes over on a later attempt.
    pub fn remove_required_node_affinity_term(pod: &mut Pod) -> Option<String> {
        let required =
            pod.spec.affinity.as_mut()?.node_affinity.as_mut()?.required.as_mut()?;
        loop {
            let term = required.terms.first_mut()?;
            if term.match_expressions.is_empty() {
                required.terms.remove(0);
                continue;
            }
            let removed = term.match_expressions.remove(0);
            if term.match_expressions.is_empty() {
                required.terms.remove(0);
            }
            return Some(format!("removing required node affinity on {}", removed.key));
        }
    }

    fn remove_preferred_node_affinity_terms(pod: &mut Pod) -> Option<String> {
        let affinity = pod.spec.affinity.as_mut()?.node_affinity.as_mut()?;
        if affinity.preferred.is_empty() {
            return None;
        }
        let count = affinity.preferred.len();
        affinity.preferred.clear();
        Some(format!("removing {count} preferred node affinity terms"))
    }

    /// Drop one `ScheduleAnyway` spread constraint, softest (largest skew
    /// tolerance) first
    fn remove_schedule_anyway_spread(pod: &mut Pod) -> Option<String> {
        let (idx, key) = pod
            .spec
            .topology_spread_constraints
            .iter()
            .enumerate()
            .filter(|(_, c)| c.when_unsatisfiable == UnsatisfiableAction::ScheduleAnyway)
            .max_by_key(|(_, c)| c.max_skew)
            .map(|(i, c)| (i, c.topology_key.clone()))?;
        pod.spec.topology_spread_constraints.remove(idx);
        Some(format!("removing ScheduleAnyway topology spread on {key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        Affinity, LabelSelector, NodeAffinity, NodeSelector, NodeSelectorRequirement,
        NodeSelectorTerm, ObjectMeta, PodAffinity, PodAffinityTerm, TopologySpreadConstraint,
        WeightedPodAffinityTerm,
    };

    fn pod_with_preferences() -> Pod {
        let mut pod = Pod { metadata: ObjectMeta::named("p"), ..Default::default() };
        pod.spec.affinity = Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required: Some(NodeSelector {
                    terms: vec![NodeSelectorTerm {
                        match_expressions: vec![
                            NodeSelectorRequirement::new_in("zone", vec!["a".to_string()]),
                            NodeSelectorRequirement::new_in("arch", vec!["arm64".to_string()]),
                        ],
                    }],
                }),
                preferred: vec![],
            }),
            pod_affinity: Some(PodAffinity {
                required: vec![],
                preferred: vec![
                    WeightedPodAffinityTerm {
                        weight: 10,
                        term: PodAffinityTerm {
                            label_selector: LabelSelector::default(),
                            namespaces: vec![],
                            topology_key: "zone".to_string(),
                        },
                    },
                    WeightedPodAffinityTerm {
                        weight: 5,
                        term: PodAffinityTerm {
                            label_selector: LabelSelector::default(),
                            namespaces: vec![],
                            topology_key: "hostname".to_string(),
                        },
                    },
                ],
            }),
            pod_anti_affinity: None,
        });
        pod
    }

    #[test]
    fn relaxations_apply_one_at_a_time_in_order() {
        let prefs = Preferences::default();
        let mut pod = pod_with_preferences();

        // lowest-weight preferred pod affinity first
        let reason = prefs.relax(&mut pod, &[]).unwrap();
        assert!(reason.contains("preferred pod affinity on hostname"));
        assert_eq!(pod.spec.affinity.as_ref().unwrap().pod_affinity.as_ref().unwrap().preferred.len(), 1);

        let reason = prefs.relax(&mut pod, &[]).unwrap();
        assert!(reason.contains("preferred pod affinity on zone"));

        // then required node affinity expressions, leftmost first
        let reason = prefs.relax(&mut pod, &[]).unwrap();
        assert!(reason.contains("required node affinity on zone"));
        let reason = prefs.relax(&mut pod, &[]).unwrap();
        assert!(reason.contains("required node affinity on arch"));

        assert!(prefs.relax(&mut pod, &[]).is_none());
    }

    #[test]
    fn prefer_no_schedule_toleration_fires_once() {
        let prefs = Preferences { tolerate_prefer_no_schedule: true };
        let taints = vec![Taint {
            key: "dedicated".to_string(),
            value: None,
            effect: TaintEffect::PreferNoSchedule,
        }];
        let mut pod = Pod { metadata: ObjectMeta::named("p"), ..Default::default() };

        let reason = prefs.relax(&mut pod, &taints).unwrap();
        assert!(reason.contains("PreferNoSchedule"));
        assert_eq!(pod.spec.tolerations.len(), 1);

        // second pass finds nothing left
        assert!(prefs.relax(&mut pod, &taints).is_none());
    }

    #[test]
    fn schedule_anyway_spread_drops_softest_first() {
        let prefs = Preferences::default();
        let mut pod = Pod { metadata: ObjectMeta::named("p"), ..Default::default() };
        let constraint = |skew: i32, action: UnsatisfiableAction| TopologySpreadConstraint {
            max_skew: skew,
            topology_key: format!("key-{skew}"),
            when_unsatisfiable: action,
            label_selector: LabelSelector::default(),
            min_domains: None,
            node_affinity_policy: None,
            node_taints_policy: None,
        };
        pod.spec.topology_spread_constraints = vec![
            constraint(1, UnsatisfiableAction::DoNotSchedule),
            constraint(2, UnsatisfiableAction::ScheduleAnyway),
            constraint(5, UnsatisfiableAction::ScheduleAnyway),
        ];

        let reason = prefs.relax(&mut pod, &[]).unwrap();
        assert!(reason.contains("key-5"));
        let reason = prefs.relax(&mut pod, &[]).unwrap();
        assert!(reason.contains("key-2"));
        // DoNotSchedule constraints are never relaxed
        assert!(prefs.relax(&mut pod, &[]).is_none());
        assert_eq!(pod.spec.topology_spread_constraints.len(), 1);
    }
}
