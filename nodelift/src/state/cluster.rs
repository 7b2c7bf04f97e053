//! Read-mostly projection of nodes, node claims, and pod bindings.
//!
//! Process-wide. Watch handlers write through the typed update methods;
//! readers deep-copy snapshots and never observe partial updates. A pass
//! must treat its snapshot as immutable.

use crate::api::{labels, Node, NodeClaim, Pod, Taint, Uid};
use crate::resources::ResourceList;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// One managed (or unmanaged but observed) node with everything bound to it
#[derive(Debug, Clone, Default)]
pub struct StateNode {
    pub node: Option<Node>,
    pub node_claim: Option<NodeClaim>,
    /// Pods bound to this node
    pub pods: BTreeMap<Uid, Pod>,
    pub marked_for_deletion: bool,
}

impl StateNode {
    pub fn name(&self) -> &str {
        self.node
            .as_ref()
            .map(|n| n.name())
            .or_else(|| self.node_claim.as_ref().map(|c| c.name()))
            .unwrap_or("")
    }

    pub fn provider_id(&self) -> &str {
        self.node
            .as_ref()
            .map(|n| n.provider_id.as_str())
            .or_else(|| {
                self.node_claim.as_ref().and_then(|c| c.status.provider_id.as_deref())
            })
            .unwrap_or("")
    }

    /// Created and owned by the autoscaler
    pub fn managed(&self) -> bool {
        self.node_claim.is_some()
    }

    pub fn initialized(&self) -> bool {
        match &self.node_claim {
            Some(claim) => claim.is_initialized(),
            None => self.node.as_ref().is_some_and(|n| n.ready),
        }
    }

    pub fn deleting(&self) -> bool {
        self.marked_for_deletion
            || self.node.as_ref().is_some_and(|n| n.metadata.deletion_timestamp.is_some())
            || self
                .node_claim
                .as_ref()
                .is_some_and(|c| c.metadata.deletion_timestamp.is_some())
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.node.as_ref().map(|n| n.labels().clone()).unwrap_or_default()
    }

    pub fn node_pool(&self) -> Option<&str> {
        self.node
            .as_ref()
            .and_then(|n| n.label(labels::NODE_POOL))
            .or_else(|| self.node_claim.as_ref().map(|c| c.spec.node_pool.as_str()))
    }

    /// Taints relevant to scheduling: the autoscaler's own disruption taint
    /// is invisible so that simulated re-placement onto the node still works
    pub fn scheduling_taints(&self) -> Vec<Taint> {
        self.node
            .as_ref()
            .map(|n| {
                n.taints
                    .iter()
                    .filter(|t| t.key != labels::DISRUPTION_TAINT_KEY)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Allocatable minus requests of every active bound pod
    pub fn available(&self) -> ResourceList {
        let allocatable =
            self.node.as_ref().map(|n| n.allocatable.clone()).unwrap_or_default();
        allocatable.subtract_floored(&self.pod_requests())
    }

    /// Requests of every active bound pod, one pod slot each
    pub fn pod_requests(&self) -> ResourceList {
        ResourceList::for_pods(self.pods.values().filter(|p| p.is_active()))
    }

    /// Requests of bound daemon pods only
    pub fn daemon_requests(&self) -> ResourceList {
        ResourceList::for_pods(self.pods.values().filter(|p| p.is_active() && p.is_daemon()))
    }

    /// Pods that would need rescheduling if this node went away
    pub fn reschedulable_pods(&self) -> Vec<Pod> {
        self.pods.values().filter(|p| p.is_reschedulable()).cloned().collect()
    }

    pub fn creation_timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.node
            .as_ref()
            .and_then(|n| n.metadata.creation_timestamp)
            .or_else(|| self.node_claim.as_ref().and_then(|c| c.metadata.creation_timestamp))
    }
}

/// Process-wide cluster view, keyed by provider id
pub struct ClusterState {
    nodes: DashMap<String, StateNode>,
    /// node name -> provider id
    by_name: DashMap<String, String>,
    /// pod uid -> node name it is bound to
    bindings: DashMap<Uid, String>,
    /// nominated provider id -> when the nomination lapses
    nominations: DashMap<String, Instant>,
    nomination_window: Duration,
    synced: AtomicBool,
}

impl ClusterState {
    pub fn new(nomination_window: Duration) -> Self {
        ClusterState {
            nodes: DashMap::new(),
            by_name: DashMap::new(),
            bindings: DashMap::new(),
            nominations: DashMap::new(),
            nomination_window,
            synced: AtomicBool::new(false),
        }
    }

    /// One-shot gate: the disruption loop will not act before the initial
    /// listing has been applied
    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    pub fn update_node(&self, node: Node) {
        let provider_id = node.provider_id.clone();
        if provider_id.is_empty() {
            return;
        }
        self.by_name.insert(node.name().to_string(), provider_id.clone());
        let mut entry = self.nodes.entry(provider_id).or_default();
        entry.node = Some(node);
    }

    pub fn update_node_claim(&self, claim: NodeClaim) {
        let Some(provider_id) = claim.status.provider_id.clone() else { return };
        let mut entry = self.nodes.entry(provider_id).or_default();
        entry.node_claim = Some(claim);
    }

    pub fn delete_node(&self, name: &str) {
        if let Some((_, provider_id)) = self.by_name.remove(name) {
            if let Some(mut entry) = self.nodes.get_mut(&provider_id) {
                entry.node = None;
                let gone = entry.node_claim.is_none();
                drop(entry);
                if gone {
                    self.nodes.remove(&provider_id);
                }
            }
        }
    }

    pub fn delete_node_claim(&self, provider_id: &str) {
        if let Some(mut entry) = self.nodes.get_mut(provider_id) {
            entry.node_claim = None;
            let gone = entry.node.is_none();
            drop(entry);
            if gone {
                self.nodes.remove(provider_id);
            }
        }
    }

    /// Bind or rebind a pod to the node named in its spec
    pub fn update_pod(&self, pod: Pod) {
        let uid = pod.uid().clone();
        let previous = self.bindings.get(&uid).map(|b| b.value().clone());
        match pod.spec.node_name.clone() {
            Some(node_name) => {
                if previous.as_deref() != Some(node_name.as_str()) {
                    if let Some(previous) = previous {
                        self.remove_binding(&uid, &previous);
                    }
                }
                self.bindings.insert(uid.clone(), node_name.clone());
                if let Some(provider_id) = self.by_name.get(&node_name) {
                    if let Some(mut entry) = self.nodes.get_mut(provider_id.value()) {
                        entry.pods.insert(uid, pod);
                    }
                }
            }
            None => {
                if let Some(previous) = previous {
                    self.remove_binding(&uid, &previous);
                    self.bindings.remove(&uid);
                }
            }
        }
    }

    pub fn delete_pod(&self, uid: &Uid) {
        if let Some((_, node_name)) = self.bindings.remove(uid) {
            self.remove_binding(uid, &node_name);
        }
    }

    fn remove_binding(&self, uid: &Uid, node_name: &str) {
        if let Some(provider_id) = self.by_name.get(node_name) {
            if let Some(mut entry) = self.nodes.get_mut(provider_id.value()) {
                entry.pods.remove(uid);
            }
        }
    }

    /// Deep-copied snapshots of every node, for one pass's exclusive use
    pub fn nodes(&self) -> Vec<StateNode> {
        self.nodes.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn node(&self, provider_id: &str) -> Option<StateNode> {
        self.nodes.get(provider_id).map(|e| e.value().clone())
    }

    /// Protect a node from disruption while pods are being directed at it
    pub fn nominate(&self, provider_id: &str) {
        self.nominations
            .insert(provider_id.to_string(), Instant::now() + self.nomination_window);
    }

    pub fn is_nominated(&self, provider_id: &str) -> bool {
        let expired = match self.nominations.get(provider_id) {
            Some(expiry) => *expiry.value() <= Instant::now(),
            None => return false,
        };
        if expired {
            self.nominations.remove(provider_id);
            return false;
        }
        true
    }

    pub fn mark_for_deletion(&self, provider_ids: &[String]) {
        for id in provider_ids {
            if let Some(mut entry) = self.nodes.get_mut(id) {
                entry.marked_for_deletion = true;
            }
        }
    }

    pub fn unmark_for_deletion(&self, provider_ids: &[String]) {
        for id in provider_ids {
            if let Some(mut entry) = self.nodes.get_mut(id) {
                entry.marked_for_deletion = false;
            }
        }
    }

    /// Visit every bound pod carrying required anti-affinity, with its node
    pub fn for_each_pod_with_anti_affinity(&self, mut f: impl FnMut(&Pod, &StateNode)) {
        for entry in self.nodes.iter() {
            for pod in entry.value().pods.values() {
                if pod.has_required_pod_anti_affinity() {
                    f(pod, entry.value());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ConditionType, ObjectMeta};
    use crate::resources::{Quantity, PODS};

    fn node(name: &str, provider_id: &str) -> Node {
        let mut node = Node::default();
        node.metadata = ObjectMeta::named(name);
        node.provider_id = provider_id.to_string();
        node.ready = true;
        let mut allocatable = ResourceList::new();
        allocatable.insert(crate::resources::CPU, Quantity::from_units(4));
        allocatable.insert(PODS, Quantity::from_units(110));
        node.allocatable = allocatable;
        node
    }

    fn bound_pod(name: &str, node: &str, cpu_millis: i64) -> Pod {
        let mut pod = Pod { metadata: ObjectMeta::named(name), ..Default::default() };
        pod.spec.node_name = Some(node.to_string());
        pod.status.phase = crate::api::PodPhase::Running;
        pod.spec.requests.insert(crate::resources::CPU, Quantity::from_millis(cpu_millis));
        pod
    }

    #[test]
    fn available_subtracts_bound_pods() {
        let cluster = ClusterState::new(Duration::from_secs(20));
        cluster.update_node(node("n1", "p1"));
        cluster.update_pod(bound_pod("a", "n1", 1500));

        let state = cluster.node("p1").unwrap();
        assert_eq!(state.available().cpu(), Quantity::from_millis(2500));
        assert_eq!(state.available().pods(), Quantity::from_units(109));
    }

    #[test]
    fn pod_rebinding_moves_requests() {
        let cluster = ClusterState::new(Duration::from_secs(20));
        cluster.update_node(node("n1", "p1"));
        cluster.update_node(node("n2", "p2"));
        let mut pod = bound_pod("a", "n1", 1000);
        cluster.update_pod(pod.clone());
        pod.spec.node_name = Some("n2".to_string());
        cluster.update_pod(pod);

        assert_eq!(cluster.node("p1").unwrap().pods.len(), 0);
        assert_eq!(cluster.node("p2").unwrap().pods.len(), 1);
    }

    #[test]
    fn nominations_expire() {
        let cluster = ClusterState::new(Duration::from_millis(0));
        cluster.nominate("p1");
        // zero window: the nomination is immediately stale
        assert!(!cluster.is_nominated("p1"));

        let cluster = ClusterState::new(Duration::from_secs(60));
        cluster.nominate("p1");
        assert!(cluster.is_nominated("p1"));
        assert!(!cluster.is_nominated("p2"));
    }

    #[test]
    fn anti_affinity_pods_are_discoverable_with_their_node() {
        let cluster = ClusterState::new(Duration::from_secs(20));
        cluster.update_node(node("n1", "p1"));

        let mut plain = bound_pod("plain", "n1", 100);
        cluster.update_pod(plain.clone());
        plain.metadata = ObjectMeta::named("anti");
        plain.spec.affinity = Some(crate::api::Affinity {
            pod_anti_affinity: Some(crate::api::PodAntiAffinity {
                required: vec![crate::api::PodAffinityTerm {
                    label_selector: crate::api::LabelSelector::default(),
                    namespaces: vec![],
                    topology_key: labels::ZONE.to_string(),
                }],
                preferred: vec![],
            }),
            ..Default::default()
        });
        cluster.update_pod(plain);

        let mut seen = Vec::new();
        cluster.for_each_pod_with_anti_affinity(|pod, node| {
            seen.push((pod.metadata.name.clone(), node.name().to_string()));
        });
        assert_eq!(seen, vec![("anti".to_string(), "n1".to_string())]);
    }

    #[test]
    fn managed_and_initialized_follow_the_claim() {
        let cluster = ClusterState::new(Duration::from_secs(20));
        cluster.update_node(node("n1", "p1"));
        assert!(!cluster.node("p1").unwrap().managed());

        let mut claim = NodeClaim::default();
        claim.metadata = ObjectMeta::named("c1");
        claim.status.provider_id = Some("p1".to_string());
        cluster.update_node_claim(claim.clone());
        let state = cluster.node("p1").unwrap();
        assert!(state.managed());
        assert!(!state.initialized());

        claim.set_condition(ConditionType::Initialized, true, None);
        cluster.update_node_claim(claim);
        assert!(cluster.node("p1").unwrap().initialized());
    }
}
