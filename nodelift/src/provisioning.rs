//! Assembles scheduling passes from live state.
//!
//! The provisioner gathers node pools, instance-type catalogs, daemon
//! overhead, and existing-node models into a [`Scheduler`], runs it over the
//! pending pods, and launches node claims for the result. The disruption
//! planners reuse the same assembly through [`Provisioner::new_scheduler`].

use crate::api::{labels, taints, NodeClaim, NodePool, Pod};
use crate::config::Options;
use crate::events::{Event, EventRecorder};
use crate::provider::{CloudProvider, ProviderError};
use crate::resources::ResourceList;
use crate::scheduling::host_ports::HostPortUsage;
use crate::scheduling::volume_usage::VolumeUsage;
use crate::scheduling::{
    daemons, ExistingNode, InstanceTypes, NodeClaimTemplate, Requirements, Results, ScheduledPod,
    Scheduler, SchedulingError, Topology,
};
use crate::state::{ClusterState, ObjectStore, StateError, StateNode};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub type Result<T> = std::result::Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),
}

pub struct Provisioner {
    cluster: Arc<ClusterState>,
    store: Arc<dyn ObjectStore>,
    provider: Arc<dyn CloudProvider>,
    recorder: Arc<dyn EventRecorder>,
    options: Options,
}

impl Provisioner {
    pub fn new(
        cluster: Arc<ClusterState>,
        store: Arc<dyn ObjectStore>,
        provider: Arc<dyn CloudProvider>,
        recorder: Arc<dyn EventRecorder>,
        options: Options,
    ) -> Self {
        Provisioner { cluster, store, provider, recorder, options }
    }

    /// Build a scheduling pass over `state_nodes` for `pods_to_schedule`.
    ///
    /// The caller picks the node set: provisioning passes every live node,
    /// disruption simulation withholds its candidates.
    pub async fn new_scheduler(
        &self,
        state_nodes: &[StateNode],
        pods_to_schedule: &[Pod],
    ) -> Result<Scheduler> {
        let pools = self.active_pools().await?;
        let all_pods = self.store.list_pods().await?;
        let resolver = self.store.volume_resolver().await?;

        let daemon_pods: Vec<Pod> =
            all_pods.iter().filter(|p| p.is_daemon() && p.is_active()).cloned().collect();

        let mut templates = Vec::new();
        let mut catalogs: HashMap<String, InstanceTypes> = HashMap::new();
        let mut daemon_overhead: HashMap<String, ResourceList> = HashMap::new();
        let mut remaining_resources: HashMap<String, ResourceList> = HashMap::new();
        for pool in &pools {
            let template = match NodeClaimTemplate::from_pool(pool) {
                Ok(template) => Arc::new(template),
                Err(error) => {
                    warn!(node_pool = %pool.name(), %error, "skipping node pool with invalid template");
                    continue;
                }
            };
            let instance_types = self.provider.get_instance_types(pool).await?;
            // pre-filter the catalog to what the template can produce at all
            let catalog = InstanceTypes::new(
                instance_types
                    .into_iter()
                    .filter(|it| {
                        it.matches_requirements(&template.requirements)
                            && it.has_offering(&template.requirements)
                    })
                    .collect(),
            );
            daemon_overhead.insert(
                pool.name().to_string(),
                daemons::overhead_for(&template.taints, &template.requirements, &daemon_pods),
            );
            if let Some(limits) = &pool.spec.limits {
                remaining_resources
                    .insert(pool.name().to_string(), self.pool_headroom(pool, limits));
            }
            catalogs.insert(pool.name().to_string(), catalog);
            templates.push(template);
        }

        let excluded: HashSet<_> =
            pods_to_schedule.iter().map(|p| p.uid().clone()).collect();
        let universe = domain_universe(&catalogs, &templates, state_nodes);
        let index = topology_index(state_nodes);
        let mut topology = Topology::new(index, universe, excluded)?;

        let mut existing_nodes = Vec::new();
        for state_node in state_nodes {
            existing_nodes.push(self.existing_node(state_node, &daemon_pods, &mut topology));
        }

        Ok(Scheduler::new(
            existing_nodes,
            templates,
            catalogs,
            daemon_overhead,
            remaining_resources,
            topology,
            resolver,
            self.options.max_instance_types,
        ))
    }

    /// One provisioning pass: place every pending pod, surface the results
    pub async fn schedule(&self) -> Result<Results> {
        let pending: Vec<Pod> = self
            .store
            .list_pods()
            .await?
            .into_iter()
            .filter(|p| p.is_pending() && !p.is_scheduled() && !p.is_terminating())
            .collect();
        let state_nodes: Vec<StateNode> =
            self.cluster.nodes().into_iter().filter(|n| !n.deleting()).collect();
        let scheduler = self.new_scheduler(&state_nodes, &pending).await?;
        let results = scheduler.solve(pending);
        results.record(self.recorder.as_ref(), &self.cluster);
        Ok(results)
    }

    /// Schedule and launch: create a node claim for every new node
    pub async fn provision(&self) -> Result<Vec<NodeClaim>> {
        let results = self.schedule().await?;
        let mut created = Vec::new();
        for node in &results.new_nodes {
            let claim = self.provider.create(&node.to_claim_spec()).await?;
            info!(node_claim = %claim.name(), node_pool = %node.template.node_pool, pods = node.pods.len(), "launching node");
            self.recorder.publish(Event::Launching {
                node_claim: claim.name().to_string(),
                reason: "provisioning".to_string(),
            });
            self.cluster.update_node_claim(claim.clone());
            created.push(claim);
        }
        Ok(created)
    }

    async fn active_pools(&self) -> Result<Vec<NodePool>> {
        let mut pools: Vec<NodePool> = self
            .store
            .list_node_pools()
            .await?
            .into_iter()
            .filter(|p| p.metadata.deletion_timestamp.is_none())
            .collect();
        // heaviest first; name breaks ties so iteration order is stable
        pools.sort_by(|a, b| {
            b.spec
                .weight
                .unwrap_or(0)
                .cmp(&a.spec.weight.unwrap_or(0))
                .then_with(|| a.name().cmp(b.name()))
        });
        Ok(pools)
    }

    /// Limit minus what the pool's live nodes already consume
    fn pool_headroom(&self, pool: &NodePool, limits: &ResourceList) -> ResourceList {
        let mut used = ResourceList::new();
        for node in self.cluster.nodes() {
            if node.node_pool() == Some(pool.name()) {
                if let Some(n) = &node.node {
                    used.add(&n.capacity);
                }
            }
        }
        limits
            .iter()
            .map(|(name, budget)| {
                (
                    name.clone(),
                    budget.saturating_sub(used.get(name)).max(crate::resources::Quantity::ZERO),
                )
            })
            .collect()
    }

    fn existing_node(
        &self,
        state_node: &StateNode,
        daemon_pods: &[Pod],
        topology: &mut Topology,
    ) -> ExistingNode {
        let node_labels = state_node.labels();
        let node_taints = state_node.scheduling_taints();
        // daemons that would also land here count against the node even if
        // they have not scheduled yet
        let expected_daemons = ResourceList::for_pods(daemon_pods.iter().filter(|d| {
            taints::first_untolerated(&node_taints, &d.spec.tolerations).is_none()
                && Requirements::for_pod(d)
                    .map(|reqs| {
                        Requirements::from_labels(&node_labels).compatible(&reqs, false).is_ok()
                    })
                    .unwrap_or(false)
        }));
        let remaining_daemons =
            expected_daemons.subtract_floored(&state_node.daemon_requests());

        let mut host_ports = HostPortUsage::new();
        let volume_limits = state_node
            .node
            .as_ref()
            .map(|n| n.volume_limits.clone())
            .unwrap_or_default();
        let volumes = VolumeUsage::new(volume_limits);
        for pod in state_node.pods.values().filter(|p| p.is_active()) {
            host_ports.add(pod, &pod.spec.host_ports);
        }

        ExistingNode::new(
            state_node.name().to_string(),
            state_node.provider_id().to_string(),
            state_node.initialized(),
            &node_labels,
            node_taints,
            state_node.available(),
            remaining_daemons,
            host_ports,
            volumes,
            topology,
        )
    }
}

/// Collect every known domain per topology key: template requirements,
/// instance-type labels, and live node labels all contribute
fn domain_universe(
    catalogs: &HashMap<String, InstanceTypes>,
    templates: &[Arc<NodeClaimTemplate>],
    state_nodes: &[StateNode],
) -> HashMap<String, BTreeSet<String>> {
    let mut universe: HashMap<String, BTreeSet<String>> = HashMap::new();
    for catalog in catalogs.values() {
        for it in catalog.iter() {
            for req in it.requirements.iter() {
                for value in req.values() {
                    universe.entry(req.key().to_string()).or_default().insert(value.to_string());
                }
            }
        }
    }
    for template in templates {
        for req in template.requirements.iter() {
            for value in req.values() {
                universe.entry(req.key().to_string()).or_default().insert(value.to_string());
            }
        }
    }
    for node in state_nodes {
        for (key, value) in node.labels() {
            universe.entry(key).or_default().insert(value);
        }
    }
    universe.remove(labels::HOSTNAME);
    universe
}

/// Scheduled active pods with their node context, for topology seeding
fn topology_index(state_nodes: &[StateNode]) -> Vec<ScheduledPod> {
    let mut index = Vec::new();
    for node in state_nodes {
        let node_labels = node.labels();
        let node_taints = node.scheduling_taints();
        for pod in node.pods.values() {
            if pod.is_active() {
                index.push(ScheduledPod {
                    pod: pod.clone(),
                    node_labels: node_labels.clone(),
                    node_taints: node_taints.clone(),
                });
            }
        }
    }
    index
}
