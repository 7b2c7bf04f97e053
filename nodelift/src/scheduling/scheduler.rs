//! The placement loop: pods onto existing nodes, in-flight nodes, or new ones

use super::error::{Result, SchedulingError};
use super::existing_node::ExistingNode;
use super::instance_type::InstanceTypes;
use super::new_node::{max_resources, NewNode, NodeClaimTemplate};
use super::preferences::Preferences;
use super::queue::Queue;
use super::requirements::Requirements;
use super::topology::Topology;
use crate::api::{HostPort, Pod, Taint, TaintEffect, Uid, VolumeResolver};
use crate::events::{Event, EventRecorder};
use crate::metrics;
use crate::resources::{Quantity, ResourceList, PODS};
use crate::state::ClusterState;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Everything the scheduler derives from a pod once per attempt
#[derive(Debug, Clone)]
pub struct PodData {
    /// Requests including the pod slot itself
    pub requests: ResourceList,
    /// Node selector, required affinity, and the heaviest preference
    pub requirements: Requirements,
    /// Required terms only
    pub strict_requirements: Requirements,
    pub host_ports: Vec<HostPort>,
}

impl PodData {
    pub fn for_pod(pod: &Pod) -> Result<Self> {
        let mut requests = pod.spec.requests.clone();
        requests.insert(PODS, requests.get(PODS) + Quantity::from_units(1));
        Ok(PodData {
            requests,
            requirements: Requirements::for_pod(pod)?,
            strict_requirements: Requirements::for_pod_strict(pod)?,
            host_ports: pod.spec.host_ports.clone(),
        })
    }
}

/// A single-threaded scheduling pass over one batch of pods.
///
/// The scheduler exclusively owns its topology, its node models, and the
/// per-pool resource budgets; nothing here is shared across passes.
pub struct Scheduler {
    existing_nodes: Vec<ExistingNode>,
    new_nodes: Vec<NewNode>,
    templates: Vec<Arc<NodeClaimTemplate>>,
    catalogs: HashMap<String, InstanceTypes>,
    daemon_overhead: HashMap<String, ResourceList>,
    /// Remaining headroom for pools that declare limits
    remaining_resources: HashMap<String, ResourceList>,
    topology: Topology,
    resolver: VolumeResolver,
    preferences: Preferences,
    prefer_no_schedule_taints: Vec<Taint>,
    max_instance_types: usize,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        existing_nodes: Vec<ExistingNode>,
        templates: Vec<Arc<NodeClaimTemplate>>,
        catalogs: HashMap<String, InstanceTypes>,
        daemon_overhead: HashMap<String, ResourceList>,
        remaining_resources: HashMap<String, ResourceList>,
        topology: Topology,
        resolver: VolumeResolver,
        max_instance_types: usize,
    ) -> Self {
        let prefer_no_schedule_taints: Vec<Taint> = templates
            .iter()
            .flat_map(|t| t.taints.iter())
            .filter(|t| t.effect == TaintEffect::PreferNoSchedule)
            .cloned()
            .collect();
        let mut existing_nodes = existing_nodes;
        // initialized nodes first, emptier nodes first within each class
        existing_nodes.sort_by_key(|n| (!n.initialized, n.pods.len()));
        Scheduler {
            existing_nodes,
            new_nodes: Vec::new(),
            templates,
            catalogs,
            daemon_overhead,
            remaining_resources,
            topology,
            resolver,
            preferences: Preferences { tolerate_prefer_no_schedule: true },
            prefer_no_schedule_taints,
            max_instance_types,
        }
    }

    /// Run the pass to completion and surface the placement
    pub fn solve(mut self, pods: Vec<Pod>) -> Results {
        let started = Instant::now();
        let mut pods = pods;
        sort_for_packing(&mut pods);
        for pod in &pods {
            if let Err(error) = self.topology.update(pod) {
                warn!(pod = %pod.metadata.name, %error, "failed to derive topology groups");
            }
        }

        let mut errors: HashMap<Uid, SchedulingError> = HashMap::new();
        let mut queue = Queue::new(pods);
        while let Some(mut pod) = queue.pop() {
            metrics::gauge_set(
                metrics::QUEUE_DEPTH,
                &[("controller", "scheduler")],
                queue.len() as f64,
            );
            match self.add(&pod) {
                Ok(()) => {
                    errors.remove(pod.uid());
                    continue;
                }
                Err(error) => {
                    errors.insert(pod.uid().clone(), error);
                }
            }
            let relaxed = self.preferences.relax(&mut pod, &self.prefer_no_schedule_taints);
            let was_relaxed = relaxed.is_some();
            if was_relaxed {
                if let Err(error) = self.topology.update(&pod) {
                    warn!(pod = %pod.metadata.name, %error, "failed to rebuild topology groups after relaxation");
                }
            }
            queue.push(pod, was_relaxed);
        }

        let pod_errors: Vec<(Pod, SchedulingError)> = queue
            .remaining()
            .map(|pod| {
                let error = errors
                    .get(pod.uid())
                    .cloned()
                    .unwrap_or(SchedulingError::NoTemplateFit);
                (pod.clone(), error)
            })
            .collect();

        let mut results = Results {
            existing_nodes: self.existing_nodes,
            new_nodes: self.new_nodes,
            pod_errors,
        };
        results.finalize(self.max_instance_types);

        metrics::observe(
            metrics::SCHEDULING_DURATION_SECONDS,
            &[("controller", "scheduler")],
            started.elapsed().as_secs_f64(),
        );
        metrics::gauge_set(
            metrics::UNSCHEDULABLE_PODS_COUNT,
            &[("controller", "scheduler")],
            results.pod_errors.len() as f64,
        );
        results
    }

    fn add(&mut self, pod: &Pod) -> Result<()> {
        let data = PodData::for_pod(pod)?;

        for node in &mut self.existing_nodes {
            if node.add(pod, &data, &mut self.topology, &self.resolver).is_ok() {
                return Ok(());
            }
        }

        // in-flight nodes, emptiest first, to pack rather than sprawl
        let mut order: Vec<usize> = (0..self.new_nodes.len()).collect();
        order.sort_by_key(|&i| self.new_nodes[i].pods.len());
        for i in order {
            if self.new_nodes[i].add(pod, &data, &mut self.topology).is_ok() {
                return Ok(());
            }
        }

        let mut failures: Vec<(String, SchedulingError)> = Vec::new();
        let templates = self.templates.clone();
        for template in templates {
            let pool = template.node_pool.clone();
            let catalog = self.catalogs.get(&pool).cloned().unwrap_or_default();
            let catalog = match self.remaining_resources.get(&pool) {
                // only the resources the pool limits constrain the catalog
                Some(remaining) => InstanceTypes::new(
                    catalog
                        .iter()
                        .filter(|it| {
                            remaining.iter().all(|(name, budget)| it.capacity.get(name) <= *budget)
                        })
                        .cloned()
                        .collect(),
                ),
                None => catalog,
            };
            if catalog.is_empty() {
                failures.push((
                    pool.clone(),
                    SchedulingError::PoolLimitExceeded { node_pool: pool.clone() },
                ));
                continue;
            }
            let daemon = self.daemon_overhead.get(&pool).cloned().unwrap_or_default();
            let mut node = NewNode::new(template.clone(), &mut self.topology, daemon, catalog);
            match node.add(pod, &data, &mut self.topology) {
                Ok(()) => {
                    if let Some(remaining) = self.remaining_resources.get_mut(&pool) {
                        // assume the worst-case launch against the pool limit
                        let max = max_resources(&node.instance_types);
                        *remaining = remaining
                            .iter()
                            .map(|(name, budget)| {
                                (name.clone(), budget.saturating_sub(max.get(name)).max(Quantity::ZERO))
                            })
                            .collect();
                    }
                    debug!(pod = %pod.metadata.name, node_pool = %pool, "creating new node for pod");
                    self.new_nodes.push(node);
                    return Ok(());
                }
                Err(error) => failures.push((pool, error)),
            }
        }

        match failures.len() {
            0 => Err(SchedulingError::NoTemplateFit),
            1 => Err(failures.remove(0).1),
            _ => Err(SchedulingError::NoPoolFit {
                failures: failures.into_iter().map(|(pool, e)| (pool, e.to_string())).collect(),
            }),
        }
    }
}

/// Big pods first so bin-packing stays tight; ties break on age then identity
/// so the order, and therefore the whole pass, is deterministic.
fn sort_for_packing(pods: &mut [Pod]) {
    pods.sort_by(|a, b| {
        b.spec
            .requests
            .cpu()
            .cmp(&a.spec.requests.cpu())
            .then(b.spec.requests.memory().cmp(&a.spec.requests.memory()))
            .then(a.metadata.creation_timestamp.cmp(&b.metadata.creation_timestamp))
            .then(a.metadata.uid.cmp(&b.metadata.uid))
    });
}

/// The outcome of one scheduling pass
#[derive(Debug, Clone)]
pub struct Results {
    /// Live nodes, holding any pods this pass added to them
    pub existing_nodes: Vec<ExistingNode>,
    /// Nodes that must be created, with narrowed instance options
    pub new_nodes: Vec<NewNode>,
    pub pod_errors: Vec<(Pod, SchedulingError)>,
}

impl Results {
    /// True when every pod that is already running somewhere found a home.
    /// Pods that were pending to begin with may stay pending.
    pub fn all_non_pending_pods_scheduled(&self) -> bool {
        self.pod_errors.iter().all(|(pod, _)| pod.is_pending())
    }

    /// Human-readable summary of why non-pending pods failed
    pub fn non_pending_errors(&self) -> Vec<String> {
        self.pod_errors
            .iter()
            .filter(|(pod, _)| !pod.is_pending())
            .map(|(pod, error)| format!("pod {}/{}: {error}", pod.metadata.namespace, pod.metadata.name))
            .collect()
    }

    /// Drop hostname placeholders and truncate each new node's catalog to
    /// the flexibility cap, demoting nodes that lose their minimum-values
    /// coverage into per-pod errors.
    fn finalize(&mut self, max_instance_types: usize) {
        let mut surviving = Vec::with_capacity(self.new_nodes.len());
        for mut node in self.new_nodes.drain(..) {
            node.finalize();
            match node.instance_types.truncate(&node.requirements, max_instance_types) {
                Ok(truncated) => {
                    node.instance_types = truncated;
                    surviving.push(node);
                }
                Err(error) => {
                    for pod in &node.pods {
                        self.pod_errors.push((pod.clone(), error.clone()));
                    }
                }
            }
        }
        self.new_nodes = surviving;
    }

    /// Publish nominations and failures, and protect nominated nodes in the
    /// cluster state so disruption leaves them alone.
    pub fn record(&self, recorder: &dyn EventRecorder, cluster: &ClusterState) {
        for node in &self.existing_nodes {
            for pod in &node.pods {
                cluster.nominate(&node.provider_id);
                recorder.publish(Event::NominatePod {
                    pod: pod.uid().clone(),
                    node: node.name.clone(),
                });
            }
        }
        for (pod, error) in &self.pod_errors {
            recorder.publish(Event::PodFailedToSchedule {
                pod: pod.uid().clone(),
                reason: error.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{labels, ObjectMeta};
    use crate::resources::{CPU, MEMORY};
    use crate::scheduling::instance_type::{InstanceType, Offering, Offerings};
    use crate::scheduling::requirements::Requirement;
    use std::collections::{BTreeSet, HashSet};

    fn shape(name: &str, cpu: i64, memory_gi: i64, zones: &[&str], price: f64) -> Arc<InstanceType> {
        let mut capacity = ResourceList::new();
        capacity.insert(CPU, Quantity::from_units(cpu));
        capacity.insert(MEMORY, Quantity::from_gi(memory_gi));
        capacity.insert(PODS, Quantity::from_units(110));
        let mut requirements = Requirements::new();
        requirements.add(Requirement::new_in(labels::INSTANCE_TYPE, [name]));
        requirements.add(Requirement::new_in(labels::ZONE, zones.iter().copied()));
        requirements.add(Requirement::new_in(
            labels::CAPACITY_TYPE,
            [labels::CAPACITY_TYPE_ON_DEMAND],
        ));
        Arc::new(InstanceType {
            name: name.to_string(),
            requirements,
            capacity: capacity.clone(),
            allocatable: capacity,
            offerings: Offerings(
                zones
                    .iter()
                    .map(|z| Offering::new(z, labels::CAPACITY_TYPE_ON_DEMAND, price))
                    .collect(),
            ),
        })
    }

    fn scheduler_for(catalog: Vec<Arc<InstanceType>>, zones: &[&str]) -> Scheduler {
        let mut pool = crate::api::NodePool::default();
        pool.metadata = ObjectMeta::named("default");
        let template = Arc::new(NodeClaimTemplate::from_pool(&pool).unwrap());
        let topology = Topology::new(
            vec![],
            [(labels::ZONE.to_string(), zones.iter().map(|z| z.to_string()).collect::<BTreeSet<_>>())]
                .into(),
            HashSet::new(),
        )
        .unwrap();
        Scheduler::new(
            vec![],
            vec![template],
            [("default".to_string(), InstanceTypes::new(catalog))].into(),
            HashMap::new(),
            HashMap::new(),
            topology,
            VolumeResolver::default(),
            60,
        )
    }

    fn pod(name: &str, cpu_millis: i64, memory_gi: i64) -> Pod {
        let mut pod = Pod { metadata: ObjectMeta::named(name), ..Default::default() };
        pod.metadata.namespace = "default".to_string();
        pod.spec.requests.insert(CPU, Quantity::from_millis(cpu_millis));
        pod.spec.requests.insert(MEMORY, Quantity::from_gi(memory_gi));
        pod
    }

    #[test]
    fn two_pods_pack_onto_one_new_node() {
        let scheduler = scheduler_for(vec![shape("m", 2, 4, &["a"], 1.0)], &["a"]);
        let results = scheduler.solve(vec![pod("p1", 1000, 1), pod("p2", 1000, 1)]);
        assert!(results.pod_errors.is_empty());
        assert_eq!(results.new_nodes.len(), 1);
        assert_eq!(results.new_nodes[0].pods.len(), 2);
        assert!(results.new_nodes[0].instance_types.names().contains(&"m"));
    }

    #[test]
    fn oversized_batch_spills_to_more_nodes() {
        let scheduler = scheduler_for(vec![shape("m", 2, 4, &["a"], 1.0)], &["a"]);
        let results = scheduler.solve(vec![
            pod("p1", 1500, 1),
            pod("p2", 1500, 1),
            pod("p3", 1500, 1),
        ]);
        assert!(results.pod_errors.is_empty());
        assert_eq!(results.new_nodes.len(), 3);
    }

    #[test]
    fn impossible_pod_gets_terminal_error() {
        let scheduler = scheduler_for(vec![shape("m", 2, 4, &["a"], 1.0)], &["a"]);
        let results = scheduler.solve(vec![pod("huge", 1_000_000, 1)]);
        assert_eq!(results.pod_errors.len(), 1);
        let (_, error) = &results.pod_errors[0];
        assert!(error.to_string().contains("no instance type has enough resources"));
        assert!(error.to_string().contains("m vs M typo?"));
    }

    #[test]
    fn solve_is_deterministic() {
        let run = || {
            let scheduler = scheduler_for(
                vec![shape("m", 2, 4, &["a"], 1.0), shape("l", 8, 16, &["a"], 3.0)],
                &["a"],
            );
            let results = scheduler.solve(vec![
                pod("p1", 500, 1),
                pod("p2", 1500, 2),
                pod("p3", 250, 1),
            ]);
            results
                .new_nodes
                .iter()
                .map(|n| {
                    let mut pods: Vec<String> =
                        n.pods.iter().map(|p| p.metadata.name.clone()).collect();
                    pods.sort();
                    (pods, n.instance_types.names().join(","))
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn pool_limits_bound_node_creation() {
        let mut pool = crate::api::NodePool::default();
        pool.metadata = ObjectMeta::named("default");
        let template = Arc::new(NodeClaimTemplate::from_pool(&pool).unwrap());
        let topology = Topology::new(
            vec![],
            [(labels::ZONE.to_string(), BTreeSet::from(["a".to_string()]))].into(),
            HashSet::new(),
        )
        .unwrap();
        let mut limit = ResourceList::new();
        limit.insert(CPU, Quantity::from_units(2));
        let scheduler = Scheduler::new(
            vec![],
            vec![template],
            [("default".to_string(), InstanceTypes::new(vec![shape("m", 2, 4, &["a"], 1.0)]))]
                .into(),
            HashMap::new(),
            [("default".to_string(), limit)].into(),
            topology,
            VolumeResolver::default(),
            60,
        );
        // first node consumes the whole 2-CPU budget; second pod cannot fit
        // on it (capacity) nor on a new node (limits)
        let results = scheduler.solve(vec![pod("p1", 1500, 1), pod("p2", 1500, 1)]);
        assert_eq!(results.new_nodes.len(), 1);
        assert_eq!(results.pod_errors.len(), 1);
        assert!(matches!(results.pod_errors[0].1, SchedulingError::PoolLimitExceeded { .. }));
    }
}
