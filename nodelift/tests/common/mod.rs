//! Shared test harness: an in-memory object store, a fake cloud provider,
//! and builders for the objects the scenarios need.

#![allow(dead_code)]

use async_trait::async_trait;
use nodelift::api::{
    labels, ConditionType, Node, NodeClaim, NodeClaimSpec, NodePool, ObjectMeta, OwnerReference,
    Pod, PodDisruptionBudget, PodPhase, Taint, VolumeResolver,
};
use nodelift::disruption::{DisruptionContext, OrchestrationQueue};
use nodelift::events::RecordingRecorder;
use nodelift::provider::{CloudProvider, ProviderError};
use nodelift::provisioning::Provisioner;
use nodelift::resources::{Quantity, ResourceList, CPU, MEMORY, PODS};
use nodelift::scheduling::{InstanceType, Offering, Offerings, Requirement, Requirements};
use nodelift::state::{ClusterState, ObjectStore, StateError};
use nodelift::Options;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct InMemoryStore {
    pub pods: Mutex<Vec<Pod>>,
    pub pools: Mutex<Vec<NodePool>>,
    pub pdbs: Mutex<Vec<PodDisruptionBudget>>,
    pub claims: Mutex<HashMap<String, NodeClaim>>,
    pub node_taints: Mutex<HashMap<String, Vec<Taint>>>,
    /// When set, claim deletions fail with a retryable error
    pub fail_deletions: std::sync::atomic::AtomicBool,
}

impl InMemoryStore {
    pub fn taints_on(&self, node: &str) -> Vec<Taint> {
        self.node_taints.lock().get(node).cloned().unwrap_or_default()
    }

    pub fn claim(&self, name: &str) -> Option<NodeClaim> {
        self.claims.lock().get(name).cloned()
    }

    pub fn initialize_claim(&self, name: &str) {
        if let Some(claim) = self.claims.lock().get_mut(name) {
            claim.set_condition(ConditionType::Initialized, true, None);
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn list_pods(&self) -> Result<Vec<Pod>, StateError> {
        Ok(self.pods.lock().clone())
    }

    async fn list_node_pools(&self) -> Result<Vec<NodePool>, StateError> {
        Ok(self.pools.lock().clone())
    }

    async fn list_pod_disruption_budgets(&self) -> Result<Vec<PodDisruptionBudget>, StateError> {
        Ok(self.pdbs.lock().clone())
    }

    async fn get_node_claim(&self, name: &str) -> Result<NodeClaim, StateError> {
        self.claims
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| StateError::not_found("NodeClaim", name))
    }

    async fn taint_node(&self, node_name: &str, taint: Taint) -> Result<(), StateError> {
        let mut taints = self.node_taints.lock();
        let entry = taints.entry(node_name.to_string()).or_default();
        if !entry.contains(&taint) {
            entry.push(taint);
        }
        Ok(())
    }

    async fn remove_node_taint(&self, node_name: &str, taint_key: &str) -> Result<(), StateError> {
        if let Some(entry) = self.node_taints.lock().get_mut(node_name) {
            entry.retain(|t| t.key != taint_key);
        }
        Ok(())
    }

    async fn set_node_claim_condition(
        &self,
        name: &str,
        condition_type: ConditionType,
        status: bool,
        reason: Option<String>,
    ) -> Result<(), StateError> {
        let mut claims = self.claims.lock();
        let claim =
            claims.get_mut(name).ok_or_else(|| StateError::not_found("NodeClaim", name))?;
        claim.set_condition(condition_type, status, reason);
        Ok(())
    }

    async fn clear_node_claim_condition(
        &self,
        name: &str,
        condition_type: ConditionType,
    ) -> Result<(), StateError> {
        let mut claims = self.claims.lock();
        let claim =
            claims.get_mut(name).ok_or_else(|| StateError::not_found("NodeClaim", name))?;
        claim.clear_condition(condition_type);
        Ok(())
    }

    async fn delete_node_claim(&self, name: &str) -> Result<(), StateError> {
        if self.fail_deletions.load(Ordering::SeqCst) {
            return Err(StateError::Unavailable("store is refusing deletions".to_string()));
        }
        let mut claims = self.claims.lock();
        let claim =
            claims.get_mut(name).ok_or_else(|| StateError::not_found("NodeClaim", name))?;
        claim.metadata.deletion_timestamp = Some(chrono::Utc::now());
        Ok(())
    }

    async fn volume_resolver(&self) -> Result<VolumeResolver, StateError> {
        Ok(VolumeResolver::default())
    }
}

pub struct FakeProvider {
    pub types: Mutex<HashMap<String, Vec<Arc<InstanceType>>>>,
    pub created: Mutex<Vec<NodeClaim>>,
    store: Arc<InMemoryStore>,
    counter: AtomicUsize,
}

impl FakeProvider {
    pub fn new(store: Arc<InMemoryStore>) -> Arc<Self> {
        Arc::new(FakeProvider {
            types: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            store,
            counter: AtomicUsize::new(0),
        })
    }

    pub fn register(&self, pool: &str, types: Vec<Arc<InstanceType>>) {
        self.types.lock().insert(pool.to_string(), types);
    }
}

#[async_trait]
impl CloudProvider for FakeProvider {
    async fn get_instance_types(
        &self,
        node_pool: &NodePool,
    ) -> Result<Vec<Arc<InstanceType>>, ProviderError> {
        Ok(self.types.lock().get(node_pool.name()).cloned().unwrap_or_default())
    }

    async fn create(&self, claim: &NodeClaimSpec) -> Result<NodeClaim, ProviderError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = format!("replacement-{n}");
        let mut created = NodeClaim {
            metadata: ObjectMeta::named(name.clone()),
            spec: claim.clone(),
            ..Default::default()
        };
        created.status.provider_id = Some(format!("fake://{name}"));
        created.set_condition(ConditionType::Launched, true, None);
        self.store.claims.lock().insert(name, created.clone());
        self.created.lock().push(created.clone());
        Ok(created)
    }

    async fn delete(&self, _claim_name: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}

pub struct Harness {
    pub cluster: Arc<ClusterState>,
    pub store: Arc<InMemoryStore>,
    pub provider: Arc<FakeProvider>,
    pub recorder: Arc<RecordingRecorder>,
    pub provisioner: Arc<Provisioner>,
    pub queue: Arc<OrchestrationQueue>,
    pub ctx: DisruptionContext,
}

pub fn harness() -> Harness {
    harness_with(Options::default())
}

pub fn harness_with(options: Options) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let cluster = Arc::new(ClusterState::new(options.nomination_window()));
    let store = Arc::new(InMemoryStore::default());
    let provider = FakeProvider::new(store.clone());
    let recorder = RecordingRecorder::new();
    let provisioner = Arc::new(Provisioner::new(
        cluster.clone(),
        store.clone(),
        provider.clone(),
        recorder.clone(),
        options.clone(),
    ));
    let queue = OrchestrationQueue::new(
        cluster.clone(),
        store.clone(),
        provider.clone(),
        recorder.clone(),
        options.clone(),
    );
    let ctx = DisruptionContext {
        cluster: cluster.clone(),
        store: store.clone(),
        provider: provider.clone(),
        recorder: recorder.clone(),
        provisioner: provisioner.clone(),
        queue: queue.clone(),
        options,
    };
    cluster.mark_synced();
    Harness { cluster, store, provider, recorder, provisioner, queue, ctx }
}

/// An instance type offered in every given (zone, capacity type) pair
pub fn shape(
    name: &str,
    cpu_cores: i64,
    memory_gi: i64,
    price: f64,
    zones: &[&str],
    capacity_types: &[&str],
) -> Arc<InstanceType> {
    let mut capacity = ResourceList::new();
    capacity.insert(CPU, Quantity::from_units(cpu_cores));
    capacity.insert(MEMORY, Quantity::from_gi(memory_gi));
    capacity.insert(PODS, Quantity::from_units(110));
    let mut requirements = Requirements::new();
    requirements.add(Requirement::new_in(labels::INSTANCE_TYPE, [name]));
    requirements.add(Requirement::new_in(labels::ZONE, zones.iter().copied()));
    requirements.add(Requirement::new_in(labels::CAPACITY_TYPE, capacity_types.iter().copied()));
    let mut offerings = Vec::new();
    for zone in zones {
        for capacity_type in capacity_types {
            offerings.push(Offering::new(zone, capacity_type, price));
        }
    }
    Arc::new(InstanceType {
        name: name.to_string(),
        requirements,
        capacity: capacity.clone(),
        allocatable: capacity,
        offerings: Offerings(offerings),
    })
}

pub fn pool(name: &str) -> NodePool {
    NodePool { metadata: ObjectMeta::named(name), ..Default::default() }
}

/// Register a pool with the store and its catalog with the provider
pub fn add_pool(h: &Harness, pool: NodePool, types: Vec<Arc<InstanceType>>) {
    h.provider.register(pool.name(), types);
    h.store.pools.lock().push(pool);
}

/// A live, initialized, managed node backed by `instance_type`
pub fn live_node(
    h: &Harness,
    name: &str,
    instance_type: &Arc<InstanceType>,
    zone: &str,
    capacity_type: &str,
    pool_name: &str,
) {
    let provider_id = format!("fake://{name}");
    let mut node = Node::default();
    node.metadata = ObjectMeta::named(name);
    node.metadata.creation_timestamp = Some(chrono::Utc::now());
    node.metadata.labels.insert(labels::HOSTNAME.to_string(), name.to_string());
    node.metadata.labels.insert(labels::ZONE.to_string(), zone.to_string());
    node.metadata
        .labels
        .insert(labels::CAPACITY_TYPE.to_string(), capacity_type.to_string());
    node.metadata
        .labels
        .insert(labels::INSTANCE_TYPE.to_string(), instance_type.name.clone());
    node.metadata.labels.insert(labels::NODE_POOL.to_string(), pool_name.to_string());
    node.ready = true;
    node.provider_id = provider_id.clone();
    node.capacity = instance_type.capacity.clone();
    node.allocatable = instance_type.allocatable.clone();

    let mut claim = NodeClaim::default();
    claim.metadata = ObjectMeta::named(format!("claim-{name}"));
    claim.metadata.creation_timestamp = node.metadata.creation_timestamp;
    claim.spec.node_pool = pool_name.to_string();
    claim.status.provider_id = Some(provider_id);
    claim.set_condition(ConditionType::Launched, true, None);
    claim.set_condition(ConditionType::Initialized, true, None);

    h.store.claims.lock().insert(claim.name().to_string(), claim.clone());
    h.cluster.update_node(node);
    h.cluster.update_node_claim(claim);
}

/// Mark a live node's claim as drifted
pub fn mark_drifted(h: &Harness, node_name: &str) {
    let claim_name = format!("claim-{node_name}");
    let mut claims = h.store.claims.lock();
    let claim = claims.get_mut(&claim_name).expect("claim exists");
    claim.set_condition(ConditionType::Drifted, true, None);
    h.cluster.update_node_claim(claim.clone());
}

pub fn pending_pod(name: &str, cpu_millis: i64, memory_gi: i64) -> Pod {
    let mut pod = Pod { metadata: ObjectMeta::named(name), ..Default::default() };
    pod.metadata.namespace = "default".to_string();
    pod.metadata.creation_timestamp = Some(chrono::Utc::now());
    pod.metadata.owner_references = vec![OwnerReference {
        kind: "ReplicaSet".to_string(),
        name: "owner".to_string(),
        controller: true,
    }];
    pod.spec.requests.insert(CPU, Quantity::from_millis(cpu_millis));
    if memory_gi > 0 {
        pod.spec.requests.insert(MEMORY, Quantity::from_gi(memory_gi));
    }
    pod
}

/// A running pod bound to `node_name`, registered in store and cluster
pub fn running_pod(h: &Harness, name: &str, cpu_millis: i64, node_name: &str) -> Pod {
    let mut pod = pending_pod(name, cpu_millis, 0);
    pod.spec.node_name = Some(node_name.to_string());
    pod.status.phase = PodPhase::Running;
    h.store.pods.lock().push(pod.clone());
    h.cluster.update_pod(pod.clone());
    pod
}

/// Add a pending pod to the store only
pub fn queue_pod(h: &Harness, pod: Pod) {
    h.store.pods.lock().push(pod);
}
