//! In-pass model of a node that does not exist yet.
//!
//! A new node is born from a node pool template with the template's full
//! instance-type catalog. Every pod added intersects its requirements and
//! filters its catalog; the eligible instance types are always exactly those
//! compatible with the current requirements that also fit daemon overhead
//! plus the scheduled requests. If no type remains, the node is
//! unsatisfiable and the add is rejected.

use super::error::{Result, SchedulingError};
use super::host_ports::HostPortUsage;
use super::instance_type::InstanceTypes;
use super::requirements::{Requirement, Requirements};
use super::scheduler::PodData;
use super::topology::Topology;
use crate::api::{labels, taints, NodeClaimSpec, NodePool, Pod, Taint};
use crate::resources::{Quantity, ResourceList, CPU};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// The per-pool template every new node starts from
#[derive(Debug, Clone)]
pub struct NodeClaimTemplate {
    pub node_pool: String,
    pub labels: BTreeMap<String, String>,
    pub requirements: Requirements,
    pub taints: Vec<Taint>,
    pub startup_taints: Vec<Taint>,
}

impl NodeClaimTemplate {
    pub fn from_pool(pool: &NodePool) -> Result<Self> {
        let template = &pool.spec.template;
        let mut requirements = Requirements::from_labels(&template.labels);
        requirements.add_all(Requirements::try_from_selector(&template.requirements)?);
        requirements.add(Requirement::new_in(labels::NODE_POOL, [pool.name()]));
        Ok(NodeClaimTemplate {
            node_pool: pool.name().to_string(),
            labels: template.labels.clone(),
            requirements,
            taints: template.taints.clone(),
            startup_taints: template.startup_taints.clone(),
        })
    }
}

/// A candidate node accumulating pods and narrowing instance options
#[derive(Debug, Clone)]
pub struct NewNode {
    pub template: Arc<NodeClaimTemplate>,
    pub requirements: Requirements,
    pub daemon_resources: ResourceList,
    /// Daemon overhead plus every scheduled pod's requests
    pub requests: ResourceList,
    pub pods: Vec<Pod>,
    pub instance_types: InstanceTypes,
    host_ports: HostPortUsage,
    hostname: String,
}

impl NewNode {
    /// Create an empty candidate. Registers a placeholder hostname domain so
    /// hostname-keyed topologies can spread onto this node.
    pub fn new(
        template: Arc<NodeClaimTemplate>,
        topology: &mut Topology,
        daemon_resources: ResourceList,
        instance_types: InstanceTypes,
    ) -> Self {
        let hostname = format!("hostname-placeholder-{}", Uuid::new_v4().simple());
        topology.register(labels::HOSTNAME, &hostname);
        let mut requirements = template.requirements.clone();
        requirements.add(Requirement::new_in(labels::HOSTNAME, [hostname.as_str()]));
        NewNode {
            requirements,
            requests: daemon_resources.clone(),
            daemon_resources,
            pods: Vec::new(),
            instance_types,
            host_ports: HostPortUsage::new(),
            hostname,
            template,
        }
    }

    /// Try to place `pod` on this node, narrowing the catalog on success
    pub fn add(&mut self, pod: &Pod, data: &PodData, topology: &mut Topology) -> Result<()> {
        if let Some(taint) = taints::first_untolerated(&self.template.taints, &pod.spec.tolerations)
        {
            return Err(SchedulingError::Untolerated { taint: taint.to_string() });
        }
        self.host_ports.validate(&data.host_ports)?;

        // a pod with preferred node affinity contributes only its strict
        // requirements; the preference may be relaxed later
        let pod_requirements = if pod.has_preferred_node_affinity() {
            &data.strict_requirements
        } else {
            &data.requirements
        };

        let mut node_requirements = self.requirements.clone();
        node_requirements.compatible(pod_requirements, true)?;
        node_requirements.add_all(pod_requirements.clone());

        let tightened = topology.add_requirements(
            pod,
            &self.template.taints,
            pod_requirements,
            &node_requirements,
            true,
        )?;
        node_requirements.compatible(&tightened, true)?;
        node_requirements.add_all(tightened.clone());

        let requests = self.requests.merged(&data.requests);
        let remaining = filter_instance_types(&self.instance_types, &node_requirements, &requests)?;

        self.pods.push(pod.clone());
        self.instance_types = remaining;
        self.requests = requests;
        self.requirements = node_requirements;
        topology.record(pod, &self.template.taints, &self.requirements, true);
        self.host_ports.add(pod, &data.host_ports);
        Ok(())
    }

    /// Strip the hostname placeholder before surfacing to callers; the real
    /// hostname is assigned by the provider at launch
    pub fn finalize(&mut self) {
        self.requirements.remove(labels::HOSTNAME);
    }

    /// The claim to hand to the cloud provider for this node
    pub fn to_claim_spec(&self) -> NodeClaimSpec {
        let mut claim_labels = self.requirements.single_valued_labels();
        claim_labels.remove(labels::HOSTNAME);
        for (key, value) in &self.template.labels {
            claim_labels.insert(key.clone(), value.clone());
        }
        NodeClaimSpec {
            node_pool: self.template.node_pool.clone(),
            labels: claim_labels,
            requirements: {
                let mut reqs = self.requirements.clone();
                reqs.remove(labels::HOSTNAME);
                reqs.to_selector_requirements()
            },
            taints: self.template.taints.clone(),
            startup_taints: self.template.startup_taints.clone(),
            resources: self.requests.clone(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

/// Filter the catalog to types compatible with `reqs` whose allocatable
/// capacity covers `requests`. Failure reports which of the three checks no
/// type passed, so the caller can tell a requirements problem from a sizing
/// problem from an offering problem.
pub fn filter_instance_types(
    instance_types: &InstanceTypes,
    reqs: &Requirements,
    requests: &ResourceList,
) -> Result<InstanceTypes> {
    let mut remaining = Vec::new();
    let mut any_requirements = false;
    let mut any_fits = false;
    let mut any_offering = false;
    for it in instance_types.iter() {
        let matches = it.matches_requirements(reqs);
        let fits = it.fits(requests);
        let offering = it.has_offering(reqs);
        any_requirements |= matches;
        any_fits |= fits;
        any_offering |= offering;
        if matches && fits && offering {
            remaining.push(it.clone());
        }
    }
    if remaining.is_empty() {
        return Err(SchedulingError::NoInstanceType {
            requirements_ok: any_requirements,
            resources_ok: any_fits,
            offerings_ok: any_offering,
            cpu_hint: requests.get(CPU) >= Quantity::from_millis(1_000_000),
        });
    }
    Ok(InstanceTypes::new(remaining))
}

/// Upper bound of what launching this node could consume, for pool limits
pub fn max_resources(instance_types: &InstanceTypes) -> ResourceList {
    let mut out = ResourceList::new();
    for it in instance_types.iter() {
        out = out.merge_max(&it.capacity);
    }
    out
}
