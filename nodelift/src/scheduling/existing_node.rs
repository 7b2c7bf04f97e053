//! In-pass model of a live node and its remaining capacity

use super::error::{Result, SchedulingError};
use super::host_ports::HostPortUsage;
use super::requirements::{Requirement, Requirements};
use super::scheduler::PodData;
use super::topology::Topology;
use super::volume_usage::VolumeUsage;
use crate::api::{labels, taints, Pod, Taint, VolumeResolver};
use crate::resources::ResourceList;
use std::collections::BTreeMap;

/// A live node the scheduler may place additional pods on.
///
/// Built from a deep-copied cluster state snapshot; mutation here never
/// touches shared state. `pods` holds only pods added by this pass.
#[derive(Debug, Clone)]
pub struct ExistingNode {
    pub name: String,
    pub provider_id: String,
    pub initialized: bool,
    pub pods: Vec<Pod>,
    taints: Vec<Taint>,
    requirements: Requirements,
    /// Capacity minus everything scheduled before this pass
    available: ResourceList,
    /// Daemon resources still expected plus requests added by this pass
    requests: ResourceList,
    host_ports: HostPortUsage,
    volumes: VolumeUsage,
}

impl ExistingNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        provider_id: String,
        initialized: bool,
        node_labels: &BTreeMap<String, String>,
        node_taints: Vec<Taint>,
        available: ResourceList,
        remaining_daemon_resources: ResourceList,
        host_ports: HostPortUsage,
        volumes: VolumeUsage,
        topology: &mut Topology,
    ) -> Self {
        let mut requirements = Requirements::from_labels(node_labels);
        if let Some(hostname) = node_labels.get(labels::HOSTNAME) {
            requirements.add(Requirement::new_in(labels::HOSTNAME, [hostname.as_str()]));
            topology.register(labels::HOSTNAME, hostname);
        }
        ExistingNode {
            name,
            provider_id,
            initialized,
            pods: Vec::new(),
            taints: node_taints,
            requirements,
            available,
            // expected daemons may not have scheduled yet; never negative
            requests: remaining_daemon_resources,
            host_ports,
            volumes,
        }
    }

    pub fn taints(&self) -> &[Taint] {
        &self.taints
    }

    pub fn requirements(&self) -> &Requirements {
        &self.requirements
    }

    /// Try to place `pod` here, updating usage tables on success
    pub fn add(
        &mut self,
        pod: &Pod,
        data: &PodData,
        topology: &mut Topology,
        resolver: &VolumeResolver,
    ) -> Result<()> {
        if let Some(taint) = taints::first_untolerated(&self.taints, &pod.spec.tolerations) {
            return Err(SchedulingError::Untolerated { taint: taint.to_string() });
        }
        self.host_ports.validate(&data.host_ports)?;
        let mounted = self.volumes.validate(pod, resolver)?;

        // resource fit is the likeliest failure; a live node cannot grow
        let requests = self.requests.merged(&data.requests);
        if !ResourceList::fits(&requests, &self.available) {
            return Err(SchedulingError::ExceedsNodeResources {
                resources: ResourceList::insufficient(&requests, &self.available),
            });
        }

        let mut node_requirements = self.requirements.clone();
        node_requirements.compatible(&data.requirements, false)?;
        node_requirements.add_all(data.requirements.clone());

        let tightened =
            topology.add_requirements(pod, &self.taints, &data.requirements, &node_requirements, false)?;
        node_requirements.compatible(&tightened, false)?;
        node_requirements.add_all(tightened.clone());

        self.pods.push(pod.clone());
        self.requests = requests;
        self.requirements = node_requirements;
        topology.record(pod, &self.taints, &self.requirements, false);
        self.host_ports.add(pod, &data.host_ports);
        self.volumes.add(pod, mounted);
        Ok(())
    }
}
