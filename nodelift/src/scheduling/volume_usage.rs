//! Attached-volume tracking per node, with per-driver limits

use super::error::{Result, SchedulingError};
use crate::api::{Pod, Uid, VolumeResolver};
use std::collections::{BTreeMap, BTreeSet};

/// Unique volumes attached to a node, grouped by CSI driver
#[derive(Debug, Clone, Default)]
pub struct VolumeUsage {
    /// driver -> volume ids currently attached
    attached: BTreeMap<String, BTreeSet<String>>,
    /// pod uid -> (driver, volume id) pairs it contributed
    by_pod: BTreeMap<Uid, Vec<(String, String)>>,
    /// driver -> maximum attachable volumes
    limits: BTreeMap<String, usize>,
}

impl VolumeUsage {
    pub fn new(limits: BTreeMap<String, usize>) -> Self {
        VolumeUsage { limits, ..Default::default() }
    }

    /// Resolve the pod's claim-backed volumes and check that attaching the
    /// new ones stays within every driver's limit. Returns the resolved
    /// volumes for a later [`VolumeUsage::add`].
    pub fn validate(
        &self,
        pod: &Pod,
        resolver: &VolumeResolver,
    ) -> Result<Vec<(String, String)>> {
        let mut resolved = Vec::new();
        let mut new_per_driver: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for volume in &pod.spec.volumes {
            let Some(claim) = &volume.claim_name else { continue };
            let Some((driver, volume_id)) = resolver.resolve(&pod.metadata.namespace, claim)
            else {
                continue;
            };
            resolved.push((driver, volume_id));
        }
        for (driver, volume_id) in &resolved {
            let already = self.attached.get(driver).is_some_and(|s| s.contains(volume_id));
            if !already {
                new_per_driver.entry(driver).or_default().insert(volume_id);
            }
        }
        for (driver, new_volumes) in new_per_driver {
            let Some(limit) = self.limits.get(driver) else { continue };
            let current = self.attached.get(driver).map(|s| s.len()).unwrap_or(0);
            if current + new_volumes.len() > *limit {
                return Err(SchedulingError::VolumeLimitExceeded {
                    driver: driver.to_string(),
                    limit: *limit,
                });
            }
        }
        Ok(resolved)
    }

    pub fn add(&mut self, pod: &Pod, resolved: Vec<(String, String)>) {
        for (driver, volume_id) in &resolved {
            self.attached.entry(driver.clone()).or_default().insert(volume_id.clone());
        }
        self.by_pod.entry(pod.uid().clone()).or_default().extend(resolved);
    }

    pub fn remove_pod(&mut self, uid: &Uid) {
        let Some(volumes) = self.by_pod.remove(uid) else { return };
        for (driver, volume_id) in volumes {
            // another pod may still reference the same volume
            let still_used = self
                .by_pod
                .values()
                .flatten()
                .any(|(d, v)| d == &driver && v == &volume_id);
            if !still_used {
                if let Some(set) = self.attached.get_mut(&driver) {
                    set.remove(&volume_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ObjectMeta, PersistentVolume, PersistentVolumeClaim, PodVolume};

    fn resolver(claims: &[(&str, &str)]) -> VolumeResolver {
        let claims: Vec<PersistentVolumeClaim> = claims
            .iter()
            .map(|(claim, volume)| {
                let mut c = PersistentVolumeClaim::default();
                c.metadata = ObjectMeta::named(*claim);
                c.metadata.namespace = "default".to_string();
                c.volume_name = Some(volume.to_string());
                c
            })
            .collect();
        let volumes: Vec<PersistentVolume> = claims
            .iter()
            .filter_map(|c| c.volume_name.clone())
            .map(|name| {
                let mut v = PersistentVolume::default();
                v.metadata = ObjectMeta::named(name);
                v.driver = Some("ebs.csi".to_string());
                v
            })
            .collect();
        VolumeResolver::new(claims, volumes, vec![])
    }

    fn pod_with_claims(name: &str, claims: &[&str]) -> Pod {
        let mut pod = Pod::default();
        pod.metadata = ObjectMeta::named(name);
        pod.metadata.namespace = "default".to_string();
        pod.spec.volumes = claims
            .iter()
            .map(|c| PodVolume { name: format!("vol-{c}"), claim_name: Some(c.to_string()) })
            .collect();
        pod
    }

    #[test]
    fn limit_blocks_new_volumes_but_not_shared_ones() {
        let resolver = resolver(&[("c1", "pv1"), ("c2", "pv2")]);
        let mut usage = VolumeUsage::new([("ebs.csi".to_string(), 1)].into());

        let first = pod_with_claims("first", &["c1"]);
        let resolved = usage.validate(&first, &resolver).unwrap();
        usage.add(&first, resolved);

        // a second distinct volume exceeds the limit of 1
        let second = pod_with_claims("second", &["c2"]);
        assert!(usage.validate(&second, &resolver).is_err());

        // but sharing the already-attached volume is fine
        let sharer = pod_with_claims("sharer", &["c1"]);
        assert!(usage.validate(&sharer, &resolver).is_ok());
    }

    #[test]
    fn removal_releases_volumes_once_unreferenced() {
        let resolver = resolver(&[("c1", "pv1")]);
        let mut usage = VolumeUsage::new([("ebs.csi".to_string(), 1)].into());

        let first = pod_with_claims("first", &["c1"]);
        let resolved = usage.validate(&first, &resolver).unwrap();
        usage.add(&first, resolved);
        usage.remove_pod(first.uid());

        let second = pod_with_claims("second", &["c2"]);
        // c2 does not resolve, so it is unconstrained
        assert!(usage.validate(&second, &resolver).is_ok());
    }
}
