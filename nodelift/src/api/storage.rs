//! Persistent volume objects and claim-to-driver resolution

use super::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PersistentVolume {
    pub metadata: ObjectMeta,
    /// CSI driver that provisioned this volume
    #[serde(default)]
    pub driver: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PersistentVolumeClaim {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub storage_class: Option<String>,
    /// Bound volume, once provisioned
    #[serde(default)]
    pub volume_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StorageClass {
    pub metadata: ObjectMeta,
    pub provisioner: String,
}

/// Resolves pod volume references to the CSI driver that will attach them.
///
/// Bound claims resolve through their volume; unbound claims resolve through
/// their storage class provisioner. Volumes that resolve to no driver do not
/// constrain scheduling.
#[derive(Debug, Clone, Default)]
pub struct VolumeResolver {
    claims: HashMap<(String, String), PersistentVolumeClaim>,
    volumes: HashMap<String, PersistentVolume>,
    storage_classes: HashMap<String, StorageClass>,
}

impl VolumeResolver {
    pub fn new(
        claims: Vec<PersistentVolumeClaim>,
        volumes: Vec<PersistentVolume>,
        storage_classes: Vec<StorageClass>,
    ) -> Self {
        VolumeResolver {
            claims: claims
                .into_iter()
                .map(|c| ((c.metadata.namespace.clone(), c.metadata.name.clone()), c))
                .collect(),
            volumes: volumes.into_iter().map(|v| (v.metadata.name.clone(), v)).collect(),
            storage_classes: storage_classes
                .into_iter()
                .map(|s| (s.metadata.name.clone(), s))
                .collect(),
        }
    }

    /// Driver and unique volume id for a claim reference, if it resolves
    pub fn resolve(&self, namespace: &str, claim_name: &str) -> Option<(String, String)> {
        let claim = self.claims.get(&(namespace.to_string(), claim_name.to_string()))?;
        if let Some(volume_name) = &claim.volume_name {
            if let Some(volume) = self.volumes.get(volume_name) {
                if let Some(driver) = &volume.driver {
                    return Some((driver.clone(), volume_name.clone()));
                }
            }
            return None;
        }
        let class = self.storage_classes.get(claim.storage_class.as_deref()?)?;
        // unbound claim: the volume does not exist yet, use the claim identity
        Some((class.provisioner.clone(), format!("{namespace}/{claim_name}")))
    }
}
