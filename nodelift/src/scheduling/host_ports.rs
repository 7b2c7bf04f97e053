//! Host port conflict tracking per node

use super::error::{Result, SchedulingError};
use crate::api::{HostPort, Pod, Uid};

/// Ports already bound on a node, by the pod that bound them
#[derive(Debug, Clone, Default)]
pub struct HostPortUsage {
    entries: Vec<(Uid, HostPort)>,
}

impl HostPortUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Error if any of `ports` collides with a port already in use.
    ///
    /// An unspecified IP collides with every address on the same port and
    /// protocol.
    pub fn validate(&self, ports: &[HostPort]) -> Result<()> {
        for port in ports {
            if let Some((_, existing)) = self.entries.iter().find(|(_, e)| conflicts(e, port)) {
                return Err(SchedulingError::HostPortConflict {
                    ip: existing
                        .ip
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "0.0.0.0".to_string()),
                    port: existing.port,
                });
            }
        }
        Ok(())
    }

    pub fn add(&mut self, pod: &Pod, ports: &[HostPort]) {
        for port in ports {
            self.entries.push((pod.uid().clone(), port.clone()));
        }
    }

    pub fn remove_pod(&mut self, uid: &Uid) {
        self.entries.retain(|(owner, _)| owner != uid);
    }
}

fn conflicts(a: &HostPort, b: &HostPort) -> bool {
    if a.port != b.port || a.protocol != b.protocol {
        return false;
    }
    match (a.ip, b.ip) {
        (Some(ip_a), Some(ip_b)) => ip_a == ip_b || ip_a.is_unspecified() || ip_b.is_unspecified(),
        // an absent IP binds the wildcard address
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ObjectMeta, Protocol};

    fn pod(name: &str) -> Pod {
        Pod { metadata: ObjectMeta::named(name), ..Default::default() }
    }

    #[test]
    fn same_port_same_protocol_conflicts() {
        let mut usage = HostPortUsage::new();
        usage.add(&pod("a"), &[HostPort::tcp(8080)]);
        assert!(usage.validate(&[HostPort::tcp(8080)]).is_err());
        assert!(usage.validate(&[HostPort::tcp(8081)]).is_ok());
    }

    #[test]
    fn different_protocols_coexist() {
        let mut usage = HostPortUsage::new();
        usage.add(&pod("a"), &[HostPort::tcp(53)]);
        let udp = HostPort { ip: None, port: 53, protocol: Protocol::Udp };
        assert!(usage.validate(&[udp]).is_ok());
    }

    #[test]
    fn distinct_ips_coexist_but_wildcard_conflicts() {
        let mut usage = HostPortUsage::new();
        let on_ip = HostPort { ip: Some("10.0.0.1".parse().unwrap()), ..HostPort::tcp(80) };
        usage.add(&pod("a"), &[on_ip]);

        let other_ip = HostPort { ip: Some("10.0.0.2".parse().unwrap()), ..HostPort::tcp(80) };
        assert!(usage.validate(&[other_ip]).is_ok());

        let wildcard = HostPort { ip: Some("0.0.0.0".parse().unwrap()), ..HostPort::tcp(80) };
        assert!(usage.validate(&[wildcard]).is_err());
    }

    #[test]
    fn removing_a_pod_frees_its_ports() {
        let mut usage = HostPortUsage::new();
        let owner = pod("a");
        usage.add(&owner, &[HostPort::tcp(8080)]);
        usage.remove_pod(owner.uid());
        assert!(usage.validate(&[HostPort::tcp(8080)]).is_ok());
    }
}
