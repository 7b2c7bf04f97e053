//! Topology tracking: spread, pod affinity, and pod anti-affinity.
//!
//! Each topology constraint observed on a pod becomes a [`TopologyGroup`]
//! holding per-domain pod counts. Groups with identical shape are unified by
//! hash and reference-counted by owner UID, so N pods carrying the same self
//! anti-affinity share one group with N owners. Anti-affinity groups are
//! additionally kept in an inverse index so that pods *targeted* by someone
//! else's anti-affinity know which domains are closed to them.

use super::error::{Result, SchedulingError};
use super::requirements::{Requirement, Requirements};
use crate::api::{
    labels, taints, LabelSelector, NodeInclusionPolicy, Pod, PodAffinityTerm, Taint, Toleration,
    TopologySpreadConstraint, Uid,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyType {
    Spread,
    PodAffinity,
    PodAntiAffinity,
}

impl fmt::Display for TopologyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyType::Spread => write!(f, "topology spread"),
            TopologyType::PodAffinity => write!(f, "pod affinity"),
            TopologyType::PodAntiAffinity => write!(f, "pod anti-affinity"),
        }
    }
}

/// Restricts which nodes count toward a topology group.
///
/// Built from the owning pod's node selector and required node affinity
/// terms (ORed). An empty requirement list matches every node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopologyNodeFilter {
    requirement_sets: Vec<Requirements>,
    taints_policy: NodeInclusionPolicy,
    tolerations: Vec<Toleration>,
}

impl TopologyNodeFilter {
    fn for_pod(
        pod: &Pod,
        taints_policy: NodeInclusionPolicy,
        affinity_policy: NodeInclusionPolicy,
    ) -> Result<Self> {
        let mut requirement_sets = Vec::new();
        if affinity_policy == NodeInclusionPolicy::Honor {
            let base = Requirements::from_labels(&pod.spec.node_selector);
            let terms = pod
                .spec
                .affinity
                .as_ref()
                .and_then(|a| a.node_affinity.as_ref())
                .and_then(|a| a.required.as_ref())
                .map(|r| r.terms.as_slice())
                .unwrap_or(&[]);
            if terms.is_empty() {
                if !base.is_empty() {
                    requirement_sets.push(base);
                }
            } else {
                for term in terms {
                    let mut reqs = base.clone();
                    for expr in &term.match_expressions {
                        reqs.add(Requirement::from_selector(expr)?);
                    }
                    requirement_sets.push(reqs);
                }
            }
        }
        Ok(TopologyNodeFilter {
            requirement_sets,
            taints_policy,
            tolerations: pod.spec.tolerations.clone(),
        })
    }

    /// Whether a node described by requirements passes this filter
    fn matches(&self, node_taints: &[Taint], node_reqs: &Requirements, allow_undefined: bool) -> bool {
        if self.taints_policy == NodeInclusionPolicy::Honor
            && taints::first_untolerated(node_taints, &self.tolerations).is_some()
        {
            return false;
        }
        if self.requirement_sets.is_empty() {
            return true;
        }
        self.requirement_sets.iter().any(|reqs| node_reqs.compatible(reqs, allow_undefined).is_ok())
    }

    /// Whether a concrete node passes this filter
    fn matches_node(&self, node_labels: &BTreeMap<String, String>, node_taints: &[Taint]) -> bool {
        self.matches(node_taints, &Requirements::from_labels(node_labels), false)
    }
}

/// Per-domain counts for one topology constraint
#[derive(Debug, Clone)]
pub struct TopologyGroup {
    pub topology_type: TopologyType,
    pub key: String,
    max_skew: i32,
    min_domains: Option<u32>,
    namespaces: BTreeSet<String>,
    selector: LabelSelector,
    node_filter: Option<TopologyNodeFilter>,
    owners: BTreeSet<Uid>,
    domains: BTreeMap<String, u32>,
    empty_domains: BTreeSet<String>,
}

impl TopologyGroup {
    #[allow(clippy::too_many_arguments)]
    fn new(
        topology_type: TopologyType,
        key: &str,
        namespaces: BTreeSet<String>,
        selector: LabelSelector,
        max_skew: i32,
        min_domains: Option<u32>,
        node_filter: Option<TopologyNodeFilter>,
        universe: &BTreeSet<String>,
    ) -> Self {
        TopologyGroup {
            topology_type,
            key: key.to_string(),
            max_skew,
            min_domains,
            namespaces,
            selector,
            node_filter,
            owners: BTreeSet::new(),
            domains: universe.iter().map(|d| (d.clone(), 0)).collect(),
            empty_domains: universe.clone(),
        }
    }

    /// Identity hash used to unify structurally identical groups
    fn identity(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.topology_type.hash(&mut hasher);
        self.key.hash(&mut hasher);
        self.max_skew.hash(&mut hasher);
        self.min_domains.hash(&mut hasher);
        self.namespaces.hash(&mut hasher);
        self.selector.hash(&mut hasher);
        self.node_filter.hash(&mut hasher);
        hasher.finish()
    }

    /// Whether this group's selector picks out `pod`
    pub fn selects(&self, pod: &Pod) -> bool {
        self.namespaces.contains(&pod.metadata.namespace)
            && self.selector.matches(&pod.metadata.labels)
    }

    /// Whether placing `pod` on a node described by `node_reqs` changes this
    /// group's counts
    pub fn counts(
        &self,
        pod: &Pod,
        node_taints: &[Taint],
        node_reqs: &Requirements,
        allow_undefined: bool,
    ) -> bool {
        self.selects(pod)
            && self
                .node_filter
                .as_ref()
                .map(|f| f.matches(node_taints, node_reqs, allow_undefined))
                .unwrap_or(true)
    }

    pub fn is_owned_by(&self, uid: &Uid) -> bool {
        self.owners.contains(uid)
    }

    fn add_owner(&mut self, uid: &Uid) {
        self.owners.insert(uid.clone());
    }

    fn remove_owner(&mut self, uid: &Uid) {
        self.owners.remove(uid);
    }

    fn register(&mut self, domain: &str) {
        if !self.domains.contains_key(domain) {
            self.domains.insert(domain.to_string(), 0);
            self.empty_domains.insert(domain.to_string());
        }
    }

    fn record<'a>(&mut self, domains: impl Iterator<Item = &'a str>) {
        for domain in domains {
            *self.domains.entry(domain.to_string()).or_insert(0) += 1;
            self.empty_domains.remove(domain);
        }
    }

    /// The still-viable domains for this group, as a requirement on its key.
    /// An empty result means the group cannot be satisfied.
    pub fn next_domain(
        &self,
        pod: &Pod,
        pod_domains: &Requirement,
        node_domains: &Requirement,
    ) -> Requirement {
        match self.topology_type {
            TopologyType::Spread => self.next_domain_spread(pod, pod_domains, node_domains),
            TopologyType::PodAffinity => self.next_domain_affinity(pod, pod_domains, node_domains),
            TopologyType::PodAntiAffinity => {
                self.next_domain_anti_affinity(pod_domains, node_domains)
            }
        }
    }

    /// Among node-viable domains, pick the least-populated one whose
    /// post-placement count stays within `max_skew` of the global minimum.
    fn next_domain_spread(
        &self,
        pod: &Pod,
        pod_domains: &Requirement,
        node_domains: &Requirement,
    ) -> Requirement {
        let global_min = self.domain_min_count(pod_domains);
        let self_selecting = self.selects(pod);
        let mut best: Option<(&str, i64)> = None;
        for (domain, &count) in &self.domains {
            if !node_domains.has(domain) {
                continue;
            }
            let mut count = i64::from(count);
            if self_selecting {
                count += 1;
            }
            if count - global_min <= i64::from(self.max_skew)
                && best.map_or(true, |(_, c)| count < c)
            {
                best = Some((domain, count));
            }
        }
        match best {
            Some((domain, _)) => Requirement::new_in(&self.key, [domain]),
            None => Requirement::does_not_exist(&self.key),
        }
    }

    fn domain_min_count(&self, pod_domains: &Requirement) -> i64 {
        // a new node can always supply a fresh hostname
        if self.key == labels::HOSTNAME {
            return 0;
        }
        let mut min = i64::MAX;
        let mut supported = 0u32;
        for (domain, &count) in &self.domains {
            if pod_domains.has(domain) {
                supported += 1;
                min = min.min(i64::from(count));
            }
        }
        if self.min_domains.is_some_and(|required| supported < required) {
            min = 0;
        }
        if min == i64::MAX {
            0
        } else {
            min
        }
    }

    /// Prefer domains already populated by matching pods. A self-selecting
    /// pod may bootstrap an empty group by picking a viable domain; domains
    /// are iterated in sorted order so the choice is deterministic.
    fn next_domain_affinity(
        &self,
        pod: &Pod,
        pod_domains: &Requirement,
        node_domains: &Requirement,
    ) -> Requirement {
        let mut values: BTreeSet<&str> = self
            .domains
            .iter()
            .filter(|(domain, count)| **count > 0 && pod_domains.has(domain))
            .map(|(domain, _)| domain.as_str())
            .collect();
        if values.is_empty() && self.selects(pod) {
            if let Some(domain) = self
                .domains
                .keys()
                .find(|d| pod_domains.has(d) && node_domains.has(d))
                .or_else(|| self.domains.keys().find(|d| pod_domains.has(d)))
            {
                values.insert(domain);
            }
        }
        Requirement::new_in(&self.key, values)
    }

    /// Only domains with zero matching pods remain viable
    fn next_domain_anti_affinity(
        &self,
        pod_domains: &Requirement,
        node_domains: &Requirement,
    ) -> Requirement {
        let values: BTreeSet<&str> = self
            .empty_domains
            .iter()
            .filter(|d| {
                self.domains.get(*d).copied().unwrap_or(0) == 0
                    && pod_domains.has(d)
                    && node_domains.has(d)
            })
            .map(|d| d.as_str())
            .collect();
        Requirement::new_in(&self.key, values)
    }

}

impl fmt::Display for TopologyGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.topology_type, self.key)
    }
}

/// A scheduled pod paired with its node's labels and taints, used to seed
/// topology domain counts
#[derive(Debug, Clone)]
pub struct ScheduledPod {
    pub pod: Pod,
    pub node_labels: BTreeMap<String, String>,
    pub node_taints: Vec<Taint>,
}

/// The topology state for one scheduling pass.
///
/// Exclusively owned by its scheduler; never shared across passes.
pub struct Topology {
    groups: Vec<TopologyGroup>,
    by_hash: HashMap<u64, usize>,
    inverse: Vec<TopologyGroup>,
    inverse_by_hash: HashMap<u64, usize>,
    /// Pods the current pass intends to (re)schedule; excluded from counts
    excluded: HashSet<Uid>,
    /// Known domains per topology key
    universe: HashMap<String, BTreeSet<String>>,
    /// Scheduled cluster pods for seeding new groups
    index: Vec<ScheduledPod>,
}

impl Topology {
    pub fn new(
        index: Vec<ScheduledPod>,
        universe: HashMap<String, BTreeSet<String>>,
        excluded: HashSet<Uid>,
    ) -> Result<Self> {
        let mut topology = Topology {
            groups: Vec::new(),
            by_hash: HashMap::new(),
            inverse: Vec::new(),
            inverse_by_hash: HashMap::new(),
            excluded,
            universe,
            index,
        };
        topology.seed_inverse_anti_affinities()?;
        Ok(topology)
    }

    /// Register live pods carrying required anti-affinity so that newly
    /// scheduled pods know which domains those terms exclude
    fn seed_inverse_anti_affinities(&mut self) -> Result<()> {
        let entries: Vec<ScheduledPod> = self
            .index
            .iter()
            .filter(|e| {
                e.pod.has_required_pod_anti_affinity()
                    && !e.pod.ignored_for_topology()
                    && !self.excluded.contains(e.pod.uid())
            })
            .cloned()
            .collect();
        for entry in entries {
            let terms: Vec<PodAffinityTerm> = entry
                .pod
                .spec
                .affinity
                .as_ref()
                .and_then(|a| a.pod_anti_affinity.as_ref())
                .map(|a| a.required.clone())
                .unwrap_or_default();
            for term in &terms {
                let domain = entry.node_labels.get(&term.topology_key).cloned();
                let idx = self.ensure_inverse_group(&entry.pod, term);
                if let Some(domain) = domain {
                    self.inverse[idx].record(std::iter::once(domain.as_str()));
                }
                self.inverse[idx].add_owner(entry.pod.uid());
            }
        }
        Ok(())
    }

    fn ensure_inverse_group(&mut self, pod: &Pod, term: &PodAffinityTerm) -> usize {
        let group = TopologyGroup::new(
            TopologyType::PodAntiAffinity,
            &term.topology_key,
            term_namespaces(pod, term),
            term.label_selector.clone(),
            i32::MAX,
            None,
            None,
            self.universe_for(&term.topology_key),
        );
        let hash = group.identity();
        match self.inverse_by_hash.get(&hash) {
            Some(idx) => *idx,
            None => {
                self.inverse.push(group);
                let idx = self.inverse.len() - 1;
                self.inverse_by_hash.insert(hash, idx);
                idx
            }
        }
    }

    fn universe_for(&self, key: &str) -> &BTreeSet<String> {
        static EMPTY: std::sync::OnceLock<BTreeSet<String>> = std::sync::OnceLock::new();
        self.universe.get(key).unwrap_or_else(|| EMPTY.get_or_init(BTreeSet::new))
    }

    /// Make a domain known to every group tracking `key`. New nodes create
    /// fresh hostname domains this way.
    pub fn register(&mut self, key: &str, domain: &str) {
        self.universe.entry(key.to_string()).or_default().insert(domain.to_string());
        for group in self.groups.iter_mut().chain(self.inverse.iter_mut()) {
            if group.key == key {
                group.register(domain);
            }
        }
    }

    /// Rebuild the groups owned by `pod`: drop its ownership everywhere,
    /// derive groups from its current constraints, and seed counts for any
    /// group shape not seen before.
    pub fn update(&mut self, pod: &Pod) -> Result<()> {
        for group in self.groups.iter_mut() {
            group.remove_owner(pod.uid());
        }
        if pod.has_required_pod_anti_affinity() {
            let terms: Vec<PodAffinityTerm> = pod
                .spec
                .affinity
                .as_ref()
                .and_then(|a| a.pod_anti_affinity.as_ref())
                .map(|a| a.required.clone())
                .unwrap_or_default();
            for term in &terms {
                let idx = self.ensure_inverse_group(pod, term);
                self.inverse[idx].add_owner(pod.uid());
            }
        }
        let mut new_groups = self.groups_for_spread(pod)?;
        new_groups.extend(self.groups_for_affinities(pod)?);
        for group in new_groups {
            let hash = group.identity();
            let idx = match self.by_hash.get(&hash) {
                Some(idx) => *idx,
                None => {
                    let mut group = group;
                    self.count_domains(&mut group);
                    self.groups.push(group);
                    let idx = self.groups.len() - 1;
                    self.by_hash.insert(hash, idx);
                    idx
                }
            };
            self.groups[idx].add_owner(pod.uid());
        }
        Ok(())
    }

    fn groups_for_spread(&self, pod: &Pod) -> Result<Vec<TopologyGroup>> {
        let mut out = Vec::new();
        for constraint in &pod.spec.topology_spread_constraints {
            out.push(self.group_for_spread_constraint(pod, constraint)?);
        }
        Ok(out)
    }

    fn group_for_spread_constraint(
        &self,
        pod: &Pod,
        constraint: &TopologySpreadConstraint,
    ) -> Result<TopologyGroup> {
        let taints_policy = constraint.node_taints_policy.unwrap_or(NodeInclusionPolicy::Ignore);
        let affinity_policy = constraint.node_affinity_policy.unwrap_or(NodeInclusionPolicy::Honor);
        let filter = TopologyNodeFilter::for_pod(pod, taints_policy, affinity_policy)?;
        Ok(TopologyGroup::new(
            TopologyType::Spread,
            &constraint.topology_key,
            [pod.metadata.namespace.clone()].into(),
            constraint.label_selector.clone(),
            constraint.max_skew,
            constraint.min_domains,
            Some(filter),
            self.universe_for(&constraint.topology_key),
        ))
    }

    fn groups_for_affinities(&self, pod: &Pod) -> Result<Vec<TopologyGroup>> {
        let mut out = Vec::new();
        let Some(affinity) = pod.spec.affinity.as_ref() else { return Ok(out) };
        if let Some(pod_affinity) = &affinity.pod_affinity {
            for term in &pod_affinity.required {
                out.push(self.group_for_term(pod, term, TopologyType::PodAffinity));
            }
            for weighted in &pod_affinity.preferred {
                out.push(self.group_for_term(pod, &weighted.term, TopologyType::PodAffinity));
            }
        }
        if let Some(anti) = &affinity.pod_anti_affinity {
            for term in &anti.required {
                out.push(self.group_for_term(pod, term, TopologyType::PodAntiAffinity));
            }
            for weighted in &anti.preferred {
                out.push(self.group_for_term(pod, &weighted.term, TopologyType::PodAntiAffinity));
            }
        }
        Ok(out)
    }

    fn group_for_term(
        &self,
        pod: &Pod,
        term: &PodAffinityTerm,
        topology_type: TopologyType,
    ) -> TopologyGroup {
        TopologyGroup::new(
            topology_type,
            &term.topology_key,
            term_namespaces(pod, term),
            term.label_selector.clone(),
            i32::MAX,
            None,
            None,
            self.universe_for(&term.topology_key),
        )
    }

    /// Seed a new group's counts from the scheduled cluster pods it selects
    fn count_domains(&self, group: &mut TopologyGroup) {
        for entry in &self.index {
            if entry.pod.ignored_for_topology() || self.excluded.contains(entry.pod.uid()) {
                continue;
            }
            if !group.selects(&entry.pod) {
                continue;
            }
            let Some(domain) = entry.node_labels.get(&group.key) else { continue };
            if let Some(filter) = &group.node_filter {
                if !filter.matches_node(&entry.node_labels, &entry.node_taints) {
                    continue;
                }
            }
            group.record(std::iter::once(domain.as_str()));
        }
    }

    /// Record a committed placement in every group it affects.
    ///
    /// Spread and affinity counts only move when the target domain is
    /// uniquely determined; anti-affinity conservatively blocks every domain
    /// the placement could still be in.
    pub fn record(
        &mut self,
        pod: &Pod,
        node_taints: &[Taint],
        reqs: &Requirements,
        allow_undefined: bool,
    ) {
        for group in self.groups.iter_mut() {
            if !group.counts(pod, node_taints, reqs, allow_undefined) {
                continue;
            }
            let Some(domains) = reqs.get(&group.key) else { continue };
            if group.topology_type == TopologyType::PodAntiAffinity {
                let values: Vec<String> = domains.values().map(String::from).collect();
                group.record(values.iter().map(|s| s.as_str()));
            } else if domains.cardinality() == Some(1) {
                let values: Vec<String> = domains.values().map(String::from).collect();
                group.record(values.iter().map(|s| s.as_str()));
            }
        }
        for group in self.inverse.iter_mut() {
            if group.is_owned_by(pod.uid()) {
                if let Some(domains) = reqs.get(&group.key) {
                    let values: Vec<String> = domains.values().map(String::from).collect();
                    group.record(values.iter().map(|s| s.as_str()));
                }
            }
        }
    }

    /// Tighten `node_reqs` by the viable domains of every group that
    /// constrains `pod`'s placement. Errors name the group whose key
    /// collapsed to no viable domain.
    pub fn add_requirements(
        &self,
        pod: &Pod,
        node_taints: &[Taint],
        pod_reqs: &Requirements,
        node_reqs: &Requirements,
        allow_undefined: bool,
    ) -> Result<Requirements> {
        let mut requirements = node_reqs.clone();
        let matching = self.matching_groups(pod, node_taints, &requirements, allow_undefined);
        for group in matching {
            let pod_domains = pod_reqs
                .get(&group.key)
                .cloned()
                .unwrap_or_else(|| Requirement::exists(&group.key));
            let node_domains = requirements
                .get(&group.key)
                .cloned()
                .unwrap_or_else(|| Requirement::exists(&group.key));
            let domains = group.next_domain(pod, &pod_domains, &node_domains);
            if domains.cardinality() == Some(0) {
                return Err(SchedulingError::TopologyConflict {
                    group: group.to_string(),
                    node_domains: node_domains.to_string(),
                });
            }
            requirements.add(domains);
        }
        Ok(requirements)
    }

    /// Groups that either constrain `pod`'s scheduling (owned) or whose
    /// counts `pod` would change (inverse anti-affinity)
    fn matching_groups(
        &self,
        pod: &Pod,
        node_taints: &[Taint],
        node_reqs: &Requirements,
        allow_undefined: bool,
    ) -> Vec<&TopologyGroup> {
        let mut out: Vec<&TopologyGroup> =
            self.groups.iter().filter(|g| g.is_owned_by(pod.uid())).collect();
        out.extend(
            self.inverse.iter().filter(|g| g.counts(pod, node_taints, node_reqs, allow_undefined)),
        );
        out
    }

    #[cfg(test)]
    pub fn groups(&self) -> &[TopologyGroup] {
        &self.groups
    }
}

fn term_namespaces(pod: &Pod, term: &PodAffinityTerm) -> BTreeSet<String> {
    if term.namespaces.is_empty() {
        [pod.metadata.namespace.clone()].into()
    } else {
        term.namespaces.iter().cloned().collect()
    }
}
