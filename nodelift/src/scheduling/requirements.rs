//! Typed requirement sets with intersection semantics.
//!
//! A [`Requirement`] constrains the values a single node label may take. A
//! [`Requirements`] maps keys to requirements; adding a requirement for an
//! existing key always intersects, so a requirement set only ever narrows.

use super::error::{Result, SchedulingError};
use super::instance_type::InstanceType;
use crate::api::{labels, NodeSelectorRequirement, Operator, Pod};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Constraint on the values of one label key.
///
/// Internally a requirement is either a finite allowed set or the complement
/// of a finite excluded set, with optional integer bounds. All six wire
/// operators reduce to this representation:
///
/// - `In [a, b]` - allowed set {a, b}
/// - `NotIn [a]` - complement of {a}
/// - `Exists` - complement of {}
/// - `DoesNotExist` - allowed set {}
/// - `Gt 5` / `Lt 5` - complement of {} with a bound
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Requirement {
    key: String,
    complement: bool,
    values: BTreeSet<String>,
    greater_than: Option<i64>,
    less_than: Option<i64>,
    min_values: Option<usize>,
}

impl Requirement {
    pub fn new_in<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Requirement {
            key: labels::canonical(&key.into()).to_string(),
            complement: false,
            values: values.into_iter().map(Into::into).collect(),
            greater_than: None,
            less_than: None,
            min_values: None,
        }
    }

    pub fn new_not_in<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Requirement { complement: true, ..Requirement::new_in(key, values) }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Requirement { complement: true, ..Requirement::new_in(key, Vec::<String>::new()) }
    }

    pub fn does_not_exist(key: impl Into<String>) -> Self {
        Requirement::new_in(key, Vec::<String>::new())
    }

    pub fn greater_than(key: impl Into<String>, bound: i64) -> Self {
        Requirement { greater_than: Some(bound), ..Requirement::exists(key) }
    }

    pub fn less_than(key: impl Into<String>, bound: i64) -> Self {
        Requirement { less_than: Some(bound), ..Requirement::exists(key) }
    }

    pub fn with_min_values(mut self, min_values: usize) -> Self {
        self.min_values = Some(min_values);
        self
    }

    /// Build from a wire requirement, canonicalizing deprecated label keys
    pub fn from_selector(req: &NodeSelectorRequirement) -> Result<Self> {
        let mut out = match req.operator {
            Operator::In => Requirement::new_in(&req.key, req.values.clone()),
            Operator::NotIn => Requirement::new_not_in(&req.key, req.values.clone()),
            Operator::Exists => Requirement::exists(&req.key),
            Operator::DoesNotExist => Requirement::does_not_exist(&req.key),
            Operator::Gt => Requirement::greater_than(&req.key, Self::parse_bound(req)?),
            Operator::Lt => Requirement::less_than(&req.key, Self::parse_bound(req)?),
        };
        out.min_values = req.min_values;
        Ok(out)
    }

    fn parse_bound(req: &NodeSelectorRequirement) -> Result<i64> {
        let invalid = || SchedulingError::InvalidBound {
            key: req.key.clone(),
            operator: req.operator.to_string(),
        };
        if req.values.len() != 1 {
            return Err(invalid());
        }
        let bound: i64 = req.values[0].parse().map_err(|_| invalid())?;
        if bound < 0 {
            return Err(invalid());
        }
        Ok(bound)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn min_values(&self) -> Option<usize> {
        self.min_values
    }

    /// The wire operator this requirement reduces to
    pub fn operator(&self) -> Operator {
        if self.complement {
            if !self.values.is_empty() {
                Operator::NotIn
            } else if self.greater_than.is_some() {
                Operator::Gt
            } else if self.less_than.is_some() {
                Operator::Lt
            } else {
                Operator::Exists
            }
        } else if self.values.is_empty() {
            Operator::DoesNotExist
        } else {
            Operator::In
        }
    }

    /// Number of allowed values; `None` when the allowed set is unbounded
    pub fn cardinality(&self) -> Option<usize> {
        if self.complement {
            None
        } else {
            Some(self.values.len())
        }
    }

    /// Sorted allowed values for finite requirements
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|s| s.as_str())
    }

    /// Smallest allowed value for finite requirements
    pub fn any(&self) -> Option<&str> {
        if self.complement {
            None
        } else {
            self.values.iter().next().map(|s| s.as_str())
        }
    }

    fn in_bounds(&self, value: &str) -> bool {
        if self.greater_than.is_none() && self.less_than.is_none() {
            return true;
        }
        let Ok(v) = value.parse::<i64>() else { return false };
        self.greater_than.map_or(true, |g| v > g) && self.less_than.map_or(true, |l| v < l)
    }

    /// True when the requirement admits `value`
    pub fn has(&self, value: &str) -> bool {
        if !self.in_bounds(value) {
            return false;
        }
        if self.complement {
            !self.values.contains(value)
        } else {
            self.values.contains(value)
        }
    }

    /// Intersection of two requirements for the same key. Bounds keep the
    /// tighter side; a minimum-values demand keeps the larger side.
    pub fn intersect(&self, other: &Requirement) -> Requirement {
        let greater_than = match (self.greater_than, other.greater_than) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let less_than = match (self.less_than, other.less_than) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let (complement, values) = match (self.complement, other.complement) {
            (true, true) => (true, self.values.union(&other.values).cloned().collect()),
            (true, false) => (false, other.values.difference(&self.values).cloned().collect()),
            (false, true) => (false, self.values.difference(&other.values).cloned().collect()),
            (false, false) => {
                (false, self.values.intersection(&other.values).cloned().collect())
            }
        };
        let mut out = Requirement {
            key: self.key.clone(),
            complement,
            values,
            greater_than,
            less_than,
            min_values: match (self.min_values, other.min_values) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        };
        if !out.complement && (out.greater_than.is_some() || out.less_than.is_some()) {
            let (gt, lt) = (out.greater_than, out.less_than);
            out.values.retain(|v| {
                v.parse::<i64>()
                    .map(|n| gt.map_or(true, |g| n > g) && lt.map_or(true, |l| n < l))
                    .unwrap_or(false)
            });
        }
        out
    }

    /// Serialize back to wire requirements. A requirement carrying both
    /// bounds emits one entry per bound, since the wire form holds only one.
    pub fn to_selector_requirements(&self) -> Vec<NodeSelectorRequirement> {
        let entry = |operator, values: Vec<String>| NodeSelectorRequirement {
            key: self.key.clone(),
            operator,
            values,
            min_values: self.min_values,
        };
        match self.operator() {
            Operator::In => vec![entry(Operator::In, self.values().map(String::from).collect())],
            Operator::NotIn => {
                vec![entry(Operator::NotIn, self.values().map(String::from).collect())]
            }
            Operator::DoesNotExist => vec![entry(Operator::DoesNotExist, Vec::new())],
            Operator::Exists => vec![entry(Operator::Exists, Vec::new())],
            Operator::Gt | Operator::Lt => {
                let mut out = Vec::new();
                if let Some(bound) = self.greater_than {
                    out.push(entry(Operator::Gt, vec![bound.to_string()]));
                }
                if let Some(bound) = self.less_than {
                    out.push(entry(Operator::Lt, vec![bound.to_string()]));
                }
                out
            }
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator() {
            Operator::In => {
                write!(f, "{} In [{}]", self.key, self.values().collect::<Vec<_>>().join(", "))
            }
            Operator::NotIn => {
                write!(f, "{} NotIn [{}]", self.key, self.values().collect::<Vec<_>>().join(", "))
            }
            Operator::Exists => write!(f, "{} Exists", self.key),
            Operator::DoesNotExist => write!(f, "{} DoesNotExist", self.key),
            Operator::Gt => write!(f, "{} Gt {}", self.key, self.greater_than.unwrap_or_default()),
            Operator::Lt => write!(f, "{} Lt {}", self.key, self.less_than.unwrap_or_default()),
        }
    }
}

/// A set of requirements, one per label key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Requirements(BTreeMap<String, Requirement>);

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    /// One `In [value]` requirement per label
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        let mut out = Requirements::new();
        for (key, value) in labels {
            out.add(Requirement::new_in(key.as_str(), [value.as_str()]));
        }
        out
    }

    pub fn try_from_selector(reqs: &[NodeSelectorRequirement]) -> Result<Self> {
        let mut out = Requirements::new();
        for req in reqs {
            out.add(Requirement::from_selector(req)?);
        }
        Ok(out)
    }

    /// Node selector plus the first required node-affinity term. Terms are
    /// ORed by the platform; the scheduler holds the first and relies on
    /// preference relaxation to move to the next when it fails.
    pub fn for_pod_strict(pod: &Pod) -> Result<Self> {
        let mut out = Requirements::from_labels(&pod.spec.node_selector);
        if let Some(required) = pod
            .spec
            .affinity
            .as_ref()
            .and_then(|a| a.node_affinity.as_ref())
            .and_then(|a| a.required.as_ref())
        {
            if let Some(term) = required.terms.first() {
                for req in &term.match_expressions {
                    out.add(Requirement::from_selector(req)?);
                }
            }
        }
        Ok(out)
    }

    /// Strict requirements plus the heaviest preferred node-affinity term
    pub fn for_pod(pod: &Pod) -> Result<Self> {
        let mut out = Requirements::from_labels(&pod.spec.node_selector);
        if let Some(affinity) = pod.spec.affinity.as_ref().and_then(|a| a.node_affinity.as_ref()) {
            if let Some(heaviest) = affinity.preferred.iter().max_by_key(|t| t.weight) {
                for req in &heaviest.preference.match_expressions {
                    out.add(Requirement::from_selector(req)?);
                }
            }
        }
        let strict = Requirements::for_pod_strict(pod)?;
        out.add_all(strict);
        Ok(out)
    }

    pub fn get(&self, key: &str) -> Option<&Requirement> {
        self.0.get(labels::canonical(key))
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.0.contains_key(labels::canonical(key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Insert a requirement, intersecting with any existing one for the key
    pub fn add(&mut self, req: Requirement) {
        match self.0.get_mut(req.key()) {
            Some(existing) => *existing = existing.intersect(&req),
            None => {
                self.0.insert(req.key().to_string(), req);
            }
        }
    }

    pub fn add_all(&mut self, reqs: impl IntoIterator<Item = Requirement>) {
        for req in reqs {
            self.add(req);
        }
    }

    /// Pure intersection across the union of keys
    pub fn intersection(&self, other: &Requirements) -> Requirements {
        let mut out = self.clone();
        out.add_all(other.clone());
        out
    }

    /// Check that every shared key retains at least one value.
    ///
    /// An empty intersection is tolerated only when both sides merely exclude
    /// values, since absence of the label satisfies both.
    pub fn intersects(&self, other: &Requirements) -> Result<()> {
        for (key, incoming) in &other.0 {
            let Some(existing) = self.0.get(key) else { continue };
            let merged = existing.intersect(incoming);
            if merged.cardinality() == Some(0) {
                let both_exclude = |r: &Requirement| {
                    matches!(r.operator(), Operator::NotIn | Operator::DoesNotExist)
                };
                if both_exclude(existing) && both_exclude(incoming) {
                    continue;
                }
                return Err(SchedulingError::Incompatible {
                    key: key.clone(),
                    incoming: incoming.to_string(),
                    existing: existing.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Check that `other` can be met on top of this set.
    ///
    /// Keys `other` demands that this side does not define are errors, except
    /// well-known labels when `allow_undefined` is set: the side that creates
    /// the node is free to pick any value for those.
    pub fn compatible(&self, other: &Requirements, allow_undefined: bool) -> Result<()> {
        for (key, incoming) in &other.0 {
            if self.0.contains_key(key) {
                continue;
            }
            let requires_existence = matches!(
                incoming.operator(),
                Operator::In | Operator::Exists | Operator::Gt | Operator::Lt
            );
            if requires_existence && !(allow_undefined && labels::is_well_known(key)) {
                return Err(SchedulingError::UndefinedLabel { key: key.clone() });
            }
        }
        self.intersects(other)
    }

    pub fn has_min_values(&self) -> bool {
        self.0.values().any(|r| r.min_values.is_some())
    }

    /// Smallest prefix of `instance_types` (in the given order) that covers
    /// every minimum-values constraint, as a count. Zero when there are none.
    pub fn satisfies_min_values(&self, instance_types: &[Arc<InstanceType>]) -> Result<usize> {
        let constrained: Vec<&Requirement> =
            self.0.values().filter(|r| r.min_values.is_some()).collect();
        if constrained.is_empty() {
            return Ok(0);
        }
        let mut seen: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (i, it) in instance_types.iter().enumerate() {
            for req in &constrained {
                if let Some(offered) = it.requirements.get(req.key()) {
                    for value in offered.values() {
                        if req.has(value) {
                            seen.entry(req.key()).or_default().insert(value);
                        }
                    }
                }
            }
            let satisfied = constrained.iter().all(|req| {
                seen.get(req.key()).map(|s| s.len()).unwrap_or(0)
                    >= req.min_values.unwrap_or(0)
            });
            if satisfied {
                return Ok(i + 1);
            }
        }
        Err(SchedulingError::MinValuesNotMet {
            keys: constrained
                .iter()
                .filter(|req| {
                    seen.get(req.key()).map(|s| s.len()).unwrap_or(0)
                        < req.min_values.unwrap_or(0)
                })
                .map(|req| req.key().to_string())
                .collect(),
        })
    }

    /// Serialize to the wire representation
    pub fn to_selector_requirements(&self) -> Vec<NodeSelectorRequirement> {
        self.0.values().flat_map(|r| r.to_selector_requirements()).collect()
    }

    /// Keys pinned to exactly one value, as a label map
    pub fn single_valued_labels(&self) -> BTreeMap<String, String> {
        self.0
            .values()
            .filter(|r| r.cardinality() == Some(1))
            .filter_map(|r| r.any().map(|v| (r.key().to_string(), v.to_string())))
            .collect()
    }

    /// Drop a key entirely
    pub fn remove(&mut self, key: &str) {
        self.0.remove(labels::canonical(key));
    }
}

impl IntoIterator for Requirements {
    type Item = Requirement;
    type IntoIter = std::collections::btree_map::IntoValues<String, Requirement>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_values()
    }
}

impl FromIterator<Requirement> for Requirements {
    fn from_iter<T: IntoIterator<Item = Requirement>>(iter: T) -> Self {
        let mut out = Requirements::new();
        out.add_all(iter);
        out
    }
}

impl fmt::Display for Requirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for req in self.0.values() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{req}")?;
            first = false;
        }
        Ok(())
    }
}
