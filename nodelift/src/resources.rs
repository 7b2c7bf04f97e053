//! Resource quantities and arithmetic over resource lists

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// Well-known resource names
pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";
pub const EPHEMERAL_STORAGE: &str = "ephemeral-storage";
pub const PODS: &str = "pods";

/// A scalar resource quantity.
///
/// Quantities are stored in milli-units so that fractional CPU requests
/// ("1500m") and whole-unit requests ("2", "4Gi") share one representation
/// without loss. Arithmetic saturates rather than wrapping.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Quantity(i64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    /// Quantity from whole units (cores, bytes, pod slots)
    pub fn from_units(units: i64) -> Self {
        Quantity(units.saturating_mul(1000))
    }

    /// Quantity from milli-units
    pub fn from_millis(millis: i64) -> Self {
        Quantity(millis)
    }

    /// Quantity from gibibytes
    pub fn from_gi(gi: i64) -> Self {
        Quantity::from_units(gi.saturating_mul(1024 * 1024 * 1024))
    }

    /// Quantity from mebibytes
    pub fn from_mi(mi: i64) -> Self {
        Quantity::from_units(mi.saturating_mul(1024 * 1024))
    }

    pub fn millis(&self) -> i64 {
        self.0
    }

    /// Whole units, rounding up any milli remainder
    pub fn units(&self) -> i64 {
        if self.0 >= 0 {
            (self.0 + 999) / 1000
        } else {
            self.0 / 1000
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_sub(other.0))
    }

    pub fn max(self, other: Quantity) -> Quantity {
        Quantity(self.0.max(other.0))
    }
}

impl Add for Quantity {
    type Output = Quantity;
    fn add(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(other.0))
    }
}

impl Sub for Quantity {
    type Output = Quantity;
    fn sub(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_sub(other.0))
    }
}

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Quantity {
        iter.fold(Quantity::ZERO, Add::add)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

/// Parse quantity strings in the forms "2", "1500m", "2Gi", "512Mi", "4Ki"
impl FromStr for Quantity {
    type Err = ParseQuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseQuantityError(s.to_string()));
        }
        let parse =
            |digits: &str| -> Result<i64, ParseQuantityError> {
                digits.parse::<i64>().map_err(|_| ParseQuantityError(s.to_string()))
            };
        if let Some(digits) = s.strip_suffix("m") {
            return Ok(Quantity::from_millis(parse(digits)?));
        }
        if let Some(digits) = s.strip_suffix("Gi") {
            return Ok(Quantity::from_gi(parse(digits)?));
        }
        if let Some(digits) = s.strip_suffix("Mi") {
            return Ok(Quantity::from_mi(parse(digits)?));
        }
        if let Some(digits) = s.strip_suffix("Ki") {
            return Ok(Quantity::from_units(parse(digits)?.saturating_mul(1024)));
        }
        Ok(Quantity::from_units(parse(s)?))
    }
}

/// Quantity string could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unparseable quantity {0:?}")]
pub struct ParseQuantityError(String);

/// A named collection of resource quantities.
///
/// Keys are ordered so that iteration, display, and hashing are stable.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceList(BTreeMap<String, Quantity>);

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Quantity {
        self.0.get(name).copied().unwrap_or(Quantity::ZERO)
    }

    pub fn insert(&mut self, name: impl Into<String>, quantity: Quantity) {
        self.0.insert(name.into(), quantity);
    }

    pub fn cpu(&self) -> Quantity {
        self.get(CPU)
    }

    pub fn memory(&self) -> Quantity {
        self.get(MEMORY)
    }

    pub fn pods(&self) -> Quantity {
        self.get(PODS)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Quantity)> {
        self.0.iter()
    }

    /// Add every quantity in `other` into this list
    pub fn add(&mut self, other: &ResourceList) {
        for (name, quantity) in other.iter() {
            let entry = self.0.entry(name.clone()).or_insert(Quantity::ZERO);
            *entry = *entry + *quantity;
        }
    }

    /// Sum of two lists
    pub fn merged(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        out.add(other);
        out
    }

    /// Subtract `other`, flooring each quantity at zero
    pub fn subtract_floored(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        for (name, quantity) in other.iter() {
            let entry = out.0.entry(name.clone()).or_insert(Quantity::ZERO);
            *entry = entry.saturating_sub(*quantity).max(Quantity::ZERO);
        }
        out
    }

    /// Per-resource maximum of two lists
    pub fn merge_max(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        for (name, quantity) in other.iter() {
            let entry = out.0.entry(name.clone()).or_insert(Quantity::ZERO);
            *entry = (*entry).max(*quantity);
        }
        out
    }

    /// True when every requested quantity is available.
    ///
    /// Resources requested but entirely absent from `available` do not fit.
    pub fn fits(requests: &ResourceList, available: &ResourceList) -> bool {
        Self::insufficient(requests, available).is_empty()
    }

    /// Names of the requested resources that `available` cannot cover
    pub fn insufficient(requests: &ResourceList, available: &ResourceList) -> Vec<String> {
        requests
            .iter()
            .filter(|(name, requested)| available.get(name) < **requested)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Total requests across a set of pods, one pod slot each
    pub fn for_pods<'a>(pods: impl Iterator<Item = &'a crate::api::Pod>) -> ResourceList {
        let mut out = ResourceList::new();
        let mut count = 0i64;
        for pod in pods {
            out.add(&pod.spec.requests);
            count += 1;
        }
        if count > 0 {
            let pods = out.get(PODS) + Quantity::from_units(count);
            out.insert(PODS, pods);
        }
        out
    }
}

impl fmt::Display for ResourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, quantity) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {quantity}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromIterator<(String, Quantity)> for ResourceList {
    fn from_iter<T: IntoIterator<Item = (String, Quantity)>>(iter: T) -> Self {
        ResourceList(iter.into_iter().collect())
    }
}
