//! Instance shapes, their offerings, and catalog operations

use super::error::{Result, SchedulingError};
use super::requirements::Requirements;
use crate::api::labels;
use crate::resources::ResourceList;
use std::sync::Arc;

/// One purchasable node shape
#[derive(Debug, Clone)]
pub struct InstanceType {
    pub name: String,
    /// Labels this shape offers: architecture, OS, zones, capacity types, family
    pub requirements: Requirements,
    pub capacity: ResourceList,
    /// Capacity minus system overhead; what pods can actually use
    pub allocatable: ResourceList,
    pub offerings: Offerings,
}

impl InstanceType {
    /// True when the shape's labels can satisfy `reqs`
    pub fn matches_requirements(&self, reqs: &Requirements) -> bool {
        self.requirements.intersects(reqs).is_ok()
    }

    /// True when the shape has room for `requests`
    pub fn fits(&self, requests: &ResourceList) -> bool {
        ResourceList::fits(requests, &self.allocatable)
    }

    /// True when some available offering is compatible with `reqs`
    pub fn has_offering(&self, reqs: &Requirements) -> bool {
        self.offerings.iter().any(|o| o.available && o.is_compatible(reqs))
    }

    /// Price of the cheapest available offering compatible with `reqs`
    pub fn cheapest_price(&self, reqs: &Requirements) -> Option<f64> {
        self.offerings
            .iter()
            .filter(|o| o.available && o.is_compatible(reqs))
            .map(|o| o.price)
            .min_by(f64::total_cmp)
    }

    /// Price of the most expensive available offering compatible with `reqs`.
    ///
    /// The launch decision is made by the provider, so this is the price a
    /// caller must assume when comparing against a budget.
    pub fn worst_launch_price(&self, reqs: &Requirements) -> Option<f64> {
        self.offerings
            .iter()
            .filter(|o| o.available && o.is_compatible(reqs))
            .map(|o| o.price)
            .max_by(f64::total_cmp)
    }

    /// True when spot is the only capacity type this shape can launch as
    /// under `reqs`
    pub fn only_spot(&self, reqs: &Requirements) -> bool {
        let compatible: Vec<&Offering> =
            self.offerings.iter().filter(|o| o.available && o.is_compatible(reqs)).collect();
        !compatible.is_empty()
            && compatible
                .iter()
                .all(|o| o.capacity_type().as_deref() == Some(labels::CAPACITY_TYPE_SPOT))
    }
}

/// A concrete (zone, capacity type, price, availability) tuple
#[derive(Debug, Clone)]
pub struct Offering {
    /// Single-valued requirements carrying at least zone and capacity type
    pub requirements: Requirements,
    pub price: f64,
    pub available: bool,
}

impl Offering {
    pub fn new(zone: &str, capacity_type: &str, price: f64) -> Self {
        let mut requirements = Requirements::new();
        requirements.add(super::requirements::Requirement::new_in(labels::ZONE, [zone]));
        requirements
            .add(super::requirements::Requirement::new_in(labels::CAPACITY_TYPE, [capacity_type]));
        Offering { requirements, price, available: true }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn zone(&self) -> Option<String> {
        self.requirements.get(labels::ZONE).and_then(|r| r.any()).map(String::from)
    }

    pub fn capacity_type(&self) -> Option<String> {
        self.requirements.get(labels::CAPACITY_TYPE).and_then(|r| r.any()).map(String::from)
    }

    pub fn is_compatible(&self, reqs: &Requirements) -> bool {
        reqs.intersects(&self.requirements).is_ok()
    }
}

/// The offerings of one instance type
#[derive(Debug, Clone, Default)]
pub struct Offerings(pub Vec<Offering>);

impl Offerings {
    pub fn iter(&self) -> impl Iterator<Item = &Offering> {
        self.0.iter()
    }

    pub fn cheapest(&self, reqs: &Requirements) -> Option<&Offering> {
        self.iter()
            .filter(|o| o.available && o.is_compatible(reqs))
            .min_by(|a, b| a.price.total_cmp(&b.price))
    }

    /// The offering the provider would pick for a node already pinned to a
    /// concrete zone and capacity type
    pub fn for_zone_and_capacity(&self, zone: &str, capacity_type: &str) -> Option<&Offering> {
        self.iter().find(|o| {
            o.zone().as_deref() == Some(zone) && o.capacity_type().as_deref() == Some(capacity_type)
        })
    }
}

/// An ordered list of candidate instance types
#[derive(Debug, Clone, Default)]
pub struct InstanceTypes(pub Vec<Arc<InstanceType>>);

impl InstanceTypes {
    pub fn new(types: Vec<Arc<InstanceType>>) -> Self {
        InstanceTypes(types)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<InstanceType>> {
        self.0.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|it| it.name.as_str()).collect()
    }

    /// Stable sort by cheapest compatible available offering price. Types
    /// with no such offering sort last.
    pub fn order_by_price(&self, reqs: &Requirements) -> InstanceTypes {
        let mut out = self.0.clone();
        out.sort_by(|a, b| {
            let pa = a.cheapest_price(reqs).unwrap_or(f64::MAX);
            let pb = b.cheapest_price(reqs).unwrap_or(f64::MAX);
            pa.total_cmp(&pb)
        });
        InstanceTypes(out)
    }

    /// Keep types with at least one available offering compatible with `reqs`
    pub fn compatible(&self, reqs: &Requirements) -> InstanceTypes {
        InstanceTypes(self.0.iter().filter(|it| it.has_offering(reqs)).cloned().collect())
    }

    /// Keep types whose worst-case available offering price is strictly below
    /// `max_price`, verifying any minimum-flexibility constraints still hold
    pub fn remove_by_price(&self, reqs: &Requirements, max_price: f64) -> Result<InstanceTypes> {
        let filtered = InstanceTypes(
            self.0
                .iter()
                .filter(|it| it.worst_launch_price(reqs).is_some_and(|p| p < max_price))
                .cloned()
                .collect(),
        );
        if reqs.has_min_values() {
            reqs.satisfies_min_values(&filtered.0)?;
        }
        Ok(filtered)
    }

    /// Shrink to the cheapest `cap` types while preserving minimum-values
    /// flexibility. Fails when the truncated list can no longer provide it.
    pub fn truncate(&self, reqs: &Requirements, cap: usize) -> Result<InstanceTypes> {
        let ordered = self.order_by_price(reqs);
        let truncated = InstanceTypes(ordered.0.into_iter().take(cap).collect());
        if reqs.has_min_values() {
            reqs.satisfies_min_values(&truncated.0)?;
        }
        Ok(truncated)
    }

    /// Price of the cheapest launch across the whole list
    pub fn cheapest_price(&self, reqs: &Requirements) -> Option<f64> {
        self.0.iter().filter_map(|it| it.cheapest_price(reqs)).min_by(f64::total_cmp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Quantity, CPU, MEMORY, PODS};
    use crate::scheduling::requirements::Requirement;

    fn shape(name: &str, cpu: i64, price: f64, zones: &[&str]) -> Arc<InstanceType> {
        let mut capacity = ResourceList::new();
        capacity.insert(CPU, Quantity::from_units(cpu));
        capacity.insert(MEMORY, Quantity::from_gi(cpu * 2));
        capacity.insert(PODS, Quantity::from_units(110));
        let mut requirements = Requirements::new();
        requirements.add(Requirement::new_in(labels::INSTANCE_TYPE, [name]));
        requirements.add(Requirement::new_in(labels::ZONE, zones.iter().copied()));
        requirements.add(Requirement::new_in(
            labels::CAPACITY_TYPE,
            [labels::CAPACITY_TYPE_ON_DEMAND],
        ));
        let offerings = Offerings(
            zones
                .iter()
                .map(|z| Offering::new(z, labels::CAPACITY_TYPE_ON_DEMAND, price))
                .collect(),
        );
        Arc::new(InstanceType {
            name: name.to_string(),
            requirements,
            capacity: capacity.clone(),
            allocatable: capacity,
            offerings,
        })
    }

    #[test]
    fn order_by_price_is_cheapest_first() {
        let catalog = InstanceTypes::new(vec![
            shape("large", 8, 4.0, &["a"]),
            shape("small", 2, 1.0, &["a"]),
            shape("medium", 4, 2.0, &["a"]),
        ]);
        let ordered = catalog.order_by_price(&Requirements::new());
        assert_eq!(ordered.names(), vec!["small", "medium", "large"]);
    }

    #[test]
    fn compatible_filters_on_offerings() {
        let catalog =
            InstanceTypes::new(vec![shape("a-only", 2, 1.0, &["a"]), shape("b-only", 2, 1.0, &["b"])]);
        let mut reqs = Requirements::new();
        reqs.add(Requirement::new_in(labels::ZONE, ["b"]));
        assert_eq!(catalog.compatible(&reqs).names(), vec!["b-only"]);
    }

    #[test]
    fn remove_by_price_uses_worst_case_offering() {
        let mut pricey = shape("wide", 2, 1.0, &["a"]);
        Arc::get_mut(&mut pricey).unwrap().offerings.0.push(Offering::new(
            "b",
            labels::CAPACITY_TYPE_ON_DEMAND,
            5.0,
        ));
        let catalog = InstanceTypes::new(vec![pricey, shape("narrow", 2, 1.0, &["a"])]);
        let filtered = catalog.remove_by_price(&Requirements::new(), 2.0).unwrap();
        // "wide" could launch at 5.0, so it must go
        assert_eq!(filtered.names(), vec!["narrow"]);
    }

    #[test]
    fn truncate_preserves_min_values_or_fails() {
        let catalog = InstanceTypes::new(vec![
            shape("s1", 2, 1.0, &["a"]),
            shape("s2", 2, 1.1, &["a"]),
            shape("s3", 2, 1.2, &["a"]),
        ]);
        let mut reqs = Requirements::new();
        reqs.add(
            Requirement::new_in(labels::INSTANCE_TYPE, ["s1", "s2", "s3"]).with_min_values(3),
        );
        assert!(catalog.truncate(&reqs, 3).is_ok());
        assert!(catalog.truncate(&reqs, 2).is_err());
    }

    #[test]
    fn unavailable_offerings_do_not_count() {
        let mut it = shape("spotty", 2, 1.0, &["a"]);
        Arc::get_mut(&mut it).unwrap().offerings.0[0].available = false;
        let catalog = InstanceTypes::new(vec![it]);
        assert!(catalog.compatible(&Requirements::new()).is_empty());
    }
}
