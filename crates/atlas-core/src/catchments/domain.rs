//! Cross-scenario attribute domains.
//!
//! One range per attribute over every loaded scenario, so a single color
//! scale is valid for any scenario or viewport. Computed once at load.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::scenario::ScenarioTable;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DomainRange {
    pub min: f64,
    pub max: f64,
}

impl DomainRange {
    fn include(self, v: f64) -> Self {
        Self { min: self.min.min(v), max: self.max.max(v) }
    }
}

/// Fold every non-null value of every table into per-attribute ranges.
/// Attributes without a single value get no entry.
pub fn compute_domain_ranges<'a>(
    tables: impl IntoIterator<Item = &'a ScenarioTable>,
) -> BTreeMap<String, DomainRange> {
    let mut ranges: BTreeMap<String, DomainRange> = BTreeMap::new();
    for table in tables {
        for attribute in table.attributes() {
            let Some(values) = table.values(attribute) else { continue };
            for (_, v) in values {
                ranges
                    .entry(attribute.to_string())
                    .and_modify(|r| *r = r.include(v))
                    .or_insert(DomainRange { min: v, max: v });
            }
        }
    }
    ranges
}
