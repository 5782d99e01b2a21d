//! Per-scenario attribute tables, stored column-wise.
//!
//! Tables come from CSV exports keyed by `catchID`. Cells holding one of the
//! null markers, or a non-finite number, are null. A column holding any other
//! non-numeric text is not an attribute and is dropped at load.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AtlasError, Result};

const ID_COLUMNS: [&str; 2] = ["catchID", "HYBAS_ID"];
const NULL_MARKERS: [&str; 5] = ["", "NA", "na", "N/A", "n/a"];

/// Named temporal dataset sharing one attribute schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    Reference,
    Current,
    Future,
}

impl Scenario {
    pub const ALL: [Scenario; 3] = [Scenario::Reference, Scenario::Current, Scenario::Future];

    pub fn as_str(self) -> &'static str {
        match self {
            Scenario::Reference => "reference",
            Scenario::Current => "current",
            Scenario::Future => "future",
        }
    }

    /// File name of this scenario's table inside a data directory.
    pub fn file_name(self) -> String {
        format!("{}.csv", self.as_str())
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scenario {
    type Err = AtlasError;

    fn from_str(s: &str) -> Result<Self> {
        Scenario::ALL
            .into_iter()
            .find(|sc| sc.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AtlasError::not_found("scenario", s))
    }
}

/// One scenario's attribute values, one column per attribute.
#[derive(Debug, Clone)]
pub struct ScenarioTable {
    scenario: Scenario,
    ids: Vec<i64>,
    rows: HashMap<i64, usize>,
    columns: BTreeMap<String, Vec<Option<f64>>>,
}

impl ScenarioTable {
    pub fn load(scenario: Scenario, path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let table = Self::from_reader(scenario, file)?;
        debug!(
            scenario = %scenario,
            path = %path.display(),
            rows = table.len(),
            attributes = table.columns.len(),
            "Scenario table loaded"
        );
        Ok(table)
    }

    pub fn from_reader<R: Read>(scenario: Scenario, reader: R) -> Result<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = csv.headers()?.clone();
        let id_col = ID_COLUMNS
            .iter()
            .find_map(|name| headers.iter().position(|h| h == *name))
            .ok_or_else(|| {
                AtlasError::invalid(format!("{scenario} table has no catchID or HYBAS_ID column"))
            })?;

        let names: Vec<&str> = headers.iter().collect();
        let mut cells: Vec<Vec<Option<f64>>> = vec![Vec::new(); names.len()];
        let mut non_numeric = vec![false; names.len()];
        let mut ids = Vec::new();
        let mut rows = HashMap::new();
        let (mut bad_ids, mut duplicates) = (0usize, 0usize);

        for record in csv.records() {
            let record = record?;
            let Some(id) = record.get(id_col).and_then(parse_id) else {
                bad_ids += 1;
                continue;
            };
            if rows.contains_key(&id) {
                duplicates += 1;
                continue;
            }
            rows.insert(id, ids.len());
            ids.push(id);

            for (col, column) in cells.iter_mut().enumerate() {
                if col == id_col {
                    continue;
                }
                let raw = record.get(col).unwrap_or("");
                let value = match parse_cell(raw) {
                    Ok(v) => v,
                    Err(()) => {
                        non_numeric[col] = true;
                        None
                    }
                };
                column.push(value);
            }
        }

        if bad_ids > 0 {
            warn!(scenario = %scenario, rows = bad_ids, "Skipped rows without a usable catchment id");
        }
        if duplicates > 0 {
            warn!(scenario = %scenario, rows = duplicates, "Skipped duplicate catchment rows");
        }

        let mut columns = BTreeMap::new();
        for (col, values) in cells.into_iter().enumerate() {
            if col == id_col {
                continue;
            }
            if non_numeric[col] {
                warn!(scenario = %scenario, column = names[col], "Dropping non-numeric column");
                continue;
            }
            columns.insert(names[col].to_string(), values);
        }

        Ok(Self { scenario, ids, rows, columns })
    }

    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Catchment ids in file order.
    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.columns.contains_key(attribute)
    }

    /// Non-null `(catchment id, value)` pairs of one attribute.
    pub fn values<'a>(&'a self, attribute: &str) -> Option<impl Iterator<Item = (i64, f64)> + 'a> {
        let column = self.columns.get(attribute)?;
        Some(self.ids.iter().zip(column).filter_map(|(id, v)| v.map(|v| (*id, v))))
    }

    pub fn value(&self, id: i64, attribute: &str) -> Option<f64> {
        let row = *self.rows.get(&id)?;
        self.columns.get(attribute)?[row]
    }

    /// Every non-null attribute of one catchment; `None` if the catchment has
    /// no row in this table.
    pub fn row(&self, id: i64) -> Option<BTreeMap<String, f64>> {
        let row = *self.rows.get(&id)?;
        Some(
            self.columns
                .iter()
                .filter_map(|(name, col)| col[row].map(|v| (name.clone(), v)))
                .collect(),
        )
    }
}

/// Catchment ids sometimes arrive float-formatted (`1120000010.0`).
fn parse_id(raw: &str) -> Option<i64> {
    if let Ok(id) = raw.parse::<i64>() {
        return Some(id);
    }
    let f: f64 = raw.parse().ok()?;
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

/// `Ok(None)` for nulls, `Err(())` for text that is not a number.
fn parse_cell(raw: &str) -> std::result::Result<Option<f64>, ()> {
    if NULL_MARKERS.contains(&raw) {
        return Ok(None);
    }
    let v: f64 = raw.parse().map_err(|_| ())?;
    Ok(v.is_finite().then_some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "\
catchID,rainfall,runoff,basin_name,temp
1010,5.0,NA,Upper Nile,21.5
1020,15,0.25,,n/a
1030,,1.5,Congo,NaN
1020,99,99,dup,99
bogus,1,1,x,1
";

    fn table() -> ScenarioTable {
        ScenarioTable::from_reader(Scenario::Reference, CSV.as_bytes()).unwrap()
    }

    #[test]
    fn scenario_names_parse_case_insensitively() {
        assert_eq!("Reference".parse::<Scenario>().unwrap(), Scenario::Reference);
        assert_eq!(" future ".parse::<Scenario>().unwrap(), Scenario::Future);
        assert!("historic".parse::<Scenario>().unwrap_err().is_not_found());
    }

    #[test]
    fn null_markers_and_non_finite_values_become_null() {
        let t = table();
        assert_eq!(t.len(), 3);
        assert_eq!(t.value(1010, "runoff"), None);
        assert_eq!(t.value(1020, "runoff"), Some(0.25));
        assert_eq!(t.value(1030, "rainfall"), None);
        assert_eq!(t.value(1020, "temp"), None);
        assert_eq!(t.value(1030, "temp"), None);
    }

    #[test]
    fn text_columns_are_not_attributes() {
        let t = table();
        let attrs: Vec<&str> = t.attributes().collect();
        assert_eq!(attrs, vec!["rainfall", "runoff", "temp"]);
    }

    #[test]
    fn duplicate_rows_keep_the_first_occurrence() {
        assert_eq!(table().value(1020, "rainfall"), Some(15.0));
    }

    #[test]
    fn row_is_sparse() {
        let row = table().row(1010).unwrap();
        assert_eq!(row.len(), 2);
        assert_eq!(row["rainfall"], 5.0);
        assert_eq!(row["temp"], 21.5);
        assert!(table().row(4040).is_none());
    }

    #[test]
    fn float_formatted_ids_are_accepted() {
        let t = ScenarioTable::from_reader(Scenario::Current, "HYBAS_ID,a\n1120000010.0,1\n".as_bytes()).unwrap();
        assert_eq!(t.ids(), &[1_120_000_010]);
    }

    #[test]
    fn missing_id_column_is_rejected() {
        let err = ScenarioTable::from_reader(Scenario::Current, "id,a\n1,2\n".as_bytes()).unwrap_err();
        assert!(matches!(err, AtlasError::InvalidInput(_)));
    }
}
