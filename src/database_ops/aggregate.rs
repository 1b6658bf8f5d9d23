//! Collapse denormalized rows into one aggregate per natural case key.
//!
//! Aggregation laws, applied the same way to groups of one or many rows:
//! - dates: earliest non-null value across the listed columns, else null
//! - scalar fields: first non-null value, column priority first, then row order;
//!   a typed field only accepts values readable as its column type
//! - memberships: union of the catalog ids found in the group

use std::collections::BTreeSet;

use chrono::NaiveDate;
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::batch::{RawRow, Value};
use crate::database_ops::catalog::CatalogIds;
use crate::schema::CatalogKind;
use crate::store::{ColumnType, TableSpec};

#[derive(Debug, Clone)]
pub struct DateRule {
    pub target: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FieldRule {
    pub target: String,
    /// Source columns in priority order.
    pub columns: Vec<String>,
    /// Resolve the label through this catalog and keep the id instead.
    pub catalog: Option<CatalogKind>,
    /// Values that do not coerce to this type are passed over.
    pub ty: Option<ColumnType>,
}

impl FieldRule {
    /// The usable value of `column` in `row`, if any.
    fn pick(&self, row: &RawRow, column: &str, catalogs: &CatalogIds) -> Option<Value> {
        if let Some(kind) = self.catalog {
            return catalogs.id_in(kind, row, column).map(Value::Int);
        }
        let value = row.get(column);
        if value.is_null() {
            return None;
        }
        match self.ty {
            None => Some(value.clone()),
            Some(ty) => match ty.coerce(value) {
                Ok(coerced) => Some(coerced),
                Err(reason) => {
                    debug!(field = %self.target, %reason, "value passed over");
                    None
                }
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct MembershipRule {
    pub target: String,
    pub column: String,
    pub catalog: CatalogKind,
}

#[derive(Debug, Clone, Default)]
pub struct AggregationRules {
    pub dates: Vec<DateRule>,
    pub fields: Vec<FieldRule>,
    pub memberships: Vec<MembershipRule>,
}

fn owned(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| c.to_string()).collect()
}

impl AggregationRules {
    pub fn earliest_date(mut self, target: &str, columns: &[&str]) -> Self {
        self.dates.push(DateRule {
            target: target.to_string(),
            columns: owned(columns),
        });
        self
    }

    pub fn first_value(mut self, target: &str, columns: &[&str]) -> Self {
        self.fields.push(FieldRule {
            target: target.to_string(),
            columns: owned(columns),
            catalog: None,
            ty: None,
        });
        self
    }

    pub fn first_catalog_id(mut self, target: &str, kind: CatalogKind, columns: &[&str]) -> Self {
        self.fields.push(FieldRule {
            target: target.to_string(),
            columns: owned(columns),
            catalog: Some(kind),
            ty: Some(ColumnType::BigInt),
        });
        self
    }

    /// Type every scalar field after the column of `table` it lands in.
    pub fn typed_by(mut self, table: &TableSpec) -> Self {
        for rule in &mut self.fields {
            if let Some(idx) = table.column_index(&rule.target) {
                rule.ty = Some(table.columns[idx].ty);
            }
        }
        self
    }

    pub fn membership(mut self, target: &str, kind: CatalogKind, column: &str) -> Self {
        self.memberships.push(MembershipRule {
            target: target.to_string(),
            column: column.to_string(),
            catalog: kind,
        });
        self
    }
}

/// Canonical parent entity derived from every row sharing a natural key.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseAggregate {
    pub natural_key: String,
    /// Aggregated scalars (dates included), keyed by rule target.
    pub fields: IndexMap<String, Value>,
    pub memberships: IndexMap<String, BTreeSet<i64>>,
    pub row_count: usize,
}

impl CaseAggregate {
    pub fn field(&self, target: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.fields.get(target).unwrap_or(&NULL)
    }

    pub fn date(&self, target: &str) -> Option<NaiveDate> {
        self.field(target).as_date()
    }

    pub fn members(&self, target: &str) -> impl Iterator<Item = i64> + '_ {
        self.memberships
            .get(target)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// Row for `table`: the natural key goes to `key_column`, every other
    /// column takes the aggregated field of the same name (null if none).
    pub fn to_row(&self, table: &TableSpec, key_column: &str) -> Vec<Value> {
        table
            .columns
            .iter()
            .map(|column| {
                if column.name == key_column {
                    Value::from(self.natural_key.as_str())
                } else {
                    self.field(&column.name).clone()
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    /// One aggregate per key, in order of first appearance.
    pub cases: Vec<CaseAggregate>,
    /// Rows dropped because their key was null or empty.
    pub unresolvable_rows: usize,
}

pub fn aggregate<F>(
    rows: &[RawRow],
    key_fn: F,
    rules: &AggregationRules,
    catalogs: &CatalogIds,
) -> Aggregation
where
    F: Fn(&RawRow) -> Option<String>,
{
    let mut groups: IndexMap<String, Vec<&RawRow>> = IndexMap::new();
    let mut unresolvable_rows = 0;
    for (idx, row) in rows.iter().enumerate() {
        match key_fn(row).filter(|k| !k.trim().is_empty()) {
            Some(key) => groups.entry(key).or_default().push(row),
            None => {
                unresolvable_rows += 1;
                warn!(row = idx, "unresolvable case: row has no case key");
            }
        }
    }

    let cases = groups
        .into_iter()
        .map(|(natural_key, group)| aggregate_group(natural_key, &group, rules, catalogs))
        .collect();
    Aggregation {
        cases,
        unresolvable_rows,
    }
}

fn aggregate_group(
    natural_key: String,
    group: &[&RawRow],
    rules: &AggregationRules,
    catalogs: &CatalogIds,
) -> CaseAggregate {
    let mut fields = IndexMap::new();

    for rule in &rules.dates {
        let earliest = group
            .iter()
            .flat_map(|row| rule.columns.iter().filter_map(|c| row.get(c).as_date()))
            .min();
        fields.insert(rule.target.clone(), Value::from(earliest));
    }

    for rule in &rules.fields {
        let value = rule
            .columns
            .iter()
            .find_map(|column| group.iter().find_map(|row| rule.pick(row, column, catalogs)))
            .unwrap_or_default();
        fields.insert(rule.target.clone(), value);
    }

    let mut memberships = IndexMap::new();
    for rule in &rules.memberships {
        let ids: BTreeSet<i64> = group
            .iter()
            .filter_map(|row| catalogs.id_in(rule.catalog, row, &rule.column))
            .collect();
        memberships.insert(rule.target.clone(), ids);
    }

    CaseAggregate {
        natural_key,
        fields,
        memberships,
        row_count: group.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::natural_key;
    use std::collections::HashMap;

    fn key(row: &RawRow) -> Option<String> {
        natural_key(row, "case_number")
    }

    fn rules() -> AggregationRules {
        AggregationRules::default()
            .earliest_date("onset_date", &["onset", "consultation"])
            .first_value("sex", &["sex"])
            .first_catalog_id(
                "facility_id",
                CatalogKind::Facility,
                &["facility", "notifying_facility"],
            )
            .membership("disease_groups", CatalogKind::DiseaseGroup, "group")
    }

    fn catalogs() -> CatalogIds {
        let mut ids = CatalogIds::new();
        ids.insert(
            CatalogKind::Facility,
            HashMap::from([("hospital_a".to_string(), 1), ("hospital_b".to_string(), 2)]),
        );
        ids.insert(
            CatalogKind::DiseaseGroup,
            HashMap::from([("irag".to_string(), 10), ("eti".to_string(), 11)]),
        );
        ids
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn earliest_date_wins_across_rows_and_columns() {
        let rows = vec![
            RawRow::new().with("case_number", "42"),
            RawRow::new().with("case_number", "42").with("onset", "2024-03-05"),
            RawRow::new().with("case_number", "42").with("consultation", "2024-03-01"),
        ];
        let agg = aggregate(&rows, key, &rules(), &catalogs());
        assert_eq!(agg.cases.len(), 1);
        assert_eq!(agg.cases[0].date("onset_date"), Some(date("2024-03-01")));
    }

    #[test]
    fn all_null_dates_stay_null() {
        let rows = vec![
            RawRow::new().with("case_number", "7"),
            RawRow::new().with("case_number", "7"),
        ];
        let agg = aggregate(&rows, key, &rules(), &catalogs());
        assert_eq!(agg.cases[0].field("onset_date"), &Value::Null);
    }

    #[test]
    fn first_non_null_follows_column_priority_then_row_order() {
        let rows = vec![
            RawRow::new().with("case_number", "1").with("notifying_facility", "Hospital B"),
            RawRow::new().with("case_number", "1").with("facility", "Hospital A").with("sex", "F"),
            RawRow::new().with("case_number", "1").with("sex", "M"),
        ];
        let agg = aggregate(&rows, key, &rules(), &catalogs());
        let case = &agg.cases[0];
        assert_eq!(case.field("facility_id"), &Value::Int(1));
        assert_eq!(case.field("sex"), &Value::from("F"));
    }

    #[test]
    fn typed_field_skips_unreadable_values() {
        let table = TableSpec::new("cases")
            .column("case_number", ColumnType::Text)
            .column("age", ColumnType::BigInt);
        let rules = AggregationRules::default()
            .first_value("age", &["age"])
            .typed_by(&table);
        let rows = vec![
            RawRow::new().with("case_number", "42").with("age", "desconocido"),
            RawRow::new().with("case_number", "42").with("age", "34"),
        ];
        let agg = aggregate(&rows, key, &rules, &catalogs());
        assert_eq!(agg.cases[0].field("age"), &Value::Int(34));

        let only_bad = vec![RawRow::new().with("case_number", "43").with("age", "n/a")];
        let agg = aggregate(&only_bad, key, &rules, &catalogs());
        assert_eq!(agg.cases[0].field("age"), &Value::Null);
    }

    #[test]
    fn memberships_are_a_set_union() {
        let rows = vec![
            RawRow::new().with("case_number", "1").with("group", "IRAG"),
            RawRow::new().with("case_number", "1").with("group", "ETI"),
            RawRow::new().with("case_number", "1").with("group", "irag"),
            RawRow::new().with("case_number", "1"),
        ];
        let agg = aggregate(&rows, key, &rules(), &catalogs());
        assert_eq!(agg.cases[0].members("disease_groups").collect::<Vec<_>>(), vec![10, 11]);
        assert_eq!(agg.cases[0].row_count, 4);
    }

    #[test]
    fn rows_without_key_are_unresolvable() {
        let rows = vec![
            RawRow::new().with("case_number", "  "),
            RawRow::new(),
            RawRow::new().with("case_number", "5"),
        ];
        let agg = aggregate(&rows, key, &rules(), &catalogs());
        assert_eq!(agg.unresolvable_rows, 2);
        assert_eq!(agg.cases.len(), 1);
    }

    #[test]
    fn single_row_group_matches_repeated_group() {
        let row = RawRow::new()
            .with("case_number", "9")
            .with("onset", "2024-01-02")
            .with("facility", "Hospital B")
            .with("group", "ETI");
        let one = aggregate(std::slice::from_ref(&row), key, &rules(), &catalogs());
        let many = aggregate(&[row.clone(), row.clone(), row], key, &rules(), &catalogs());
        assert_eq!(one.cases[0].fields, many.cases[0].fields);
        assert_eq!(one.cases[0].memberships, many.cases[0].memberships);
    }

    #[test]
    fn aggregation_is_deterministic() {
        let rows = vec![
            RawRow::new().with("case_number", "2").with("group", "ETI"),
            RawRow::new().with("case_number", "1").with("group", "IRAG"),
            RawRow::new().with("case_number", "2").with("onset", "2024-02-02"),
        ];
        let a = aggregate(&rows, key, &rules(), &catalogs());
        let b = aggregate(&rows, key, &rules(), &catalogs());
        assert_eq!(a.cases, b.cases);
        assert_eq!(a.cases[0].natural_key, "2");
    }

    #[test]
    fn to_row_follows_table_columns() {
        use crate::store::ColumnType;
        let table = TableSpec::new("cases")
            .column("case_number", ColumnType::Text)
            .column("sex", ColumnType::Text)
            .column("facility_id", ColumnType::BigInt)
            .column("commune", ColumnType::Text);
        let rows = vec![RawRow::new()
            .with("case_number", "42")
            .with("sex", "F")
            .with("facility", "Hospital A")];
        let agg = aggregate(&rows, key, &rules(), &catalogs());
        assert_eq!(
            agg.cases[0].to_row(&table, "case_number"),
            vec![Value::from("42"), Value::from("F"), Value::Int(1), Value::Null]
        );
    }
}
