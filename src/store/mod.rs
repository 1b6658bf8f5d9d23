//! Relational store contract used by the ingest pipeline.
//!
//! A `Store` hands out isolated `Session`s (one pooled connection each). All
//! writes go through `Session::insert` with an explicit conflict policy and
//! all id lookups through `Session::select_ids`, keyed by the table's natural
//! uniqueness constraint.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::Serialize;

use crate::batch::Value;
use crate::error::StoreResult;

/// Column types the pipeline writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    BigInt,
    Double,
    Bool,
    Date,
}

impl ColumnType {
    /// Coerce a cell to this column type. Nulls pass through; a non-null value
    /// that cannot be represented yields a description of the problem.
    pub fn coerce(self, value: &Value) -> Result<Value, String> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let converted = match self {
            Self::Text => value.as_text().map(|t| Value::Text(t.into_owned())),
            Self::BigInt => value.as_i64().map(Value::Int),
            Self::Double => value.as_f64().map(Value::Float),
            Self::Bool => value.as_bool().map(Value::Bool),
            Self::Date => value.as_date().map(Value::Date),
        };
        converted.ok_or_else(|| format!("cannot read {value:?} as {self:?}"))
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub column: String,
    pub references: String,
}

/// Shape of one target relation.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: String,
    /// Store-assigned surrogate id, when the relation has one.
    pub id_column: Option<String>,
    /// Insertable columns, in the order rows are supplied.
    pub columns: Vec<Column>,
    /// Columns covered by the relation's unique constraint.
    pub conflict_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_column: None,
            columns: Vec::new(),
            conflict_key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn id(mut self, column: impl Into<String>) -> Self {
        self.id_column = Some(column.into());
        self
    }

    pub fn column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.push(Column {
            name: name.into(),
            ty,
        });
        self
    }

    pub fn conflict_key(mut self, columns: &[&str]) -> Self {
        self.conflict_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn references(mut self, column: impl Into<String>, table: impl Into<String>) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            references: table.into(),
        });
        self
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Positions of the conflict-key columns within `columns`.
    pub fn key_indices(&self) -> Vec<usize> {
        self.conflict_key
            .iter()
            .filter_map(|k| self.column_index(k))
            .collect()
    }

    /// Project a full row onto its conflict key.
    pub fn key_of(&self, row: &[Value]) -> Vec<Value> {
        self.key_indices()
            .into_iter()
            .map(|i| row.get(i).cloned().unwrap_or_default())
            .collect()
    }

    pub fn key_types(&self) -> Vec<ColumnType> {
        self.key_indices()
            .into_iter()
            .map(|i| self.columns[i].ty)
            .collect()
    }
}

/// What happens when a row collides with the relation's unique constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// First writer wins; the colliding row is dropped.
    Ignore,
    /// Last writer wins on the named columns.
    Merge { update: Vec<String> },
}

impl ConflictPolicy {
    pub fn merge(columns: &[&str]) -> Self {
        Self::Merge {
            update: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteCounts {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl WriteCounts {
    pub fn add(&mut self, other: WriteCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }
}

/// One isolated connection. Not shared between tasks.
#[async_trait]
pub trait Session: Send {
    async fn begin(&mut self) -> StoreResult<()>;

    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self) -> StoreResult<()>;

    /// Make writes visible to later statements of this unit of work without
    /// committing them.
    async fn flush(&mut self) -> StoreResult<()>;

    fn in_transaction(&self) -> bool;

    /// True when a statement failed inside the open transaction and only a
    /// rollback is accepted.
    fn is_aborted(&self) -> bool;

    /// Whether foreign-key enforcement is active on this connection.
    async fn referential_integrity(&mut self) -> StoreResult<bool>;

    async fn set_referential_integrity(&mut self, enforced: bool) -> StoreResult<()>;

    /// Surrogate ids for the given conflict-key tuples. Keys not present in the
    /// relation are absent from the result.
    async fn select_ids(
        &mut self,
        table: &TableSpec,
        keys: &[Vec<Value>],
    ) -> StoreResult<Vec<(Vec<Value>, i64)>>;

    /// Bulk insert with the given conflict policy. Rows must already be
    /// coerced to the column types and free of duplicate keys.
    async fn insert(
        &mut self,
        table: &TableSpec,
        rows: &[Vec<Value>],
        policy: &ConflictPolicy,
    ) -> StoreResult<WriteCounts>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn connect(&self) -> StoreResult<Box<dyn Session>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn coerce_converts_text_cells() {
        assert_eq!(ColumnType::BigInt.coerce(&Value::from("12")), Ok(Value::Int(12)));
        assert_eq!(
            ColumnType::Date.coerce(&Value::from("01/03/2024")),
            Ok(Value::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()))
        );
        assert_eq!(ColumnType::Text.coerce(&Value::Int(7)), Ok(Value::from("7")));
        assert_eq!(ColumnType::Bool.coerce(&Value::Null), Ok(Value::Null));
        assert!(ColumnType::BigInt.coerce(&Value::from("doce")).is_err());
    }

    #[test]
    fn key_projection_follows_conflict_key_order() {
        let spec = TableSpec::new("case_vaccinations")
            .column("case_id", ColumnType::BigInt)
            .column("vaccine_id", ColumnType::BigInt)
            .column("dose", ColumnType::Text)
            .column("vaccination_date", ColumnType::Date)
            .conflict_key(&["case_id", "vaccine_id", "dose"]);
        let row = vec![Value::Int(1), Value::Int(2), Value::from("1"), Value::Null];
        assert_eq!(
            spec.key_of(&row),
            vec![Value::Int(1), Value::Int(2), Value::from("1")]
        );
        assert_eq!(
            spec.key_types(),
            vec![ColumnType::BigInt, ColumnType::BigInt, ColumnType::Text]
        );
    }
}
