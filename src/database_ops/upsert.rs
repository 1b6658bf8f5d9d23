//! Idempotent bulk writes keyed by a relation's natural uniqueness constraint.

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::batch::Value;
use crate::error::StoreResult;
use crate::store::{ConflictPolicy, Session, TableSpec};

/// Which duplicate survives when a batch repeats a conflict key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dedupe {
    FirstWins,
    LastWins,
}

/// A target relation with its write policy.
#[derive(Debug, Clone)]
pub struct Relation {
    pub table: TableSpec,
    pub policy: ConflictPolicy,
    pub dedupe: Dedupe,
}

impl Relation {
    /// Append-only relation: first writer wins, duplicates carry nothing new.
    pub fn ignore(table: TableSpec) -> Self {
        Self {
            table,
            policy: ConflictPolicy::Ignore,
            dedupe: Dedupe::FirstWins,
        }
    }

    /// Refreshing relation: last occurrence wins on `update`.
    pub fn merge(table: TableSpec, update: &[&str]) -> Self {
        Self {
            table,
            policy: ConflictPolicy::merge(update),
            dedupe: Dedupe::LastWins,
        }
    }
}

/// Outcome of one upsert operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationResult {
    pub inserted_count: u64,
    pub updated_count: u64,
    pub skipped_count: u64,
    pub errors: Vec<String>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

pub(crate) fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl OperationResult {
    /// Same counts, ignoring timing.
    pub fn same_counts(&self, other: &Self) -> bool {
        self.inserted_count == other.inserted_count
            && self.updated_count == other.updated_count
            && self.skipped_count == other.skipped_count
    }

    pub fn total_written(&self) -> u64 {
        self.inserted_count + self.updated_count
    }
}

/// Rows prepared for one relation plus the rows that could not take part.
#[derive(Debug, Default)]
pub struct PreparedRows {
    rows: Vec<Vec<Value>>,
    gaps: Vec<String>,
}

impl PreparedRows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: Vec<Value>) {
        self.rows.push(row);
    }

    /// Record a row that lacks data required for the relation.
    pub fn gap(&mut self, reason: impl Into<String>) {
        self.gaps.push(reason.into());
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn gap_count(&self) -> usize {
        self.gaps.len()
    }
}

impl From<Vec<Vec<Value>>> for PreparedRows {
    fn from(rows: Vec<Vec<Value>>) -> Self {
        Self {
            rows,
            gaps: Vec::new(),
        }
    }
}

/// Coerce, deduplicate and write `prepared` into `relation`.
///
/// Rows that fail coercion or have a null key column are skipped and described
/// in `errors` (at most `max_errors` messages). Never issues a statement for an
/// empty set. Store failures are returned as errors.
pub async fn upsert(
    session: &mut dyn Session,
    relation: &Relation,
    prepared: PreparedRows,
    max_errors: usize,
) -> StoreResult<OperationResult> {
    let started = Instant::now();
    let table = &relation.table;
    let PreparedRows { rows, mut gaps } = prepared;

    let mut coerced = Vec::with_capacity(rows.len());
    for row in rows {
        match coerce_row(table, row) {
            Ok(row) => coerced.push(row),
            Err(reason) => gaps.push(reason),
        }
    }

    let valid = coerced.len();
    let unique = dedupe(table, coerced, relation.dedupe);
    let duplicates = valid - unique.len();

    let counts = if unique.is_empty() {
        Default::default()
    } else {
        session.insert(table, &unique, &relation.policy).await?
    };

    if !gaps.is_empty() {
        warn!(
            table = %table.name,
            skipped = gaps.len(),
            "rows skipped for missing or invalid data"
        );
    }
    let gap_count = gaps.len();
    let mut errors: Vec<String> = gaps.into_iter().take(max_errors).collect();
    if gap_count > max_errors {
        errors.push(format!("... and {} more", gap_count - max_errors));
    }

    let result = OperationResult {
        inserted_count: counts.inserted,
        updated_count: counts.updated,
        skipped_count: counts.skipped + duplicates as u64 + gap_count as u64,
        errors,
        duration: started.elapsed(),
    };
    debug!(
        table = %table.name,
        inserted = result.inserted_count,
        updated = result.updated_count,
        skipped = result.skipped_count,
        "upsert complete"
    );
    Ok(result)
}

fn coerce_row(table: &TableSpec, row: Vec<Value>) -> Result<Vec<Value>, String> {
    if row.len() != table.columns.len() {
        return Err(format!(
            "{}: expected {} values, got {}",
            table.name,
            table.columns.len(),
            row.len()
        ));
    }
    let out = table
        .columns
        .iter()
        .zip(row.iter())
        .map(|(column, value)| {
            column
                .ty
                .coerce(value)
                .map_err(|e| format!("{}.{}: {e}", table.name, column.name))
        })
        .collect::<Result<Vec<_>, _>>()?;
    for idx in table.key_indices() {
        if out[idx].is_null() {
            return Err(format!(
                "{}: key column {} is empty",
                table.name, table.columns[idx].name
            ));
        }
    }
    Ok(out)
}

/// Drop repeated conflict keys. Survivors keep the position of the key's first
/// occurrence; with `LastWins` they carry the values of its last occurrence.
fn dedupe(table: &TableSpec, rows: Vec<Vec<Value>>, rule: Dedupe) -> Vec<Vec<Value>> {
    if table.conflict_key.is_empty() {
        return rows;
    }
    let mut by_key: IndexMap<String, Vec<Value>> = IndexMap::with_capacity(rows.len());
    for row in rows {
        let key = table
            .key_of(&row)
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("\u{1f}");
        match rule {
            Dedupe::FirstWins => {
                by_key.entry(key).or_insert(row);
            }
            Dedupe::LastWins => {
                by_key.insert(key, row);
            }
        }
    }
    by_key.into_values().collect()
}
