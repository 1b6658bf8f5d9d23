//! Attach store-assigned parent ids to the rows of a batch.
//!
//! The join runs once per batch and mapping; every detail operation reads the
//! same `PropagatedBatch` instead of repeating the lookup.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::batch::{natural_key, Batch, RawRow, Value};

/// Natural case key to surrogate id, built from a fresh read after the cases
/// were committed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierMapping {
    ids: HashMap<String, i64>,
}

impl IdentifierMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `select_ids` output over a single-column text key.
    pub fn from_pairs(pairs: Vec<(Vec<Value>, i64)>) -> Self {
        let ids = pairs
            .into_iter()
            .filter_map(|(key, id)| {
                let key = key.first()?.as_text()?.into_owned();
                Some((key, id))
            })
            .collect();
        Self { ids }
    }

    pub fn insert(&mut self, key: impl Into<String>, id: i64) {
        self.ids.insert(key.into(), id);
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.ids.get(key.trim()).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// A view of the batch where each row carries its resolved parent id, or
/// `None` when its key is absent from the mapping.
#[derive(Debug, Clone)]
pub struct PropagatedBatch {
    batch: Arc<Batch>,
    /// Positions in `batch` that belong to the view.
    indices: Vec<usize>,
    resolved: Vec<Option<i64>>,
}

pub fn propagate(
    batch: Arc<Batch>,
    mapping: &IdentifierMapping,
    join_key: &str,
) -> PropagatedBatch {
    propagate_filtered(batch, mapping, join_key, |_| true)
}

/// Left join restricted to the rows accepted by `keep`.
pub fn propagate_filtered<P>(
    batch: Arc<Batch>,
    mapping: &IdentifierMapping,
    join_key: &str,
    keep: P,
) -> PropagatedBatch
where
    P: Fn(&RawRow) -> bool,
{
    let mut indices = Vec::new();
    let mut resolved = Vec::new();
    for (idx, row) in batch.rows().iter().enumerate() {
        if !keep(row) {
            continue;
        }
        indices.push(idx);
        resolved.push(natural_key(row, join_key).and_then(|k| mapping.get(&k)));
    }
    let view = PropagatedBatch {
        batch,
        indices,
        resolved,
    };
    debug!(
        rows = view.len(),
        unresolved = view.unresolved_count(),
        "propagated parent ids"
    );
    view
}

impl PropagatedBatch {
    /// Every row of the view with its parent id.
    pub fn iter(&self) -> impl Iterator<Item = (&RawRow, Option<i64>)> + '_ {
        self.entries().map(|(_, row, id)| (row, id))
    }

    /// Like `iter`, with each row's position in the source batch.
    pub fn entries(&self) -> impl Iterator<Item = (usize, &RawRow, Option<i64>)> + '_ {
        let rows = self.batch.rows();
        self.indices
            .iter()
            .zip(&self.resolved)
            .map(move |(&idx, id)| (idx, &rows[idx], *id))
    }

    /// Only the rows whose parent resolved.
    pub fn resolved(&self) -> impl Iterator<Item = (&RawRow, i64)> + '_ {
        self.iter().filter_map(|(row, id)| id.map(|id| (row, id)))
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn unresolved_count(&self) -> usize {
        self.resolved.iter().filter(|id| id.is_none()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> Arc<Batch> {
        Arc::new(Batch::new(vec![
            RawRow::new().with("case_number", "42").with("symptom", "FIEBRE"),
            RawRow::new().with("case_number", "43"),
            RawRow::new().with("case_number", " 42 ").with("symptom", "TOS"),
            RawRow::new().with("symptom", "TOS"),
        ]))
    }

    fn mapping() -> IdentifierMapping {
        IdentifierMapping::from_pairs(vec![(vec![Value::from("42")], 7)])
    }

    #[test]
    fn left_join_keeps_unmatched_rows_as_none() {
        let view = propagate(batch(), &mapping(), "case_number");
        let ids: Vec<_> = view.iter().map(|(_, id)| id).collect();
        assert_eq!(ids, vec![Some(7), None, Some(7), None]);
        assert_eq!(view.unresolved_count(), 2);
        assert_eq!(view.resolved().count(), 2);
    }

    #[test]
    fn filtered_view_only_contains_accepted_rows() {
        let view = propagate_filtered(batch(), &mapping(), "case_number", |row| {
            !row.get("symptom").is_null()
        });
        assert_eq!(view.len(), 3);
        let symptoms: Vec<_> = view
            .resolved()
            .map(|(row, _)| row.text("symptom").unwrap().into_owned())
            .collect();
        assert_eq!(symptoms, vec!["FIEBRE", "TOS"]);
    }

    #[test]
    fn mapping_reads_numeric_keys_as_text() {
        let mapping = IdentifierMapping::from_pairs(vec![
            (vec![Value::Float(42.0)], 1),
            (vec![Value::Null], 2),
        ]);
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.get("42"), Some(1));
    }
}
