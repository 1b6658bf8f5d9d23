//! Child relations written after the cases exist.
//!
//! Every operation reads the shared `DetailContext` (one propagated view, one
//! set of catalog ids) and writes through its own session. An operation with a
//! `depends_on` runs after all independent operations, on the session that
//! executed its dependency.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexSet;
use tracing::{debug, instrument};

use crate::batch::{RawRow, Value};
use crate::database_ops::aggregate::CaseAggregate;
use crate::database_ops::catalog::CatalogIds;
use crate::database_ops::propagate::{IdentifierMapping, PropagatedBatch};
use crate::database_ops::upsert::{upsert, OperationResult, PreparedRows, Relation};
use crate::error::StoreResult;
use crate::schema::{self, columns, tables, CatalogKind};
use crate::store::Session;

/// Test method recorded when the extract leaves it blank.
pub const UNSPECIFIED_TEST_METHOD: &str = "unspecified";
/// Dose recorded when the extract leaves it blank.
pub const UNKNOWN_DOSE: &str = "unknown";

/// Everything a detail operation may read. Built once per batch.
#[derive(Debug)]
pub struct DetailContext {
    pub propagated: PropagatedBatch,
    pub catalogs: CatalogIds,
    pub cases: Vec<CaseAggregate>,
    pub mapping: IdentifierMapping,
    pub max_errors: usize,
}

#[async_trait]
pub trait DetailOperation: Send + Sync {
    /// Name used in the batch summary and in failures.
    fn name(&self) -> &str;

    /// Operation whose writes this one reads.
    fn depends_on(&self) -> Option<&str> {
        None
    }

    async fn run(
        &self,
        session: &mut dyn Session,
        ctx: &DetailContext,
    ) -> StoreResult<OperationResult>;
}

impl fmt::Debug for dyn DetailOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetailOperation")
            .field("name", &self.name())
            .field("depends_on", &self.depends_on())
            .finish()
    }
}

/// What a source row contributes to one relation.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    /// Values for every column after the leading case id.
    Row(Vec<Value>),
    /// The row carries nothing for this relation.
    NotApplicable,
    /// The row has data for this relation but cannot take part.
    Gap(String),
}

pub type RowBuilder = fn(&RawRow, &CatalogIds) -> RowOutcome;

/// One child row per applicable source row, prefixed with the case id.
pub struct RelationOperation {
    name: String,
    relation: Relation,
    build: RowBuilder,
}

impl RelationOperation {
    pub fn new(relation: Relation, build: RowBuilder) -> Self {
        Self {
            name: relation.table.name.clone(),
            relation,
            build,
        }
    }
}

#[async_trait]
impl DetailOperation for RelationOperation {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(operation = %self.name))]
    async fn run(
        &self,
        session: &mut dyn Session,
        ctx: &DetailContext,
    ) -> StoreResult<OperationResult> {
        let mut prepared = PreparedRows::new();
        for (idx, row, case_id) in ctx.propagated.entries() {
            match ((self.build)(row, &ctx.catalogs), case_id) {
                (RowOutcome::NotApplicable, _) => {}
                (RowOutcome::Gap(reason), _) => {
                    debug!(row = idx, %reason, "row skipped");
                    prepared.gap(format!("row {idx}: {reason}"));
                }
                (RowOutcome::Row(_), None) => {
                    debug!(row = idx, "row has no resolved case");
                    prepared.gap(format!("row {idx}: no case id for this row"));
                }
                (RowOutcome::Row(values), Some(case_id)) => {
                    let mut full = Vec::with_capacity(values.len() + 1);
                    full.push(Value::Int(case_id));
                    full.extend(values);
                    prepared.push(full);
                }
            }
        }
        upsert(session, &self.relation, prepared, ctx.max_errors).await
    }
}

/// Writes the set-valued memberships collected by the aggregator.
pub struct MembershipOperation {
    name: String,
    relation: Relation,
    target: String,
}

impl MembershipOperation {
    pub fn new(relation: Relation, target: &str) -> Self {
        Self {
            name: relation.table.name.clone(),
            relation,
            target: target.to_string(),
        }
    }
}

#[async_trait]
impl DetailOperation for MembershipOperation {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(operation = %self.name))]
    async fn run(
        &self,
        session: &mut dyn Session,
        ctx: &DetailContext,
    ) -> StoreResult<OperationResult> {
        let mut prepared = PreparedRows::new();
        for case in &ctx.cases {
            let Some(case_id) = ctx.mapping.get(&case.natural_key) else {
                if case.members(&self.target).next().is_some() {
                    prepared.gap(format!("case {}: no case id", case.natural_key));
                }
                continue;
            };
            for member in case.members(&self.target) {
                prepared.push(vec![Value::Int(case_id), Value::Int(member)]);
            }
        }
        upsert(session, &self.relation, prepared, ctx.max_errors).await
    }
}

/// Test results keyed by the sample rows written by `case_samples`.
pub struct SampleResultsOperation {
    relation: Relation,
    depends_on: String,
}

impl SampleResultsOperation {
    pub fn new() -> Self {
        Self {
            relation: Relation::merge(schema::sample_results_table(), &["result", "pathogen_id"]),
            depends_on: tables::CASE_SAMPLES.to_string(),
        }
    }
}

impl Default for SampleResultsOperation {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DetailOperation for SampleResultsOperation {
    fn name(&self) -> &str {
        &self.relation.table.name
    }

    fn depends_on(&self) -> Option<&str> {
        Some(&self.depends_on)
    }

    #[instrument(skip_all, fields(operation = %self.relation.table.name))]
    async fn run(
        &self,
        session: &mut dyn Session,
        ctx: &DetailContext,
    ) -> StoreResult<OperationResult> {
        let mut pending = Vec::new();
        let mut prepared = PreparedRows::new();
        for (idx, row, case_id) in ctx.propagated.entries() {
            let result = row.text(columns::TEST_RESULT);
            let pathogen = row.text(columns::PATHOGEN);
            if result.is_none() && pathogen.is_none() {
                continue;
            }
            let Some(sample_number) = row.text(columns::SAMPLE_NUMBER) else {
                prepared.gap(format!("row {idx}: test result without sample number"));
                continue;
            };
            let Some(case_id) = case_id else {
                prepared.gap(format!("row {idx}: no case id for this row"));
                continue;
            };
            let pathogen_id = match pathogen.as_deref() {
                Some(label) => match ctx.catalogs.id(CatalogKind::Disease, label) {
                    Some(id) => Some(id),
                    None => {
                        prepared.gap(format!("row {idx}: pathogen {label:?} unresolved"));
                        continue;
                    }
                },
                None => None,
            };
            let method = row
                .text(columns::TEST_METHOD)
                .map(|m| m.into_owned())
                .unwrap_or_else(|| UNSPECIFIED_TEST_METHOD.to_string());
            pending.push((
                idx,
                (case_id, sample_number.into_owned()),
                method,
                result.map(|r| r.into_owned()),
                pathogen_id,
            ));
        }

        let keys = sample_keys(pending.iter().map(|(_, key, ..)| key));
        let sample_ids: HashMap<(i64, String), i64> = session
            .select_ids(&schema::case_samples_table(), &keys)
            .await?
            .into_iter()
            .filter_map(|(key, id)| {
                let case_id = key.first()?.as_i64()?;
                let number = key.get(1)?.as_text()?.into_owned();
                Some(((case_id, number), id))
            })
            .collect();

        for (idx, key, method, result, pathogen_id) in pending {
            match sample_ids.get(&key) {
                Some(&sample_id) => prepared.push(vec![
                    Value::Int(sample_id),
                    Value::from(method),
                    Value::from(result),
                    Value::from(pathogen_id),
                ]),
                None => prepared.gap(format!("row {idx}: sample {} not found", key.1)),
            }
        }
        upsert(session, &self.relation, prepared, ctx.max_errors).await
    }
}

/// Distinct `(case_id, sample_number)` lookup keys, in first-seen order.
fn sample_keys<'a>(keys: impl Iterator<Item = &'a (i64, String)>) -> Vec<Vec<Value>> {
    keys.collect::<IndexSet<_>>()
        .into_iter()
        .map(|(case_id, number)| vec![Value::Int(*case_id), Value::from(number.as_str())])
        .collect()
}

fn catalog_row(
    row: &RawRow,
    catalogs: &CatalogIds,
    kind: CatalogKind,
    column: &str,
    rest: impl FnOnce() -> Vec<Value>,
) -> RowOutcome {
    let Some(label) = row.text(column) else {
        return RowOutcome::NotApplicable;
    };
    match catalogs.id(kind, &label) {
        Some(id) => {
            let mut values = vec![Value::Int(id)];
            values.extend(rest());
            RowOutcome::Row(values)
        }
        None => RowOutcome::Gap(format!("{kind} label {label:?} unresolved")),
    }
}

pub fn symptom_row(row: &RawRow, catalogs: &CatalogIds) -> RowOutcome {
    catalog_row(row, catalogs, CatalogKind::Symptom, columns::SYMPTOM, Vec::new)
}

pub fn sample_row(row: &RawRow, catalogs: &CatalogIds) -> RowOutcome {
    let Some(number) = row.text(columns::SAMPLE_NUMBER) else {
        return RowOutcome::NotApplicable;
    };
    RowOutcome::Row(vec![
        Value::from(number.into_owned()),
        Value::from(catalogs.id_in(CatalogKind::SampleType, row, columns::SAMPLE_TYPE)),
        row.get(columns::SAMPLE_DATE).clone(),
        Value::from(catalogs.id_in(CatalogKind::Facility, row, columns::FACILITY)),
    ])
}

pub fn diagnosis_row(row: &RawRow, catalogs: &CatalogIds) -> RowOutcome {
    catalog_row(row, catalogs, CatalogKind::Disease, columns::DIAGNOSIS, || {
        vec![
            row.get(columns::CLASSIFICATION).clone(),
            row.get(columns::DIAGNOSIS_DATE).clone(),
        ]
    })
}

pub fn vaccination_row(row: &RawRow, catalogs: &CatalogIds) -> RowOutcome {
    catalog_row(row, catalogs, CatalogKind::Vaccine, columns::VACCINE, || {
        let dose = row
            .text(columns::VACCINE_DOSE)
            .map(|d| d.into_owned())
            .unwrap_or_else(|| UNKNOWN_DOSE.to_string());
        vec![Value::from(dose), row.get(columns::VACCINATION_DATE).clone()]
    })
}

/// Aggregate membership target shared with the case rules.
pub const DISEASE_GROUPS: &str = "disease_groups";

/// Detail operations of the surveillance feed, independent ones first.
pub fn surveillance_operations() -> Vec<Arc<dyn DetailOperation>> {
    vec![
        Arc::new(RelationOperation::new(
            Relation::ignore(schema::case_symptoms_table()),
            symptom_row,
        )),
        Arc::new(RelationOperation::new(
            Relation::merge(
                schema::case_samples_table(),
                &["sample_type_id", "sample_date", "facility_id"],
            ),
            sample_row,
        )),
        Arc::new(RelationOperation::new(
            Relation::merge(
                schema::case_diagnoses_table(),
                &["classification", "diagnosis_date"],
            ),
            diagnosis_row,
        )),
        Arc::new(RelationOperation::new(
            Relation::merge(schema::case_vaccinations_table(), &["vaccination_date"]),
            vaccination_row,
        )),
        Arc::new(MembershipOperation::new(
            Relation::ignore(schema::case_disease_groups_table()),
            DISEASE_GROUPS,
        )),
        Arc::new(SampleResultsOperation::new()),
    ]
}
