//! What one batch loads: catalog sources, the case relation with its
//! aggregation rules, and the detail operations that hang off cases.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::database_ops::aggregate::AggregationRules;
use crate::database_ops::catalog::CatalogSource;
use crate::database_ops::details::{surveillance_operations, DetailOperation, DISEASE_GROUPS};
use crate::database_ops::upsert::Relation;
use crate::error::{IngestError, Result};
use crate::schema::{self, columns, CatalogKind};

#[derive(Clone)]
pub struct IngestPlan {
    pub catalogs: Vec<CatalogSource>,
    /// Source column holding the natural case key.
    pub case_key_column: String,
    pub rules: AggregationRules,
    pub cases: Relation,
    /// Detail operations. Those with a dependency run after every
    /// independent one has finished.
    pub details: Vec<Arc<dyn DetailOperation>>,
}

impl fmt::Debug for IngestPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestPlan")
            .field("catalogs", &self.catalogs.len())
            .field("case_key_column", &self.case_key_column)
            .field("cases", &self.cases.table.name)
            .field("details", &self.details)
            .finish()
    }
}

impl IngestPlan {
    /// The notifiable-disease surveillance extract.
    pub fn surveillance() -> Self {
        let catalogs = vec![
            CatalogSource::new(CatalogKind::Facility, columns::FACILITY)
                .disambiguated_by(columns::FACILITY_CODE),
            CatalogSource::new(CatalogKind::Facility, columns::NOTIFYING_FACILITY)
                .disambiguated_by(columns::NOTIFYING_FACILITY_CODE),
            CatalogSource::new(CatalogKind::SampleType, columns::SAMPLE_TYPE),
            CatalogSource::new(CatalogKind::Vaccine, columns::VACCINE),
            CatalogSource::new(CatalogKind::Symptom, columns::SYMPTOM),
            CatalogSource::new(CatalogKind::Disease, columns::DIAGNOSIS),
            CatalogSource::new(CatalogKind::Disease, columns::PATHOGEN),
            CatalogSource::new(CatalogKind::DiseaseGroup, columns::DISEASE_GROUP),
        ];
        let cases = Relation::merge(
            schema::cases_table(),
            &["onset_date", "notification_date", "facility_id", "sex", "age", "commune"],
        );
        let rules = AggregationRules::default()
            .earliest_date(
                "onset_date",
                &[
                    columns::SYMPTOM_ONSET_DATE,
                    columns::CONSULTATION_DATE,
                    columns::NOTIFICATION_DATE,
                ],
            )
            .earliest_date("notification_date", &[columns::NOTIFICATION_DATE])
            .first_catalog_id(
                "facility_id",
                CatalogKind::Facility,
                &[columns::FACILITY, columns::NOTIFYING_FACILITY],
            )
            .first_value("sex", &[columns::SEX])
            .first_value("age", &[columns::AGE])
            .first_value("commune", &[columns::COMMUNE])
            .membership(DISEASE_GROUPS, CatalogKind::DiseaseGroup, columns::DISEASE_GROUP)
            .typed_by(&cases.table);
        Self {
            catalogs,
            case_key_column: columns::CASE_NUMBER.to_string(),
            rules,
            cases,
            details: surveillance_operations(),
        }
    }

    /// Column of the case relation that receives the natural key.
    pub fn case_key_target(&self) -> Option<&str> {
        match self.cases.table.conflict_key.as_slice() {
            [single] => Some(single.as_str()),
            _ => None,
        }
    }

    /// Check the dependency graph before anything is written.
    pub fn validate(&self) -> Result<()> {
        if self.cases.table.id_column.is_none() {
            return Err(IngestError::Plan(format!(
                "case relation {} has no id column",
                self.cases.table.name
            )));
        }
        if self.case_key_target().is_none() {
            return Err(IngestError::Plan(format!(
                "case relation {} needs a single-column conflict key",
                self.cases.table.name
            )));
        }

        let mut names = HashSet::new();
        for op in &self.details {
            if !names.insert(op.name()) {
                return Err(IngestError::Plan(format!(
                    "duplicate operation name {}",
                    op.name()
                )));
            }
        }
        for op in &self.details {
            let Some(dep) = op.depends_on() else {
                continue;
            };
            let Some(parent) = self.details.iter().find(|p| p.name() == dep) else {
                return Err(IngestError::Plan(format!(
                    "{} depends on unknown operation {dep}",
                    op.name()
                )));
            };
            if parent.depends_on().is_some() {
                return Err(IngestError::Plan(format!(
                    "{} depends on {dep}, which is itself dependent",
                    op.name()
                )));
            }
        }
        Ok(())
    }

    pub fn independent(&self) -> impl Iterator<Item = &Arc<dyn DetailOperation>> {
        self.details.iter().filter(|op| op.depends_on().is_none())
    }

    pub fn dependent(&self) -> impl Iterator<Item = &Arc<dyn DetailOperation>> {
        self.details.iter().filter(|op| op.depends_on().is_some())
    }
}
