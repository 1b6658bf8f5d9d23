//! Column names of the surveillance extract and the target relations they
//! load into.

use std::fmt;

use crate::store::{ColumnType, TableSpec};

/// Source column names of the denormalized extract.
pub mod columns {
    pub const CASE_NUMBER: &str = "case_number";

    pub const SYMPTOM_ONSET_DATE: &str = "symptom_onset_date";
    pub const CONSULTATION_DATE: &str = "consultation_date";
    pub const NOTIFICATION_DATE: &str = "notification_date";

    pub const FACILITY: &str = "facility";
    pub const FACILITY_CODE: &str = "facility_code";
    pub const NOTIFYING_FACILITY: &str = "notifying_facility";
    pub const NOTIFYING_FACILITY_CODE: &str = "notifying_facility_code";

    pub const SEX: &str = "sex";
    pub const AGE: &str = "age";
    pub const COMMUNE: &str = "commune";
    pub const DISEASE_GROUP: &str = "disease_group";

    pub const SYMPTOM: &str = "symptom";

    pub const SAMPLE_NUMBER: &str = "sample_number";
    pub const SAMPLE_TYPE: &str = "sample_type";
    pub const SAMPLE_DATE: &str = "sample_date";
    pub const TEST_METHOD: &str = "test_method";
    pub const TEST_RESULT: &str = "test_result";
    pub const PATHOGEN: &str = "pathogen";

    pub const DIAGNOSIS: &str = "diagnosis";
    pub const CLASSIFICATION: &str = "classification";
    pub const DIAGNOSIS_DATE: &str = "diagnosis_date";

    pub const VACCINE: &str = "vaccine";
    pub const VACCINE_DOSE: &str = "vaccine_dose";
    pub const VACCINATION_DATE: &str = "vaccination_date";
}

/// Target table names.
pub mod tables {
    pub const FACILITIES: &str = "facilities";
    pub const SAMPLE_TYPES: &str = "sample_types";
    pub const VACCINES: &str = "vaccines";
    pub const SYMPTOMS: &str = "symptoms";
    pub const DISEASES: &str = "diseases";
    pub const DISEASE_GROUPS: &str = "disease_groups";

    pub const CASES: &str = "cases";

    pub const CASE_SYMPTOMS: &str = "case_symptoms";
    pub const CASE_SAMPLES: &str = "case_samples";
    pub const CASE_DIAGNOSES: &str = "case_diagnoses";
    pub const CASE_VACCINATIONS: &str = "case_vaccinations";
    pub const CASE_DISEASE_GROUPS: &str = "case_disease_groups";
    pub const SAMPLE_RESULTS: &str = "sample_results";
}

/// Reference tables resolved by normalized label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CatalogKind {
    Facility,
    SampleType,
    Vaccine,
    Symptom,
    Disease,
    DiseaseGroup,
}

impl CatalogKind {
    pub const ALL: [CatalogKind; 6] = [
        Self::Facility,
        Self::SampleType,
        Self::Vaccine,
        Self::Symptom,
        Self::Disease,
        Self::DiseaseGroup,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            Self::Facility => tables::FACILITIES,
            Self::SampleType => tables::SAMPLE_TYPES,
            Self::Vaccine => tables::VACCINES,
            Self::Symptom => tables::SYMPTOMS,
            Self::Disease => tables::DISEASES,
            Self::DiseaseGroup => tables::DISEASE_GROUPS,
        }
    }

    /// Every catalog table has the same shape: `(id, name_key UNIQUE, name, slug)`.
    pub fn table(self) -> TableSpec {
        TableSpec::new(self.table_name())
            .id("id")
            .column("name_key", ColumnType::Text)
            .column("name", ColumnType::Text)
            .column("slug", ColumnType::Text)
            .conflict_key(&["name_key"])
    }
}

impl fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

pub fn cases_table() -> TableSpec {
    TableSpec::new(tables::CASES)
        .id("id")
        .column("case_number", ColumnType::Text)
        .column("onset_date", ColumnType::Date)
        .column("notification_date", ColumnType::Date)
        .column("facility_id", ColumnType::BigInt)
        .column("sex", ColumnType::Text)
        .column("age", ColumnType::BigInt)
        .column("commune", ColumnType::Text)
        .conflict_key(&["case_number"])
        .references("facility_id", tables::FACILITIES)
}

pub fn case_symptoms_table() -> TableSpec {
    TableSpec::new(tables::CASE_SYMPTOMS)
        .column("case_id", ColumnType::BigInt)
        .column("symptom_id", ColumnType::BigInt)
        .conflict_key(&["case_id", "symptom_id"])
        .references("case_id", tables::CASES)
        .references("symptom_id", tables::SYMPTOMS)
}

pub fn case_samples_table() -> TableSpec {
    TableSpec::new(tables::CASE_SAMPLES)
        .id("id")
        .column("case_id", ColumnType::BigInt)
        .column("sample_number", ColumnType::Text)
        .column("sample_type_id", ColumnType::BigInt)
        .column("sample_date", ColumnType::Date)
        .column("facility_id", ColumnType::BigInt)
        .conflict_key(&["case_id", "sample_number"])
        .references("case_id", tables::CASES)
        .references("sample_type_id", tables::SAMPLE_TYPES)
        .references("facility_id", tables::FACILITIES)
}

pub fn case_diagnoses_table() -> TableSpec {
    TableSpec::new(tables::CASE_DIAGNOSES)
        .column("case_id", ColumnType::BigInt)
        .column("disease_id", ColumnType::BigInt)
        .column("classification", ColumnType::Text)
        .column("diagnosis_date", ColumnType::Date)
        .conflict_key(&["case_id", "disease_id"])
        .references("case_id", tables::CASES)
        .references("disease_id", tables::DISEASES)
}

pub fn case_vaccinations_table() -> TableSpec {
    TableSpec::new(tables::CASE_VACCINATIONS)
        .column("case_id", ColumnType::BigInt)
        .column("vaccine_id", ColumnType::BigInt)
        .column("dose", ColumnType::Text)
        .column("vaccination_date", ColumnType::Date)
        .conflict_key(&["case_id", "vaccine_id", "dose"])
        .references("case_id", tables::CASES)
        .references("vaccine_id", tables::VACCINES)
}

pub fn case_disease_groups_table() -> TableSpec {
    TableSpec::new(tables::CASE_DISEASE_GROUPS)
        .column("case_id", ColumnType::BigInt)
        .column("disease_group_id", ColumnType::BigInt)
        .conflict_key(&["case_id", "disease_group_id"])
        .references("case_id", tables::CASES)
        .references("disease_group_id", tables::DISEASE_GROUPS)
}

pub fn sample_results_table() -> TableSpec {
    TableSpec::new(tables::SAMPLE_RESULTS)
        .column("sample_id", ColumnType::BigInt)
        .column("test_method", ColumnType::Text)
        .column("result", ColumnType::Text)
        .column("pathogen_id", ColumnType::BigInt)
        .conflict_key(&["sample_id", "test_method"])
        .references("sample_id", tables::CASE_SAMPLES)
        .references("pathogen_id", tables::DISEASES)
}
