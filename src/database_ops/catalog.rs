//! Get-or-create resolution of free-text reference labels.
//!
//! Each catalog is resolved with one lookup, one bulk insert-or-ignore for the
//! unseen keys and one re-read of the full key set, so rows written by a
//! concurrent resolver for the same catalog end up in the mapping too.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, instrument};

use crate::batch::{RawRow, Value};
use crate::error::{StoreError, StoreResult};
use crate::normalization::text::{normalize, slug, SlugAllocator};
use crate::schema::CatalogKind;
use crate::store::{ConflictPolicy, Session};

/// Where the labels of one catalog come from in the extract.
#[derive(Debug, Clone)]
pub struct CatalogSource {
    pub kind: CatalogKind,
    pub label_column: String,
    /// Column appended to the slug to tell apart entities sharing a name.
    pub disambiguator_column: Option<String>,
}

impl CatalogSource {
    pub fn new(kind: CatalogKind, label_column: &str) -> Self {
        Self {
            kind,
            label_column: label_column.to_string(),
            disambiguator_column: None,
        }
    }

    pub fn disambiguated_by(mut self, column: &str) -> Self {
        self.disambiguator_column = Some(column.to_string());
        self
    }
}

/// First label and disambiguator observed for a normalized key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogSeed {
    pub label: String,
    pub disambiguator: Option<String>,
}

pub type CatalogSeeds = BTreeMap<String, CatalogSeed>;

/// Collect the distinct labels of every configured catalog, keyed by
/// normalized label. Blank labels are skipped.
pub fn collect_labels(
    rows: &[RawRow],
    sources: &[CatalogSource],
) -> BTreeMap<CatalogKind, CatalogSeeds> {
    let mut out: BTreeMap<CatalogKind, CatalogSeeds> = BTreeMap::new();
    for source in sources {
        let seeds = out.entry(source.kind).or_default();
        for row in rows {
            let Some(label) = row.text(&source.label_column) else {
                continue;
            };
            let key = normalize(&label);
            if key.is_empty() {
                continue;
            }
            seeds.entry(key).or_insert_with(|| CatalogSeed {
                label: label.into_owned(),
                disambiguator: source
                    .disambiguator_column
                    .as_deref()
                    .and_then(|c| row.text(c))
                    .map(|d| d.into_owned()),
            });
        }
    }
    out
}

/// Resolve plain labels, the `resolve(labels, catalog)` shape.
pub async fn resolve_labels<I, S>(
    session: &mut dyn Session,
    kind: CatalogKind,
    labels: I,
) -> StoreResult<HashMap<String, i64>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seeds = CatalogSeeds::new();
    for label in labels {
        let label = label.as_ref();
        let key = normalize(label);
        if key.is_empty() {
            continue;
        }
        seeds.entry(key).or_insert_with(|| CatalogSeed {
            label: label.trim().to_string(),
            disambiguator: None,
        });
    }
    resolve(session, kind, &seeds).await
}

/// Resolve seeds to surrogate ids, creating the missing entries.
///
/// The returned map is keyed by normalized label and is total over `seeds`;
/// anything less is reported as `IncompleteCatalog` because downstream joins
/// would silently drop rows.
#[instrument(skip(session, seeds), fields(catalog = %kind, labels = seeds.len()))]
pub async fn resolve(
    session: &mut dyn Session,
    kind: CatalogKind,
    seeds: &CatalogSeeds,
) -> StoreResult<HashMap<String, i64>> {
    if seeds.is_empty() {
        return Ok(HashMap::new());
    }
    let table = kind.table();
    let keys: Vec<Vec<Value>> = seeds.keys().map(|k| vec![Value::from(k.as_str())]).collect();

    let existing = key_map(session.select_ids(&table, &keys).await?);
    let mut slugs = SlugAllocator::new();
    let missing: Vec<Vec<Value>> = seeds
        .iter()
        .filter(|(key, _)| !existing.contains_key(*key))
        .map(|(key, seed)| {
            let unique_slug = slugs.allocate(&slug(&seed.label, seed.disambiguator.as_deref()));
            vec![
                Value::from(key.as_str()),
                Value::from(seed.label.as_str()),
                Value::from(unique_slug),
            ]
        })
        .collect();

    if missing.is_empty() {
        debug!(existing = existing.len(), "catalog already complete");
        return Ok(existing);
    }

    // a concurrent resolver may win the race for some keys; those rows are
    // dropped here and picked up by the re-read below
    let counts = session
        .insert(&table, &missing, &ConflictPolicy::Ignore)
        .await?;

    let resolved = key_map(session.select_ids(&table, &keys).await?);
    let unresolved = seeds.keys().filter(|k| !resolved.contains_key(*k)).count();
    if unresolved > 0 {
        return Err(StoreError::IncompleteCatalog {
            catalog: kind.to_string(),
            missing: unresolved,
        });
    }
    info!(
        existing = existing.len(),
        created = counts.inserted,
        raced = counts.skipped,
        "catalog resolved"
    );
    Ok(resolved)
}

fn key_map(pairs: Vec<(Vec<Value>, i64)>) -> HashMap<String, i64> {
    pairs
        .into_iter()
        .filter_map(|(key, id)| {
            let text = key.first()?.as_text()?.into_owned();
            Some((text, id))
        })
        .collect()
}

/// Label-to-id mappings of every catalog for one batch.
#[derive(Debug, Clone, Default)]
pub struct CatalogIds {
    by_kind: HashMap<CatalogKind, HashMap<String, i64>>,
}

impl CatalogIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: CatalogKind, ids: HashMap<String, i64>) {
        self.by_kind.entry(kind).or_default().extend(ids);
    }

    /// Id of a raw label; the label is normalized before lookup.
    pub fn id(&self, kind: CatalogKind, label: &str) -> Option<i64> {
        let key = normalize(label);
        if key.is_empty() {
            return None;
        }
        self.by_kind.get(&kind)?.get(&key).copied()
    }

    /// Id of the label found in `column` of `row`.
    pub fn id_in(&self, kind: CatalogKind, row: &RawRow, column: &str) -> Option<i64> {
        row.text(column).and_then(|label| self.id(kind, &label))
    }

    pub fn len(&self, kind: CatalogKind) -> usize {
        self.by_kind.get(&kind).map_or(0, HashMap::len)
    }
}
