//! Phase-ordered batch ingest.
//!
//! 1. catalogs: resolve every reference label on the main session, then flush
//! 2. cases: aggregate, upsert and commit, then read the case ids back
//! 3. details: propagate the ids once, run independent operations on a
//!    bounded pool of worker sessions, then the dependent ones on the session
//!    that ran their dependency; all worker sessions commit together
//!
//! Only the orchestrator begins, commits, rolls back and toggles foreign-key
//! enforcement. Every session is restored to its prior enforcement state
//! before the batch returns, whatever the outcome.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use crate::batch::{natural_key, Batch, RawRow, Value};
use crate::config::IngestConfig;
use crate::database_ops::aggregate::aggregate;
use crate::database_ops::catalog::{collect_labels, resolve, CatalogIds};
use crate::database_ops::details::{DetailContext, DetailOperation};
use crate::database_ops::propagate::{propagate, IdentifierMapping};
use crate::database_ops::upsert::{as_millis, upsert, OperationResult};
use crate::error::{IngestError, Phase, Result, StoreError, StoreResult};
use crate::plan::IngestPlan;
use crate::progress::{notify, NoopProgress, ProgressSink};
use crate::store::{Session, Store, WriteCounts};

/// Outcome of a successful batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub rows: usize,
    /// Cases holding a store id after the case commit.
    pub cases: usize,
    /// Distinct case keys found in the batch.
    pub aggregated_cases: usize,
    /// Rows without a usable case key.
    pub unresolvable_rows: usize,
    /// Entries resolved per catalog table.
    pub catalogs: BTreeMap<String, usize>,
    /// Case relation first, then detail operations in plan order.
    pub operations: IndexMap<String, OperationResult>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

impl BatchSummary {
    pub fn totals(&self) -> WriteCounts {
        let mut totals = WriteCounts::default();
        for result in self.operations.values() {
            totals.add(WriteCounts {
                inserted: result.inserted_count,
                updated: result.updated_count,
                skipped: result.skipped_count,
            });
        }
        totals
    }
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    plan: IngestPlan,
    config: IngestConfig,
    progress: Arc<dyn ProgressSink>,
}

/// A detail session owned by one pool slot.
struct Worker {
    id: usize,
    session: Box<dyn Session>,
    prior_integrity: bool,
}

struct WorkerReport {
    worker: Worker,
    completed: Vec<(String, OperationResult)>,
    failure: Option<(String, StoreError)>,
}

type OpQueue = Arc<Mutex<VecDeque<Arc<dyn DetailOperation>>>>;

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, plan: IngestPlan, config: IngestConfig) -> Self {
        Self {
            store,
            plan,
            config,
            progress: Arc::new(NoopProgress),
        }
    }

    pub fn with_progress(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.progress = Arc::new(sink);
        self
    }

    pub fn plan(&self) -> &IngestPlan {
        &self.plan
    }

    fn notify(&self, percent: u8, message: &str) {
        notify(&*self.progress, percent, message);
    }

    /// Load one batch. Either every phase succeeds or the caller gets the
    /// first failure, tagged with its phase.
    #[instrument(skip_all, fields(rows = batch.len(), workers = self.config.workers))]
    pub async fn run(&self, batch: Batch) -> Result<BatchSummary> {
        self.plan.validate()?;
        let started = Instant::now();
        self.notify(0, "starting batch");

        let mut main = self
            .store
            .connect()
            .await
            .map_err(|e| IngestError::store(Phase::Connect, e))?;
        let prior = main
            .referential_integrity()
            .await
            .map_err(|e| IngestError::store(Phase::Connect, e))?;

        let outcome = self.load(&mut *main, Arc::new(batch)).await;
        let restored = restore(&mut *main, prior).await;
        let mut summary = combine(outcome, restored)?;

        summary.duration = started.elapsed();
        let totals = summary.totals();
        info!(
            cases = summary.cases,
            inserted = totals.inserted,
            updated = totals.updated,
            skipped = totals.skipped,
            elapsed_ms = summary.duration.as_millis() as u64,
            "batch ingest complete"
        );
        self.notify(100, "batch complete");
        Ok(summary)
    }

    async fn load(&self, main: &mut dyn Session, batch: Arc<Batch>) -> Result<BatchSummary> {
        let max_errors = self.config.max_error_messages;

        // phase 1: catalogs
        if self.config.suspend_referential_integrity {
            main.set_referential_integrity(false)
                .await
                .map_err(|e| IngestError::store(Phase::Catalogs, e))?;
        }
        main.begin()
            .await
            .map_err(|e| IngestError::store(Phase::Catalogs, e))?;
        self.notify(5, "resolving catalogs");

        let mut catalogs = CatalogIds::new();
        let mut catalog_sizes = BTreeMap::new();
        for (kind, seeds) in collect_labels(batch.rows(), &self.plan.catalogs) {
            let ids = resolve(main, kind, &seeds)
                .await
                .map_err(|e| IngestError::operation(Phase::Catalogs, kind.table_name(), e))?;
            catalog_sizes.insert(kind.table_name().to_string(), ids.len());
            catalogs.insert(kind, ids);
        }
        main.flush()
            .await
            .map_err(|e| IngestError::store(Phase::Catalogs, e))?;
        info!(catalogs = catalog_sizes.len(), "catalogs resolved");
        self.notify(30, "catalogs resolved");

        // phase 2: cases
        let key_column = self.plan.case_key_column.as_str();
        let aggregation = aggregate(
            batch.rows(),
            |row: &RawRow| natural_key(row, key_column),
            &self.plan.rules,
            &catalogs,
        );
        let case_table = &self.plan.cases.table;
        let key_target = self
            .plan
            .case_key_target()
            .ok_or_else(|| IngestError::Plan("case relation lost its key".into()))?;
        let case_rows: Vec<Vec<Value>> = aggregation
            .cases
            .iter()
            .map(|case| case.to_row(case_table, key_target))
            .collect();
        let case_result = upsert(main, &self.plan.cases, case_rows.into(), max_errors)
            .await
            .map_err(|e| IngestError::operation(Phase::Cases, case_table.name.as_str(), e))?;
        main.commit()
            .await
            .map_err(|e| IngestError::store(Phase::Cases, e))?;
        info!(
            cases = aggregation.cases.len(),
            unresolvable = aggregation.unresolvable_rows,
            "cases committed"
        );
        self.notify(55, "cases committed");

        // phase 3: details
        let keys: Vec<Vec<Value>> = aggregation
            .cases
            .iter()
            .map(|case| vec![Value::from(case.natural_key.as_str())])
            .collect();
        let mapping = IdentifierMapping::from_pairs(
            main.select_ids(case_table, &keys)
                .await
                .map_err(|e| IngestError::store(Phase::Details, e))?,
        );
        let case_count = aggregation.cases.len();
        let mapped = mapping.len();
        if mapped < case_count {
            warn!(
                cases = case_count,
                mapped,
                "some cases have no id after commit"
            );
        }
        let ctx = Arc::new(DetailContext {
            propagated: propagate(Arc::clone(&batch), &mapping, key_column),
            catalogs,
            cases: aggregation.cases,
            mapping,
            max_errors,
        });
        let mut detail_results = self.run_details(ctx).await?;
        self.notify(95, "details committed");

        let mut operations = IndexMap::new();
        operations.insert(case_table.name.clone(), case_result);
        for op in &self.plan.details {
            let result = detail_results.remove(op.name()).unwrap_or_default();
            operations.insert(op.name().to_string(), result);
        }

        Ok(BatchSummary {
            rows: batch.len(),
            cases: mapped,
            aggregated_cases: case_count,
            unresolvable_rows: aggregation.unresolvable_rows,
            catalogs: catalog_sizes,
            operations,
            duration: Duration::ZERO,
        })
    }

    async fn run_details(
        &self,
        ctx: Arc<DetailContext>,
    ) -> Result<HashMap<String, OperationResult>> {
        let independent: Vec<Arc<dyn DetailOperation>> = self.plan.independent().cloned().collect();
        if independent.is_empty() {
            return Ok(HashMap::new());
        }
        let count = self.config.workers.min(independent.len()).max(1);

        let mut workers = Vec::with_capacity(count);
        let mut outcome = self.open_workers(count, &mut workers).await.map(|()| HashMap::new());
        if outcome.is_ok() {
            let (returned, result) = self.schedule(workers, independent, ctx).await;
            workers = returned;
            outcome = result;
        }
        if outcome.is_ok() {
            if let Err(err) = commit_all(&mut workers).await {
                outcome = Err(err);
            }
        }
        let restored = release(workers).await;
        combine(outcome, restored)
    }

    async fn open_workers(&self, count: usize, workers: &mut Vec<Worker>) -> Result<()> {
        let connect = |e| IngestError::store(Phase::Connect, e);
        let prepare = |e| IngestError::store(Phase::Details, e);
        for id in 0..count {
            let mut session = self.store.connect().await.map_err(connect)?;
            let prior_integrity = session.referential_integrity().await.map_err(connect)?;
            workers.push(Worker {
                id,
                session,
                prior_integrity,
            });
            let session = &mut workers[id].session;
            if self.config.suspend_referential_integrity {
                session.set_referential_integrity(false).await.map_err(prepare)?;
            }
            session.begin().await.map_err(prepare)?;
        }
        Ok(())
    }

    /// Run the independent operations, then the dependent ones. Returns every
    /// worker whose task finished, successful or not.
    async fn schedule(
        &self,
        workers: Vec<Worker>,
        independent: Vec<Arc<dyn DetailOperation>>,
        ctx: Arc<DetailContext>,
    ) -> (Vec<Worker>, Result<HashMap<String, OperationResult>>) {
        let mut results = HashMap::new();
        self.notify(60, "running detail operations");

        let queue: OpQueue = Arc::new(Mutex::new(independent.into_iter().collect()));
        let mut tasks = JoinSet::new();
        for worker in workers {
            tasks.spawn(drain(worker, Arc::clone(&queue), Arc::clone(&ctx)));
        }
        let (workers, failure, home) = join_workers(&mut tasks, Phase::Details, &mut results).await;
        if let Some(err) = failure {
            return (workers, Err(err));
        }

        let mut by_worker: BTreeMap<usize, VecDeque<Arc<dyn DetailOperation>>> = BTreeMap::new();
        for op in self.plan.dependent() {
            let Some(&worker_id) = op.depends_on().and_then(|dep| home.get(dep)) else {
                let err = IngestError::Plan(format!("{} has no completed dependency", op.name()));
                return (workers, Err(err));
            };
            by_worker.entry(worker_id).or_default().push_back(Arc::clone(op));
        }
        if by_worker.is_empty() {
            return (workers, Ok(results));
        }
        self.notify(80, "running dependent detail operations");

        let mut idle = Vec::new();
        for worker in workers {
            match by_worker.remove(&worker.id) {
                Some(ops) => {
                    tasks.spawn(drain(worker, Arc::new(Mutex::new(ops)), Arc::clone(&ctx)));
                }
                None => idle.push(worker),
            }
        }
        let (mut workers, failure, _) =
            join_workers(&mut tasks, Phase::DependentDetails, &mut results).await;
        workers.extend(idle);
        workers.sort_by_key(|w| w.id);
        match failure {
            Some(err) => (workers, Err(err)),
            None => (workers, Ok(results)),
        }
    }
}

/// Pull operations off `queue` until it is empty or one fails.
async fn drain(mut worker: Worker, queue: OpQueue, ctx: Arc<DetailContext>) -> WorkerReport {
    let mut completed = Vec::new();
    loop {
        let next = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some(op) = next else {
            break;
        };
        let started = Instant::now();
        match op.run(&mut *worker.session, &ctx).await {
            Ok(result) => {
                info!(
                    worker = worker.id,
                    operation = op.name(),
                    inserted = result.inserted_count,
                    updated = result.updated_count,
                    skipped = result.skipped_count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "detail operation complete"
                );
                completed.push((op.name().to_string(), result));
            }
            Err(err) => {
                error!(
                    worker = worker.id,
                    operation = op.name(),
                    error = %err,
                    "detail operation failed"
                );
                return WorkerReport {
                    worker,
                    completed,
                    failure: Some((op.name().to_string(), err)),
                };
            }
        }
    }
    WorkerReport {
        worker,
        completed,
        failure: None,
    }
}

/// Wait for every task. The first failure cancels the rest; cancelled tasks
/// drop their sessions mid-transaction, which closes those connections.
/// Returns the surviving workers, the first failure and the worker that ran
/// each completed operation.
async fn join_workers(
    tasks: &mut JoinSet<WorkerReport>,
    phase: Phase,
    results: &mut HashMap<String, OperationResult>,
) -> (Vec<Worker>, Option<IngestError>, HashMap<String, usize>) {
    let mut workers = Vec::new();
    let mut first_error = None;
    let mut home = HashMap::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => {
                for (name, result) in report.completed {
                    home.insert(name.clone(), report.worker.id);
                    results.insert(name, result);
                }
                if let Some((operation, err)) = report.failure {
                    if first_error.is_none() {
                        first_error = Some(IngestError::operation(phase, operation, err));
                        tasks.abort_all();
                    }
                }
                workers.push(report.worker);
            }
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => {
                error!(%phase, error = %join_err, "worker task panicked");
                if first_error.is_none() {
                    first_error = Some(IngestError::Worker {
                        phase,
                        message: join_err.to_string(),
                    });
                    tasks.abort_all();
                }
            }
        }
    }
    workers.sort_by_key(|w| w.id);
    (workers, first_error, home)
}

async fn commit_all(workers: &mut [Worker]) -> Result<()> {
    for worker in workers.iter_mut() {
        // sessions after a failed commit stay open and are rolled back on release
        worker
            .session
            .commit()
            .await
            .map_err(|e| IngestError::store(Phase::Commit, e))?;
    }
    Ok(())
}

async fn release(workers: Vec<Worker>) -> StoreResult<()> {
    let mut first = Ok(());
    for mut worker in workers {
        let restored = restore(&mut *worker.session, worker.prior_integrity).await;
        if let Err(err) = restored {
            warn!(worker = worker.id, error = %err, "failed to restore worker session");
            if first.is_ok() {
                first = Err(err);
            }
        }
    }
    first
}

/// Roll back whatever is still open, then put enforcement back.
async fn restore(session: &mut dyn Session, prior: bool) -> StoreResult<()> {
    if session.in_transaction() {
        if let Err(err) = session.rollback().await {
            warn!(error = %err, "rollback before restore failed");
        }
    }
    session.set_referential_integrity(prior).await
}

fn combine<T>(outcome: Result<T>, restored: StoreResult<()>) -> Result<T> {
    match (outcome, restored) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(IngestError::Restore(err)),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(restore_err)) => {
            error!(
                error = %restore_err,
                "failed to restore referential integrity after batch failure"
            );
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{self, columns, tables};
    use crate::store::memory::MemoryStore;
    use crate::store::ConflictPolicy;

    fn orchestrator(store: &MemoryStore, config: IngestConfig) -> Orchestrator {
        Orchestrator::new(Arc::new(store.clone()), IngestPlan::surveillance(), config)
    }

    fn scenario() -> Batch {
        Batch::new(vec![
            RawRow::new()
                .with(columns::CASE_NUMBER, "42")
                .with(columns::SYMPTOM, "FIEBRE")
                .with(columns::FACILITY, "Hospital El Pino")
                .with(columns::FACILITY_CODE, "109-101")
                .with(columns::SYMPTOM_ONSET_DATE, "2024-03-05")
                .with(columns::DISEASE_GROUP, "IRAG"),
            RawRow::new()
                .with(columns::CASE_NUMBER, "42")
                .with(columns::SYMPTOM, "TOS")
                .with(columns::CONSULTATION_DATE, "2024-03-01"),
            RawRow::new()
                .with(columns::CASE_NUMBER, "42")
                .with(columns::SAMPLE_NUMBER, "M-1")
                .with(columns::SAMPLE_TYPE, "Hisopado nasofaríngeo")
                .with(columns::TEST_METHOD, "PCR")
                .with(columns::TEST_RESULT, "positivo")
                .with(columns::PATHOGEN, "Influenza A"),
        ])
    }

    fn wide_batch() -> Batch {
        let symptoms = ["FIEBRE", "TOS", "Odinofagia", "Mialgia"];
        let mut rows = Vec::new();
        for case in 0..24 {
            let key = format!("{}", 1000 + case);
            for (i, symptom) in symptoms.iter().enumerate().take(1 + case % 4) {
                rows.push(
                    RawRow::new()
                        .with(columns::CASE_NUMBER, key.as_str())
                        .with(columns::SYMPTOM, *symptom)
                        .with(
                            columns::FACILITY,
                            if case % 2 == 0 {
                                "CESFAM Norte"
                            } else {
                                "Hospital Regional"
                            },
                        )
                        .with(
                            columns::NOTIFICATION_DATE,
                            format!("2024-04-{:02}", 1 + (case + i) % 28),
                        )
                        .with(columns::DISEASE_GROUP, if i % 2 == 0 { "IRAG" } else { "ETI" }),
                );
            }
            rows.push(
                RawRow::new()
                    .with(columns::CASE_NUMBER, key.as_str())
                    .with(columns::SAMPLE_NUMBER, format!("S-{case}"))
                    .with(columns::SAMPLE_TYPE, "Aspirado")
                    .with(columns::TEST_RESULT, if case % 3 == 0 { "positivo" } else { "negativo" })
                    .with(columns::PATHOGEN, "SARS-CoV-2")
                    .with(columns::DIAGNOSIS, "COVID-19")
                    .with(columns::CLASSIFICATION, "confirmado")
                    .with(columns::VACCINE, "SARS-CoV-2")
                    .with(columns::VACCINE_DOSE, "2"),
            );
        }
        rows.push(RawRow::new().with(columns::SYMPTOM, "FIEBRE"));
        Batch::new(rows)
    }

    fn table_counts(store: &MemoryStore) -> Vec<(&'static str, usize)> {
        [
            tables::CASES,
            tables::CASE_SYMPTOMS,
            tables::CASE_SAMPLES,
            tables::CASE_DIAGNOSES,
            tables::CASE_VACCINATIONS,
            tables::CASE_DISEASE_GROUPS,
            tables::SAMPLE_RESULTS,
        ]
        .into_iter()
        .map(|t| (t, store.row_count(t)))
        .collect()
    }

    #[tokio::test]
    async fn three_rows_sharing_a_key_become_one_case() {
        let store = MemoryStore::new();
        let summary = orchestrator(&store, IngestConfig::default())
            .run(scenario())
            .await
            .unwrap();

        assert_eq!(summary.cases, 1);
        let cases = store.rows_with_ids(tables::CASES);
        assert_eq!(cases.len(), 1);
        let (case_id, case_row) = &cases[0];
        assert_eq!(case_row[0], Value::from("42"));
        assert_eq!(
            case_row[1],
            Value::Date(chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );

        let symptoms = store.rows(tables::CASE_SYMPTOMS);
        assert_eq!(symptoms.len(), 2);
        assert!(symptoms.iter().all(|row| row[0] == Value::Int(*case_id)));
        let samples = store.rows(tables::CASE_SAMPLES);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0][0], Value::Int(*case_id));
        assert_eq!(store.row_count(tables::SAMPLE_RESULTS), 1);
        assert_eq!(store.row_count(tables::CASE_DISEASE_GROUPS), 1);

        assert_eq!(summary.operations[tables::CASE_SYMPTOMS].inserted_count, 2);
        assert_eq!(summary.operations.get_index(0).map(|(k, _)| k.as_str()), Some(tables::CASES));
        assert!(store.pool_enforces_referential_integrity());
    }

    #[tokio::test]
    async fn rerunning_a_batch_is_idempotent() {
        let store = MemoryStore::new();
        let orchestrator = orchestrator(&store, IngestConfig::default());
        orchestrator.run(scenario()).await.unwrap();
        let before = table_counts(&store);
        let catalogs_before = store.row_count(tables::SYMPTOMS);

        let second = orchestrator.run(scenario()).await.unwrap();
        assert_eq!(table_counts(&store), before);
        assert_eq!(store.row_count(tables::SYMPTOMS), catalogs_before);
        assert_eq!(second.totals().inserted, 0);
        let symptoms = &second.operations[tables::CASE_SYMPTOMS];
        assert_eq!((symptoms.inserted_count, symptoms.skipped_count), (0, 2));
        let cases = &second.operations[tables::CASES];
        assert_eq!((cases.inserted_count, cases.updated_count), (0, 1));
    }

    #[tokio::test]
    async fn worker_count_does_not_change_counts() {
        let mut baseline: Option<(BatchSummary, Vec<(&str, usize)>)> = None;
        for workers in [1, 4, 12] {
            let store = MemoryStore::new();
            let summary = orchestrator(&store, IngestConfig::default().with_workers(workers))
                .run(wide_batch())
                .await
                .unwrap();
            let counts = table_counts(&store);
            match &baseline {
                None => baseline = Some((summary, counts)),
                Some((expected, expected_counts)) => {
                    assert_eq!(&counts, expected_counts, "workers = {workers}");
                    for (name, result) in &expected.operations {
                        assert!(
                            result.same_counts(&summary.operations[name]),
                            "{name} differs with {workers} workers"
                        );
                    }
                }
            }
        }
        let (summary, _) = baseline.unwrap();
        assert_eq!(summary.cases, 24);
        assert_eq!(summary.unresolvable_rows, 1);
        assert_eq!(summary.operations[tables::SAMPLE_RESULTS].inserted_count, 24);
    }

    async fn assert_fails_in(table: &str, phase: Phase) -> MemoryStore {
        let store = MemoryStore::new();
        store.fail_next_insert(table, "injected failure");
        let err = orchestrator(&store, IngestConfig::default())
            .run(wide_batch())
            .await
            .unwrap_err();
        assert_eq!(err.phase(), Some(phase), "{err}");
        assert!(store.pool_enforces_referential_integrity());

        // an unrelated orphan write is rejected again
        let mut session = store.connect().await.unwrap();
        assert!(session.referential_integrity().await.unwrap());
        let orphan = session
            .insert(
                &schema::case_symptoms_table(),
                &[vec![Value::Int(9_999), Value::Int(9_999)]],
                &ConflictPolicy::Ignore,
            )
            .await;
        assert!(matches!(orphan, Err(StoreError::Constraint { .. })));
        store
    }

    #[tokio::test]
    async fn catalog_failure_rolls_back_everything() {
        let store = assert_fails_in(tables::SYMPTOMS, Phase::Catalogs).await;
        assert_eq!(store.row_count(tables::FACILITIES), 0);
        assert_eq!(store.row_count(tables::CASES), 0);
    }

    #[tokio::test]
    async fn case_failure_rolls_back_catalogs_and_cases() {
        let store = assert_fails_in(tables::CASES, Phase::Cases).await;
        assert_eq!(store.row_count(tables::SYMPTOMS), 0);
        assert_eq!(store.row_count(tables::CASES), 0);
    }

    #[tokio::test]
    async fn detail_failure_rolls_back_every_detail() {
        let store = assert_fails_in(tables::CASE_DIAGNOSES, Phase::Details).await;
        assert_eq!(store.row_count(tables::CASES), 24);
        for table in [
            tables::CASE_SYMPTOMS,
            tables::CASE_SAMPLES,
            tables::CASE_DIAGNOSES,
            tables::CASE_VACCINATIONS,
            tables::CASE_DISEASE_GROUPS,
        ] {
            assert_eq!(store.row_count(table), 0, "{table}");
        }
    }

    #[tokio::test]
    async fn dependent_failure_rolls_back_its_dependency() {
        let store = assert_fails_in(tables::SAMPLE_RESULTS, Phase::DependentDetails).await;
        assert_eq!(store.row_count(tables::CASE_SAMPLES), 0);
        assert_eq!(store.row_count(tables::SAMPLE_RESULTS), 0);
    }

    #[tokio::test]
    async fn worker_setup_failure_is_a_detail_failure() {
        let store = MemoryStore::new();
        // the main session begins once; the second begin opens the first worker
        store.fail_begin(2, "too many connections");
        let err = orchestrator(&store, IngestConfig::default())
            .run(wide_batch())
            .await
            .unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Details), "{err}");
        assert_eq!(store.row_count(tables::CASES), 24);
        assert_eq!(store.row_count(tables::CASE_SYMPTOMS), 0);
        assert!(store.pool_enforces_referential_integrity());
    }

    #[tokio::test]
    async fn unreadable_optional_value_does_not_drop_the_case() {
        let store = MemoryStore::new();
        let batch = Batch::new(vec![
            RawRow::new()
                .with(columns::CASE_NUMBER, "42")
                .with(columns::AGE, "desconocido")
                .with(columns::SYMPTOM, "FIEBRE"),
            RawRow::new()
                .with(columns::CASE_NUMBER, "42")
                .with(columns::AGE, "34")
                .with(columns::SYMPTOM, "TOS"),
        ]);
        let summary = orchestrator(&store, IngestConfig::default())
            .run(batch)
            .await
            .unwrap();

        assert_eq!((summary.cases, summary.aggregated_cases), (1, 1));
        assert!(summary.operations[tables::CASES].errors.is_empty());
        let cases = store.rows(tables::CASES);
        assert_eq!(cases.len(), 1);
        let age = schema::cases_table().column_index("age").unwrap();
        assert_eq!(cases[0][age], Value::Int(34));
        assert_eq!(store.row_count(tables::CASE_SYMPTOMS), 2);
    }

    #[tokio::test]
    async fn dependent_rows_resolve_with_enforcement_on() {
        let store = MemoryStore::new();
        let config = IngestConfig::default().with_suspended_referential_integrity(false);
        orchestrator(&store, config).run(wide_batch()).await.unwrap();

        let sample_ids: Vec<i64> = store
            .rows_with_ids(tables::CASE_SAMPLES)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let results = store.rows(tables::SAMPLE_RESULTS);
        assert_eq!(results.len(), 24);
        for row in results {
            let sample_id = row[0].as_i64().unwrap();
            assert!(sample_ids.contains(&sample_id));
        }
    }

    #[tokio::test]
    async fn failing_progress_sink_does_not_fail_the_batch() {
        let store = MemoryStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let summary = orchestrator(&store, IngestConfig::default())
            .with_progress(move |percent: u8, _: &str| -> anyhow::Result<()> {
                recorder.lock().unwrap().push(percent);
                anyhow::bail!("progress channel closed")
            })
            .run(scenario())
            .await
            .unwrap();
        assert_eq!(summary.cases, 1);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn invalid_plan_fails_before_connecting() {
        let store = MemoryStore::new();
        let mut plan = IngestPlan::surveillance();
        plan.details.retain(|op| op.name() != tables::CASE_SAMPLES);
        let err = Orchestrator::new(Arc::new(store.clone()), plan, IngestConfig::default())
            .run(scenario())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Plan(_)));
        assert_eq!(store.stats().connections_opened, 0);
    }

    #[tokio::test]
    async fn empty_batch_commits_nothing() {
        let store = MemoryStore::new();
        let summary = orchestrator(&store, IngestConfig::default())
            .run(Batch::default())
            .await
            .unwrap();
        assert_eq!(summary.cases, 0);
        assert_eq!(summary.totals(), WriteCounts::default());
        assert!(table_counts(&store).iter().all(|(_, n)| *n == 0));
    }

    #[test]
    fn summary_serializes_duration_in_millis() {
        let summary = BatchSummary {
            rows: 3,
            cases: 1,
            aggregated_cases: 1,
            unresolvable_rows: 0,
            catalogs: BTreeMap::new(),
            operations: IndexMap::new(),
            duration: Duration::from_millis(1_500),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["duration_ms"], 1_500);
        assert_eq!(json["cases"], 1);
    }
}
