//! Postgres store over a `sqlx` pool.
//!
//! Foreign-key enforcement is suspended per connection with
//! `session_replication_role = replica`, which disables the FK triggers for
//! that session only.

use async_trait::async_trait;
use itertools::Itertools;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::query_builder::Separated;
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use tracing::{debug, instrument, warn};

use crate::batch::Value;
use crate::error::{StoreError, StoreResult};
use crate::store::{ColumnType, ConflictPolicy, Session, Store, TableSpec, WriteCounts};
use crate::util::db::Db;

/// Postgres caps a statement at 65 535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn connect(&self) -> StoreResult<Box<dyn Session>> {
        let conn = self.db.pool.acquire().await?;
        Ok(Box::new(PgSession {
            conn: Some(conn),
            in_tx: false,
            aborted: false,
        }))
    }
}

pub struct PgSession {
    conn: Option<PoolConnection<Postgres>>,
    in_tx: bool,
    aborted: bool,
}

/// Quote an identifier, keeping an optional schema qualifier.
fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .join(".")
}

fn bind_cell<Sep: std::fmt::Display>(
    b: &mut Separated<'_, '_, Postgres, Sep>,
    ty: ColumnType,
    value: &Value,
) {
    match ty {
        ColumnType::Text => b.push_bind(value.as_text().map(|t| t.into_owned())),
        ColumnType::BigInt => b.push_bind(value.as_i64()),
        ColumnType::Double => b.push_bind(value.as_f64()),
        ColumnType::Bool => b.push_bind(value.as_bool()),
        ColumnType::Date => b.push_bind(value.as_date()),
    };
}

fn decode_cell(row: &PgRow, idx: usize, ty: ColumnType) -> Result<Value, sqlx::Error> {
    Ok(match ty {
        ColumnType::Text => row.try_get::<Option<String>, _>(idx)?.into(),
        ColumnType::BigInt => row.try_get::<Option<i64>, _>(idx)?.into(),
        ColumnType::Double => row
            .try_get::<Option<f64>, _>(idx)?
            .map_or(Value::Null, Value::Float),
        ColumnType::Bool => row
            .try_get::<Option<bool>, _>(idx)?
            .map_or(Value::Null, Value::Bool),
        ColumnType::Date => row.try_get::<Option<chrono::NaiveDate>, _>(idx)?.into(),
    })
}

fn insert_statement<'a>(
    table: &TableSpec,
    rows: &'a [Vec<Value>],
    policy: &ConflictPolicy,
) -> QueryBuilder<'a, Postgres> {
    let columns = table.columns.iter().map(|c| quote_ident(&c.name)).join(", ");
    let mut qb: QueryBuilder<'a, Postgres> =
        QueryBuilder::new(format!("INSERT INTO {} ({}) ", quote_ident(&table.name), columns));
    qb.push_values(rows.iter(), |mut b, row| {
        for (column, value) in table.columns.iter().zip(row.iter()) {
            bind_cell(&mut b, column.ty, value);
        }
    });

    let conflict = table.conflict_key.iter().map(|c| quote_ident(c)).join(", ");
    match policy {
        _ if table.conflict_key.is_empty() => {}
        ConflictPolicy::Merge { update } if !update.is_empty() => {
            let assignments = update
                .iter()
                .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
                .join(", ");
            qb.push(format!(" ON CONFLICT ({conflict}) DO UPDATE SET {assignments}"));
        }
        _ => {
            qb.push(format!(" ON CONFLICT ({conflict}) DO NOTHING"));
        }
    }
    // xmax is zero only for freshly inserted tuples
    qb.push(" RETURNING (xmax = 0) AS inserted");
    qb
}

impl PgSession {
    fn conn(&mut self) -> StoreResult<&mut PgConnection> {
        self.conn.as_deref_mut().ok_or(StoreError::Closed)
    }

    fn ensure_usable(&self) -> StoreResult<()> {
        if self.aborted {
            Err(StoreError::TransactionAborted)
        } else {
            Ok(())
        }
    }

    /// Record a failed statement; inside a transaction it leaves it aborted.
    fn track<T>(&mut self, result: Result<T, sqlx::Error>) -> StoreResult<T> {
        result.map_err(|err| {
            if self.in_tx {
                self.aborted = true;
            }
            StoreError::from(err)
        })
    }

    async fn execute_raw(&mut self, sql: &str) -> StoreResult<()> {
        let res = sqlx::query(sql)
            .persistent(false)
            .execute(self.conn()?)
            .await;
        self.track(res).map(|_| ())
    }
}

#[async_trait]
impl Session for PgSession {
    async fn begin(&mut self) -> StoreResult<()> {
        if self.in_tx {
            return Err(StoreError::TransactionInProgress);
        }
        self.execute_raw("BEGIN").await?;
        self.in_tx = true;
        self.aborted = false;
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        if !self.in_tx {
            return Err(StoreError::NoTransaction);
        }
        let was_aborted = self.aborted;
        // COMMIT of an aborted transaction is answered with ROLLBACK by the server
        let res = sqlx::query("COMMIT")
            .persistent(false)
            .execute(self.conn()?)
            .await;
        self.in_tx = false;
        self.aborted = false;
        res?;
        if was_aborted {
            return Err(StoreError::TransactionAborted);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        if !self.in_tx {
            return Err(StoreError::NoTransaction);
        }
        let res = sqlx::query("ROLLBACK")
            .persistent(false)
            .execute(self.conn()?)
            .await;
        self.in_tx = false;
        self.aborted = false;
        res?;
        Ok(())
    }

    async fn flush(&mut self) -> StoreResult<()> {
        // executed statements are already visible inside their own transaction
        self.ensure_usable()
    }

    fn in_transaction(&self) -> bool {
        self.in_tx
    }

    fn is_aborted(&self) -> bool {
        self.aborted
    }

    async fn referential_integrity(&mut self) -> StoreResult<bool> {
        self.ensure_usable()?;
        let res = sqlx::query_scalar::<_, String>("SHOW session_replication_role")
            .persistent(false)
            .fetch_one(self.conn()?)
            .await;
        let role = self.track(res)?;
        Ok(role != "replica")
    }

    #[instrument(skip(self))]
    async fn set_referential_integrity(&mut self, enforced: bool) -> StoreResult<()> {
        self.ensure_usable()?;
        let role = if enforced { "origin" } else { "replica" };
        self.execute_raw(&format!("SET session_replication_role = {role}"))
            .await
    }

    #[instrument(skip(self, table, keys), fields(table = %table.name, keys = keys.len()))]
    async fn select_ids(
        &mut self,
        table: &TableSpec,
        keys: &[Vec<Value>],
    ) -> StoreResult<Vec<(Vec<Value>, i64)>> {
        self.ensure_usable()?;
        let Some(id_column) = table.id_column.as_deref() else {
            return Err(StoreError::NoIdColumn(table.name.clone()));
        };
        let types = table.key_types();
        if keys.is_empty() || types.is_empty() {
            return Ok(Vec::new());
        }
        let key_columns = table.conflict_key.iter().map(|c| quote_ident(c)).join(", ");

        let mut found = Vec::with_capacity(keys.len());
        for chunk in keys.chunks((MAX_BIND_PARAMS / types.len()).max(1)) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
                "SELECT {key_columns}, {} FROM {} WHERE ({key_columns}) IN ",
                quote_ident(id_column),
                quote_ident(&table.name),
            ));
            qb.push_tuples(chunk.iter(), |mut b, key| {
                for (value, ty) in key.iter().zip(&types) {
                    bind_cell(&mut b, *ty, value);
                }
            });
            let res = qb.build().persistent(false).fetch_all(self.conn()?).await;
            let rows = self.track(res)?;
            for row in rows {
                let key = types
                    .iter()
                    .enumerate()
                    .map(|(i, ty)| decode_cell(&row, i, *ty))
                    .collect::<Result<Vec<_>, _>>()?;
                let id: i64 = row.try_get(types.len())?;
                found.push((key, id));
            }
        }
        debug!(found = found.len(), "selected ids");
        Ok(found)
    }

    #[instrument(skip(self, table, rows, policy), fields(table = %table.name, rows = rows.len()))]
    async fn insert(
        &mut self,
        table: &TableSpec,
        rows: &[Vec<Value>],
        policy: &ConflictPolicy,
    ) -> StoreResult<WriteCounts> {
        self.ensure_usable()?;
        let width = table.columns.len();
        if let Some(bad) = rows.iter().find(|r| r.len() != width) {
            return Err(StoreError::Arity {
                table: table.name.clone(),
                expected: width,
                actual: bad.len(),
            });
        }

        let mut counts = WriteCounts::default();
        for chunk in rows.chunks((MAX_BIND_PARAMS / width.max(1)).max(1)) {
            let mut qb = insert_statement(table, chunk, policy);
            let res = qb.build().persistent(false).fetch_all(self.conn()?).await;
            let returned = self.track(res)?;
            let mut inserted = 0u64;
            for row in &returned {
                if row.try_get::<bool, _>(0)? {
                    inserted += 1;
                }
            }
            let touched = returned.len() as u64;
            counts.inserted += inserted;
            counts.updated += touched - inserted;
            counts.skipped += chunk.len() as u64 - touched;
        }
        Ok(counts)
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if !self.in_tx {
            return;
        }
        if let Some(conn) = self.conn.take() {
            // closing the socket makes the server roll back; the connection and
            // whatever session settings it carries never return to the pool
            warn!("dropping session with an open transaction; closing its connection");
            drop(conn.detach());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cases() -> TableSpec {
        TableSpec::new("public.cases")
            .id("id")
            .column("case_number", ColumnType::Text)
            .column("onset_date", ColumnType::Date)
            .conflict_key(&["case_number"])
    }

    #[test]
    fn quotes_schema_qualified_identifiers() {
        assert_eq!(quote_ident("public.cases"), "\"public\".\"cases\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn merge_statement_updates_named_columns() {
        let rows = vec![vec![Value::from("42"), Value::Null]];
        let qb = insert_statement(&cases(), &rows, &ConflictPolicy::merge(&["onset_date"]));
        let sql = qb.sql();
        assert!(sql.starts_with(
            "INSERT INTO \"public\".\"cases\" (\"case_number\", \"onset_date\") VALUES ($1, $2)"
        ));
        assert!(sql.contains(
            "ON CONFLICT (\"case_number\") DO UPDATE SET \"onset_date\" = EXCLUDED.\"onset_date\""
        ));
        assert!(sql.ends_with("RETURNING (xmax = 0) AS inserted"));
    }

    #[test]
    fn ignore_statement_does_nothing_on_conflict() {
        let rows = vec![vec![Value::from("42"), Value::Null]];
        let qb = insert_statement(&cases(), &rows, &ConflictPolicy::Ignore);
        assert!(qb.sql().contains("ON CONFLICT (\"case_number\") DO NOTHING"));
    }
}
