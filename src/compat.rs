//! Schema compatibility layer.
//!
//! Reads go through the structured SQL path first and fall back to a whole-table
//! scan filtered in memory when the on-disk schema does not have the shape the
//! query expects. Deletes always take the fallback chain: a pooled connection
//! first, then a freshly opened one. When every fallback fails the outcome is
//! [`Compat::Unrecoverable`] and the caller has to offer a local data reset.

use crate::db::{self, Pool, StoredRow};
use crate::error::{OutboxError, OutboxResult};
use sqlx::{ConnectOptions, Connection, Row, SqliteConnection};
use std::future::Future;
use tracing::{debug, error, warn};

/// SQLite messages that mean the schema does not match the query.
const STRUCTURAL_MARKERS: [&str; 4] = [
    "no such column",
    "no such table",
    "has no column named",
    "datatype mismatch",
];

/// Whether an error comes from schema drift rather than from I/O or locking.
pub fn is_structural(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::Decode(_) => true,
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            STRUCTURAL_MARKERS.iter().any(|m| msg.contains(m))
        }
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatibilityOutcome {
    Normal,
    FallbackFiltered,
    Unrecoverable,
}

/// Result of a read or delete together with the strategy that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Compat<T> {
    Normal(T),
    FallbackFiltered(T),
    Unrecoverable(String),
}

impl<T> Compat<T> {
    pub fn outcome(&self) -> CompatibilityOutcome {
        match self {
            Compat::Normal(_) => CompatibilityOutcome::Normal,
            Compat::FallbackFiltered(_) => CompatibilityOutcome::FallbackFiltered,
            Compat::Unrecoverable(_) => CompatibilityOutcome::Unrecoverable,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Compat::Normal(v) | Compat::FallbackFiltered(v) => Some(v),
            Compat::Unrecoverable(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Compat<U> {
        match self {
            Compat::Normal(v) => Compat::Normal(f(v)),
            Compat::FallbackFiltered(v) => Compat::FallbackFiltered(f(v)),
            Compat::Unrecoverable(reason) => Compat::Unrecoverable(reason),
        }
    }

    pub fn into_result(self) -> OutboxResult<T> {
        match self {
            Compat::Normal(v) | Compat::FallbackFiltered(v) => Ok(v),
            Compat::Unrecoverable(reason) => Err(OutboxError::Unrecoverable { reason }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    Compatible,
    MigrationNeeded { stamped: u32, expected: u32 },
}

#[derive(Debug, Clone)]
pub struct SchemaCompat {
    pool: Pool,
    scan_limit: Option<u32>,
}

impl SchemaCompat {
    /// `scan_limit` bounds the unfiltered fallback read.
    pub fn new(pool: Pool, scan_limit: Option<u32>) -> Self {
        Self { pool, scan_limit }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Runs `structured`; on a structural error, scans `R`'s table, keeps the
    /// rows accepted by `predicate` and hands them to `project`.
    pub async fn read<R, T, Fut, P, F>(
        &self,
        structured: Fut,
        predicate: P,
        project: F,
    ) -> Result<Compat<T>, sqlx::Error>
    where
        R: StoredRow,
        Fut: Future<Output = Result<T, sqlx::Error>>,
        P: Fn(&R) -> bool,
        F: FnOnce(Vec<R>) -> T,
    {
        match structured.await {
            Ok(value) => Ok(Compat::Normal(value)),
            Err(err) if is_structural(&err) => {
                warn!(table = R::TABLE, error = %err, "structured read failed; filtering in memory");
                match self.scan(&predicate).await {
                    Ok(rows) => Ok(Compat::FallbackFiltered(project(rows))),
                    Err(scan_err) => {
                        error!(table = R::TABLE, error = %scan_err, "unfiltered read failed");
                        Ok(Compat::Unrecoverable(format!(
                            "cannot read {}: {scan_err}",
                            R::TABLE
                        )))
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn scan<R, P>(&self, predicate: &P) -> Result<Vec<R>, sqlx::Error>
    where
        R: StoredRow,
        P: Fn(&R) -> bool,
    {
        let rows = db::scan_table(&self.pool, R::TABLE, self.scan_limit).await?;
        let total = rows.len();
        let kept: Vec<R> = rows
            .iter()
            .filter_map(R::from_row_lenient)
            .filter(|r| predicate(r))
            .collect();
        debug!(table = R::TABLE, total, kept = kept.len(), "fallback scan");
        Ok(kept)
    }

    /// Deletes every row of `R`'s table accepted by `predicate`, touching no
    /// column but the rowid. Idempotent: an empty match set deletes nothing.
    pub async fn delete<R, P>(&self, predicate: P) -> Compat<u64>
    where
        R: StoredRow,
        P: Fn(&R) -> bool,
    {
        match self.pool.acquire().await {
            Ok(mut conn) => match delete_matching::<R, P>(&mut conn, &predicate).await {
                Ok(n) => return Compat::FallbackFiltered(n),
                Err(err) => {
                    warn!(table = R::TABLE, error = %err, "delete failed; retrying on a fresh connection");
                    // The failed connection is not handed back to the pool.
                    let _ = conn.detach().close().await;
                }
            },
            Err(err) => {
                warn!(table = R::TABLE, error = %err, "no pooled connection; retrying on a fresh one");
            }
        }

        let mut fresh = match self.pool.connect_options().connect().await {
            Ok(conn) => conn,
            Err(err) => {
                error!(table = R::TABLE, error = %err, "fresh connection failed");
                return Compat::Unrecoverable(format!("cannot open {}: {err}", R::TABLE));
            }
        };
        let res = delete_matching::<R, P>(&mut fresh, &predicate).await;
        let _ = fresh.close().await;
        match res {
            Ok(n) => Compat::FallbackFiltered(n),
            Err(err) => {
                error!(table = R::TABLE, error = %err, "delete failed on fresh connection");
                Compat::Unrecoverable(format!("cannot delete from {}: {err}", R::TABLE))
            }
        }
    }

    /// Bounded read of the expected event shape plus the stamped version.
    pub async fn check_schema(&self, expected: u32) -> Result<SchemaStatus, sqlx::Error> {
        let stamped = {
            let mut conn = self.pool.acquire().await?;
            db::read_schema_version(&mut conn).await?
        };
        match db::check_event_shape(&self.pool).await {
            Ok(()) if stamped >= expected => Ok(SchemaStatus::Compatible),
            Ok(()) => Ok(SchemaStatus::MigrationNeeded { stamped, expected }),
            Err(err) if is_structural(&err) => {
                debug!(error = %err, "schema shape check failed");
                Ok(SchemaStatus::MigrationNeeded { stamped, expected })
            }
            Err(err) => Err(err),
        }
    }
}

/// Rolled back (by dropping the transaction) on any error.
async fn delete_matching<R, P>(conn: &mut SqliteConnection, predicate: &P) -> Result<u64, sqlx::Error>
where
    R: StoredRow,
    P: Fn(&R) -> bool,
{
    let mut tx = conn.begin().await?;
    let rows = db::scan_table(&mut *tx, R::TABLE, None).await?;
    let keys: Vec<i64> = rows
        .iter()
        .filter(|row| R::from_row_lenient(row).is_some_and(|r| predicate(&r)))
        .map(|row| row.try_get::<i64, _>("row_key"))
        .collect::<Result<_, _>>()?;
    let deleted = db::delete_rows(&mut tx, R::TABLE, &keys).await?;
    tx.commit().await?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_failures_are_structural() {
        assert!(is_structural(&sqlx::Error::ColumnNotFound("priority".into())));
        assert!(is_structural(&sqlx::Error::ColumnDecode {
            index: "status".into(),
            source: "unexpected value DONE".into(),
        }));
        assert!(!is_structural(&sqlx::Error::PoolTimedOut));
        assert!(!is_structural(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn unrecoverable_maps_to_reset_remediation() {
        let res: Compat<u64> = Compat::Unrecoverable("gone".into());
        assert_eq!(res.outcome(), CompatibilityOutcome::Unrecoverable);
        let err = res.into_result().unwrap_err();
        assert!(err.is_unrecoverable());
        assert!(err.remediation().is_some());

        let ok = Compat::FallbackFiltered(3u64).map(|n| n * 2);
        assert_eq!(ok.value(), Some(&6));
    }
}
