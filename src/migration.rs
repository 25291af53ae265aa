//! Versioned schema migrations.
//!
//! A plan is a contiguous list of stages for versions `1..=N`. The store stamps
//! the last applied version in `schema_version`; a stage applies only on top of
//! its direct predecessor, inside one transaction, so a failed stage leaves the
//! store at the prior version.

use crate::db::{self, Pool};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Connection, SqliteConnection};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("stage {requested} cannot apply on top of version {current}")]
    OutOfSequence { current: u32, requested: u32 },

    #[error("store is at version {stamped}, newer than this build's {latest}")]
    StoreAhead { stamped: u32, latest: u32 },

    #[error("invalid migration plan: {0}")]
    InvalidPlan(String),

    #[error("hook for stage {version} ({name}) failed: {source}")]
    Hook {
        version: u32,
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Data transformation run inside a custom stage's transaction.
#[async_trait]
pub trait MigrationHook: Send + Sync {
    async fn run(&self, conn: &mut SqliteConnection) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub enum StageKind {
    /// Structural change only; new columns carry defaults.
    Lightweight,
    Custom {
        will_migrate: Option<Arc<dyn MigrationHook>>,
        did_migrate: Option<Arc<dyn MigrationHook>>,
    },
}

impl fmt::Debug for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Lightweight => f.write_str("Lightweight"),
            StageKind::Custom {
                will_migrate,
                did_migrate,
            } => f
                .debug_struct("Custom")
                .field("will_migrate", &will_migrate.is_some())
                .field("did_migrate", &did_migrate.is_some())
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MigrationStage {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
    pub kind: StageKind,
}

impl MigrationStage {
    pub fn lightweight(version: u32, name: &'static str, sql: &'static str) -> Self {
        Self {
            version,
            name,
            sql,
            kind: StageKind::Lightweight,
        }
    }

    pub fn custom(
        version: u32,
        name: &'static str,
        sql: &'static str,
        will_migrate: Option<Arc<dyn MigrationHook>>,
        did_migrate: Option<Arc<dyn MigrationHook>>,
    ) -> Self {
        Self {
            version,
            name,
            sql,
            kind: StageKind::Custom {
                will_migrate,
                did_migrate,
            },
        }
    }
}

/// Keywords a lightweight stage may not contain: it must not rewrite data.
const DATA_REWRITE_KEYWORDS: [&str; 4] = ["INSERT", "UPDATE", "DELETE", "DROP"];

fn rewrites_data(sql: &str) -> Option<&'static str> {
    let upper = sql.to_ascii_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .collect();
    DATA_REWRITE_KEYWORDS
        .into_iter()
        .find(|kw| words.iter().any(|w| w == kw))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: u32,
    pub to: u32,
    pub applied: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct MigrationPlan {
    stages: Vec<MigrationStage>,
}

impl MigrationPlan {
    pub fn new(stages: Vec<MigrationStage>) -> Result<Self, MigrationError> {
        for (idx, stage) in stages.iter().enumerate() {
            let expected = idx as u32 + 1;
            if stage.version != expected {
                return Err(MigrationError::InvalidPlan(format!(
                    "stage {} ({}) found where version {expected} was expected",
                    stage.version, stage.name
                )));
            }
            if let StageKind::Lightweight = stage.kind {
                if let Some(kw) = rewrites_data(stage.sql) {
                    return Err(MigrationError::InvalidPlan(format!(
                        "lightweight stage {} ({}) contains {kw}",
                        stage.version, stage.name
                    )));
                }
            }
        }
        Ok(Self { stages })
    }

    /// The built-in plan for this crate's tables.
    pub fn standard() -> Self {
        Self {
            stages: vec![
                MigrationStage::lightweight(
                    1,
                    "initial",
                    include_str!("../migrations/0001_initial.sql"),
                ),
                MigrationStage::lightweight(
                    2,
                    "event_priority",
                    include_str!("../migrations/0002_event_priority.sql"),
                ),
                MigrationStage::custom(
                    3,
                    "event_metadata",
                    include_str!("../migrations/0003_event_metadata.sql"),
                    Some(Arc::new(NormalizeLegacyStatuses)),
                    Some(Arc::new(MaterializeGenericMetadata)),
                ),
            ],
        }
    }

    pub fn latest_version(&self) -> u32 {
        self.stages.len() as u32
    }

    pub fn stages(&self) -> &[MigrationStage] {
        &self.stages
    }

    pub async fn current_version(&self, pool: &Pool) -> Result<u32, MigrationError> {
        let mut conn = pool.acquire().await?;
        Ok(db::read_schema_version(&mut conn).await?)
    }

    /// Applies every stage after the stamped version, in order.
    pub async fn migrate(&self, pool: &Pool) -> Result<MigrationReport, MigrationError> {
        let from = self.current_version(pool).await?;
        let latest = self.latest_version();
        if from > latest {
            return Err(MigrationError::StoreAhead {
                stamped: from,
                latest,
            });
        }
        info!(from, latest, "running migrations");

        let mut applied = Vec::new();
        for version in from + 1..=latest {
            self.apply_stage(pool, version).await?;
            applied.push(version);
        }
        info!(to = latest, applied = applied.len(), "migrations complete");
        Ok(MigrationReport {
            from,
            to: latest,
            applied,
        })
    }

    /// Applies one stage. Legal only when `version` is the stamped version + 1.
    pub async fn apply_stage(&self, pool: &Pool, version: u32) -> Result<(), MigrationError> {
        let stage = self
            .stages
            .get((version as usize).wrapping_sub(1))
            .ok_or_else(|| MigrationError::InvalidPlan(format!("no stage {version}")))?;

        let mut conn = pool.acquire().await?;
        let mut tx = conn.begin().await?;
        match run_stage(&mut tx, stage).await {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }
}

async fn run_stage(conn: &mut SqliteConnection, stage: &MigrationStage) -> Result<(), MigrationError> {
    let current = db::read_schema_version(conn).await?;
    if stage.version != current + 1 {
        return Err(MigrationError::OutOfSequence {
            current,
            requested: stage.version,
        });
    }

    info!(version = stage.version, name = stage.name, kind = ?stage.kind, "applying stage");
    if let StageKind::Custom {
        will_migrate: Some(hook),
        ..
    } = &stage.kind
    {
        run_hook(hook.as_ref(), conn, stage).await?;
    }
    db::execute_script(conn, stage.sql).await?;
    if let StageKind::Custom {
        did_migrate: Some(hook),
        ..
    } = &stage.kind
    {
        run_hook(hook.as_ref(), conn, stage).await?;
    }
    db::stamp_schema_version(conn, stage.version, Utc::now()).await?;
    Ok(())
}

async fn run_hook(
    hook: &dyn MigrationHook,
    conn: &mut SqliteConnection,
    stage: &MigrationStage,
) -> Result<(), MigrationError> {
    hook.run(conn).await.map_err(|source| {
        warn!(version = stage.version, name = stage.name, error = %source, "migration hook failed");
        MigrationError::Hook {
            version: stage.version,
            name: stage.name,
            source,
        }
    })
}

/// Older builds wrote free-form status text; rewrite it to the closed set
/// before the stage that starts decoding status strictly.
struct NormalizeLegacyStatuses;

#[async_trait]
impl MigrationHook for NormalizeLegacyStatuses {
    async fn run(&self, conn: &mut SqliteConnection) -> anyhow::Result<()> {
        let fixed = db::normalize_legacy_statuses(conn).await?;
        if fixed > 0 {
            info!(fixed, "normalized legacy event statuses");
        }
        Ok(())
    }
}

/// Resave every event so the new metadata column is populated.
struct MaterializeGenericMetadata;

#[async_trait]
impl MigrationHook for MaterializeGenericMetadata {
    async fn run(&self, conn: &mut SqliteConnection) -> anyhow::Result<()> {
        let filled = db::backfill_generic_metadata(conn).await?;
        if filled > 0 {
            info!(filled, "materialized generic metadata");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_plan_is_valid() {
        let plan = MigrationPlan::standard();
        MigrationPlan::new(plan.stages().to_vec()).unwrap();
        assert_eq!(plan.latest_version(), 3);
    }

    #[test]
    fn gaps_in_versions_are_rejected() {
        let err = MigrationPlan::new(vec![
            MigrationStage::lightweight(1, "a", "CREATE TABLE a (x INTEGER)"),
            MigrationStage::lightweight(3, "c", "CREATE TABLE c (x INTEGER)"),
        ])
        .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidPlan(_)));
    }

    #[test]
    fn lightweight_stage_cannot_rewrite_data() {
        let err = MigrationPlan::new(vec![MigrationStage::lightweight(
            1,
            "bad",
            "CREATE TABLE a (x INTEGER); update a set x = 1;",
        )])
        .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidPlan(msg) if msg.contains("UPDATE")));

        // Column names that merely contain a keyword are fine.
        MigrationPlan::new(vec![MigrationStage::lightweight(
            1,
            "ok",
            "CREATE TABLE a (updated_at INTEGER, dropped INTEGER)",
        )])
        .unwrap();
    }
}
