//! Persistent storage for run records using redb.
//!
//! # Table design
//!
//! ```text
//! runs       [ created_ms: u64 BE (8 bytes) | uuid (16 bytes) ] -> JSON ActionRun
//! run_index  uuid (16 bytes)                                    -> 24-byte runs key
//! payloads   "runs/<uuid>/inputs" | "runs/<uuid>/outputs"       -> JSON bytes
//! meta       "schema_version"                                   -> u64
//! ```
//!
//! The timestamp occupies the high bytes of the `runs` key, so byte order is
//! creation order and a time-range query is a single range scan.
//!
//! Every state change reads, checks and rewrites the record inside one write
//! transaction. redb admits one write transaction at a time, so of several
//! racing terminal transitions exactly one commits; the others observe the
//! terminal state and fail with `InvalidTransition`.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ActionsError, Result};
use crate::migrations;
use crate::run::{self, ActionRun, ErrorKind, RunError, RunState};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

pub(crate) const RUNS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("runs");
pub(crate) const RUN_INDEX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("run_index");
pub(crate) const PAYLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("payloads");
pub(crate) const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub(crate) const SCHEMA_VERSION_KEY: &str = "schema_version";

pub(crate) fn db_err(e: impl std::fmt::Display) -> ActionsError {
    ActionsError::RunDb(e.to_string())
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

pub(crate) fn run_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

fn bound_key(ts: Option<DateTime<Utc>>, fill: u8, default_ms: u64) -> [u8; 24] {
    let mut key = [fill; 24];
    let ms = ts
        .map(|t| t.timestamp_millis().max(0) as u64)
        .unwrap_or(default_ms);
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key
}

// ---------------------------------------------------------------------------
// RunFilter
// ---------------------------------------------------------------------------

/// Query for [`RunRegistry::list`]. Results are newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFilter {
    /// Empty means any state.
    #[serde(default)]
    pub states: Vec<RunState>,
    #[serde(default)]
    pub action_id: Option<String>,
    /// Inclusive lower bound on `created_at`.
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl RunFilter {
    fn matches(&self, run: &ActionRun) -> bool {
        (self.states.is_empty() || self.states.contains(&run.state))
            && self
                .action_id
                .as_deref()
                .is_none_or(|id| id == run.action_id)
            // Keys only carry milliseconds; recheck the full timestamp.
            && self.created_after.is_none_or(|t| run.created_at >= t)
            && self.created_before.is_none_or(|t| run.created_at <= t)
    }
}

// ---------------------------------------------------------------------------
// RunRegistry
// ---------------------------------------------------------------------------

/// Durable store of `ActionRun` records and their input/output payloads.
pub struct RunRegistry {
    db: Database,
}

impl RunRegistry {
    /// Open or create the database at `path`.
    ///
    /// A new database is stamped with the current schema version. An existing
    /// one at an older version is refused with `MigrationPending`.
    pub fn open(path: &Path) -> Result<Self> {
        let registry = Self::open_unchecked(path)?;
        let found = registry.schema_version()?;
        if found > migrations::CURRENT_SCHEMA_VERSION {
            return Err(ActionsError::UnsupportedSchema(found));
        }
        if found < migrations::CURRENT_SCHEMA_VERSION {
            return Err(ActionsError::MigrationPending {
                found,
                current: migrations::CURRENT_SCHEMA_VERSION,
            });
        }
        Ok(registry)
    }

    /// Open the database at `path` and upgrade it to the current schema.
    ///
    /// Returns the `(from, to)` versions.
    pub fn migrate(path: &Path) -> Result<(u64, u64)> {
        let registry = Self::open_unchecked(path)?;
        let from = registry.schema_version()?;
        if from > migrations::CURRENT_SCHEMA_VERSION {
            return Err(ActionsError::UnsupportedSchema(from));
        }
        migrations::migrate_db(&registry.db, from)?;
        Ok((from, migrations::CURRENT_SCHEMA_VERSION))
    }

    /// Whether the database at `path` exists and needs `migrate` before use.
    pub fn migration_pending(path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let registry = Self::open_unchecked(path)?;
        Ok(registry.schema_version()? < migrations::CURRENT_SCHEMA_VERSION)
    }

    fn open_unchecked(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(|e| match e {
            redb::DatabaseError::DatabaseAlreadyOpen => ActionsError::RunDb(format!(
                "{} is already in use by another action server",
                path.display()
            )),
            other => db_err(other),
        })?;

        let wt = db.begin_write().map_err(db_err)?;
        {
            let mut meta = wt.open_table(META).map_err(db_err)?;
            let runs = wt.open_table(RUNS).map_err(db_err)?;
            wt.open_table(PAYLOADS).map_err(db_err)?;
            let stamped = meta.get(SCHEMA_VERSION_KEY).map_err(db_err)?.is_some();
            if !stamped {
                // An unstamped file with runs predates versioning (v0).
                let legacy = !runs.is_empty().map_err(db_err)?;
                if !legacy {
                    wt.open_table(RUN_INDEX).map_err(db_err)?;
                    meta.insert(SCHEMA_VERSION_KEY, migrations::CURRENT_SCHEMA_VERSION)
                        .map_err(db_err)?;
                }
            }
        }
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    pub fn schema_version(&self) -> Result<u64> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let meta = rt.open_table(META).map_err(db_err)?;
        Ok(meta
            .get(SCHEMA_VERSION_KEY)
            .map_err(db_err)?
            .map(|v| v.value())
            .unwrap_or(0))
    }

    /// Allocate a new `Queued` run for `action_id`.
    pub fn create(&self, action_id: &str) -> Result<ActionRun> {
        let run = ActionRun::new(action_id, Utc::now());
        let key = run_key(run.created_at, run.id);
        let value = serde_json::to_vec(&run)?;

        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut runs = wt.open_table(RUNS).map_err(db_err)?;
            let mut index = wt.open_table(RUN_INDEX).map_err(db_err)?;
            runs.insert(key.as_slice(), value.as_slice())
                .map_err(db_err)?;
            index
                .insert(run.id.as_bytes().as_slice(), key.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(run)
    }

    /// Read, modify and rewrite one record in a single write transaction.
    ///
    /// If `f` fails the transaction is dropped uncommitted and the stored
    /// record is unchanged.
    fn update<F>(&self, id: Uuid, payload: Option<(&str, &[u8])>, f: F) -> Result<ActionRun>
    where
        F: FnOnce(&mut ActionRun) -> Result<()>,
    {
        let wt = self.db.begin_write().map_err(db_err)?;
        let run = {
            let index = wt.open_table(RUN_INDEX).map_err(db_err)?;
            let mut runs = wt.open_table(RUNS).map_err(db_err)?;
            let key = index
                .get(id.as_bytes().as_slice())
                .map_err(db_err)?
                .map(|g| g.value().to_vec())
                .ok_or_else(|| ActionsError::RunNotFound(id.to_string()))?;
            let bytes = runs
                .get(key.as_slice())
                .map_err(db_err)?
                .map(|g| g.value().to_vec())
                .ok_or_else(|| ActionsError::RunNotFound(id.to_string()))?;
            let mut run: ActionRun = serde_json::from_slice(&bytes)?;

            f(&mut run)?;

            let value = serde_json::to_vec(&run)?;
            runs.insert(key.as_slice(), value.as_slice())
                .map_err(db_err)?;
            if let Some((reference, data)) = payload {
                let mut payloads = wt.open_table(PAYLOADS).map_err(db_err)?;
                payloads.insert(reference, data).map_err(db_err)?;
            }
            run
        };
        wt.commit().map_err(db_err)?;
        Ok(run)
    }

    fn check(run: &ActionRun, to: RunState) -> Result<()> {
        if run.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(ActionsError::InvalidTransition {
                from: run.state,
                to,
            })
        }
    }

    /// Move a run to `to`, enforcing the run state machine.
    pub fn transition(&self, id: Uuid, to: RunState, at: DateTime<Utc>) -> Result<ActionRun> {
        self.update(id, None, |run| {
            Self::check(run, to)?;
            run.apply(to, at);
            Ok(())
        })
    }

    /// Terminate a run as `Failed` with the given cause.
    pub fn fail(&self, id: Uuid, error: RunError, at: DateTime<Utc>) -> Result<ActionRun> {
        self.update(id, None, |run| {
            Self::check(run, RunState::Failed)?;
            run.apply(RunState::Failed, at);
            run.error = Some(error);
            Ok(())
        })
    }

    /// Terminate a run as `Cancelled`.
    pub fn cancel(&self, id: Uuid, reason: &str, at: DateTime<Utc>) -> Result<ActionRun> {
        self.update(id, None, |run| {
            Self::check(run, RunState::Cancelled)?;
            run.apply(RunState::Cancelled, at);
            run.error = Some(RunError {
                kind: ErrorKind::Cancelled,
                message: reason.to_string(),
            });
            Ok(())
        })
    }

    /// Cancel a run that has not started yet.
    ///
    /// A `Running` run is returned unchanged: its body owns the terminal
    /// write once it observes the cancel signal. A run that already ended
    /// fails with `InvalidTransition`.
    pub fn cancel_if_queued(&self, id: Uuid, reason: &str, at: DateTime<Utc>) -> Result<ActionRun> {
        self.update(id, None, |run| {
            Self::check(run, RunState::Cancelled)?;
            if run.state == RunState::Queued {
                run.apply(RunState::Cancelled, at);
                run.error = Some(RunError {
                    kind: ErrorKind::Cancelled,
                    message: reason.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Store `outputs` and move the run to `Completed` in one commit.
    pub fn complete(
        &self,
        id: Uuid,
        outputs: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<ActionRun> {
        let reference = run::outputs_ref(id);
        let data = serde_json::to_vec(outputs)?;
        self.update(id, Some((reference.as_str(), data.as_slice())), |run| {
            Self::check(run, RunState::Completed)?;
            run.apply(RunState::Completed, at);
            run.outputs_ref = Some(reference.clone());
            Ok(())
        })
    }

    /// Store the caller's (non-secret) inputs for a run that has not started.
    pub fn record_inputs(&self, id: Uuid, inputs: &serde_json::Value) -> Result<ActionRun> {
        let reference = run::inputs_ref(id);
        let data = serde_json::to_vec(inputs)?;
        self.update(id, Some((reference.as_str(), data.as_slice())), |run| {
            if run.inputs_ref.is_some() {
                return Err(ActionsError::RunDb(format!("inputs already recorded for {id}")));
            }
            run.inputs_ref = Some(reference.clone());
            Ok(())
        })
    }

    pub fn set_key_index(&self, id: Uuid, key_index: usize) -> Result<ActionRun> {
        self.update(id, None, |run| {
            run.key_index = Some(key_index);
            Ok(())
        })
    }

    pub fn get(&self, id: Uuid) -> Result<ActionRun> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let index = rt.open_table(RUN_INDEX).map_err(db_err)?;
        let runs = rt.open_table(RUNS).map_err(db_err)?;
        let key = index
            .get(id.as_bytes().as_slice())
            .map_err(db_err)?
            .ok_or_else(|| ActionsError::RunNotFound(id.to_string()))?;
        let value = runs
            .get(key.value())
            .map_err(db_err)?
            .ok_or_else(|| ActionsError::RunNotFound(id.to_string()))?;
        Ok(serde_json::from_slice(value.value())?)
    }

    pub fn get_payload(&self, reference: &str) -> Result<serde_json::Value> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let payloads = rt.open_table(PAYLOADS).map_err(db_err)?;
        let value = payloads
            .get(reference)
            .map_err(db_err)?
            .ok_or_else(|| ActionsError::PayloadNotFound(reference.to_string()))?;
        Ok(serde_json::from_slice(value.value())?)
    }

    /// Runs matching `filter`, newest first.
    pub fn list(&self, filter: &RunFilter) -> Result<Vec<ActionRun>> {
        if filter.limit == Some(0) {
            return Ok(Vec::new());
        }
        let lower = bound_key(filter.created_after, 0x00, 0);
        let upper = bound_key(filter.created_before, 0xff, u64::MAX);
        if lower > upper {
            return Ok(Vec::new());
        }

        let rt = self.db.begin_read().map_err(db_err)?;
        let runs = rt.open_table(RUNS).map_err(db_err)?;

        let mut result = Vec::new();
        let mut skipped = 0usize;
        for entry in runs
            .range(lower.as_slice()..=upper.as_slice())
            .map_err(db_err)?
            .rev()
        {
            let (_, v) = entry.map_err(db_err)?;
            let run: ActionRun = serde_json::from_slice(v.value())?;
            if !filter.matches(&run) {
                continue;
            }
            if skipped < filter.offset {
                skipped += 1;
                continue;
            }
            result.push(run);
            if filter.limit.is_some_and(|limit| result.len() >= limit) {
                break;
            }
        }
        Ok(result)
    }

    /// On startup, fail every run a previous process left `Queued` or `Running`.
    ///
    /// Returns the number of runs recovered.
    pub fn startup_recovery(&self, now: DateTime<Utc>) -> Result<u32> {
        let stranded = self.list(&RunFilter {
            states: vec![RunState::Queued, RunState::Running],
            ..Default::default()
        })?;
        let mut count = 0u32;
        for run in stranded {
            let error = RunError {
                kind: ErrorKind::ActionError,
                message: "interrupted by server restart".into(),
            };
            match self.fail(run.id, error, now) {
                Ok(_) => count += 1,
                Err(ActionsError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(count)
    }

    #[cfg(test)]
    pub(crate) fn database(&self) -> &Database {
        &self.db
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
