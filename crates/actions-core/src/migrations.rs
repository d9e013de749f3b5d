use redb::{Database, ReadableTable};

use crate::error::Result;
use crate::registry::{db_err, RUNS, RUN_INDEX, META, SCHEMA_VERSION_KEY};

/// Schema version written by this build.
///
/// - v0: `runs` table only, no version stamp.
/// - v1: adds `run_index` (uuid → runs key) and the `meta` stamp.
pub const CURRENT_SCHEMA_VERSION: u64 = 1;

/// Run every pending migration step from `from` up to [`CURRENT_SCHEMA_VERSION`].
///
/// Each step commits on its own, so an interrupted migration resumes from the
/// last completed version.
pub fn migrate_db(db: &Database, from: u64) -> Result<()> {
    let mut version = from;
    while version < CURRENT_SCHEMA_VERSION {
        match version {
            0 => migrate_v0_to_v1(db)?,
            _ => unreachable!("no migration registered from v{version}"),
        }
        version += 1;
        tracing::info!(version, "run database migrated");
    }
    Ok(())
}

/// Build `run_index` from the run keys and stamp v1.
fn migrate_v0_to_v1(db: &Database) -> Result<()> {
    let wt = db.begin_write().map_err(db_err)?;
    {
        let runs = wt.open_table(RUNS).map_err(db_err)?;
        let mut index = wt.open_table(RUN_INDEX).map_err(db_err)?;
        for entry in runs.iter().map_err(db_err)? {
            let (k, _) = entry.map_err(db_err)?;
            let key = k.value();
            if key.len() != 24 {
                continue;
            }
            index.insert(&key[8..], key).map_err(db_err)?;
        }
        let mut meta = wt.open_table(META).map_err(db_err)?;
        meta.insert(SCHEMA_VERSION_KEY, 1u64).map_err(db_err)?;
    }
    wt.commit().map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActionsError;
    use crate::registry::{run_key, RunRegistry};
    use crate::run::ActionRun;
    use chrono::Utc;
    use tempfile::TempDir;

    /// Write a v0 file: runs only, no index, no stamp.
    fn write_legacy(path: &std::path::Path, runs: &[ActionRun]) {
        let db = Database::create(path).unwrap();
        let wt = db.begin_write().unwrap();
        {
            let mut table = wt.open_table(RUNS).unwrap();
            for run in runs {
                let key = run_key(run.created_at, run.id);
                table
                    .insert(key.as_slice(), serde_json::to_vec(run).unwrap().as_slice())
                    .unwrap();
            }
        }
        wt.commit().unwrap();
    }

    #[test]
    fn legacy_database_requires_migration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs.redb");
        write_legacy(&path, &[ActionRun::new("old", Utc::now())]);

        assert!(RunRegistry::migration_pending(&path).unwrap());
        match RunRegistry::open(&path) {
            Err(ActionsError::MigrationPending { found, current }) => {
                assert_eq!(found, 0);
                assert_eq!(current, CURRENT_SCHEMA_VERSION);
            }
            Err(other) => panic!("expected MigrationPending, got {other:?}"),
            Ok(_) => panic!("expected MigrationPending, got an open registry"),
        }
    }

    #[test]
    fn migrate_indexes_legacy_runs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs.redb");
        let legacy = ActionRun::new("old", Utc::now());
        write_legacy(&path, std::slice::from_ref(&legacy));

        let (from, to) = RunRegistry::migrate(&path).unwrap();
        assert_eq!((from, to), (0, CURRENT_SCHEMA_VERSION));
        assert!(!RunRegistry::migration_pending(&path).unwrap());

        let reg = RunRegistry::open(&path).unwrap();
        assert_eq!(reg.get(legacy.id).unwrap(), legacy);
    }

    #[test]
    fn migrate_current_database_is_noop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs.redb");
        let id = RunRegistry::open(&path).unwrap().create("new").unwrap().id;

        let (from, to) = RunRegistry::migrate(&path).unwrap();
        assert_eq!(from, to);
        assert_eq!(RunRegistry::open(&path).unwrap().get(id).unwrap().action_id, "new");
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs.redb");
        {
            let reg = RunRegistry::open(&path).unwrap();
            let wt = reg.database().begin_write().unwrap();
            {
                let mut meta = wt.open_table(META).unwrap();
                meta.insert(SCHEMA_VERSION_KEY, CURRENT_SCHEMA_VERSION + 1)
                    .unwrap();
            }
            wt.commit().unwrap();
        }
        assert!(matches!(
            RunRegistry::open(&path),
            Err(ActionsError::UnsupportedSchema(_))
        ));
    }
}
