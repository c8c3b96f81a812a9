//! Diagnostic persistence for database snapshots.
//!
//! Dumps are operator diagnostics (`smdb_dump`, `prdb_dump`,
//! `err_smdb_dump` options), not a durability mechanism. A dump is one
//! JSON file per snapshot inside the configured directory.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::{DbResult, SsaDb};

const DUMP_FILE: &str = "db.json";

/// Writes a snapshot into `dir`, creating the directory if needed.
pub fn save_db(dir: &Path, db: &SsaDb) -> DbResult<()> {
    fs::create_dir_all(dir)?;
    let path = dir.join(DUMP_FILE);
    let json = serde_json::to_vec(db)?;
    fs::write(&path, json)?;
    debug!(path = %path.display(), epoch = %db.epoch(), "dumped database snapshot");
    Ok(())
}

/// Loads a previously dumped snapshot from `dir`.
pub fn load_db(dir: &Path) -> DbResult<SsaDb> {
    let bytes = fs::read(dir.join(DUMP_FILE))?;
    let db: SsaDb = serde_json::from_slice(&bytes)?;
    db.validate()?;
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamp_epochs;
    use crate::testutil::sample_db;
    use ssafab_types::{DbId, Gid};

    #[test]
    fn save_then_load_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let mut db = sample_db(DbId::PATH_DATA, 2, &[Gid::new(7)]);
        stamp_epochs(&mut db, None);

        save_db(tmp.path(), &db).unwrap();
        let loaded = load_db(tmp.path()).unwrap();
        assert_eq!(loaded, db);
    }

    #[test]
    fn load_from_empty_dir_fails() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_db(tmp.path()).is_err());
    }
}
