//! # ssafab-db: the opaque typed database replicated by the fabric
//!
//! An [`SsaDb`] is the unit of replication: a top-level definition, a
//! table-definition dataset, and per-table field-definition and data
//! datasets, each dataset carrying its own epoch. The overall database
//! epoch is the epoch of the designated "def" dataset. Databases are
//! immutable once published; an update always produces a new value.
//!
//! The same shape serves both the subnet-wide SMDB and the per-consumer
//! PRDB; the latter is computed from the former through the
//! [`PrdbComputer`] seam.

pub mod codec;
mod compute;
mod dump;

pub use compute::{HalfWorldComputer, PrdbComputer, PrdbOutcome};
pub use dump::{load_db, save_db};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use ssafab_types::{DbId, Epoch};
use thiserror::Error;

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors produced while validating or persisting a database.
#[derive(Debug, Error)]
pub enum DbError {
    /// Dataset bookkeeping does not match the payloads carried.
    #[error("invalid database structure: {0}")]
    Invalid(String),

    /// I/O failure while dumping or loading a snapshot.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure while dumping or loading a snapshot.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Top-level database definition, served in the `QueryDef` phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbDef {
    /// Layout version of the definition itself.
    pub version: u8,
    /// Identifier of the database this definition describes.
    pub db_id: DbId,
    /// Short operator-facing name.
    pub name: String,
}

impl DbDef {
    pub fn new(db_id: DbId, name: impl Into<String>) -> Self {
        Self {
            version: 1,
            db_id,
            name: name.into(),
        }
    }
}

/// Descriptor for one dataset: identity, version, and payload accounting.
///
/// `set_size` is the payload byte length and `set_count` the number of
/// fixed-size records in it; both travel on the wire ahead of the rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDef {
    pub id: u32,
    pub epoch: Epoch,
    pub set_size: u64,
    pub set_count: u64,
}

impl DatasetDef {
    pub fn new(id: u32, payload_len: u64, record_count: u64) -> Self {
        Self {
            id,
            epoch: Epoch::INVALID,
            set_size: payload_len,
            set_count: record_count,
        }
    }

    /// Record size in bytes, zero when the dataset is empty.
    pub fn record_size(&self) -> u64 {
        if self.set_count == 0 {
            0
        } else {
            self.set_size / self.set_count
        }
    }
}

/// One replicated database snapshot.
///
/// Immutable once published. The replication puller assembles one of
/// these field by field; the extractor and the PRDB computer build them
/// whole. All payloads are opaque `Bytes` so serving them is a slice,
/// not a copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SsaDb {
    pub def: Option<DbDef>,
    /// Descriptor of the table-definition dataset. Its epoch is the
    /// overall database epoch.
    pub table_def_meta: Option<DatasetDef>,
    /// Encoded table-definition rows.
    pub table_defs: Bytes,
    /// Per-table field-definition dataset descriptors and rows.
    pub field_def_meta: Vec<DatasetDef>,
    pub field_defs: Vec<Bytes>,
    /// Per-table data dataset descriptors and rows. Each descriptor
    /// carries that table's epoch.
    pub data_meta: Vec<DatasetDef>,
    pub data: Vec<Bytes>,
}

impl SsaDb {
    /// Starts an empty reconstruction target for the puller.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of data tables.
    pub fn table_count(&self) -> usize {
        self.data_meta.len()
    }

    /// The overall database epoch (the def dataset's epoch), or INVALID
    /// for a database still being assembled.
    pub fn epoch(&self) -> Epoch {
        self.table_def_meta.map_or(Epoch::INVALID, |d| d.epoch)
    }

    pub fn set_epoch(&mut self, epoch: Epoch) {
        if let Some(meta) = self.table_def_meta.as_mut() {
            meta.epoch = epoch;
        }
    }

    /// Epoch of a single data table.
    pub fn table_epoch(&self, index: usize) -> Epoch {
        self.data_meta.get(index).map_or(Epoch::INVALID, |d| d.epoch)
    }

    /// Checks internal consistency: every dataset descriptor must match
    /// the payload it describes, and the per-table vectors must agree on
    /// the table count.
    pub fn validate(&self) -> DbResult<()> {
        let def = self
            .def
            .as_ref()
            .ok_or_else(|| DbError::Invalid("missing db definition".into()))?;
        if def.version != 1 {
            return Err(DbError::Invalid(format!(
                "unsupported def version {}",
                def.version
            )));
        }
        let tdm = self
            .table_def_meta
            .ok_or_else(|| DbError::Invalid("missing table-def dataset".into()))?;
        if tdm.set_size != self.table_defs.len() as u64 {
            return Err(DbError::Invalid(format!(
                "table-def dataset size {} != payload {}",
                tdm.set_size,
                self.table_defs.len()
            )));
        }
        if self.field_def_meta.len() != self.data_meta.len()
            || self.field_defs.len() != self.data.len()
            || self.field_def_meta.len() != self.field_defs.len()
        {
            return Err(DbError::Invalid(format!(
                "table count mismatch: {} field-def metas, {} field-def sets, {} data metas, {} data sets",
                self.field_def_meta.len(),
                self.field_defs.len(),
                self.data_meta.len(),
                self.data.len()
            )));
        }
        for (meta, payload) in self.field_def_meta.iter().zip(&self.field_defs) {
            if meta.set_size != payload.len() as u64 {
                return Err(DbError::Invalid(format!(
                    "field-def dataset {} size {} != payload {}",
                    meta.id,
                    meta.set_size,
                    payload.len()
                )));
            }
        }
        for (meta, payload) in self.data_meta.iter().zip(&self.data) {
            if meta.set_size != payload.len() as u64 {
                return Err(DbError::Invalid(format!(
                    "data dataset {} size {} != payload {}",
                    meta.id,
                    meta.set_size,
                    payload.len()
                )));
            }
        }
        Ok(())
    }

    /// Content equality ignoring epochs. Two snapshots extracted from an
    /// unchanged subnet compare equal here even though only one of them
    /// has been stamped.
    pub fn same_content(&self, other: &SsaDb) -> bool {
        self.def == other.def
            && self.table_defs == other.table_defs
            && self.field_defs == other.field_defs
            && self.data == other.data
            && self.data_meta.len() == other.data_meta.len()
            && self
                .data_meta
                .iter()
                .zip(&other.data_meta)
                .all(|(a, b)| a.id == b.id && a.set_size == b.set_size && a.set_count == b.set_count)
    }
}

/// Stamps epochs on a freshly extracted snapshot by diffing it against
/// the previous published generation.
///
/// Tables whose content changed get the successor of their previous
/// epoch; unchanged tables keep theirs. The overall epoch advances iff
/// any table changed or this is the first extraction. Returns `true`
/// when the snapshot is dirty (must be distributed).
pub fn stamp_epochs(new: &mut SsaDb, prev: Option<&SsaDb>) -> bool {
    let mut dirty = false;

    match prev {
        None => {
            for meta in &mut new.data_meta {
                meta.epoch = Epoch::INVALID.next();
            }
            new.set_epoch(Epoch::INVALID.next());
            dirty = true;
        }
        Some(prev) => {
            for (index, meta) in new.data_meta.iter_mut().enumerate() {
                let prev_epoch = prev.table_epoch(index);
                let changed = match (prev.data.get(index), new.data.get(index)) {
                    (Some(old), Some(cur)) => old != cur,
                    _ => true,
                };
                if changed || !prev_epoch.is_valid() {
                    meta.epoch = prev_epoch.next();
                    dirty = true;
                } else {
                    meta.epoch = prev_epoch;
                }
            }
            if new.table_defs != prev.table_defs || new.table_count() != prev.table_count() {
                dirty = true;
            }
            let overall = if dirty {
                prev.epoch().next()
            } else {
                prev.epoch()
            };
            new.set_epoch(overall);
        }
    }

    dirty
}

pub mod testutil {
    //! Sample-database builders shared by tests across the workspace.

    use super::*;
    use bytes::Bytes;
    use ssafab_types::Gid;

    /// Builds a small database with `tables` data tables; each record is
    /// 32 bytes: a GID in the first 16 and a payload tag in the rest.
    pub fn sample_db(db_id: DbId, tables: usize, gids: &[Gid]) -> SsaDb {
        let mut db = SsaDb {
            def: Some(DbDef::new(db_id, "path-data")),
            ..SsaDb::default()
        };
        db.table_defs = Bytes::from(
            (0..tables)
                .flat_map(|i| (i as u32).to_be_bytes())
                .collect::<Vec<u8>>(),
        );
        db.table_def_meta = Some(DatasetDef::new(
            u32::MAX,
            db.table_defs.len() as u64,
            tables as u64,
        ));
        for t in 0..tables {
            let field_defs = Bytes::from(vec![t as u8; 8]);
            db.field_def_meta
                .push(DatasetDef::new(t as u32, field_defs.len() as u64, 1));
            db.field_defs.push(field_defs);

            let mut rows = Vec::new();
            for gid in gids {
                rows.extend_from_slice(&gid.to_bytes());
                rows.extend_from_slice(&[t as u8; 16]);
            }
            db.data_meta.push(DatasetDef::new(
                t as u32,
                rows.len() as u64,
                gids.len() as u64,
            ));
            db.data.push(Bytes::from(rows));
        }
        db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssafab_types::Gid;
    use testutil::sample_db;

    fn gids(n: u128) -> Vec<Gid> {
        (1..=n).map(Gid::new).collect()
    }

    #[test]
    fn sample_db_validates() {
        let db = sample_db(DbId::PATH_DATA, 3, &gids(4));
        db.validate().unwrap();
        assert_eq!(db.table_count(), 3);
    }

    #[test]
    fn validate_rejects_size_mismatch() {
        let mut db = sample_db(DbId::PATH_DATA, 2, &gids(2));
        db.data_meta[1].set_size += 1;
        assert!(matches!(db.validate(), Err(DbError::Invalid(_))));
    }

    #[test]
    fn first_extraction_is_dirty_and_gets_epoch_one() {
        let mut db = sample_db(DbId::PATH_DATA, 2, &gids(2));
        assert!(stamp_epochs(&mut db, None));
        assert_eq!(db.epoch(), Epoch::new(1));
        assert_eq!(db.table_epoch(0), Epoch::new(1));
    }

    #[test]
    fn unchanged_extraction_is_clean_and_keeps_epoch() {
        let mut first = sample_db(DbId::PATH_DATA, 2, &gids(2));
        stamp_epochs(&mut first, None);

        let mut second = sample_db(DbId::PATH_DATA, 2, &gids(2));
        assert!(!stamp_epochs(&mut second, Some(&first)));
        assert_eq!(second.epoch(), first.epoch());
        assert_eq!(second.table_epoch(1), first.table_epoch(1));
    }

    #[test]
    fn changed_table_advances_only_its_epoch_and_the_overall() {
        let mut first = sample_db(DbId::PATH_DATA, 2, &gids(2));
        stamp_epochs(&mut first, None);

        let mut second = sample_db(DbId::PATH_DATA, 2, &gids(2));
        let mut rows = second.data[1].to_vec();
        rows[16] ^= 0xFF;
        second.data[1] = rows.into();
        second.data_meta[1].set_size = second.data[1].len() as u64;

        assert!(stamp_epochs(&mut second, Some(&first)));
        assert_eq!(second.table_epoch(0), first.table_epoch(0));
        assert_eq!(second.table_epoch(1), first.table_epoch(1).next());
        assert_eq!(second.epoch(), first.epoch().next());
    }

    #[test]
    fn same_content_ignores_epochs() {
        let mut a = sample_db(DbId::PATH_DATA, 2, &gids(3));
        let b = sample_db(DbId::PATH_DATA, 2, &gids(3));
        stamp_epochs(&mut a, None);
        assert!(a.same_content(&b));
    }
}
