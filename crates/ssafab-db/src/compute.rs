//! Per-consumer database computation seam.
//!
//! The real path-record engine lives outside this workspace; the fabric
//! treats it as a pure function from (SMDB, consumer GID) to PRDB. The
//! [`HalfWorldComputer`] below is the reference implementation used by
//! the access pipeline and the test fixtures: it keeps, per data table,
//! the records addressed to the consumer (leading 16 bytes of each
//! record equal its GID) plus broadcast records with a zero GID.

use bytes::Bytes;
use ssafab_types::Gid;

use crate::SsaDb;

/// Result of a PRDB computation.
#[derive(Debug)]
pub enum PrdbOutcome {
    /// A database was produced.
    Db(SsaDb),
    /// The consumer's port does not appear in the SMDB.
    PortAbsent,
}

/// Pure function computing a consumer's personalized database from the
/// shared SMDB.
pub trait PrdbComputer: Send + Sync {
    fn compute(&self, smdb: &SsaDb, consumer: Gid) -> PrdbOutcome;
}

/// Reference computer: half-world reduction by record GID prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct HalfWorldComputer;

impl PrdbComputer for HalfWorldComputer {
    fn compute(&self, smdb: &SsaDb, consumer: Gid) -> PrdbOutcome {
        let consumer_bytes = consumer.to_bytes();
        let mut present = false;
        let mut prdb = SsaDb {
            def: smdb.def.clone(),
            table_def_meta: smdb.table_def_meta,
            table_defs: smdb.table_defs.clone(),
            field_def_meta: smdb.field_def_meta.clone(),
            field_defs: smdb.field_defs.clone(),
            ..SsaDb::default()
        };

        for (meta, data) in smdb.data_meta.iter().zip(&smdb.data) {
            let record_size = meta.record_size() as usize;
            let mut rows = Vec::new();
            let mut count = 0u64;
            if record_size >= 16 {
                for record in data.chunks_exact(record_size) {
                    let gid = &record[..16];
                    if gid == consumer_bytes {
                        present = true;
                    }
                    if gid == consumer_bytes || gid.iter().all(|b| *b == 0) {
                        rows.extend_from_slice(record);
                        count += 1;
                    }
                }
            }
            let mut out_meta = *meta;
            out_meta.set_size = rows.len() as u64;
            out_meta.set_count = count;
            prdb.data_meta.push(out_meta);
            prdb.data.push(Bytes::from(rows));
        }

        if present {
            PrdbOutcome::Db(prdb)
        } else {
            PrdbOutcome::PortAbsent
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sample_db;
    use ssafab_types::DbId;

    #[test]
    fn keeps_only_the_consumer_rows() {
        let gids = [Gid::new(1), Gid::new(2), Gid::new(3)];
        let smdb = sample_db(DbId::PATH_DATA, 2, &gids);

        match HalfWorldComputer.compute(&smdb, Gid::new(2)) {
            PrdbOutcome::Db(prdb) => {
                prdb.validate().unwrap();
                assert_eq!(prdb.table_count(), 2);
                for meta in &prdb.data_meta {
                    assert_eq!(meta.set_count, 1);
                }
                assert_eq!(&prdb.data[0][..16], &Gid::new(2).to_bytes());
            }
            PrdbOutcome::PortAbsent => panic!("consumer should be present"),
        }
    }

    #[test]
    fn unknown_consumer_reports_port_absent() {
        let smdb = sample_db(DbId::PATH_DATA, 1, &[Gid::new(1)]);
        assert!(matches!(
            HalfWorldComputer.compute(&smdb, Gid::new(99)),
            PrdbOutcome::PortAbsent
        ));
    }

    #[test]
    fn same_smdb_yields_structurally_equal_prdbs() {
        let gids = [Gid::new(1), Gid::new(2)];
        let smdb = sample_db(DbId::PATH_DATA, 3, &gids);
        let (PrdbOutcome::Db(a), PrdbOutcome::Db(b)) = (
            HalfWorldComputer.compute(&smdb, Gid::new(1)),
            HalfWorldComputer.compute(&smdb, Gid::new(1)),
        ) else {
            panic!("both computations should produce a PRDB");
        };
        assert!(a.same_content(&b));
    }
}
