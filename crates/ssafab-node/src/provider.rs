//! Subnet-state providers for the daemon.
//!
//! The production extractor reads the subnet manager's in-memory state;
//! that interface is outside this workspace. The daemon instead
//! supports the address-preload path: a hosts file (`addr_data_file`)
//! of `gid lid` lines synthesized into the path-data table set, which
//! is what the `addr_preload` option loaded in the original daemon.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use bytes::Bytes;
use ssafab_core::SubnetProvider;
use ssafab_db::{DatasetDef, DbDef, SsaDb};
use ssafab_types::{DbId, Gid, Lid};
use tracing::info;

/// One subnet port entry.
#[derive(Debug, Clone, Copy)]
pub struct HostEntry {
    pub gid: Gid,
    pub lid: Lid,
}

/// Provider backed by a host address table.
pub struct AddrFileProvider {
    path: PathBuf,
    entries: Mutex<Vec<HostEntry>>,
}

impl AddrFileProvider {
    /// Loads the address table; each non-comment line is `gid lid`,
    /// with the GID in IPv6 notation.
    pub fn load(path: PathBuf) -> Result<Self> {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading address data file {}", path.display()))?;
        let mut entries = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(gid), Some(lid)) = (fields.next(), fields.next()) else {
                continue;
            };
            let gid: std::net::Ipv6Addr = gid
                .parse()
                .with_context(|| format!("bad GID {gid:?} in {}", path.display()))?;
            let lid: u16 = lid
                .parse()
                .with_context(|| format!("bad LID {lid:?} in {}", path.display()))?;
            entries.push(HostEntry {
                gid: Gid::from_ipv6(gid),
                lid: Lid::new(lid),
            });
        }
        info!(count = entries.len(), path = %path.display(), "address table loaded");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Re-reads the table; the next extraction picks the changes up.
    pub fn reload(&self) -> Result<()> {
        let fresh = Self::load(self.path.clone())?;
        let entries = fresh.entries.into_inner().expect("fresh provider lock");
        *self.entries.lock().expect("address table lock") = entries;
        Ok(())
    }
}

impl SubnetProvider for AddrFileProvider {
    fn snapshot(&self) -> SsaDb {
        let entries = self.entries.lock().expect("address table lock");
        build_path_data_db(&entries)
    }
}

/// Synthesizes the path-data database from a port list: one table of
/// 32-byte records (GID + LID + padding).
pub fn build_path_data_db(entries: &[HostEntry]) -> SsaDb {
    let mut rows = Vec::with_capacity(entries.len() * 32);
    for entry in entries {
        rows.extend_from_slice(&entry.gid.to_bytes());
        rows.extend_from_slice(&entry.lid.as_u16().to_be_bytes());
        rows.extend_from_slice(&[0u8; 14]);
    }

    let mut db = SsaDb {
        def: Some(DbDef::new(DbId::PATH_DATA, "path-data")),
        ..SsaDb::default()
    };
    db.table_defs = Bytes::from_static(&[0, 0, 0, 0]);
    db.table_def_meta = Some(DatasetDef::new(u32::MAX, db.table_defs.len() as u64, 1));
    db.field_def_meta
        .push(DatasetDef::new(0, 0, 0));
    db.field_defs.push(Bytes::new());
    db.data_meta
        .push(DatasetDef::new(0, rows.len() as u64, entries.len() as u64));
    db.data.push(Bytes::from(rows));
    db
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_and_snapshots_host_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# hosts").unwrap();
        writeln!(file, "::ffff:127.0.0.2 12").unwrap();
        writeln!(file, "::ffff:127.0.0.3 13").unwrap();

        let provider = AddrFileProvider::load(file.path().to_path_buf()).unwrap();
        let db = provider.snapshot();
        db.validate().unwrap();
        assert_eq!(db.data_meta[0].set_count, 2);
        assert_eq!(db.data_meta[0].record_size(), 32);
    }

    #[test]
    fn rejects_malformed_gid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not-a-gid 7").unwrap();
        assert!(AddrFileProvider::load(file.path().to_path_buf()).is_err());
    }

    #[test]
    fn snapshot_is_stable_for_unchanged_table() {
        let entries = [HostEntry {
            gid: Gid::new(5),
            lid: Lid::new(5),
        }];
        let a = build_path_data_db(&entries);
        let b = build_path_data_db(&entries);
        assert!(a.same_content(&b));
    }
}
