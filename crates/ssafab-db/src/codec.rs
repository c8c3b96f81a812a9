//! Big-endian payload codecs for the replication wire protocol.
//!
//! Only the definition structures need encoding; table rows travel as
//! the opaque byte payloads they already are.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ssafab_types::{DbId, Epoch};

use crate::{DatasetDef, DbDef, DbError, DbResult};

/// Encoded size of a [`DatasetDef`].
pub const DATASET_DEF_SIZE: usize = 28;

pub fn encode_db_def(def: &DbDef) -> Bytes {
    let name = def.name.as_bytes();
    let mut buf = BytesMut::with_capacity(10 + name.len());
    buf.put_u8(def.version);
    buf.put_u64(def.db_id.as_u64());
    buf.put_u8(name.len() as u8);
    buf.put_slice(name);
    buf.freeze()
}

pub fn decode_db_def(mut payload: &[u8]) -> DbResult<DbDef> {
    if payload.len() < 10 {
        return Err(DbError::Invalid("short db_def payload".into()));
    }
    let version = payload.get_u8();
    let db_id = DbId::new(payload.get_u64());
    let name_len = payload.get_u8() as usize;
    if payload.len() != name_len {
        return Err(DbError::Invalid("db_def name length mismatch".into()));
    }
    let name = String::from_utf8(payload[..name_len].to_vec())
        .map_err(|_| DbError::Invalid("db_def name not utf-8".into()))?;
    Ok(DbDef {
        version,
        db_id,
        name,
    })
}

pub fn encode_dataset_def(def: &DatasetDef) -> Bytes {
    let mut buf = BytesMut::with_capacity(DATASET_DEF_SIZE);
    put_dataset_def(&mut buf, def);
    buf.freeze()
}

fn put_dataset_def(buf: &mut BytesMut, def: &DatasetDef) {
    buf.put_u32(def.id);
    buf.put_u64(def.epoch.as_u64());
    buf.put_u64(def.set_size);
    buf.put_u64(def.set_count);
}

pub fn decode_dataset_def(mut payload: &[u8]) -> DbResult<DatasetDef> {
    if payload.len() != DATASET_DEF_SIZE {
        return Err(DbError::Invalid(format!(
            "dataset def payload is {} bytes, expected {DATASET_DEF_SIZE}",
            payload.len()
        )));
    }
    Ok(DatasetDef {
        id: payload.get_u32(),
        epoch: Epoch::new(payload.get_u64()),
        set_size: payload.get_u64(),
        set_count: payload.get_u64(),
    })
}

/// Encodes the per-table dataset descriptor array served at the start
/// of the field-def and data phases.
pub fn encode_dataset_defs(defs: &[DatasetDef]) -> Bytes {
    let mut buf = BytesMut::with_capacity(defs.len() * DATASET_DEF_SIZE);
    for def in defs {
        put_dataset_def(&mut buf, def);
    }
    buf.freeze()
}

pub fn decode_dataset_defs(payload: &[u8]) -> DbResult<Vec<DatasetDef>> {
    if payload.len() % DATASET_DEF_SIZE != 0 {
        return Err(DbError::Invalid(format!(
            "dataset def array payload of {} bytes is not a multiple of {DATASET_DEF_SIZE}",
            payload.len()
        )));
    }
    payload
        .chunks_exact(DATASET_DEF_SIZE)
        .map(decode_dataset_def)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_def_roundtrips() {
        let def = DbDef::new(DbId::PATH_DATA, "path-data");
        assert_eq!(decode_db_def(&encode_db_def(&def)).unwrap(), def);
    }

    #[test]
    fn db_def_rejects_trailing_bytes() {
        let mut bytes = encode_db_def(&DbDef::new(DbId::new(1), "x")).to_vec();
        bytes.push(0);
        assert!(decode_db_def(&bytes).is_err());
    }

    #[test]
    fn dataset_def_array_roundtrips() {
        let defs = vec![
            DatasetDef {
                id: 0,
                epoch: Epoch::new(3),
                set_size: 64,
                set_count: 2,
            },
            DatasetDef {
                id: 1,
                epoch: Epoch::INVALID,
                set_size: 0,
                set_count: 0,
            },
        ];
        assert_eq!(
            decode_dataset_defs(&encode_dataset_defs(&defs)).unwrap(),
            defs
        );
    }

    #[test]
    fn dataset_def_array_rejects_ragged_payload() {
        assert!(decode_dataset_defs(&[0u8; DATASET_DEF_SIZE + 1]).is_err());
    }
}
