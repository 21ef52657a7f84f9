//! Persistence for masternode-list snapshots. The database is a
//! correctness-preserving cache: the list is always reconstructable from the
//! chain, snapshots just make that cheap.

use ferrox_shared_types::Hash;
use sled::Db;

use crate::deterministicmns::MasternodeList;
use crate::EvoError;

const DB_LIST_SNAPSHOT: &[u8] = b"dmn_S";

/// Sled-backed store for per-block list snapshots.
pub struct EvoDb {
    db: Db,
}

impl EvoDb {
    pub fn new(db: Db) -> Self {
        EvoDb { db }
    }

    fn snapshot_key(block_hash: &Hash) -> Vec<u8> {
        let mut key = DB_LIST_SNAPSHOT.to_vec();
        key.extend_from_slice(block_hash);
        key
    }

    pub fn write_snapshot(&self, list: &MasternodeList) -> Result<(), EvoError> {
        let bytes = bincode::serialize(list)?;
        self.db.insert(Self::snapshot_key(list.block_hash()), bytes)?;
        Ok(())
    }

    pub fn read_snapshot(&self, block_hash: &Hash) -> Result<Option<MasternodeList>, EvoError> {
        match self.db.get(Self::snapshot_key(block_hash))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn flush(&self) -> Result<(), EvoError> {
        self.db.flush()?;
        Ok(())
    }
}
