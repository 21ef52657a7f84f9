//! ChainLocks: quorum-signed attestations that a block hash occupies a
//! height, enforcing fork choice and refusing reorganizations below the best
//! locked height.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use ferrox_chain::{last_common_ancestor, BlockIndex, RejectCode, ValidationState};
use ferrox_crypto::bls::BlsSignature;
use ferrox_crypto::hash::HashWriter;
use ferrox_shared_types::Hash;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::quorums::{QuorumManager, CHAINLOCK_QUORUM_TYPE};
use crate::signing::{RecoveredSig, SigningManager};
use crate::LlmqError;

/// ChainLocks are disabled below this height.
pub const CHAINLOCK_ACTIVATION_HEIGHT: i32 = 1000;

/// Parked locks and signing attempts this far behind the tip are dropped.
const CHAINLOCK_CLEANUP_BLOCKS: i32 = 100;

const DB_KEY_BEST_HEIGHT: &[u8] = b"H";
const DB_KEY_LOCK_PREFIX: u8 = b'L';

/// A quorum-signed (height, block hash) attestation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainLockSig {
    pub height: i32,
    pub block_hash: Hash,
    pub sig: BlsSignature,
}

impl ChainLockSig {
    pub fn new(height: i32, block_hash: Hash, sig: BlsSignature) -> Self {
        ChainLockSig { height, block_hash, sig }
    }

    pub fn request_id_for_height(height: i32) -> Hash {
        let mut writer = HashWriter::tagged("clsig_request");
        writer.write_i32(height);
        writer.finalize()
    }

    pub fn get_request_id(&self) -> Hash {
        Self::request_id_for_height(self.height)
    }

    pub fn sign_hash(&self, quorum_hash: &Hash) -> Hash {
        RecoveredSig::build_sign_hash(
            CHAINLOCK_QUORUM_TYPE,
            quorum_hash,
            &self.get_request_id(),
            &self.block_hash,
        )
    }
}

/// The ChainLock store. Best height is monotonically non-decreasing; locks
/// are persisted so restarts keep the reorg fence.
pub struct ChainLocksDb {
    locks_by_height: BTreeMap<i32, ChainLockSig>,
    locks_by_hash: HashMap<Hash, i32>,
    best_height: i32,
    best_hash: Hash,
    db: Option<sled::Db>,
}

impl ChainLocksDb {
    pub fn in_memory() -> Self {
        ChainLocksDb {
            locks_by_height: BTreeMap::new(),
            locks_by_hash: HashMap::new(),
            best_height: 0,
            best_hash: [0u8; 32],
            db: None,
        }
    }

    /// Open over a sled database, loading the persisted locks.
    pub fn open(db: sled::Db) -> Result<Self, LlmqError> {
        let mut result = ChainLocksDb {
            locks_by_height: BTreeMap::new(),
            locks_by_hash: HashMap::new(),
            best_height: 0,
            best_hash: [0u8; 32],
            db: Some(db),
        };
        result.load()?;
        Ok(result)
    }

    fn lock_key(height: i32) -> Vec<u8> {
        let mut key = vec![DB_KEY_LOCK_PREFIX];
        key.extend_from_slice(&height.to_be_bytes());
        key
    }

    fn load(&mut self) -> Result<(), LlmqError> {
        let db = match &self.db {
            Some(db) => db,
            None => return Ok(()),
        };
        for item in db.scan_prefix([DB_KEY_LOCK_PREFIX]) {
            let (_, value) = item?;
            let clsig: ChainLockSig = bincode::deserialize(&value)?;
            self.locks_by_hash.insert(clsig.block_hash, clsig.height);
            if clsig.height > self.best_height {
                self.best_height = clsig.height;
                self.best_hash = clsig.block_hash;
            }
            self.locks_by_height.insert(clsig.height, clsig);
        }
        Ok(())
    }

    /// Install a lock. Writes below the best height are rejected; a write at
    /// the best height must carry the same block hash.
    pub fn write_chain_lock(&mut self, clsig: &ChainLockSig) -> bool {
        if self.best_height > 0 && clsig.height < self.best_height {
            warn!(
                "rejecting chain lock at height {} (best is {})",
                clsig.height, self.best_height
            );
            return false;
        }
        if let Some(existing) = self.locks_by_height.get(&clsig.height) {
            if existing.block_hash != clsig.block_hash {
                return false;
            }
        }

        if let Some(db) = &self.db {
            let encode = bincode::serialize(clsig).expect("clsig serialization");
            if let Err(err) = db.insert(Self::lock_key(clsig.height), encode) {
                warn!("failed to persist chain lock: {err}");
            }
            let best = clsig.height.max(self.best_height);
            if let Err(err) = db.insert(DB_KEY_BEST_HEIGHT, best.to_be_bytes().to_vec()) {
                warn!("failed to persist best chain lock height: {err}");
            }
        }

        self.locks_by_hash.insert(clsig.block_hash, clsig.height);
        self.locks_by_height.insert(clsig.height, clsig.clone());
        if clsig.height > self.best_height {
            self.best_height = clsig.height;
            self.best_hash = clsig.block_hash;
        }
        info!("installed chain lock at height {}", clsig.height);
        true
    }

    pub fn get_chain_lock(&self, height: i32) -> Option<&ChainLockSig> {
        self.locks_by_height.get(&height)
    }

    pub fn is_height_locked(&self, height: i32) -> bool {
        self.locks_by_height.contains_key(&height)
    }

    pub fn has_chain_lock(&self, block_hash: &Hash) -> bool {
        self.locks_by_hash.contains_key(block_hash)
    }

    pub fn best_height(&self) -> i32 {
        self.best_height
    }

    pub fn best_hash(&self) -> &Hash {
        &self.best_hash
    }
}

struct ChainLocksState {
    db: ChainLocksDb,
    /// Valid locks for blocks we do not have yet, keyed by height.
    pending_locks: BTreeMap<i32, ChainLockSig>,
    /// Heights with an in-flight signing attempt.
    signing_heights: HashSet<i32>,
    last_cleanup_height: i32,
    conflict_count: u64,
}

/// Orchestrates ChainLock signing at the tip and enforces the fork-choice
/// consequences of installed locks.
pub struct ChainLocksManager {
    state: Mutex<ChainLocksState>,
    signing_manager: Arc<SigningManager>,
    quorum_manager: Arc<QuorumManager>,
}

impl ChainLocksManager {
    pub fn new(
        signing_manager: Arc<SigningManager>,
        quorum_manager: Arc<QuorumManager>,
        db: ChainLocksDb,
    ) -> Self {
        ChainLocksManager {
            state: Mutex::new(ChainLocksState {
                db,
                pending_locks: BTreeMap::new(),
                signing_heights: HashSet::new(),
                last_cleanup_height: 0,
                conflict_count: 0,
            }),
            signing_manager,
            quorum_manager,
        }
    }

    pub fn is_active_at(&self, height: i32) -> bool {
        height >= CHAINLOCK_ACTIVATION_HEIGHT
    }

    /// Try to get the designated quorum to sign the block at `pindex`.
    pub fn try_sign_chain_lock(&self, pindex: &Arc<BlockIndex>) -> bool {
        if !self.is_active_at(pindex.height) {
            return false;
        }

        {
            let mut guard = self.state.lock().unwrap();
            if guard.db.is_height_locked(pindex.height) {
                return true;
            }
            if !guard.signing_heights.insert(pindex.height) {
                return false;
            }
        }

        let request_id = ChainLockSig::request_id_for_height(pindex.height);
        if !self.signing_manager.async_sign(CHAINLOCK_QUORUM_TYPE, &request_id, &pindex.hash) {
            self.state.lock().unwrap().signing_heights.remove(&pindex.height);
            return false;
        }

        if let Some(recovered) = self.signing_manager.try_recover_signature(
            CHAINLOCK_QUORUM_TYPE,
            &request_id,
            &pindex.hash,
        ) {
            let clsig = ChainLockSig::new(pindex.height, pindex.hash, recovered.sig);
            let mut state = ValidationState::new();
            self.process_chain_lock(&clsig, Some(pindex), &mut state);
        }
        true
    }

    /// Validate and install a ChainLock. `pindex` is the block index for the
    /// locked hash if we have it; without it a valid lock is parked and
    /// retried on the next tip update.
    pub fn process_chain_lock(
        &self,
        clsig: &ChainLockSig,
        pindex: Option<&Arc<BlockIndex>>,
        state: &mut ValidationState,
    ) -> bool {
        {
            let mut guard = self.state.lock().unwrap();
            if guard.db.has_chain_lock(&clsig.block_hash) {
                return true;
            }
            let best = guard.db.best_height();
            if clsig.height <= best {
                if let Some(existing) = guard.db.get_chain_lock(clsig.height) {
                    if existing.block_hash != clsig.block_hash {
                        guard.conflict_count += 1;
                        warn!("chain lock conflict at height {}", clsig.height);
                        return state.dos(100, RejectCode::Duplicate, "chainlock-conflict");
                    }
                }
                return true;
            }
        }

        if !self.verify_chain_lock(clsig) {
            return state.dos(100, RejectCode::Invalid, "bad-chainlock-sig");
        }

        let pindex = match pindex {
            Some(pindex) => pindex,
            None => {
                debug!(
                    "parking chain lock for unknown block {} at height {}",
                    hex::encode(&clsig.block_hash[..8]),
                    clsig.height
                );
                self.state
                    .lock()
                    .unwrap()
                    .pending_locks
                    .insert(clsig.height, clsig.clone());
                return true;
            }
        };

        if pindex.height != clsig.height || pindex.hash != clsig.block_hash {
            return state.dos(100, RejectCode::Invalid, "chainlock-height-mismatch");
        }

        let mut guard = self.state.lock().unwrap();
        if !guard.db.write_chain_lock(clsig) {
            return false;
        }
        guard.pending_locks.remove(&clsig.height);
        guard.signing_heights.remove(&clsig.height);
        true
    }

    /// Resolve the designated quorum for the lock's request and verify the
    /// recovered signature against it.
    pub fn verify_chain_lock(&self, clsig: &ChainLockSig) -> bool {
        let request_id = clsig.get_request_id();
        let quorum = match self
            .quorum_manager
            .select_quorum_for_signing(CHAINLOCK_QUORUM_TYPE, &request_id)
        {
            Some(quorum) => quorum,
            None => {
                debug!("no valid quorum to verify chain lock at height {}", clsig.height);
                return false;
            }
        };
        let public_key = match &quorum.public_key {
            Some(key) => key,
            None => return false,
        };
        clsig.sig.verify_insecure(public_key, &clsig.sign_hash(&quorum.quorum_hash))
    }

    pub fn is_height_locked(&self, height: i32) -> bool {
        self.state.lock().unwrap().db.is_height_locked(height)
    }

    pub fn has_chain_lock(&self, block_hash: &Hash) -> bool {
        self.state.lock().unwrap().db.has_chain_lock(block_hash)
    }

    pub fn best_chain_lock_height(&self) -> i32 {
        self.state.lock().unwrap().db.best_height()
    }

    pub fn best_chain_lock(&self) -> Option<ChainLockSig> {
        let guard = self.state.lock().unwrap();
        guard.db.get_chain_lock(guard.db.best_height()).cloned()
    }

    pub fn conflict_count(&self) -> u64 {
        self.state.lock().unwrap().conflict_count
    }

    /// Fork choice: a chain-locked candidate beats an unlocked one; with
    /// equal lock status, more work wins.
    pub fn should_prefer(&self, a: &Arc<BlockIndex>, b: &Arc<BlockIndex>) -> bool {
        let a_locked = self.has_chain_lock(&a.hash);
        let b_locked = self.has_chain_lock(&b.hash);
        if a_locked != b_locked {
            return a_locked;
        }
        a.chain_work > b.chain_work
    }

    /// A reorg is allowed only if the fork point is at or above the best
    /// locked height.
    pub fn can_reorg(&self, new_tip: &Arc<BlockIndex>, old_tip: &Arc<BlockIndex>) -> bool {
        let fork = match last_common_ancestor(new_tip, old_tip) {
            Some(fork) => fork,
            None => return true,
        };
        let best = self.best_chain_lock_height();
        if fork.height < best {
            warn!(
                "rejecting reorg: fork at height {} below chain lock at {}",
                fork.height, best
            );
            return false;
        }
        true
    }

    /// Tip update: retry parked locks whose block has arrived, then try to
    /// sign the new tip.
    pub fn updated_block_tip(&self, pindex: &Arc<BlockIndex>) {
        let parked: Vec<ChainLockSig> = {
            let guard = self.state.lock().unwrap();
            guard.pending_locks.values().cloned().collect()
        };
        for clsig in parked {
            if clsig.height > pindex.height {
                continue;
            }
            if let Some(block_index) = pindex.ancestor(clsig.height) {
                if block_index.hash == clsig.block_hash {
                    let mut state = ValidationState::new();
                    self.process_chain_lock(&clsig, Some(&block_index), &mut state);
                }
            }
        }

        if self.is_active_at(pindex.height) {
            self.try_sign_chain_lock(pindex);
        }
    }

    /// Periodic cleanup of stale signing attempts and parked locks.
    pub fn cleanup(&self, current_height: i32) {
        let mut guard = self.state.lock().unwrap();
        if current_height <= guard.last_cleanup_height + CHAINLOCK_CLEANUP_BLOCKS {
            return;
        }
        guard.last_cleanup_height = current_height;
        let horizon = current_height - CHAINLOCK_CLEANUP_BLOCKS;
        guard.signing_heights.retain(|height| *height >= horizon);
        guard.pending_locks.retain(|height, _| *height >= horizon);
    }
}
