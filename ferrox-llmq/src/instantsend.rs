//! InstantSend: quorum-signed locks on transaction inputs, giving fast
//! finality and double-spend protection ahead of confirmation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use ferrox_chain::{Block, RejectCode, ValidationState};
use ferrox_crypto::bls::BlsSignature;
use ferrox_crypto::hash::HashWriter;
use ferrox_shared_types::{Hash, OutPoint, Transaction};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::quorums::{QuorumManager, INSTANTSEND_QUORUM_TYPE};
use crate::signing::{RecoveredSig, SigningManager};

/// Transactions with more inputs than this are not eligible for locking.
pub const INSTANTSEND_MAX_INPUTS: usize = 32;

/// Pending lock attempts older than this many seconds are dropped.
pub const PENDING_REQUEST_TIMEOUT_SECS: u64 = 60;

/// A quorum-signed attestation that a set of outpoints may only be spent by
/// the named transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstantSendLock {
    pub inputs: Vec<OutPoint>,
    pub txid: Hash,
    pub quorum_hash: Hash,
    pub sig: BlsSignature,
}

impl InstantSendLock {
    pub fn get_hash(&self) -> Hash {
        let bytes = bincode::serialize(self).expect("islock serialization");
        *blake3::hash(&bytes).as_bytes()
    }

    /// Request id binding the set of inputs, not their order.
    pub fn request_id_for_inputs(inputs: &[OutPoint]) -> Hash {
        let mut sorted = inputs.to_vec();
        sorted.sort();
        let mut writer = HashWriter::tagged("islock_request");
        for input in &sorted {
            writer.write(&input.encode_to_vec());
        }
        writer.finalize()
    }

    pub fn get_request_id(&self) -> Hash {
        Self::request_id_for_inputs(&self.inputs)
    }

    pub fn get_sign_hash(&self) -> Hash {
        RecoveredSig::build_sign_hash(
            INSTANTSEND_QUORUM_TYPE,
            &self.quorum_hash,
            &self.get_request_id(),
            &self.txid,
        )
    }
}

/// The lock database: one lock per hash, indexed by txid and by every locked
/// outpoint. Writes and removals keep all three indexes in step.
#[derive(Default)]
pub struct InstantSendDb {
    locks_by_id: HashMap<Hash, InstantSendLock>,
    txid_to_lock: HashMap<Hash, Hash>,
    input_locks: HashMap<OutPoint, Hash>,
}

impl InstantSendDb {
    pub fn write_lock(&mut self, lock: InstantSendLock) {
        let hash = lock.get_hash();
        self.txid_to_lock.insert(lock.txid, hash);
        for input in &lock.inputs {
            self.input_locks.insert(input.clone(), hash);
        }
        self.locks_by_id.insert(hash, lock);
    }

    pub fn remove_lock(&mut self, hash: &Hash) {
        if let Some(lock) = self.locks_by_id.remove(hash) {
            self.txid_to_lock.remove(&lock.txid);
            for input in &lock.inputs {
                self.input_locks.remove(input);
            }
        }
    }

    pub fn get_lock(&self, hash: &Hash) -> Option<&InstantSendLock> {
        self.locks_by_id.get(hash)
    }

    pub fn get_lock_by_txid(&self, txid: &Hash) -> Option<&InstantSendLock> {
        self.txid_to_lock.get(txid).and_then(|hash| self.locks_by_id.get(hash))
    }

    pub fn get_lock_for_input(&self, outpoint: &OutPoint) -> Option<&InstantSendLock> {
        self.input_locks.get(outpoint).and_then(|hash| self.locks_by_id.get(hash))
    }

    pub fn is_input_locked(&self, outpoint: &OutPoint) -> bool {
        self.input_locks.contains_key(outpoint)
    }

    pub fn is_tx_locked(&self, txid: &Hash) -> bool {
        self.txid_to_lock.contains_key(txid)
    }

    pub fn locked_outpoints(&self) -> HashSet<OutPoint> {
        self.input_locks.keys().cloned().collect()
    }

    pub fn lock_count(&self) -> usize {
        self.locks_by_id.len()
    }
}

struct InstantSendState {
    db: InstantSendDb,
    pending_txs: HashMap<Hash, Transaction>,
    pending_requests: HashMap<Hash, u64>,
}

/// Orchestrates signing sessions for eligible transactions and maintains the
/// lock database.
pub struct InstantSendManager {
    state: Mutex<InstantSendState>,
    signing_manager: Arc<SigningManager>,
    quorum_manager: Arc<QuorumManager>,
}

fn unix_time() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

impl InstantSendManager {
    pub fn new(signing_manager: Arc<SigningManager>, quorum_manager: Arc<QuorumManager>) -> Self {
        InstantSendManager {
            state: Mutex::new(InstantSendState {
                db: InstantSendDb::default(),
                pending_txs: HashMap::new(),
                pending_requests: HashMap::new(),
            }),
            signing_manager,
            quorum_manager,
        }
    }

    /// Locking is enabled once the InstantSend quorum type has an active set.
    pub fn is_enabled(&self) -> bool {
        !self.quorum_manager.get_active_quorums(INSTANTSEND_QUORUM_TYPE).is_empty()
    }

    /// Eligibility: not coinbase, at most 32 inputs. Input-confirmation
    /// checks stay with the mempool.
    pub fn can_tx_be_locked(&self, tx: &Transaction) -> bool {
        !tx.is_coinbase() && !tx.inputs.is_empty() && tx.inputs.len() <= INSTANTSEND_MAX_INPUTS
    }

    /// Whether any input of `tx` is already locked to a different txid.
    pub fn has_conflicting_lock(&self, tx: &Transaction) -> bool {
        let txid = tx.txid();
        let guard = self.state.lock().unwrap();
        tx.inputs.iter().any(|input| {
            guard
                .db
                .get_lock_for_input(&input.previous_output)
                .map(|lock| lock.txid != txid)
                .unwrap_or(false)
        })
    }

    pub fn is_locked(&self, txid: &Hash) -> bool {
        self.state.lock().unwrap().db.is_tx_locked(txid)
    }

    pub fn is_input_locked(&self, outpoint: &OutPoint) -> bool {
        self.state.lock().unwrap().db.is_input_locked(outpoint)
    }

    pub fn get_lock_by_txid(&self, txid: &Hash) -> Option<InstantSendLock> {
        self.state.lock().unwrap().db.get_lock_by_txid(txid).cloned()
    }

    /// Entry point for new transactions: queue the lock attempt and try to
    /// sign right away.
    pub fn process_transaction(&self, tx: &Transaction) {
        if !self.is_enabled() || !self.can_tx_be_locked(tx) {
            return;
        }
        if self.has_conflicting_lock(tx) {
            warn!("tx {} has a conflicting lock, not signing", hex::encode(&tx.txid()[..8]));
            return;
        }

        {
            let mut guard = self.state.lock().unwrap();
            guard.pending_txs.insert(tx.txid(), tx.clone());
            guard.pending_requests.insert(tx.txid(), unix_time());
        }

        self.try_sign_lock(tx);
    }

    fn try_sign_lock(&self, tx: &Transaction) -> bool {
        let inputs: Vec<OutPoint> =
            tx.inputs.iter().map(|input| input.previous_output.clone()).collect();
        let request_id = InstantSendLock::request_id_for_inputs(&inputs);
        let txid = tx.txid();

        if !self.signing_manager.async_sign(INSTANTSEND_QUORUM_TYPE, &request_id, &txid) {
            return false;
        }

        if let Some(recovered) =
            self.signing_manager.try_recover_signature(INSTANTSEND_QUORUM_TYPE, &request_id, &txid)
        {
            let lock = InstantSendLock {
                inputs,
                txid,
                quorum_hash: recovered.quorum_hash,
                sig: recovered.sig,
            };
            let mut state = ValidationState::new();
            self.process_instant_send_lock(lock, &mut state);
        }
        true
    }

    /// Validate and commit a lock, whether locally recovered or received
    /// from the network. Conflicts are rejected before the signature is even
    /// looked at; an honest quorum never signs both sides.
    pub fn process_instant_send_lock(
        &self,
        lock: InstantSendLock,
        state: &mut ValidationState,
    ) -> bool {
        {
            let guard = self.state.lock().unwrap();
            if guard.db.is_tx_locked(&lock.txid) {
                return true;
            }
            for input in &lock.inputs {
                if let Some(existing) = guard.db.get_lock_for_input(input) {
                    if existing.txid != lock.txid {
                        warn!(
                            "conflicting lock for input {input}: {} vs {}",
                            hex::encode(&existing.txid[..8]),
                            hex::encode(&lock.txid[..8])
                        );
                        return state.dos(100, RejectCode::Duplicate, "islock-conflict");
                    }
                }
            }
        }

        if !self.verify_lock(&lock) {
            return state.dos(100, RejectCode::Invalid, "bad-islock-sig");
        }

        let mut guard = self.state.lock().unwrap();
        info!(
            "committed instant-send lock for tx {} ({} inputs)",
            hex::encode(&lock.txid[..8]),
            lock.inputs.len()
        );
        guard.pending_txs.remove(&lock.txid);
        guard.pending_requests.remove(&lock.txid);
        guard.db.write_lock(lock);
        true
    }

    /// Resolve the lock's quorum and check the recovered signature.
    pub fn verify_lock(&self, lock: &InstantSendLock) -> bool {
        let quorum =
            match self.quorum_manager.get_quorum(INSTANTSEND_QUORUM_TYPE, &lock.quorum_hash) {
                Some(quorum) => quorum,
                None => {
                    debug!("quorum not found for lock {}", hex::encode(&lock.quorum_hash[..8]));
                    return false;
                }
            };
        if !quorum.is_valid() {
            return false;
        }
        let public_key = match &quorum.public_key {
            Some(key) => key,
            None => return false,
        };
        lock.sig.verify_insecure(public_key, &lock.get_sign_hash())
    }

    /// Block connect: confirmed transactions no longer need pending retries.
    pub fn process_block(&self, block: &Block) {
        let mut guard = self.state.lock().unwrap();
        for tx in &block.txs {
            let txid = tx.txid();
            guard.pending_txs.remove(&txid);
            guard.pending_requests.remove(&txid);
        }
    }

    /// Block disconnect: locks stay — they still forbid double-spends of
    /// their inputs through the reorg.
    pub fn undo_block(&self, _block: &Block) {}

    /// Tip update: retry every pending attempt that is still eligible.
    pub fn updated_block_tip(&self) {
        let pending: Vec<Transaction> = {
            let guard = self.state.lock().unwrap();
            guard.pending_txs.values().cloned().collect()
        };
        for tx in pending {
            if !self.can_tx_be_locked(&tx) || self.has_conflicting_lock(&tx) {
                let mut guard = self.state.lock().unwrap();
                let txid = tx.txid();
                guard.pending_txs.remove(&txid);
                guard.pending_requests.remove(&txid);
                continue;
            }
            self.try_sign_lock(&tx);
        }
    }

    /// Drop pending attempts older than the timeout.
    pub fn cleanup(&self) {
        self.cleanup_expired_pending(unix_time());
    }

    /// Drop pending attempts older than the timeout. `now` is unix seconds.
    pub fn cleanup_expired_pending(&self, now: u64) {
        let mut guard = self.state.lock().unwrap();
        let expired: Vec<Hash> = guard
            .pending_requests
            .iter()
            .filter(|(_, created)| now.saturating_sub(**created) > PENDING_REQUEST_TIMEOUT_SECS)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in expired {
            debug!("expiring pending instant-send request {}", hex::encode(&txid[..8]));
            guard.pending_txs.remove(&txid);
            guard.pending_requests.remove(&txid);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending_txs.len()
    }

    pub fn lock_count(&self) -> usize {
        self.state.lock().unwrap().db.lock_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrox_crypto::bls::BlsSecretKey;

    fn outpoint(n: u8) -> OutPoint {
        OutPoint::new([n; 32], 0)
    }

    fn dummy_sig() -> BlsSignature {
        BlsSecretKey::generate().sign(&[0u8; 32])
    }

    #[test]
    fn request_id_ignores_input_order() {
        let a = vec![outpoint(1), outpoint(2), outpoint(3)];
        let b = vec![outpoint(3), outpoint(1), outpoint(2)];
        assert_eq!(
            InstantSendLock::request_id_for_inputs(&a),
            InstantSendLock::request_id_for_inputs(&b)
        );

        let c = vec![outpoint(1), outpoint(2)];
        assert_ne!(
            InstantSendLock::request_id_for_inputs(&a),
            InstantSendLock::request_id_for_inputs(&c)
        );
    }

    #[test]
    fn db_indexes_stay_in_step() {
        let mut db = InstantSendDb::default();
        let lock = InstantSendLock {
            inputs: vec![outpoint(1), outpoint(2)],
            txid: [0xAA; 32],
            quorum_hash: [0xBB; 32],
            sig: dummy_sig(),
        };
        let hash = lock.get_hash();
        db.write_lock(lock);

        assert!(db.is_tx_locked(&[0xAA; 32]));
        assert!(db.is_input_locked(&outpoint(1)));
        assert!(db.is_input_locked(&outpoint(2)));
        assert_eq!(db.get_lock_for_input(&outpoint(1)).unwrap().txid, [0xAA; 32]);
        assert_eq!(db.get_lock_by_txid(&[0xAA; 32]).unwrap().get_hash(), hash);

        db.remove_lock(&hash);
        assert!(!db.is_tx_locked(&[0xAA; 32]));
        assert!(!db.is_input_locked(&outpoint(1)));
        assert!(!db.is_input_locked(&outpoint(2)));
        assert_eq!(db.lock_count(), 0);
    }

    #[test]
    fn lock_roundtrips_through_serde() {
        let lock = InstantSendLock {
            inputs: vec![outpoint(5)],
            txid: [0xDD; 32],
            quorum_hash: [0xEE; 32],
            sig: dummy_sig(),
        };
        let bytes = bincode::serialize(&lock).unwrap();
        let decoded: InstantSendLock = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.get_hash(), lock.get_hash());
        assert_eq!(decoded.txid, lock.txid);
        assert_eq!(decoded.inputs, lock.inputs);
    }
}
