//! Signing sessions: collects partial signature shares per (quorum,
//! request-id) and recovers threshold signatures.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use ferrox_crypto::bls::{
    BlsId, BlsSignature, LABEL_CHAINLOCK, LABEL_INSTANTSEND, LABEL_QUORUM,
};
use ferrox_crypto::hash::HashWriter;
use ferrox_shared_types::Hash;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::quorums::{LlmqType, Quorum, QuorumManager};

/// Sessions are dropped when they fall this far behind the tip.
const SESSION_EXPIRY_BLOCKS: i32 = 100;

/// Hard cap on retained sessions; beyond it the caches are cleared.
const MAX_SESSIONS: usize = 10_000;

/// A threshold-recovered signature for one signing session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveredSig {
    pub llmq_type: LlmqType,
    pub quorum_hash: Hash,
    /// The request id of the session.
    pub id: Hash,
    /// The message hash that was signed.
    pub msg_hash: Hash,
    pub sig: BlsSignature,
}

/// Message-space label for a quorum type, keeping the signature uses
/// disjoint: InstantSend locks, ChainLocks, and everything else.
fn sign_label(llmq_type: LlmqType) -> &'static str {
    match llmq_type {
        LlmqType::Llmq50_60 => LABEL_INSTANTSEND,
        LlmqType::Llmq400_60 => LABEL_CHAINLOCK,
        _ => LABEL_QUORUM,
    }
}

impl RecoveredSig {
    /// The hash the quorum actually signs for a session.
    pub fn build_sign_hash(
        llmq_type: LlmqType,
        quorum_hash: &Hash,
        id: &Hash,
        msg_hash: &Hash,
    ) -> Hash {
        let mut writer = HashWriter::tagged(sign_label(llmq_type));
        writer.write_u8(llmq_type.tag()).write(quorum_hash).write(id).write(msg_hash);
        writer.finalize()
    }

    pub fn sign_hash(&self) -> Hash {
        Self::build_sign_hash(self.llmq_type, &self.quorum_hash, &self.id, &self.msg_hash)
    }
}

#[derive(Default)]
struct SigningState {
    /// request-id -> (member proTxHash -> share). The BTreeMap keeps shares
    /// in ascending proTxHash order, the canonical recovery order.
    sig_shares: HashMap<Hash, BTreeMap<Hash, BlsSignature>>,
    recovered_sigs: HashMap<Hash, RecoveredSig>,
    /// Tip height at which each session was first seen, for expiry.
    session_heights: HashMap<Hash, i32>,
}

/// Collects signature shares and recovers threshold signatures.
pub struct SigningManager {
    state: Mutex<SigningState>,
    quorum_manager: Arc<QuorumManager>,
}

impl SigningManager {
    pub fn new(quorum_manager: Arc<QuorumManager>) -> Self {
        SigningManager { state: Mutex::new(SigningState::default()), quorum_manager }
    }

    pub fn quorum_manager(&self) -> &Arc<QuorumManager> {
        &self.quorum_manager
    }

    /// Contribute our share to a session if this node is a member of the
    /// designated quorum, then opportunistically try recovery. Non-members
    /// return false silently.
    pub fn async_sign(&self, llmq_type: LlmqType, id: &Hash, msg_hash: &Hash) -> bool {
        let quorum = match self.quorum_manager.select_quorum_for_signing(llmq_type, id) {
            Some(quorum) => quorum,
            None => {
                debug!("no quorum available for signing session {}", hex::encode(&id[..8]));
                return false;
            }
        };

        let my_pro_tx_hash = match self.quorum_manager.my_pro_tx_hash() {
            Some(hash) if quorum.is_member(&hash) => hash,
            _ => {
                debug!("not a member of the designated quorum, skipping sign");
                return false;
            }
        };

        let sign_hash =
            RecoveredSig::build_sign_hash(llmq_type, &quorum.quorum_hash, id, msg_hash);
        let share = match self.quorum_manager.sign_with_share(
            llmq_type,
            &quorum.quorum_hash,
            &sign_hash,
        ) {
            Some(share) => share,
            None => {
                debug!("no secret key share for quorum {}", hex::encode(&quorum.quorum_hash[..8]));
                return false;
            }
        };

        self.store_share(id, my_pro_tx_hash, share);
        debug!("created sig share for session {}", hex::encode(&id[..8]));

        self.try_recover_signature(llmq_type, id, msg_hash);
        true
    }

    /// Record a share received from another member. Shares from non-members
    /// of the designated quorum are filtered at recovery time.
    pub fn process_sig_share(
        &self,
        id: &Hash,
        pro_tx_hash: &Hash,
        share: BlsSignature,
    ) -> bool {
        self.store_share(id, *pro_tx_hash, share);
        true
    }

    fn store_share(&self, id: &Hash, pro_tx_hash: Hash, share: BlsSignature) {
        let mut guard = self.state.lock().unwrap();
        let height = self.quorum_manager.tip_height();
        guard.session_heights.entry(*id).or_insert(height);
        guard.sig_shares.entry(*id).or_default().insert(pro_tx_hash, share);
    }

    /// Attempt threshold recovery for a session. Returns the recovered
    /// signature once at least `threshold` member shares are available and
    /// the recovered signature verifies under the quorum key.
    pub fn try_recover_signature(
        &self,
        llmq_type: LlmqType,
        id: &Hash,
        msg_hash: &Hash,
    ) -> Option<RecoveredSig> {
        {
            let guard = self.state.lock().unwrap();
            if let Some(recovered) = guard.recovered_sigs.get(id) {
                return Some(recovered.clone());
            }
        }

        let quorum = self.quorum_manager.select_quorum_for_signing(llmq_type, id)?;
        let threshold = quorum.threshold();

        let member_shares: Vec<(BlsId, BlsSignature)> = {
            let guard = self.state.lock().unwrap();
            let shares = guard.sig_shares.get(id)?;
            shares
                .iter()
                .filter(|(pro_tx_hash, _)| quorum.is_member(pro_tx_hash))
                .take(threshold)
                .map(|(pro_tx_hash, share)| (BlsId::from_hash(pro_tx_hash), *share))
                .collect()
        };

        if member_shares.len() < threshold {
            return None;
        }

        let sig = match BlsSignature::recover_threshold_signature(&member_shares, threshold) {
            Ok(sig) => sig,
            Err(err) => {
                warn!("threshold recovery failed for {}: {err}", hex::encode(&id[..8]));
                return None;
            }
        };

        let recovered = RecoveredSig {
            llmq_type,
            quorum_hash: quorum.quorum_hash,
            id: *id,
            msg_hash: *msg_hash,
            sig,
        };

        if !self.verify_recovered_sig(&recovered) {
            warn!(
                "recovered signature did not verify for session {}",
                hex::encode(&id[..8])
            );
            return None;
        }

        info!("recovered threshold signature for session {}", hex::encode(&id[..8]));
        self.state
            .lock()
            .unwrap()
            .recovered_sigs
            .insert(*id, recovered.clone());
        Some(recovered)
    }

    pub fn get_recovered_sig(&self, id: &Hash) -> Option<RecoveredSig> {
        self.state.lock().unwrap().recovered_sigs.get(id).cloned()
    }

    /// Verify a recovered signature against its quorum's aggregated key.
    pub fn verify_recovered_sig(&self, recovered: &RecoveredSig) -> bool {
        let quorum = match self
            .quorum_manager
            .get_quorum(recovered.llmq_type, &recovered.quorum_hash)
        {
            Some(quorum) => quorum,
            None => return false,
        };
        Self::verify_against_quorum(recovered, &quorum)
    }

    pub fn verify_against_quorum(recovered: &RecoveredSig, quorum: &Quorum) -> bool {
        if !quorum.is_valid() {
            return false;
        }
        let public_key = match &quorum.public_key {
            Some(key) => key,
            None => return false,
        };
        recovered.sig.verify_insecure(public_key, &recovered.sign_hash())
    }

    /// Drop sessions that have expired or blown the cache bound.
    pub fn cleanup(&self, current_height: i32) {
        let mut guard = self.state.lock().unwrap();
        let expired: Vec<Hash> = guard
            .session_heights
            .iter()
            .filter(|(_, height)| **height < current_height - SESSION_EXPIRY_BLOCKS)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            guard.sig_shares.remove(&id);
            guard.recovered_sigs.remove(&id);
            guard.session_heights.remove(&id);
        }

        if guard.sig_shares.len() > MAX_SESSIONS {
            warn!("signature share cache overflow, clearing");
            guard.sig_shares.clear();
            guard.session_heights.clear();
        }
        if guard.recovered_sigs.len() > MAX_SESSIONS {
            guard.recovered_sigs.clear();
        }
    }
}
