//! Long-living masternode quorums: deterministic committee selection from
//! the masternode list and the cache of recently formed quorums.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ferrox_chain::BlockIndex;
use ferrox_crypto::bls::{BlsPublicKey, BlsSecretKey, BlsSignature};
use ferrox_crypto::hash::HashWriter;
use ferrox_evo::deterministicmns::MasternodeListManager;
use ferrox_shared_types::Hash;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Quorum type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LlmqType {
    /// 50 members, 60% threshold (InstantSend).
    Llmq50_60 = 1,
    /// 400 members, 60% threshold (ChainLocks).
    Llmq400_60 = 2,
    /// 400 members, 85% threshold (reserved).
    Llmq400_85 = 3,
    /// 100 members, 67% threshold (general purpose).
    Llmq100_67 = 4,
}

pub const INSTANTSEND_QUORUM_TYPE: LlmqType = LlmqType::Llmq50_60;
pub const CHAINLOCK_QUORUM_TYPE: LlmqType = LlmqType::Llmq400_60;

pub const ALL_QUORUM_TYPES: [LlmqType; 4] = [
    LlmqType::Llmq50_60,
    LlmqType::Llmq400_60,
    LlmqType::Llmq400_85,
    LlmqType::Llmq100_67,
];

impl LlmqType {
    pub fn tag(&self) -> u8 {
        *self as u8
    }
}

/// Fixed parameters of a quorum type.
#[derive(Debug, Clone, Copy)]
pub struct LlmqParams {
    pub llmq_type: LlmqType,
    pub name: &'static str,
    /// Number of members.
    pub size: usize,
    /// Minimum valid members for a valid quorum.
    pub min_size: usize,
    /// Signing threshold, percent.
    pub threshold: usize,
    /// Blocks between quorum formations.
    pub interval: i32,
    /// Blocks per DKG phase.
    pub dkg_phase_blocks: i32,
    /// Number of quorums kept in the active signing set.
    pub active_count: usize,
}

const LLMQ_50_60_PARAMS: LlmqParams = LlmqParams {
    llmq_type: LlmqType::Llmq50_60,
    name: "llmq_50_60",
    size: 50,
    min_size: 40,
    threshold: 60,
    interval: 24,
    dkg_phase_blocks: 6,
    active_count: 24,
};

const LLMQ_400_60_PARAMS: LlmqParams = LlmqParams {
    llmq_type: LlmqType::Llmq400_60,
    name: "llmq_400_60",
    size: 400,
    min_size: 300,
    threshold: 60,
    interval: 288,
    dkg_phase_blocks: 20,
    active_count: 4,
};

const LLMQ_400_85_PARAMS: LlmqParams = LlmqParams {
    llmq_type: LlmqType::Llmq400_85,
    name: "llmq_400_85",
    size: 400,
    min_size: 350,
    threshold: 85,
    interval: 576,
    dkg_phase_blocks: 20,
    active_count: 4,
};

const LLMQ_100_67_PARAMS: LlmqParams = LlmqParams {
    llmq_type: LlmqType::Llmq100_67,
    name: "llmq_100_67",
    size: 100,
    min_size: 80,
    threshold: 67,
    interval: 24,
    dkg_phase_blocks: 6,
    active_count: 24,
};

pub fn llmq_params(llmq_type: LlmqType) -> &'static LlmqParams {
    match llmq_type {
        LlmqType::Llmq50_60 => &LLMQ_50_60_PARAMS,
        LlmqType::Llmq400_60 => &LLMQ_400_60_PARAMS,
        LlmqType::Llmq400_85 => &LLMQ_400_85_PARAMS,
        LlmqType::Llmq100_67 => &LLMQ_100_67_PARAMS,
    }
}

/// One quorum member: identity, operator key, and whether the entry was
/// valid at formation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumMember {
    pub pro_tx_hash: Hash,
    pub operator_pubkey: Option<BlsPublicKey>,
    pub valid: bool,
}

/// A formed committee. Reconstructable from type + block index alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quorum {
    pub llmq_type: LlmqType,
    pub quorum_hash: Hash,
    pub height: i32,
    /// Members in selection order.
    pub members: Vec<QuorumMember>,
    /// Sum of all valid members' operator keys in G1.
    pub public_key: Option<BlsPublicKey>,
    pub valid_member_count: usize,
    pub valid: bool,
}

impl Quorum {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_member(&self, pro_tx_hash: &Hash) -> bool {
        self.members.iter().any(|m| m.pro_tx_hash == *pro_tx_hash)
    }

    pub fn member_index(&self, pro_tx_hash: &Hash) -> Option<usize> {
        self.members.iter().position(|m| m.pro_tx_hash == *pro_tx_hash)
    }

    /// Number of shares needed to recover a signature.
    pub fn threshold(&self) -> usize {
        let params = llmq_params(self.llmq_type);
        (self.valid_member_count * params.threshold + 99) / 100
    }

    /// Identity of the quorum formed for `llmq_type` at a block.
    pub fn calc_quorum_hash(llmq_type: LlmqType, block_hash: &Hash) -> Hash {
        let mut writer = HashWriter::tagged("LLMQ_QUORUM");
        writer.write_u8(llmq_type.tag()).write(block_hash);
        writer.finalize()
    }

    /// Per-formation selection modifier.
    pub fn calc_modifier(llmq_type: LlmqType, block_hash: &Hash) -> Hash {
        let mut writer = HashWriter::tagged("LLMQ_MODIFIER");
        writer.write_u8(llmq_type.tag()).write(block_hash);
        writer.finalize()
    }

    /// Per-member selection score under a modifier; lowest N win.
    pub fn calc_member_score(modifier: &Hash, pro_tx_hash: &Hash) -> Hash {
        let mut writer = HashWriter::tagged("LLMQ_SCORE");
        writer.write(modifier).write(pro_tx_hash);
        writer.finalize()
    }

    /// Session-to-quorum selection score; the active quorum minimizing this
    /// is the designated one for a request.
    pub fn calc_selection_score(quorum_hash: &Hash, request_id: &Hash) -> Hash {
        let mut writer = HashWriter::tagged("LLMQ_SELECT");
        writer.write(quorum_hash).write(request_id);
        writer.finalize()
    }
}

struct QuorumManagerState {
    quorum_cache: HashMap<(LlmqType, Hash), Arc<Quorum>>,
    active_quorums: HashMap<LlmqType, Vec<Arc<Quorum>>>,
    my_pro_tx_hash: Option<Hash>,
    /// DKG-produced signing shares, keyed by (type, quorum hash). Shares
    /// never leave the manager; signing happens in `sign_with_share`.
    secret_key_shares: HashMap<(LlmqType, Hash), BlsSecretKey>,
    tip_height: i32,
}

/// Builds, caches and selects quorums.
pub struct QuorumManager {
    state: Mutex<QuorumManagerState>,
    mn_list_manager: Arc<MasternodeListManager>,
}

impl QuorumManager {
    pub fn new(mn_list_manager: Arc<MasternodeListManager>) -> Self {
        QuorumManager {
            state: Mutex::new(QuorumManagerState {
                quorum_cache: HashMap::new(),
                active_quorums: HashMap::new(),
                my_pro_tx_hash: None,
                secret_key_shares: HashMap::new(),
                tip_height: 0,
            }),
            mn_list_manager,
        }
    }

    pub fn set_my_pro_tx_hash(&self, pro_tx_hash: Hash) {
        self.state.lock().unwrap().my_pro_tx_hash = Some(pro_tx_hash);
    }

    pub fn my_pro_tx_hash(&self) -> Option<Hash> {
        self.state.lock().unwrap().my_pro_tx_hash
    }

    /// Install the signing share produced by the DKG for a quorum.
    pub fn set_secret_key_share(
        &self,
        llmq_type: LlmqType,
        quorum_hash: Hash,
        share: BlsSecretKey,
    ) {
        self.state
            .lock()
            .unwrap()
            .secret_key_shares
            .insert((llmq_type, quorum_hash), share);
    }

    pub fn has_secret_key_share(&self, llmq_type: LlmqType, quorum_hash: &Hash) -> bool {
        self.state.lock().unwrap().secret_key_shares.contains_key(&(llmq_type, *quorum_hash))
    }

    /// Sign `msg` with our share for the quorum, if the DKG gave us one.
    pub fn sign_with_share(
        &self,
        llmq_type: LlmqType,
        quorum_hash: &Hash,
        msg: &Hash,
    ) -> Option<BlsSignature> {
        let guard = self.state.lock().unwrap();
        guard
            .secret_key_shares
            .get(&(llmq_type, *quorum_hash))
            .map(|share| share.sign(msg))
    }

    pub fn tip_height(&self) -> i32 {
        self.state.lock().unwrap().tip_height
    }

    /// Build (or fetch from cache) the quorum formed at `pindex`. Quorums
    /// only form at heights divisible by the type's interval.
    pub fn build_quorum(&self, llmq_type: LlmqType, pindex: &Arc<BlockIndex>) -> Option<Arc<Quorum>> {
        let params = llmq_params(llmq_type);
        if pindex.height % params.interval != 0 {
            return None;
        }

        let quorum_hash = Quorum::calc_quorum_hash(llmq_type, &pindex.hash);
        if let Some(quorum) =
            self.state.lock().unwrap().quorum_cache.get(&(llmq_type, quorum_hash))
        {
            return Some(Arc::clone(quorum));
        }

        let selected = self.select_quorum_members(llmq_type, pindex);
        if selected.is_empty() {
            warn!(
                "not enough masternodes for {} at height {}",
                params.name, pindex.height
            );
            return None;
        }

        let mut members = Vec::with_capacity(selected.len());
        let mut member_keys = Vec::new();
        let mut valid_member_count = 0usize;
        for entry in &selected {
            let operator_pubkey = BlsPublicKey::from_slice(&entry.state.operator_pubkey).ok();
            let valid = operator_pubkey.is_some() && entry.is_valid();
            if let (true, Some(key)) = (valid, operator_pubkey) {
                member_keys.push(key);
                valid_member_count += 1;
            }
            members.push(QuorumMember {
                pro_tx_hash: entry.pro_tx_hash,
                operator_pubkey,
                valid,
            });
        }

        let public_key = BlsPublicKey::aggregate(&member_keys).ok();
        let quorum = Arc::new(Quorum {
            llmq_type,
            quorum_hash,
            height: pindex.height,
            members,
            public_key,
            valid_member_count,
            valid: valid_member_count >= params.min_size,
        });

        info!(
            "built quorum {} type={} height={} members={} valid={}",
            hex::encode(&quorum_hash[..8]),
            params.name,
            pindex.height,
            quorum.members.len(),
            quorum.valid_member_count
        );

        self.state
            .lock()
            .unwrap()
            .quorum_cache
            .insert((llmq_type, quorum_hash), Arc::clone(&quorum));
        Some(quorum)
    }

    pub fn get_quorum(&self, llmq_type: LlmqType, quorum_hash: &Hash) -> Option<Arc<Quorum>> {
        self.state
            .lock()
            .unwrap()
            .quorum_cache
            .get(&(llmq_type, *quorum_hash))
            .cloned()
    }

    /// The active signing set for a type, most recent first.
    pub fn get_active_quorums(&self, llmq_type: LlmqType) -> Vec<Arc<Quorum>> {
        self.state
            .lock()
            .unwrap()
            .active_quorums
            .get(&llmq_type)
            .cloned()
            .unwrap_or_default()
    }

    /// The designated quorum for a session: the valid active quorum with the
    /// lowest selection score for the request id.
    pub fn select_quorum_for_signing(
        &self,
        llmq_type: LlmqType,
        request_id: &Hash,
    ) -> Option<Arc<Quorum>> {
        let quorums = self.get_active_quorums(llmq_type);
        quorums
            .into_iter()
            .filter(|q| q.is_valid())
            .min_by_key(|q| Quorum::calc_selection_score(&q.quorum_hash, request_id))
    }

    pub fn is_quorum_member(&self, llmq_type: LlmqType, quorum_hash: &Hash) -> bool {
        let my_hash = match self.my_pro_tx_hash() {
            Some(hash) => hash,
            None => return false,
        };
        self.get_quorum(llmq_type, quorum_hash)
            .map(|q| q.is_member(&my_hash))
            .unwrap_or(false)
    }

    /// Rebuild the active sets for every type from the new tip.
    pub fn updated_block_tip(&self, pindex: &Arc<BlockIndex>) {
        for llmq_type in ALL_QUORUM_TYPES {
            let params = llmq_params(llmq_type);
            let mut formation_height = pindex.height - (pindex.height % params.interval);
            let mut new_active = Vec::new();

            while new_active.len() < params.active_count && formation_height > 0 {
                if let Some(quorum_index) = pindex.ancestor(formation_height) {
                    if let Some(quorum) = self.build_quorum(llmq_type, &quorum_index) {
                        if quorum.is_valid() {
                            new_active.push(quorum);
                        }
                    }
                }
                formation_height -= params.interval;
            }

            let mut guard = self.state.lock().unwrap();
            guard.active_quorums.insert(llmq_type, new_active);
            guard.tip_height = pindex.height;
        }
        debug!("active quorums rebuilt at height {}", pindex.height);
    }

    /// Deterministic member selection: score every valid listed operator
    /// with a parseable operator key and take the N lowest.
    fn select_quorum_members(
        &self,
        llmq_type: LlmqType,
        pindex: &Arc<BlockIndex>,
    ) -> Vec<Arc<ferrox_evo::deterministicmns::MasternodeEntry>> {
        let params = llmq_params(llmq_type);
        let mn_list = self.mn_list_manager.get_list_for_block(pindex);
        let modifier = Quorum::calc_modifier(llmq_type, &pindex.hash);

        let mut scored: Vec<(Hash, Arc<ferrox_evo::deterministicmns::MasternodeEntry>)> =
            Vec::new();
        mn_list.for_each_entry(true, |entry| {
            if entry.state.operator_pubkey.is_empty() {
                return;
            }
            scored.push((
                Quorum::calc_member_score(&modifier, &entry.pro_tx_hash),
                Arc::clone(entry),
            ));
        });

        scored.sort_by(|a, b| a.0.cmp(&b.0));
        scored.truncate(params.size);
        scored.into_iter().map(|(_, entry)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_table() {
        let p = llmq_params(LlmqType::Llmq50_60);
        assert_eq!((p.size, p.min_size, p.threshold, p.interval, p.active_count), (50, 40, 60, 24, 24));
        let p = llmq_params(LlmqType::Llmq400_60);
        assert_eq!((p.size, p.min_size, p.threshold, p.interval, p.active_count), (400, 300, 60, 288, 4));
        let p = llmq_params(LlmqType::Llmq400_85);
        assert_eq!((p.size, p.min_size, p.threshold, p.interval, p.active_count), (400, 350, 85, 576, 4));
        let p = llmq_params(LlmqType::Llmq100_67);
        assert_eq!((p.size, p.min_size, p.threshold, p.interval, p.active_count), (100, 80, 67, 24, 24));
    }

    #[test]
    fn quorum_hash_depends_on_type_and_block() {
        let block = [0x11u8; 32];
        let a = Quorum::calc_quorum_hash(LlmqType::Llmq50_60, &block);
        let b = Quorum::calc_quorum_hash(LlmqType::Llmq400_60, &block);
        assert_ne!(a, b);
        let c = Quorum::calc_quorum_hash(LlmqType::Llmq50_60, &[0x12u8; 32]);
        assert_ne!(a, c);
        assert_eq!(a, Quorum::calc_quorum_hash(LlmqType::Llmq50_60, &block));
    }

    #[test]
    fn threshold_rounds_up() {
        let quorum = Quorum {
            llmq_type: LlmqType::Llmq50_60,
            quorum_hash: [0u8; 32],
            height: 0,
            members: Vec::new(),
            public_key: None,
            valid_member_count: 41,
            valid: true,
        };
        // ceil(41 * 60 / 100) = 25
        assert_eq!(quorum.threshold(), 25);

        let quorum = Quorum { valid_member_count: 50, ..quorum };
        assert_eq!(quorum.threshold(), 30);
    }
}
