//! Provider-transaction payloads: the four registration/update/revoke
//! operations carried in extended-version transactions, their wire codec,
//! and their validation against the masternode list.

use ferrox_chain::{RejectCode, ValidationState};
use ferrox_crypto::bls::{BlsPublicKey, BlsSignature};
use ferrox_crypto::ecdsa::check_compact_signature;
use ferrox_crypto::hash::{hash_bytes, HashWriter};
use ferrox_shared_types::script::Script;
use ferrox_shared_types::{
    Hash, KeyId, OutPoint, Service, Transaction, TX_TYPE_PROVIDER_REGISTER,
    TX_TYPE_PROVIDER_UPDATE_REGISTRAR, TX_TYPE_PROVIDER_UPDATE_REVOKE,
    TX_TYPE_PROVIDER_UPDATE_SERVICE,
};
use serde::{Deserialize, Serialize};

use crate::deterministicmns::MasternodeList;

pub const PROVIDER_TX_VERSION: u16 = 1;

/// Operator reward is expressed in basis points.
pub const MAX_OPERATOR_REWARD: u16 = 10000;

/// Revocation reasons carried by ProUpRevTx.
pub const REVOCATION_NOT_SPECIFIED: u16 = 0;
pub const REVOCATION_TERMINATION: u16 = 1;
pub const REVOCATION_COMPROMISED: u16 = 2;
pub const REVOCATION_CHANGE_OF_KEYS: u16 = 3;

/// Registers a new masternode on the network. Signed by the owner key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProRegTx {
    pub version: u16,
    pub mode: u16,
    pub collateral_outpoint: OutPoint,
    pub service: Service,
    pub owner_key_id: KeyId,
    pub operator_pubkey: Vec<u8>,
    pub voting_key_id: KeyId,
    pub operator_reward: u16,
    pub payout_script: Script,
    pub inputs_hash: Hash,
    pub signature: Vec<u8>,
}

/// Updates the advertised endpoint of a masternode. Signed by the operator
/// BLS key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProUpServTx {
    pub version: u16,
    pub pro_tx_hash: Hash,
    pub service: Service,
    pub operator_payout_script: Script,
    pub inputs_hash: Hash,
    pub signature: Vec<u8>,
}

/// Updates the operator key, voting key, or payout script. Signed by the
/// owner key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProUpRegTx {
    pub version: u16,
    pub pro_tx_hash: Hash,
    pub mode: u16,
    pub operator_pubkey: Vec<u8>,
    pub voting_key_id: KeyId,
    pub payout_script: Script,
    pub inputs_hash: Hash,
    pub signature: Vec<u8>,
}

/// Revokes a masternode registration. Signed by the operator BLS key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProUpRevTx {
    pub version: u16,
    pub pro_tx_hash: Hash,
    pub reason: u16,
    pub inputs_hash: Hash,
    pub signature: Vec<u8>,
}

macro_rules! impl_signature_hash {
    ($ty:ty) => {
        impl $ty {
            /// Hash of the payload with the signature cleared; the preimage
            /// the payload signer commits to.
            pub fn signature_hash(&self) -> Hash {
                let mut unsigned = self.clone();
                unsigned.signature = Vec::new();
                hash_bytes(&bincode::serialize(&unsigned).expect("payload serialization"))
            }
        }
    };
}

impl_signature_hash!(ProRegTx);
impl_signature_hash!(ProUpServTx);
impl_signature_hash!(ProUpRegTx);
impl_signature_hash!(ProUpRevTx);

/// The decoded payload of a provider transaction, one arm per type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderPayload {
    Register(ProRegTx),
    UpdateService(ProUpServTx),
    UpdateRegistrar(ProUpRegTx),
    UpdateRevoke(ProUpRevTx),
}

impl ProviderPayload {
    /// Decode the payload of a special transaction according to its type tag.
    pub fn from_tx(tx: &Transaction) -> Option<ProviderPayload> {
        if !tx.is_special() {
            return None;
        }
        match tx.tx_type {
            TX_TYPE_PROVIDER_REGISTER => {
                bincode::deserialize(&tx.extra_payload).ok().map(ProviderPayload::Register)
            }
            TX_TYPE_PROVIDER_UPDATE_SERVICE => {
                bincode::deserialize(&tx.extra_payload).ok().map(ProviderPayload::UpdateService)
            }
            TX_TYPE_PROVIDER_UPDATE_REGISTRAR => {
                bincode::deserialize(&tx.extra_payload).ok().map(ProviderPayload::UpdateRegistrar)
            }
            TX_TYPE_PROVIDER_UPDATE_REVOKE => {
                bincode::deserialize(&tx.extra_payload).ok().map(ProviderPayload::UpdateRevoke)
            }
            _ => None,
        }
    }
}

/// Hash of a transaction's ordered input outpoints; ties a payload to one
/// specific spend and prevents replay.
pub fn calc_inputs_hash(tx: &Transaction) -> Hash {
    let mut writer = HashWriter::new();
    for input in &tx.inputs {
        writer.write(&input.previous_output.encode_to_vec());
    }
    writer.finalize()
}

fn check_inputs_hash(tx: &Transaction, expected: &Hash, state: &mut ValidationState) -> bool {
    if calc_inputs_hash(tx) != *expected {
        return state.dos(100, RejectCode::Invalid, "bad-protx-inputs-hash");
    }
    true
}

fn check_service(service: &Service, state: &mut ValidationState) -> bool {
    if !service.is_valid() {
        return state.dos(10, RejectCode::Invalid, "bad-protx-addr");
    }
    if !service.is_routable() {
        return state.dos(10, RejectCode::Invalid, "bad-protx-addr-not-routable");
    }
    true
}

fn check_payout_script(script: &Script, state: &mut ValidationState) -> bool {
    if !script.is_p2pkh() && !script.is_p2sh() {
        return state.dos(100, RejectCode::Invalid, "bad-protx-payout-script");
    }
    true
}

/// The operator key must be exactly 48 bytes and parse as a G1 element.
fn check_operator_key(bytes: &[u8], state: &mut ValidationState) -> bool {
    if bytes.len() != 48 {
        return state.dos(100, RejectCode::Invalid, "bad-protx-operator-key-size");
    }
    if BlsPublicKey::from_slice(bytes).is_err() {
        return state.dos(100, RejectCode::Invalid, "bad-protx-operator-key");
    }
    true
}

pub fn check_pro_reg_tx(
    tx: &Transaction,
    mn_list: &MasternodeList,
    state: &mut ValidationState,
) -> bool {
    let payload: ProRegTx = match bincode::deserialize(&tx.extra_payload) {
        Ok(payload) => payload,
        Err(_) => return state.dos(100, RejectCode::Invalid, "bad-protx-payload"),
    };

    if payload.version != PROVIDER_TX_VERSION {
        return state.dos(100, RejectCode::Invalid, "bad-protx-version");
    }
    if payload.mode != 0 {
        return state.dos(100, RejectCode::Invalid, "bad-protx-mode");
    }
    if payload.operator_reward > MAX_OPERATOR_REWARD {
        return state.dos(100, RejectCode::Invalid, "bad-protx-operator-reward");
    }
    if !check_service(&payload.service, state) {
        return false;
    }
    if !check_operator_key(&payload.operator_pubkey, state) {
        return false;
    }
    if !check_payout_script(&payload.payout_script, state) {
        return false;
    }
    if !check_inputs_hash(tx, &payload.inputs_hash, state) {
        return false;
    }
    if !check_compact_signature(&payload.signature_hash(), &payload.signature, &payload.owner_key_id)
    {
        return state.dos(100, RejectCode::Invalid, "bad-protx-sig");
    }

    // Unique-property collisions against the list this block builds on.
    if mn_list.has_unique_property(&MasternodeList::unique_property_hash_service(&payload.service))
    {
        return state.dos(100, RejectCode::Duplicate, "bad-protx-dup-addr");
    }
    if mn_list.has_unique_property(&MasternodeList::unique_property_hash_key(&payload.owner_key_id))
    {
        return state.dos(100, RejectCode::Duplicate, "bad-protx-dup-owner-key");
    }
    if mn_list.get_entry_by_collateral(&payload.collateral_outpoint).is_some() {
        return state.dos(100, RejectCode::Duplicate, "bad-protx-dup-collateral");
    }

    true
}

pub fn check_pro_up_serv_tx(
    tx: &Transaction,
    mn_list: &MasternodeList,
    state: &mut ValidationState,
) -> bool {
    let payload: ProUpServTx = match bincode::deserialize(&tx.extra_payload) {
        Ok(payload) => payload,
        Err(_) => return state.dos(100, RejectCode::Invalid, "bad-protx-payload"),
    };

    if payload.version != PROVIDER_TX_VERSION {
        return state.dos(100, RejectCode::Invalid, "bad-protx-version");
    }
    if !check_service(&payload.service, state) {
        return false;
    }
    if !check_inputs_hash(tx, &payload.inputs_hash, state) {
        return false;
    }

    if mn_list.get_entry(&payload.pro_tx_hash).is_none() {
        return state.dos(100, RejectCode::Invalid, "bad-protx-hash");
    }

    // The endpoint must not collide with a different entry.
    if let Some(existing) =
        mn_list.get_pro_tx_by_property(&MasternodeList::unique_property_hash_service(&payload.service))
    {
        if existing != payload.pro_tx_hash {
            return state.dos(100, RejectCode::Duplicate, "bad-protx-dup-addr");
        }
    }

    // Operator-BLS signature; full verification is deferred to the quorum
    // layer, the payload must still carry a well-formed G2 element.
    if BlsSignature::from_slice(&payload.signature).is_err() {
        return state.dos(100, RejectCode::Invalid, "bad-protx-sig");
    }

    true
}

pub fn check_pro_up_reg_tx(
    tx: &Transaction,
    mn_list: &MasternodeList,
    state: &mut ValidationState,
) -> bool {
    let payload: ProUpRegTx = match bincode::deserialize(&tx.extra_payload) {
        Ok(payload) => payload,
        Err(_) => return state.dos(100, RejectCode::Invalid, "bad-protx-payload"),
    };

    if payload.version != PROVIDER_TX_VERSION {
        return state.dos(100, RejectCode::Invalid, "bad-protx-version");
    }
    if !payload.operator_pubkey.is_empty() && !check_operator_key(&payload.operator_pubkey, state) {
        return false;
    }
    if !payload.payout_script.is_empty() && !check_payout_script(&payload.payout_script, state) {
        return false;
    }
    if !check_inputs_hash(tx, &payload.inputs_hash, state) {
        return false;
    }

    let entry = match mn_list.get_entry(&payload.pro_tx_hash) {
        Some(entry) => entry,
        None => return state.dos(100, RejectCode::Invalid, "bad-protx-hash"),
    };

    if !check_compact_signature(
        &payload.signature_hash(),
        &payload.signature,
        &entry.state.owner_key_id,
    ) {
        return state.dos(100, RejectCode::Invalid, "bad-protx-sig");
    }

    true
}

pub fn check_pro_up_rev_tx(
    tx: &Transaction,
    mn_list: &MasternodeList,
    state: &mut ValidationState,
) -> bool {
    let payload: ProUpRevTx = match bincode::deserialize(&tx.extra_payload) {
        Ok(payload) => payload,
        Err(_) => return state.dos(100, RejectCode::Invalid, "bad-protx-payload"),
    };

    if payload.version != PROVIDER_TX_VERSION {
        return state.dos(100, RejectCode::Invalid, "bad-protx-version");
    }
    if payload.reason > REVOCATION_CHANGE_OF_KEYS {
        return state.dos(100, RejectCode::Invalid, "bad-protx-reason");
    }
    if !check_inputs_hash(tx, &payload.inputs_hash, state) {
        return false;
    }

    if mn_list.get_entry(&payload.pro_tx_hash).is_none() {
        return state.dos(100, RejectCode::Invalid, "bad-protx-hash");
    }

    if BlsSignature::from_slice(&payload.signature).is_err() {
        return state.dos(100, RejectCode::Invalid, "bad-protx-sig");
    }

    true
}

/// Master validation dispatcher for special transactions. `mn_list` is the
/// list state the containing block builds on (with this block's earlier
/// transactions already applied).
pub fn check_special_tx(
    tx: &Transaction,
    mn_list: &MasternodeList,
    state: &mut ValidationState,
) -> bool {
    if !tx.is_special() {
        return true;
    }
    match tx.tx_type {
        TX_TYPE_PROVIDER_REGISTER => check_pro_reg_tx(tx, mn_list, state),
        TX_TYPE_PROVIDER_UPDATE_SERVICE => check_pro_up_serv_tx(tx, mn_list, state),
        TX_TYPE_PROVIDER_UPDATE_REGISTRAR => check_pro_up_reg_tx(tx, mn_list, state),
        TX_TYPE_PROVIDER_UPDATE_REVOKE => check_pro_up_rev_tx(tx, mn_list, state),
        _ => state.dos(100, RejectCode::Invalid, "bad-tx-type-unknown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrox_shared_types::script::p2pkh_script;

    fn sample_reg_payload() -> ProRegTx {
        ProRegTx {
            version: PROVIDER_TX_VERSION,
            mode: 0,
            collateral_outpoint: OutPoint::new([9u8; 32], 1),
            service: "203.0.113.7:19999".parse().unwrap(),
            owner_key_id: [1u8; 20],
            operator_pubkey: vec![0u8; 48],
            voting_key_id: [2u8; 20],
            operator_reward: 500,
            payout_script: p2pkh_script(&[3u8; 20]),
            inputs_hash: [4u8; 32],
            signature: vec![0xAB; 65],
        }
    }

    #[test]
    fn payload_roundtrip() {
        let payload = sample_reg_payload();
        let bytes = bincode::serialize(&payload).unwrap();
        let decoded: ProRegTx = bincode::deserialize(&bytes).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn signature_hash_ignores_signature() {
        let mut payload = sample_reg_payload();
        let hash1 = payload.signature_hash();
        payload.signature = vec![0xCD; 65];
        assert_eq!(hash1, payload.signature_hash());

        payload.operator_reward = 501;
        assert_ne!(hash1, payload.signature_hash());
    }

    #[test]
    fn payload_dispatch_by_type() {
        let payload = sample_reg_payload();
        let tx = Transaction::new_special(
            TX_TYPE_PROVIDER_REGISTER,
            vec![],
            bincode::serialize(&payload).unwrap(),
        );
        match ProviderPayload::from_tx(&tx) {
            Some(ProviderPayload::Register(decoded)) => assert_eq!(decoded, payload),
            other => panic!("unexpected payload {other:?}"),
        }

        let normal = Transaction::new_standard(vec![], vec![]);
        assert!(ProviderPayload::from_tx(&normal).is_none());
    }

    #[test]
    fn malformed_payload_is_dos_100() {
        let tx = Transaction::new_special(TX_TYPE_PROVIDER_REGISTER, vec![], vec![0xFF, 0x00]);
        let list = MasternodeList::default();
        let mut state = ValidationState::new();
        assert!(!check_pro_reg_tx(&tx, &list, &mut state));
        assert_eq!(state.dos_score(), 100);
        assert_eq!(state.reject_reason(), "bad-protx-payload");
    }

    #[test]
    fn unroutable_addr_rejected() {
        let mut payload = sample_reg_payload();
        payload.service = "127.0.0.1:19999".parse().unwrap();
        let tx = Transaction::new_special(
            TX_TYPE_PROVIDER_REGISTER,
            vec![],
            bincode::serialize(&payload).unwrap(),
        );
        let list = MasternodeList::default();
        let mut state = ValidationState::new();
        assert!(!check_pro_reg_tx(&tx, &list, &mut state));
        assert_eq!(state.reject_reason(), "bad-protx-addr-not-routable");
    }

    #[test]
    fn bad_operator_key_rejected() {
        let mut payload = sample_reg_payload();
        payload.operator_pubkey = vec![0u8; 47];
        let tx = Transaction::new_special(
            TX_TYPE_PROVIDER_REGISTER,
            vec![],
            bincode::serialize(&payload).unwrap(),
        );
        let list = MasternodeList::default();
        let mut state = ValidationState::new();
        assert!(!check_pro_reg_tx(&tx, &list, &mut state));
        assert_eq!(state.reject_reason(), "bad-protx-operator-key-size");

        // 48 zero bytes are not a valid compressed G1 element either.
        let mut payload = sample_reg_payload();
        payload.operator_pubkey = vec![0u8; 48];
        let tx = Transaction::new_special(
            TX_TYPE_PROVIDER_REGISTER,
            vec![],
            bincode::serialize(&payload).unwrap(),
        );
        let mut state = ValidationState::new();
        assert!(!check_pro_reg_tx(&tx, &list, &mut state));
        assert_eq!(state.reject_reason(), "bad-protx-operator-key");
    }

    #[test]
    fn revocation_reason_range() {
        let payload = ProUpRevTx {
            version: PROVIDER_TX_VERSION,
            pro_tx_hash: [1u8; 32],
            reason: 4,
            inputs_hash: [0u8; 32],
            signature: vec![0u8; 96],
        };
        let tx = Transaction::new_special(
            TX_TYPE_PROVIDER_UPDATE_REVOKE,
            vec![],
            bincode::serialize(&payload).unwrap(),
        );
        let list = MasternodeList::default();
        let mut state = ValidationState::new();
        assert!(!check_pro_up_rev_tx(&tx, &list, &mut state));
        assert_eq!(state.reject_reason(), "bad-protx-reason");
    }
}
