//! Hash time-locked contracts: the two-path redeem script (claim with
//! preimage before timeout, refund after), witness assembly, and preimage
//! handling.

use ferrox_crypto::hash::sha256;
use ferrox_shared_types::script::{
    decode_script_num, p2sh_script, script_hash, Script, ScriptOp, OP_CHECKLOCKTIMEVERIFY,
    OP_CHECKSIG, OP_DROP, OP_DUP, OP_ELSE, OP_ENDIF, OP_EQUALVERIFY, OP_FALSE, OP_HASH160, OP_IF,
    OP_SHA256, OP_TRUE,
};
use ferrox_shared_types::Hash;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::SwapError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HtlcState {
    Pending = 0,
    Claimed = 1,
    Refunded = 2,
    Expired = 3,
}

/// One hash time-locked contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Htlc {
    pub htlc_id: Hash,
    /// Can refund after the time lock.
    pub sender_script: Script,
    /// Can claim with the preimage.
    pub receiver_script: Script,
    /// SHA-256 image of the secret.
    pub hash_lock: Hash,
    /// Absolute block height after which refund is allowed.
    pub time_lock: u32,
    /// Empty = native asset.
    pub asset_name: String,
    pub amount: u64,
    pub state: HtlcState,
    pub claim_tx_hash: Hash,
    /// Revealed when claimed.
    pub preimage: Vec<u8>,
}

impl Htlc {
    /// The two-path redeem script:
    ///
    /// ```text
    /// OP_IF
    ///     OP_SHA256 <hashLock> OP_EQUALVERIFY <receiver> OP_CHECKSIG
    /// OP_ELSE
    ///     <timeLock> OP_CHECKLOCKTIMEVERIFY OP_DROP <sender> OP_CHECKSIG
    /// OP_ENDIF
    /// ```
    pub fn redeem_script(&self) -> Script {
        create_htlc_script(&self.hash_lock, &self.receiver_script, &self.sender_script, self.time_lock)
    }

    /// The P2SH output script funding this contract.
    pub fn p2sh_script(&self) -> Script {
        p2sh_script(&script_hash(&self.redeem_script()))
    }

    pub fn verify_preimage(&self, preimage: &[u8]) -> bool {
        sha256(preimage) == self.hash_lock
    }

    pub fn can_refund(&self, current_height: i32) -> bool {
        current_height >= self.time_lock as i32
    }
}

fn embed_party_script(script: Script, party: &Script) -> Script {
    // P2PKH parties get the standard pattern; anything else is embedded raw.
    if let Some(key_hash) = party.extract_pubkey_hash() {
        script
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_data(&key_hash)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_CHECKSIG)
    } else {
        script.append(party)
    }
}

/// Build the HTLC redeem script.
pub fn create_htlc_script(
    hash_lock: &Hash,
    receiver_script: &Script,
    sender_script: &Script,
    time_lock: u32,
) -> Script {
    let mut script = Script::new()
        .push_opcode(OP_IF)
        .push_opcode(OP_SHA256)
        .push_data(hash_lock)
        .push_opcode(OP_EQUALVERIFY);
    script = embed_party_script(script, receiver_script);
    script = script
        .push_opcode(OP_ELSE)
        .push_int(time_lock as i64)
        .push_opcode(OP_CHECKLOCKTIMEVERIFY)
        .push_opcode(OP_DROP);
    script = embed_party_script(script, sender_script);
    script.push_opcode(OP_ENDIF)
}

/// Claim witness: `<sig> <pubkey> <preimage> TRUE`.
pub fn create_claim_script(preimage: &[u8], signature: &[u8], pubkey: &[u8]) -> Script {
    Script::new()
        .push_data(signature)
        .push_data(pubkey)
        .push_data(preimage)
        .push_opcode(OP_TRUE)
}

/// Refund witness: `<sig> <pubkey> FALSE`.
pub fn create_refund_script(signature: &[u8], pubkey: &[u8]) -> Script {
    Script::new().push_data(signature).push_data(pubkey).push_opcode(OP_FALSE)
}

/// Pull the preimage out of a claim witness: the third push.
pub fn extract_preimage(script_sig: &Script) -> Option<Vec<u8>> {
    let ops = script_sig.parse_ops()?;
    let pushes: Vec<&Vec<u8>> = ops
        .iter()
        .filter_map(|op| match op {
            ScriptOp::Push(data) => Some(data),
            ScriptOp::Op(_) => None,
        })
        .collect();
    if pushes.len() >= 3 {
        Some(pushes[2].clone())
    } else {
        None
    }
}

/// Read the refund time lock back out of a redeem script: the push operand
/// directly before OP_CHECKLOCKTIMEVERIFY.
pub fn parse_time_lock(redeem_script: &Script) -> Option<u32> {
    let ops = redeem_script.parse_ops()?;
    for window in ops.windows(2) {
        if let [ScriptOp::Push(operand), ScriptOp::Op(OP_CHECKLOCKTIMEVERIFY)] = window {
            let value = decode_script_num(operand);
            if (0..=u32::MAX as i64).contains(&value) {
                return Some(value as u32);
            }
            return None;
        }
    }
    None
}

/// A fresh random 32-byte swap secret.
pub fn generate_swap_secret() -> Hash {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

/// SHA-256 image of a secret, the hash lock both legs share.
pub fn hash_secret(secret: &[u8]) -> Hash {
    sha256(secret)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicSwapState {
    /// Maker funded their HTLC.
    Initiated = 0,
    /// Taker funded the matching HTLC.
    Matched = 1,
    /// Both legs claimed; the preimage is public.
    Completed = 2,
    /// One or both legs refunded after timeout.
    Refunded = 3,
    Failed = 4,
}

/// A complete atomic swap: two HTLCs on two assets sharing one hash lock, so
/// revealing the preimage on one leg enables claiming the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicSwap {
    pub swap_id: Hash,
    pub maker_htlc: Htlc,
    pub taker_htlc: Option<Htlc>,
    pub state: AtomicSwapState,
    pub initiated_height: i32,
    pub matched_height: i32,
    pub completed_height: i32,
}

impl AtomicSwap {
    pub fn initiate(swap_id: Hash, maker_htlc: Htlc, height: i32) -> Result<Self, SwapError> {
        check_htlc(&maker_htlc)?;
        Ok(AtomicSwap {
            swap_id,
            maker_htlc,
            taker_htlc: None,
            state: AtomicSwapState::Initiated,
            initiated_height: height,
            matched_height: -1,
            completed_height: -1,
        })
    }

    /// Attach the taker's leg. Both legs must share the hash lock, and the
    /// taker leg must time out strictly before the maker leg so the maker
    /// cannot wait out the taker's refund window.
    pub fn match_taker(&mut self, taker_htlc: Htlc, height: i32) -> Result<(), SwapError> {
        if self.state != AtomicSwapState::Initiated {
            return Err(SwapError::InvalidSwap("swap is not awaiting a taker".into()));
        }
        check_htlc(&taker_htlc)?;
        if taker_htlc.hash_lock != self.maker_htlc.hash_lock {
            return Err(SwapError::InvalidSwap("hash locks do not match".into()));
        }
        if taker_htlc.time_lock >= self.maker_htlc.time_lock {
            return Err(SwapError::InvalidSwap(
                "taker leg must time out before the maker leg".into(),
            ));
        }
        self.taker_htlc = Some(taker_htlc);
        self.state = AtomicSwapState::Matched;
        self.matched_height = height;
        Ok(())
    }

    /// Both legs claimed with the revealed preimage.
    pub fn complete(&mut self, preimage: &[u8], height: i32) -> Result<(), SwapError> {
        if self.state != AtomicSwapState::Matched {
            return Err(SwapError::InvalidSwap("swap is not matched".into()));
        }
        if !self.maker_htlc.verify_preimage(preimage) {
            return Err(SwapError::InvalidSwap("preimage does not open the hash lock".into()));
        }
        self.maker_htlc.state = HtlcState::Claimed;
        self.maker_htlc.preimage = preimage.to_vec();
        if let Some(taker) = &mut self.taker_htlc {
            taker.state = HtlcState::Claimed;
            taker.preimage = preimage.to_vec();
        }
        self.state = AtomicSwapState::Completed;
        self.completed_height = height;
        Ok(())
    }

    /// Refund whichever legs have timed out at the current height.
    pub fn refund(&mut self, current_height: i32) -> Result<(), SwapError> {
        if !matches!(self.state, AtomicSwapState::Initiated | AtomicSwapState::Matched) {
            return Err(SwapError::InvalidSwap("swap cannot be refunded".into()));
        }
        if !self.maker_htlc.can_refund(current_height) {
            return Err(SwapError::InvalidSwap("maker leg has not timed out".into()));
        }
        self.maker_htlc.state = HtlcState::Refunded;
        if let Some(taker) = &mut self.taker_htlc {
            if taker.can_refund(current_height) {
                taker.state = HtlcState::Refunded;
            }
        }
        self.state = AtomicSwapState::Refunded;
        Ok(())
    }
}

/// Structural validation of an HTLC.
pub fn check_htlc(htlc: &Htlc) -> Result<(), SwapError> {
    if htlc.amount == 0 {
        return Err(SwapError::InvalidHtlc("amount must be positive".into()));
    }
    if htlc.sender_script.is_empty() {
        return Err(SwapError::InvalidHtlc("sender script is required".into()));
    }
    if htlc.receiver_script.is_empty() {
        return Err(SwapError::InvalidHtlc("receiver script is required".into()));
    }
    if htlc.hash_lock == [0u8; 32] {
        return Err(SwapError::InvalidHtlc("hash lock is required".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrox_shared_types::script::p2pkh_script;

    fn sample_htlc() -> Htlc {
        Htlc {
            htlc_id: [1u8; 32],
            sender_script: p2pkh_script(&[2u8; 20]),
            receiver_script: p2pkh_script(&[3u8; 20]),
            hash_lock: hash_secret(&[9u8; 32]),
            time_lock: 1000,
            asset_name: String::new(),
            amount: 5000,
            state: HtlcState::Pending,
            claim_tx_hash: [0u8; 32],
            preimage: Vec::new(),
        }
    }

    #[test]
    fn refund_window_is_inclusive() {
        let htlc = sample_htlc();
        assert!(!htlc.can_refund(500));
        assert!(!htlc.can_refund(999));
        assert!(htlc.can_refund(1000));
        assert!(htlc.can_refund(2000));
    }

    #[test]
    fn time_lock_roundtrips_through_script() {
        for time_lock in [10u32, 144, 1000, 5040, 499_999_999] {
            let mut htlc = sample_htlc();
            htlc.time_lock = time_lock;
            assert_eq!(parse_time_lock(&htlc.redeem_script()), Some(time_lock), "{time_lock}");
        }
    }

    #[test]
    fn witness_markers() {
        let claim = create_claim_script(&[9u8; 32], &[1u8; 71], &[2u8; 33]);
        assert_eq!(*claim.as_bytes().last().unwrap(), OP_TRUE);

        let refund = create_refund_script(&[1u8; 71], &[2u8; 33]);
        assert_eq!(*refund.as_bytes().last().unwrap(), OP_FALSE);
    }

    #[test]
    fn preimage_extraction() {
        let preimage = vec![0x5Au8; 32];
        let claim = create_claim_script(&preimage, &[1u8; 71], &[2u8; 33]);
        assert_eq!(extract_preimage(&claim), Some(preimage));

        let refund = create_refund_script(&[1u8; 71], &[2u8; 33]);
        assert_eq!(extract_preimage(&refund), None);
    }

    #[test]
    fn non_p2pkh_parties_are_embedded_raw() {
        let mut htlc = sample_htlc();
        htlc.receiver_script = Script::new().push_opcode(OP_TRUE);
        let redeem = htlc.redeem_script();
        assert!(!redeem.is_empty());
        assert_eq!(parse_time_lock(&redeem), Some(1000));
    }
}
