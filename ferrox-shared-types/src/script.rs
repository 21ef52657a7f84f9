//! Minimal script primitives: opcodes, a push-aware builder/parser, and the
//! standard output patterns (P2PKH, P2SH) the consensus layer needs.

use crate::KeyId;

pub const OP_FALSE: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_TRUE: u8 = 0x51;
pub const OP_IF: u8 = 0x63;
pub const OP_ELSE: u8 = 0x67;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_SHA256: u8 = 0xa8;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;

/// A serialized script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Script(pub Vec<u8>);

/// One decoded script element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOp {
    Op(u8),
    Push(Vec<u8>),
}

impl Script {
    pub fn new() -> Self {
        Script(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn push_opcode(mut self, op: u8) -> Self {
        self.0.push(op);
        self
    }

    pub fn push_data(mut self, data: &[u8]) -> Self {
        match data.len() {
            0..=75 => self.0.push(data.len() as u8),
            76..=255 => {
                self.0.push(OP_PUSHDATA1);
                self.0.push(data.len() as u8);
            }
            _ => {
                self.0.push(OP_PUSHDATA2);
                self.0.extend_from_slice(&(data.len() as u16).to_le_bytes());
            }
        }
        self.0.extend_from_slice(data);
        self
    }

    /// Push a script-number (minimally encoded little-endian with sign bit).
    pub fn push_int(self, value: i64) -> Self {
        let encoded = encode_script_num(value);
        self.push_data(&encoded)
    }

    /// Append another script's raw bytes without a push prefix.
    pub fn append(mut self, other: &Script) -> Self {
        self.0.extend_from_slice(&other.0);
        self
    }

    /// Decode into opcodes and pushes; fails on truncated push data.
    pub fn parse_ops(&self) -> Option<Vec<ScriptOp>> {
        let bytes = &self.0;
        let mut ops = Vec::new();
        let mut i = 0usize;
        while i < bytes.len() {
            let op = bytes[i];
            i += 1;
            let push_len = match op {
                1..=75 => Some(op as usize),
                OP_PUSHDATA1 => {
                    let len = *bytes.get(i)? as usize;
                    i += 1;
                    Some(len)
                }
                OP_PUSHDATA2 => {
                    let lo = *bytes.get(i)? as usize;
                    let hi = *bytes.get(i + 1)? as usize;
                    i += 2;
                    Some(lo | (hi << 8))
                }
                _ => None,
            };
            match push_len {
                Some(len) => {
                    if i + len > bytes.len() {
                        return None;
                    }
                    ops.push(ScriptOp::Push(bytes[i..i + len].to_vec()));
                    i += len;
                }
                None => ops.push(ScriptOp::Op(op)),
            }
        }
        Some(ops)
    }

    /// P2PKH pattern: OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG.
    pub fn is_p2pkh(&self) -> bool {
        let s = &self.0;
        s.len() == 25
            && s[0] == OP_DUP
            && s[1] == OP_HASH160
            && s[2] == 0x14
            && s[23] == OP_EQUALVERIFY
            && s[24] == OP_CHECKSIG
    }

    /// P2SH pattern: OP_HASH160 <20> OP_EQUAL.
    pub fn is_p2sh(&self) -> bool {
        let s = &self.0;
        s.len() == 23 && s[0] == OP_HASH160 && s[1] == 0x14 && s[22] == OP_EQUAL
    }

    /// Extracts the key hash from a P2PKH script, if applicable.
    pub fn extract_pubkey_hash(&self) -> Option<KeyId> {
        if self.is_p2pkh() {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&self.0[3..23]);
            Some(hash)
        } else {
            None
        }
    }
}

/// Standard pay-to-pubkey-hash output script.
pub fn p2pkh_script(key_id: &KeyId) -> Script {
    Script::new()
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_data(key_id)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
}

/// Standard pay-to-script-hash output script.
pub fn p2sh_script(script_hash: &KeyId) -> Script {
    Script::new()
        .push_opcode(OP_HASH160)
        .push_data(script_hash)
        .push_opcode(OP_EQUAL)
}

/// 20-byte hash of a script (truncated blake3), used for P2SH destinations.
pub fn script_hash(script: &Script) -> KeyId {
    let digest = blake3::hash(&script.0);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest.as_bytes()[..20]);
    out
}

pub fn encode_script_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut result = Vec::new();
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    // The most significant byte carries the sign bit; add a byte if taken.
    if result.last().unwrap() & 0x80 != 0 {
        result.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        *result.last_mut().unwrap() |= 0x80;
    }
    result
}

pub fn decode_script_num(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        return 0;
    }
    let mut value: i64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        if i == bytes.len() - 1 {
            value |= ((byte & 0x7f) as i64) << (8 * i);
        } else {
            value |= (*byte as i64) << (8 * i);
        }
    }
    if bytes.last().unwrap() & 0x80 != 0 {
        -value
    } else {
        value
    }
}
