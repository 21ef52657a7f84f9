use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub mod script;

pub type Hash = [u8; 32];
pub type KeyId = [u8; 20];

pub const NULL_HASH: Hash = [0u8; 32];

/// Native chain asset symbol; empty asset names normalize to this.
pub const NATIVE_ASSET_SYMBOL: &str = "FERROX";

/// Smallest-unit multiplier of the native asset.
pub const COIN: u64 = 100_000_000;

/// Transaction type tags carried by extended-version transactions.
pub const TX_TYPE_NORMAL: u16 = 0;
pub const TX_TYPE_PROVIDER_REGISTER: u16 = 1;
pub const TX_TYPE_PROVIDER_UPDATE_SERVICE: u16 = 2;
pub const TX_TYPE_PROVIDER_UPDATE_REGISTRAR: u16 = 3;
pub const TX_TYPE_PROVIDER_UPDATE_REVOKE: u16 = 4;

/// Transactions with version >= 3 may carry a non-zero type tag and payload.
pub const SPECIAL_TX_MIN_VERSION: u16 = 3;

/// Represents a reference to a specific transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    /// The transaction ID (hash) of the transaction containing the output.
    pub txid: Hash,
    /// The index of the output within that transaction.
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, vout: u32) -> Self {
        OutPoint { txid, vout }
    }

    /// The null outpoint used by coinbase inputs.
    pub fn null() -> Self {
        OutPoint { txid: NULL_HASH, vout: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        self.txid == NULL_HASH && self.vout == u32::MAX
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        bincode::serialize(self).expect("outpoint serialization is infallible")
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", hex::encode(self.txid), self.vout)
    }
}

/// Represents a transaction input, referencing a previous transaction's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// The `OutPoint` referencing the output being spent.
    pub previous_output: OutPoint,
    /// The script signature, providing proof of ownership.
    pub script_sig: Vec<u8>,
    /// A sequence number, typically used for replace-by-fee or relative lock-times.
    pub sequence: u32,
}

impl TxInput {
    pub fn new(previous_output: OutPoint) -> Self {
        TxInput { previous_output, script_sig: Vec::new(), sequence: 0 }
    }
}

/// Represents a transaction output, specifying a value and a locking script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// The value of the output in the smallest unit.
    pub value: u64,
    /// The locking script that defines the conditions for spending this output.
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: u64, script_pubkey: Vec<u8>) -> Self {
        TxOutput { value, script_pubkey }
    }
}

/// A transaction in the extended format: version >= 3 transactions carry a
/// type tag and, for non-zero tags, an extra payload with the type-specific
/// data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u16,
    pub tx_type: u16,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
    pub extra_payload: Vec<u8>,
}

impl Transaction {
    pub fn new_standard(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Transaction {
            version: 1,
            tx_type: TX_TYPE_NORMAL,
            inputs,
            outputs,
            lock_time: 0,
            extra_payload: Vec::new(),
        }
    }

    pub fn new_special(tx_type: u16, inputs: Vec<TxInput>, extra_payload: Vec<u8>) -> Self {
        Transaction {
            version: SPECIAL_TX_MIN_VERSION,
            tx_type,
            inputs,
            outputs: Vec::new(),
            lock_time: 0,
            extra_payload,
        }
    }

    pub fn txid(&self) -> Hash {
        let bytes = bincode::serialize(self).expect("transaction serialization is infallible");
        *blake3::hash(&bytes).as_bytes()
    }

    pub fn is_special(&self) -> bool {
        self.version >= SPECIAL_TX_MIN_VERSION && self.tx_type != TX_TYPE_NORMAL
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }
}

/// A network endpoint (address and port) advertised by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service(pub SocketAddr);

impl Service {
    pub fn new(addr: SocketAddr) -> Self {
        Service(addr)
    }

    pub fn is_valid(&self) -> bool {
        self.0.port() != 0
    }

    /// Loopback and unspecified addresses are not routable on the network.
    pub fn is_routable(&self) -> bool {
        let ip = self.0.ip();
        self.is_valid() && !ip.is_loopback() && !ip.is_unspecified()
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Service {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outpoint_null_roundtrip() {
        let op = OutPoint::null();
        assert!(op.is_null());
        let encoded = op.encode_to_vec();
        let decoded: OutPoint = bincode::deserialize(&encoded).unwrap();
        assert_eq!(op, decoded);
    }

    #[test]
    fn transaction_special_detection() {
        let mut tx = Transaction::new_standard(vec![], vec![]);
        assert!(!tx.is_special());

        tx.version = 3;
        assert!(!tx.is_special());

        tx.tx_type = TX_TYPE_PROVIDER_REGISTER;
        assert!(tx.is_special());

        tx.version = 2;
        assert!(!tx.is_special());
    }

    #[test]
    fn coinbase_detection() {
        let cb = Transaction::new_standard(
            vec![TxInput::new(OutPoint::null())],
            vec![TxOutput::new(50, vec![])],
        );
        assert!(cb.is_coinbase());

        let normal = Transaction::new_standard(
            vec![TxInput::new(OutPoint::new([1u8; 32], 0))],
            vec![TxOutput::new(50, vec![])],
        );
        assert!(!normal.is_coinbase());
    }

    #[test]
    fn txid_changes_with_content() {
        let tx1 = Transaction::new_standard(vec![], vec![TxOutput::new(1, vec![])]);
        let tx2 = Transaction::new_standard(vec![], vec![TxOutput::new(2, vec![])]);
        assert_ne!(tx1.txid(), tx2.txid());
        assert_eq!(tx1.txid(), tx1.txid());
    }

    #[test]
    fn service_routability() {
        let loopback: Service = "127.0.0.1:9999".parse().unwrap();
        assert!(loopback.is_valid());
        assert!(!loopback.is_routable());

        let routable: Service = "203.0.113.5:9999".parse().unwrap();
        assert!(routable.is_routable());

        let no_port: Service = "203.0.113.5:0".parse().unwrap();
        assert!(!no_port.is_valid());
    }
}
