use std::sync::Arc;

use ferrox_chain::{Block, BlockIndex, MemoryBlockStore, RejectCode, ValidationState};
use ferrox_crypto::bls::BlsSecretKey;
use ferrox_crypto::ecdsa::{key_id, sign_compact};
use ferrox_evo::deterministicmns::MasternodeListManager;
use ferrox_evo::evodb::EvoDb;
use ferrox_evo::providertx::{
    calc_inputs_hash, ProRegTx, ProUpRegTx, ProUpRevTx, ProUpServTx, PROVIDER_TX_VERSION,
};
use ferrox_shared_types::script::p2pkh_script;
use ferrox_shared_types::{
    Hash, OutPoint, Transaction, TxInput, TX_TYPE_PROVIDER_REGISTER,
    TX_TYPE_PROVIDER_UPDATE_REGISTRAR, TX_TYPE_PROVIDER_UPDATE_REVOKE,
    TX_TYPE_PROVIDER_UPDATE_SERVICE,
};
use secp256k1::rand::thread_rng;
use secp256k1::{Secp256k1, SecretKey};

struct Operator {
    owner_sk: SecretKey,
    owner_key_id: [u8; 20],
    bls_sk: BlsSecretKey,
}

fn new_operator() -> Operator {
    let secp = Secp256k1::new();
    let (owner_sk, owner_pk) = secp.generate_keypair(&mut thread_rng());
    Operator { owner_sk, owner_key_id: key_id(&owner_pk), bls_sk: BlsSecretKey::generate() }
}

fn block_hash(n: u8) -> Hash {
    let mut h = [0xB0u8; 32];
    h[31] = n;
    h
}

fn build_reg_tx(n: u8, operator: &Operator) -> Transaction {
    let input = TxInput::new(OutPoint::new([n; 32], 0));
    let mut tx = Transaction::new_special(TX_TYPE_PROVIDER_REGISTER, vec![input], vec![]);

    let mut payload = ProRegTx {
        version: PROVIDER_TX_VERSION,
        mode: 0,
        collateral_outpoint: OutPoint::new([n; 32], 0),
        service: format!("203.0.113.{n}:19999").parse().unwrap(),
        owner_key_id: operator.owner_key_id,
        operator_pubkey: operator.bls_sk.public_key().to_bytes().to_vec(),
        voting_key_id: operator.owner_key_id,
        operator_reward: 0,
        payout_script: p2pkh_script(&operator.owner_key_id),
        inputs_hash: calc_inputs_hash(&tx),
        signature: Vec::new(),
    };
    payload.signature = sign_compact(&operator.owner_sk, &payload.signature_hash()).to_vec();
    tx.extra_payload = bincode::serialize(&payload).unwrap();
    tx
}

fn new_manager() -> (MasternodeListManager, Arc<MemoryBlockStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryBlockStore::new());
    let db = EvoDb::new(sled::open(dir.path()).unwrap());
    (MasternodeListManager::new(db, Some(store.clone())), store, dir)
}

fn connect_block(
    manager: &MasternodeListManager,
    store: &MemoryBlockStore,
    prev: &Arc<BlockIndex>,
    n: u8,
    txs: Vec<Transaction>,
) -> Arc<BlockIndex> {
    let index = BlockIndex::new_child(prev, block_hash(n), 1);
    let block = Block::new(block_hash(n), txs);
    store.insert(block.clone());
    let mut state = ValidationState::new();
    assert!(manager.process_block(&block, &index, &mut state, false), "{}", state.reject_reason());
    manager.updated_block_tip(&index);
    index
}

#[test]
fn test_registration_assigns_internal_ids() {
    let (manager, store, _dir) = new_manager();
    let genesis = BlockIndex::genesis(block_hash(0));
    store.insert(Block::new(block_hash(0), vec![]));

    let operators: Vec<Operator> = (0..3).map(|_| new_operator()).collect();
    let txs: Vec<Transaction> =
        operators.iter().enumerate().map(|(i, op)| build_reg_tx(i as u8 + 1, op)).collect();
    let pro_tx_hashes: Vec<Hash> = txs.iter().map(|tx| tx.txid()).collect();

    let tip = connect_block(&manager, &store, &genesis, 1, txs);

    let list = manager.get_list_for_block(&tip);
    assert_eq!(list.all_count(), 3);
    assert_eq!(list.valid_count(), 3);
    assert_eq!(list.total_registered_count(), 3);

    let mut seen_ids: Vec<u64> =
        pro_tx_hashes.iter().map(|h| list.get_entry(h).unwrap().internal_id).collect();
    seen_ids.sort_unstable();
    assert_eq!(seen_ids, vec![0, 1, 2]);

    for (i, hash) in pro_tx_hashes.iter().enumerate() {
        let entry = list.get_entry(hash).unwrap();
        assert_eq!(entry.state.registered_height, 1);
        assert_eq!(entry.collateral_outpoint, OutPoint::new([i as u8 + 1; 32], 0));
        assert!(manager.is_collateral(&entry.collateral_outpoint));
    }
}

#[test]
fn test_duplicate_owner_key_rejected() {
    let (manager, store, _dir) = new_manager();
    let genesis = BlockIndex::genesis(block_hash(0));

    let operator = new_operator();
    let tip = connect_block(&manager, &store, &genesis, 1, vec![build_reg_tx(1, &operator)]);

    // Second registration reusing the same owner key (fresh collateral and
    // address) must be rejected as a duplicate.
    let mut other = new_operator();
    other.owner_sk = operator.owner_sk;
    other.owner_key_id = operator.owner_key_id;
    let dup_tx = build_reg_tx(2, &other);

    let index = BlockIndex::new_child(&tip, block_hash(2), 1);
    let block = Block::new(block_hash(2), vec![dup_tx]);
    let mut state = ValidationState::new();
    assert!(!manager.process_block(&block, &index, &mut state, false));
    assert_eq!(state.dos_score(), 100);
    assert_eq!(state.reject_code(), Some(RejectCode::Duplicate));
    assert_eq!(state.reject_reason(), "bad-protx-dup-owner-key");
}

#[test]
fn test_connect_disconnect_restores_previous_list() {
    let (manager, store, _dir) = new_manager();
    let genesis = BlockIndex::genesis(block_hash(0));
    store.insert(Block::new(block_hash(0), vec![]));

    let op1 = new_operator();
    let tip1 = connect_block(&manager, &store, &genesis, 1, vec![build_reg_tx(1, &op1)]);
    let before = bincode::serialize(&*manager.get_list_for_block(&tip1)).unwrap();

    let op2 = new_operator();
    let tip2 = connect_block(&manager, &store, &tip1, 2, vec![build_reg_tx(2, &op2)]);
    assert_eq!(manager.get_list_at_tip().all_count(), 2);

    manager.undo_block(&tip2);
    let after = bincode::serialize(&*manager.get_list_at_tip()).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_service_update_and_conflict() {
    let (manager, store, _dir) = new_manager();
    let genesis = BlockIndex::genesis(block_hash(0));

    let op1 = new_operator();
    let op2 = new_operator();
    let reg1 = build_reg_tx(1, &op1);
    let reg2 = build_reg_tx(2, &op2);
    let pro1 = reg1.txid();
    let tip = connect_block(&manager, &store, &genesis, 1, vec![reg1, reg2]);

    // Move MN1 to a fresh endpoint.
    let input = TxInput::new(OutPoint::new([0xE1; 32], 0));
    let mut tx = Transaction::new_special(TX_TYPE_PROVIDER_UPDATE_SERVICE, vec![input], vec![]);
    let payload = ProUpServTx {
        version: PROVIDER_TX_VERSION,
        pro_tx_hash: pro1,
        service: "203.0.113.50:19999".parse().unwrap(),
        operator_payout_script: Default::default(),
        inputs_hash: calc_inputs_hash(&tx),
        signature: op1.bls_sk.sign(&[0u8; 32]).to_bytes().to_vec(),
    };
    tx.extra_payload = bincode::serialize(&payload).unwrap();
    let tip2 = connect_block(&manager, &store, &tip, 3, vec![tx]);

    let list = manager.get_list_for_block(&tip2);
    let entry = list.get_entry(&pro1).unwrap();
    assert_eq!(entry.state.service, "203.0.113.50:19999".parse().unwrap());
    assert!(list.has_unique_addr(&"203.0.113.50:19999".parse().unwrap()));
    assert!(!list.has_unique_addr(&"203.0.113.1:19999".parse().unwrap()));

    // Claiming MN2's endpoint is a duplicate.
    let input = TxInput::new(OutPoint::new([0xE2; 32], 0));
    let mut tx = Transaction::new_special(TX_TYPE_PROVIDER_UPDATE_SERVICE, vec![input], vec![]);
    let payload = ProUpServTx {
        version: PROVIDER_TX_VERSION,
        pro_tx_hash: pro1,
        service: "203.0.113.2:19999".parse().unwrap(),
        operator_payout_script: Default::default(),
        inputs_hash: calc_inputs_hash(&tx),
        signature: op1.bls_sk.sign(&[0u8; 32]).to_bytes().to_vec(),
    };
    tx.extra_payload = bincode::serialize(&payload).unwrap();
    let index = BlockIndex::new_child(&tip2, block_hash(4), 1);
    let mut state = ValidationState::new();
    assert!(!manager.process_block(&Block::new(block_hash(4), vec![tx]), &index, &mut state, false));
    assert_eq!(state.reject_reason(), "bad-protx-dup-addr");
}

#[test]
fn test_registrar_update_resets_pose_on_key_change() {
    let (manager, store, _dir) = new_manager();
    let genesis = BlockIndex::genesis(block_hash(0));

    let op = new_operator();
    let reg = build_reg_tx(1, &op);
    let pro_tx = reg.txid();
    let tip = connect_block(&manager, &store, &genesis, 1, vec![reg]);

    let new_bls = BlsSecretKey::generate();
    let input = TxInput::new(OutPoint::new([0xE3; 32], 0));
    let mut tx = Transaction::new_special(TX_TYPE_PROVIDER_UPDATE_REGISTRAR, vec![input], vec![]);
    let mut payload = ProUpRegTx {
        version: PROVIDER_TX_VERSION,
        pro_tx_hash: pro_tx,
        mode: 0,
        operator_pubkey: new_bls.public_key().to_bytes().to_vec(),
        voting_key_id: [0u8; 20],
        payout_script: Default::default(),
        inputs_hash: calc_inputs_hash(&tx),
        signature: Vec::new(),
    };
    payload.signature = sign_compact(&op.owner_sk, &payload.signature_hash()).to_vec();
    tx.extra_payload = bincode::serialize(&payload).unwrap();

    let tip2 = connect_block(&manager, &store, &tip, 2, vec![tx]);
    let entry = manager.get_list_for_block(&tip2).get_entry(&pro_tx).unwrap();
    assert_eq!(entry.state.operator_pubkey, new_bls.public_key().to_bytes().to_vec());
    assert_eq!(entry.state.pose_penalty, 0);
    assert_eq!(entry.state.pose_ban_height, -1);
    assert_eq!(entry.state.pose_revived_height, 2);
}

#[test]
fn test_revocation_bans_entry() {
    let (manager, store, _dir) = new_manager();
    let genesis = BlockIndex::genesis(block_hash(0));

    let op = new_operator();
    let reg = build_reg_tx(1, &op);
    let pro_tx = reg.txid();
    let tip = connect_block(&manager, &store, &genesis, 1, vec![reg]);

    let input = TxInput::new(OutPoint::new([0xE4; 32], 0));
    let mut tx = Transaction::new_special(TX_TYPE_PROVIDER_UPDATE_REVOKE, vec![input], vec![]);
    let payload = ProUpRevTx {
        version: PROVIDER_TX_VERSION,
        pro_tx_hash: pro_tx,
        reason: 2,
        inputs_hash: calc_inputs_hash(&tx),
        signature: op.bls_sk.sign(&[0u8; 32]).to_bytes().to_vec(),
    };
    tx.extra_payload = bincode::serialize(&payload).unwrap();

    let tip2 = connect_block(&manager, &store, &tip, 2, vec![tx]);
    let list = manager.get_list_for_block(&tip2);
    let entry = list.get_entry(&pro_tx).unwrap();
    assert!(!entry.is_valid());
    assert_eq!(entry.state.revocation_reason, 2);
    assert_eq!(entry.state.pose_ban_height, 2);
    assert_eq!(list.valid_count(), 0);
}

#[test]
fn test_payee_prediction_is_stable() {
    let (manager, store, _dir) = new_manager();
    let genesis = BlockIndex::genesis(block_hash(0));

    let operators: Vec<Operator> = (0..5).map(|_| new_operator()).collect();
    let txs: Vec<Transaction> =
        operators.iter().enumerate().map(|(i, op)| build_reg_tx(i as u8 + 1, op)).collect();
    let tip = connect_block(&manager, &store, &genesis, 1, txs);

    let payee1 = manager.predict_payee(&tip).unwrap();
    let payee2 = manager.predict_payee(&tip).unwrap();
    assert_eq!(payee1.pro_tx_hash, payee2.pro_tx_hash);
}

#[test]
fn test_rebuild_from_block_replay() {
    let dir1 = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryBlockStore::new());
    let manager1 = MasternodeListManager::new(
        EvoDb::new(sled::open(dir1.path()).unwrap()),
        Some(store.clone()),
    );

    let genesis = BlockIndex::genesis(block_hash(0));
    store.insert(Block::new(block_hash(0), vec![]));

    let mut tip = Arc::clone(&genesis);
    for n in 1..=3u8 {
        let op = new_operator();
        tip = connect_block(&manager1, &store, &tip, n, vec![build_reg_tx(n, &op)]);
    }
    let expected = bincode::serialize(&*manager1.get_list_for_block(&tip)).unwrap();

    // A second manager with an empty database but the same block source must
    // reconstruct the identical snapshot by replay.
    let dir2 = tempfile::tempdir().unwrap();
    let manager2 = MasternodeListManager::new(
        EvoDb::new(sled::open(dir2.path()).unwrap()),
        Some(store.clone()),
    );
    let rebuilt = bincode::serialize(&*manager2.get_list_for_block(&tip)).unwrap();
    assert_eq!(expected, rebuilt);
}

#[test]
fn test_snapshots_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryBlockStore::new());
    let tip;
    let expected;
    {
        let manager = MasternodeListManager::new(
            EvoDb::new(sled::open(dir.path()).unwrap()),
            Some(store.clone()),
        );
        let genesis = BlockIndex::genesis(block_hash(0));
        let op = new_operator();
        tip = connect_block(&manager, &store, &genesis, 1, vec![build_reg_tx(1, &op)]);
        expected = bincode::serialize(&*manager.get_list_for_block(&tip)).unwrap();
    }

    let manager = MasternodeListManager::new(
        EvoDb::new(sled::open(dir.path()).unwrap()),
        Some(store.clone()),
    );
    let loaded = bincode::serialize(&*manager.get_list_for_block(&tip)).unwrap();
    assert_eq!(expected, loaded);
}
