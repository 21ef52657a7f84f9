//! Explicit construction of the quorum subsystem. Managers are built in
//! dependency order and handed out as `Arc`s; block notifications fan out
//! from one place.

use std::sync::Arc;

use ferrox_chain::{Block, BlockIndex};
use ferrox_evo::deterministicmns::MasternodeListManager;

use crate::chainlocks::{ChainLocksDb, ChainLocksManager};
use crate::instantsend::InstantSendManager;
use crate::quorums::QuorumManager;
use crate::signing::SigningManager;
use crate::LlmqError;

/// The assembled quorum subsystem.
pub struct LlmqContext {
    pub mn_list_manager: Arc<MasternodeListManager>,
    pub quorum_manager: Arc<QuorumManager>,
    pub signing_manager: Arc<SigningManager>,
    pub instant_send: Arc<InstantSendManager>,
    pub chain_locks: Arc<ChainLocksManager>,
}

impl LlmqContext {
    /// Wire up the managers: list -> quorums -> signing -> engines.
    pub fn new(
        mn_list_manager: Arc<MasternodeListManager>,
        chain_locks_db: ChainLocksDb,
    ) -> Self {
        let quorum_manager = Arc::new(QuorumManager::new(Arc::clone(&mn_list_manager)));
        let signing_manager = Arc::new(SigningManager::new(Arc::clone(&quorum_manager)));
        let instant_send = Arc::new(InstantSendManager::new(
            Arc::clone(&signing_manager),
            Arc::clone(&quorum_manager),
        ));
        let chain_locks = Arc::new(ChainLocksManager::new(
            Arc::clone(&signing_manager),
            Arc::clone(&quorum_manager),
            chain_locks_db,
        ));
        LlmqContext { mn_list_manager, quorum_manager, signing_manager, instant_send, chain_locks }
    }

    /// Same, with a sled-backed ChainLock store.
    pub fn open(
        mn_list_manager: Arc<MasternodeListManager>,
        chain_locks_db: sled::Db,
    ) -> Result<Self, LlmqError> {
        Ok(Self::new(mn_list_manager, ChainLocksDb::open(chain_locks_db)?))
    }

    /// Fan out a new tip to every manager, leaves first: the masternode list
    /// moves, then quorums reselect, then the engines retry their pending
    /// work.
    pub fn updated_block_tip(&self, pindex: &Arc<BlockIndex>) {
        self.mn_list_manager.updated_block_tip(pindex);
        self.quorum_manager.updated_block_tip(pindex);
        self.instant_send.updated_block_tip();
        self.chain_locks.updated_block_tip(pindex);
        self.signing_manager.cleanup(pindex.height);
        self.instant_send.cleanup();
        self.chain_locks.cleanup(pindex.height);
    }

    /// Block-connect hook for the engines (list processing is driven by the
    /// validation layer through `MasternodeListManager::process_block`).
    pub fn block_connected(&self, block: &Block, pindex: &Arc<BlockIndex>) {
        self.instant_send.process_block(block);
        self.chain_locks.try_sign_chain_lock(pindex);
    }

    pub fn block_disconnected(&self, block: &Block, pindex: &Arc<BlockIndex>) {
        self.instant_send.undo_block(block);
        self.mn_list_manager.undo_block(pindex);
    }
}
