//! The atomic-swap order book: active offers indexed by trading pair, with
//! funding-outpoint tracking so fills follow the chain through reorgs, and a
//! log-structured sled store behind it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use ferrox_chain::Block;
use ferrox_crypto::hash::HashWriter;
use ferrox_shared_types::script::Script;
use ferrox_shared_types::{Hash, OutPoint, NATIVE_ASSET_SYMBOL};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::SwapError;

/// Offer timeout bounds, in blocks.
pub const MIN_OFFER_TIMEOUT_BLOCKS: u32 = 10;
pub const MAX_OFFER_TIMEOUT_BLOCKS: u32 = 5040;

const DB_KEY_OFFER_PREFIX: u8 = b'O';
const DB_KEY_FUNDING_PREFIX: u8 = b'U';
const DB_KEY_HEIGHT: &[u8] = b"H";

/// A swap offer on the order book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicSwapOffer {
    pub offer_hash: Hash,
    /// Empty = native asset.
    pub maker_asset_name: String,
    pub maker_amount: u64,
    pub maker_script: Script,
    pub taker_asset_name: String,
    pub taker_amount: u64,
    pub hash_lock: Hash,
    pub timeout_blocks: u32,
    pub created_height: i32,
    pub is_active: bool,
    pub is_filled: bool,
    pub fill_tx_hash: Hash,
    /// Height the fill landed at; -1 while unfilled. Kept so a disconnect
    /// can exactly unfill.
    pub filled_height: i32,
}

impl AtomicSwapOffer {
    /// Exchange rate as taker units per maker unit.
    pub fn rate(&self) -> f64 {
        if self.maker_amount == 0 {
            return 0.0;
        }
        self.taker_amount as f64 / self.maker_amount as f64
    }

    pub fn is_expired(&self, current_height: i32) -> bool {
        current_height >= self.created_height + self.timeout_blocks as i32
    }

    /// Deterministic offer identity over the economic terms.
    pub fn compute_offer_hash(&self) -> Hash {
        let mut writer = HashWriter::tagged("swap_offer");
        writer
            .write(self.maker_asset_name.as_bytes())
            .write_u64(self.maker_amount)
            .write(self.taker_asset_name.as_bytes())
            .write_u64(self.taker_amount)
            .write(&self.hash_lock)
            .write_i32(self.created_height);
        writer.finalize()
    }
}

/// Normalized pair key: empty names map to the native symbol, the two sides
/// are sorted, and joined with ':'.
pub fn get_trading_pair_key(asset_a: &str, asset_b: &str) -> String {
    let a = if asset_a.is_empty() { NATIVE_ASSET_SYMBOL } else { asset_a };
    let b = if asset_b.is_empty() { NATIVE_ASSET_SYMBOL } else { asset_b };
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

/// Structural validation of an offer.
pub fn check_atomic_swap_offer(offer: &AtomicSwapOffer) -> Result<(), SwapError> {
    if offer.maker_amount == 0 {
        return Err(SwapError::InvalidOffer("maker amount must be positive".into()));
    }
    if offer.taker_amount == 0 {
        return Err(SwapError::InvalidOffer("taker amount must be positive".into()));
    }
    if offer.timeout_blocks < MIN_OFFER_TIMEOUT_BLOCKS {
        return Err(SwapError::InvalidOffer(format!(
            "timeout must be at least {MIN_OFFER_TIMEOUT_BLOCKS} blocks"
        )));
    }
    if offer.timeout_blocks > MAX_OFFER_TIMEOUT_BLOCKS {
        return Err(SwapError::InvalidOffer(format!(
            "timeout must be less than {MAX_OFFER_TIMEOUT_BLOCKS} blocks"
        )));
    }
    if offer.maker_script.is_empty() {
        return Err(SwapError::InvalidOffer("maker script is required".into()));
    }
    Ok(())
}

struct OrderBookState {
    offers: BTreeMap<Hash, AtomicSwapOffer>,
    offers_by_pair: HashMap<String, BTreeSet<Hash>>,
    /// Funding outpoint of each active offer, watched for spends.
    funding_outpoints: HashMap<Hash, OutPoint>,
    outpoint_to_offer: HashMap<OutPoint, Hash>,
    /// Offers filled at each height, for exact reorg reversal.
    fills_by_height: BTreeMap<i32, Vec<Hash>>,
    height: i32,
}

/// In-memory order book with a persistent backing store.
pub struct AtomicSwapOrderBook {
    state: Mutex<OrderBookState>,
    db: Option<sled::Db>,
}

impl AtomicSwapOrderBook {
    pub fn in_memory() -> Self {
        AtomicSwapOrderBook { state: Mutex::new(Self::empty_state()), db: None }
    }

    /// Open over sled and rebuild the in-memory indexes from the scan.
    pub fn open(db: sled::Db) -> Result<Self, SwapError> {
        let mut state = Self::empty_state();

        for item in db.scan_prefix([DB_KEY_OFFER_PREFIX]) {
            let (_, value) = item?;
            let offer: AtomicSwapOffer = bincode::deserialize(&value)?;
            let pair = get_trading_pair_key(&offer.maker_asset_name, &offer.taker_asset_name);
            state.offers_by_pair.entry(pair).or_default().insert(offer.offer_hash);
            if offer.is_filled && offer.filled_height >= 0 {
                state.fills_by_height.entry(offer.filled_height).or_default().push(offer.offer_hash);
            }
            state.offers.insert(offer.offer_hash, offer);
        }
        for item in db.scan_prefix([DB_KEY_FUNDING_PREFIX]) {
            let (key, value) = item?;
            if key.len() != 33 {
                continue;
            }
            let mut offer_hash = [0u8; 32];
            offer_hash.copy_from_slice(&key[1..]);
            let outpoint: OutPoint = bincode::deserialize(&value)?;
            state.outpoint_to_offer.insert(outpoint.clone(), offer_hash);
            state.funding_outpoints.insert(offer_hash, outpoint);
        }
        if let Some(value) = db.get(DB_KEY_HEIGHT)? {
            if value.len() == 4 {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&value);
                state.height = i32::from_be_bytes(bytes);
            }
        }

        info!("order book loaded: {} offers at height {}", state.offers.len(), state.height);
        Ok(AtomicSwapOrderBook { state: Mutex::new(state), db: Some(db) })
    }

    fn empty_state() -> OrderBookState {
        OrderBookState {
            offers: BTreeMap::new(),
            offers_by_pair: HashMap::new(),
            funding_outpoints: HashMap::new(),
            outpoint_to_offer: HashMap::new(),
            fills_by_height: BTreeMap::new(),
            height: 0,
        }
    }

    fn offer_key(offer_hash: &Hash) -> Vec<u8> {
        let mut key = vec![DB_KEY_OFFER_PREFIX];
        key.extend_from_slice(offer_hash);
        key
    }

    fn funding_key(offer_hash: &Hash) -> Vec<u8> {
        let mut key = vec![DB_KEY_FUNDING_PREFIX];
        key.extend_from_slice(offer_hash);
        key
    }

    fn persist_offer(&self, offer: &AtomicSwapOffer) {
        if let Some(db) = &self.db {
            let bytes = bincode::serialize(offer).expect("offer serialization");
            if let Err(err) = db.insert(Self::offer_key(&offer.offer_hash), bytes) {
                warn!("failed to persist offer: {err}");
            }
        }
    }

    pub fn add_offer(&self, offer: AtomicSwapOffer) -> Result<(), SwapError> {
        check_atomic_swap_offer(&offer)?;
        let mut guard = self.state.lock().unwrap();
        if guard.offers.contains_key(&offer.offer_hash) {
            return Err(SwapError::DuplicateOffer(hex::encode(offer.offer_hash)));
        }
        let pair = get_trading_pair_key(&offer.maker_asset_name, &offer.taker_asset_name);
        guard.offers_by_pair.entry(pair).or_default().insert(offer.offer_hash);
        self.persist_offer(&offer);
        info!(
            "added offer {}: {} {} for {} {}",
            hex::encode(&offer.offer_hash[..8]),
            offer.maker_amount,
            if offer.maker_asset_name.is_empty() { NATIVE_ASSET_SYMBOL } else { &offer.maker_asset_name },
            offer.taker_amount,
            if offer.taker_asset_name.is_empty() { NATIVE_ASSET_SYMBOL } else { &offer.taker_asset_name },
        );
        guard.offers.insert(offer.offer_hash, offer);
        Ok(())
    }

    pub fn remove_offer(&self, offer_hash: &Hash) -> Result<(), SwapError> {
        let mut guard = self.state.lock().unwrap();
        let offer = guard
            .offers
            .remove(offer_hash)
            .ok_or_else(|| SwapError::OfferNotFound(hex::encode(offer_hash)))?;
        let pair = get_trading_pair_key(&offer.maker_asset_name, &offer.taker_asset_name);
        if let Some(bucket) = guard.offers_by_pair.get_mut(&pair) {
            bucket.remove(offer_hash);
            if bucket.is_empty() {
                guard.offers_by_pair.remove(&pair);
            }
        }
        if let Some(outpoint) = guard.funding_outpoints.remove(offer_hash) {
            guard.outpoint_to_offer.remove(&outpoint);
            if let Some(db) = &self.db {
                let _ = db.remove(Self::funding_key(offer_hash));
            }
        }
        if let Some(db) = &self.db {
            let _ = db.remove(Self::offer_key(offer_hash));
        }
        debug!("removed offer {}", hex::encode(&offer_hash[..8]));
        Ok(())
    }

    pub fn get_offer(&self, offer_hash: &Hash) -> Option<AtomicSwapOffer> {
        self.state.lock().unwrap().offers.get(offer_hash).cloned()
    }

    pub fn offer_count(&self) -> usize {
        self.state.lock().unwrap().offers.len()
    }

    /// Record the outpoint that funds an offer; spending it fills the offer.
    pub fn set_funding_outpoint(&self, offer_hash: &Hash, outpoint: OutPoint) -> Result<(), SwapError> {
        let mut guard = self.state.lock().unwrap();
        if !guard.offers.contains_key(offer_hash) {
            return Err(SwapError::OfferNotFound(hex::encode(offer_hash)));
        }
        if let Some(db) = &self.db {
            let bytes = bincode::serialize(&outpoint)?;
            db.insert(Self::funding_key(offer_hash), bytes)?;
        }
        guard.outpoint_to_offer.insert(outpoint.clone(), *offer_hash);
        guard.funding_outpoints.insert(*offer_hash, outpoint);
        Ok(())
    }

    /// All active offers on the unordered pair.
    pub fn get_offers_for_pair(&self, asset_a: &str, asset_b: &str) -> Vec<AtomicSwapOffer> {
        let pair = get_trading_pair_key(asset_a, asset_b);
        let guard = self.state.lock().unwrap();
        guard
            .offers_by_pair
            .get(&pair)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter_map(|hash| guard.offers.get(hash))
                    .filter(|offer| offer.is_active)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Best active offer for a direction on the pair: buying wants the
    /// lowest rate, selling the highest.
    pub fn get_best_offer(
        &self,
        want_asset: &str,
        have_asset: &str,
        buy_order: bool,
    ) -> Option<AtomicSwapOffer> {
        let offers = self.get_offers_for_pair(want_asset, have_asset);
        let mut best: Option<AtomicSwapOffer> = None;
        for offer in offers {
            let matches_direction = if buy_order {
                offer.maker_asset_name == want_asset
            } else {
                offer.taker_asset_name == want_asset
            };
            if !matches_direction {
                continue;
            }
            let better = match &best {
                None => true,
                Some(current) => {
                    if buy_order {
                        offer.rate() < current.rate()
                    } else {
                        offer.rate() > current.rate()
                    }
                }
            };
            if better {
                best = Some(offer);
            }
        }
        best
    }

    /// Block connect: any input spending a watched funding outpoint fills
    /// its offer at this height.
    pub fn block_connected(&self, block: &Block, height: i32) {
        let mut guard = self.state.lock().unwrap();
        guard.height = height;
        let mut filled = Vec::new();
        for tx in &block.txs {
            let tx_hash = tx.txid();
            for input in &tx.inputs {
                if let Some(offer_hash) =
                    guard.outpoint_to_offer.get(&input.previous_output).copied()
                {
                    if let Some(offer) = guard.offers.get_mut(&offer_hash) {
                        if offer.is_active && !offer.is_filled {
                            offer.is_filled = true;
                            offer.is_active = false;
                            offer.fill_tx_hash = tx_hash;
                            offer.filled_height = height;
                            filled.push(offer_hash);
                            info!(
                                "offer {} filled by tx {}",
                                hex::encode(&offer_hash[..8]),
                                hex::encode(&tx_hash[..8])
                            );
                        }
                    }
                }
            }
        }
        if !filled.is_empty() {
            guard.fills_by_height.insert(height, filled.clone());
        }
        // Persist under the lock so the store follows the in-memory state.
        for offer_hash in &filled {
            if let Some(offer) = guard.offers.get(offer_hash) {
                self.persist_offer(offer);
            }
        }
        if let Some(db) = &self.db {
            let _ = db.insert(DB_KEY_HEIGHT, height.to_be_bytes().to_vec());
        }
    }

    /// Block disconnect: exactly unfill the offers filled at this height.
    pub fn block_disconnected(&self, height: i32) {
        let mut guard = self.state.lock().unwrap();
        guard.height = height - 1;
        if let Some(filled) = guard.fills_by_height.remove(&height) {
            for offer_hash in filled {
                if let Some(offer) = guard.offers.get_mut(&offer_hash) {
                    offer.is_filled = false;
                    offer.is_active = true;
                    offer.fill_tx_hash = [0u8; 32];
                    offer.filled_height = -1;
                }
                if let Some(offer) = guard.offers.get(&offer_hash) {
                    self.persist_offer(offer);
                }
            }
        }
        if let Some(db) = &self.db {
            let _ = db.insert(DB_KEY_HEIGHT, (height - 1).to_be_bytes().to_vec());
        }
    }

    /// Remove every offer that has expired at the current height.
    pub fn cleanup_expired(&self, current_height: i32) {
        let expired: Vec<Hash> = {
            let guard = self.state.lock().unwrap();
            guard
                .offers
                .values()
                .filter(|offer| offer.is_expired(current_height))
                .map(|offer| offer.offer_hash)
                .collect()
        };
        let count = expired.len();
        for offer_hash in expired {
            let _ = self.remove_offer(&offer_hash);
        }
        if count > 0 {
            info!("cleaned up {count} expired offers");
        }
    }

    pub fn height(&self) -> i32 {
        self.state.lock().unwrap().height
    }

    /// Write the whole book back to the store.
    pub fn flush(&self) -> Result<(), SwapError> {
        let db = match &self.db {
            Some(db) => db,
            None => return Ok(()),
        };
        let guard = self.state.lock().unwrap();
        for offer in guard.offers.values() {
            let bytes = bincode::serialize(offer)?;
            db.insert(Self::offer_key(&offer.offer_hash), bytes)?;
        }
        for (offer_hash, outpoint) in &guard.funding_outpoints {
            let bytes = bincode::serialize(outpoint)?;
            db.insert(Self::funding_key(offer_hash), bytes)?;
        }
        db.insert(DB_KEY_HEIGHT, guard.height.to_be_bytes().to_vec())?;
        db.flush()?;
        Ok(())
    }
}
