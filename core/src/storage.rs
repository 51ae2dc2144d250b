//! Persistence port (§4.7, §6): a small trait the coordinator's group
//! thread uses to make the chain durable, plus an in-memory implementation
//! for tests and a `sled`-backed implementation for production use.

use crate::chain::StoredBlock;
use crate::error::StorageError;
use crate::hash::Hash256;
use crate::merkle::PartialMerkleTree;
use serde::{Deserialize, Serialize};

/// Bincode-friendly mirror of [`StoredBlock`]; kept separate from the live
/// type so the wire/runtime representation can evolve independently of the
/// on-disk one.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredBlockRecord {
    header: [u8; 80],
    height: u32,
    cumulative_work: [u8; 32],
}

impl From<&StoredBlock> for StoredBlockRecord {
    fn from(block: &StoredBlock) -> Self {
        Self {
            header: block.header.encode(),
            height: block.height,
            cumulative_work: block.cumulative_work.to_be_bytes(),
        }
    }
}

impl StoredBlockRecord {
    fn into_stored_block(self) -> Option<StoredBlock> {
        Some(StoredBlock {
            header: crate::header::BlockHeader::decode(&self.header)?,
            height: self.height,
            cumulative_work: crate::uint256::U256::from_be_bytes(self.cumulative_work),
        })
    }
}

/// One mutation queued into a [`ChainTransaction`].
enum ChainOp {
    PersistBlock(StoredBlock),
    PersistTree(Hash256, PartialMerkleTree),
    DeleteBlock(Hash256),
}

/// A batch of storage mutations applied atomically by [`ChainStorage::commit`],
/// mirroring the teacher's `BatchOperation`/`execute_batch` pair
/// (`node/src/storage/database.rs`). The group thread builds one of these per
/// chain event (§5's "atomic commits per chain event") instead of issuing the
/// individual mutations one at a time, so a crash mid-reorg can never leave a
/// block persisted without its partial Merkle tree, or a disconnected block
/// only half removed.
#[derive(Default)]
pub struct ChainTransaction {
    ops: Vec<ChainOp>,
}

impl ChainTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persist_block(&mut self, block: StoredBlock) -> &mut Self {
        self.ops.push(ChainOp::PersistBlock(block));
        self
    }

    pub fn persist_partial_merkle_tree(&mut self, block_id: Hash256, tree: PartialMerkleTree) -> &mut Self {
        self.ops.push(ChainOp::PersistTree(block_id, tree));
        self
    }

    pub fn delete_block(&mut self, block_id: Hash256) -> &mut Self {
        self.ops.push(ChainOp::DeleteBlock(block_id));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The persistence port the coordinator depends on. All calls are made from
/// the single group thread; implementations need not be internally
/// thread-safe beyond what `Send` requires for the async runtime to move
/// them across a `.await`.
pub trait ChainStorage: Send {
    /// Load every persisted block, in no particular order; the caller
    /// reconstructs chain topology from each block's `previous_id`.
    fn load_chain(&self) -> Result<Vec<StoredBlock>, StorageError>;

    fn persist_block(&self, block: &StoredBlock) -> Result<(), StorageError>;

    fn persist_partial_merkle_tree(&self, block_id: Hash256, tree: &PartialMerkleTree) -> Result<(), StorageError>;

    fn delete_block(&self, block_id: Hash256) -> Result<(), StorageError>;

    fn load_partial_merkle_tree(&self, block_id: Hash256) -> Result<Option<PartialMerkleTree>, StorageError>;

    /// Apply every mutation in `txn` as a single atomic unit: either all of
    /// it lands or none of it does. The default implementation applies each
    /// op through the calls above in order, which is what `InMemoryChainStorage`
    /// needs (everything lives behind its own mutex already); a durable
    /// backend should override this with a real transaction instead of
    /// inheriting the sequential default.
    fn commit(&self, txn: ChainTransaction) -> Result<(), StorageError> {
        for op in txn.ops {
            match op {
                ChainOp::PersistBlock(block) => self.persist_block(&block)?,
                ChainOp::PersistTree(block_id, tree) => self.persist_partial_merkle_tree(block_id, &tree)?,
                ChainOp::DeleteBlock(block_id) => self.delete_block(block_id)?,
            }
        }
        Ok(())
    }
}

/// In-memory implementation for tests and non-durable callers, mirroring
/// the teacher's pattern of a lightweight mock chain state alongside the
/// production store.
#[derive(Default)]
pub struct InMemoryChainStorage {
    blocks: parking_lot::Mutex<std::collections::HashMap<Hash256, StoredBlock>>,
    trees: parking_lot::Mutex<std::collections::HashMap<Hash256, PartialMerkleTree>>,
}

impl InMemoryChainStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChainStorage for InMemoryChainStorage {
    fn load_chain(&self) -> Result<Vec<StoredBlock>, StorageError> {
        Ok(self.blocks.lock().values().cloned().collect())
    }

    fn persist_block(&self, block: &StoredBlock) -> Result<(), StorageError> {
        self.blocks.lock().insert(block.block_id(), block.clone());
        Ok(())
    }

    fn persist_partial_merkle_tree(&self, block_id: Hash256, tree: &PartialMerkleTree) -> Result<(), StorageError> {
        self.trees.lock().insert(block_id, tree.clone());
        Ok(())
    }

    fn delete_block(&self, block_id: Hash256) -> Result<(), StorageError> {
        self.blocks.lock().remove(&block_id);
        self.trees.lock().remove(&block_id);
        Ok(())
    }

    fn load_partial_merkle_tree(&self, block_id: Hash256) -> Result<Option<PartialMerkleTree>, StorageError> {
        Ok(self.trees.lock().get(&block_id).cloned())
    }
}

/// `sled`-backed implementation with three column families: `blocks`
/// (block id -> header record), `heights` (height -> active block id, for
/// O(1) active-chain lookups), and `merkle` (block id -> partial Merkle
/// tree, when one is retained).
#[cfg(feature = "sled-storage")]
pub struct SledChainStorage {
    blocks: sled::Tree,
    heights: sled::Tree,
    merkle: sled::Tree,
}

#[cfg(feature = "sled-storage")]
impl SledChainStorage {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self {
            blocks: db.open_tree("blocks")?,
            heights: db.open_tree("heights")?,
            merkle: db.open_tree("merkle")?,
        })
    }

    fn active_chain_len(&self) -> Result<u32, StorageError> {
        Ok(self.heights.len() as u32)
    }
}

#[cfg(feature = "sled-storage")]
impl ChainStorage for SledChainStorage {
    fn load_chain(&self) -> Result<Vec<StoredBlock>, StorageError> {
        let mut out = Vec::with_capacity(self.active_chain_len()? as usize);
        for entry in self.blocks.iter() {
            let (_, value) = entry?;
            let record: StoredBlockRecord = bincode::deserialize(&value)?;
            let block = record
                .into_stored_block()
                .ok_or_else(|| StorageError::Corruption("malformed stored header".into()))?;
            out.push(block);
        }
        Ok(out)
    }

    fn persist_block(&self, block: &StoredBlock) -> Result<(), StorageError> {
        let record = StoredBlockRecord::from(block);
        let encoded = bincode::serialize(&record)?;
        self.blocks.insert(block.block_id().0, encoded)?;
        self.heights.insert(block.height.to_be_bytes(), block.block_id().0.to_vec())?;
        Ok(())
    }

    fn persist_partial_merkle_tree(&self, block_id: Hash256, tree: &PartialMerkleTree) -> Result<(), StorageError> {
        let encoded = bincode::serialize(tree)?;
        self.merkle.insert(block_id.0, encoded)?;
        Ok(())
    }

    fn delete_block(&self, block_id: Hash256) -> Result<(), StorageError> {
        self.blocks.remove(block_id.0)?;
        self.merkle.remove(block_id.0)?;
        Ok(())
    }

    fn load_partial_merkle_tree(&self, block_id: Hash256) -> Result<Option<PartialMerkleTree>, StorageError> {
        match self.merkle.get(block_id.0)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Runs the whole batch through one `sled` transaction spanning all
    /// three trees, so a reorg's disconnects and connects land together or
    /// not at all, matching `execute_batch`'s guarantee in
    /// `node/src/storage/database.rs`.
    fn commit(&self, txn: ChainTransaction) -> Result<(), StorageError> {
        use sled::transaction::{abort, TransactionError, Transactional};

        let outcome = (&self.blocks, &self.heights, &self.merkle).transaction(|(blocks, heights, merkle)| {
            for op in &txn.ops {
                match op {
                    ChainOp::PersistBlock(block) => {
                        let record = StoredBlockRecord::from(block);
                        let encoded = bincode::serialize(&record).map_err(abort)?;
                        blocks.insert(&block.block_id().0, encoded)?;
                        heights.insert(&block.height.to_be_bytes(), block.block_id().0.to_vec())?;
                    }
                    ChainOp::PersistTree(block_id, tree) => {
                        let encoded = bincode::serialize(tree).map_err(abort)?;
                        merkle.insert(&block_id.0, encoded)?;
                    }
                    ChainOp::DeleteBlock(block_id) => {
                        blocks.remove(&block_id.0)?;
                        merkle.remove(&block_id.0)?;
                    }
                }
            }
            Ok(())
        });

        match outcome {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(StorageError::Serialization(e)),
            Err(TransactionError::Storage(e)) => Err(StorageError::Sled(e)),
        }
    }
}
