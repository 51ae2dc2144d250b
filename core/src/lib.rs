//! SPV client core: header-only chain validation, partial Merkle proof
//! verification, peer session handling, and the two-phase download
//! coordinator described across this crate's modules.

pub mod chain;
pub mod codec;
pub mod coordinator;
pub mod error;
pub mod hash;
pub mod header;
pub mod inventory;
pub mod locator;
pub mod merkle;
pub mod params;
pub mod relay;
pub mod session;
pub mod storage;
pub mod tx;
pub mod uint256;

/// Library version, for inclusion in a `version` message's user agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use crate::chain::{ChainEvent, ChainStore, StoredBlock};
pub use crate::coordinator::{Command, CoordinatorConfig, CoordinatorEvent, DownloadCoordinator, PeerId};
pub use crate::error::{ChainError, CodecError, SessionError, SpvError, SpvResult, StorageError};
pub use crate::hash::Hash256;
pub use crate::header::BlockHeader;
pub use crate::inventory::{InventoryItem, InventoryKind};
pub use crate::locator::BlockLocator;
pub use crate::merkle::PartialMerkleTree;
pub use crate::params::NetworkParams;
pub use crate::relay::RelayService;
pub use crate::session::{PeerSession, SessionRegistry, SessionState};
pub use crate::storage::{ChainStorage, ChainTransaction, InMemoryChainStorage};
pub use crate::uint256::U256;
