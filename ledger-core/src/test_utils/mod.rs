mod builders;
mod mocks;
mod storage;

pub use builders::{
    TestChain, block_with_hash, deserialize_pool, label_hash, spend_tx, test_owner, test_pub_key,
};
pub use mocks::{MockConsensus, MockLibPolicy, MockMempool, MockPeers};
pub use storage::FailingStorage;
