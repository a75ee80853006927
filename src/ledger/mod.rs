/*!
# Ledger Types

Polymorphic ledger structures found inside blocks and query results. Each is
a closed tagged variant decoded by its leading discriminant:

* certificates (`certs::Certificate`, types 0 to 6) and the stake
  credentials, pool relays and MIR rewards they carry; decoded certificates
  keep their original bytes (`certs::StoredCertificate`)
* blocks wrapped with their era (`block::Block`, block types 0 to 7)
*/

pub mod block;
pub mod certs;
pub mod common;

pub use block::{Block, BlockHeader, BlockType};
pub use certs::{
    Certificate, MirReward, MirSource, MirTarget, PoolMetadata, PoolRegistration, PoolRelay,
    StakeCredential, StoredCertificate, UnitInterval,
};
