use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

pub type Blake2b224 = [u8; 28];
pub type Blake2b256 = [u8; 32];

pub type AddrKeyHash = Blake2b224;
pub type ScriptHash = Blake2b224;
pub type PoolKeyHash = Blake2b224;
pub type GenesisHash = Blake2b224;
pub type GenesisDelegateHash = Blake2b224;
pub type VrfKeyHash = Blake2b256;
pub type PoolMetadataHash = Blake2b256;

/// Amount of lovelace.
pub type Coin = u64;
pub type Epoch = u64;

/// Slots in a Byron epoch.
pub const BYRON_SLOTS_PER_EPOCH: u64 = 21600;

/// Blake2b-256 over `prefix` followed by `data`.
pub fn blake2b_256(prefix: &[u8], data: &[u8]) -> Blake2b256 {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(prefix);
    hasher.update(data);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    hash
}
