mod hash;
mod keys;

pub use hash::{canonical_json, hash, Hash, Hashable, HASH_SIZE};
pub use keys::{Address, KeyPair, PublicKey, Signature};
