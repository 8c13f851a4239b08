mod digest;
mod keys;

pub use {
  digest::Digest,
  keys::{Keypair, KeypairError, Pubkey},
};

/// Numeric identity of a replica in the fixed peer set.
///
/// Replicas are numbered 0..N-1 where N = 3f+1 (classical) or
/// 2f+1 (USIG). This identity is bound in the leader schedule
/// and in every signature exchanged by the protocol.
pub type ReplicaId = u64;
