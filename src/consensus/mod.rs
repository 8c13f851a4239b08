//! Chan, B., Shi, E. "Streamlet: Textbook Streamlined Blockchains."
//! Epoch-synchronous propose-vote consensus with notarization and a
//! consecutive-epoch finalization rule, in the classical 3f+1 and
//! the USIG-backed 2f+1 deployment.

mod block;
mod certificate;
mod chain;
mod engine;
mod recovery;
mod schedule;
mod usig;
mod vote;

pub use {
  block::{canonical_bytes, Block, BlockStatus},
  certificate::Certificate,
  chain::{Blockchain, ChainError},
  engine::{EngineError, Streamlet},
  recovery::RecoveryError,
  schedule::LeaderSchedule,
  usig::{CounterTracker, Ui, Usig},
  vote::{Endorsement, Vote},
};
