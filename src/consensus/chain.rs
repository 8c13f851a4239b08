//! Blockchain state
//!
//! Every replica keeps one block per epoch in an in-memory map.
//! Blocks go through three phases:
//!
//! 1. Proposed: received from an epoch leader and chained to the
//! freshest notarized block. Proposed blocks collect votes.
//!
//! 2. Notarized: a quorum of distinct replicas endorsed the block.
//! Notarized blocks form chains; the longest of them (the freshest
//! notarized chain) is what new proposals must extend.
//!
//! 3. Finalized: the finalization rule observed enough adjacent
//! notarized epochs on top of the block. Finalized blocks are never
//! reverted and are appended to the durable output log.
//!
//! Parent links are stored as `(parent_epoch, parent_hash)` pairs
//! and validated on every dereference, so the map stays free of
//! language-level cycles.

use {
  super::block::{Block, BlockStatus},
  std::collections::{BTreeMap, HashSet},
  thiserror::Error,
  tracing::debug,
};

#[derive(Debug, Error)]
pub enum ChainError {
  #[error(
    "epoch {epoch} already holds a different block, refusing to overwrite"
  )]
  Occupied { epoch: u64 },
}

/// The `epoch -> Block` store plus the derived freshest-chain and
/// finalization state. Owned exclusively by the consensus activity;
/// other tasks interact with it only through messages.
pub struct Blockchain {
  blocks: BTreeMap<u64, Block>,
  finalized_count: usize,
}

impl Blockchain {
  /// A chain holding only the genesis block at epoch 0.
  pub fn new() -> Self {
    let genesis = Block::genesis();
    let mut blocks = BTreeMap::new();
    blocks.insert(0, genesis);
    Self {
      blocks,
      finalized_count: 0,
    }
  }

  /// Inserts a block at its epoch. A different block already
  /// occupying the epoch is a protocol-level fault upstream and is
  /// refused; re-inserting the same block is a no-op.
  pub fn add_block(&mut self, block: Block) -> Result<(), ChainError> {
    let epoch = block.epoch;
    if let Some(existing) = self.blocks.get(&epoch) {
      if existing.hash() != block.hash() {
        return Err(ChainError::Occupied { epoch });
      }
      return Ok(());
    }
    debug!("storing {block}");
    self.blocks.insert(epoch, block);
    Ok(())
  }

  pub fn get(&self, epoch: u64) -> Option<&Block> {
    self.blocks.get(&epoch)
  }

  pub fn get_mut(&mut self, epoch: u64) -> Option<&mut Block> {
    self.blocks.get_mut(&epoch)
  }

  pub fn latest_epoch(&self) -> u64 {
    self.blocks.keys().next_back().copied().unwrap_or(0)
  }

  pub fn finalized_count(&self) -> usize {
    self.finalized_count
  }

  /// The tip of the freshest notarized chain. Falls back to
  /// genesis, which is always notarized.
  pub fn freshest_notarized(&self) -> &Block {
    let chain = self.freshest_chain();
    self
      .blocks
      .get(&chain[0])
      .expect("freshest chain epochs are always stored")
  }

  /// Epochs of the freshest notarized chain, tip first, ending at
  /// genesis.
  ///
  /// Candidate chains start at every notarized block not already
  /// part of a longer chain, scanning epochs in descending order,
  /// and walk parent links while the link is intact (`is_child`)
  /// and the parent reached notarization. The longest chain wins;
  /// on equal length the one with the highest tip epoch wins,
  /// which is also the first one encountered by the descending
  /// scan. The result is stable within an epoch because blocks
  /// only gain status.
  pub fn freshest_chain(&self) -> Vec<u64> {
    let mut visited: HashSet<u64> = HashSet::new();
    let mut best: Vec<u64> = vec![];

    for (&epoch, block) in self.blocks.iter().rev() {
      if visited.contains(&epoch) || !block.is_notarized() {
        continue;
      }

      let mut chain = vec![];
      let mut current = block;
      loop {
        chain.push(current.epoch);
        visited.insert(current.epoch);
        match current.parent_epoch {
          None => break, // genesis
          Some(parent_epoch) => match self.blocks.get(&parent_epoch) {
            Some(parent)
              if current.is_child_of(parent) && parent.is_notarized() =>
            {
              current = parent
            }
            _ => break,
          },
        }
      }

      if chain.len() > best.len() {
        best = chain;
      }
    }

    best
  }

  /// Applies the finalization rule to the current freshest chain:
  /// when its `window` newest blocks carry strictly consecutive
  /// epoch numbers, every notarized block below the tip becomes
  /// finalized. Returns the newly finalized epochs in ascending
  /// order; the caller appends them to the durable log.
  pub fn finalize(&mut self, window: usize) -> Vec<u64> {
    let chain = self.freshest_chain();
    if chain.len() < window {
      return vec![];
    }
    for pair in chain[..window].windows(2) {
      if pair[0] != pair[1] + 1 {
        return vec![];
      }
    }

    let mut newly = vec![];
    for &epoch in chain[1..].iter().rev() {
      if let Some(block) = self.blocks.get_mut(&epoch) {
        if block.status() == BlockStatus::Finalized {
          continue;
        }
        block.finalize();
        newly.push(epoch);
      }
    }
    self.finalized_count += newly.len();
    newly
  }
}

impl Default for Blockchain {
  fn default() -> Self {
    Self::new()
  }
}
