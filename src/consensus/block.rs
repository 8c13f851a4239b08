use {
  super::vote::Vote,
  crate::{
    primitives::{Digest, Keypair, Pubkey, ReplicaId},
    workload::Transaction,
  },
  ed25519_dalek::Signature,
  once_cell::sync::OnceCell,
  std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
  },
};

/// Lifecycle of a block on one replica. Status only ever advances;
/// `Finalized` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockStatus {
  Proposed,
  Notarized,
  Finalized,
}

/// The unit the protocol decides on: a batch of transactions bound
/// to an epoch and chained to its parent by hash.
///
/// Only `(parent, epoch, transactions)` are covered by the block
/// hash. Signatures, votes and status are replica-local metadata
/// and never feed the hash, so collecting votes can not change a
/// block's identity.
#[derive(Debug, Clone)]
pub struct Block {
  pub epoch: u64,
  pub parent: Option<Digest>,
  pub parent_epoch: Option<u64>,
  pub transactions: Vec<Transaction>,

  /// Leader endorsement over the block hash. Present in the
  /// classical variant; the USIG variant authenticates proposals
  /// through the message UI instead.
  pub signature: Option<Signature>,

  votes: BTreeMap<ReplicaId, Vote>,
  status: BlockStatus,
  hash: OnceCell<Digest>,
}

impl Block {
  pub fn new(
    epoch: u64,
    transactions: Vec<Transaction>,
    parent: Option<Digest>,
    parent_epoch: Option<u64>,
  ) -> Self {
    Self {
      epoch,
      parent,
      parent_epoch,
      transactions,
      signature: None,
      votes: BTreeMap::new(),
      status: BlockStatus::Proposed,
      hash: OnceCell::new(),
    }
  }

  /// The distinguished epoch-0 block every replica starts from.
  pub fn genesis() -> Self {
    let mut block = Block::new(0, vec![], None, None);
    block.status = BlockStatus::Notarized;
    block
  }

  /// The block hash, computed lazily over the canonical encoding
  /// and memoized. Once set it never changes.
  pub fn hash(&self) -> Digest {
    *self.hash.get_or_init(|| {
      Digest::compute(&canonical_bytes(
        self.parent.as_ref(),
        self.epoch,
        &self.transactions,
      ))
    })
  }

  pub fn is_child_of(&self, parent: &Block) -> bool {
    self.parent == Some(parent.hash())
  }

  pub fn status(&self) -> BlockStatus {
    self.status
  }

  pub fn is_notarized(&self) -> bool {
    self.status >= BlockStatus::Notarized
  }

  /// Adds a voter's endorsement. Idempotent per voter: a repeated
  /// vote is silently ignored. Returns whether the vote was new.
  pub fn add_vote(&mut self, vote: Vote) -> bool {
    if self.votes.contains_key(&vote.voter) {
      return false;
    }
    self.votes.insert(vote.voter, vote);
    true
  }

  pub fn has_vote(&self, voter: ReplicaId) -> bool {
    self.votes.contains_key(&voter)
  }

  pub fn vote_count(&self) -> usize {
    self.votes.len()
  }

  pub fn votes(&self) -> impl Iterator<Item = &Vote> {
    self.votes.values()
  }

  /// Advances Proposed -> Notarized. A block that already reached
  /// notarization stays where it is.
  pub fn notarize(&mut self) {
    if self.status == BlockStatus::Proposed {
      self.status = BlockStatus::Notarized;
    }
  }

  /// Advances Notarized -> Finalized.
  pub fn finalize(&mut self) {
    if self.status == BlockStatus::Notarized {
      self.status = BlockStatus::Finalized;
    }
  }

  /// Leader endorsement over the block hash (classical variant).
  pub fn sign(&mut self, keypair: &Keypair) {
    self.signature = Some(keypair.sign(self.hash().as_bytes()));
  }

  pub fn verify_signature(&self, key: &Pubkey) -> bool {
    match &self.signature {
      Some(signature) => key.verify(self.hash().as_bytes(), signature),
      None => false,
    }
  }
}

impl Display for Block {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "block {} [{}]", self.epoch, self.hash())
  }
}

/// The canonical byte encoding used for hashing, identical on all
/// replicas: length-prefixed parent digest, big-endian epoch, then
/// the length-prefixed transaction list. This encoding is pinned
/// here and nowhere else; the wire format is free to evolve
/// without ever changing block identities.
pub fn canonical_bytes(
  parent: Option<&Digest>,
  epoch: u64,
  transactions: &[Transaction],
) -> Vec<u8> {
  let mut out = Vec::new();
  match parent {
    Some(digest) => {
      out.extend_from_slice(&32u32.to_be_bytes());
      out.extend_from_slice(digest.as_bytes());
    }
    None => out.extend_from_slice(&0u32.to_be_bytes()),
  }
  out.extend_from_slice(&epoch.to_be_bytes());
  out.extend_from_slice(&(transactions.len() as u32).to_be_bytes());
  for tx in transactions {
    tx.canonical_bytes(&mut out);
  }
  out
}

#[cfg(test)]
mod test {
  use {
    super::{Block, BlockStatus},
    crate::{
      consensus::vote::{Endorsement, Vote},
      primitives::Keypair,
      workload::Transaction,
    },
  };

  fn transactions() -> Vec<Transaction> {
    vec![
      Transaction {
        seq: 0,
        nonce: 11,
        payload: vec![1, 2, 3],
      },
      Transaction {
        seq: 1,
        nonce: 12,
        payload: vec![4, 5, 6],
      },
    ]
  }

  fn signed_vote(keypair: &Keypair, voter: u64, block: &Block) -> Vote {
    Vote {
      voter,
      epoch: block.epoch,
      digest: block.hash(),
      endorsement: Endorsement::Signature(
        keypair.sign(block.hash().as_bytes()),
      ),
    }
  }

  #[test]
  fn hash_ignores_votes_and_signature() {
    let genesis = Block::genesis();
    let mut block =
      Block::new(1, transactions(), Some(genesis.hash()), Some(0));
    let before = block.hash();

    let keypair = Keypair::unique();
    block.sign(&keypair);
    let vote = signed_vote(&keypair, 0, &block);
    block.add_vote(vote);

    assert_eq!(block.hash(), before);

    let bare = Block::new(1, transactions(), Some(genesis.hash()), Some(0));
    assert_eq!(bare.hash(), before);
  }

  #[test]
  fn hash_covers_parent_epoch_and_transactions() {
    let genesis = Block::genesis();
    let base = Block::new(1, transactions(), Some(genesis.hash()), Some(0));

    let other_epoch =
      Block::new(2, transactions(), Some(genesis.hash()), Some(0));
    assert_ne!(base.hash(), other_epoch.hash());

    let no_parent = Block::new(1, transactions(), None, None);
    assert_ne!(base.hash(), no_parent.hash());

    let empty = Block::new(1, vec![], Some(genesis.hash()), Some(0));
    assert_ne!(base.hash(), empty.hash());
  }

  #[test]
  fn child_relation_follows_parent_digest() {
    let genesis = Block::genesis();
    let child = Block::new(1, vec![], Some(genesis.hash()), Some(0));
    let orphan = Block::new(1, vec![], None, None);
    assert!(child.is_child_of(&genesis));
    assert!(!orphan.is_child_of(&genesis));
  }

  #[test]
  fn duplicate_votes_are_ignored() {
    let genesis = Block::genesis();
    let mut block = Block::new(1, vec![], Some(genesis.hash()), Some(0));
    let keypair = Keypair::unique();
    let vote = signed_vote(&keypair, 3, &block);

    assert!(block.add_vote(vote.clone()));
    assert!(!block.add_vote(vote));
    assert_eq!(block.vote_count(), 1);
  }

  #[test]
  fn status_only_advances() {
    let mut block = Block::new(1, vec![], None, None);
    assert_eq!(block.status(), BlockStatus::Proposed);

    // finalize before notarize is a no-op
    block.finalize();
    assert_eq!(block.status(), BlockStatus::Proposed);

    block.notarize();
    assert_eq!(block.status(), BlockStatus::Notarized);
    block.notarize();
    assert_eq!(block.status(), BlockStatus::Notarized);

    block.finalize();
    assert_eq!(block.status(), BlockStatus::Finalized);
    block.notarize();
    assert_eq!(block.status(), BlockStatus::Finalized);
  }

  #[test]
  fn leader_signature_verifies() {
    let keypair = Keypair::unique();
    let genesis = Block::genesis();
    let mut block =
      Block::new(1, transactions(), Some(genesis.hash()), Some(0));
    block.sign(&keypair);

    assert!(block.verify_signature(&keypair.public()));
    assert!(!block.verify_signature(&Keypair::unique().public()));
  }

  #[test]
  fn genesis_is_notarized_with_no_parent() {
    let genesis = Block::genesis();
    assert_eq!(genesis.epoch, 0);
    assert_eq!(genesis.parent, None);
    assert!(genesis.transactions.is_empty());
    assert_eq!(genesis.status(), BlockStatus::Notarized);
  }
}
