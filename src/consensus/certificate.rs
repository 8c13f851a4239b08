use {
  super::{block::Block, vote::Vote},
  crate::primitives::{Digest, Pubkey, ReplicaId},
  serde::{Deserialize, Serialize},
  std::collections::{HashMap, HashSet},
};

/// A portable record of a block's quorum: the votes that notarized
/// a specific `(epoch, block hash)`.
///
/// Proposals carry a certificate for the freshest notarized block
/// they extend so a receiver that missed the notarization can
/// still validate the chain relationship, or discover that it is
/// behind and must recover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
  pub epoch: u64,
  pub block_hash: Digest,
  pub votes: Vec<Vote>,
}

impl Certificate {
  /// Snapshots the vote set of a notarized block.
  pub fn for_block(block: &Block) -> Self {
    Self {
      epoch: block.epoch,
      block_hash: block.hash(),
      votes: block.votes().cloned().collect(),
    }
  }

  /// Whether this certificate names exactly `block`.
  pub fn extends(&self, block: &Block) -> bool {
    self.epoch == block.epoch && self.block_hash == block.hash()
  }

  /// Validates the certificate against a known public-key set:
  /// at least `quorum` valid endorsements from distinct voters,
  /// each bound to this certificate's epoch.
  ///
  /// Classical endorsements must cover the certified block hash;
  /// USIG endorsements cover each voter's own vote message, whose
  /// digest travels inside the vote.
  pub fn verify(
    &self,
    keys: &HashMap<ReplicaId, Pubkey>,
    quorum: usize,
  ) -> bool {
    let mut seen = HashSet::new();
    let mut valid = 0;
    for vote in &self.votes {
      if !seen.insert(vote.voter) {
        continue;
      }
      if vote.epoch != self.epoch {
        continue;
      }
      if let super::vote::Endorsement::Signature(_) = vote.endorsement {
        if vote.digest != self.block_hash {
          continue;
        }
      }
      if let Some(key) = keys.get(&vote.voter) {
        if vote.verify(key) {
          valid += 1;
        }
      }
      if valid >= quorum {
        return true;
      }
    }
    false
  }
}

#[cfg(test)]
mod test {
  use {
    super::Certificate,
    crate::{
      consensus::{
        block::Block,
        usig::Usig,
        vote::{Endorsement, Vote},
      },
      primitives::{Digest, Keypair, Pubkey, ReplicaId},
    },
    std::collections::HashMap,
  };

  fn classical_setup() -> (Block, Vec<Keypair>, HashMap<ReplicaId, Pubkey>) {
    let genesis = Block::genesis();
    let block = Block::new(3, vec![], Some(genesis.hash()), Some(0));
    let keypairs: Vec<Keypair> = (0..4).map(|_| Keypair::unique()).collect();
    let keys = keypairs
      .iter()
      .enumerate()
      .map(|(id, kp)| (id as ReplicaId, kp.public()))
      .collect();
    (block, keypairs, keys)
  }

  fn signed_vote(keypair: &Keypair, voter: ReplicaId, block: &Block) -> Vote {
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
  fn quorum_of_valid_signatures_passes() {
    let (mut block, keypairs, keys) = classical_setup();
    for (id, keypair) in keypairs.iter().enumerate().take(3) {
      let vote = signed_vote(keypair, id as ReplicaId, &block);
      block.add_vote(vote);
    }
    let certificate = Certificate::for_block(&block);
    assert!(certificate.verify(&keys, 3));
    assert!(!certificate.verify(&keys, 4));
  }

  #[test]
  fn duplicate_voters_count_once() {
    let (block, keypairs, keys) = classical_setup();
    let vote = signed_vote(&keypairs[0], 0, &block);
    let certificate = Certificate {
      epoch: block.epoch,
      block_hash: block.hash(),
      votes: vec![vote.clone(), vote.clone(), vote],
    };
    assert!(!certificate.verify(&keys, 2));
    assert!(certificate.verify(&keys, 1));
  }

  #[test]
  fn wrong_digest_signature_is_ignored() {
    let (block, keypairs, keys) = classical_setup();
    let stray = Digest::compute(b"some other block");
    let forged = Vote {
      voter: 0,
      epoch: block.epoch,
      digest: stray,
      endorsement: Endorsement::Signature(
        keypairs[0].sign(stray.as_bytes()),
      ),
    };
    let certificate = Certificate {
      epoch: block.epoch,
      block_hash: block.hash(),
      votes: vec![forged],
    };
    assert!(!certificate.verify(&keys, 1));
  }

  #[test]
  fn usig_certificate_verifies_uis() {
    let genesis = Block::genesis();
    let block = Block::new(2, vec![], Some(genesis.hash()), Some(0));
    let mut usigs: Vec<Usig> = (0..3).map(|_| Usig::new()).collect();
    let keys: HashMap<ReplicaId, Pubkey> = usigs
      .iter()
      .enumerate()
      .map(|(id, usig)| (id as ReplicaId, usig.public_key()))
      .collect();

    let votes: Vec<Vote> = usigs
      .iter_mut()
      .enumerate()
      .map(|(id, usig)| {
        // each voter endorses its own vote message digest
        let digest = Digest::compute(format!("vote from {id}").as_bytes());
        Vote {
          voter: id as ReplicaId,
          epoch: block.epoch,
          digest,
          endorsement: Endorsement::Ui(usig.create_ui(block.epoch, &digest)),
        }
      })
      .collect();

    let certificate = Certificate {
      epoch: block.epoch,
      block_hash: block.hash(),
      votes,
    };
    assert!(certificate.verify(&keys, 2));
  }

  #[test]
  fn extends_matches_epoch_and_hash() {
    let (block, _, _) = classical_setup();
    let certificate = Certificate::for_block(&block);
    assert!(certificate.extends(&block));

    let genesis = Block::genesis();
    assert!(!certificate.extends(&genesis));
  }
}
