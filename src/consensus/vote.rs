use {
  super::usig::Ui,
  crate::primitives::{Digest, Pubkey, ReplicaId},
  ed25519_dalek::Signature,
  serde::{Deserialize, Serialize},
  std::fmt::{Debug, Formatter},
};

/// How a voter authenticates its endorsement.
///
/// The classical variant signs with the replica key directly; the
/// USIG variant binds the endorsement to the voter's monotonic
/// counter, which is what makes the f+1 quorum sound.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub enum Endorsement {
  /// ed25519 signature by the voter's replica key over the
  /// endorsed digest.
  Signature(Signature),

  /// USIG-issued identifier binding `(epoch, digest, counter)`.
  Ui(Ui),
}

impl Debug for Endorsement {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      Endorsement::Signature(_) => write!(f, "Endorsement::Signature"),
      Endorsement::Ui(ui) => write!(f, "Endorsement::Ui({})", ui.counter),
    }
  }
}

/// One voter's endorsement of a block.
///
/// `digest` is what the endorsement covers: the block hash in the
/// classical variant, the hash of the carrying message in the USIG
/// variant. Votes travel inside certificates and recovery replies,
/// so they carry everything needed to re-verify them standalone
/// against a known public-key set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
  pub voter: ReplicaId,
  pub epoch: u64,
  pub digest: Digest,
  pub endorsement: Endorsement,
}

impl Vote {
  /// Verifies the endorsement against the voter's verification
  /// key. The caller is responsible for checking that `digest`
  /// matches the block being counted (classical variant).
  pub fn verify(&self, key: &Pubkey) -> bool {
    match &self.endorsement {
      Endorsement::Signature(signature) => {
        key.verify(self.digest.as_bytes(), signature)
      }
      Endorsement::Ui(ui) => ui.verify(key, self.epoch, &self.digest),
    }
  }
}
