use {
  crate::{
    config::Variant,
    consensus::{Block, Certificate, Endorsement, Ui, Vote},
    primitives::{Digest, Pubkey, ReplicaId},
    workload::Transaction,
  },
  ed25519_dalek::Signature,
  serde::{Deserialize, Serialize},
  thiserror::Error,
};

/// Wire form of a block: the hashed fields plus the leader
/// endorsement. Votes and status are replica-local and never
/// travel with proposals; recovery replies carry the vote set
/// separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockInfo {
  pub epoch: u64,
  pub parent: Option<Digest>,
  pub parent_epoch: Option<u64>,
  pub transactions: Vec<Transaction>,
  pub signature: Option<Signature>,
}

impl BlockInfo {
  pub fn from_block(block: &Block) -> Self {
    Self {
      epoch: block.epoch,
      parent: block.parent,
      parent_epoch: block.parent_epoch,
      transactions: block.transactions.clone(),
      signature: block.signature,
    }
  }

  /// Reconstructs an in-memory block. The receiver starts from
  /// Proposed status with an empty vote set and re-derives
  /// everything else itself; nothing status-related is trusted
  /// from the wire.
  pub fn into_block(self) -> Block {
    let mut block = Block::new(
      self.epoch,
      self.transactions,
      self.parent,
      self.parent_epoch,
    );
    block.signature = self.signature;
    block
  }

  /// The block hash this wire form decodes to.
  pub fn digest(&self) -> Digest {
    Digest::compute(&crate::consensus::canonical_bytes(
      self.parent.as_ref(),
      self.epoch,
      &self.transactions,
    ))
  }
}

/// The tagged envelope exchanged between replicas. Each variant
/// carries enough to be validated with nothing but the public-key
/// tables; dispatch is always on the tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
  /// Startup key distribution: the sender's verification key
  /// (replica key in the classical variant, USIG key otherwise).
  PkExchange { sender: ReplicaId, key: Pubkey },

  /// A leader's block proposal, with a certificate for the
  /// freshest notarized block it extends (absent only in epoch 1).
  Propose {
    sender: ReplicaId,
    block: BlockInfo,
    certificate: Option<Certificate>,
    ui: Option<Ui>,
  },

  /// A replica's endorsement of the proposal stored at `epoch`.
  Vote {
    sender: ReplicaId,
    epoch: u64,
    parent: Option<Digest>,
    endorsement: Endorsement,
  },

  /// USIG variant only: the sender saw epoch `epoch - 1` expire
  /// and asks to move on.
  Timeout {
    sender: ReplicaId,
    epoch: u64,
    ui: Ui,
  },

  /// Ask any peer for the block stored at `epoch`.
  RecoveryRequest { sender: ReplicaId, epoch: u64 },

  /// A recovered block together with its full vote set, delivered
  /// on the requester's auxiliary port.
  RecoveryReply {
    sender: ReplicaId,
    block: BlockInfo,
    votes: Vec<Vote>,
  },
}

#[derive(Debug, Error)]
pub enum MessageError {
  #[error("failed to decode message: {0}")]
  Decode(#[from] bincode::Error),

  #[error("message failed validation: {0}")]
  Invalid(&'static str),
}

impl Message {
  pub fn to_bytes(&self) -> Vec<u8> {
    bincode::serialize(self).expect("wire types always serialize")
  }

  /// Decodes and structurally validates one frame. Malformed
  /// frames are errors for the transport layer to log and discard.
  pub fn from_bytes(
    bytes: &[u8],
    variant: Variant,
  ) -> Result<Self, MessageError> {
    let message: Message = bincode::deserialize(bytes)?;
    message.validate(variant)?;
    Ok(message)
  }

  pub fn sender(&self) -> ReplicaId {
    match self {
      Message::PkExchange { sender, .. } => *sender,
      Message::Propose { sender, .. } => *sender,
      Message::Vote { sender, .. } => *sender,
      Message::Timeout { sender, .. } => *sender,
      Message::RecoveryRequest { sender, .. } => *sender,
      Message::RecoveryReply { sender, .. } => *sender,
    }
  }

  /// The epoch this message is about, used for ordering and
  /// buffering. Key exchange and recovery replies have none.
  pub fn epoch(&self) -> Option<u64> {
    match self {
      Message::Propose { block, .. } => Some(block.epoch),
      Message::Vote { epoch, .. } => Some(*epoch),
      Message::Timeout { epoch, .. } => Some(*epoch),
      Message::RecoveryRequest { epoch, .. } => Some(*epoch),
      _ => None,
    }
  }

  /// The unique identifier carried by USIG-authenticated message
  /// types.
  pub fn ui(&self) -> Option<&Ui> {
    match self {
      Message::Propose { ui, .. } => ui.as_ref(),
      Message::Vote {
        endorsement: Endorsement::Ui(ui),
        ..
      } => Some(ui),
      Message::Timeout { ui, .. } => Some(ui),
      _ => None,
    }
  }

  /// The digest a sender's USIG binds: everything in the message
  /// except the identifier itself, so signer and verifier agree on
  /// the bytes before the UI exists.
  pub fn digest(&self) -> Digest {
    let bytes = match self {
      Message::PkExchange { sender, key } => {
        bincode::serialize(&(0u8, sender, key))
      }
      Message::Propose {
        sender,
        block,
        certificate,
        ..
      } => bincode::serialize(&(1u8, sender, block, certificate)),
      Message::Vote {
        sender,
        epoch,
        parent,
        ..
      } => return vote_digest(*sender, *epoch, parent),
      Message::Timeout { sender, epoch, .. } => {
        return timeout_digest(*sender, *epoch)
      }
      Message::RecoveryRequest { sender, epoch } => {
        bincode::serialize(&(4u8, sender, epoch))
      }
      Message::RecoveryReply { sender, block, .. } => {
        bincode::serialize(&(5u8, sender, block))
      }
    };
    Digest::compute(&bytes.expect("wire types always serialize"))
  }

  /// The bytes a vote's UI binds, computable before the
  /// endorsement exists. `Message::digest` delegates here so
  /// signer and verifier always agree.
  pub fn vote_digest(
    sender: ReplicaId,
    epoch: u64,
    parent: &Option<Digest>,
  ) -> Digest {
    vote_digest(sender, epoch, parent)
  }

  /// Same for TIMEOUT messages.
  pub fn timeout_digest(sender: ReplicaId, epoch: u64) -> Digest {
    timeout_digest(sender, epoch)
  }

  /// Structural validation: field presence and endorsement kinds
  /// must match the running variant before any cryptographic
  /// check happens.
  pub fn validate(&self, variant: Variant) -> Result<(), MessageError> {
    match self {
      Message::PkExchange { .. } => Ok(()),
      Message::Propose {
        block,
        certificate,
        ui,
        ..
      } => {
        if block.epoch == 0 {
          return Err(MessageError::Invalid("proposal for genesis epoch"));
        }
        if block.parent.is_none() || block.parent_epoch.is_none() {
          return Err(MessageError::Invalid("proposal without parent link"));
        }
        if block.epoch > 1 && certificate.is_none() {
          return Err(MessageError::Invalid("proposal without certificate"));
        }
        if block.epoch == 1 && certificate.is_some() {
          return Err(MessageError::Invalid(
            "epoch 1 extends genesis and carries no certificate",
          ));
        }
        match variant {
          Variant::Classical => {
            if block.signature.is_none() {
              return Err(MessageError::Invalid(
                "proposal without leader signature",
              ));
            }
            if ui.is_some() {
              return Err(MessageError::Invalid(
                "unexpected UI on classical proposal",
              ));
            }
          }
          Variant::Usig => {
            if ui.is_none() {
              return Err(MessageError::Invalid("proposal without UI"));
            }
          }
        }
        Ok(())
      }
      Message::Vote {
        epoch, endorsement, ..
      } => {
        if *epoch == 0 {
          return Err(MessageError::Invalid("vote for genesis epoch"));
        }
        match (variant, endorsement) {
          (Variant::Classical, Endorsement::Signature(_)) => Ok(()),
          (Variant::Usig, Endorsement::Ui(_)) => Ok(()),
          _ => Err(MessageError::Invalid(
            "endorsement kind does not match the variant",
          )),
        }
      }
      Message::Timeout { epoch, .. } => {
        if variant == Variant::Classical {
          return Err(MessageError::Invalid(
            "timeout messages exist only in the USIG variant",
          ));
        }
        if *epoch == 0 {
          return Err(MessageError::Invalid("timeout for genesis epoch"));
        }
        Ok(())
      }
      Message::RecoveryRequest { epoch, .. } => {
        if *epoch == 0 {
          return Err(MessageError::Invalid(
            "genesis is never subject to recovery",
          ));
        }
        Ok(())
      }
      Message::RecoveryReply { block, .. } => {
        if block.epoch == 0 || block.parent.is_none() {
          return Err(MessageError::Invalid(
            "recovery reply without a chained block",
          ));
        }
        Ok(())
      }
    }
  }
}

fn vote_digest(
  sender: ReplicaId,
  epoch: u64,
  parent: &Option<Digest>,
) -> Digest {
  let bytes = bincode::serialize(&(2u8, sender, epoch, parent))
    .expect("wire types always serialize");
  Digest::compute(&bytes)
}

fn timeout_digest(sender: ReplicaId, epoch: u64) -> Digest {
  let bytes = bincode::serialize(&(3u8, sender, epoch))
    .expect("wire types always serialize");
  Digest::compute(&bytes)
}

#[cfg(test)]
mod test {
  use {
    super::{BlockInfo, Message},
    crate::{
      config::Variant,
      consensus::{Block, Certificate, Endorsement, Usig, Vote},
      primitives::{Digest, Keypair},
      workload::Transaction,
    },
  };

  fn sample_block_info(epoch: u64, sign: bool) -> BlockInfo {
    let genesis = Block::genesis();
    let mut block = Block::new(
      epoch,
      vec![Transaction {
        seq: 1,
        nonce: 2,
        payload: vec![3, 4],
      }],
      Some(genesis.hash()),
      Some(0),
    );
    if sign {
      block.sign(&Keypair::unique());
    }
    BlockInfo::from_block(&block)
  }

  #[test]
  fn propose_roundtrip_classical() {
    let message = Message::Propose {
      sender: 2,
      block: sample_block_info(1, true),
      certificate: None,
      ui: None,
    };
    let decoded =
      Message::from_bytes(&message.to_bytes(), Variant::Classical).unwrap();
    assert_eq!(decoded, message);
  }

  #[test]
  fn propose_roundtrip_usig_with_certificate() {
    let mut usig = Usig::new();
    let block = sample_block_info(2, false);
    let parent_vote_digest = Digest::compute(b"parent vote message");
    let certificate = Certificate {
      epoch: 1,
      block_hash: block.parent.unwrap(),
      votes: vec![Vote {
        voter: 0,
        epoch: 1,
        digest: parent_vote_digest,
        endorsement: Endorsement::Ui(
          usig.create_ui(1, &parent_vote_digest),
        ),
      }],
    };
    let mut message = Message::Propose {
      sender: 0,
      block,
      certificate: Some(certificate),
      ui: None,
    };
    let digest = message.digest();
    if let Message::Propose { ui, .. } = &mut message {
      *ui = Some(usig.create_ui(2, &digest));
    }

    let decoded =
      Message::from_bytes(&message.to_bytes(), Variant::Usig).unwrap();
    assert_eq!(decoded, message);
  }

  #[test]
  fn vote_and_timeout_roundtrip() {
    let mut usig = Usig::new();
    let parent = Some(Digest::compute(b"parent"));

    let vote = Message::Vote {
      sender: 1,
      epoch: 3,
      parent,
      endorsement: Endorsement::Ui(usig.create_ui(3, &Digest::compute(b"v"))),
    };
    let decoded = Message::from_bytes(&vote.to_bytes(), Variant::Usig).unwrap();
    assert_eq!(decoded, vote);

    let timeout = Message::Timeout {
      sender: 1,
      epoch: 4,
      ui: usig.create_ui(4, &Digest::compute(b"t")),
    };
    let decoded =
      Message::from_bytes(&timeout.to_bytes(), Variant::Usig).unwrap();
    assert_eq!(decoded, timeout);
  }

  #[test]
  fn recovery_and_pk_exchange_roundtrip() {
    let request = Message::RecoveryRequest {
      sender: 3,
      epoch: 7,
    };
    let decoded =
      Message::from_bytes(&request.to_bytes(), Variant::Classical).unwrap();
    assert_eq!(decoded, request);

    let reply = Message::RecoveryReply {
      sender: 0,
      block: sample_block_info(7, true),
      votes: vec![],
    };
    let decoded =
      Message::from_bytes(&reply.to_bytes(), Variant::Classical).unwrap();
    assert_eq!(decoded, reply);

    let exchange = Message::PkExchange {
      sender: 2,
      key: Keypair::unique().public(),
    };
    let decoded =
      Message::from_bytes(&exchange.to_bytes(), Variant::Classical).unwrap();
    assert_eq!(decoded, exchange);
  }

  #[test]
  fn garbage_bytes_are_rejected() {
    assert!(Message::from_bytes(b"not a message", Variant::Classical).is_err());
  }

  #[test]
  fn classical_proposal_requires_signature() {
    let message = Message::Propose {
      sender: 2,
      block: sample_block_info(1, false),
      certificate: None,
      ui: None,
    };
    assert!(Message::from_bytes(&message.to_bytes(), Variant::Classical)
      .is_err());
  }

  #[test]
  fn usig_proposal_requires_ui() {
    let message = Message::Propose {
      sender: 2,
      block: sample_block_info(1, false),
      certificate: None,
      ui: None,
    };
    assert!(Message::from_bytes(&message.to_bytes(), Variant::Usig).is_err());
  }

  #[test]
  fn timeout_is_usig_only() {
    let mut usig = Usig::new();
    let timeout = Message::Timeout {
      sender: 0,
      epoch: 2,
      ui: usig.create_ui(2, &Digest::compute(b"t")),
    };
    assert!(
      Message::from_bytes(&timeout.to_bytes(), Variant::Classical).is_err()
    );
  }

  #[test]
  fn later_epochs_require_certificate() {
    let message = Message::Propose {
      sender: 2,
      block: sample_block_info(2, true),
      certificate: None,
      ui: None,
    };
    assert!(Message::from_bytes(&message.to_bytes(), Variant::Classical)
      .is_err());
  }

  #[test]
  fn digest_excludes_the_ui() {
    let mut usig = Usig::new();
    let without = Message::Propose {
      sender: 0,
      block: sample_block_info(1, false),
      certificate: None,
      ui: None,
    };
    let digest = without.digest();

    let mut with = without.clone();
    if let Message::Propose { ui, .. } = &mut with {
      *ui = Some(usig.create_ui(1, &digest));
    }
    assert_eq!(with.digest(), digest);
  }
}
