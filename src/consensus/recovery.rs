use {
  super::{
    block::Block,
    chain::{Blockchain, ChainError},
    vote::{Endorsement, Vote},
  },
  crate::{
    config::Variant,
    network::{
      message::{BlockInfo, Message},
      wire,
      Communication,
    },
    primitives::{Pubkey, ReplicaId},
  },
  rand::seq::SliceRandom,
  std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    time::Duration,
  },
  thiserror::Error,
  tokio::net::{TcpListener, TcpStream},
  tracing::{debug, info, warn},
};

/// Budget for one peer to answer a recovery request.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RecoveryError {
  #[error("no peer could supply a valid block for epoch {0}")]
  Exhausted(u64),

  #[error("recovered block for epoch {epoch} does not link to its parent")]
  BrokenLink { epoch: u64 },

  #[error("io error during recovery: {0}")]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  Chain(#[from] ChainError),
}

/// The requester side of the backfill sub-protocol.
///
/// When a proposal certifies a notarized block the replica never
/// saw, the replica asks random peers for it, validates the
/// returned vote set against the known keys, and walks further
/// back until the recovered blocks connect to its own chain.
pub struct Recovery<'a> {
  pub id: ReplicaId,
  pub variant: Variant,
  pub comms: &'a Communication,
  pub keys: &'a HashMap<ReplicaId, Pubkey>,
  pub peers: Vec<ReplicaId>,
  pub quorum: usize,

  /// The auxiliary address this replica listens on for replies.
  pub listen_addr: SocketAddr,
}

impl Recovery<'_> {
  /// Acquires the block for `target` plus any missing ancestors
  /// and installs them, oldest first, after checking every parent
  /// link. Each missing epoch gets one pass of peer sampling
  /// without replacement, so the total attempt budget is bounded
  /// by missing-ancestors x (N - 1).
  pub async fn recover(
    &self,
    chain: &mut Blockchain,
    target: u64,
  ) -> Result<(), RecoveryError> {
    info!("initiating recovery for the block of epoch {target}");
    let listener = TcpListener::bind(self.listen_addr).await?;

    let mut pending: Vec<Block> = vec![];
    let mut epoch = target;
    loop {
      let block = self.fetch(&listener, epoch).await?;
      let parent_epoch = match block.parent_epoch {
        Some(parent_epoch) => parent_epoch,
        None => return Err(RecoveryError::BrokenLink { epoch }),
      };
      let parent_known = chain.get(parent_epoch).is_some();
      pending.push(block);
      if parent_known {
        break;
      }
      epoch = parent_epoch;
    }

    // unwind oldest-first so every parent is in place before its
    // child is linked in
    while let Some(block) = pending.pop() {
      let linked = block
        .parent_epoch
        .and_then(|parent_epoch| chain.get(parent_epoch))
        .map(|parent| block.is_child_of(parent))
        .unwrap_or(false);
      if !linked {
        return Err(RecoveryError::BrokenLink { epoch: block.epoch });
      }
      info!("recovered block for epoch {} successfully", block.epoch);
      chain.add_block(block)?;
    }
    Ok(())
  }

  /// Asks peers one by one, sampled without replacement, for the
  /// block of one epoch. Returns the first reply carrying a
  /// quorum of valid endorsements.
  async fn fetch(
    &self,
    listener: &TcpListener,
    epoch: u64,
  ) -> Result<Block, RecoveryError> {
    let mut candidates = self.peers.clone();
    candidates.shuffle(&mut rand::thread_rng());

    for peer in candidates {
      debug!("requesting block of epoch {epoch} from replica {peer}");
      self.comms.send(peer, &Message::RecoveryRequest {
        sender: self.id,
        epoch,
      });

      let accepted =
        tokio::time::timeout(ATTEMPT_TIMEOUT, listener.accept()).await;
      let mut stream = match accepted {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
          debug!("accepting recovery reply failed: {e}");
          continue;
        }
        Err(_) => {
          debug!("recovery request to replica {peer} timed out");
          continue;
        }
      };

      let frame = match tokio::time::timeout(
        ATTEMPT_TIMEOUT,
        wire::read_frame(&mut stream),
      )
      .await
      {
        Ok(Ok(frame)) => frame,
        _ => {
          debug!("reading recovery reply from replica {peer} failed");
          continue;
        }
      };

      let message = match Message::from_bytes(&frame, self.variant) {
        Ok(message) => message,
        Err(e) => {
          warn!("discarding malformed recovery reply: {e}");
          continue;
        }
      };

      if let Message::RecoveryReply { block, votes, .. } = message {
        match validated_block(block, votes, epoch, self.keys, self.quorum) {
          Ok(block) => return Ok(block),
          Err(reason) => {
            warn!("recovery reply from replica {peer} rejected: {reason}")
          }
        }
      }
    }

    Err(RecoveryError::Exhausted(epoch))
  }
}

/// Validates a recovery reply without trusting the responder: the
/// hash is recomputed from the canonical fields and the vote set
/// must contain at least `quorum` valid endorsements from distinct
/// voters. On success the block is reconstructed as notarized with
/// its surviving votes.
pub fn validated_block(
  info: BlockInfo,
  votes: Vec<Vote>,
  expected_epoch: u64,
  keys: &HashMap<ReplicaId, Pubkey>,
  quorum: usize,
) -> Result<Block, &'static str> {
  if info.epoch != expected_epoch {
    return Err("reply names a different epoch");
  }
  let block_hash = info.digest();
  let mut block = info.into_block();

  let mut seen = HashSet::new();
  let mut valid = vec![];
  for vote in votes {
    if !seen.insert(vote.voter) {
      continue;
    }
    if vote.epoch != expected_epoch {
      continue;
    }
    if let Endorsement::Signature(_) = vote.endorsement {
      if vote.digest != block_hash {
        continue;
      }
    }
    let verified = keys
      .get(&vote.voter)
      .map(|key| vote.verify(key))
      .unwrap_or(false);
    if verified {
      valid.push(vote);
    }
  }

  if valid.len() < quorum {
    return Err("reply carries fewer valid votes than the quorum");
  }
  for vote in valid {
    block.add_vote(vote);
  }
  block.notarize();
  Ok(block)
}

/// The responder side: ships a block (with its full vote set) to
/// the requester's auxiliary port on a fresh connection. Runs as a
/// transient task so the replier's consensus loop never blocks.
pub fn spawn_reply(reply: Message, to_addr: SocketAddr) {
  tokio::spawn(async move {
    match tokio::time::timeout(ATTEMPT_TIMEOUT, TcpStream::connect(to_addr))
      .await
    {
      Ok(Ok(mut stream)) => {
        if let Err(e) = wire::write_frame(&mut stream, &reply.to_bytes()).await
        {
          debug!("sending recovery reply to {to_addr} failed: {e}");
        }
      }
      Ok(Err(e)) => {
        debug!("connecting to {to_addr} for a recovery reply failed: {e}")
      }
      Err(_) => {
        debug!("connecting to {to_addr} for a recovery reply timed out")
      }
    }
  });
}
