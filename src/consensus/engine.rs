use {
  super::{
    block::{Block, BlockStatus},
    certificate::Certificate,
    chain::{Blockchain, ChainError},
    recovery::{self, Recovery, RecoveryError},
    schedule::LeaderSchedule,
    usig::{CounterTracker, Ui, Usig},
    vote::{Endorsement, Vote},
  },
  crate::{
    config::{Config, Variant},
    network::{
      message::{BlockInfo, Message},
      Communication,
    },
    primitives::{Digest, Keypair, Pubkey, ReplicaId},
    storage::FinalizedLog,
    workload::Transaction,
  },
  std::{
    collections::{HashMap, VecDeque},
    time::Duration,
  },
  thiserror::Error,
  tokio::{sync::mpsc, time::Instant},
  tracing::{debug, error, info, warn},
};

/// How often the replica re-announces its key while waiting for
/// the rest of the peer set to come up.
const KEY_EXCHANGE_INTERVAL: Duration = Duration::from_millis(500);

/// Fatal conditions only. Everything protocol-level is contained
/// within the epoch it occurred in.
#[derive(Debug, Error)]
pub enum EngineError {
  #[error("the network inbox closed, transport is gone")]
  InboxClosed,
}

/// Per-message protocol faults: the message is dropped, the epoch
/// keeps running.
#[derive(Debug, Error)]
enum ProtocolError {
  #[error("proposer {sender} is not the leader of epoch {epoch}")]
  NotLeader { sender: ReplicaId, epoch: u64 },

  #[error("proposal for epoch {0} carries no certificate")]
  MissingCertificate(u64),

  #[error("certificate does not gather a quorum of valid votes")]
  InvalidCertificate,

  #[error("certificate names an older block than the local freshest chain")]
  StaleCertificate,

  #[error("proposal does not extend the freshest notarized block")]
  DoesNotExtend,

  #[error("endorsement does not verify against the sender's key")]
  BadEndorsement,

  #[error("recovery failed: {0}")]
  Recovery(#[from] RecoveryError),

  #[error(transparent)]
  Chain(#[from] ChainError),
}

/// Why an epoch's message loop returned.
enum EpochEnd {
  /// The epoch consumed its time budget (or a timeout quorum
  /// advanced the epoch counter).
  Expired,
  /// USIG variant: the current epoch's block reached its quorum,
  /// the next epoch may start immediately.
  Quorum,
}

/// The per-replica Streamlet protocol engine.
///
/// Drives the epoch loop: sample the leader, propose when it is
/// this replica's turn, then consume messages until the epoch
/// budget runs out. The engine owns the blockchain and is the only
/// writer to it; the transport task only delivers typed messages
/// through a bounded queue.
pub struct Streamlet {
  id: ReplicaId,
  config: Config,
  comms: Communication,
  inbox: mpsc::Receiver<Message>,
  batches: mpsc::Receiver<Vec<Transaction>>,

  chain: Blockchain,
  schedule: LeaderSchedule,
  epoch: u64,

  /// Replica signing key (classical variant).
  keypair: Keypair,
  /// Trusted counter-signer (USIG variant).
  usig: Option<Usig>,
  /// Verification keys collected during PK_EXCHANGE, one per
  /// replica, immutable afterwards.
  keys: HashMap<ReplicaId, Pubkey>,
  /// Per-issuer counter ordering (USIG variant).
  counters: Option<CounterTracker<Message>>,

  /// Messages drained from the inbox during key exchange; they
  /// re-enter the loop as if freshly received.
  pregate: VecDeque<Message>,
  /// Admissible messages waiting for their epoch, or votes
  /// waiting for their block.
  early: VecDeque<Message>,
  /// Collected TIMEOUT records (USIG variant).
  timeouts: Vec<(ReplicaId, u64)>,
  /// Whether the current epoch hit its local timeout already.
  timed_out: bool,

  log: FinalizedLog,
  bench: Benchmark,
}

impl Streamlet {
  pub fn new(
    id: ReplicaId,
    config: Config,
    comms: Communication,
    inbox: mpsc::Receiver<Message>,
    batches: mpsc::Receiver<Vec<Transaction>>,
    log: FinalizedLog,
  ) -> Self {
    let schedule =
      LeaderSchedule::new(config.topology.seed, config.replica_count() as u64);
    let usig = match config.variant {
      Variant::Usig => Some(Usig::new()),
      Variant::Classical => None,
    };
    let counters = match config.variant {
      Variant::Usig => Some(CounterTracker::new(
        config.peers_of(id).into_iter(),
      )),
      Variant::Classical => None,
    };
    let bench =
      Benchmark::new(config.benchmark_threshold, config.benchmark_total);
    Self {
      id,
      comms,
      inbox,
      batches,
      chain: Blockchain::new(),
      schedule,
      epoch: 0,
      keypair: Keypair::unique(),
      usig,
      keys: HashMap::new(),
      counters,
      pregate: VecDeque::new(),
      early: VecDeque::new(),
      timeouts: vec![],
      timed_out: false,
      log,
      bench,
      config,
    }
  }

  /// Runs the replica forever: key exchange once, then the epoch
  /// loop. Only transport loss is fatal.
  pub async fn run(&mut self) -> Result<(), EngineError> {
    self.exchange_keys().await?;
    info!(
      "replica {} entering the epoch loop ({:?} variant, f = {})",
      self.id, self.config.variant, self.config.topology.faults
    );

    loop {
      let started = Instant::now();
      self.epoch += 1;
      self.timed_out = false;
      let leader = self.schedule.advance();
      debug!("epoch {} begins, leader is replica {leader}", self.epoch);

      if leader == self.id {
        if let Err(e) = self.propose() {
          warn!("failed to propose in epoch {}: {e}", self.epoch);
        }
      }

      match self.process_messages(started).await? {
        EpochEnd::Expired => {
          debug!("epoch {} reached its end", self.epoch)
        }
        EpochEnd::Quorum => {
          debug!("epoch {} notarized before its deadline", self.epoch)
        }
      }
      debug!(
        "blockchain height {} with {} finalized blocks",
        self.chain.latest_epoch(),
        self.chain.finalized_count()
      );

      // classical epochs are strictly clocked: pad an epoch that
      // ended early (e.g. on an error) to its full duration
      if self.config.variant == Variant::Classical {
        let elapsed = started.elapsed();
        let budget = self.config.topology.epoch_duration;
        if elapsed < budget {
          tokio::time::sleep(budget - elapsed).await;
        }
      }
    }
  }

  /// Broadcasts this replica's verification key until keys for the
  /// whole peer set are known. The protocol never starts on a
  /// partial key table.
  async fn exchange_keys(&mut self) -> Result<(), EngineError> {
    let key = match &self.usig {
      Some(usig) => usig.public_key(),
      None => self.keypair.public(),
    };
    self.keys.insert(self.id, key.clone());
    let announce = Message::PkExchange {
      sender: self.id,
      key,
    };

    let total = self.config.replica_count();
    info!("exchanging public keys with {} peers", total - 1);
    let mut tick = tokio::time::interval(KEY_EXCHANGE_INTERVAL);
    while self.keys.len() < total {
      tokio::select! {
        _ = tick.tick() => self.comms.broadcast(&announce),
        received = self.inbox.recv() => match received {
          Some(Message::PkExchange { sender, key }) => {
            self.keys.entry(sender).or_insert(key);
          }
          Some(other) => self.pregate.push_back(other),
          None => return Err(EngineError::InboxClosed),
        }
      }
    }
    info!("public keys from all replicas retrieved successfully");
    Ok(())
  }

  /// Builds and broadcasts this epoch's proposal, extending the
  /// freshest notarized chain. The leader's own vote is recorded
  /// locally before the broadcast so quorum counting is uniform
  /// for every deployment size.
  fn propose(&mut self) -> Result<(), ProtocolError> {
    let (tip_epoch, tip_hash, certificate) = {
      let tip = self.chain.freshest_notarized();
      let certificate = if self.epoch > 1 {
        Some(Certificate::for_block(tip))
      } else {
        None
      };
      (tip.epoch, tip.hash(), certificate)
    };

    let transactions = self.batches.try_recv().unwrap_or_default();
    let mut block = Block::new(
      self.epoch,
      transactions,
      Some(tip_hash),
      Some(tip_epoch),
    );
    info!("proposing {} extending epoch {tip_epoch}", block);

    let (message, own_vote) = match self.config.variant {
      Variant::Classical => {
        let signature = self.keypair.sign(block.hash().as_bytes());
        block.signature = Some(signature);
        let message = Message::Propose {
          sender: self.id,
          block: BlockInfo::from_block(&block),
          certificate,
          ui: None,
        };
        let vote = Vote {
          voter: self.id,
          epoch: self.epoch,
          digest: block.hash(),
          endorsement: Endorsement::Signature(signature),
        };
        (message, vote)
      }
      Variant::Usig => {
        let mut message = Message::Propose {
          sender: self.id,
          block: BlockInfo::from_block(&block),
          certificate,
          ui: None,
        };
        let digest = message.digest();
        let usig = self
          .usig
          .as_mut()
          .expect("the USIG variant always holds a USIG");
        let ui = usig.create_ui(self.epoch, &digest);
        if let Message::Propose { ui: slot, .. } = &mut message {
          *slot = Some(ui.clone());
        }
        let vote = Vote {
          voter: self.id,
          epoch: self.epoch,
          digest,
          endorsement: Endorsement::Ui(ui),
        };
        (message, vote)
      }
    };

    block.add_vote(own_vote);
    self.chain.add_block(block)?;
    self.try_notarize(self.epoch);
    self.comms.broadcast(&message);
    Ok(())
  }

  /// Consumes messages until the epoch budget expires or, in the
  /// USIG variant, the current epoch's block gathers its quorum.
  async fn process_messages(
    &mut self,
    started: Instant,
  ) -> Result<EpochEnd, EngineError> {
    let full = self.config.topology.epoch_duration;
    let mut deadline = started
      + match self.config.variant {
        Variant::Classical => full,
        // wait only until the δ mark for a proposal to show up
        Variant::Usig => full / 2,
      };

    loop {
      // a proposal for the current epoch extends the budget to the
      // full epoch duration (USIG variant)
      if self.config.variant == Variant::Usig
        && !self.timed_out
        && self.chain.get(self.epoch).is_some()
      {
        deadline = started + full;
      }

      let message = match self.next_message(deadline).await? {
        Some(message) => message,
        None => {
          // deadline passed without a message
          match self.config.variant {
            Variant::Classical => return Ok(EpochEnd::Expired),
            Variant::Usig => {
              if !self.timed_out {
                self.timed_out = true;
                if let Some(target) = self.broadcast_timeout() {
                  self.advance_past(target);
                  return Ok(EpochEnd::Expired);
                }
              }
              continue;
            }
          }
        }
      };

      let message = match self.admit(message) {
        Some(message) => message,
        None => continue,
      };

      // votes whose block has not arrived yet wait alongside the
      // early-epoch messages
      if let Message::Vote { epoch, .. } = &message {
        if self.chain.get(*epoch).is_none() {
          let sender = message.sender();
          if let Some(counters) = self.counters.as_mut() {
            counters.rollback(sender);
          }
          debug!("vote for epoch {epoch} arrived before its block");
          self.early.push_back(message);
          continue;
        }
      }

      let message_digest = message.digest();
      match message {
        Message::PkExchange { sender, .. } => {
          debug!("late key exchange from replica {sender} ignored");
        }
        Message::Propose {
          sender,
          block,
          certificate,
          ui,
        } => {
          if let Err(e) = self
            .handle_propose(sender, block, certificate, ui, message_digest)
            .await
          {
            warn!("dropping proposal from replica {sender}: {e}");
          }
        }
        Message::Vote {
          sender,
          epoch,
          endorsement,
          ..
        } => {
          if let Err(e) =
            self.handle_vote(sender, epoch, endorsement, message_digest)
          {
            warn!("dropping vote from replica {sender}: {e}");
          }
        }
        Message::Timeout { sender, epoch, .. } => {
          if let Some(target) = self.observe_timeout(sender, epoch) {
            self.advance_past(target);
            return Ok(EpochEnd::Expired);
          }
        }
        Message::RecoveryRequest { sender, epoch } => {
          self.handle_recovery_request(sender, epoch);
        }
        Message::RecoveryReply { sender, .. } => {
          debug!("stray recovery reply from replica {sender} ignored");
        }
      }

      if self.config.variant == Variant::Usig {
        let notarized = self
          .chain
          .get(self.epoch)
          .map(|block| block.is_notarized())
          .unwrap_or(false);
        if notarized {
          return Ok(EpochEnd::Quorum);
        }
      }
    }
  }

  /// Next message to run through admission: buffered ones first,
  /// then the inbox with the remaining time budget. `Ok(None)`
  /// means the deadline passed.
  async fn next_message(
    &mut self,
    deadline: Instant,
  ) -> Result<Option<Message>, EngineError> {
    if let Some(message) = self.next_buffered() {
      return Ok(Some(message));
    }
    if let Some(message) = self.pregate.pop_front() {
      return Ok(Some(message));
    }
    if let Some(message) =
      self.counters.as_mut().and_then(|counters| counters.pop_ready())
    {
      return Ok(Some(message));
    }

    if Instant::now() >= deadline {
      // USIG after a local timeout: wait for the timeout quorum
      // with no further deadline
      if self.config.variant == Variant::Usig && self.timed_out {
        return match self.inbox.recv().await {
          Some(message) => Ok(Some(message)),
          None => Err(EngineError::InboxClosed),
        };
      }
      return Ok(None);
    }
    match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
      Ok(Some(message)) => Ok(Some(message)),
      Ok(None) => Err(EngineError::InboxClosed),
      Err(_) => Ok(None),
    }
  }

  /// Pops an early message that became processable: its epoch is
  /// current (or past), and for votes the voted block exists.
  fn next_buffered(&mut self) -> Option<Message> {
    let current = self.epoch;
    let position = self.early.iter().position(|message| {
      match message.epoch() {
        Some(epoch) if epoch <= current => match message {
          Message::Vote { epoch, .. } => self.chain.get(*epoch).is_some(),
          _ => true,
        },
        _ => false,
      }
    })?;
    self.early.remove(position)
  }

  /// Admission control for one message: USIG counter order and
  /// identifier verification, then epoch buffering. Returns the
  /// message when it may be dispatched now.
  fn admit(&mut self, message: Message) -> Option<Message> {
    let sender = message.sender();

    if let (Some(ui), Some(epoch)) =
      (message.ui().cloned(), message.epoch())
    {
      let counters = match self.counters.as_mut() {
        Some(counters) => counters,
        // structural validation guarantees classical messages
        // carry no UI
        None => return Some(message),
      };
      if !counters.is_next(sender, ui.counter) {
        debug!(
          "parking message from replica {sender} with counter {}",
          ui.counter
        );
        counters.park(sender, ui.counter, message);
        return None;
      }
      counters.advance(sender);

      let digest = message.digest();
      let verified = self
        .keys
        .get(&sender)
        .map(|key| ui.verify(key, epoch, &digest))
        .unwrap_or(false);
      if !verified {
        warn!("invalid UI from replica {sender}, dropping message");
        return None;
      }
    }

    if let Some(epoch) = message.epoch() {
      let is_timeout = matches!(message, Message::Timeout { .. });
      if epoch > self.epoch && !is_timeout {
        // not consumed: the counter expectation rolls back so the
        // issuer's stream replays in order when the epoch arrives
        if let Some(counters) = self.counters.as_mut() {
          counters.rollback(sender);
        }
        debug!("buffering early message for epoch {epoch}");
        self.early.push_back(message);
        return None;
      }
    }

    Some(message)
  }

  /// Validates and installs a proposal, recovering missing chain
  /// state if its certificate proves the replica is behind, and
  /// votes for it when it belongs to the current epoch.
  async fn handle_propose(
    &mut self,
    sender: ReplicaId,
    info: BlockInfo,
    certificate: Option<Certificate>,
    ui: Option<Ui>,
    message_digest: Digest,
  ) -> Result<(), ProtocolError> {
    let epoch = info.epoch;
    if self.schedule.leader_of(epoch) != Some(sender) {
      return Err(ProtocolError::NotLeader { sender, epoch });
    }
    if self.chain.get(epoch).is_some() {
      debug!("duplicate proposal for epoch {epoch} ignored");
      return Ok(());
    }

    let (mut tip_epoch, mut tip_hash) = {
      let tip = self.chain.freshest_notarized();
      (tip.epoch, tip.hash())
    };

    if epoch > 1 {
      let certificate =
        certificate.ok_or(ProtocolError::MissingCertificate(epoch))?;
      if !certificate.verify(&self.keys, self.config.quorum()) {
        return Err(ProtocolError::InvalidCertificate);
      }
      let extends_tip = certificate.extends(self.chain.freshest_notarized());
      if !extends_tip {
        if certificate.epoch > tip_epoch {
          // the certificate proves a fresher notarized block
          // exists; fetch it (and any missing ancestors) before
          // judging the proposal
          self.recover(certificate.epoch).await?;
          let tip = self.chain.freshest_notarized();
          tip_epoch = tip.epoch;
          tip_hash = tip.hash();
        } else {
          return Err(ProtocolError::StaleCertificate);
        }
      }
    }

    if info.parent != Some(tip_hash) || info.parent_epoch != Some(tip_epoch)
    {
      return Err(ProtocolError::DoesNotExtend);
    }

    let mut block = info.into_block();
    let leader_vote = match self.config.variant {
      Variant::Classical => {
        let key = self
          .keys
          .get(&sender)
          .ok_or(ProtocolError::BadEndorsement)?;
        if !block.verify_signature(key) {
          return Err(ProtocolError::BadEndorsement);
        }
        let signature = match block.signature {
          Some(signature) => signature,
          None => return Err(ProtocolError::BadEndorsement),
        };
        Vote {
          voter: sender,
          epoch,
          digest: block.hash(),
          endorsement: Endorsement::Signature(signature),
        }
      }
      Variant::Usig => {
        // the UI was already verified at admission; it doubles as
        // the leader's own vote on the proposal
        let ui = ui.ok_or(ProtocolError::BadEndorsement)?;
        Vote {
          voter: sender,
          epoch,
          digest: message_digest,
          endorsement: Endorsement::Ui(ui),
        }
      }
    };

    block.add_vote(leader_vote);
    info!("accepted proposal {} from replica {sender}", block);
    self.chain.add_block(block)?;
    self.try_notarize(epoch);

    if epoch == self.epoch && !self.timed_out {
      self.cast_vote(epoch);
    }
    Ok(())
  }

  /// Counts one vote for the block stored at `epoch`, then checks
  /// the quorum.
  fn handle_vote(
    &mut self,
    sender: ReplicaId,
    epoch: u64,
    endorsement: Endorsement,
    message_digest: Digest,
  ) -> Result<(), ProtocolError> {
    let (block_hash, already_voted) = match self.chain.get(epoch) {
      Some(block) => (block.hash(), block.has_vote(sender)),
      None => return Ok(()), // buffered upstream
    };
    if already_voted {
      return Ok(());
    }

    let vote = match (self.config.variant, endorsement) {
      (Variant::Classical, Endorsement::Signature(signature)) => {
        let key = self
          .keys
          .get(&sender)
          .ok_or(ProtocolError::BadEndorsement)?;
        if !key.verify(block_hash.as_bytes(), &signature) {
          return Err(ProtocolError::BadEndorsement);
        }
        Vote {
          voter: sender,
          epoch,
          digest: block_hash,
          endorsement: Endorsement::Signature(signature),
        }
      }
      // the UI was verified at admission
      (Variant::Usig, Endorsement::Ui(ui)) => Vote {
        voter: sender,
        epoch,
        digest: message_digest,
        endorsement: Endorsement::Ui(ui),
      },
      _ => return Err(ProtocolError::BadEndorsement),
    };

    if let Some(block) = self.chain.get_mut(epoch) {
      if block.add_vote(vote) {
        debug!("new vote from replica {sender} for epoch {epoch}");
      }
    }
    self.try_notarize(epoch);
    Ok(())
  }

  /// Notarizes the block at `epoch` once it holds a quorum, then
  /// runs the finalization rule. Finalization is evaluated after
  /// every notarization, not only at epoch boundaries.
  fn try_notarize(&mut self, epoch: u64) {
    let quorum = self.config.quorum();
    let reached = match self.chain.get(epoch) {
      Some(block) => {
        block.status() == BlockStatus::Proposed
          && block.vote_count() >= quorum
      }
      None => false,
    };
    if !reached {
      return;
    }
    if let Some(block) = self.chain.get_mut(epoch) {
      block.notarize();
    }
    info!("block of epoch {epoch} was notarized");

    let window = self.config.variant.finalization_window();
    let newly = self.chain.finalize(window);
    if newly.is_empty() {
      return;
    }
    info!("blocks of epochs {newly:?} were finalized");
    for finalized in newly {
      if finalized == 0 {
        continue; // genesis is implicit in the durable log
      }
      let block = match self.chain.get(finalized) {
        Some(block) => block,
        None => continue,
      };
      let transactions = block.transactions.len() as u64;
      if let Err(e) = self.log.append(block) {
        error!("failed to persist finalized block {finalized}: {e}");
      }
      self.bench.record(transactions);
    }
  }

  /// Signs and broadcasts this replica's vote on the proposal of
  /// `epoch`, recording the vote locally first.
  fn cast_vote(&mut self, epoch: u64) {
    let (block_hash, parent) = match self.chain.get(epoch) {
      Some(block) => (block.hash(), block.parent),
      None => return,
    };

    let (message, own_vote) = match self.config.variant {
      Variant::Classical => {
        let signature = self.keypair.sign(block_hash.as_bytes());
        let message = Message::Vote {
          sender: self.id,
          epoch,
          parent,
          endorsement: Endorsement::Signature(signature),
        };
        let vote = Vote {
          voter: self.id,
          epoch,
          digest: block_hash,
          endorsement: Endorsement::Signature(signature),
        };
        (message, vote)
      }
      Variant::Usig => {
        let digest = Message::vote_digest(self.id, epoch, &parent);
        let usig = self
          .usig
          .as_mut()
          .expect("the USIG variant always holds a USIG");
        let ui = usig.create_ui(epoch, &digest);
        let message = Message::Vote {
          sender: self.id,
          epoch,
          parent,
          endorsement: Endorsement::Ui(ui.clone()),
        };
        let vote = Vote {
          voter: self.id,
          epoch,
          digest,
          endorsement: Endorsement::Ui(ui),
        };
        (message, vote)
      }
    };

    if let Some(block) = self.chain.get_mut(epoch) {
      block.add_vote(own_vote);
    }
    debug!("voting for the proposal of epoch {epoch}");
    self.comms.broadcast(&message);
    self.try_notarize(epoch);
  }

  /// Announces that this replica saw the current epoch expire.
  /// Returns an epoch to advance past when this replica's own
  /// record already completes the timeout quorum (f = 0).
  fn broadcast_timeout(&mut self) -> Option<u64> {
    let next = self.epoch + 1;
    info!("epoch {} timed out, proposing a move to {next}", self.epoch);

    let digest = Message::timeout_digest(self.id, next);
    let usig = self
      .usig
      .as_mut()
      .expect("timeouts exist only in the USIG variant");
    let ui = usig.create_ui(next, &digest);
    let message = Message::Timeout {
      sender: self.id,
      epoch: next,
      ui,
    };
    self.comms.broadcast(&message);
    self.observe_timeout(self.id, next)
  }

  /// Records one TIMEOUT and reports the target epoch once f+1
  /// distinct replicas asked to skip to it.
  fn observe_timeout(
    &mut self,
    sender: ReplicaId,
    epoch: u64,
  ) -> Option<u64> {
    if epoch <= self.epoch {
      return None;
    }
    let duplicate = self
      .timeouts
      .iter()
      .any(|&(recorded, e)| recorded == sender && e == epoch);
    if duplicate {
      return None;
    }
    self.timeouts.push((sender, epoch));
    let count = self
      .timeouts
      .iter()
      .filter(|&&(_, e)| e == epoch)
      .count();
    (count >= self.config.topology.faults + 1).then(|| epoch)
  }

  /// Applies a timeout quorum for `target`: consumes the schedule
  /// samples of the skipped epochs so every replica keeps deriving
  /// the same leaders, then positions the epoch counter so the run
  /// loop enters `target` next.
  fn advance_past(&mut self, target: u64) {
    info!("timeout consensus reached, advancing to epoch {target}");
    let skipped = target - self.epoch - 1;
    self.schedule.skip(skipped);
    self.epoch = target - 1;
    self.timeouts.retain(|&(_, epoch)| epoch > target);
  }

  /// Backfills the chain up from a certified epoch this replica
  /// has never seen.
  async fn recover(&mut self, target: u64) -> Result<(), RecoveryError> {
    let listen_addr = self
      .config
      .recovery_addr_of(self.id)
      .expect("own replica id was validated against the topology");
    let client = Recovery {
      id: self.id,
      variant: self.config.variant,
      comms: &self.comms,
      keys: &self.keys,
      peers: self.config.peers_of(self.id),
      quorum: self.config.quorum(),
      listen_addr,
    };
    client.recover(&mut self.chain, target).await
  }

  /// Serves a peer's recovery request from a transient task so the
  /// consensus loop stays responsive. A request for a block this
  /// replica lacks dies silently.
  fn handle_recovery_request(&self, sender: ReplicaId, epoch: u64) {
    let block = match self.chain.get(epoch) {
      Some(block) => block,
      None => {
        debug!("no block at epoch {epoch} to serve to replica {sender}");
        return;
      }
    };
    let addr = match self.config.recovery_addr_of(sender) {
      Some(addr) => addr,
      None => return,
    };
    let reply = Message::RecoveryReply {
      sender: self.id,
      block: BlockInfo::from_block(block),
      votes: block.votes().cloned().collect(),
    };
    debug!("serving recovery of epoch {epoch} to replica {sender}");
    recovery::spawn_reply(reply, addr);
  }
}

/// Finalized-transaction bookkeeping: opens a measurement window
/// at `threshold` finalized transactions and reports throughput at
/// `total`.
struct Benchmark {
  threshold: u64,
  total: u64,
  finalized: u64,
  started: Option<Instant>,
  reported: bool,
}

impl Benchmark {
  fn new(threshold: u64, total: u64) -> Self {
    Self {
      threshold,
      total,
      finalized: 0,
      started: None,
      reported: false,
    }
  }

  fn record(&mut self, transactions: u64) {
    if transactions == 0 || self.reported {
      return;
    }
    self.finalized += transactions;
    if self.started.is_none() && self.finalized >= self.threshold {
      self.started = Some(Instant::now());
      info!(
        "benchmark window opened at {} finalized transactions",
        self.finalized
      );
    }
    if self.finalized >= self.total {
      if let Some(started) = self.started {
        let elapsed = started.elapsed();
        let measured = self.finalized - self.threshold;
        info!(
          "benchmark: {measured} transactions finalized in {elapsed:?} \
           ({:.0} tx/s)",
          measured as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
        );
        self.reported = true;
      }
    }
  }
}
