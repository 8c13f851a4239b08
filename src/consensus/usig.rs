use {
  crate::primitives::{Digest, Keypair, Pubkey, ReplicaId},
  ed25519_dalek::Signature,
  serde::{Deserialize, Serialize},
  std::collections::{BTreeMap, HashMap},
};

/// A unique identifier issued by the trusted signer: a counter
/// value bound to a message by a signature over
/// `(epoch, message digest, counter)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ui {
  pub counter: u64,
  pub signature: Signature,
}

impl Ui {
  pub fn verify(&self, key: &Pubkey, epoch: u64, digest: &Digest) -> bool {
    key.verify(&binding(epoch, digest, self.counter), &self.signature)
  }

  /// Whether this identifier is the immediate successor of the
  /// last counter accepted from its issuer.
  pub fn is_next(&self, last: u64) -> bool {
    self.counter == last + 1
  }
}

/// The Unique Sequential Identifier Generator.
///
/// Owns a strictly monotonic counter and its own keypair, distinct
/// from the replica identity. It is the only component the USIG
/// variant assumes non-Byzantine: a compromised replica can still
/// not produce two different messages with the same counter, which
/// is what permits the reduced 2f+1 replica set.
pub struct Usig {
  counter: u64,
  keypair: Keypair,
}

impl Usig {
  pub fn new() -> Self {
    Self {
      counter: 0,
      keypair: Keypair::unique(),
    }
  }

  /// Issues the next identifier for a message. Counters start at 1
  /// and are contiguous; the caller must bind every outgoing
  /// message exactly once.
  pub fn create_ui(&mut self, epoch: u64, digest: &Digest) -> Ui {
    self.counter += 1;
    Ui {
      counter: self.counter,
      signature: self.keypair.sign(&binding(epoch, digest, self.counter)),
    }
  }

  pub fn public_key(&self) -> Pubkey {
    self.keypair.public()
  }
}

impl Default for Usig {
  fn default() -> Self {
    Self::new()
  }
}

/// The signed binding: big-endian epoch, the 32 digest bytes, then
/// the big-endian counter.
fn binding(epoch: u64, digest: &Digest, counter: u64) -> [u8; 48] {
  let mut out = [0u8; 48];
  out[..8].copy_from_slice(&epoch.to_be_bytes());
  out[8..40].copy_from_slice(digest.as_bytes());
  out[40..].copy_from_slice(&counter.to_be_bytes());
  out
}

/// Per-peer counter bookkeeping on the receiving side.
///
/// A message is admitted only when its counter is exactly one past
/// the last admitted counter from the same issuer. Messages that
/// arrive ahead of the expected counter are parked, keyed by
/// counter, and replayed once the gap closes. A counter that skips
/// ahead therefore never takes effect out of order; if the gap is
/// never filled, the parked message is never applied.
pub struct CounterTracker<T> {
  last: HashMap<ReplicaId, u64>,
  parked: HashMap<ReplicaId, BTreeMap<u64, T>>,
}

impl<T> CounterTracker<T> {
  pub fn new(peers: impl Iterator<Item = ReplicaId>) -> Self {
    Self {
      last: peers.map(|id| (id, 0)).collect(),
      parked: HashMap::new(),
    }
  }

  pub fn is_next(&self, issuer: ReplicaId, counter: u64) -> bool {
    match self.last.get(&issuer) {
      Some(&last) => counter == last + 1,
      None => false,
    }
  }

  /// Marks `counter` as consumed for `issuer`. Call only after
  /// `is_next` returned true.
  pub fn advance(&mut self, issuer: ReplicaId) {
    if let Some(last) = self.last.get_mut(&issuer) {
      *last += 1;
    }
  }

  /// Reverts the last `advance` for `issuer`. Used when a message
  /// was admitted in counter order but must wait for its epoch.
  pub fn rollback(&mut self, issuer: ReplicaId) {
    if let Some(last) = self.last.get_mut(&issuer) {
      *last = last.saturating_sub(1);
    }
  }

  pub fn park(&mut self, issuer: ReplicaId, counter: u64, message: T) {
    self
      .parked
      .entry(issuer)
      .or_insert_with(BTreeMap::new)
      .insert(counter, message);
  }

  /// Pops one parked message that became the expected next counter
  /// for its issuer, if any. The caller runs it through the normal
  /// admission path again.
  pub fn pop_ready(&mut self) -> Option<T> {
    let ready = self.parked.iter().find_map(|(&issuer, queue)| {
      let expected = self.last.get(&issuer).copied()? + 1;
      queue.contains_key(&expected).then(|| (issuer, expected))
    });
    let (issuer, counter) = ready?;
    let queue = self.parked.get_mut(&issuer)?;
    let message = queue.remove(&counter);
    if queue.is_empty() {
      self.parked.remove(&issuer);
    }
    message
  }
}

#[cfg(test)]
mod test {
  use {
    super::{CounterTracker, Usig},
    crate::primitives::Digest,
  };

  #[test]
  fn ui_counters_are_contiguous() {
    let mut usig = Usig::new();
    let digest = Digest::compute(b"m");
    for expected in 1..=5u64 {
      let ui = usig.create_ui(1, &digest);
      assert_eq!(ui.counter, expected);
    }
  }

  #[test]
  fn ui_binds_epoch_digest_and_counter() {
    let mut usig = Usig::new();
    let digest = Digest::compute(b"m");
    let ui = usig.create_ui(3, &digest);

    assert!(ui.verify(&usig.public_key(), 3, &digest));
    assert!(!ui.verify(&usig.public_key(), 4, &digest));
    assert!(!ui.verify(&usig.public_key(), 3, &Digest::compute(b"other")));

    let mut forged = ui.clone();
    forged.counter += 1;
    assert!(!forged.verify(&usig.public_key(), 3, &digest));
  }

  #[test]
  fn distinct_messages_never_share_a_counter() {
    let mut usig = Usig::new();
    let a = usig.create_ui(1, &Digest::compute(b"a"));
    let b = usig.create_ui(1, &Digest::compute(b"b"));
    assert_ne!(a.counter, b.counter);
  }

  #[test]
  fn tracker_admits_in_order() {
    let mut tracker: CounterTracker<&str> = CounterTracker::new(0..2);
    assert!(tracker.is_next(0, 1));
    tracker.advance(0);
    assert!(!tracker.is_next(0, 1));
    assert!(tracker.is_next(0, 2));
  }

  #[test]
  fn skipped_counter_stays_parked() {
    // a message whose counter skips ahead must never be applied
    // until the gap is filled
    let mut tracker: CounterTracker<&str> = CounterTracker::new(0..2);
    tracker.advance(1); // counter 1 consumed

    assert!(!tracker.is_next(1, 3));
    tracker.park(1, 3, "skipped");
    assert!(tracker.pop_ready().is_none());

    // the gap closes: counter 2 arrives and is consumed
    assert!(tracker.is_next(1, 2));
    tracker.advance(1);
    assert_eq!(tracker.pop_ready(), Some("skipped"));
    assert!(tracker.pop_ready().is_none());
  }

  #[test]
  fn rollback_restores_expectation() {
    let mut tracker: CounterTracker<&str> = CounterTracker::new(0..1);
    tracker.advance(0);
    tracker.rollback(0);
    assert!(tracker.is_next(0, 1));
  }

  #[test]
  fn unknown_issuer_is_rejected() {
    let tracker: CounterTracker<&str> = CounterTracker::new(0..2);
    assert!(!tracker.is_next(9, 1));
  }
}
