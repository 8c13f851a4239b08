use {
  crate::primitives::ReplicaId,
  rand::{Rng, SeedableRng},
  rand_chacha::ChaCha20Rng,
};

/// Deterministic leader schedule shared by all replicas.
///
/// The schedule is a seeded ChaCha20 stream sampled exactly once
/// per epoch, so every replica derives the same leader for the
/// same epoch number. Epochs skipped by the timeout sub-protocol
/// still consume their sample, which keeps replicas aligned no
/// matter which epochs they saw time out locally.
///
/// ```
/// let mut schedule = LeaderSchedule::new(0, 4);
/// let leader = schedule.advance(); // leader of epoch 1
/// assert_eq!(schedule.leader_of(1), Some(leader));
/// ```
#[derive(Debug)]
pub struct LeaderSchedule {
  rng: ChaCha20Rng,
  replicas: u64,
  leaders: Vec<ReplicaId>,
}

impl LeaderSchedule {
  pub fn new(seed: u64, replicas: u64) -> Self {
    Self {
      rng: ChaCha20Rng::seed_from_u64(seed),
      replicas,
      leaders: vec![],
    }
  }

  /// Samples and records the leader of the next epoch. The first
  /// call yields the leader of epoch 1; epoch 0 is genesis and has
  /// no leader.
  pub fn advance(&mut self) -> ReplicaId {
    let leader = self.rng.gen_range(0..self.replicas);
    self.leaders.push(leader);
    leader
  }

  /// Consumes samples for `count` skipped epochs, recording their
  /// leaders so that late proposals for those epochs can still be
  /// attributed.
  pub fn skip(&mut self, count: u64) {
    for _ in 0..count {
      self.advance();
    }
  }

  /// The recorded leader of `epoch`, if it was sampled already.
  pub fn leader_of(&self, epoch: u64) -> Option<ReplicaId> {
    if epoch == 0 {
      return None;
    }
    self.leaders.get(epoch as usize - 1).copied()
  }
}

#[cfg(test)]
mod test {
  use super::LeaderSchedule;

  #[test]
  fn same_seed_same_schedule() {
    let mut a = LeaderSchedule::new(42, 4);
    let mut b = LeaderSchedule::new(42, 4);
    for _ in 0..100 {
      assert_eq!(a.advance(), b.advance());
    }
  }

  #[test]
  fn different_seed_diverges() {
    let mut a = LeaderSchedule::new(1, 4);
    let mut b = LeaderSchedule::new(2, 4);
    let same = (0..100).all(|_| a.advance() == b.advance());
    assert!(!same);
  }

  #[test]
  fn leaders_stay_in_range() {
    let mut schedule = LeaderSchedule::new(7, 3);
    for _ in 0..100 {
      assert!(schedule.advance() < 3);
    }
  }

  #[test]
  fn skipping_preserves_alignment() {
    // a replica that skips epochs via the timeout sub-protocol
    // must stay aligned with one that advanced normally
    let mut skipping = LeaderSchedule::new(9, 4);
    let mut stepping = LeaderSchedule::new(9, 4);

    stepping.advance(); // epoch 1
    stepping.advance(); // epoch 2
    stepping.advance(); // epoch 3
    let epoch4 = stepping.advance();

    skipping.advance(); // epoch 1
    skipping.skip(2); // epochs 2 and 3 timed out
    assert_eq!(skipping.advance(), epoch4);
    assert_eq!(skipping.leader_of(4), Some(epoch4));
  }

  #[test]
  fn recorded_leaders_are_queryable() {
    let mut schedule = LeaderSchedule::new(3, 4);
    let first = schedule.advance();
    let second = schedule.advance();

    assert_eq!(schedule.leader_of(0), None);
    assert_eq!(schedule.leader_of(1), Some(first));
    assert_eq!(schedule.leader_of(2), Some(second));
    assert_eq!(schedule.leader_of(3), None);
  }
}
