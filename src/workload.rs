use {
  crate::config::Config,
  rand::Rng,
  serde::{Deserialize, Serialize},
  tokio::sync::mpsc,
  tracing::debug,
};

/// One opaque client transaction. The consensus core never looks
/// inside the payload; it only orders and finalizes batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
  pub seq: u64,
  pub nonce: u32,
  pub payload: Vec<u8>,
}

impl Transaction {
  /// Canonical encoding used when hashing the enclosing block:
  /// big-endian sequence number and nonce, then the length-prefixed
  /// payload bytes.
  pub fn canonical_bytes(&self, out: &mut Vec<u8>) {
    out.extend_from_slice(&self.seq.to_be_bytes());
    out.extend_from_slice(&self.nonce.to_be_bytes());
    out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&self.payload);
  }
}

/// Spawns the synthetic transaction generator.
///
/// Batches of `transaction_number` transactions with
/// `transaction_size` byte payloads are pushed into a bounded
/// queue. The proposer drains at most one batch per proposal, so
/// backpressure from a slow consensus loop simply pauses the
/// generator.
pub fn generate(config: &Config) -> mpsc::Receiver<Vec<Transaction>> {
  let (tx, rx) = mpsc::channel(10);
  let size = config.transaction_size;
  let number = config.transaction_number;

  tokio::spawn(async move {
    let mut next = 0u64;
    loop {
      let batch: Vec<Transaction> = {
        let mut rng = rand::thread_rng();
        (0..number)
          .map(|i| Transaction {
            seq: next + i as u64,
            nonce: rng.gen_range(0..100),
            payload: vec![0u8; size],
          })
          .collect()
      };
      next += number as u64;
      if tx.send(batch).await.is_err() {
        debug!("transaction consumer dropped, stopping generator");
        break;
      }
    }
  });

  rx
}

#[cfg(test)]
mod test {
  use super::Transaction;

  #[test]
  fn canonical_bytes_are_pinned() {
    let tx = Transaction {
      seq: 7,
      nonce: 42,
      payload: vec![0xaa, 0xbb],
    };
    let mut bytes = Vec::new();
    tx.canonical_bytes(&mut bytes);
    assert_eq!(bytes, vec![
      0, 0, 0, 0, 0, 0, 0, 7, // seq
      0, 0, 0, 42, // nonce
      0, 0, 0, 2, // payload length
      0xaa, 0xbb, // payload
    ]);
  }
}
