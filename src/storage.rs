use {
  crate::{consensus::Block, primitives::ReplicaId, workload::Transaction},
  serde::{Deserialize, Serialize},
  std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
  },
  thiserror::Error,
  tracing::debug,
};

/// One durable record per finalized block. The log is the only
/// state a replica persists; everything else is rebuilt from the
/// protocol on restart.
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalizedRecord {
  pub epoch: u64,
  pub parent_hash: String,
  pub transactions: Vec<Transaction>,
}

#[derive(Debug, Error)]
pub enum StorageError {
  #[error("io error on finalized log: {0}")]
  Io(#[from] std::io::Error),

  #[error("failed to encode finalized record: {0}")]
  Encode(#[from] serde_json::Error),

  #[error(
    "finalized log must grow in epoch order: got {epoch} after {last}"
  )]
  OutOfOrder { epoch: u64, last: u64 },
}

/// Append-only log of finalized blocks, one JSON record per line,
/// written in strict epoch-ascending order.
pub struct FinalizedLog {
  path: PathBuf,
  file: File,
  last_epoch: Option<u64>,
}

impl FinalizedLog {
  pub fn open(
    data_dir: &Path,
    replica_id: ReplicaId,
  ) -> Result<Self, StorageError> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(format!("finalized-{replica_id}.log"));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Self {
      path,
      file,
      last_epoch: None,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Appends one finalized block. Rejects out-of-order epochs so a
  /// chain-level bug can never silently corrupt the durable log.
  pub fn append(&mut self, block: &Block) -> Result<(), StorageError> {
    if let Some(last) = self.last_epoch {
      if block.epoch <= last {
        return Err(StorageError::OutOfOrder {
          epoch: block.epoch,
          last,
        });
      }
    }
    let record = FinalizedRecord {
      epoch: block.epoch,
      parent_hash: block
        .parent
        .map(|digest| digest.to_hex())
        .unwrap_or_default(),
      transactions: block.transactions.clone(),
    };
    let line = serde_json::to_string(&record)?;
    writeln!(self.file, "{line}")?;
    self.file.flush()?;
    self.last_epoch = Some(block.epoch);
    debug!("appended finalized block {} to {:?}", block.epoch, self.path);
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use {
    super::{FinalizedLog, FinalizedRecord, StorageError},
    crate::{consensus::Block, workload::Transaction},
    tempdir::TempDir,
  };

  fn block(epoch: u64, parent: &Block) -> Block {
    Block::new(
      epoch,
      vec![Transaction {
        seq: epoch,
        nonce: 0,
        payload: vec![0u8; 4],
      }],
      Some(parent.hash()),
      Some(parent.epoch),
    )
  }

  #[test]
  fn appends_json_records() {
    let dir = TempDir::new("finalized").unwrap();
    let mut log = FinalizedLog::open(dir.path(), 0).unwrap();

    let genesis = Block::genesis();
    let first = block(1, &genesis);
    let second = block(2, &first);
    log.append(&first).unwrap();
    log.append(&second).unwrap();

    let contents = std::fs::read_to_string(log.path()).unwrap();
    let records: Vec<FinalizedRecord> = contents
      .lines()
      .map(|line| serde_json::from_str(line).unwrap())
      .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].epoch, 1);
    assert_eq!(records[0].parent_hash, genesis.hash().to_hex());
    assert_eq!(records[1].epoch, 2);
    assert_eq!(records[1].transactions.len(), 1);
  }

  #[test]
  fn rejects_out_of_order_epochs() {
    let dir = TempDir::new("finalized").unwrap();
    let mut log = FinalizedLog::open(dir.path(), 0).unwrap();

    let genesis = Block::genesis();
    let first = block(3, &genesis);
    log.append(&first).unwrap();

    let stale = block(2, &genesis);
    let err = log.append(&stale).unwrap_err();
    assert!(matches!(err, StorageError::OutOfOrder { epoch: 2, last: 3 }));
  }

  #[test]
  fn first_block_parent_is_the_genesis_hash() {
    let genesis = Block::genesis();
    let first = block(1, &genesis);
    let dir = TempDir::new("finalized").unwrap();
    let mut log = FinalizedLog::open(dir.path(), 1).unwrap();
    log.append(&first).unwrap();

    let contents = std::fs::read_to_string(log.path()).unwrap();
    let record: FinalizedRecord =
      serde_json::from_str(contents.lines().next().unwrap()).unwrap();
    assert_eq!(record.parent_hash.len(), 64);
  }
}
