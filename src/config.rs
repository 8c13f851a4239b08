use {
  crate::primitives::ReplicaId,
  clap::ArgEnum,
  serde::Deserialize,
  std::{
    collections::BTreeMap,
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
  },
  thiserror::Error,
};

/// Which deployment variant of the protocol this replica runs.
///
/// The variant decides the replica count, the vote quorum and the
/// finalization window. Every replica in a deployment must run the
/// same variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ArgEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
  /// Classical Streamlet: 3f+1 replicas, 2f+1 quorum, three
  /// consecutive notarized epochs finalize.
  Classical,
  /// USIG-augmented Streamlet: 2f+1 replicas, f+1 quorum, two
  /// consecutive notarized epochs finalize.
  Usig,
}

impl Variant {
  pub fn replica_count(&self, faults: usize) -> usize {
    match self {
      Variant::Classical => 3 * faults + 1,
      Variant::Usig => 2 * faults + 1,
    }
  }

  pub fn quorum(&self, faults: usize) -> usize {
    match self {
      Variant::Classical => 2 * faults + 1,
      Variant::Usig => faults + 1,
    }
  }

  /// How many consecutive-epoch notarized blocks must top the
  /// freshest chain before the prefix below the tip finalizes.
  pub fn finalization_window(&self) -> usize {
    match self {
      Variant::Classical => 3,
      Variant::Usig => 2,
    }
  }
}

/// The replica topology file: the full peer set plus the shared
/// protocol parameters. Every replica loads the same file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
  /// replica id -> main consensus listen address
  pub replicas: BTreeMap<ReplicaId, SocketAddr>,

  /// Duration of one epoch.
  #[serde(with = "humantime_serde", default = "default_epoch_duration")]
  pub epoch_duration: Duration,

  /// The fault bound f.
  #[serde(default = "default_faults")]
  pub faults: usize,

  /// Seed for the shared leader schedule.
  #[serde(default)]
  pub seed: u64,

  /// Base of the per-replica auxiliary recovery ports. Replica i
  /// listens for recovery replies on `recovery_base + i`.
  #[serde(default = "default_recovery_base")]
  pub recovery_base: u16,
}

fn default_epoch_duration() -> Duration {
  Duration::from_secs(1)
}

fn default_faults() -> usize {
  1
}

fn default_recovery_base() -> u16 {
  15000
}

/// Fully resolved replica configuration: topology file merged with
/// the environment tuning knobs.
#[derive(Debug, Clone)]
pub struct Config {
  pub variant: Variant,
  pub topology: Topology,
  pub data_dir: PathBuf,

  /// Bytes of opaque payload per generated transaction.
  pub transaction_size: usize,
  /// Transactions per proposed block.
  pub transaction_number: usize,

  /// Finalized-transaction count at which throughput measurement
  /// starts.
  pub benchmark_threshold: u64,
  /// Finalized-transaction count at which throughput is reported.
  pub benchmark_total: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read topology file: {0}")]
  Io(#[from] std::io::Error),

  #[error("failed to parse topology file: {0}")]
  Json(#[from] serde_json::Error),

  #[error("invalid value in environment variable {0}")]
  Env(&'static str),

  #[error(
    "{variant:?} with f = {faults} needs {expected} replicas, \
     topology lists {found}"
  )]
  ReplicaCount {
    variant: Variant,
    faults: usize,
    expected: usize,
    found: usize,
  },

  #[error("replica ids must be contiguous starting at 0")]
  NonContiguousIds,

  #[error("replica {0} is not part of the topology")]
  UnknownReplica(ReplicaId),
}

impl Config {
  /// Loads the topology file, applies environment overrides and
  /// validates the peer set against the selected variant.
  pub fn load(
    path: &Path,
    variant: Variant,
    replica_id: ReplicaId,
    data_dir: PathBuf,
  ) -> Result<Self, ConfigError> {
    let json = std::fs::read_to_string(path)?;
    let mut topology: Topology = serde_json::from_str(&json)?;

    if let Some(secs) = env_knob::<f64>("EPOCH_DURATION")? {
      topology.epoch_duration = Duration::from_secs_f64(secs);
    }
    if let Some(f) = env_knob::<usize>("FAULT_NUMBER")? {
      topology.faults = f;
    }

    let config = Config {
      variant,
      data_dir,
      transaction_size: env_knob("TRANSACTION_SIZE")?.unwrap_or(256),
      transaction_number: env_knob("TRANSACTION_NUMBER")?.unwrap_or(100),
      benchmark_threshold: env_knob("BENCHMARK_THRESHOLD")?.unwrap_or(1000),
      benchmark_total: env_knob("BENCHMARK_TOTAL")?.unwrap_or(10000),
      topology,
    };
    config.validate(replica_id)?;
    Ok(config)
  }

  fn validate(&self, replica_id: ReplicaId) -> Result<(), ConfigError> {
    let expected = self.variant.replica_count(self.topology.faults);
    let found = self.topology.replicas.len();
    if expected != found {
      return Err(ConfigError::ReplicaCount {
        variant: self.variant,
        faults: self.topology.faults,
        expected,
        found,
      });
    }
    let contiguous = self
      .topology
      .replicas
      .keys()
      .enumerate()
      .all(|(i, &id)| i as ReplicaId == id);
    if !contiguous {
      return Err(ConfigError::NonContiguousIds);
    }
    if !self.topology.replicas.contains_key(&replica_id) {
      return Err(ConfigError::UnknownReplica(replica_id));
    }
    Ok(())
  }

  pub fn quorum(&self) -> usize {
    self.variant.quorum(self.topology.faults)
  }

  pub fn replica_count(&self) -> usize {
    self.topology.replicas.len()
  }

  pub fn addr_of(&self, id: ReplicaId) -> Option<SocketAddr> {
    self.topology.replicas.get(&id).copied()
  }

  /// The auxiliary address on which `id` listens for recovery
  /// replies.
  pub fn recovery_addr_of(&self, id: ReplicaId) -> Option<SocketAddr> {
    self.addr_of(id).map(|mut addr| {
      addr.set_port(self.topology.recovery_base + id as u16);
      addr
    })
  }

  /// All replica ids other than `id`.
  pub fn peers_of(&self, id: ReplicaId) -> Vec<ReplicaId> {
    self
      .topology
      .replicas
      .keys()
      .copied()
      .filter(|&peer| peer != id)
      .collect()
  }
}

fn env_knob<T: std::str::FromStr>(
  name: &'static str,
) -> Result<Option<T>, ConfigError> {
  match env::var(name) {
    Ok(value) => value
      .parse()
      .map(Some)
      .map_err(|_| ConfigError::Env(name)),
    Err(_) => Ok(None),
  }
}

#[cfg(test)]
mod test {
  use {
    super::{Config, ConfigError, Variant},
    std::path::PathBuf,
    tempdir::TempDir,
  };

  fn topology_file(dir: &TempDir, replicas: usize) -> PathBuf {
    let entries: Vec<String> = (0..replicas)
      .map(|i| format!("\"{}\": \"127.0.0.1:{}\"", i, 10000 + i))
      .collect();
    let path = dir.path().join("topology.json");
    std::fs::write(
      &path,
      format!(
        "{{\"replicas\": {{{}}}, \"epochDuration\": \"1s\", \"faults\": 1}}",
        entries.join(", ")
      ),
    )
    .unwrap();
    path
  }

  #[test]
  fn classical_replica_count() {
    let dir = TempDir::new("topology").unwrap();
    let path = topology_file(&dir, 4);
    let config =
      Config::load(&path, Variant::Classical, 0, ".".into()).unwrap();
    assert_eq!(config.replica_count(), 4);
    assert_eq!(config.quorum(), 3);
    assert_eq!(config.variant.finalization_window(), 3);
  }

  #[test]
  fn usig_variant_parameters() {
    let dir = TempDir::new("topology").unwrap();
    let path = topology_file(&dir, 3);
    let config = Config::load(&path, Variant::Usig, 2, ".".into()).unwrap();
    assert_eq!(config.replica_count(), 3);
    assert_eq!(config.quorum(), 2);
    assert_eq!(config.variant.finalization_window(), 2);
  }

  #[test]
  fn rejects_wrong_replica_count() {
    let dir = TempDir::new("topology").unwrap();
    let path = topology_file(&dir, 4);
    let err = Config::load(&path, Variant::Usig, 0, ".".into()).unwrap_err();
    assert!(matches!(err, ConfigError::ReplicaCount { .. }));
  }

  #[test]
  fn rejects_unknown_replica() {
    let dir = TempDir::new("topology").unwrap();
    let path = topology_file(&dir, 4);
    let err =
      Config::load(&path, Variant::Classical, 9, ".".into()).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownReplica(9)));
  }

  #[test]
  fn recovery_ports_are_derived() {
    let dir = TempDir::new("topology").unwrap();
    let path = topology_file(&dir, 4);
    let config =
      Config::load(&path, Variant::Classical, 0, ".".into()).unwrap();
    let addr = config.recovery_addr_of(2).unwrap();
    assert_eq!(addr.port(), 15002);
  }
}
