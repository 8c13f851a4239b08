use {
  crate::{config::Variant, primitives::ReplicaId},
  clap::Parser,
  std::path::PathBuf,
};

#[derive(Debug, Parser)]
#[clap(version, about)]
pub struct CliOpts {
  #[clap(short, long, help = "numeric identity of this replica")]
  pub replica_id: ReplicaId,

  #[clap(
    short,
    long,
    parse(from_os_str),
    help = "path to the replica topology file"
  )]
  pub config: PathBuf,

  #[clap(
    long,
    arg_enum,
    default_value = "classical",
    help = "protocol deployment variant"
  )]
  pub variant: Variant,

  #[clap(
    long,
    parse(from_os_str),
    default_value = "data",
    help = "directory for the finalized block log"
  )]
  pub data_dir: PathBuf,

  #[clap(
    short,
    long,
    parse(from_occurrences),
    help = "Use verbose output (-vv very verbose output)"
  )]
  pub verbose: u64,
}
