mod cli;
mod config;
mod consensus;
mod network;
mod primitives;
mod storage;
mod workload;

use {
  clap::Parser,
  cli::CliOpts,
  config::Config,
  consensus::Streamlet,
  network::Communication,
  storage::FinalizedLog,
  tracing::{info, Level},
  tracing_subscriber::{
    filter::filter_fn,
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
    Layer,
  },
};

fn print_essentials(opts: &CliOpts, config: &Config) {
  info!("Starting Streamlet replica {}", opts.replica_id);
  info!("Version: {}", env!("CARGO_PKG_VERSION"));
  info!("Variant: {:?}", config.variant);
  info!("Fault bound: f = {}", config.topology.faults);
  info!("Peer set: {:?}", config.topology.replicas);
  info!("Epoch duration: {:?}", config.topology.epoch_duration);
  info!("Data directory: {}", opts.data_dir.display());
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
  let opts = CliOpts::parse();

  let loglevel = match opts.verbose {
    1 => Level::DEBUG,
    2 => Level::TRACE,
    _ => Level::INFO,
  };
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .with_filter(filter_fn(move |metadata| metadata.level() <= &loglevel)),
    )
    .init();

  // configuration or key-exchange problems must never produce a
  // half-started replica: bail out with a nonzero exit code
  let config = Config::load(
    &opts.config,
    opts.variant,
    opts.replica_id,
    opts.data_dir.clone(),
  )?;
  print_essentials(&opts, &config);

  // the network activity: framing, parsing and queueing of
  // incoming messages, decoupled from consensus by a bounded queue
  let (comms, inbox) = Communication::start(opts.replica_id, &config).await?;

  // synthetic client transactions, batched through a second
  // bounded queue
  let batches = workload::generate(&config);

  // the durable output of the whole protocol
  let log = FinalizedLog::open(&config.data_dir, opts.replica_id)?;

  let mut engine = Streamlet::new(
    opts.replica_id,
    config,
    comms,
    inbox,
    batches,
    log,
  );

  tokio::select! {
    result = engine.run() => result?,
    _ = tokio::signal::ctrl_c() => {
      info!("interrupt received, shutting down");
    }
  }

  Ok(())
}
