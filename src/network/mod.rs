pub mod message;
pub mod wire;

use {
  crate::{config::Config, primitives::ReplicaId},
  self::message::Message,
  std::{collections::HashMap, net::SocketAddr, time::Duration},
  tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
  },
  tracing::{debug, error, warn},
};

/// Capacity of the inbound message queue and of each outbound
/// per-peer queue.
const QUEUE_DEPTH: usize = 1024;

/// Delay between reconnection attempts to an unreachable peer.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Framed, authenticated peer-to-peer delivery over plain TCP for
/// a fixed peer set.
///
/// One listener task accepts inbound connections and spawns a
/// reader per peer; readers deserialize frames and feed a single
/// bounded queue consumed by the consensus activity. One writer
/// task per peer owns the outbound connection and reconnects with
/// backoff, so a crashed peer never blocks the epoch loop.
pub struct Communication {
  outbound: HashMap<ReplicaId, mpsc::Sender<Vec<u8>>>,
}

impl Communication {
  /// Binds the replica's listen address and connects to the full
  /// peer set. Returns the handle used for sending plus the
  /// receiving end of the inbound queue.
  pub async fn start(
    id: ReplicaId,
    config: &Config,
  ) -> std::io::Result<(Self, mpsc::Receiver<Message>)> {
    let addr = config
      .addr_of(id)
      .expect("own replica id was validated against the topology");
    let listener = TcpListener::bind(addr).await?;
    debug!("replica {id} listening on {addr}");

    let (inbox_tx, inbox_rx) = mpsc::channel(QUEUE_DEPTH);
    let variant = config.variant;
    tokio::spawn(async move {
      loop {
        match listener.accept().await {
          Ok((stream, peer_addr)) => {
            let inbox = inbox_tx.clone();
            tokio::spawn(async move {
              read_loop(stream, peer_addr, variant, inbox).await;
            });
          }
          Err(e) => {
            error!("accept failed: {e}");
            tokio::time::sleep(RECONNECT_DELAY).await;
          }
        }
      }
    });

    let mut outbound = HashMap::new();
    for peer in config.peers_of(id) {
      let peer_addr = config
        .addr_of(peer)
        .expect("topology is validated to be contiguous");
      let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
      outbound.insert(peer, tx);
      tokio::spawn(async move {
        write_loop(peer, peer_addr, rx).await;
      });
    }

    Ok((Self { outbound }, inbox_rx))
  }

  /// Queues a message for one peer. A full queue drops the
  /// message: the protocol tolerates loss and the alternative is
  /// blocking the consensus loop on a slow peer.
  pub fn send(&self, to: ReplicaId, message: &Message) {
    if let Some(queue) = self.outbound.get(&to) {
      if queue.try_send(message.to_bytes()).is_err() {
        warn!("outbound queue to replica {to} is full, dropping message");
      }
    }
  }

  /// Queues a message for every other replica.
  pub fn broadcast(&self, message: &Message) {
    let bytes = message.to_bytes();
    for (&peer, queue) in &self.outbound {
      if queue.try_send(bytes.clone()).is_err() {
        warn!("outbound queue to replica {peer} is full, dropping message");
      }
    }
  }
}

/// Reads frames off one inbound connection until the peer goes
/// away. Malformed frames are logged and the connection dropped;
/// the peer will reconnect.
async fn read_loop(
  mut stream: TcpStream,
  peer_addr: SocketAddr,
  variant: crate::config::Variant,
  inbox: mpsc::Sender<Message>,
) {
  loop {
    let frame = match wire::read_frame(&mut stream).await {
      Ok(frame) => frame,
      Err(e) => {
        debug!("connection from {peer_addr} closed: {e}");
        return;
      }
    };
    match Message::from_bytes(&frame, variant) {
      Ok(message) => {
        if inbox.send(message).await.is_err() {
          return; // consensus activity is gone
        }
      }
      Err(e) => {
        warn!("discarding malformed message from {peer_addr}: {e}");
      }
    }
  }
}

/// Owns the outbound connection to one peer: connects with
/// backoff, then forwards queued frames. A write failure tears the
/// connection down and reconnects; the failed frame is dropped.
async fn write_loop(
  peer: ReplicaId,
  peer_addr: SocketAddr,
  mut queue: mpsc::Receiver<Vec<u8>>,
) {
  let mut stream: Option<TcpStream> = None;
  while let Some(frame) = queue.recv().await {
    loop {
      if stream.is_none() {
        match TcpStream::connect(peer_addr).await {
          Ok(connected) => stream = Some(connected),
          Err(e) => {
            debug!("connecting to replica {peer} at {peer_addr} failed: {e}");
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
          }
        }
      }
      if let Some(connected) = stream.as_mut() {
        match wire::write_frame(connected, &frame).await {
          Ok(()) => break,
          Err(e) => {
            warn!("write to replica {peer} failed, reconnecting: {e}");
            stream = None;
            break; // drop this frame, transport is lossy on faults
          }
        }
      }
    }
  }
}
