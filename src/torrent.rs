use std::{
    collections::{BTreeSet, HashMap, HashSet},
    net::SocketAddr,
    path::Path,
    sync::{Arc, Mutex},
};
use once_cell::sync::Lazy;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time,
};
use tracing::Instrument;
use crate::{
    config::TorrentConfig,
    metainfo::{MetaInfo, MetaInfoError},
    p2p::{handshake, PeerCommand, PeerError, PeerHandle},
    stats::Counters,
    store::{PieceStore, StoreError, StoreInfo},
    tracker::{AnnounceParams, Event, Tracker, DEFAULT_ANNOUNCE_INTERVAL},
    Bitfield,
};

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("metainfo error: {0}")]
    MetaInfo(#[from] MetaInfoError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage failure: {0}")]
    Storage(String),

}

pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<CommandToTorrent>;
pub type TorrentRx = mpsc::UnboundedReceiver<CommandToTorrent>;

// Commands that can be sent to a torrent from other tasks.
pub enum CommandToTorrent {

    // Sent by a connect/accept task once the handshake went through; the
    // socket is handed over for a session to be spawned.
    PeerConnected { stream: TcpStream, peer_id: [u8; 20], address: SocketAddr },

    // Sent by an outbound connect task that never got to a handshake.
    ConnectFailed { address: SocketAddr },

    // Sent by a peer session when a piece has been verified and written.
    Downloaded { idx: usize },

    // Sent by the session spawn wrapper when a session ends, however it ends.
    PeerExited { peer_id: [u8; 20], address: SocketAddr },

    // Sent by a peer session that failed to persist a verified piece.
    StorageFailure { error: String },

    Shutdown,

}

// How a coordinator run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {

    // Every piece is verified on disk.
    Complete,

    // Shut down by request.
    Stopped,

}

// Read-only state shared with the peer sessions.
#[derive(Debug)]
pub struct TorrentContext {

    // The info hash for this torrent.
    pub info_hash: [u8; 20],

    // The client ID for this client.
    pub client_id: [u8; 20],

    // Shared positional access to the target file.
    pub store: Arc<PieceStore>,

    // Transfer totals for tracker accounting.
    pub counters: Arc<Counters>,

    // Commands to the torrent.
    pub torrent_tx: TorrentTx,

    // Per-peer upload budget in bytes per second.
    pub upload_bps: u64,

}

// Handle to a running coordinator. Only the creating call carries the join
// handle; registry lookups get the command channel alone.
pub struct TorrentHandle {

    pub info_hash: [u8; 20],

    pub torrent_tx: TorrentTx,

    pub join: Option<tokio::task::JoinHandle<Result<Status>>>,

}

// Process-wide registry deduplicating coordinators by info-hash.
static REGISTRY: Lazy<Mutex<HashMap<[u8; 20], TorrentTx>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn find(info_hash: &[u8; 20]) -> Option<TorrentHandle> {
    let registry = REGISTRY.lock().expect("registry poisoned");
    registry.get(info_hash).map(|torrent_tx| TorrentHandle {
        info_hash: *info_hash,
        torrent_tx: torrent_tx.clone(),
        join: None,
    })
}

// Starts downloading (and seeding) the given torrent. Idempotent by
// info-hash: a second call for the same torrent returns a handle to the
// coordinator that already exists.
pub fn download<P: AsRef<Path>>(path: P, config: TorrentConfig) -> Result<TorrentHandle> {

    let metainfo = MetaInfo::new(path)?;
    let info_hash = metainfo.info_hash();

    let mut registry = REGISTRY.lock().expect("registry poisoned");
    if let Some(torrent_tx) = registry.get(&info_hash) {
        tracing::info!("torrent {} already running", metainfo.info_hash_hex());
        return Ok(TorrentHandle {
            info_hash,
            torrent_tx: torrent_tx.clone(),
            join: None,
        });
    }

    let mut torrent = Torrent::new(metainfo, config)?;
    let torrent_tx = torrent.torrent_tx.clone();
    registry.insert(info_hash, torrent_tx.clone());
    drop(registry);

    let join = tokio::spawn(async move {
        let res = torrent.run().await;
        REGISTRY.lock().expect("registry poisoned").remove(&info_hash);
        match &res {
            Ok(status) => tracing::info!("torrent finished: {:?}", status),
            Err(e) => tracing::error!("torrent failed: {}", e),
        }
        res
    }.instrument(tracing::info_span!("torrent", info_hash = %hex::encode(info_hash))));

    Ok(TorrentHandle {
        info_hash,
        torrent_tx,
        join: Some(join),
    })
}

#[derive(Debug)]
pub struct Torrent {

    // Context is a read-only state accessible by peers in tasks.
    ctx: Arc<TorrentContext>,

    config: TorrentConfig,

    // Pieces we own and have hash-verified.
    have: Bitfield,

    // Complement of have; empty means the torrent is complete.
    missing: BTreeSet<usize>,

    // Peers we have live sessions with, keyed by remote peer id.
    peers: HashMap<[u8; 20], PeerHandle>,

    // Addresses with a session or connect attempt in progress.
    connected_addrs: HashSet<SocketAddr>,

    tracker: Tracker,

    // Receiver for commands.
    torrent_rx: TorrentRx,

    // Sender for commands, cloned into spawned tasks.
    pub torrent_tx: TorrentTx,

}

impl Torrent {

    pub fn new(metainfo: MetaInfo, config: TorrentConfig) -> Result<Self> {

        let info = StoreInfo::new(&metainfo, config.output_dir.clone());
        let (store, have, missing) = PieceStore::open(info, metainfo.piece_hashes())?;
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(TorrentContext {
            info_hash: metainfo.info_hash(),
            client_id: config.client_id,
            store: Arc::new(store),
            counters: Arc::new(Counters::default()),
            torrent_tx: torrent_tx.clone(),
            upload_bps: config.upload_bps,
        });

        Ok(Torrent {
            ctx,
            tracker: Tracker::new(metainfo.announce.clone()),
            have,
            missing,
            peers: HashMap::new(),
            connected_addrs: HashSet::new(),
            torrent_rx,
            torrent_tx,
            config,
        })
    }

    // Top level torrent loop: announce schedule, inbound connections and
    // the command mailbox, run until complete, stopped or a storage fault.
    pub async fn run(&mut self) -> Result<Status> {
        tracing::info!("starting torrent");

        if self.missing.is_empty() {
            tracing::info!("torrent already complete on disk");
            return Ok(Status::Complete);
        }

        let listener = TcpListener::bind(self.config.listen_address).await?;
        let listen_port = listener.local_addr()?.port();
        tracing::info!("listening on port {}", listen_port);

        let mut event = Some(Event::Started);
        let mut next_announce = time::Instant::now();

        loop { tokio::select! {

            () = time::sleep_until(next_announce) => {
                let interval = match self.announce(event, listen_port).await {
                    Ok(interval) => {
                        event = None;
                        interval
                    },
                    Err(e) => {
                        // Transient; try again after the retry floor.
                        tracing::error!("tracker announce error: {}", e);
                        DEFAULT_ANNOUNCE_INTERVAL
                    },
                };
                next_announce = time::Instant::now() + interval;
            }

            new_peer_conn = listener.accept() => {
                match new_peer_conn {
                    Ok((stream, address)) => self.accept_peer(stream, address),
                    Err(e) => tracing::warn!("inbound peer connection error: {}", e),
                }
            }

            Some(cmd) = self.torrent_rx.recv() => {
                match cmd {

                    CommandToTorrent::PeerConnected { stream, peer_id, address } => {
                        self.handle_peer_connected(stream, peer_id, address);
                    },

                    CommandToTorrent::ConnectFailed { address } => {
                        self.connected_addrs.remove(&address);
                    },

                    CommandToTorrent::Downloaded { idx } => {
                        if self.handle_downloaded(idx) {
                            self.shutdown().await;
                            return Ok(Status::Complete);
                        }
                    },

                    CommandToTorrent::PeerExited { peer_id, address } => {
                        self.peers.remove(&peer_id);
                        self.connected_addrs.remove(&address);
                        tracing::info!("peer exited, {} remain", self.peers.len());
                    },

                    CommandToTorrent::StorageFailure { error } => {
                        tracing::error!("fatal storage failure: {}", error);
                        self.shutdown().await;
                        return Err(TorrentError::Storage(error));
                    },

                    CommandToTorrent::Shutdown => {
                        self.shutdown().await;
                        return Ok(Status::Stopped);
                    },
                }
            }
        }}
    }

    #[tracing::instrument(skip(self, listen_port), fields(num_peers = self.peers.len()))]
    async fn announce(&mut self, event: Option<Event>, listen_port: u16) -> crate::tracker::Result<time::Duration> {

        // Exact number of bytes still wanted.
        let left = self.missing
            .iter()
            .map(|idx| self.ctx.store.info.piece_length(*idx) as u64)
            .sum();

        let resp = self.tracker.announce(AnnounceParams {
            info_hash: self.ctx.info_hash,
            client_id: self.ctx.client_id,
            port: listen_port,
            uploaded: self.ctx.counters.uploaded(),
            downloaded: self.ctx.counters.downloaded(),
            left,
            event,
        }).await?;

        tracing::info!("tracker returned {} peers", resp.peers.len());
        for address in resp.peers {
            self.connect_to_peer(address);
        }

        let interval = resp.interval
            .map(time::Duration::from_secs)
            .unwrap_or(DEFAULT_ANNOUNCE_INTERVAL);
        Ok(interval.max(DEFAULT_ANNOUNCE_INTERVAL))
    }

    // One outbound connect attempt per distinct address.
    fn connect_to_peer(&mut self, address: SocketAddr) {
        if !self.connected_addrs.insert(address) {
            return;
        }

        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            match outbound_handshake(address, &ctx).await {
                Ok((stream, peer_id)) => {
                    ctx.torrent_tx
                        .send(CommandToTorrent::PeerConnected { stream, peer_id, address })
                        .ok();
                },
                Err(e) => {
                    tracing::warn!("outbound connection to {} failed: {}", address, e);
                    ctx.torrent_tx
                        .send(CommandToTorrent::ConnectFailed { address })
                        .ok();
                },
            }
        });
    }

    fn accept_peer(&mut self, mut stream: TcpStream, address: SocketAddr) {
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            match handshake::accept(&mut stream, ctx.info_hash, ctx.client_id).await {
                Ok(peer_id) => {
                    ctx.torrent_tx
                        .send(CommandToTorrent::PeerConnected { stream, peer_id, address })
                        .ok();
                },
                Err(e) => tracing::warn!("inbound handshake with {} failed: {}", address, e),
            }
        });
    }

    fn handle_peer_connected(&mut self, stream: TcpStream, peer_id: [u8; 20], address: SocketAddr) {

        if peer_id == self.ctx.client_id {
            tracing::debug!("connected to ourselves, dropping");
            self.connected_addrs.remove(&address);
            return;
        }
        if self.peers.contains_key(&peer_id) {
            tracing::debug!("duplicate session for peer, dropping");
            self.connected_addrs.remove(&address);
            return;
        }

        self.connected_addrs.insert(address);
        let handle = PeerHandle::start_session(
            stream,
            peer_id,
            address,
            self.have.clone(),
            Arc::clone(&self.ctx),
        );
        self.peers.insert(peer_id, handle);
    }

    // Moves a verified piece from missing to have and broadcasts it to all
    // sessions. Returns true once nothing is missing.
    fn handle_downloaded(&mut self, idx: usize) -> bool {

        if !self.missing.remove(&idx) {
            // Two sessions can race on the same piece; the second completion
            // is a no-op.
            tracing::debug!("ignoring duplicate completion of piece {}", idx);
            return false;
        }
        self.have.set(idx, true);
        tracing::info!("piece {} downloaded, {} pieces remain", idx, self.missing.len());

        let mut overflowed = Vec::new();
        for (peer_id, peer) in self.peers.iter() {
            if peer.peer_tx.try_send(PeerCommand::Have(idx)).is_err() {
                overflowed.push(*peer_id);
            }
        }
        // A session that cannot take the broadcast is disconnected rather
        // than holding up the coordinator.
        for peer_id in overflowed {
            if let Some(peer) = self.peers.remove(&peer_id) {
                tracing::warn!("peer mailbox unavailable, disconnecting");
                peer.session_handle.abort();
                self.connected_addrs.remove(&peer.address);
            }
        }

        self.missing.is_empty()
    }

    async fn shutdown(&mut self) {

        tracing::info!("disconnecting from {} peers", self.peers.len());
        for peer in self.peers.values() {
            if peer.peer_tx.try_send(PeerCommand::Shutdown).is_err() {
                peer.session_handle.abort();
            }
        }
        for (_, mut peer) in self.peers.drain() {
            // A session wedged on a dead socket gets a grace period, then
            // the axe.
            match time::timeout(time::Duration::from_secs(5), &mut peer.session_handle).await {
                Ok(Err(e)) if !e.is_cancelled() => tracing::warn!("session shutdown: {}", e),
                Err(_) => {
                    tracing::warn!("session unresponsive, aborting");
                    peer.session_handle.abort();
                },
                _ => {},
            }
        }
    }
}

async fn outbound_handshake(
    address: SocketAddr,
    ctx: &TorrentContext,
) -> crate::p2p::Result<(TcpStream, [u8; 20])> {

    let timeout = time::Duration::from_secs(10);
    let mut stream = time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| PeerError::Timeout)??;
    tracing::trace!("outbound connection successful");

    let peer_id = handshake::initiate(&mut stream, ctx.info_hash, ctx.client_id).await?;
    Ok((stream, peer_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::tests::make_torrent;

    fn test_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 13 % 239) as u8).collect()
    }

    fn local_config(dir: &Path) -> TorrentConfig {
        TorrentConfig {
            output_dir: dir.to_path_buf(),
            listen_address: "127.0.0.1:0".parse().unwrap(),
            ..TorrentConfig::default()
        }
    }

    // Scenario: the target file already exists in full; the coordinator
    // verifies it, never announces, and finishes complete.
    #[tokio::test]
    async fn test_complete_on_open() -> anyhow::Result<()> {

        let dir = tempfile::tempdir()?;
        let data = test_data(1 << 16);
        // An unroutable tracker; a single announce attempt would hang the
        // test well past its deadline.
        let torrent = make_torrent("http://127.0.0.1:1/announce", "out.bin", 1 << 14, &data);
        let torrent_path = dir.path().join("complete.torrent");
        std::fs::write(&torrent_path, &torrent)?;
        std::fs::write(dir.path().join("out.bin"), &data)?;

        let handle = download(&torrent_path, local_config(dir.path()))?;
        let status = handle.join.expect("creating call carries join").await??;
        assert_eq!(status, Status::Complete);

        // Registry entry is gone once the coordinator exits.
        assert!(find(&handle.info_hash).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_download_idempotent_by_info_hash() -> anyhow::Result<()> {

        let dir = tempfile::tempdir()?;
        let data = test_data(3 << 14);
        let torrent = make_torrent("http://127.0.0.1:1/announce", "idem.bin", 1 << 14, &data);
        let torrent_path = dir.path().join("idem.torrent");
        std::fs::write(&torrent_path, &torrent)?;

        let first = download(&torrent_path, local_config(dir.path()))?;
        assert!(first.join.is_some());

        let second = download(&torrent_path, local_config(dir.path()))?;
        assert_eq!(second.info_hash, first.info_hash);
        assert!(second.join.is_none(), "second call must reuse the coordinator");
        assert!(find(&first.info_hash).is_some());

        second.torrent_tx.send(CommandToTorrent::Shutdown).ok();
        assert_eq!(first.join.unwrap().await??, Status::Stopped);
        assert!(find(&first.info_hash).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_downloaded_is_idempotent() -> anyhow::Result<()> {

        let dir = tempfile::tempdir()?;
        let data = test_data(5 << 14);
        let torrent = make_torrent("http://127.0.0.1:1/announce", "pieces.bin", 1 << 14, &data);
        let metainfo = MetaInfo::from_bytes(&torrent)?;
        let mut torrent = Torrent::new(metainfo, local_config(dir.path()))?;

        assert_eq!(torrent.missing.len(), 5);
        assert!(torrent.have.not_any());

        assert!(!torrent.handle_downloaded(2));
        assert!(torrent.have[2]);
        assert!(!torrent.missing.contains(&2));
        // A piece is in exactly one of have/missing.
        assert_eq!(torrent.have.count_ones() + torrent.missing.len(), 5);

        // Second completion of the same piece changes nothing.
        assert!(!torrent.handle_downloaded(2));
        assert!(torrent.have[2]);
        assert_eq!(torrent.have.count_ones() + torrent.missing.len(), 5);

        // Completing the rest flips the return to done.
        for idx in [0, 1, 3] {
            assert!(!torrent.handle_downloaded(idx));
        }
        assert!(torrent.handle_downloaded(4));
        assert!(torrent.have.all());
        Ok(())
    }

    #[tokio::test]
    async fn test_one_connect_per_address() -> anyhow::Result<()> {

        let dir = tempfile::tempdir()?;
        let data = test_data(1 << 14);
        let torrent = make_torrent("http://127.0.0.1:1/announce", "single.bin", 1 << 14, &data);
        let metainfo = MetaInfo::from_bytes(&torrent)?;
        let mut torrent = Torrent::new(metainfo, local_config(dir.path()))?;

        // The compact form of 10.0.0.1:6881, as a tracker would hand it out.
        let address: SocketAddr = "10.0.0.1:6881".parse()?;
        torrent.connect_to_peer(address);
        torrent.connect_to_peer(address);
        assert_eq!(torrent.connected_addrs.len(), 1);
        Ok(())
    }
}
