use std::{net::SocketAddr, sync::Arc};
use rand::{rngs::StdRng, SeedableRng};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tracing::Instrument;
use crate::torrent::{CommandToTorrent, TorrentContext};

pub mod handshake;
mod message;
mod session;

pub use session::PeerSession;

pub type Result<T> = std::result::Result<T, PeerError>;
pub type PeerRx = mpsc::Receiver<PeerCommand>;
pub type PeerTx = mpsc::Sender<PeerCommand>;

// Session mailboxes are bounded; a peer whose mailbox overflows is
// disconnected rather than blocking the coordinator.
const MAILBOX_SIZE: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("frame of {0} bytes exceeds maximum")]
    FrameTooLarge(usize),

    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("connection timeout")]
    Timeout,
}

impl From<mpsc::error::SendError<CommandToTorrent>> for PeerError {
    fn from(e: mpsc::error::SendError<CommandToTorrent>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

// Commands that can be sent to a peer session.
#[derive(Debug)]
pub enum PeerCommand {

    // The torrent completed and verified a piece.
    Have(usize),

    Shutdown,

}

#[derive(Debug)]
pub struct PeerHandle {

    // Sends commands to the session.
    pub peer_tx: PeerTx,

    // The peer's IP address.
    pub address: SocketAddr,

    pub session_handle: JoinHandle<()>,

}

impl PeerHandle {

    // Spawns the session task for an already-handshaken socket. The
    // coordinator learns of the session's death via a PeerExited command.
    pub fn start_session(
        stream: TcpStream,
        peer_id: [u8; 20],
        address: SocketAddr,
        i_have: crate::Bitfield,
        ctx: Arc<TorrentContext>,
    ) -> Self {

        let torrent_tx = ctx.torrent_tx.clone();
        let (mut session, peer_tx) =
            PeerSession::new(peer_id, address, i_have, ctx, StdRng::from_entropy());

        let session_handle = tokio::spawn(async move {
            if let Err(e) = session.run(stream).await {
                tracing::error!("session error: {}", e);
            }
            torrent_tx.send(CommandToTorrent::PeerExited { peer_id, address }).ok();
        }.instrument(tracing::info_span!("peer", addr = %address)));

        PeerHandle {
            peer_tx,
            address,
            session_handle,
        }
    }
}

pub(crate) fn mailbox() -> (PeerTx, PeerRx) {
    mpsc::channel(MAILBOX_SIZE)
}
