use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use super::{PeerError, Result};

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

pub const HANDSHAKE_LEN: usize = 68;

pub struct Handshake {
    pub protocol:   [u8; 19],
    pub reserved:   [u8; 8],
    pub info_hash:  [u8; 20],
    pub peer_id:    [u8; 20],
}

impl Handshake {

    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            protocol:   PROTOCOL,
            reserved:   [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0; HANDSHAKE_LEN];
        buf[0] = 19;
        buf[1..20].copy_from_slice(&self.protocol);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    pub fn from_bytes(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self> {

        if buf[0] != 19 || buf[1..20] != PROTOCOL {
            return Err(PeerError::IncorrectProtocol);
        }

        let mut handshake = Handshake::new([0; 20], [0; 20]);
        handshake.reserved.copy_from_slice(&buf[20..28]);
        handshake.info_hash.copy_from_slice(&buf[28..48]);
        handshake.peer_id.copy_from_slice(&buf[48..68]);
        Ok(handshake)
    }
}

// Outbound side: send ours, read theirs, cross-validate the info-hash.
// Reads exactly 68 bytes so any messages the remote pipelines behind its
// handshake stay in the socket for the message codec.
pub async fn initiate(
    stream: &mut TcpStream,
    info_hash: [u8; 20],
    client_id: [u8; 20],
) -> Result<[u8; 20]> {

    tracing::trace!("send handshake");
    stream.write_all(&Handshake::new(info_hash, client_id).to_bytes()).await?;

    let mut buf = [0; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;
    let theirs = Handshake::from_bytes(&buf)?;

    if theirs.info_hash != info_hash {
        return Err(PeerError::IncorrectInfoHash);
    }
    tracing::info!("handshake successful, peer connected");
    Ok(theirs.peer_id)
}

// Inbound side: read theirs first, validate, then respond with ours.
pub async fn accept(
    stream: &mut TcpStream,
    info_hash: [u8; 20],
    client_id: [u8; 20],
) -> Result<[u8; 20]> {

    let mut buf = [0; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;
    let theirs = Handshake::from_bytes(&buf)?;

    if theirs.info_hash != info_hash {
        return Err(PeerError::IncorrectInfoHash);
    }

    tracing::trace!("send handshake");
    stream.write_all(&Handshake::new(info_hash, client_id).to_bytes()).await?;
    tracing::info!("handshake successful, peer connected");
    Ok(theirs.peer_id)
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("protocol", &String::from_utf8_lossy(&self.protocol))
            .field("reserved", &self.reserved)
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}
