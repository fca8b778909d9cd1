use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
};

const DEFAULT_CLIENT_ID: [u8; 20] = *b"-RT0010-73b3b0b0b0b0";

// Default upload budget, 128 KiB/s.
const DEFAULT_UPLOAD_BPS: u64 = 128 * 1024;

#[derive(Debug, Clone)]
pub struct TorrentConfig {

    // Unique 20-byte identifier used by client.
    pub client_id: [u8; 20],

    // Address on which the client listens for incoming peers.
    pub listen_address: SocketAddr,

    // Directory the target file is written to.
    pub output_dir: PathBuf,

    // Upload rate budget per peer, in bytes per second.
    pub upload_bps: u64,

}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID,
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            output_dir: PathBuf::from("downloads"),
            upload_bps: DEFAULT_UPLOAD_BPS,
        }
    }
}
