use serde::de::{self, Deserialize as _};
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid pieces length, must be non-empty and divisible by 20")]
    InvalidPiecesLength,

    #[error("info dictionary has no length")]
    NoLength,

    #[error("piece length must be a positive integer")]
    InvalidPieceLength,

    #[error("piece count does not cover the torrent length")]
    LengthMismatch,

    #[error("multi-file torrents are not supported")]
    MultiFile,
}

// Entry of a multi-file torrent's "files" list; parsed only so such
// torrents can be rejected cleanly.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {

    pub path: Vec<String>,

    pub length: u64,

}

// Single-file info dictionary. Fields are declared in bencode key order so
// re-encoding reproduces the source bytes for well-formed torrents.
#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,

    // Length of the file in bytes (integer).
    #[serde(default)]
    pub length: Option<u64>,

    // A 32-character hexadecimal string corresponding to the MD5 sum of the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

    // Target file name.
    pub name: String,

    // Number of bytes in each piece (integer).
    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // Concatenation of all 20-byte SHA1 hash values, one per piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,

}

impl Info {
    // Sha1 of the bencoded info dict, identifying the swarm.
    fn info_hash(&self) -> Result<[u8; 20], MetaInfoError> {
        use sha1::Digest;
        let info_data = serde_bencode::to_bytes(&self)?;
        Ok(sha1::Sha1::digest(&info_data).into())
    }
}

#[derive(Clone, Deserialize)]
pub struct MetaInfo {

    // The announce URL of the tracker (string).
    #[serde(deserialize_with = "url_deserialize")]
    pub announce: url::Url,

    // A dictionary that describes the file of the torrent.
    pub info: Info,

    // Sha1 hash of info dict.
    #[serde(skip)]
    pub info_hash: [u8; 20],

}

impl MetaInfo {

    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo, MetaInfoError> {
        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        MetaInfo::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<MetaInfo, MetaInfoError> {

        let mut metainfo: MetaInfo = serde_bencode::from_bytes(buf)?;

        if metainfo.info.files.is_some() {
            return Err(MetaInfoError::MultiFile);
        }
        if metainfo.info.pieces.len() % 20 != 0 || metainfo.info.pieces.is_empty() {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        if metainfo.info.piece_length == 0 {
            return Err(MetaInfoError::InvalidPieceLength);
        }
        let total_len = match metainfo.info.length {
            Some(len) if len > 0 => len,
            _ => return Err(MetaInfoError::NoLength),
        };
        // Hash count must match ceil(length / piece_length).
        let expect = (total_len + metainfo.info.piece_length as u64 - 1) / metainfo.info.piece_length as u64;
        if metainfo.num_pieces() as u64 != expect {
            return Err(MetaInfoError::LengthMismatch);
        }

        metainfo.info_hash = metainfo.info.info_hash()?;
        tracing::debug!("metainfo created: {:#?}", metainfo);
        Ok(metainfo)
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info.pieces
            .chunks_exact(20)
            // Safe as we have already checked length is a multiple of 20, in from_bytes.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> usize { self.info.pieces.len() / 20 }

    pub fn total_len(&self) -> u64 { self.info.length.unwrap_or(0) }

    pub fn info_hash(&self) -> [u8; 20] { self.info_hash }

    pub fn name(&self) -> &str { &self.info.name }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

fn url_deserialize<'de, D>(deserializer: D) -> Result<url::Url, D::Error>
where
    D: de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    url::Url::parse(&s).map_err(de::Error::custom)
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_str())
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .finish()
    }
}

// Dont want to print out the pieces field, so we implement Debug manually.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("length", &self.length)
            .field("private", &self.private)
            .finish()
    }
}
