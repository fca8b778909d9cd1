use std::{
    collections::BTreeSet,
    fs,
    os::unix::fs::FileExt,
    path::PathBuf,
};
use sha1::{Digest, Sha1};
use crate::{metainfo::MetaInfo, Bitfield};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("access outside file bounds: offset {offset}, len {len}")]
    OutOfBounds { offset: u64, len: usize },

}

// General information on torrent storage.
#[derive(Debug, Clone)]
pub struct StoreInfo {

    // Target file name from the metainfo.
    pub name: String,

    // Length of torrent in bytes.
    pub total_len: u64,

    // Length of pieces in bytes.
    pub piece_len: usize,

    // Length of the last piece, will be <= piece_len.
    pub last_piece_len: usize,

    // Number of pieces in torrent.
    pub num_pieces: usize,

    // Directory the target file lives in.
    pub output_dir: PathBuf,

}

impl StoreInfo {

    pub fn new(metainfo: &MetaInfo, output_dir: PathBuf) -> Self {

        let total_len = metainfo.total_len();
        let num_pieces = metainfo.num_pieces();
        let piece_len = metainfo.piece_len();
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;

        Self {
            name: metainfo.name().to_string(),
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
            output_dir,
        }
    }

    // Returns length of piece given its index.
    pub fn piece_length(&self, idx: usize) -> usize {
        if idx == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_offset(&self, idx: usize) -> u64 {
        idx as u64 * self.piece_len as u64
    }

    fn target_path(&self) -> PathBuf {
        self.output_dir.join(&self.name)
    }

    fn partial_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.download", self.name))
    }
}

// Byte-addressable access to the target file, shared across peer sessions
// for positional IO. Writes are piece-aligned and non-overlapping.
#[derive(Debug)]
pub struct PieceStore {

    file: fs::File,

    pub info: StoreInfo,

    // One 20-byte digest per piece.
    piece_hashes: Vec<[u8; 20]>,

}

impl PieceStore {

    // Opens or creates the backing file and derives the initial have/missing
    // split. A file named `<name>` of exactly the right size is a finished
    // torrent; `<name>.download` is a partial download to be resume-scanned;
    // anything else starts from scratch.
    pub fn open(
        info: StoreInfo,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Result<(Self, Bitfield, BTreeSet<usize>)> {
        debug_assert_eq!(piece_hashes.len(), info.num_pieces);

        if !info.output_dir.is_dir() {
            fs::create_dir_all(&info.output_dir)?;
            tracing::info!("created missing output directory: {:?}", info.output_dir);
        }

        let target = info.target_path();
        if target.is_file() && target.metadata()?.len() == info.total_len {
            tracing::info!("found complete file: {:?}", target);
            let file = fs::OpenOptions::new().read(true).open(&target)?;
            let have = Bitfield::repeat(true, info.num_pieces);
            let store = Self { file, info, piece_hashes };
            return Ok((store, have, BTreeSet::new()));
        }

        let partial = info.partial_path();
        if partial.is_file() && partial.metadata()?.len() == info.total_len {
            tracing::info!("resuming from partial file: {:?}", partial);
            let file = fs::OpenOptions::new().read(true).write(true).open(&partial)?;
            let store = Self { file, info, piece_hashes };
            let (have, missing) = store.resume_scan()?;
            return Ok((store, have, missing));
        }

        tracing::info!("creating partial file: {:?}", partial);
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&partial)?;
        file.set_len(info.total_len)?;

        let have = Bitfield::repeat(false, info.num_pieces);
        let missing = (0..info.num_pieces).collect();
        Ok((Self { file, info, piece_hashes }, have, missing))
    }

    // Re-verify every piece of a partial file. Hash mismatches are normal
    // here, they just mark the piece as still missing.
    fn resume_scan(&self) -> Result<(Bitfield, BTreeSet<usize>)> {

        let mut have = Bitfield::repeat(false, self.info.num_pieces);
        let mut missing = BTreeSet::new();

        for idx in 0..self.info.num_pieces {
            let piece = self.read(self.info.piece_offset(idx), self.info.piece_length(idx))?;
            let digest: [u8; 20] = Sha1::digest(&piece).into();
            if digest == self.piece_hashes[idx] {
                have.set(idx, true);
            } else {
                missing.insert(idx);
            }
        }

        tracing::info!(
            "resume scan: {}/{} pieces verified",
            have.count_ones(),
            self.info.num_pieces
        );
        Ok((have, missing))
    }

    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset + len as u64 > self.info.total_len {
            return Err(StoreError::OutOfBounds { offset, len });
        }
        let mut buf = vec![0; len];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > self.info.total_len {
            return Err(StoreError::OutOfBounds { offset, len: data.len() });
        }
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    pub fn piece_sha(&self, idx: usize) -> [u8; 20] {
        self.piece_hashes[idx]
    }
}
