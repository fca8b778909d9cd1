use crate::BLOCK_SIZE;

// A block received from, or served to, a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    // Index of piece that the block is contained in.
    pub piece_idx: usize,

    // Offset in bytes of block within piece.
    pub offset: usize,

    // Data of block.
    pub data: Vec<u8>,
}

// Identifies a block within a torrent.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockInfo {

    pub piece_idx: usize,

    pub offset: usize,

    pub len: usize,

}

pub fn block_len(piece_len: usize, block_idx: usize) -> usize {
    BLOCK_SIZE.min(piece_len - (block_idx * BLOCK_SIZE))
}

pub fn num_blocks(piece_len: usize) -> usize {
    (piece_len + (BLOCK_SIZE - 1)) / BLOCK_SIZE
}

// All block requests covering a piece, in offset order.
pub fn piece_blocks(piece_idx: usize, piece_len: usize) -> impl Iterator<Item = BlockInfo> {
    (0..num_blocks(piece_len)).map(move |i| BlockInfo {
        piece_idx,
        offset: i * BLOCK_SIZE,
        len: block_len(piece_len, i),
    })
}
