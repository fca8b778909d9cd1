use std::{
    collections::{BTreeMap, BTreeSet, HashSet, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use rand::{rngs::StdRng, Rng};
use sha1::{Digest, Sha1};
use tokio::{net::TcpStream, time};
use tokio_util::codec::Framed;
use crate::{
    block::{self, BlockData, BlockInfo},
    torrent::{CommandToTorrent, TorrentContext},
    Bitfield, MAX_INFLIGHT,
};
use super::{message::*, PeerCommand, PeerError, PeerRx, PeerTx, Result};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

// Ceiling on queued-but-unsent requests; beyond this, remote have messages
// leave the piece in the candidate set instead of scheduling it.
const MAX_QUEUED: usize = 10 * MAX_INFLIGHT;

// The upload allowance is replenished once per window.
const ALLOWANCE_WINDOW: time::Duration = time::Duration::from_secs(10);

// A peer that has sent no frame at all for this long is dropped.
const IDLE_CUTOFF: time::Duration = time::Duration::from_secs(120);

#[derive(Debug)]
pub struct PeerSession {

    // The peer's IP address.
    address: SocketAddr,

    // Remote id from the handshake.
    peer_id: [u8; 20],

    // Read-only state shared with the torrent.
    torrent_ctx: Arc<TorrentContext>,

    // Commands from the coordinator.
    peer_rx: PeerRx,

    // Snapshot of the torrent's verified pieces, updated on have broadcasts.
    i_have: Bitfield,

    // Pieces the remote has announced.
    peer_has: Bitfield,

    // Candidate pieces: peer_has \ i_have, minus pieces already scheduled.
    want: BTreeSet<usize>,

    // Whether the peer is answering our requests.
    im_choked: bool,

    // Whether we are interested in the peer's pieces.
    im_interested: bool,

    // Whether we are answering the peer's requests.
    peer_is_choked: bool,

    // Whether the peer is interested in our pieces.
    peer_is_interested: bool,

    // Outbound requests awaiting wire send.
    out_queue: VecDeque<BlockInfo>,

    // Inbound block requests to serve.
    in_queue: VecDeque<BlockInfo>,

    // Requests sent to the peer but not yet answered.
    in_flight: HashSet<BlockInfo>,

    // Blocks of in-progress pieces, keyed by (piece, offset).
    partial_blocks: BTreeMap<(usize, usize), Vec<u8>>,

    // Bytes we may still send this window. Negative carries debt.
    upload_allowance: i64,

    // Time of the last frame from the peer.
    last_seen: Instant,

    rng: StdRng,

}

impl PeerSession {

    pub fn new(
        peer_id: [u8; 20],
        address: SocketAddr,
        i_have: Bitfield,
        torrent_ctx: Arc<TorrentContext>,
        rng: StdRng,
    ) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = super::mailbox();
        let peer_has = Bitfield::repeat(false, torrent_ctx.store.info.num_pieces);

        (
            PeerSession {
                address,
                peer_id,
                torrent_ctx,
                peer_rx,
                i_have,
                peer_has,
                want: BTreeSet::new(),
                im_choked: true,
                im_interested: false,
                peer_is_choked: true,
                peer_is_interested: false,
                out_queue: VecDeque::new(),
                in_queue: VecDeque::new(),
                in_flight: HashSet::new(),
                partial_blocks: BTreeMap::new(),
                upload_allowance: 0,
                last_seen: Instant::now(),
                rng,
            },
            peer_tx,
        )
    }

    // Drives the session over an already-handshaken socket until the peer
    // disconnects, the coordinator shuts us down, or a protocol violation.
    pub async fn run(&mut self, stream: TcpStream) -> Result<()> {

        tracing::info!(
            "session started with peer {}",
            String::from_utf8_lossy(&self.peer_id)
        );
        let (mut sink, mut stream) = Framed::new(stream, MessageCodec).split();

        if self.i_have.any() {
            self.send_message(&mut sink, Message::Bitfield(self.i_have.clone())).await?;
        }

        // First tick fires immediately and funds the initial allowance.
        let mut allowance = time::interval(ALLOWANCE_WINDOW);
        let keepalive = time::sleep(self.keepalive_delay());
        tokio::pin!(keepalive);

        loop { tokio::select! {

            // Frame from peer.
            maybe_msg = stream.next() => {
                let msg = match maybe_msg {
                    Some(msg) => msg?,
                    None => {
                        tracing::info!("peer closed connection");
                        break;
                    },
                };
                self.last_seen = Instant::now();
                self.handle_msg(msg)?;
                self.work(&mut sink).await?;
            }

            // Command from the coordinator.
            cmd = self.peer_rx.recv() => {
                match cmd {
                    Some(PeerCommand::Have(idx)) => {
                        self.handle_local_have(&mut sink, idx).await?;
                        self.work(&mut sink).await?;
                    },
                    Some(PeerCommand::Shutdown) | None => {
                        tracing::info!("session shutdown");
                        break;
                    },
                }
            }

            _ = allowance.tick() => {
                self.upload_allowance =
                    (ALLOWANCE_WINDOW.as_secs() * self.torrent_ctx.upload_bps) as i64
                    + self.upload_allowance.min(0);
                if self.last_seen.elapsed() >= IDLE_CUTOFF {
                    tracing::warn!("disconnecting silent peer");
                    return Err(PeerError::Timeout);
                }
                self.work(&mut sink).await?;
            }

            () = &mut keepalive => {
                self.send_message(&mut sink, Message::KeepAlive).await?;
                let delay = self.keepalive_delay();
                keepalive.as_mut().reset(time::Instant::now() + delay);
            }

        }}

        Ok(())
    }

    fn keepalive_delay(&mut self) -> time::Duration {
        time::Duration::from_secs(self.rng.gen_range(5..=15))
    }

    // Logs a message and sends to peer.
    #[inline(always)]
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::info!("send: {}", msg);
        sink.send(msg).await
    }

    fn handle_msg(&mut self, msg: Message) -> Result<()> {
        tracing::info!("read: {}", msg);

        match msg {

            Message::KeepAlive => {},

            Message::Choke => {
                if !self.im_choked {
                    self.im_choked = true;
                    self.requeue_in_flight();
                }
            },

            Message::Unchoke => self.im_choked = false,

            Message::Interested => self.peer_is_interested = true,

            Message::NotInterested => self.peer_is_interested = false,

            Message::Bitfield(bitfield) => self.handle_bitfield(bitfield)?,

            Message::Have { idx } => self.handle_have(idx)?,

            Message::Request(request) => self.handle_request(request)?,

            Message::Cancel(request) => {
                self.in_queue.retain(|queued| *queued != request);
            },

            Message::Block(block) => self.handle_block(block)?,

            Message::Unknown { id } => tracing::trace!("ignoring message id {}", id),

        }

        Ok(())
    }

    // A choking peer will not answer what we already sent, so the in-flight
    // set is re-injected at the head of the queue in offset order.
    fn requeue_in_flight(&mut self) {
        tracing::debug!("requeueing {} in-flight requests", self.in_flight.len());
        let mut requests: Vec<BlockInfo> = self.in_flight.drain().collect();
        requests.sort_unstable_by_key(|b| (b.piece_idx, b.offset));
        for request in requests.into_iter().rev() {
            self.out_queue.push_front(request);
        }
    }

    fn handle_bitfield(&mut self, mut bitfield: Bitfield) -> Result<()> {

        let num_pieces = self.torrent_ctx.store.info.num_pieces;
        if bitfield.len() < num_pieces {
            tracing::error!("bitfield too short for torrent");
            return Err(PeerError::InvalidMessage);
        }
        // Remove trailing bits.
        bitfield.resize(num_pieces, false);
        tracing::info!("peer has {}/{} pieces", bitfield.count_ones(), num_pieces);

        self.peer_has = bitfield;
        self.recompute_want();
        Ok(())
    }

    fn handle_have(&mut self, idx: u32) -> Result<()> {

        let num_pieces = self.torrent_ctx.store.info.num_pieces;
        if idx as usize >= num_pieces {
            tracing::error!("have msg with invalid idx: {}", idx);
            return Err(PeerError::InvalidMessage);
        }
        let idx = idx as usize;

        if self.peer_has[idx] {
            return Ok(());
        }
        self.peer_has.set(idx, true);

        if self.i_have[idx] {
            return Ok(());
        }
        // New candidate; schedule it straight away unless the queue is deep.
        if self.out_queue.len() < MAX_QUEUED {
            self.schedule_piece(idx);
        } else {
            self.want.insert(idx);
        }
        Ok(())
    }

    fn handle_request(&mut self, request: BlockInfo) -> Result<()> {

        if self.peer_is_choked {
            // Requests sent whilst choked are lost by definition.
            tracing::trace!("dropping request from choked peer: {:?}", request);
            return Ok(());
        }
        if !self.valid_request(&request) {
            tracing::error!("invalid request: {:?}", request);
            return Err(PeerError::InvalidMessage);
        }
        self.in_queue.push_back(request);
        Ok(())
    }

    fn valid_request(&self, request: &BlockInfo) -> bool {
        let info = &self.torrent_ctx.store.info;
        request.piece_idx < info.num_pieces
            && self.i_have[request.piece_idx]
            && request.len > 0
            && request.len <= crate::BLOCK_SIZE
            && request.offset + request.len <= info.piece_length(request.piece_idx)
    }

    fn handle_block(&mut self, block: BlockData) -> Result<()> {

        let info = &self.torrent_ctx.store.info;
        if block.piece_idx >= info.num_pieces
            || block.offset + block.data.len() > info.piece_length(block.piece_idx)
        {
            tracing::error!("block outside piece bounds: idx {}", block.piece_idx);
            return Err(PeerError::InvalidMessage);
        }

        self.torrent_ctx.counters.add_downloaded(block.data.len() as u64);

        let request = BlockInfo {
            piece_idx: block.piece_idx,
            offset: block.offset,
            len: block.data.len(),
        };
        if !self.in_flight.remove(&request) {
            // A cancel is advisory; a late block is still usable.
            tracing::trace!("block with no matching request: {:?}", request);
        }

        if self.i_have[block.piece_idx] {
            // Piece completed elsewhere while the block was in transit.
            return Ok(());
        }

        let idx = block.piece_idx;
        self.partial_blocks.insert((idx, block.offset), block.data);

        let piece_len = self.torrent_ctx.store.info.piece_length(idx);
        let accumulated: usize = self
            .piece_entries(idx)
            .iter()
            .map(|key| self.partial_blocks[key].len())
            .sum();
        if accumulated >= piece_len {
            self.finish_piece(idx)?;
        }
        Ok(())
    }

    // Keys of all partial blocks belonging to a piece, in offset order.
    fn piece_entries(&self, idx: usize) -> Vec<(usize, usize)> {
        self.partial_blocks
            .range((idx, 0)..(idx + 1, 0))
            .map(|(key, _)| *key)
            .collect()
    }

    // All blocks of the piece have arrived: assemble, verify, persist.
    fn finish_piece(&mut self, idx: usize) -> Result<()> {

        let mut piece_bytes = Vec::with_capacity(self.torrent_ctx.store.info.piece_length(idx));
        for key in self.piece_entries(idx) {
            // Unwrap safe, keys were just collected from the map.
            piece_bytes.extend(self.partial_blocks.remove(&key).unwrap());
        }

        let digest: [u8; 20] = Sha1::digest(&piece_bytes).into();
        if digest != self.torrent_ctx.store.piece_sha(idx) {
            tracing::warn!("piece {} failed hash verification, discarding", idx);
            // Still peer_has \ i_have, so back into candidacy.
            self.want.insert(idx);
            return Ok(());
        }

        let offset = self.torrent_ctx.store.info.piece_offset(idx);
        if let Err(e) = self.torrent_ctx.store.write(offset, &piece_bytes) {
            // Losing the write is fatal to the whole torrent, not just us.
            tracing::error!("piece write failed: {}", e);
            self.torrent_ctx.torrent_tx
                .send(CommandToTorrent::StorageFailure { error: e.to_string() })
                .ok();
            return Err(e.into());
        }

        tracing::info!("piece {} verified and written", idx);
        self.torrent_ctx.torrent_tx.send(CommandToTorrent::Downloaded { idx })?;
        Ok(())
    }

    // The coordinator completed a piece, possibly through another peer.
    async fn handle_local_have(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {

        self.i_have.set(idx, true);
        self.want.remove(&idx);
        self.out_queue.retain(|queued| queued.piece_idx != idx);
        for key in self.piece_entries(idx) {
            self.partial_blocks.remove(&key);
        }

        // Withdraw requests the peer has not answered yet.
        let mut cancels: Vec<BlockInfo> = self
            .in_flight
            .iter()
            .filter(|request| request.piece_idx == idx)
            .copied()
            .collect();
        cancels.sort_unstable_by_key(|b| b.offset);
        for request in cancels {
            self.in_flight.remove(&request);
            self.send_message(sink, Message::Cancel(request)).await?;
        }

        self.send_message(sink, Message::Have { idx: idx as u32 }).await?;
        Ok(())
    }

    fn schedule_piece(&mut self, idx: usize) {
        self.want.remove(&idx);
        let piece_len = self.torrent_ctx.store.info.piece_length(idx);
        tracing::trace!("scheduling piece {}", idx);
        self.out_queue.extend(block::piece_blocks(idx, piece_len));
    }

    // Pieces that already live in a queue, the in-flight set or the partial
    // buffer; these must not re-enter the candidate set.
    fn scheduled_pieces(&self) -> HashSet<usize> {
        self.out_queue.iter()
            .chain(self.in_flight.iter())
            .map(|b| b.piece_idx)
            .chain(self.partial_blocks.keys().map(|(idx, _)| *idx))
            .collect()
    }

    fn recompute_want(&mut self) {
        let scheduled = self.scheduled_pieces();
        self.want = self
            .peer_has
            .iter_ones()
            .filter(|idx| !self.i_have[*idx] && !scheduled.contains(idx))
            .collect();
    }

    // The outgoing driver, run after every inbound event and timer tick.
    async fn work(&mut self, sink: &mut MessageSink) -> Result<()> {

        // 1. Pick a piece at random from the candidates. Random selection
        //    gives the swarm piece diversity without global coordination.
        if !self.want.is_empty() && self.out_queue.len() + self.in_flight.len() < MAX_INFLIGHT {
            let nth = self.rng.gen_range(0..self.want.len());
            // Unwrap safe, nth is bounded by the set length.
            let idx = *self.want.iter().nth(nth).unwrap();
            self.schedule_piece(idx);
        }

        // 2. Fill the in-flight window.
        while !self.im_choked && self.in_flight.len() < MAX_INFLIGHT {
            let request = match self.out_queue.pop_front() {
                Some(request) => request,
                None => break,
            };
            if !self.im_interested {
                debug_assert!(!self.im_choked);
                self.im_interested = true;
                self.send_message(sink, Message::Interested).await?;
            }
            self.send_message(sink, Message::Request(request)).await?;
            self.in_flight.insert(request);
        }

        // 3. Nothing left to ask this peer for.
        if self.im_interested && self.in_flight.is_empty() && self.out_queue.is_empty() {
            self.im_interested = false;
            self.send_message(sink, Message::NotInterested).await?;
        }

        // 4. Unchoke whenever the budget allows serving.
        if self.peer_is_choked && self.upload_allowance > 0 {
            self.peer_is_choked = false;
            self.send_message(sink, Message::Unchoke).await?;
        }

        // 5. Serve queued requests until the budget runs out.
        while !self.peer_is_choked && self.peer_is_interested && self.upload_allowance > 0 {
            let request = match self.in_queue.pop_front() {
                Some(request) => request,
                None => break,
            };
            let offset = self.torrent_ctx.store.info.piece_offset(request.piece_idx)
                + request.offset as u64;
            let data = self.torrent_ctx.store.read(offset, request.len)?;
            self.send_message(sink, Message::Block(BlockData {
                piece_idx: request.piece_idx,
                offset: request.offset,
                data,
            })).await?;

            self.upload_allowance -= request.len as i64;
            self.torrent_ctx.counters.add_uploaded(request.len as u64);
            if self.upload_allowance <= 0 {
                self.peer_is_choked = true;
                self.send_message(sink, Message::Choke).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet as Set;
    use rand::SeedableRng;
    use tokio::net::TcpListener;
    use crate::{
        stats::Counters,
        store::{PieceStore, StoreInfo},
        torrent::TorrentRx,
        BLOCK_SIZE,
    };

    fn test_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn hashes_of(data: &[u8], piece_len: usize) -> Vec<[u8; 20]> {
        data.chunks(piece_len).map(|p| Sha1::digest(p).into()).collect()
    }

    struct Fixture {
        ctx: Arc<TorrentContext>,
        torrent_rx: TorrentRx,
        _dir: tempfile::TempDir,
    }

    fn fixture(data: &[u8], piece_len: usize, upload_bps: u64, have_all: bool) -> Fixture {

        let dir = tempfile::tempdir().unwrap();
        let num_pieces = (data.len() + piece_len - 1) / piece_len;
        let info = StoreInfo {
            name: "out.bin".to_string(),
            total_len: data.len() as u64,
            piece_len,
            last_piece_len: data.len() - piece_len * (num_pieces - 1),
            num_pieces,
            output_dir: dir.path().to_path_buf(),
        };
        if have_all {
            std::fs::write(dir.path().join("out.bin"), data).unwrap();
        }

        let (store, _, _) = PieceStore::open(info, hashes_of(data, piece_len)).unwrap();
        let (torrent_tx, torrent_rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = Arc::new(TorrentContext {
            info_hash: [0xaa; 20],
            client_id: *b"-RT0010-testtesttest",
            store: Arc::new(store),
            counters: Arc::new(Counters::default()),
            torrent_tx,
            upload_bps,
        });
        Fixture { ctx, torrent_rx, _dir: dir }
    }

    // Spawns a session connected to a local listener and hands back the
    // remote end of the wire, already wrapped in the message codec.
    async fn spawn_session(
        fixture: &Fixture,
        i_have: Bitfield,
    ) -> (Framed<TcpStream, MessageCodec>, PeerTx, tokio::task::JoinHandle<Result<()>>) {

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (mut session, peer_tx) = PeerSession::new(
            *b"-RT0010-remoteremote",
            addr,
            i_have,
            fixture.ctx.clone(),
            StdRng::seed_from_u64(7),
        );
        let handle = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await?;
            session.run(stream).await
        });

        let (stream, _) = listener.accept().await.unwrap();
        (Framed::new(stream, MessageCodec), peer_tx, handle)
    }

    async fn next_msg(wire: &mut Framed<TcpStream, MessageCodec>) -> Message {
        loop {
            let msg = wire.next().await.expect("wire closed").expect("codec error");
            // Keep-alives can interleave anywhere; tests ignore them.
            if msg != Message::KeepAlive {
                return msg;
            }
        }
    }

    async fn expect_silence(wire: &mut Framed<TcpStream, MessageCodec>) {
        let quiet = time::timeout(time::Duration::from_millis(300), async {
            loop {
                match wire.next().await {
                    Some(Ok(Message::KeepAlive)) => continue,
                    other => return other,
                }
            }
        });
        if let Ok(msg) = quiet.await {
            panic!("expected silence, got {:?}", msg);
        }
    }

    fn serve_block(data: &[u8], piece_len: usize, request: &BlockInfo) -> Message {
        let start = request.piece_idx * piece_len + request.offset;
        Message::Block(BlockData {
            piece_idx: request.piece_idx,
            offset: request.offset,
            data: data[start..start + request.len].to_vec(),
        })
    }

    // Scenario: a single peer advertises everything and serves every
    // request; all pieces end up verified on disk.
    #[tokio::test]
    async fn test_single_peer_full_download() -> anyhow::Result<()> {

        let piece_len = 2 * BLOCK_SIZE;
        let data = test_data(4 * piece_len);
        let mut fx = fixture(&data, piece_len, 0, false);
        let i_have = Bitfield::repeat(false, 4);
        let (mut wire, peer_tx, handle) = spawn_session(&fx, i_have).await;

        wire.send(Message::Bitfield(Bitfield::repeat(true, 4))).await?;
        wire.send(Message::Unchoke).await?;

        let mut served = 0;
        let mut interested = false;
        while served < 8 {
            match next_msg(&mut wire).await {
                Message::Interested => interested = true,
                Message::Request(request) => {
                    assert!(interested, "request before interested");
                    assert_eq!(request.len, BLOCK_SIZE);
                    wire.send(serve_block(&data, piece_len, &request)).await?;
                    served += 1;
                },
                msg => panic!("unexpected message: {}", msg),
            }
        }

        let mut done = Set::new();
        while done.len() < 4 {
            match fx.torrent_rx.recv().await {
                Some(CommandToTorrent::Downloaded { idx }) => { done.insert(idx); },
                _ => panic!("unexpected torrent command"),
            }
        }
        assert_eq!(done, (0..4).collect::<Set<_>>());
        assert_eq!(fx.ctx.counters.downloaded(), data.len() as u64);

        // Everything we were sent is now on disk, byte for byte.
        let on_disk = std::fs::read(fx._dir.path().join("out.bin.download"))?;
        assert_eq!(on_disk, data);

        peer_tx.send(PeerCommand::Shutdown).await.ok();
        assert!(handle.await?.is_ok());
        Ok(())
    }

    // Scenario: the request window is capped, a mid-piece choke requeues all
    // in-flight requests, and the download resumes after unchoke.
    #[tokio::test]
    async fn test_choke_midpiece_requeues() -> anyhow::Result<()> {

        let piece_len = 8 * BLOCK_SIZE;
        let data = test_data(2 * piece_len);
        let mut fx = fixture(&data, piece_len, 0, false);
        let (mut wire, peer_tx, handle) = spawn_session(&fx, Bitfield::repeat(false, 2)).await;

        wire.send(Message::Bitfield(Bitfield::repeat(true, 2))).await?;
        wire.send(Message::Unchoke).await?;

        // One full window of requests, and not a single request more.
        assert_eq!(next_msg(&mut wire).await, Message::Interested);
        let mut first: Vec<BlockInfo> = Vec::new();
        for _ in 0..MAX_INFLIGHT {
            match next_msg(&mut wire).await {
                Message::Request(request) => first.push(request),
                msg => panic!("unexpected message: {}", msg),
            }
        }
        expect_silence(&mut wire).await;

        // Choke mid-piece: nothing further may be sent until unchoke.
        wire.send(Message::Choke).await?;
        expect_silence(&mut wire).await;

        // After unchoke the same window is re-requested, front of queue first.
        wire.send(Message::Unchoke).await?;
        let mut second = Vec::new();
        for _ in 0..MAX_INFLIGHT {
            match next_msg(&mut wire).await {
                Message::Request(request) => second.push(request),
                msg => panic!("unexpected message: {}", msg),
            }
        }
        assert_eq!(first, second);

        // Serve everything the session asks for until both pieces complete.
        for request in second {
            wire.send(serve_block(&data, piece_len, &request)).await?;
        }
        let mut done = Set::new();
        while done.len() < 2 {
            tokio::select! {
                cmd = fx.torrent_rx.recv() => match cmd {
                    Some(CommandToTorrent::Downloaded { idx }) => { done.insert(idx); },
                    _ => panic!("unexpected torrent command"),
                },
                msg = next_msg(&mut wire) => match msg {
                    Message::Request(request) => {
                        wire.send(serve_block(&data, piece_len, &request)).await?;
                    },
                    Message::NotInterested => {},
                    msg => panic!("unexpected message: {}", msg),
                },
            }
        }

        peer_tx.send(PeerCommand::Shutdown).await.ok();
        assert!(handle.await?.is_ok());
        Ok(())
    }

    // Scenario: a corrupt piece is discarded and re-requested; the good copy
    // then verifies and completes.
    #[tokio::test]
    async fn test_hash_mismatch_recovery() -> anyhow::Result<()> {

        let piece_len = BLOCK_SIZE;
        let data = test_data(2 * piece_len);
        let mut fx = fixture(&data, piece_len, 0, false);
        let (mut wire, peer_tx, handle) = spawn_session(&fx, Bitfield::repeat(false, 2)).await;

        wire.send(Message::Bitfield(Bitfield::repeat(true, 2))).await?;
        wire.send(Message::Unchoke).await?;

        let mut corrupted = false;
        let mut done = Set::new();
        while done.len() < 2 {
            tokio::select! {
                cmd = fx.torrent_rx.recv() => match cmd {
                    Some(CommandToTorrent::Downloaded { idx }) => { done.insert(idx); },
                    _ => panic!("unexpected torrent command"),
                },
                msg = next_msg(&mut wire) => match msg {
                    Message::Request(request) => {
                        if request.piece_idx == 1 && !corrupted {
                            // First answer for piece 1 is garbage.
                            corrupted = true;
                            wire.send(Message::Block(BlockData {
                                piece_idx: 1,
                                offset: 0,
                                data: vec![0xff; request.len],
                            })).await?;
                        } else {
                            wire.send(serve_block(&data, piece_len, &request)).await?;
                        }
                    },
                    Message::Interested | Message::NotInterested => {},
                    msg => panic!("unexpected message: {}", msg),
                },
            }
        }

        assert!(corrupted, "corrupt block was never requested");
        let on_disk = std::fs::read(fx._dir.path().join("out.bin.download"))?;
        assert_eq!(on_disk, data);

        peer_tx.send(PeerCommand::Shutdown).await.ok();
        assert!(handle.await?.is_ok());
        Ok(())
    }

    // Scenario: the coordinator broadcasts have(idx) for a piece this
    // session is fetching; in-flight requests are cancelled and the have is
    // forwarded to the remote.
    #[tokio::test]
    async fn test_broadcast_cancels_duplicate_work() -> anyhow::Result<()> {

        let piece_len = BLOCK_SIZE;
        let data = test_data(8 * piece_len);
        let fx = fixture(&data, piece_len, 0, false);
        let (mut wire, peer_tx, handle) = spawn_session(&fx, Bitfield::repeat(false, 8)).await;

        // The remote only offers piece 5.
        let mut bitfield = Bitfield::repeat(false, 8);
        bitfield.set(5, true);
        wire.send(Message::Bitfield(bitfield)).await?;
        wire.send(Message::Unchoke).await?;

        assert_eq!(next_msg(&mut wire).await, Message::Interested);
        let request = match next_msg(&mut wire).await {
            Message::Request(request) => request,
            msg => panic!("unexpected message: {}", msg),
        };
        assert_eq!(request.piece_idx, 5);

        // Another peer finished piece 5 first.
        peer_tx.send(PeerCommand::Have(5)).await?;

        assert_eq!(next_msg(&mut wire).await, Message::Cancel(request));
        assert_eq!(next_msg(&mut wire).await, Message::Have { idx: 5 });
        assert_eq!(next_msg(&mut wire).await, Message::NotInterested);
        expect_silence(&mut wire).await;

        peer_tx.send(PeerCommand::Shutdown).await.ok();
        assert!(handle.await?.is_ok());
        Ok(())
    }

    // Serving side: an interested peer is unchoked, served within the
    // allowance, then choked once the budget is spent.
    #[tokio::test]
    async fn test_serves_within_allowance() -> anyhow::Result<()> {

        let piece_len = 2 * BLOCK_SIZE;
        let data = test_data(2 * piece_len);
        // Budget below one block: the first served block exhausts it.
        let fx = fixture(&data, piece_len, (BLOCK_SIZE as u64 / 10).saturating_sub(1), true);
        let (mut wire, peer_tx, handle) = spawn_session(&fx, Bitfield::repeat(true, 2)).await;

        match next_msg(&mut wire).await {
            Message::Bitfield(bitfield) => assert_eq!(bitfield.count_ones(), 2),
            msg => panic!("unexpected message: {}", msg),
        }
        assert_eq!(next_msg(&mut wire).await, Message::Unchoke);

        wire.send(Message::Interested).await?;
        wire.send(Message::Request(BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE })).await?;
        wire.send(Message::Request(BlockInfo { piece_idx: 1, offset: 0, len: BLOCK_SIZE })).await?;

        match next_msg(&mut wire).await {
            Message::Block(block) => {
                assert_eq!(block.piece_idx, 0);
                assert_eq!(block.data, &data[..BLOCK_SIZE]);
            },
            msg => panic!("unexpected message: {}", msg),
        }
        // Allowance spent: choked before the second request is answered.
        assert_eq!(next_msg(&mut wire).await, Message::Choke);
        assert_eq!(fx.ctx.counters.uploaded(), BLOCK_SIZE as u64);
        expect_silence(&mut wire).await;

        peer_tx.send(PeerCommand::Shutdown).await.ok();
        assert!(handle.await?.is_ok());
        Ok(())
    }
}
