pub(crate) mod codec;

use {
    futures::{
        select,
        stream::{Fuse, SplitSink},
        SinkExt, StreamExt,
    },
    std::{
        collections::VecDeque,
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{
        net::TcpStream,
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        time::{interval, Instant},
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{
        counter::{Rate, Tally},
        disk::{BlockRead, BlockResultReceiver, BlockResultSender},
        download::PieceDownload,
        error::*,
        torrent::{self, TorrentContext},
        Bitfield, BlockInfo, PeerId, BLOCK_LEN,
    },
    codec::*,
};

/// If a peer has sent nothing for this long, the connection is dropped.
const INACTIVITY_LIMIT: Duration = Duration::from_secs(240);

/// If we have sent nothing for this long, a keep alive is sent.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// If a request has been outstanding for this long without any block
/// arriving, the peer is considered to be snubbing us.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// The bounds on the request pipeline length.
const MIN_REQUEST_QUEUE_LEN: usize = 2;
const MAX_REQUEST_QUEUE_LEN: usize = 512;

pub(crate) struct PeerSession {
    /// Shared information and subsystems of the torrent.
    ctx: Arc<TorrentContext>,
    /// The port on which the peer session receives commands from its
    /// torrent.
    cmd_port: Fuse<Receiver>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// Session state readable by the torrent (transfer totals, interest,
    /// snub and choke state), fed into the choke cycle.
    shared: Arc<SessionShared>,
    /// Session related status information.
    status: Status,
    /// Information about the peer that is set after a successful handshake.
    peer: Option<PeerInfo>,

    /// Our pending requests that we sent to the peer, with the time each
    /// was sent. If we receive a block that is not in this list, it is
    /// dropped; if the entry is here, it is removed.
    ///
    /// Since the Fast extension is not supported, this is emptied when
    /// we're choked, as in that case we don't expect outstanding requests
    /// to be served.
    outgoing_requests: Vec<OutgoingRequest>,
    /// The peer's requests that we have accepted but whose blocks are still
    /// being fetched from disk.
    incoming_requests: VecDeque<BlockInfo>,
    /// Blocks read off disk, waiting for upload throttle tokens.
    pending_uploads: VecDeque<BlockRead>,
    /// Upload throttle tokens already acquired but not yet spent.
    upload_budget: usize,
    /// Download throttle tokens already acquired but not yet committed to
    /// a request.
    download_budget: usize,

    /// The channel on which the disk task answers our block reads; the
    /// sender half is attached to every read command.
    block_read_chan: BlockResultSender,
    block_read_port: Fuse<BlockResultReceiver>,

    /// Transfer rates over this connection, for sizing the request pipeline
    /// and for the torrent's choke ranking.
    down: Rate,
    up: Rate,
    /// When the peer last sent us anything and when we last sent the peer
    /// anything, for the keep alive and inactivity logic.
    last_incoming: Instant,
    last_outgoing: Instant,
}

impl PeerSession {
    /// Creates a new session with the peer at the given address. The
    /// returned sender is the torrent's command channel to the session.
    pub fn new(
        ctx: Arc<TorrentContext>,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (block_read_chan, block_read_port) = mpsc::unbounded_channel();
        let now = Instant::now();
        (
            Self {
                ctx,
                cmd_port: cmd_port.fuse(),
                addr,
                shared: Arc::new(SessionShared::default()),
                status: Status::default(),
                peer: None,
                outgoing_requests: Vec::new(),
                incoming_requests: VecDeque::new(),
                pending_uploads: VecDeque::new(),
                upload_budget: 0,
                download_budget: 0,
                block_read_chan,
                block_read_port: block_read_port.fuse(),
                down: Rate::new(),
                up: Rate::new(),
                last_incoming: now,
                last_outgoing: now,
            },
            cmd_chan,
        )
    }

    /// The state the torrent reads when ranking peers.
    pub fn shared(&self) -> Arc<SessionShared> {
        Arc::clone(&self.shared)
    }

    /// Opens an outbound connection to the peer, performs the handshake,
    /// and runs the session until the connection is closed or an error
    /// occurs. The session's shared state is released before returning.
    pub async fn start_outbound(&mut self) -> Result<()> {
        let result = self.connect_and_run().await;
        self.cleanup().await;
        result
    }

    async fn connect_and_run(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let socket = TcpStream::connect(self.addr).await?;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.status.state = State::Handshaking;
        let handshake =
            Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        log::debug!("Sending handshake to peer {}", self.addr);
        self.shared.tally.add_up(HANDSHAKE_LEN as u64);
        socket.send(handshake).await?;

        log::debug!("Waiting for peer {} handshake", self.addr);
        if let Some(peer_handshake) = socket.next().await {
            let peer_handshake = peer_handshake?;
            self.check_handshake(&peer_handshake)?;
            self.on_handshake_done(peer_handshake);
            self.run(socket).await
        } else {
            log::info!("Peer {} closed before handshaking", self.addr);
            Err(Error::ConnectionTimeout)
        }
    }

    /// Runs the session over a socket on which the engine has already read
    /// the peer's handshake (an incoming connection). Our side of the
    /// handshake is sent from here. The session's shared state is released
    /// before returning.
    pub async fn start_inbound(
        &mut self,
        socket: Framed<TcpStream, HandshakeCodec>,
        peer_handshake: Handshake,
    ) -> Result<()> {
        let result = self.answer_and_run(socket, peer_handshake).await;
        self.cleanup().await;
        result
    }

    async fn answer_and_run(
        &mut self,
        mut socket: Framed<TcpStream, HandshakeCodec>,
        peer_handshake: Handshake,
    ) -> Result<()> {
        self.status.state = State::Handshaking;
        self.check_handshake(&peer_handshake)?;

        let handshake =
            Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        log::debug!("Sending handshake to peer {}", self.addr);
        self.shared.tally.add_up(HANDSHAKE_LEN as u64);
        socket.send(handshake).await?;

        self.on_handshake_done(peer_handshake);
        self.run(socket).await
    }

    fn check_handshake(&self, peer_handshake: &Handshake) -> Result<()> {
        // codec should only return handshake if the protocol string in it
        // is valid
        debug_assert_eq!(peer_handshake.prot, *PROTOCOL_STRING.as_bytes());

        if peer_handshake.info_hash == [0; 20]
            || peer_handshake.info_hash != self.ctx.info_hash
        {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(Error::InvalidPeerInfoHash);
        }
        // a connection to ourselves is useless and would confuse the
        // duplicate detection
        if peer_handshake.peer_id == self.ctx.client_id {
            log::info!("Peer {} is ourselves", self.addr);
            return Err(Error::OwnConnection);
        }
        Ok(())
    }

    fn on_handshake_done(&mut self, peer_handshake: Handshake) {
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
        self.shared.tally.add_down(HANDSHAKE_LEN as u64);
        self.peer = Some(PeerInfo {
            id: peer_handshake.peer_id,
            pieces: Bitfield::repeat(false, self.ctx.storage.piece_count),
        });
        self.status.state = State::AvailabilityExchange;
        log::info!(
            "Peer {} session state: {:?}",
            self.addr,
            self.status.state
        );
    }

    /// Runs the session after the handshakes are exchanged.
    ///
    /// This is the main session "loop" and performs the core of the session
    /// logic: exchange of messages, timeout logic, etc. On return, whether
    /// by error or by shutdown command, the session's reservations and
    /// availability registrations are released.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, HandshakeCodec>,
    ) -> Result<()> {
        // now that we have the handshake, we need to switch to the peer
        // message codec (keeping the read buffer from the handshake codec,
        // as the peer may have pipelined messages behind its handshake)
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        // if we have anything, announce it to the peer right away
        let own_pieces = {
            let piece_picker = self.ctx.piece_picker.read().await;
            let own_pieces = piece_picker.own_pieces();
            if own_pieces.any() {
                Some(own_pieces.clone())
            } else {
                None
            }
        };
        if let Some(own_pieces) = own_pieces {
            log::debug!("Sending bitfield to peer {}", self.addr);
            self.send(&mut sink, Message::Bitfield(own_pieces)).await?;
        }

        // tell the torrent the peer is fully connected; it may decide the
        // connection is a duplicate and shut us down
        let _ = self.ctx.chan.send(torrent::Message::PeerConnected {
            addr: self.addr,
            id: self.peer.as_ref().map(|p| p.id).expect("no handshake"),
        });

        self.event_loop(&mut sink, &mut stream).await
    }

    async fn event_loop(
        &mut self,
        sink: &mut Sink,
        stream: &mut Fuse<
            futures::stream::SplitStream<Framed<TcpStream, PeerCodec>>,
        >,
    ) -> Result<()> {
        let mut tick = interval(Duration::from_secs(1)).fuse();

        loop {
            select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        None => {
                            log::info!("Peer {} closed connection", self.addr);
                            return Ok(());
                        }
                    };
                    self.last_incoming = Instant::now();
                    log::debug!(
                        "Received message {:?} from peer {}",
                        msg.id(),
                        self.addr
                    );
                    let wire_len = msg.wire_len();
                    self.shared.tally.add_down(wire_len);

                    if self.status.state == State::AvailabilityExchange {
                        // the bitfield message may only be the very first
                        // message after the handshake
                        if let Message::Bitfield(bitfield) = msg {
                            self.handle_bitfield_msg(sink, bitfield).await?;
                        } else {
                            // no bitfield: the peer starts with nothing
                            self.status.state = State::Connected;
                            self.handle_msg(sink, msg).await?;
                        }
                        if self.status.state == State::AvailabilityExchange {
                            self.status.state = State::Connected;
                        }
                    } else {
                        self.handle_msg(sink, msg).await?;
                    }
                }
                read = self.block_read_port.select_next_some() => {
                    match read {
                        Ok(block) => {
                            // the request may have been cancelled (or the
                            // peer choked) while the read was in flight
                            if self.incoming_requests.contains(&block.info) {
                                self.pending_uploads.push_back(block);
                                self.pump_uploads(sink).await?;
                            }
                        }
                        Err(e) => {
                            // a failed read only fails that request
                            log::warn!(
                                "Disk read error for peer {}: {}",
                                self.addr,
                                e
                            );
                        }
                    }
                }
                cmd = self.cmd_port.select_next_some() => {
                    if !self.handle_cmd(sink, cmd).await? {
                        log::info!("Shutting down peer {} session", self.addr);
                        return Ok(());
                    }
                }
                _ = tick.select_next_some() => {
                    self.tick(sink).await?;
                }
            }
        }
    }

    /// Handles the bitfield message expected in the availability exchange
    /// state.
    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut Sink,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        debug_assert_eq!(self.status.state, State::AvailabilityExchange);
        log::debug!("Handling peer {} Bitfield message", self.addr);
        log::trace!("Bitfield: {:?}", bitfield);

        // The bitfield raw data that is sent over the wire may be longer
        // than the logical pieces it represents if the piece count is not
        // a multiple of 8, so we need to slice off the padding.
        if bitfield.len() < self.ctx.storage.piece_count {
            return Err(Error::ProtocolViolation("bitfield too short"));
        }
        bitfield.resize(self.ctx.storage.piece_count, false);

        // register the peer's pieces with the piece picker
        let is_interested = self
            .ctx
            .piece_picker
            .write()
            .await
            .register_availability(&bitfield)?;
        if let Some(peer) = &mut self.peer {
            peer.pieces = bitfield;
        }

        if is_interested {
            self.make_interested(sink).await?;
        }

        Ok(())
    }

    /// Handles messages expected in the `Connected` state.
    async fn handle_msg(
        &mut self,
        sink: &mut Sink,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(_) => {
                log::info!(
                    "Peer {} sent bitfield message not after handshake",
                    self.addr
                );
                return Err(Error::ProtocolViolation(
                    "bitfield may only directly follow the handshake",
                ));
            }
            Message::KeepAlive => {
                log::debug!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    // since we're choked we don't expect our pending
                    // requests to be served, so release the reservations
                    self.free_reservations().await;
                    self.outgoing_requests.clear();
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    // now that we are allowed to request blocks, fill the
                    // request pipeline if we're interested
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                    self.shared
                        .is_peer_interested
                        .store(true, Ordering::Relaxed);
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                    self.shared
                        .is_peer_interested
                        .store(false, Ordering::Relaxed);
                }
            }
            Message::Have { piece_index } => {
                self.handle_have_msg(sink, piece_index).await?;
            }
            Message::Request(block) => {
                self.handle_request_msg(block).await?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block_info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block_msg(block_info, data).await?;

                // we may be able to make more requests now that a block
                // has arrived
                self.make_requests(sink).await?;
            }
            Message::Cancel(block) => {
                log::debug!("Peer {} canceled request {}", self.addr, block);
                self.incoming_requests.retain(|b| *b != block);
                self.pending_uploads.retain(|b| b.info != block);
            }
        }

        Ok(())
    }

    async fn handle_have_msg(
        &mut self,
        sink: &mut Sink,
        piece_index: usize,
    ) -> Result<()> {
        log::debug!("Peer {} has piece {}", self.addr, piece_index);
        if piece_index >= self.ctx.storage.piece_count {
            return Err(Error::ProtocolViolation(
                "have message with invalid piece index",
            ));
        }

        let peer = self.peer.as_mut().expect("no handshake");
        // a have for a piece the bitfield already covered is harmless
        if peer.pieces[piece_index] {
            return Ok(());
        }
        peer.pieces.set(piece_index, true);

        let is_wanted = self
            .ctx
            .piece_picker
            .write()
            .await
            .register_have(piece_index)?;
        if is_wanted && !self.status.is_interested {
            self.make_interested(sink).await?;
            if !self.status.is_choked {
                self.make_requests(sink).await?;
            }
        }
        Ok(())
    }

    /// Validates and queues a peer's block request. The data is fetched
    /// from the disk task and sent once it arrives and the upload throttle
    /// permits.
    async fn handle_request_msg(&mut self, block: BlockInfo) -> Result<()> {
        log::debug!("Peer {} requested {}", self.addr, block);

        // a request while choked is ignored (it most likely raced with our
        // choke message), but a malformed one closes the connection
        let piece_count = self.ctx.storage.piece_count;
        if block.piece_index >= piece_count
            || !block.is_valid(
                self.ctx
                    .storage
                    .piece_len(block.piece_index)
                    .expect("piece index validated"),
            )
        {
            return Err(Error::ProtocolViolation("invalid block request"));
        }
        // the peer may only request pieces we actually announced
        if !self.ctx.piece_picker.read().await.own_pieces()
            [block.piece_index]
        {
            return Err(Error::ProtocolViolation(
                "request for a piece we don't have",
            ));
        }
        if self.status.is_peer_choked {
            log::debug!(
                "Peer {} requested {} while choked",
                self.addr,
                block
            );
            return Ok(());
        }

        if self.incoming_requests.contains(&block)
            || self.pending_uploads.iter().any(|b| b.info == block)
        {
            return Ok(());
        }

        self.incoming_requests.push_back(block);
        self.ctx.disk.read_block(
            self.ctx.id,
            block,
            self.block_read_chan.clone(),
        )?;
        Ok(())
    }

    /// Verifies block validity, registers the download and hands the block
    /// to the disk task, and updates the download statistics.
    async fn handle_block_msg(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::debug!("Received block from peer {}: {}", self.addr, block_info);

        // find the block in the list of pending requests
        let block_pos = match self
            .outgoing_requests
            .iter()
            .position(|r| r.block == block_info)
        {
            Some(pos) => pos,
            None => {
                log::warn!(
                    "Peer {} sent not requested block: {}",
                    self.addr,
                    block_info,
                );
                // silently ignore the block if we didn't expect it
                return Ok(());
            }
        };
        self.outgoing_requests.remove(block_pos);

        // a block arriving proves the peer isn't snubbing us
        self.shared.is_snubbed.store(false, Ordering::Relaxed);
        self.down.add(data.len() as u64);
        self.shared.tally.add_down_payload(data.len() as u64);

        // mark the block received with its piece's download instance
        let mut downloads = self.ctx.downloads.write().await;
        let download = match downloads.get_mut(&block_info.piece_index) {
            Some(download) => download,
            None => {
                // the piece completed through other peers and was verified
                // before this (endgame) duplicate arrived
                log::debug!(
                    "Block {} for already completed piece, dropping",
                    block_info
                );
                return Ok(());
            }
        };

        match download.received_block(&block_info, self.addr) {
            Some(duplicate_holders) => {
                if download.is_complete() {
                    log::info!(
                        "Piece {} fully received, awaiting hash check",
                        block_info.piece_index
                    );
                }

                // save the block to disk by sending a write command to the
                // disk task
                self.ctx.disk.write_block(
                    self.ctx.id,
                    block_info,
                    data,
                )?;

                // tell the torrent to cancel the losing duplicate requests
                if !duplicate_holders.is_empty() {
                    let _ =
                        self.ctx.chan.send(torrent::Message::CancelBlock {
                            block: block_info,
                            peers: duplicate_holders,
                        });
                }
            }
            None => {
                // another peer won the endgame race for this block; drop
                // the data without writing it
                log::debug!("Block {} already received, dropping", block_info);
            }
        }

        Ok(())
    }

    /// Fills the session's download pipeline with the optimal number of
    /// requests.
    ///
    /// The pipeline is sized from the observed download rate (bandwidth
    /// delay product with a one second window), clamped between 2 and 512
    /// outstanding requests. In-progress pieces the peer has are continued
    /// first, fewest missing blocks first, so pieces get finished rather
    /// than proliferate; only then are new pieces started, rarest first.
    async fn make_requests(&mut self, sink: &mut Sink) -> Result<()> {
        if self.status.is_choked || !self.status.is_interested {
            return Ok(());
        }
        log::trace!("Making requests to peer {}", self.addr);

        let peer_pieces = match &self.peer {
            Some(peer) => peer.pieces.clone(),
            None => return Ok(()),
        };
        let in_endgame = self.ctx.in_endgame.load(Ordering::Relaxed);

        let mut blocks = Vec::new();
        let mut target = self.status.best_request_queue_len;

        // every request commits us to receiving a block, so the download
        // throttle paces how many we may have outstanding
        let want = target.saturating_sub(self.outgoing_requests.len())
            * BLOCK_LEN as usize;
        if want > self.download_budget {
            self.download_budget += self
                .ctx
                .download_throttle
                .acquire(want - self.download_budget);
        }
        target = target.min(
            self.outgoing_requests.len()
                + self.download_budget / BLOCK_LEN as usize,
        );

        {
            let mut downloads = self.ctx.downloads.write().await;

            // continue the piece downloads this peer can contribute to,
            // the ones closest to completion first
            let mut in_progress: Vec<_> = downloads
                .values_mut()
                .filter(|d| peer_pieces[d.piece_index()])
                .collect();
            in_progress.sort_by_key(|d| d.count_missing());

            for download in in_progress {
                let outstanding =
                    self.outgoing_requests.len() + blocks.len();
                if outstanding >= target {
                    break;
                }
                download.pick_blocks(
                    target - outstanding,
                    self.addr,
                    in_endgame,
                    &mut blocks,
                );
            }

            // then start new piece downloads while there is capacity
            loop {
                let outstanding =
                    self.outgoing_requests.len() + blocks.len();
                if outstanding >= target {
                    break;
                }

                let mut piece_picker = self.ctx.piece_picker.write().await;
                if let Some(index) =
                    piece_picker.pick_piece(&peer_pieces, in_endgame)
                {
                    log::debug!(
                        "Session {} starting piece {} download",
                        self.addr,
                        index
                    );
                    let download =
                        downloads.entry(index).or_insert_with(|| {
                            PieceDownload::new(
                                index,
                                self.ctx
                                    .storage
                                    .piece_len(index)
                                    .expect("picked piece out of range"),
                            )
                        });
                    download.pick_blocks(
                        target - outstanding,
                        self.addr,
                        in_endgame,
                        &mut blocks,
                    );
                } else {
                    log::trace!(
                        "Could not pick more pieces from peer {}",
                        self.addr
                    );
                    break;
                }
            }
        }

        // save the current volley of requests and make them
        let now = Instant::now();
        for block in blocks {
            self.download_budget = self
                .download_budget
                .saturating_sub(BLOCK_LEN as usize);
            self.outgoing_requests.push(OutgoingRequest {
                block,
                requested_at: now,
            });
            self.send(sink, Message::Request(block)).await?;
        }

        Ok(())
    }

    /// Handles a command from the torrent. Returns false if the session
    /// should shut down.
    async fn handle_cmd(
        &mut self,
        sink: &mut Sink,
        cmd: Command,
    ) -> Result<bool> {
        match cmd {
            Command::PieceCompleted(piece_index) => {
                // announce the piece, except to a peer that already told us
                // it has it
                let peer_has = self
                    .peer
                    .as_ref()
                    .map(|p| p.pieces[piece_index])
                    .unwrap_or(false);
                if !peer_has {
                    self.send(sink, Message::Have { piece_index }).await?;
                }

                // our own requests for the piece are now pointless
                let piece_requests: Vec<_> = self
                    .outgoing_requests
                    .iter()
                    .map(|r| r.block)
                    .filter(|b| b.piece_index == piece_index)
                    .collect();
                for block in piece_requests {
                    self.outgoing_requests.retain(|r| r.block != block);
                    self.send(sink, Message::Cancel(block)).await?;
                }

                // perhaps that was the last piece we wanted from the peer
                if self.status.is_interested {
                    let piece_picker = self.ctx.piece_picker.read().await;
                    if let Some(peer) = &self.peer {
                        if !piece_picker.is_interested_in(&peer.pieces) {
                            drop(piece_picker);
                            self.status.is_interested = false;
                            self.send(sink, Message::NotInterested).await?;
                        }
                    }
                }
            }
            Command::Choke => {
                if !self.status.is_peer_choked {
                    log::debug!("Choking peer {}", self.addr);
                    self.status.is_peer_choked = true;
                    self.shared
                        .is_peer_unchoked
                        .store(false, Ordering::Relaxed);
                    // drop the peer's upload reservations
                    self.incoming_requests.clear();
                    self.pending_uploads.clear();
                    self.send(sink, Message::Choke).await?;
                }
            }
            Command::Unchoke => {
                if self.status.is_peer_choked {
                    log::debug!("Unchoking peer {}", self.addr);
                    self.status.is_peer_choked = false;
                    self.shared
                        .is_peer_unchoked
                        .store(true, Ordering::Relaxed);
                    self.send(sink, Message::Unchoke).await?;
                }
            }
            Command::Cancel(block) => {
                // the endgame race for the block was lost; withdraw our
                // request if it's still outstanding
                let was_outstanding = self
                    .outgoing_requests
                    .iter()
                    .any(|r| r.block == block);
                if was_outstanding {
                    self.outgoing_requests.retain(|r| r.block != block);
                    self.send(sink, Message::Cancel(block)).await?;
                }
            }
            Command::Shutdown => {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The session's once a second maintenance: keep alives, timeouts, snub
    /// detection, request pipeline resizing, and upload pumping.
    async fn tick(&mut self, sink: &mut Sink) -> Result<()> {
        let now = Instant::now();

        if now.saturating_duration_since(self.last_incoming)
            >= INACTIVITY_LIMIT
        {
            log::info!("Peer {} inactive, closing", self.addr);
            return Err(Error::ConnectionTimeout);
        }
        if now.saturating_duration_since(self.last_outgoing)
            >= KEEP_ALIVE_INTERVAL
        {
            self.send(sink, Message::KeepAlive).await?;
        }

        // a request aging past the limit without any block arriving means
        // the peer is snubbing us
        let oldest_request = self
            .outgoing_requests
            .iter()
            .map(|r| r.requested_at)
            .min();
        if let Some(oldest) = oldest_request {
            if now.saturating_duration_since(oldest) >= REQUEST_TIMEOUT {
                if !self.shared.is_snubbed.swap(true, Ordering::Relaxed) {
                    log::info!("Peer {} is snubbing us", self.addr);
                }
            }
        }

        // keep the pipeline matched to the link's bandwidth delay product
        let rate = self.down.avg();
        self.status.best_request_queue_len = ((rate / BLOCK_LEN as u64)
            as usize)
            .max(MIN_REQUEST_QUEUE_LEN)
            .min(MAX_REQUEST_QUEUE_LEN);

        self.pump_uploads(sink).await?;
        self.make_requests(sink).await?;

        Ok(())
    }

    /// Sends as many queued upload blocks as the upload throttle currently
    /// permits. Control messages don't pass through here, so they are never
    /// stuck behind block data.
    async fn pump_uploads(&mut self, sink: &mut Sink) -> Result<()> {
        while let Some(front) = self.pending_uploads.front() {
            if self.status.is_peer_choked {
                return Ok(());
            }

            let len = front.data.len();
            if self.upload_budget < len {
                self.upload_budget +=
                    self.ctx.upload_throttle.acquire(len - self.upload_budget);
            }
            if self.upload_budget < len {
                // out of tokens, try again on the next tick
                return Ok(());
            }
            self.upload_budget -= len;

            let block = self.pending_uploads.pop_front().expect("peeked");
            self.incoming_requests.retain(|b| *b != block.info);

            log::debug!(
                "Uploading block {} to peer {}",
                block.info,
                self.addr
            );
            self.up.add(len as u64);
            self.shared.tally.add_up_payload(len as u64);
            self.send(
                sink,
                Message::Block {
                    piece_index: block.info.piece_index,
                    offset: block.info.offset,
                    data: block.data.to_vec(),
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn make_interested(&mut self, sink: &mut Sink) -> Result<()> {
        if !self.status.is_interested {
            log::info!("Interested in peer {}", self.addr);
            self.status.is_interested = true;
            self.send(sink, Message::Interested).await?;
        }
        Ok(())
    }

    async fn send(&mut self, sink: &mut Sink, msg: Message) -> Result<()> {
        self.shared.tally.add_up(msg.wire_len());
        self.last_outgoing = Instant::now();
        sink.send(msg).await?;
        Ok(())
    }

    /// Releases everything the session holds in the torrent's shared state:
    /// block reservations, piece availability, and pending piece claims.
    async fn cleanup(&mut self) {
        log::info!(
            "Peer {} session ended: {}/{} payload bytes down/up, \
            {}/{} wire bytes",
            self.addr,
            self.down.total(),
            self.up.total(),
            self.shared.tally.down(),
            self.shared.tally.up()
        );

        {
            let mut downloads = self.ctx.downloads.write().await;
            let mut piece_picker = self.ctx.piece_picker.write().await;
            for download in downloads.values_mut() {
                download.free_peer_blocks(self.addr);
                if !download.has_active_requests() {
                    // let other sessions pick the piece up again
                    piece_picker.release_piece(download.piece_index());
                }
            }
            if let Some(peer) = &self.peer {
                piece_picker.unregister_availability(&peer.pieces);
            }
        }
        self.outgoing_requests.clear();

        let _ = self
            .ctx
            .chan
            .send(torrent::Message::PeerDisconnected { addr: self.addr });
    }

    /// Releases our block reservations after the peer choked us.
    async fn free_reservations(&mut self) {
        let mut downloads = self.ctx.downloads.write().await;
        for request in self.outgoing_requests.iter() {
            if let Some(download) =
                downloads.get_mut(&request.block.piece_index)
            {
                download.free_peer_blocks(self.addr);
            }
        }
    }
}

type Sink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

/// The channel on which the torrent sends commands to a peer session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive from its torrent.
#[derive(Debug)]
pub(crate) enum Command {
    /// The torrent completed and verified the piece: announce it with
    /// a have message (unless the peer has it) and cancel our own requests
    /// for it.
    PieceCompleted(usize),
    /// Stop serving the peer (a choke cycle decision).
    Choke,
    /// Start serving the peer.
    Unchoke,
    /// Withdraw our request for the block; another peer delivered it first.
    Cancel(BlockInfo),
    /// Eventually shut down the peer session.
    Shutdown,
}

/// A request we sent to the peer and when we sent it.
struct OutgoingRequest {
    block: BlockInfo,
    requested_at: Instant,
}

/// Session state shared with the torrent: the torrent's choke cycle reads
/// these without having to call into the session task.
#[derive(Debug, Default)]
pub(crate) struct SessionShared {
    pub tally: SessionTally,
    pub is_peer_interested: AtomicBool,
    /// Whether we are currently serving the peer (i.e. not choking it).
    pub is_peer_unchoked: AtomicBool,
    pub is_snubbed: AtomicBool,
}

/// Transfer totals of a session: all wire bytes, and the subset that was
/// piece payload.
#[derive(Debug, Default)]
pub(crate) struct SessionTally {
    wire: Tally,
    payload: Tally,
}

impl SessionTally {
    fn add_down(&self, bytes: u64) {
        self.wire.add_down(bytes);
    }

    fn add_up(&self, bytes: u64) {
        self.wire.add_up(bytes);
    }

    fn add_down_payload(&self, bytes: u64) {
        self.payload.add_down(bytes);
    }

    fn add_up_payload(&self, bytes: u64) {
        self.payload.add_up(bytes);
    }

    /// Total bytes received over the connection, protocol chatter included.
    pub fn down(&self) -> u64 {
        self.wire.down()
    }

    pub fn up(&self) -> u64 {
        self.wire.up()
    }

    /// Piece payload bytes received over the connection.
    pub fn payload_down(&self) -> u64 {
        self.payload.down()
    }

    pub fn payload_up(&self) -> u64 {
        self.payload.up()
    }
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    is_peer_interested: bool,
    /// The request queue size, which is the number of block requests we
    /// keep outstanding to fully saturate the link.
    ///
    /// This is recalculated periodically from the running download rate
    /// average (approximating the bandwidth-delay product) so the link
    /// stays saturated without over-committing to one peer.
    best_request_queue_len: usize,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            best_request_queue_len: 4,
        }
    }
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// This state is optional, it is used to verify that the bitfield
    /// exchange occurrs after the handshake and not later. It is set once
    /// the handshakes are exchanged and changed as soon as we receive the
    /// bitfield or the first message that is not a bitfield. Any subsequent
    /// bitfield messages are rejected and the connection is dropped, as per
    /// the standard.
    AvailabilityExchange,
    /// This is the normal state of a peer session, in which any messages,
    /// apart from the 'handshake' and 'bitfield', may be exchanged.
    Connected,
}

/// The default (and initial) state of a peer session is `Disconnected`.
impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Information about the peer we're connected to.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    id: PeerId,
    /// All pieces peer has, updated when it announces to us a new piece.
    pieces: Bitfield,
}
