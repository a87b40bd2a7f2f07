//! The per-torrent owner.
//!
//! A torrent task owns everything with torrent scope: the content
//! bookkeeping, the peer sessions and the pool of known-but-unconnected
//! peers, the choke manager, the tracker groups and the announce schedule,
//! the resume check driver, and the endgame latch. Peer sessions and the
//! disk task report to it over its message channel; it commands sessions
//! over theirs. Everything that must not re-enter (hash verdicts, piece
//! completions) arrives as a message and is handled in this task, which
//! gives the ordering guarantees: a piece is marked done strictly before
//! its have broadcast, and the completion alert is emitted strictly after
//! the piece's download bookkeeping is cleaned up.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    ops::Range,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, UNIX_EPOCH},
};

use futures::{select, StreamExt};
use rand::Rng;
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        Mutex, RwLock,
    },
    task,
    time::{interval_at, Instant},
};
use tokio_util::codec::Framed;

use crate::{
    block_count,
    choker::{Candidate, ChokeManager},
    conf::TorrentConf,
    content::{Content, FilePriority},
    disk::{DiskHandle, NewTorrentError, ReadError, WriteError},
    download::PieceDownload,
    engine,
    error::*,
    metainfo::Metainfo,
    peer::{
        self,
        codec::{Handshake, HandshakeCodec},
        PeerSession, SessionShared,
    },
    piece_picker::PiecePicker,
    resume::{ResumeData, ResumeFile},
    storage_info::StorageInfo,
    throttle::Throttle,
    tracker::{Announce, AnnounceResponse, Event, PeerEntry, TrackerGroup, TrackerError},
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

/// How many piece verifications the resume check keeps in flight.
const HASH_CHECK_WINDOW: usize = 4;

/// The per peer pipeline depth assumed when deciding whether the endgame
/// threshold is crossed: endgame begins when fewer blocks are missing than
/// the connected peers could have in flight together.
const ENDGAME_PIPELINE_DEPTH: usize = 8;

/// How many bad pieces a peer may contribute to before it is disconnected.
const MAX_PEER_STRIKES: usize = 2;

pub(crate) type Sender = UnboundedSender<Message>;
pub(crate) type Receiver = UnboundedReceiver<Message>;

/// The messages a torrent task processes: reports from its peer sessions,
/// verdicts from the disk task, engine requests.
pub(crate) enum Message {
    /// The disk task allocated (or failed to allocate) the torrent's files.
    TorrentAllocation(Result<(), NewTorrentError>),
    /// A piece in the disk write buffer became complete and was hash
    /// checked (and written if valid).
    PieceCompletion(Result<PieceCompletion, WriteError>),
    /// The disk task re-checked a piece as part of the resume check.
    PieceVerified {
        piece_index: PieceIndex,
        result: Result<bool, ReadError>,
    },
    /// A session completed its handshake.
    PeerConnected { addr: SocketAddr, id: PeerId },
    /// A session ended, releasing its reservations beforehand.
    PeerDisconnected { addr: SocketAddr },
    /// A block arrived that other peers still have reserved (endgame):
    /// their requests should be cancelled.
    CancelBlock {
        block: BlockInfo,
        peers: Vec<SocketAddr>,
    },
    /// The engine accepted an incoming connection for this torrent and
    /// already read the peer's handshake.
    IncomingPeer {
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    },
    /// A spawned announce round finished.
    AnnounceResult(Result<AnnounceResponse, TrackerError>),
    /// The engine asks the torrent to stop.
    Shutdown,
}

/// The result of writing and hash checking a complete piece.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PieceCompletion {
    pub index: PieceIndex,
    pub is_valid: bool,
}

/// The torrent state shared with its peer sessions.
pub(crate) struct TorrentContext {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub storage: StorageInfo,
    /// The piece picker, shared by all sessions of the torrent.
    pub piece_picker: RwLock<PiecePicker>,
    /// The in-progress piece downloads, shared so a piece begun through one
    /// peer can be finished through another.
    pub downloads: RwLock<HashMap<PieceIndex, PieceDownload>>,
    pub disk: DiskHandle,
    /// The torrent task's message channel.
    pub chan: Sender,
    /// Latched when so few blocks remain that duplicate requests across
    /// peers are worth it; cleared on completion.
    pub in_endgame: AtomicBool,
    pub upload_throttle: Throttle,
    pub download_throttle: Throttle,
}

/// What the torrent needs to get started.
pub(crate) struct TorrentParams {
    pub id: TorrentId,
    pub metainfo: Metainfo,
    pub conf: TorrentConf,
    pub client_id: PeerId,
    /// The port our listener accepts peer connections on, announced to
    /// trackers.
    pub listen_port: u16,
    pub disk: DiskHandle,
    pub alert_chan: engine::AlertSender,
}

/// A connected (or connecting) peer session, from the torrent's side.
struct Peer {
    chan: peer::Sender,
    shared: Arc<SessionShared>,
    /// Set once the session reports its completed handshake.
    id: Option<PeerId>,
    is_outbound: bool,
    /// The session's payload totals at the last choke cycle, for rate
    /// differentiation.
    prev_payload: (u64, u64),
}

pub(crate) struct Torrent {
    conf: TorrentConf,
    ctx: Arc<TorrentContext>,
    content: Content,
    metainfo: Metainfo,
    msg_port: Option<Receiver>,
    alert_chan: engine::AlertSender,

    /// The connected sessions, keyed by remote address.
    peers: HashMap<SocketAddr, Peer>,
    /// Peers we know about but aren't connected to.
    available: AvailablePeers,
    choker: ChokeManager,
    /// Tracker tiers, shared with spawned announce rounds.
    trackers: Arc<Mutex<TrackerGroup>>,
    tracker_key: u32,
    listen_port: u16,

    /// Pieces that failed their hash check, per contributing peer.
    strikes: HashMap<SocketAddr, usize>,
    /// Payload totals of sessions that already disconnected, so announce
    /// figures stay monotonic.
    closed_sessions_payload: (u64, u64),

    /// Whether the `started` event was announced successfully.
    announced_start: bool,
    next_announce: Option<Instant>,
    announce_in_flight: bool,
    consecutive_announce_failures: usize,

    running: bool,
}

impl Torrent {
    /// Creates the torrent and its context. The returned sender is the
    /// channel the engine, the disk task, and the peer sessions use to
    /// reach the torrent.
    pub fn new(params: TorrentParams) -> Result<(Self, Sender)> {
        let TorrentParams {
            id,
            metainfo,
            conf,
            client_id,
            listen_port,
            disk,
            alert_chan,
        } = params;
        let conf = conf.clamped();

        let storage =
            StorageInfo::new(&metainfo, conf.download_dir.clone());

        let mut content = Content::new(metainfo.piece_len);
        for file in metainfo.files.iter() {
            content.add_file(file.path.clone(), file.len)?;
        }
        content.set_complete_hash(metainfo.piece_hashes.clone())?;
        content.set_root_dir(storage.download_dir.clone())?;

        let (chan, msg_port) = mpsc::unbounded_channel();
        let piece_count = storage.piece_count;
        let ctx = Arc::new(TorrentContext {
            id,
            info_hash: metainfo.info_hash,
            client_id,
            storage,
            piece_picker: RwLock::new(PiecePicker::new(Bitfield::repeat(
                false,
                piece_count,
            ))),
            downloads: RwLock::new(HashMap::new()),
            disk,
            chan: chan.clone(),
            in_endgame: AtomicBool::new(false),
            upload_throttle: Throttle::new(conf.upload_rate_limit),
            download_throttle: Throttle::new(conf.download_rate_limit),
        });

        let trackers =
            Arc::new(Mutex::new(TrackerGroup::new(metainfo.trackers.clone())));
        let max_uploads = conf.max_uploads;
        let max_peers = conf.max_peers;
        Ok((
            Self {
                conf,
                ctx,
                content,
                metainfo,
                msg_port: Some(msg_port),
                alert_chan,
                peers: HashMap::new(),
                available: AvailablePeers::new(max_peers),
                choker: ChokeManager::new(max_uploads),
                trackers,
                tracker_key: rand::thread_rng().gen(),
                listen_port,
                strikes: HashMap::new(),
                closed_sessions_payload: (0, 0),
                announced_start: false,
                next_announce: None,
                announce_in_flight: false,
                consecutive_announce_failures: 0,
                running: false,
            },
            chan,
        ))
    }

    /// Runs the torrent to completion: opens and allocates the content,
    /// performs the resume check, then downloads and seeds until shut down
    /// or a storage error stops it.
    pub async fn start(&mut self, resume: Option<ResumeData>) -> Result<()> {
        log::info!("Starting torrent {}", self.ctx.id);
        let mut msg_port = self.msg_port.take().expect("torrent restarted");
        self.content.open()?;

        let result = self.start_phases(&mut msg_port, resume).await;
        self.shutdown().await;
        result
    }

    async fn start_phases(
        &mut self,
        msg_port: &mut Receiver,
        resume: Option<ResumeData>,
    ) -> Result<()> {
        self.ctx.disk.allocate_new_torrent(
            self.ctx.id,
            self.ctx.storage.clone(),
            self.metainfo.piece_hashes.clone(),
            self.ctx.chan.clone(),
        )?;
        self.await_allocation(msg_port).await?;

        // resume data, if it checks out, seeds the bitfield and decides
        // which piece ranges must be re-verified; without it everything is
        // verified
        let check_ranges = self.load_resume(resume);
        if self.conf.files_check_wait > Duration::from_secs(0) {
            tokio::time::delay_for(self.conf.files_check_wait).await;
        }
        self.run_hash_check(msg_port, check_ranges).await?;

        // the picker mirrors the verified bitfield from here on
        self.rebuild_piece_picker().await;
        log::info!(
            "Torrent {} checked: {}/{} pieces, {} of {} bytes done",
            self.ctx.id,
            self.content.completed_count(),
            self.content.piece_count(),
            self.content.bytes_completed(),
            self.content.total_len()
        );

        self.running = true;
        self.next_announce = Some(Instant::now());
        self.run(msg_port).await
    }

    /// The main torrent loop: messages, the choke cycle, and the once a
    /// second maintenance pass (announce schedule, endgame latch, peer
    /// connecting).
    async fn run(&mut self, msg_port: &mut Receiver) -> Result<()> {
        let choke_cycle = self.conf.choke_cycle;
        let mut choke_tick =
            interval_at(Instant::now() + choke_cycle, choke_cycle).fuse();
        let mut tick = interval_at(
            Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .fuse();
        let mut msg_port = msg_port.fuse();

        while self.running {
            select! {
                msg = msg_port.next() => {
                    match msg {
                        Some(msg) => self.handle_msg(msg).await?,
                        None => {
                            // all senders (including our own context) gone
                            break;
                        }
                    }
                }
                _ = choke_tick.select_next_some() => {
                    self.choke_cycle();
                }
                _ = tick.select_next_some() => {
                    self.maintenance_tick().await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_msg(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::PieceCompletion(Ok(completion)) => {
                self.handle_piece_completion(completion).await?;
            }
            Message::PieceCompletion(Err(e)) => {
                log::error!(
                    "Torrent {} storage error: {}",
                    self.ctx.id,
                    e
                );
                return self.storage_error(e.to_string());
            }
            Message::PieceVerified { .. } => {
                // verification verdicts outside a check can only be stale
                // (e.g. a check aborted by shutdown); ignore them
                log::debug!("Ignoring stale piece verification");
            }
            Message::PeerConnected { addr, id } => {
                self.handle_peer_connected(addr, id);
            }
            Message::PeerDisconnected { addr } => {
                self.handle_peer_disconnected(addr).await;
            }
            Message::CancelBlock { block, peers } => {
                for addr in peers {
                    if let Some(peer) = self.peers.get(&addr) {
                        let _ = peer.chan.send(peer::Command::Cancel(block));
                    }
                }
            }
            Message::IncomingPeer { socket, handshake } => {
                self.handle_incoming_peer(socket, handshake);
            }
            Message::AnnounceResult(result) => {
                self.handle_announce_result(result);
            }
            Message::TorrentAllocation(_) => {
                log::warn!("Unexpected allocation message");
            }
            Message::Shutdown => {
                log::info!("Torrent {} shutting down", self.ctx.id);
                self.running = false;
            }
        }
        Ok(())
    }

    /// A verified piece: record it, clean up its download, announce it to
    /// every peer that doesn't have it, and if it was the last piece,
    /// finish the download. A failed piece is reset for re-download and
    /// its contributors are penalized.
    async fn handle_piece_completion(
        &mut self,
        completion: PieceCompletion,
    ) -> Result<()> {
        let index = completion.index;
        if completion.is_valid {
            // the delegator's bookkeeping is cleaned up before anything
            // observable happens
            self.ctx.downloads.write().await.remove(&index);
            self.ctx.piece_picker.write().await.received_piece(index);
            let is_complete = self.content.mark_done(index);

            log::info!(
                "Torrent {} piece {} done ({}/{})",
                self.ctx.id,
                index,
                self.content.completed_count(),
                self.content.piece_count()
            );

            // the piece is marked done before the have broadcast goes out
            for peer in self.peers.values() {
                let _ = peer.chan.send(peer::Command::PieceCompleted(index));
            }

            if is_complete {
                self.handle_download_complete();
            }
        } else {
            // hash failure: every block of the piece is re-downloaded, and
            // repeat offenders among its contributors are dropped
            log::warn!(
                "Torrent {} piece {} failed hash check",
                self.ctx.id,
                index
            );
            let contributors = {
                let mut downloads = self.ctx.downloads.write().await;
                match downloads.get_mut(&index) {
                    Some(download) => {
                        let contributors =
                            download.contributors().to_vec();
                        download.redo();
                        contributors
                    }
                    None => Vec::new(),
                }
            };
            self.ctx.piece_picker.write().await.redo_piece(index);

            for addr in contributors {
                let strikes = self.strikes.entry(addr).or_insert(0);
                *strikes += 1;
                if *strikes > MAX_PEER_STRIKES {
                    log::warn!(
                        "Disconnecting peer {} after {} bad pieces",
                        addr,
                        strikes
                    );
                    if let Some(peer) = self.peers.get(&addr) {
                        let _ = peer.chan.send(peer::Command::Shutdown);
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_download_complete(&mut self) {
        log::info!("Torrent {} download complete", self.ctx.id);
        self.ctx.in_endgame.store(false, Ordering::Relaxed);

        // tell the tracker and the caller; the alert goes out after the
        // last piece's cleanup above, so listeners observe a settled state
        self.spawn_announce(Some(Event::Completed));
        let _ = self.alert_chan.send(engine::Alert::TorrentCompleted {
            id: self.ctx.id,
        });
    }

    fn handle_peer_connected(&mut self, addr: SocketAddr, id: PeerId) {
        // detect a duplicate connection to the same peer: one of the two
        // connections is dropped, decided by lexicographic id order so both
        // sides drop the same one
        let duplicate = self
            .peers
            .iter()
            .find(|(other_addr, peer)| {
                **other_addr != addr && peer.id == Some(id)
            })
            .map(|(other_addr, peer)| (*other_addr, peer.is_outbound));

        if let Some((other_addr, other_is_outbound)) = duplicate {
            let new_is_outbound = self
                .peers
                .get(&addr)
                .map(|p| p.is_outbound)
                .unwrap_or(false);
            let keep_existing = prefer_existing(
                &self.ctx.client_id,
                &id,
                other_is_outbound,
                new_is_outbound,
            );
            let dropped = if keep_existing { addr } else { other_addr };
            log::info!(
                "Dropping duplicate connection {} to peer {:?}",
                dropped,
                String::from_utf8_lossy(&id)
            );
            if let Some(peer) = self.peers.get(&dropped) {
                let _ = peer.chan.send(peer::Command::Shutdown);
            }
            if dropped == addr {
                return;
            }
        }

        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.id = Some(id);
        }
        // keep the unchoked count at the cap now that the peer set changed
        self.choke_balance();
    }

    async fn handle_peer_disconnected(&mut self, addr: SocketAddr) {
        if let Some(peer) = self.peers.remove(&addr) {
            log::info!("Peer {} disconnected", addr);
            self.closed_sessions_payload.0 +=
                peer.shared.tally.payload_down();
            self.closed_sessions_payload.1 += peer.shared.tally.payload_up();
        }
        self.strikes.remove(&addr);
        self.choke_balance();
        self.connect_peers();
    }

    fn handle_incoming_peer(
        &mut self,
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    ) {
        let addr = match socket.get_ref().peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                log::debug!("Incoming peer with no address: {}", e);
                return;
            }
        };
        if self.peers.len() >= self.conf.max_peers {
            log::info!(
                "Refusing incoming peer {}: at the connection cap",
                addr
            );
            return;
        }
        if self.peers.contains_key(&addr) {
            log::info!("Refusing incoming peer {}: already connected", addr);
            return;
        }

        log::info!("Incoming peer connection {}", addr);
        let (mut session, cmd_chan) =
            PeerSession::new(Arc::clone(&self.ctx), addr);
        let shared = session.shared();
        task::spawn(async move {
            if let Err(e) = session.start_inbound(socket, handshake).await {
                log::debug!("Inbound peer {} session ended: {}", addr, e);
            }
        });
        self.peers.insert(
            addr,
            Peer {
                chan: cmd_chan,
                shared,
                id: None,
                is_outbound: false,
                prev_payload: (0, 0),
            },
        );
    }

    /// Opens outbound connections from the available pool until the torrent
    /// has its configured minimum of peers (or the pool runs dry).
    fn connect_peers(&mut self) {
        while self.peers.len() < self.conf.min_peers {
            let entry = match self.available.pop() {
                Some(entry) => entry,
                None => return,
            };
            if self.peers.contains_key(&entry.addr) {
                continue;
            }

            log::debug!("Connecting to peer {}", entry.addr);
            let (mut session, cmd_chan) =
                PeerSession::new(Arc::clone(&self.ctx), entry.addr);
            let shared = session.shared();
            let addr = entry.addr;
            task::spawn(async move {
                if let Err(e) = session.start_outbound().await {
                    log::debug!("Peer {} session ended: {}", addr, e);
                }
            });
            self.peers.insert(
                addr,
                Peer {
                    chan: cmd_chan,
                    shared,
                    id: entry.id,
                    is_outbound: true,
                    prev_payload: (0, 0),
                },
            );
        }
    }

    /// The full choke round: re-rank peers by their transfer rates over the
    /// past cycle and send out the resulting transitions.
    fn choke_cycle(&mut self) {
        let cycle_secs = self.conf.choke_cycle.as_secs().max(1);
        let seeding = self.content.is_complete();

        let mut candidates = Vec::with_capacity(self.peers.len());
        for (addr, peer) in self.peers.iter_mut() {
            let down = peer.shared.tally.payload_down();
            let up = peer.shared.tally.payload_up();
            let (prev_down, prev_up) = peer.prev_payload;
            peer.prev_payload = (down, up);

            // when leeching, generosity is repaid in download rate; when
            // seeding there is nothing to receive, so spread upload instead
            let rate = if seeding {
                up.saturating_sub(prev_up) / cycle_secs
            } else {
                down.saturating_sub(prev_down) / cycle_secs
            };
            candidates.push(Candidate {
                addr: *addr,
                is_interested: peer
                    .shared
                    .is_peer_interested
                    .load(Ordering::Relaxed),
                is_unchoked: peer
                    .shared
                    .is_peer_unchoked
                    .load(Ordering::Relaxed),
                is_snubbed: peer.shared.is_snubbed.load(Ordering::Relaxed),
                rate,
            });
        }

        let transitions = self.choker.cycle(&candidates);
        self.send_choke_transitions(transitions);
    }

    /// The cheap between-cycles pass keeping the unchoked count at the cap.
    fn choke_balance(&mut self) {
        let candidates: Vec<_> = self
            .peers
            .iter()
            .map(|(addr, peer)| Candidate {
                addr: *addr,
                is_interested: peer
                    .shared
                    .is_peer_interested
                    .load(Ordering::Relaxed),
                is_unchoked: peer
                    .shared
                    .is_peer_unchoked
                    .load(Ordering::Relaxed),
                is_snubbed: peer.shared.is_snubbed.load(Ordering::Relaxed),
                rate: 0,
            })
            .collect();
        let transitions = self.choker.balance(&candidates);
        self.send_choke_transitions(transitions);
    }

    fn send_choke_transitions(
        &mut self,
        transitions: crate::choker::Transitions,
    ) {
        for addr in transitions.unchoke {
            if let Some(peer) = self.peers.get(&addr) {
                let _ = peer.chan.send(peer::Command::Unchoke);
            }
        }
        for addr in transitions.choke {
            if let Some(peer) = self.peers.get(&addr) {
                let _ = peer.chan.send(peer::Command::Choke);
            }
        }
    }

    async fn maintenance_tick(&mut self) -> Result<()> {
        self.update_endgame().await;
        self.connect_peers();

        if let Some(at) = self.next_announce {
            if Instant::now() >= at && !self.announce_in_flight {
                let event = if self.announced_start {
                    None
                } else {
                    Some(Event::Started)
                };
                self.spawn_announce(event);
            }
        }
        Ok(())
    }

    /// Latches endgame when fewer blocks are missing than the connected
    /// peers could be serving at once. The latch only clears on completion.
    async fn update_endgame(&mut self) {
        if self.content.is_complete()
            || self.ctx.in_endgame.load(Ordering::Relaxed)
        {
            return;
        }

        let downloads = self.ctx.downloads.read().await;
        let pieces = self.content.pieces();
        let mut missing_blocks = 0;
        for index in 0..self.content.piece_count() {
            if pieces[index] {
                continue;
            }
            missing_blocks += match downloads.get(&index) {
                Some(download) => download.count_missing(),
                None => block_count(self.content.piece_len(index)),
            };
        }

        let threshold = self.peers.len() * ENDGAME_PIPELINE_DEPTH;
        if missing_blocks > 0 && missing_blocks <= threshold {
            log::info!(
                "Torrent {} entering endgame: {} blocks left",
                self.ctx.id,
                missing_blocks
            );
            self.ctx.in_endgame.store(true, Ordering::Relaxed);
        }
    }

    /// Spawns an announce round onto its own task so a slow tracker doesn't
    /// stall the torrent loop. The result comes back as a message.
    fn spawn_announce(&mut self, event: Option<Event>) {
        let trackers = Arc::clone(&self.trackers);
        let chan = self.ctx.chan.clone();
        let params = self.announce_params(event);
        self.announce_in_flight = true;
        // push the schedule out; the result handler will pull it back in
        self.next_announce =
            Some(Instant::now() + self.conf.announce_interval);

        task::spawn(async move {
            let mut trackers = trackers.lock().await;
            if trackers.is_empty() {
                return;
            }
            let result = trackers.announce(params).await;
            if result.is_err() {
                log::debug!(
                    "Tracker group retained failure: {:?}",
                    trackers.last_error()
                );
            }
            let _ = chan.send(Message::AnnounceResult(result));
        });
    }

    fn announce_params(&self, event: Option<Event>) -> Announce {
        let (downloaded, uploaded) = self.payload_totals();
        Announce {
            info_hash: self.ctx.info_hash,
            peer_id: self.ctx.client_id,
            key: self.tracker_key,
            port: self.listen_port,
            ip: None,
            uploaded,
            downloaded,
            left: self.content.bytes_left(),
            numwant: Some(
                self.conf.max_peers.saturating_sub(self.peers.len()),
            ),
            event,
        }
    }

    /// Payload transfer totals over the torrent's lifetime, living sessions
    /// and closed ones combined.
    fn payload_totals(&self) -> (u64, u64) {
        let (mut down, mut up) = self.closed_sessions_payload;
        for peer in self.peers.values() {
            down += peer.shared.tally.payload_down();
            up += peer.shared.tally.payload_up();
        }
        (down, up)
    }

    fn handle_announce_result(
        &mut self,
        result: Result<AnnounceResponse, TrackerError>,
    ) {
        self.announce_in_flight = false;
        match result {
            Ok(response) => {
                self.announced_start = true;
                self.consecutive_announce_failures = 0;

                let interval = response
                    .interval
                    .unwrap_or(self.conf.announce_interval)
                    .max(response.min_interval.unwrap_or_default());
                self.next_announce = Some(Instant::now() + interval);

                log::info!(
                    "Torrent {} announce returned {} peers",
                    self.ctx.id,
                    response.peers.len()
                );
                let client_id = self.ctx.client_id;
                let connected = &self.peers;
                self.available.extend(
                    response
                        .peers
                        .into_iter()
                        .filter(|p| !connected.contains_key(&p.addr))
                        .filter(|p| p.id != Some(client_id)),
                );
                self.connect_peers();
            }
            Err(e) => {
                self.consecutive_announce_failures += 1;
                log::warn!(
                    "Torrent {} announce failed ({} in a row): {}",
                    self.ctx.id,
                    self.consecutive_announce_failures,
                    e
                );
                if self.consecutive_announce_failures
                    >= self.conf.tracker_error_threshold
                {
                    // stop hammering the trackers; a fresh peer or an
                    // engine restart can revive announcing
                    self.next_announce = None;
                } else {
                    // back off linearly with the failure count
                    let backoff = Duration::from_secs(
                        30 * self.consecutive_announce_failures as u64,
                    );
                    self.next_announce = Some(Instant::now() + backoff);
                }
            }
        }
    }

    /// Waits for the disk task's verdict on the torrent's file allocation.
    async fn await_allocation(
        &mut self,
        msg_port: &mut Receiver,
    ) -> Result<()> {
        while let Some(msg) = msg_port.recv().await {
            match msg {
                Message::TorrentAllocation(Ok(())) => {
                    log::info!("Torrent {} allocated", self.ctx.id);
                    return Ok(());
                }
                Message::TorrentAllocation(Err(e)) => {
                    log::error!(
                        "Torrent {} allocation failed: {}",
                        self.ctx.id,
                        e
                    );
                    return self.storage_error(e.to_string());
                }
                Message::Shutdown => {
                    self.running = false;
                    return Err(Error::InvalidState(
                        "shut down before allocation",
                    ));
                }
                // nothing else can meaningfully happen before allocation
                _ => log::debug!("Ignoring message before allocation"),
            }
        }
        Err(Error::Channel)
    }

    /// Applies fast-resume data: installs the bitfield, the file priorities
    /// and the saved peers, and stats every file against its record.
    /// Returns the piece ranges that must be re-verified: everything, if
    /// there was no (valid) resume data, and the ranges of mismatched files
    /// otherwise.
    fn load_resume(&mut self, resume: Option<ResumeData>) -> Ranges {
        let piece_count = self.content.piece_count();
        let mut everything = Ranges::default();
        everything.insert(0..piece_count);

        let resume = match resume {
            Some(resume) => resume,
            None => return everything,
        };

        // a record whose shape doesn't match the torrent is discarded
        if resume.files.len() != self.content.files().len()
            || !self.content.install_pieces(resume.bitfield.clone())
        {
            log::warn!(
                "Torrent {} resume data doesn't match, ignoring",
                self.ctx.id
            );
            return everything;
        }

        self.available.extend(
            resume
                .peers()
                .into_iter()
                .map(|addr| PeerEntry { addr, id: None }),
        );

        let mut ranges = Ranges::default();
        for (index, record) in resume.files.iter().enumerate() {
            if let Some(priority) = FilePriority::from_u8(record.priority) {
                let _ = self.content.set_file_priority(index, priority);
            }

            // any size or mtime mismatch invalidates the file's pieces
            let file = &self.content.storage().files[index];
            let path = self.content.storage().download_dir.join(&file.path);
            let matches = match std::fs::metadata(&path) {
                Ok(meta) => {
                    meta.len() == file.len
                        && file_mtime(&meta) == Some(record.mtime)
                }
                Err(_) => false,
            };
            if !matches {
                log::info!(
                    "Torrent {} file {:?} changed, re-checking",
                    self.ctx.id,
                    file.path
                );
                ranges.insert(
                    self.content.storage().pieces_intersecting_file(index),
                );
            }
        }

        // the bits of invalid ranges are cleared before hashing starts
        for range in ranges.iter() {
            self.content.clear_pieces(range.clone());
        }
        log::info!(
            "Torrent {} resume accepted, {} piece(s) to re-check",
            self.ctx.id,
            ranges.piece_count()
        );
        ranges
    }

    /// Drives the resume check: keeps a small window of verification
    /// commands outstanding and applies the verdicts until every queued
    /// piece is decided.
    async fn run_hash_check(
        &mut self,
        msg_port: &mut Receiver,
        ranges: Ranges,
    ) -> Result<()> {
        let mut check = HashCheck::new(&ranges);
        if !check.is_checking() {
            return Ok(());
        }
        log::info!(
            "Torrent {} checking {} piece(s)",
            self.ctx.id,
            check.remaining()
        );
        check.fill(&self.ctx.disk, self.ctx.id)?;

        while check.is_checking() {
            let msg = match msg_port.recv().await {
                Some(msg) => msg,
                None => return Err(Error::Channel),
            };
            match msg {
                Message::PieceVerified {
                    piece_index,
                    result,
                } => {
                    check.on_result();
                    match result {
                        Ok(true) => {
                            self.content.mark_done(piece_index);
                        }
                        Ok(false) => {
                            log::debug!(
                                "Piece {} failed resume check",
                                piece_index
                            );
                        }
                        Err(e) => {
                            log::error!(
                                "Torrent {} check IO error: {}",
                                self.ctx.id,
                                e
                            );
                            return self.storage_error(e.to_string());
                        }
                    }
                    check.fill(&self.ctx.disk, self.ctx.id)?;
                }
                Message::Shutdown => {
                    self.running = false;
                    return Err(Error::InvalidState(
                        "shut down during resume check",
                    ));
                }
                _ => log::debug!("Ignoring message during resume check"),
            }
        }
        Ok(())
    }

    /// Rebuilds the piece picker from the verified bitfield and the file
    /// priorities. Only called before peer sessions exist.
    async fn rebuild_piece_picker(&mut self) {
        let mut piece_picker = self.ctx.piece_picker.write().await;
        *piece_picker = PiecePicker::new(self.content.pieces().clone());

        // a piece overlapping several files takes the highest priority
        // among them, so skipped ranges are applied first
        piece_picker.reset_priorities(FilePriority::Skip);
        for (index, file) in self.content.files().iter().enumerate() {
            if file.priority != FilePriority::Skip {
                piece_picker.set_priority(
                    self.content.storage().pieces_intersecting_file(index),
                    file.priority,
                );
            }
        }
    }

    /// Stops the torrent because of a storage failure: the caller is
    /// alerted, the tracker told, and the torrent task exits with the
    /// error.
    fn storage_error(&mut self, error: String) -> Result<()> {
        let _ = self.alert_chan.send(engine::Alert::StorageError {
            id: self.ctx.id,
            error: error.clone(),
        });
        self.running = false;
        Err(Error::Storage(error))
    }

    /// Graceful teardown: sessions are shut down, a best-effort `stopped`
    /// announce is made, the disk entry is removed, and the caller receives
    /// the final resume data.
    async fn shutdown(&mut self) {
        log::info!("Torrent {} stopping", self.ctx.id);
        for peer in self.peers.values() {
            let _ = peer.chan.send(peer::Command::Shutdown);
        }

        // a single, time-boxed attempt; a dead tracker mustn't stall
        // shutdown
        if self.announced_start {
            let params = self.announce_params(Some(Event::Stopped));
            let trackers = Arc::clone(&self.trackers);
            let _ = tokio::time::timeout(Duration::from_secs(5), async move {
                let mut trackers = trackers.lock().await;
                let _ = trackers.announce(params).await;
            })
            .await;
        }

        let resume = self.build_resume().map(|r| r.to_bytes().ok()).flatten();
        let _ = self.alert_chan.send(engine::Alert::TorrentStopped {
            id: self.ctx.id,
            resume,
        });

        let _ = self.ctx.disk.remove_torrent(self.ctx.id);
        self.content.close();
    }

    /// Snapshots the torrent into fast-resume data. Returns nothing if the
    /// content isn't open (the torrent never got as far as allocating).
    fn build_resume(&self) -> Option<ResumeData> {
        if !self.content.is_open() {
            return None;
        }

        let storage = self.content.storage();
        let mut files = Vec::with_capacity(storage.files.len());
        for (index, file) in storage.files.iter().enumerate() {
            let path = storage.download_dir.join(&file.path);
            let mtime = std::fs::metadata(&path)
                .ok()
                .and_then(|meta| file_mtime(&meta))
                .unwrap_or(0);
            files.push(ResumeFile {
                mtime,
                priority: self.content.files()[index].priority as u8,
            });
        }

        let mut resume = ResumeData {
            bitfield: self.content.pieces_to_bytes(),
            files,
            peers: Vec::new(),
        };
        let addrs: Vec<SocketAddr> = self
            .peers
            .keys()
            .copied()
            .chain(self.available.iter().map(|p| p.addr))
            .collect();
        resume.set_peers(addrs.iter());
        Some(resume)
    }
}

/// Decides which of two connections to the same peer id survives.
///
/// If one is outgoing and the other incoming, lexicographic id order picks
/// the winner (both sides compute the same answer, so exactly one
/// connection survives). Between two connections of the same direction the
/// existing one is kept.
fn prefer_existing(
    our_id: &PeerId,
    peer_id: &PeerId,
    existing_is_outbound: bool,
    new_is_outbound: bool,
) -> bool {
    match (existing_is_outbound, new_is_outbound) {
        // the side with the lower id keeps its outgoing connection
        (true, false) => our_id < peer_id,
        (false, true) => !(our_id < peer_id),
        _ => true,
    }
}

fn file_mtime(meta: &std::fs::Metadata) -> Option<i64> {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}

/// The pool of peers we know about but aren't connected to, deduplicated
/// by address and bounded.
struct AvailablePeers {
    queue: VecDeque<PeerEntry>,
    known: HashSet<SocketAddr>,
    cap: usize,
}

impl AvailablePeers {
    fn new(cap: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            known: HashSet::new(),
            cap,
        }
    }

    fn extend(&mut self, peers: impl Iterator<Item = PeerEntry>) {
        for peer in peers {
            if self.queue.len() >= self.cap {
                return;
            }
            if self.known.insert(peer.addr) {
                self.queue.push_back(peer);
            }
        }
    }

    fn pop(&mut self) -> Option<PeerEntry> {
        let peer = self.queue.pop_front()?;
        self.known.remove(&peer.addr);
        Some(peer)
    }

    fn iter(&self) -> impl Iterator<Item = &PeerEntry> {
        self.queue.iter()
    }
}

/// A sorted set of non-overlapping piece index ranges.
#[derive(Clone, Debug, Default, PartialEq)]
struct Ranges(Vec<Range<PieceIndex>>);

impl Ranges {
    /// Inserts a range, merging it with any ranges it overlaps or abuts.
    fn insert(&mut self, range: Range<PieceIndex>) {
        if range.start >= range.end {
            return;
        }
        let mut merged = range;
        let mut result = Vec::with_capacity(self.0.len() + 1);
        for existing in self.0.drain(..) {
            if existing.end < merged.start || existing.start > merged.end {
                result.push(existing);
            } else {
                merged = merged.start.min(existing.start)
                    ..merged.end.max(existing.end);
            }
        }
        result.push(merged);
        result.sort_by_key(|r| r.start);
        self.0 = result;
    }

    fn iter(&self) -> impl Iterator<Item = &Range<PieceIndex>> {
        self.0.iter()
    }

    fn piece_count(&self) -> usize {
        self.0.iter().map(|r| r.end - r.start).sum()
    }

    fn pieces(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        self.0.iter().cloned().flatten()
    }
}

/// The resume check driver: queues piece verifications against the disk
/// task, keeping a bounded number outstanding.
struct HashCheck {
    queue: VecDeque<PieceIndex>,
    outstanding: usize,
}

impl HashCheck {
    fn new(ranges: &Ranges) -> Self {
        Self {
            queue: ranges.pieces().collect(),
            outstanding: 0,
        }
    }

    /// Tops the outstanding window up from the queue.
    fn fill(&mut self, disk: &DiskHandle, id: TorrentId) -> Result<()> {
        while self.outstanding < HASH_CHECK_WINDOW {
            let piece_index = match self.queue.pop_front() {
                Some(index) => index,
                None => break,
            };
            disk.verify_piece(id, piece_index)?;
            self.outstanding += 1;
        }
        Ok(())
    }

    fn on_result(&mut self) {
        debug_assert!(self.outstanding > 0);
        self.outstanding -= 1;
    }

    fn is_checking(&self) -> bool {
        self.outstanding > 0 || !self.queue.is_empty()
    }

    fn remaining(&self) -> usize {
        self.outstanding + self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::{disk, FileInfo};

    const PIECE_LEN: u32 = 16384;

    /// A two file, five piece torrent: piece 1 straddles the file boundary.
    fn archive_metainfo() -> Metainfo {
        Metainfo {
            name: "fixture".into(),
            info_hash: [0xaa; 20],
            piece_len: PIECE_LEN,
            piece_hashes: vec![0xab; 5 * 20],
            is_archive: true,
            files: vec![
                FileInfo {
                    path: "a".into(),
                    len: 30_000,
                    torrent_offset: 0,
                },
                FileInfo {
                    path: "b".into(),
                    len: 51_920,
                    torrent_offset: 30_000,
                },
            ],
            trackers: Vec::new(),
            creation_date: None,
        }
    }

    /// Creates an opened torrent over real (zero filled) files in a temp
    /// directory and returns it with the directory guard.
    async fn opened_torrent() -> (Torrent, TempDir) {
        let dir = TempDir::new().unwrap();
        let (_join, disk) = disk::spawn().unwrap();
        let (alert_chan, _alert_port) = mpsc::unbounded_channel();
        let (mut torrent, _chan) = Torrent::new(TorrentParams {
            id: 0,
            metainfo: archive_metainfo(),
            conf: TorrentConf::new(dir.path()),
            client_id: [b'x'; 20],
            listen_port: 6881,
            disk,
            alert_chan,
        })
        .unwrap();
        torrent.content.open().unwrap();

        let root = torrent.content.storage().download_dir.clone();
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a"), vec![0u8; 30_000]).unwrap();
        fs::write(root.join("b"), vec![0u8; 51_920]).unwrap();
        (torrent, dir)
    }

    fn mtime_of(path: &std::path::Path) -> i64 {
        file_mtime(&fs::metadata(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_resume_with_matching_files_checks_nothing() {
        let (mut torrent, _dir) = opened_torrent().await;
        let root = torrent.content.storage().download_dir.clone();

        let resume = ResumeData {
            // 0b11111000: all five pieces complete
            bitfield: vec![0xf8],
            files: vec![
                ResumeFile {
                    mtime: mtime_of(&root.join("a")),
                    priority: 1,
                },
                ResumeFile {
                    mtime: mtime_of(&root.join("b")),
                    priority: 1,
                },
            ],
            peers: Vec::new(),
        };

        let ranges = torrent.load_resume(Some(resume));
        assert_eq!(ranges.piece_count(), 0);
        assert_eq!(torrent.content.completed_count(), 5);
        assert_eq!(torrent.content.bytes_completed(), 81_920);
    }

    #[tokio::test]
    async fn test_resume_invalidates_only_the_changed_file() {
        let (mut torrent, _dir) = opened_torrent().await;
        let root = torrent.content.storage().download_dir.clone();

        let resume = ResumeData {
            bitfield: vec![0xf8],
            files: vec![
                ResumeFile {
                    mtime: mtime_of(&root.join("a")),
                    priority: 1,
                },
                // a stale mtime for file b
                ResumeFile {
                    mtime: 1,
                    priority: 0,
                },
            ],
            peers: Vec::new(),
        };

        let ranges = torrent.load_resume(Some(resume));
        // file b covers bytes 30000..81920, i.e. pieces 1 through 4; those
        // and only those are re-checked, with their bits cleared up front
        assert_eq!(
            ranges.pieces().collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(torrent.content.completed_count(), 1);
        assert!(torrent.content.pieces()[0]);

        // the saved priority was installed as well
        assert_eq!(
            torrent.content.files()[1].priority,
            FilePriority::Skip
        );
    }

    #[tokio::test]
    async fn test_mismatching_resume_is_discarded() {
        let (mut torrent, _dir) = opened_torrent().await;

        // wrong bitfield width
        let resume = ResumeData {
            bitfield: vec![0xf8, 0x00],
            files: vec![
                ResumeFile {
                    mtime: 0,
                    priority: 1,
                },
                ResumeFile {
                    mtime: 0,
                    priority: 1,
                },
            ],
            peers: Vec::new(),
        };
        let ranges = torrent.load_resume(Some(resume));
        // everything is re-checked as if there had been no resume data
        assert_eq!(ranges.piece_count(), 5);
        assert_eq!(torrent.content.completed_count(), 0);

        // wrong file count
        let resume = ResumeData {
            bitfield: vec![0xf8],
            files: vec![ResumeFile {
                mtime: 0,
                priority: 1,
            }],
            peers: Vec::new(),
        };
        let ranges = torrent.load_resume(Some(resume));
        assert_eq!(ranges.piece_count(), 5);
    }

    #[test]
    fn test_ranges_merge() {
        let mut ranges = Ranges::default();
        ranges.insert(0..3);
        ranges.insert(10..12);
        // overlapping and adjacent ranges merge
        ranges.insert(2..5);
        ranges.insert(5..6);
        assert_eq!(ranges.0, vec![0..6, 10..12]);
        assert_eq!(ranges.piece_count(), 8);
        assert_eq!(
            ranges.pieces().collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4, 5, 10, 11]
        );

        // empty ranges are ignored
        ranges.insert(7..7);
        assert_eq!(ranges.piece_count(), 8);
    }

    #[test]
    fn test_available_peers_dedup_and_cap() {
        let mut pool = AvailablePeers::new(2);
        let a = PeerEntry {
            addr: "10.0.0.1:1".parse().unwrap(),
            id: None,
        };
        let b = PeerEntry {
            addr: "10.0.0.2:1".parse().unwrap(),
            id: None,
        };
        let c = PeerEntry {
            addr: "10.0.0.3:1".parse().unwrap(),
            id: None,
        };
        pool.extend(vec![a, a, b, c].into_iter());

        // the duplicate was dropped and the cap kept c out
        assert_eq!(pool.pop().map(|p| p.addr), Some(a.addr));
        assert_eq!(pool.pop().map(|p| p.addr), Some(b.addr));
        assert!(pool.pop().is_none());

        // popping a peer forgets it, so it may be re-added later
        pool.extend(vec![a].into_iter());
        assert_eq!(pool.pop().map(|p| p.addr), Some(a.addr));
    }

    #[test]
    fn test_duplicate_connection_tiebreak() {
        let low: PeerId = [1; 20];
        let high: PeerId = [2; 20];

        // our outgoing vs their incoming: the lower id keeps its outgoing
        assert!(prefer_existing(&low, &high, true, false));
        assert!(!prefer_existing(&high, &low, true, false));

        // our incoming vs our new outgoing: mirror of the above
        assert!(!prefer_existing(&low, &high, false, true));
        assert!(prefer_existing(&high, &low, false, true));

        // same direction: keep the existing connection
        assert!(prefer_existing(&low, &high, true, true));
        assert!(prefer_existing(&high, &low, false, false));
    }
}
