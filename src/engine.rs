//! The top level engine value.
//!
//! An [`Engine`] owns the disk task, the TCP listener, and any number of
//! torrents, each running as its own task. There is no global state: create
//! an engine, add torrents to it, read its alerts, and shut it down.
//!
//! Incoming peer connections are accepted here: the engine reads the
//! remote's handshake, looks up the torrent with the matching info hash and
//! hands the socket over to it; sockets presenting an unknown info hash are
//! closed.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{FutureExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        watch, RwLock,
    },
    task,
    time::timeout,
};
use tokio_util::codec::Framed;

use crate::{
    conf::Conf,
    disk::{self, DiskHandle},
    error::*,
    metainfo::Metainfo,
    peer::codec::HandshakeCodec,
    resume::ResumeData,
    torrent::{self, Torrent, TorrentParams},
    PeerId, Sha1Hash, TorrentId,
};

/// How long an incoming connection may take to present its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) type AlertSender = UnboundedSender<Alert>;
pub type AlertReceiver = UnboundedReceiver<Alert>;

/// The notifications the engine's user receives on the alert port.
#[derive(Debug)]
pub enum Alert {
    /// Every piece of the torrent has been downloaded and verified.
    TorrentCompleted { id: TorrentId },
    /// The torrent stopped. If it got far enough to have state worth
    /// keeping, the serialized fast-resume record is attached; persist it
    /// and pass it to `add_torrent` on the next run to avoid a full
    /// re-check.
    TorrentStopped {
        id: TorrentId,
        resume: Option<Vec<u8>>,
    },
    /// The torrent was stopped by a storage failure (unwritable download
    /// directory, disappearing files, failing disk).
    StorageError { id: TorrentId, error: String },
}

/// A running torrent, from the engine's point of view.
struct TorrentHandle {
    chan: torrent::Sender,
    join: task::JoinHandle<()>,
}

pub struct Engine {
    conf: Conf,
    client_id: PeerId,
    disk: DiskHandle,
    disk_join: task::JoinHandle<Result<()>>,
    torrents: HashMap<TorrentId, TorrentHandle>,
    /// Maps each added torrent's info hash to its channel, for dispatching
    /// incoming connections. Shared with the listener task.
    info_hashes: Arc<RwLock<HashMap<Sha1Hash, torrent::Sender>>>,
    listen_port: u16,
    listener_stop: watch::Sender<bool>,
    listener_join: task::JoinHandle<()>,
    alert_chan: AlertSender,
    next_torrent_id: TorrentId,
}

impl Engine {
    /// Creates the engine: spawns the disk task and binds the peer
    /// listener to the first free port of the configured range. The
    /// returned receiver is the engine's alert port.
    pub async fn new(conf: Conf) -> Result<(Self, AlertReceiver)> {
        let client_id = conf.engine.generate_client_id();
        log::info!(
            "Starting engine with client id {:?}",
            String::from_utf8_lossy(&client_id)
        );

        let (disk_join, disk) = disk::spawn()?;
        let (alert_chan, alert_port) = mpsc::unbounded_channel();

        let mut bound = None;
        for port in conf.engine.listen_ports.clone() {
            let addr = SocketAddr::from((conf.engine.bind_addr, port));
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    bound = Some((listener, port));
                    break;
                }
                Err(e) => {
                    log::debug!("Could not bind to {}: {}", addr, e);
                }
            }
        }
        let (listener, listen_port) = bound.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "no free port in the configured listen range",
            ))
        })?;
        log::info!("Listening for peers on port {}", listen_port);

        let info_hashes = Arc::new(RwLock::new(HashMap::new()));
        let (listener_stop, stop_port) = watch::channel(false);
        let listener_join = task::spawn(listen(
            listener,
            Arc::clone(&info_hashes),
            conf.engine.max_open_sockets,
            stop_port,
        ));

        Ok((
            Self {
                conf,
                client_id,
                disk,
                disk_join,
                torrents: HashMap::new(),
                info_hashes,
                listen_port,
                listener_stop,
                listener_join,
                alert_chan,
                next_torrent_id: 0,
            },
            alert_port,
        ))
    }

    /// The port the engine accepts peer connections on. This is what gets
    /// announced to trackers.
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Adds a torrent to the engine and starts it: its files are allocated,
    /// checked against the optional fast-resume record (or fully checked
    /// without one), and then the torrent downloads and seeds until the
    /// engine shuts down.
    pub async fn add_torrent(
        &mut self,
        metainfo: Metainfo,
        resume: Option<Vec<u8>>,
    ) -> Result<TorrentId> {
        let id = self.next_torrent_id;
        self.next_torrent_id += 1;
        let info_hash = metainfo.info_hash;
        log::info!(
            "Adding torrent {} ({})",
            id,
            hex::encode(&info_hash)
        );

        // an unreadable resume record is equivalent to none: the torrent
        // falls back to a full check
        let resume = resume.and_then(|buf| {
            ResumeData::from_bytes(&buf)
                .map_err(|e| {
                    log::warn!("Discarding invalid resume data: {}", e)
                })
                .ok()
        });

        let (mut torrent, chan) = Torrent::new(TorrentParams {
            id,
            metainfo,
            conf: self.conf.torrent.clone(),
            client_id: self.client_id,
            listen_port: self.listen_port,
            disk: self.disk.clone(),
            alert_chan: self.alert_chan.clone(),
        })?;

        self.info_hashes.write().await.insert(info_hash, chan.clone());
        let join = task::spawn(async move {
            if let Err(e) = torrent.start(resume).await {
                log::warn!("Torrent {} exited with error: {}", id, e);
            }
        });
        self.torrents.insert(id, TorrentHandle { chan, join });
        Ok(id)
    }

    /// Stops a single torrent. Its final fast-resume record arrives on the
    /// alert port.
    pub async fn stop_torrent(&mut self, id: TorrentId) -> Result<()> {
        let handle = self
            .torrents
            .remove(&id)
            .ok_or(Error::InvalidTorrentId)?;
        let _ = handle.chan.send(torrent::Message::Shutdown);
        let _ = handle.join.await;
        Ok(())
    }

    /// Gracefully tears the engine down: every torrent announces `stopped`
    /// and emits its resume data, then the disk task and the listener are
    /// stopped.
    pub async fn shutdown(mut self) -> Result<()> {
        log::info!("Shutting down engine");
        let _ = self.listener_stop.broadcast(true);

        for handle in self.torrents.values() {
            let _ = handle.chan.send(torrent::Message::Shutdown);
        }
        for (_, handle) in self.torrents.drain() {
            let _ = handle.join.await;
        }

        self.disk.shutdown()?;
        let _ = self.disk_join.await;
        let _ = self.listener_join.await;
        Ok(())
    }
}

/// The listener task: accepts peer connections and spawns a handshake read
/// for each, with a cap on how many sockets may be in the handshake phase
/// at once.
async fn listen(
    mut listener: TcpListener,
    info_hashes: Arc<RwLock<HashMap<Sha1Hash, torrent::Sender>>>,
    max_open_sockets: usize,
    mut stop_port: watch::Receiver<bool>,
) {
    let pending = Arc::new(AtomicUsize::new(0));
    loop {
        futures::select! {
            result = listener.accept().fuse() => {
                let (stream, addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };

                if pending.load(Ordering::Relaxed) >= max_open_sockets {
                    log::warn!(
                        "Refusing incoming connection {}: socket limit",
                        addr
                    );
                    continue;
                }

                log::debug!("Incoming connection from {}", addr);
                pending.fetch_add(1, Ordering::Relaxed);
                let info_hashes = Arc::clone(&info_hashes);
                let pending = Arc::clone(&pending);
                task::spawn(async move {
                    handle_incoming(stream, addr, info_hashes).await;
                    pending.fetch_sub(1, Ordering::Relaxed);
                });
            }
            stop = stop_port.recv().fuse() => {
                if stop.unwrap_or(true) {
                    log::info!("Stopping peer listener");
                    return;
                }
            }
        }
    }
}

/// Reads the handshake off an incoming socket and dispatches the connection
/// to the torrent with the matching info hash. Unknown info hashes and
/// handshakes that don't arrive in time close the socket.
async fn handle_incoming(
    stream: TcpStream,
    addr: SocketAddr,
    info_hashes: Arc<RwLock<HashMap<Sha1Hash, torrent::Sender>>>,
) {
    let mut socket = Framed::new(stream, HandshakeCodec);
    let handshake = match timeout(HANDSHAKE_TIMEOUT, socket.next()).await {
        Ok(Some(Ok(handshake))) => handshake,
        Ok(Some(Err(e))) => {
            log::info!("Invalid handshake from {}: {}", addr, e);
            return;
        }
        Ok(None) | Err(_) => {
            log::info!("Peer {} sent no handshake", addr);
            return;
        }
    };

    let chan = info_hashes
        .read()
        .await
        .get(&handshake.info_hash)
        .cloned();
    match chan {
        Some(chan) => {
            // the torrent applies its own connection cap and duplicate
            // detection before starting a session
            let _ = chan
                .send(torrent::Message::IncomingPeer { socket, handshake });
        }
        None => {
            log::info!(
                "Peer {} handshake for unknown torrent {}",
                addr,
                hex::encode(&handshake.info_hash)
            );
        }
    }
}
