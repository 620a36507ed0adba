//! Live remote participants.
//!
//! A [`Peer`] wraps one connection to another process. Command channels
//! carry membership and control traffic; data channels carry node
//! messages between machines. Every peer owns one OS reader thread;
//! writes serialize behind the peer's send lock so frames never
//! interleave.

use {
    crate::{
        cluster::ClusterState,
        commands,
        connection::Connection,
        error::Result,
        wire::Message,
    },
    log::{debug, info, warn},
    std::sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    std::thread::{Builder, JoinHandle},
};

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(0);

/// What a connection is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Membership and control commands.
    Command,
    /// Node-to-node data frames.
    Data,
}

/// One live connection to a remote process.
pub struct Peer {
    id: u64,
    /// Inbound connections start as command channels and become data
    /// channels when the remote announces `data_host`.
    kind: Mutex<ChannelKind>,
    /// Address this peer can be dialed back on. Re-addressed when a
    /// subscriber announces its listener port.
    addr: Mutex<String>,
    writer: Mutex<Connection>,
    connected: AtomicBool,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("addr", &self.addr())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Peer {
    /// Dial a remote process.
    pub fn connect(
        addr: &str,
        kind: ChannelKind,
        attempts: u32,
        retry_ms: u64,
    ) -> Result<Arc<Self>> {
        let conn = Connection::dial(addr, attempts, retry_ms)?;
        Ok(Self::wrap(conn, kind))
    }

    /// Wrap an accepted connection.
    pub fn accept(conn: Connection, kind: ChannelKind) -> Arc<Self> {
        Self::wrap(conn, kind)
    }

    fn wrap(conn: Connection, kind: ChannelKind) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
            kind: Mutex::new(kind),
            addr: Mutex::new(conn.addr().to_string()),
            writer: Mutex::new(conn),
            connected: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ChannelKind {
        match self.kind.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_kind(&self, kind: ChannelKind) {
        let mut slot = match self.kind.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = kind;
    }

    pub fn addr(&self) -> String {
        match self.addr.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Record the address the peer can be dialed back on.
    pub fn set_addr(&self, addr: String) {
        let mut slot = match self.addr.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = addr;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Write one frame, holding the send lock for the whole frame.
    pub fn send(&self, msg: &Message) -> Result<()> {
        let mut writer = match self.writer.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        msg.write_to(&mut *writer)
    }

    /// Send a system command by name.
    pub fn send_command(&self, name: &str, params: &[u8]) -> Result<()> {
        let id = commands::command_id(name)?;
        self.send(&Message::command(id, params))
    }

    /// Tear the connection down, waking the reader thread.
    pub fn shutdown(&self) {
        self.mark_disconnected();
        let writer = match self.writer.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        writer.shutdown();
    }

    /// Start this peer's reader thread: decode frames until the
    /// connection dies, dispatching commands inline and routing data
    /// frames to their destination scheduler.
    pub fn spawn_reader(self: &Arc<Self>, cluster: Arc<ClusterState>) -> Result<JoinHandle<()>> {
        let peer = Arc::clone(self);
        let mut conn = {
            let writer = match self.writer.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            writer.try_clone()?
        };
        let max_frame = cluster.config().max_frame_size;
        let handle = Builder::new()
            .name(format!("plexusPeer{:03}", self.id))
            .spawn(move || {
                loop {
                    match Message::read_from(&mut conn, max_frame) {
                        Ok(msg) if msg.is_sys_command() => {
                            commands::dispatch(&cluster, &peer, msg);
                        }
                        Ok(msg) => cluster.route_data(msg),
                        Err(e) if e.is_disconnect() => {
                            info!("peer {} ({}) disconnected", peer.id, peer.addr());
                            break;
                        }
                        Err(e) => {
                            warn!("peer {} read error: {e}", peer.id);
                            break;
                        }
                    }
                }
                peer.mark_disconnected();
                cluster.remove_peer(&peer);
                debug!("reader for peer {} done", peer.id);
            })?;
        Ok(handle)
    }
}
