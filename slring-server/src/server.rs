use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use bytes::Bytes;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use slring::{FormatRegistry, Storage};

use crate::seedlink::Frame;
use crate::session::{Action, Session};
use crate::settings::Settings;

/// Session identifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionId(pub u64);

/// Reader mode, decided by the main loop after a FEED command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadMode {
    Commands,
    Feed,
}

/// The message type used when a connection actor talks to the main server
/// loop.
pub enum ToServer {
    NewSession(SessionHandle),
    Frame(SessionId, Frame),
    /// The connection's outbox has drained; more transfer data may be
    /// collected.
    Flushed(SessionId),
    Disconnect(SessionId),
    FatalError(io::Error),
}

/// A handle to a connection actor, owned by the main loop.
pub struct SessionHandle {
    pub id: SessionId,
    pub addr: SocketAddr,
    chan: Sender<Bytes>,
    mode: watch::Sender<ReadMode>,
    kill: JoinHandle<()>,
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        addr: SocketAddr,
        chan: Sender<Bytes>,
        mode: watch::Sender<ReadMode>,
        kill: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            addr,
            chan,
            mode,
            kill,
        }
    }

    /// Enqueues bytes on the connection.
    ///
    /// Fails if the writer cannot keep up, which disconnects the client.
    pub fn send(&self, bytes: Bytes) -> Result<(), io::Error> {
        self.chan
            .try_send(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }

    /// Tells the reader which mode to continue in.
    pub fn set_mode(&self, mode: ReadMode) {
        let _ = self.mode.send(mode);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.kill.abort()
    }
}

#[derive(Clone)]
pub struct ServerHandle {
    chan: Sender<ToServer>,
    next_id: Arc<AtomicU64>,
}

impl ServerHandle {
    pub async fn send(&self, msg: ToServer) {
        if self.chan.send(msg).await.is_err() {
            panic!("main loop has shut down");
        }
    }

    pub fn next_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Spawns the main server loop.
pub fn spawn_main_loop(
    settings: Arc<Settings>,
    storage: Storage,
) -> (ServerHandle, JoinHandle<()>) {
    let (send, recv) = channel(64);

    let server_handle = ServerHandle {
        chan: send,
        next_id: Default::default(),
    };

    let join_handle = tokio::spawn(async move {
        if let Err(err) = main_loop(settings, storage, recv).await {
            error!("main server loop failed: {}", err);
        }
    });

    (server_handle, join_handle)
}

struct Entry {
    handle: SessionHandle,
    session: Session,
    writable: bool,
}

struct ServerData {
    storage: Storage,
    sessions: HashMap<u64, Entry>,
}

impl ServerData {
    fn remove_session(&mut self, id: u64) {
        if let Some(mut entry) = self.sessions.remove(&id) {
            entry.session.drop_cursors(&mut self.storage);
            debug!("{}: disconnected (ip={})", id, entry.handle.addr);
        }
    }

    fn apply_actions(&mut self, id: u64, actions: Vec<Action>) {
        for action in actions {
            let Some(entry) = self.sessions.get_mut(&id) else {
                return;
            };

            match action {
                Action::Send(bytes) => {
                    entry.writable = false;
                    if entry.handle.send(Bytes::from(bytes)).is_err() {
                        self.remove_session(id);
                    }
                }
                Action::EnterFeedMode => entry.handle.set_mode(ReadMode::Feed),
                Action::StayCommandMode => entry.handle.set_mode(ReadMode::Commands),
                Action::Close => self.remove_session(id),
            }
        }
    }

    /// Continues a transfer if the session has ready cursors and a drained
    /// outbox.
    fn pump(&mut self, id: u64) {
        let Some(entry) = self.sessions.get_mut(&id) else {
            return;
        };
        if !entry.writable || !entry.session.in_transfer() || !entry.session.has_ready() {
            return;
        }

        let data = entry.session.collect_data(&mut self.storage);
        if !data.is_empty() {
            entry.writable = false;
            if entry.handle.send(Bytes::from(data)).is_err() {
                self.remove_session(id);
            }
        }
    }
}

async fn main_loop(
    settings: Arc<Settings>,
    storage: Storage,
    mut recv: Receiver<ToServer>,
) -> Result<(), io::Error> {
    let registry = Arc::new(FormatRegistry::standard());
    let mut data = ServerData {
        storage,
        sessions: HashMap::new(),
    };

    while let Some(msg) = recv.recv().await {
        match msg {
            ToServer::NewSession(handle) => {
                debug!("{}: new connection (ip={})", handle.id.0, handle.addr);
                let session = Session::new(
                    handle.id.0,
                    handle.addr.ip(),
                    settings.clone(),
                    registry.clone(),
                );
                data.sessions.insert(
                    handle.id.0,
                    Entry {
                        handle,
                        session,
                        writable: true,
                    },
                );
            }
            ToServer::Frame(id, Frame::Line(line)) => {
                let Some(entry) = data.sessions.get_mut(&id.0) else {
                    continue;
                };
                let actions = entry.session.handle_line(&line, &mut data.storage);
                data.apply_actions(id.0, actions);
            }
            ToServer::Frame(id, Frame::Feed(bytes)) => {
                let Some(entry) = data.sessions.get_mut(&id.0) else {
                    continue;
                };
                let outcome = entry.session.handle_feed(&bytes, &mut data.storage);

                // new rings may complete standing wildcard subscriptions
                let ids: Vec<u64> = data.sessions.keys().copied().collect();
                for name in &outcome.new_stations {
                    for sid in &ids {
                        if let Some(entry) = data.sessions.get_mut(sid) {
                            entry.session.station_avail(name, &mut data.storage);
                        }
                    }
                }

                for (client, ring) in outcome.wakes {
                    if let Some(entry) = data.sessions.get_mut(&client) {
                        entry.session.wake(&ring);
                    }
                }

                for sid in ids {
                    data.pump(sid);
                }

                data.apply_actions(id.0, outcome.actions);
            }
            ToServer::Flushed(id) => {
                if let Some(entry) = data.sessions.get_mut(&id.0) {
                    entry.writable = true;
                }
                data.pump(id.0);
            }
            ToServer::Disconnect(id) => {
                data.remove_session(id.0);
            }
            ToServer::FatalError(err) => return Err(err),
        }
    }

    Ok(())
}
