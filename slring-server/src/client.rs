use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::StreamExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::{
    tcp::{ReadHalf, WriteHalf},
    TcpStream,
};
use tokio::sync::mpsc::{channel, Receiver};
use tokio::sync::{oneshot, watch};
use tokio::try_join;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace};

use crate::seedlink::{Frame, ParseError, SessionCodec};
use crate::server::{ReadMode, ServerHandle, SessionHandle, SessionId, ToServer};

/// Struct constructed by the accept loop and used as the argument to
/// `spawn_session`.
pub struct SessionInfo {
    pub addr: SocketAddr,
    pub id: SessionId,
    pub handle: ServerHandle,
    pub tcp: TcpStream,
}

struct SessionData {
    id: SessionId,
    handle: ServerHandle,
    recv: Receiver<Bytes>,
    mode: watch::Receiver<ReadMode>,
    tcp: TcpStream,
}

/// Spawns a new connection actor.
pub fn spawn_session(info: SessionInfo) {
    let (send, recv) = channel(64);
    let (mode_tx, mode_rx) = watch::channel(ReadMode::Commands);

    let data = SessionData {
        id: info.id,
        handle: info.handle.clone(),
        recv,
        mode: mode_rx,
        tcp: info.tcp,
    };

    // hand the session handle to the main loop once the task's JoinHandle
    // exists
    let (my_send, my_recv) = oneshot::channel();
    let join_handle = tokio::spawn(start_session(my_recv, data));

    let session_handle = SessionHandle::new(info.id, info.addr, send, mode_tx, join_handle);

    // sending only fails if the server is shutting down
    let _ = my_send.send(session_handle);
}

async fn start_session(my_handle: oneshot::Receiver<SessionHandle>, mut data: SessionData) {
    // Forward the handle from here instead of in `spawn_session` so the main
    // loop sees NewSession before any frame from this connection.
    let session_handle = match my_handle.await {
        Ok(session_handle) => session_handle,
        Err(_) => return,
    };
    let id = session_handle.id;
    data.handle.send(ToServer::NewSession(session_handle)).await;

    let server_handle = data.handle.clone();

    if let Err(err) = session_loop(data).await {
        debug!("{}: connection closed: {}", id.0, err);
    }

    server_handle.send(ToServer::Disconnect(id)).await;
}

async fn session_loop(mut data: SessionData) -> Result<(), io::Error> {
    let sock_ref = SockRef::from(&data.tcp);

    let tcp_keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(20));

    sock_ref.set_tcp_keepalive(&tcp_keepalive)?;

    let (read, write) = data.tcp.split();

    let ((), ()) = try_join! {
        tcp_read(data.id, read, data.handle.clone(), data.mode.clone()),
        tcp_write(data.id, write, data.handle.clone(), &mut data.recv),
    }?;

    let _ = data.tcp.shutdown().await;

    Ok(())
}

async fn tcp_read(
    id: SessionId,
    read: ReadHalf<'_>,
    server_handle: ServerHandle,
    mut mode: watch::Receiver<ReadMode>,
) -> Result<(), io::Error> {
    let mut framed = FramedRead::new(read, SessionCodec::new());

    while let Some(res) = framed.next().await {
        match res {
            Ok(Frame::Line(line)) => {
                trace!("{}: <- {:?}", id.0, line);

                // a FEED verb suspends reading until the main loop has
                // granted or refused feed mode
                let feed_candidate = line
                    .split_ascii_whitespace()
                    .next()
                    .is_some_and(|verb| verb.eq_ignore_ascii_case("feed"));

                server_handle.send(ToServer::Frame(id, Frame::Line(line))).await;

                if feed_candidate {
                    if mode.changed().await.is_err() {
                        break;
                    }
                    if *mode.borrow() == ReadMode::Feed {
                        framed.decoder_mut().set_feed();
                    }
                }
            }
            Ok(frame @ Frame::Feed(_)) => {
                server_handle.send(ToServer::Frame(id, frame)).await;
            }
            Err(ParseError::CommandLineTooLong) => {
                // over-long command lines terminate the connection
                debug!("{}: command line too long", id.0);
                break;
            }
            Err(ParseError::IoError(_)) => break,
        }
    }

    Ok(())
}

async fn tcp_write(
    id: SessionId,
    mut write: WriteHalf<'_>,
    server_handle: ServerHandle,
    recv: &mut Receiver<Bytes>,
) -> Result<(), io::Error> {
    while let Some(bytes) = recv.recv().await {
        trace!("{}: -> {} bytes", id.0, bytes.len());
        write.write_all(&bytes).await?;

        // drain whatever is already queued before reporting the outbox empty
        while let Ok(more) = recv.try_recv() {
            write.write_all(&more).await?;
        }
        write.flush().await?;

        server_handle.send(ToServer::Flushed(id)).await;
    }

    Ok(())
}
