use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;

use crate::client::{self, SessionInfo};
use crate::server::{ServerHandle, ToServer};

/// Starts accepting client connections.
pub async fn start_accept(bind: SocketAddr, server_handle: ServerHandle) {
    if let Err(err) = accept_loop(bind, server_handle.clone()).await {
        server_handle.send(ToServer::FatalError(err)).await;
    }
}

async fn accept_loop(bind: SocketAddr, server_handle: ServerHandle) -> Result<(), io::Error> {
    let listen = TcpListener::bind(bind).await?;

    loop {
        let (tcp, addr) = listen.accept().await?;

        let id = server_handle.next_id();

        let info = SessionInfo {
            addr,
            id,
            tcp,
            handle: server_handle.clone(),
        };

        client::spawn_session(info);
    }
}
