use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use slring::Storage;

use crate::settings::{Args, Settings};

mod accept;
mod client;
mod seedlink;
mod server;
mod session;
mod settings;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let settings = match Settings::from_args(args) {
        Ok(settings) => Arc::new(settings),
        Err(err) => {
            error!("invalid configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let mut storage = match Storage::open(&settings.filebase) {
        Ok(storage) => storage,
        Err(err) => {
            error!(
                "could not open storage at {}: {}",
                settings.filebase.display(),
                err
            );
            return ExitCode::FAILURE;
        }
    };

    // apply per-station bindings; a geometry change recreates the ring
    for name in settings.bindings.keys() {
        let (nblocks, blocksize) = settings.ring_geometry(name);
        match storage.create_ring(name, nblocks, blocksize) {
            Ok(ring) => {
                if let Err(err) = ring.ensure(nblocks, blocksize) {
                    error!("could not resize ring {}: {}", name, err);
                    return ExitCode::FAILURE;
                }
                ring.set_ordered(settings.ordered(name));
            }
            Err(err) => {
                error!("could not create ring {}: {}", name, err);
                return ExitCode::FAILURE;
            }
        }
    }

    let (server_handle, join_handle) = server::spawn_main_loop(settings.clone(), storage);

    let bind = ([0, 0, 0, 0], settings.port).into();
    tokio::spawn(accept::start_accept(bind, server_handle));

    info!("listening on port {}", settings.port);
    info!("organization: {}", settings.organization);

    if let Some(sslport) = settings.sslport {
        warn!(
            "TLS is terminated externally; forward port {} to {} ({:?}, {:?})",
            sslport, settings.port, settings.certificate, settings.private_key
        );
    }

    join_handle.await.expect("main loop panicked");
    ExitCode::SUCCESS
}
