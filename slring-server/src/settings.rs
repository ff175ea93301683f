use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use slring::{Acl, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "slring-server")]
#[command(version)]
#[command(about = "SeedLink ring-buffer streaming server", long_about = None)]
pub struct Args {
    /// TCP port for data requests with the SeedLink protocol.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// TCP port for SeedLink over SSL (terminated externally).
    #[arg(long)]
    pub sslport: Option<u16>,

    /// Location of the SSL certificate file.
    #[arg(long)]
    pub certificate: Option<PathBuf>,

    /// Location of the SSL private key file.
    #[arg(long)]
    pub private_key: Option<PathBuf>,

    /// Location of the ring storage.
    #[arg(long, default_value = "var/lib/slring")]
    pub filebase: PathBuf,

    /// Number of segments per station.
    #[arg(long, default_value_t = 10)]
    pub segments: usize,

    /// Segment size in bytes.
    #[arg(long, default_value_t = 1 << 20)]
    pub segsize: usize,

    /// Maximum record size, including the metadata header.
    #[arg(long, default_value_t = 10240)]
    pub recsize: usize,

    /// Organization reported by HELLO and INFO.
    #[arg(long, default_value = "Unconfigured")]
    pub organization: String,

    /// Network code assumed for v3 stations given without one.
    #[arg(long, default_value = "XX")]
    pub default_network: String,

    /// Station name of the v3 uni-station ring.
    #[arg(long, default_value = "LOCAL")]
    pub default_station: String,

    /// Trusted addresses/users (FEED, privileged INFO).
    #[arg(long, default_value = "127.0.0.1/8")]
    pub trusted: String,

    /// Default access list; empty admits everyone.
    #[arg(long, default_value = "")]
    pub access: String,

    /// Per-station bindings (JSON).
    #[arg(long)]
    pub stations: Option<PathBuf>,
}

/// Per-station configuration binding.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StationBinding {
    pub segments: Option<usize>,
    pub segsize: Option<usize>,
    pub recsize: Option<usize>,
    pub access: Option<String>,
    pub ordered: Option<bool>,
    pub description: Option<String>,
}

/// Resolved server settings shared by every session.
#[derive(Debug)]
pub struct Settings {
    pub port: u16,
    /// SSL listener port; termination happens outside this process.
    pub sslport: Option<u16>,
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub filebase: PathBuf,
    pub segments: usize,
    pub segsize: usize,
    pub recsize: usize,
    pub organization: String,
    pub default_network: String,
    pub default_station: String,
    pub trusted: Acl,
    pub access: Acl,
    pub station_access: HashMap<String, Acl>,
    pub descriptions: HashMap<String, String>,
    pub bindings: HashMap<String, StationBinding>,
}

impl Settings {
    pub fn from_args(args: Args) -> io::Result<Self> {
        let bindings: HashMap<String, StationBinding> = match &args.stations {
            Some(path) => {
                let raw = fs::read_to_string(path)?;
                serde_json::from_str(&raw)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
            }
            None => HashMap::new(),
        };

        let mut trusted = Acl::new();
        trusted.set(&args.trusted);
        let mut access = Acl::new();
        access.set(&args.access);

        let mut station_access = HashMap::new();
        let mut descriptions = HashMap::new();
        for (name, binding) in &bindings {
            if let Some(ref acl) = binding.access {
                let mut station_acl = Acl::new();
                station_acl.set(acl);
                station_access.insert(name.clone(), station_acl);
            }
            if let Some(ref desc) = binding.description {
                descriptions.insert(name.clone(), desc.clone());
            }
        }

        Ok(Self {
            port: args.port,
            sslport: args.sslport,
            certificate: args.certificate,
            private_key: args.private_key,
            filebase: args.filebase,
            segments: args.segments,
            segsize: args.segsize,
            recsize: args.recsize,
            organization: args.organization,
            default_network: args.default_network,
            default_station: args.default_station,
            trusted,
            access,
            station_access,
            descriptions,
            bindings,
        })
    }

    /// Ring capacity in records for a station without an explicit binding.
    pub fn nblocks(&self) -> usize {
        (self.segments * self.segsize / self.recsize).max(1)
    }

    /// Ring slot size in bytes.
    pub fn blocksize(&self) -> usize {
        self.recsize
    }

    /// Ring geometry for a station, honoring its binding if present.
    pub fn ring_geometry(&self, name: &str) -> (usize, usize) {
        match self.bindings.get(name) {
            Some(binding) => {
                let segments = binding.segments.unwrap_or(self.segments);
                let segsize = binding.segsize.unwrap_or(self.segsize);
                let recsize = binding.recsize.unwrap_or(self.recsize);
                ((segments * segsize / recsize).max(1), recsize)
            }
            None => (self.nblocks(), self.blocksize()),
        }
    }

    /// Whether a station's records are expected in time order.
    pub fn ordered(&self, name: &str) -> bool {
        self.bindings
            .get(name)
            .and_then(|binding| binding.ordered)
            .unwrap_or(false)
    }

    /// Station description, falling back to the ring name.
    pub fn description<'a>(&'a self, name: &'a str) -> &'a str {
        self.descriptions.get(name).map(String::as_str).unwrap_or(name)
    }
}
