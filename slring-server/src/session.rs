use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use regex::Regex;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use slring::{
    pack_info_v3, pack_info_v4, pack_record_v3, pack_record_v4, to_json, CapabilitiesInfo,
    Command, CursorId, CursorStep, DataCmd, Decoded, ErrorInfo, ErrorXml, FeedFrame, FormatCode,
    FormatRegistry, FormatsInfo, IdInfo, InfoCmd, InfoLevel, ProtocolError, SeedLinkError,
    SeedlinkXml, Selector, Sequence, SlProto, StationInfo, StationXml, StationsInfo, Storage,
    TimeCmd, CAPABILITIES, END_SIGNATURE, SEQ_UNSET, SOFTWARE,
};

use crate::settings::Settings;

/// Transfer buffer target per scheduling pass.
const COLLECT_BUDGET: usize = 5120;

/// Side effects of handling session input, performed by the connection
/// actor.
#[derive(Debug)]
pub enum Action {
    /// Bytes to enqueue on the socket.
    Send(Vec<u8>),
    /// Switch the reader to feed (binary) mode.
    EnterFeedMode,
    /// FEED was refused or ignored; the reader resumes line mode.
    StayCommandMode,
    /// Terminate the connection.
    Close,
}

/// Outcome of ingesting feed bytes.
#[derive(Debug, Default)]
pub struct FeedOutcome {
    pub actions: Vec<Action>,
    /// Cursor wake-ups as (owning session, ring name) pairs.
    pub wakes: Vec<(u64, String)>,
    /// Rings created by this batch, to broadcast to every session.
    pub new_stations: Vec<String>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SessionKind {
    Unspecific,
    Feed,
    Client,
}

/// Requested subscription parameters for one station (or one wildcard
/// pattern).
#[derive(Debug, Clone, Default)]
struct StationConfig {
    pattern: Option<Regex>,
    seq: Sequence,
    start: Option<OffsetDateTime>,
    end: Option<OffsetDateTime>,
    dialup: bool,
    selectors: Vec<Selector>,
}

impl StationConfig {
    fn new() -> Self {
        Self {
            seq: SEQ_UNSET,
            ..Default::default()
        }
    }

    fn with_pattern(pattern: Regex) -> Self {
        Self {
            pattern: Some(pattern),
            ..Self::new()
        }
    }

    fn matches(&self, name: &str) -> bool {
        self.pattern.as_ref().is_some_and(|re| re.is_match(name))
    }
}

/// Which station configuration subsequent SELECT/DATA/FETCH/TIME commands
/// apply to.
#[derive(Debug, Clone)]
enum Current {
    /// No STATION yet: v3 uni-station parameters.
    Uni,
    Station(String),
    Wildcard(usize),
    /// The last STATION failed; changes must not leak into earlier ones.
    Scratch,
}

/// Protocol state machine of one connection.
///
/// The session consumes decoded input frames and returns the actions the
/// connection actor has to perform; it owns no sockets itself.
pub struct Session {
    id: u64,
    ip: IpAddr,
    settings: Arc<Settings>,
    registry: Arc<FormatRegistry>,

    proto: Option<SlProto>,
    user: String,
    useragent: String,
    kind: SessionKind,
    batch: bool,
    transfer: bool,

    accept_all: bool,
    accept: Vec<FormatCode>,
    stations: BTreeMap<String, StationConfig>,
    wildcards: Vec<StationConfig>,
    current: Current,
    scratch: StationConfig,
    uni: StationConfig,

    cursors: HashMap<String, CursorId>,
    ready: VecDeque<String>,
    queued: HashSet<String>,

    feed_buf: BytesMut,
    started: OffsetDateTime,
}

fn wildcard_regex(pattern: &str) -> Regex {
    let escaped = regex::escape(pattern)
        .replace("\\?", ".")
        .replace("\\*", ".*");
    Regex::new(&format!("^(?:{})$", escaped)).expect("escaped pattern compiles")
}

fn is_feed_verb(line: &str) -> bool {
    line.split_ascii_whitespace()
        .next()
        .is_some_and(|verb| verb.eq_ignore_ascii_case("feed"))
}

impl Session {
    pub fn new(
        id: u64,
        ip: IpAddr,
        settings: Arc<Settings>,
        registry: Arc<FormatRegistry>,
    ) -> Self {
        Self {
            id,
            ip,
            settings,
            registry,
            proto: None,
            user: String::new(),
            useragent: String::new(),
            kind: SessionKind::Unspecific,
            batch: false,
            transfer: false,
            accept_all: false,
            accept: Vec::new(),
            stations: BTreeMap::new(),
            wildcards: Vec::new(),
            current: Current::Uni,
            scratch: StationConfig::new(),
            uni: StationConfig::new(),
            cursors: HashMap::new(),
            ready: VecDeque::new(),
            queued: HashSet::new(),
            feed_buf: BytesMut::new(),
            started: OffsetDateTime::now_utc(),
        }
    }

    /// Negotiated protocol version; v3 until told otherwise.
    fn proto(&self) -> SlProto {
        self.proto.unwrap_or(SlProto::V3)
    }

    /// Commands other than HELLO and SLPROTO pin the session to v3 when no
    /// explicit SLPROTO was given.
    fn lock_proto(&mut self) {
        if self.proto.is_none() {
            self.proto = Some(SlProto::V3);
        }
    }

    pub fn in_transfer(&self) -> bool {
        self.transfer
    }

    pub fn is_feed(&self) -> bool {
        self.kind == SessionKind::Feed
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    fn ok(&self) -> Vec<Action> {
        if self.batch {
            Vec::new()
        } else {
            vec![Action::Send(b"OK\r\n".to_vec())]
        }
    }

    fn protocol_error(&self, err: ProtocolError) -> Vec<Action> {
        match self.proto() {
            SlProto::V4 => vec![Action::Send(err.render(SlProto::V4).into_bytes())],
            SlProto::V3 => {
                if self.batch {
                    Vec::new()
                } else {
                    vec![Action::Send(err.render(SlProto::V3).into_bytes())]
                }
            }
        }
    }

    fn current_mut(&mut self) -> &mut StationConfig {
        match self.current {
            Current::Uni => &mut self.uni,
            Current::Scratch => &mut self.scratch,
            Current::Station(ref name) => self
                .stations
                .get_mut(name)
                .expect("current station exists"),
            Current::Wildcard(i) => &mut self.wildcards[i],
        }
    }

    fn check_access(&self, station: &str) -> bool {
        if self.settings.trusted.check(self.ip, &self.user) {
            return true;
        }

        if let Some(acl) = self.settings.station_access.get(station) {
            return acl.check(self.ip, &self.user);
        }

        self.settings.access.check(self.ip, &self.user)
    }

    /// Handles one command line, returning the actions to perform.
    pub fn handle_line(&mut self, line: &str, storage: &mut Storage) -> Vec<Action> {
        if line.trim().is_empty() {
            return Vec::new();
        }

        debug!("{}: $ {}", self.id, line);

        let feed_verb = is_feed_verb(line);

        let cmd = match Command::parse(line, self.proto()) {
            Ok(cmd) => cmd,
            Err(err) => {
                if err.info {
                    self.lock_proto();
                    return self.info_error(err);
                }
                let mut actions = self.protocol_error(err);
                if feed_verb {
                    actions.push(Action::StayCommandMode);
                }
                return actions;
            }
        };

        // INFO is the only command honored while transferring
        if let Command::Info(ref cmd) = cmd {
            self.lock_proto();
            self.kind = SessionKind::Client;
            let cmd = cmd.clone();
            return self.handle_info(&cmd, storage);
        }

        if self.transfer {
            if feed_verb {
                return vec![Action::StayCommandMode];
            }
            return Vec::new();
        }

        match cmd {
            Command::Hello => {
                vec![Action::Send(
                    format!("{}\r\n{}\r\n", SOFTWARE, self.settings.organization).into_bytes(),
                )]
            }
            Command::SlProto(cmd) => {
                if self.proto.is_some() {
                    return self.protocol_error(
                        ProtocolError::unsupported().with_message("multiple protocol switches"),
                    );
                }
                self.proto = Some(cmd.version);
                vec![Action::Send(b"OK\r\n".to_vec())]
            }
            Command::Batch => {
                self.lock_proto();
                if self.proto() == SlProto::V4 {
                    return self.protocol_error(ProtocolError::unsupported());
                }
                self.batch = true;
                vec![Action::Send(b"OK\r\n".to_vec())]
            }
            Command::UserAgent(cmd) => {
                self.lock_proto();
                self.useragent = cmd.agent;
                self.ok()
            }
            Command::GetCapabilities => {
                self.lock_proto();
                vec![Action::Send(format!("{}\r\n", CAPABILITIES).into_bytes())]
            }
            Command::Capabilities => {
                // compatibility no-op in v3
                self.lock_proto();
                if self.proto() == SlProto::V4 {
                    return self.protocol_error(ProtocolError::unsupported());
                }
                self.ok()
            }
            Command::Auth(cmd) => {
                self.lock_proto();
                // the credential check is delegated; the username feeds the
                // ACLs
                self.user = cmd.user;
                vec![Action::Send(b"OK\r\n".to_vec())]
            }
            Command::Feed => {
                self.lock_proto();
                self.handle_feed_switch()
            }
            Command::Accept(cmd) => {
                self.lock_proto();
                if self.proto() == SlProto::V3 {
                    return self.protocol_error(ProtocolError::unsupported());
                }
                self.kind = SessionKind::Client;
                self.accept_all |= cmd.all;
                self.accept.extend(cmd.formats);
                vec![Action::Send(b"OK\r\n".to_vec())]
            }
            Command::Station(cmd) => {
                self.lock_proto();
                self.kind = SessionKind::Client;
                self.handle_station(cmd.sta, cmd.net)
            }
            Command::Select(cmd) => {
                self.lock_proto();
                self.kind = SessionKind::Client;
                let cfg = self.current_mut();
                if cmd.clear {
                    cfg.selectors.clear();
                } else {
                    cfg.selectors.extend(cmd.selectors);
                }
                self.ok()
            }
            Command::Data(cmd) => {
                self.lock_proto();
                self.kind = SessionKind::Client;
                self.handle_data(cmd, storage)
            }
            Command::Time(cmd) => {
                self.lock_proto();
                self.kind = SessionKind::Client;
                self.handle_time(cmd, storage)
            }
            Command::End => {
                self.lock_proto();
                self.kind = SessionKind::Client;
                if self.stations.is_empty() && self.wildcards.is_empty() {
                    // no stations requested
                    return vec![Action::Send(END_SIGNATURE.to_vec())];
                }
                self.start_transfer(storage)
            }
            Command::EndFetch => {
                self.lock_proto();
                if self.proto() == SlProto::V3 {
                    return self.protocol_error(ProtocolError::unsupported());
                }
                self.kind = SessionKind::Client;
                for cfg in self.stations.values_mut().chain(self.wildcards.iter_mut()) {
                    cfg.dialup = true;
                }
                if self.stations.is_empty() && self.wildcards.is_empty() {
                    return vec![Action::Send(END_SIGNATURE.to_vec())];
                }
                self.start_transfer(storage)
            }
            Command::Cat => {
                self.lock_proto();
                if self.proto() == SlProto::V4 {
                    return self.protocol_error(
                        ProtocolError::unsupported().with_message("not supported in v4"),
                    );
                }
                self.kind = SessionKind::Client;
                self.handle_cat(storage)
            }
            Command::Bye => vec![Action::Close],
            Command::Info(_) => unreachable!("handled above"),
        }
    }

    fn handle_feed_switch(&mut self) -> Vec<Action> {
        if self.kind != SessionKind::Unspecific {
            let mut actions = self.protocol_error(
                ProtocolError::unsupported().with_message("using FEED in client mode"),
            );
            actions.push(Action::StayCommandMode);
            return actions;
        }

        if !self.settings.trusted.check(self.ip, &self.user) {
            debug!("FEED access denied for {} ({})", self.ip, self.user);
            let mut actions = self
                .protocol_error(ProtocolError::unauthorized().with_message("FEED access denied"));
            actions.push(Action::StayCommandMode);
            return actions;
        }

        self.kind = SessionKind::Feed;
        vec![Action::Send(b"OK\r\n".to_vec()), Action::EnterFeedMode]
    }

    fn handle_station(&mut self, sta: String, net: Option<String>) -> Vec<Action> {
        // a fresh configuration; a failed STATION must not redirect later
        // SELECT/DATA commands at the previous one
        self.current = Current::Scratch;
        self.scratch = StationConfig::new();

        let name = match self.proto() {
            SlProto::V4 => {
                if net.is_none() && sta.contains('.') {
                    sta
                } else {
                    format!("{}.{}", net.as_deref().unwrap_or("*"), sta)
                }
            }
            SlProto::V3 => {
                let net = net.unwrap_or_else(|| self.settings.default_network.clone());
                format!("{}.{}", net, sta)
            }
        };

        if name.contains('?') || name.contains('*') {
            self.wildcards
                .push(StationConfig::with_pattern(wildcard_regex(&name)));
            self.current = Current::Wildcard(self.wildcards.len() - 1);
        } else {
            self.stations.entry(name.clone()).or_insert_with(StationConfig::new);
            self.current = Current::Station(name);
        }

        self.ok()
    }

    fn handle_data(&mut self, cmd: DataCmd, storage: &mut Storage) -> Vec<Action> {
        let multi = !self.stations.is_empty() || !self.wildcards.is_empty();

        if self.proto() == SlProto::V4 && !multi {
            return self.protocol_error(
                ProtocolError::unsupported().with_message("uni-station mode is not supported in v4"),
            );
        }

        if cmd.seq != SEQ_UNSET && matches!(self.current, Current::Wildcard(_)) {
            return self.protocol_error(
                ProtocolError::arguments()
                    .with_message("using sequence number with wildcard is not supported"),
            );
        }

        let cfg = self.current_mut();
        cfg.seq = cmd.seq;
        cfg.start = cmd.start;
        cfg.end = cmd.end;
        cfg.dialup = cmd.dialup;

        if !multi {
            // uni-station mode, v3 only
            return self.start_transfer(storage);
        }

        self.ok()
    }

    fn handle_time(&mut self, cmd: TimeCmd, storage: &mut Storage) -> Vec<Action> {
        if self.proto() == SlProto::V4 {
            return self
                .protocol_error(ProtocolError::unsupported().with_message("not supported in v4"));
        }

        let multi = !self.stations.is_empty() || !self.wildcards.is_empty();

        let cfg = self.current_mut();
        cfg.seq = 0;
        cfg.start = Some(cmd.start);
        cfg.end = cmd.end;
        cfg.dialup = false;

        if !multi {
            return self.start_transfer(storage);
        }

        self.ok()
    }

    fn handle_cat(&mut self, storage: &Storage) -> Vec<Action> {
        let mut out = Vec::new();

        for name in storage.cat() {
            if !self.check_access(&name) {
                continue;
            }

            if let Some((net, sta)) = name.split_once('.') {
                let desc = self.settings.description(&name);
                out.extend(format!("{} {} {}\r\n", net, sta, desc).into_bytes());
            }
        }

        out.extend_from_slice(END_SIGNATURE);
        vec![Action::Send(out)]
    }

    /// Builds cursors for all resolved stations and enters transfer mode.
    fn start_transfer(&mut self, storage: &mut Storage) -> Vec<Action> {
        self.ready.clear();
        self.queued.clear();

        if self.stations.is_empty() && self.wildcards.is_empty() {
            // uni-station mode streams the default ring, creating it on
            // first use
            let name = format!(
                "{}.{}",
                self.settings.default_network, self.settings.default_station
            );
            let (nblocks, blocksize) = self.settings.ring_geometry(&name);
            match storage.create_ring(&name, nblocks, blocksize) {
                Ok(ring) => ring.set_ordered(self.settings.ordered(&name)),
                Err(err) => {
                    error!("could not create ring {}: {}", name, err);
                    return vec![Action::Close];
                }
            }

            let cfg = self.uni.clone();
            self.attach_cursor(&name, &cfg, storage);
        } else {
            let names: Vec<String> = self.stations.keys().cloned().collect();
            for name in names {
                if !self.check_access(&name) {
                    info!("access to {} denied for {} ({})", name, self.ip, self.user);
                    continue;
                }
                if storage.ring(&name).is_none() {
                    continue; // future station
                }

                let cfg = self.stations[&name].clone();
                self.attach_cursor(&name, &cfg, storage);
            }

            for i in 0..self.wildcards.len() {
                for name in storage.cat() {
                    if self.stations.contains_key(&name) || self.cursors.contains_key(&name) {
                        continue;
                    }
                    if !self.wildcards[i].matches(&name) {
                        continue;
                    }
                    if !self.check_access(&name) {
                        debug!("access to {} denied for {} ({})", name, self.ip, self.user);
                        continue;
                    }

                    let cfg = self.wildcards[i].clone();
                    self.attach_cursor(&name, &cfg, storage);
                }
            }
        }

        self.transfer = true;

        // with no cursor attached yet (future stations, unmatched wildcard
        // patterns) the session waits for station_avail instead of ending
        if self.ready.is_empty() {
            return Vec::new();
        }

        let data = self.collect_data(storage);
        if data.is_empty() {
            Vec::new()
        } else {
            vec![Action::Send(data)]
        }
    }

    /// Creates and parameterizes a cursor on `name` from the given station
    /// configuration.
    fn attach_cursor(&mut self, name: &str, cfg: &StationConfig, storage: &mut Storage) {
        let proto = self.proto();
        let Some(ring) = storage.ring_mut(name) else {
            return;
        };

        let cursor = ring.cursor(self.id);
        ring.set_sequence(cursor, cfg.seq, proto);
        if let Some(t) = cfg.start {
            ring.set_start_time(cursor, t);
        }
        if let Some(t) = cfg.end {
            ring.set_end_time(cursor, t);
        }
        ring.set_dialup(cursor, cfg.dialup);
        for sel in &cfg.selectors {
            ring.select(cursor, sel.clone());
        }

        match proto {
            SlProto::V3 => {
                // legacy mode carries miniSEED 2.x only
                for code in [b"2D", b"2E", b"2C", b"2T", b"2O", b"2L"] {
                    ring.accept(cursor, FormatCode::new(*code).expect("static format code"));
                }
            }
            SlProto::V4 => {
                if !self.accept_all {
                    for code in &self.accept {
                        ring.accept(cursor, *code);
                    }
                }
            }
        }

        self.cursors.insert(name.to_string(), cursor);
        self.enqueue(name.to_string());
    }

    fn enqueue(&mut self, name: String) {
        if self.queued.insert(name.clone()) {
            self.ready.push_back(name);
        }
    }

    /// Re-arms the station after a ring append (`dataAvail`).
    pub fn wake(&mut self, ring_name: &str) {
        if self.transfer && self.cursors.contains_key(ring_name) {
            self.enqueue(ring_name.to_string());
        }
    }

    /// Attaches a newly created ring if an explicit or wildcard station
    /// subscription covers it.
    pub fn station_avail(&mut self, name: &str, storage: &mut Storage) {
        if !self.transfer || self.cursors.contains_key(name) {
            return;
        }

        let cfg = match self.stations.get(name) {
            Some(cfg) => Some(cfg.clone()),
            None => self
                .wildcards
                .iter()
                .find(|cfg| cfg.matches(name))
                .cloned(),
        };
        let Some(cfg) = cfg else {
            return;
        };

        if !self.check_access(name) {
            debug!("access to {} denied for {} ({})", name, self.ip, self.user);
            return;
        }

        self.attach_cursor(name, &cfg, storage);
    }

    /// Drains the ready stations round-robin into one output buffer.
    ///
    /// Returns the framed bytes; when every cursor is gone the terminating
    /// `END` is appended and transfer mode ends.
    pub fn collect_data(&mut self, storage: &mut Storage) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(COLLECT_BUDGET + 1024);
        if !self.transfer {
            return buffer;
        }

        while buffer.len() < COLLECT_BUDGET {
            let Some(name) = self.ready.pop_front() else {
                break;
            };
            self.queued.remove(&name);

            let Some(&cursor) = self.cursors.get(&name) else {
                continue;
            };
            let Some(ring) = storage.ring_mut(&name) else {
                self.cursors.remove(&name);
                continue;
            };

            match ring.advance(cursor) {
                Ok(CursorStep::Data(rec)) => {
                    match self.proto() {
                        SlProto::V3 => match pack_record_v3(&rec) {
                            Ok(framed) => buffer.extend(framed),
                            Err(err) => {
                                // skipped, not legacy-representable
                                warn!("{}: {}", name, err);
                            }
                        },
                        SlProto::V4 => buffer.extend(pack_record_v4(&rec)),
                    }
                    self.enqueue(name);
                }
                Ok(CursorStep::Blocked) => {
                    // out of the ready set, still subscribed
                }
                Ok(CursorStep::End) => {
                    self.cursors.remove(&name);
                }
                Err(err) => {
                    error!("cursor on {} failed: {}", name, err);
                    ring.remove_cursor(cursor);
                    self.cursors.remove(&name);
                }
            }
        }

        if self.cursors.is_empty() {
            buffer.extend_from_slice(END_SIGNATURE);
            self.transfer = false;
        }

        buffer
    }

    /// Ingests feed bytes: reassembles frames, decodes records and appends
    /// them to their station rings.
    pub fn handle_feed(&mut self, data: &[u8], storage: &mut Storage) -> FeedOutcome {
        let mut outcome = FeedOutcome::default();

        self.feed_buf.extend_from_slice(data);

        let settings = self.settings.clone();
        let registry = self.registry.clone();
        let session_id = self.id;
        let mut consumed = 0;

        loop {
            let buf = &self.feed_buf[consumed..];

            let frame = match FeedFrame::parse(buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    error!("{}: {}", session_id, err);
                    outcome.actions.push(Action::Close);
                    break;
                }
            };

            let total = frame.total;
            let code = frame.format.unwrap_or(FormatCode::MSEED2_DATA);

            let decoded = match registry.decode(code, frame.payload) {
                None => {
                    error!("{}: unsupported format {}", session_id, code);
                    outcome.actions.push(Action::Close);
                    break;
                }
                Some(Ok(Decoded::Complete { record, .. })) => {
                    Some((record, frame.seq, frame.seq24))
                }
                Some(Ok(Decoded::Incomplete)) | Some(Err(_)) => {
                    // bad record; the frame is consumed and the feed goes on
                    warn!("{}: invalid {} record dropped", session_id, code);
                    None
                }
            };
            consumed += total;

            let Some((record, seq, seq24)) = decoded else {
                continue;
            };

            let name = record.station().to_string();

            if storage.ring(&name).is_none() {
                info!("new station {}", name);
                let (nblocks, blocksize) = settings.ring_geometry(&name);
                match storage.create_ring(&name, nblocks, blocksize) {
                    Ok(ring) => {
                        ring.set_ordered(settings.ordered(&name));
                        outcome.new_stations.push(name.clone());
                    }
                    Err(err) => {
                        error!("could not create ring {}: {}", name, err);
                        outcome.actions.push(Action::Close);
                        break;
                    }
                }
            }

            let ring = storage.ring_mut(&name).expect("ring exists");
            let seq = if seq24 && seq != SEQ_UNSET {
                (ring.endseq() & !0xffffff) | (seq & 0xffffff)
            } else {
                seq
            };

            match ring.put(record, seq) {
                Ok(Some(append)) => {
                    for wake in append.wakes {
                        outcome.wakes.push((wake.client, name.clone()));
                    }
                }
                Ok(None) => {
                    warn!("dropped record for {} (seq {:X})", name, seq);
                }
                Err(err @ SeedLinkError::RecordTooLarge { .. }) => {
                    warn!("dropped record for {}: {}", name, err);
                }
                Err(err) => {
                    error!("ring {} failed: {}", name, err);
                    outcome.actions.push(Action::Close);
                    break;
                }
            }
        }

        self.feed_buf.advance(consumed);

        outcome
    }

    fn handle_info(&mut self, cmd: &InfoCmd, storage: &Storage) -> Vec<Action> {
        let proto = self.proto();

        match cmd.level {
            InfoLevel::Formats | InfoLevel::Capabilities if proto == SlProto::V3 => {
                return self.info_error(
                    ProtocolError::arguments()
                        .with_message("requested info level is not supported"),
                );
            }
            InfoLevel::Connections => {
                if !self.settings.trusted.check(self.ip, &self.user) {
                    return self.info_error(
                        ProtocolError::unauthorized()
                            .with_message("requested info level is not allowed"),
                    );
                }
                return self.info_error(
                    ProtocolError::arguments()
                        .with_message("requested info level is not implemented"),
                );
            }
            _ => {}
        }

        let id = IdInfo {
            software: SOFTWARE.to_string(),
            organization: self.settings.organization.clone(),
        };

        let with_streams = cmd.level >= InfoLevel::Streams;
        let filter = wildcard_regex(&format!(
            "{}.{}",
            cmd.net.as_deref().unwrap_or("*"),
            cmd.sta.as_deref().unwrap_or("*")
        ));

        let station_names: Vec<String> = if cmd.level >= InfoLevel::Stations {
            storage
                .cat()
                .into_iter()
                .filter(|name| filter.is_match(name) && self.check_access(name))
                .collect()
        } else {
            Vec::new()
        };

        match proto {
            SlProto::V4 => {
                let json = match cmd.level {
                    InfoLevel::Id => to_json(&id),
                    InfoLevel::Formats => to_json(&FormatsInfo::new(id, &self.registry)),
                    InfoLevel::Capabilities => to_json(&CapabilitiesInfo {
                        id,
                        capability: CAPABILITIES
                            .split_ascii_whitespace()
                            .map(str::to_string)
                            .collect(),
                    }),
                    InfoLevel::Stations | InfoLevel::Streams => {
                        let station = station_names
                            .iter()
                            .map(|name| {
                                let ring = storage.ring(name).expect("listed ring exists");
                                StationInfo::from_ring(
                                    ring,
                                    self.settings.description(name),
                                    with_streams,
                                )
                            })
                            .collect();
                        to_json(&StationsInfo { id, station })
                    }
                    InfoLevel::Connections => unreachable!("handled above"),
                };

                match json {
                    Ok(json) => vec![Action::Send(pack_info_v4(&json, false))],
                    Err(err) => {
                        error!("info serialization failed: {}", err);
                        self.info_error(ProtocolError::internal())
                    }
                }
            }
            SlProto::V3 => {
                let mut doc =
                    SeedlinkXml::new(SOFTWARE, &self.settings.organization, self.started);
                for name in &station_names {
                    let ring = storage.ring(name).expect("listed ring exists");
                    doc.stations.push(StationXml::from_ring(
                        ring,
                        self.settings.description(name),
                        with_streams,
                    ));
                }

                match doc.to_xml() {
                    Ok(xml) => vec![Action::Send(pack_info_v3(
                        "INF",
                        &xml,
                        OffsetDateTime::now_utc(),
                    ))],
                    Err(err) => {
                        error!("info serialization failed: {}", err);
                        self.info_error(ProtocolError::internal())
                    }
                }
            }
        }
    }

    /// Sends an INFO error response in the negotiated framing.
    fn info_error(&self, err: ProtocolError) -> Vec<Action> {
        match self.proto() {
            SlProto::V4 => {
                let doc = ErrorInfo {
                    id: IdInfo {
                        software: SOFTWARE.to_string(),
                        organization: self.settings.organization.clone(),
                    },
                    error: err,
                };
                match to_json(&doc) {
                    Ok(json) => vec![Action::Send(pack_info_v4(&json, true))],
                    Err(e) => {
                        error!("info serialization failed: {}", e);
                        vec![Action::Close]
                    }
                }
            }
            SlProto::V3 => {
                let mut doc =
                    SeedlinkXml::new(SOFTWARE, &self.settings.organization, self.started);
                doc.error = Some(ErrorXml {
                    code: err.code.to_string(),
                    message: err
                        .message
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| err.code.description().to_string()),
                });
                match doc.to_xml() {
                    Ok(xml) => vec![Action::Send(pack_info_v3(
                        "ERR",
                        &xml,
                        OffsetDateTime::now_utc(),
                    ))],
                    Err(e) => {
                        error!("info serialization failed: {}", e);
                        vec![Action::Close]
                    }
                }
            }
        }
    }

    /// Unregisters every cursor; called when the connection goes away.
    pub fn drop_cursors(&mut self, storage: &mut Storage) {
        if !self.useragent.is_empty() {
            debug!("{}: closing session of {}", self.id, self.useragent);
        }

        for (name, cursor) in self.cursors.drain() {
            if let Some(ring) = storage.ring_mut(&name) {
                ring.remove_cursor(cursor);
            }
        }
        self.ready.clear();
        self.queued.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use clap::Parser;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use time::macros::datetime;

    use slring::Record;

    use crate::settings::Args;

    fn test_settings() -> Arc<Settings> {
        Arc::new(Settings::from_args(Args::parse_from(["slring-server"])).unwrap())
    }

    fn test_session(id: u64, ip: &str) -> (Session, Storage, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let session = Session::new(
            id,
            ip.parse().unwrap(),
            test_settings(),
            Arc::new(FormatRegistry::standard()),
        );
        (session, storage, dir)
    }

    /// Builds a valid 512-byte miniSEED 2.x data record.
    fn ms2_record(net: &str, sta: &str, minute: u8) -> Vec<u8> {
        let mut rec = vec![0u8; 512];
        rec[..6].copy_from_slice(b"000001");
        rec[6] = b'D';
        rec[7] = b' ';
        rec[8..13].copy_from_slice(format!("{:<5}", sta).as_bytes());
        rec[13..15].copy_from_slice(b"00");
        rec[15..18].copy_from_slice(b"BHZ");
        rec[18..20].copy_from_slice(format!("{:<2}", net).as_bytes());
        rec[20..22].copy_from_slice(&2024u16.to_be_bytes());
        rec[22..24].copy_from_slice(&32u16.to_be_bytes());
        rec[24] = 10;
        rec[25] = minute;
        rec[30..32].copy_from_slice(&100u16.to_be_bytes());
        rec[32..34].copy_from_slice(&20i16.to_be_bytes());
        rec[34..36].copy_from_slice(&1i16.to_be_bytes());
        rec[39] = 1;
        rec[44..46].copy_from_slice(&64u16.to_be_bytes());
        rec[46..48].copy_from_slice(&48u16.to_be_bytes());
        rec[48..50].copy_from_slice(&1000u16.to_be_bytes());
        rec[52] = 11;
        rec[53] = 1;
        rec[54] = 9;
        rec
    }

    fn stored_record(station: &str, payload: Vec<u8>, format: &str) -> Record {
        Record::new(
            station,
            "00_B_H_Z",
            format.parse().unwrap(),
            datetime!(2024-02-01 10:00:00 UTC),
            datetime!(2024-02-01 10:00:05 UTC),
            Bytes::from(payload),
        )
        .unwrap()
    }

    fn sent(actions: &[Action]) -> Vec<u8> {
        let mut out = Vec::new();
        for action in actions {
            if let Action::Send(bytes) = action {
                out.extend_from_slice(bytes);
            }
        }
        out
    }

    #[test]
    fn v3_handshake_and_legacy_streaming() {
        // S4
        let (mut session, mut storage, _dir) = test_session(1, "192.0.2.1");

        let ring = storage.create_ring("XX.STA", 16, 1024).unwrap();
        ring.put(stored_record("XX.STA", ms2_record("XX", "STA", 0), "2D"), SEQ_UNSET)
            .unwrap()
            .unwrap();

        let hello = sent(&session.handle_line("HELLO", &mut storage));
        let hello = String::from_utf8(hello).unwrap();
        assert!(hello.starts_with("SeedLink v4.0"));
        assert!(hello.ends_with("Unconfigured\r\n"));

        assert_eq!(
            sent(&session.handle_line("STATION STA XX", &mut storage)),
            b"OK\r\n"
        );
        assert_eq!(
            sent(&session.handle_line("DATA 000000", &mut storage)),
            b"OK\r\n"
        );

        let data = sent(&session.handle_line("END", &mut storage));
        assert_eq!(data.len(), 520);
        assert_eq!(&data[..2], b"SL");
        assert_eq!(&data[2..8], b"000000");
        assert!(session.in_transfer());
    }

    #[test]
    fn v3_streaming_live_records() {
        let (mut session, mut storage, _dir) = test_session(1, "192.0.2.1");
        storage.create_ring("XX.STA", 16, 1024).unwrap();

        session.handle_line("STATION STA XX", &mut storage);
        session.handle_line("DATA", &mut storage);
        let initial = sent(&session.handle_line("END", &mut storage));
        assert!(initial.is_empty());

        // a new record arrives and wakes the cursor
        let append = storage
            .ring_mut("XX.STA")
            .unwrap()
            .put(stored_record("XX.STA", ms2_record("XX", "STA", 1), "2D"), SEQ_UNSET)
            .unwrap()
            .unwrap();
        assert_eq!(append.wakes.len(), 1);
        assert_eq!(append.wakes[0].client, 1);

        session.wake("XX.STA");
        let data = session.collect_data(&mut storage);
        assert_eq!(data.len(), 520);
        assert_eq!(&data[..2], b"SL");
    }

    #[test]
    fn v4_wildcard_with_selector() {
        // S5
        let (mut session, mut storage, _dir) = test_session(1, "192.0.2.1");
        storage.create_ring("XX.STA", 16, 1024).unwrap();
        storage.create_ring("XX.STB", 16, 1024).unwrap();
        storage.create_ring("YY.STB", 16, 1024).unwrap();

        assert_eq!(sent(&session.handle_line("SLPROTO 4.0", &mut storage)), b"OK\r\n");
        assert_eq!(
            sent(&session.handle_line("STATION XX.ST?", &mut storage)),
            b"OK\r\n"
        );
        assert_eq!(
            sent(&session.handle_line("SELECT *.*.2D", &mut storage)),
            b"OK\r\n"
        );
        assert_eq!(sent(&session.handle_line("DATA", &mut storage)), b"OK\r\n");

        assert!(sent(&session.handle_line("END", &mut storage)).is_empty());
        assert!(session.cursors.contains_key("XX.STA"));
        assert!(session.cursors.contains_key("XX.STB"));
        assert!(!session.cursors.contains_key("YY.STB"));

        // matching record: framed with the SE header
        let append = storage
            .ring_mut("XX.STA")
            .unwrap()
            .put(stored_record("XX.STA", vec![0xaa; 64], "2D"), SEQ_UNSET)
            .unwrap()
            .unwrap();
        for wake in append.wakes {
            assert_eq!(wake.client, 1);
            session.wake("XX.STA");
        }

        let data = session.collect_data(&mut storage);
        assert_eq!(&data[..2], b"SE");
        assert_eq!(&data[2..4], b"2D");

        // non-matching format: skipped
        storage
            .ring_mut("XX.STB")
            .unwrap()
            .put(stored_record("XX.STB", vec![0xbb; 64], "3D"), SEQ_UNSET)
            .unwrap()
            .unwrap();
        session.wake("XX.STB");
        assert!(session.collect_data(&mut storage).is_empty());
    }

    #[test]
    fn feed_skips_bad_frames() {
        // S6
        let (mut session, mut storage, _dir) = test_session(1, "127.0.0.1");

        let actions = session.handle_line("FEED", &mut storage);
        assert_eq!(sent(&actions), b"OK\r\n");
        assert!(matches!(actions[1], Action::EnterFeedMode));
        assert!(session.is_feed());

        // an undecodable record: consumed, session stays open
        let mut bad = Vec::new();
        bad.extend(b"SL000001");
        bad.extend([0u8; 512]);
        let outcome = session.handle_feed(&bad, &mut storage);
        assert!(outcome.actions.is_empty());
        assert!(outcome.new_stations.is_empty());
        assert_eq!(session.feed_buf.len(), 0);

        // a subsequent valid frame is accepted and creates the ring
        let mut good = Vec::new();
        good.extend(b"SL000000");
        good.extend(ms2_record("XX", "STA", 0));
        let outcome = session.handle_feed(&good, &mut storage);
        assert!(outcome.actions.is_empty());
        assert_eq!(outcome.new_stations, vec!["XX.STA".to_string()]);
        assert_eq!(storage.ring("XX.STA").unwrap().endseq(), 1);
    }

    #[test]
    fn feed_closes_on_garbage() {
        let (mut session, mut storage, _dir) = test_session(1, "127.0.0.1");
        session.handle_line("FEED", &mut storage);

        let outcome = session.handle_feed(b"GET / HTTP/1.1\r\nHost: x\r\n", &mut storage);
        assert!(matches!(outcome.actions[..], [Action::Close]));
    }

    #[test]
    fn feed_reassembles_partial_frames() {
        let (mut session, mut storage, _dir) = test_session(1, "127.0.0.1");
        session.handle_line("FEED", &mut storage);

        let mut frame = Vec::new();
        frame.extend(b"SL000000");
        frame.extend(ms2_record("XX", "STA", 0));

        let outcome = session.handle_feed(&frame[..100], &mut storage);
        assert!(outcome.new_stations.is_empty());

        let outcome = session.handle_feed(&frame[100..], &mut storage);
        assert_eq!(outcome.new_stations, vec!["XX.STA".to_string()]);
    }

    #[test]
    fn feed_requires_trust() {
        let (mut session, mut storage, _dir) = test_session(1, "192.0.2.1");

        let actions = session.handle_line("FEED", &mut storage);
        let reply = String::from_utf8(sent(&actions)).unwrap();
        assert_eq!(reply, "ERROR\r\n");
        assert!(matches!(actions.last(), Some(Action::StayCommandMode)));
        assert!(!session.is_feed());
    }

    #[test]
    fn slproto_switches_once() {
        let (mut session, mut storage, _dir) = test_session(1, "192.0.2.1");

        assert_eq!(sent(&session.handle_line("SLPROTO 4.0", &mut storage)), b"OK\r\n");
        let reply = String::from_utf8(sent(&session.handle_line("SLPROTO 3.0", &mut storage)))
            .unwrap();
        assert!(reply.starts_with("ERROR UNSUPPORTED"));
    }

    #[test]
    fn batch_suppresses_acknowledgements() {
        let (mut session, mut storage, _dir) = test_session(1, "192.0.2.1");

        assert_eq!(sent(&session.handle_line("BATCH", &mut storage)), b"OK\r\n");
        assert!(sent(&session.handle_line("STATION STA XX", &mut storage)).is_empty());
        // errors are suppressed too in v3 batch mode
        assert!(sent(&session.handle_line("STATION st!", &mut storage)).is_empty());
    }

    #[test]
    fn v4_rejects_v3_only_commands() {
        let (mut session, mut storage, _dir) = test_session(1, "192.0.2.1");
        session.handle_line("SLPROTO 4.0", &mut storage);

        for cmd in ["BATCH", "CAT", "TIME 2024,2,1,0,0,0"] {
            let reply = String::from_utf8(sent(&session.handle_line(cmd, &mut storage))).unwrap();
            assert!(reply.starts_with("ERROR UNSUPPORTED"), "{}: {}", cmd, reply);
        }
    }

    #[test]
    fn v4_rejects_uni_station_mode() {
        let (mut session, mut storage, _dir) = test_session(1, "192.0.2.1");
        session.handle_line("SLPROTO 4.0", &mut storage);

        let reply = String::from_utf8(sent(&session.handle_line("DATA", &mut storage))).unwrap();
        assert!(reply.starts_with("ERROR UNSUPPORTED"));
    }

    #[test]
    fn cat_lists_stations() {
        let (mut session, mut storage, _dir) = test_session(1, "192.0.2.1");
        storage.create_ring("XX.STA", 4, 1024).unwrap();
        storage.create_ring("YY.STB", 4, 1024).unwrap();

        let reply = String::from_utf8(sent(&session.handle_line("CAT", &mut storage))).unwrap();
        assert_eq!(reply, "XX STA XX.STA\r\nYY STB YY.STB\r\nEND");
    }

    #[test]
    fn end_without_stations() {
        let (mut session, mut storage, _dir) = test_session(1, "192.0.2.1");
        assert_eq!(sent(&session.handle_line("END", &mut storage)), b"END");
        assert!(!session.in_transfer());
    }

    #[test]
    fn endfetch_marks_all_stations_dialup() {
        let (mut session, mut storage, _dir) = test_session(1, "192.0.2.1");
        storage.create_ring("XX.STA", 16, 1024).unwrap();
        let ring = storage.ring_mut("XX.STA").unwrap();
        ring.put(stored_record("XX.STA", vec![0xaa; 64], "2D"), SEQ_UNSET)
            .unwrap()
            .unwrap();

        session.handle_line("SLPROTO 4.0", &mut storage);
        session.handle_line("STATION XX.STA", &mut storage);
        session.handle_line("DATA 0", &mut storage);

        let data = sent(&session.handle_line("ENDFETCH", &mut storage));
        // one SE frame followed by the terminating END
        assert_eq!(&data[..2], b"SE");
        assert_eq!(&data[data.len() - 3..], b"END");
        assert!(!session.in_transfer());
    }

    #[test]
    fn info_id_v4_uses_sej_framing() {
        let (mut session, mut storage, _dir) = test_session(1, "192.0.2.1");
        session.handle_line("SLPROTO 4.0", &mut storage);

        let data = sent(&session.handle_line("INFO ID", &mut storage));
        assert_eq!(&data[..3], b"SEJ");
        assert_eq!(data[3], b'I');

        let len = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        assert_eq!(data.len(), 16 + len);
        let doc: serde_json::Value = serde_json::from_slice(&data[16..]).unwrap();
        assert_eq!(doc["organization"], "Unconfigured");
    }

    #[test]
    fn info_id_v3_uses_log_records() {
        let (mut session, mut storage, _dir) = test_session(1, "192.0.2.1");

        let data = sent(&session.handle_line("INFO ID", &mut storage));
        assert_eq!(data.len() % 520, 0);
        assert_eq!(&data[..6], b"SLINFO");
        // terminating record flag
        assert_eq!(&data[data.len() - 520 + 6..data.len() - 520 + 8], b"  ");
    }

    #[test]
    fn info_connections_requires_trust() {
        let (mut session, mut storage, _dir) = test_session(1, "192.0.2.1");
        session.handle_line("SLPROTO 4.0", &mut storage);

        let data = sent(&session.handle_line("INFO CONNECTIONS", &mut storage));
        assert_eq!(&data[..3], b"SEJ");
        assert_eq!(data[3], b'E');
        let doc: serde_json::Value = serde_json::from_slice(&data[16..]).unwrap();
        assert_eq!(doc["error"]["code"], "UNAUTHORIZED");
    }

    #[test]
    fn station_avail_attaches_during_transfer() {
        let (mut session, mut storage, _dir) = test_session(1, "192.0.2.1");

        session.handle_line("SLPROTO 4.0", &mut storage);
        session.handle_line("STATION XX.*", &mut storage);
        session.handle_line("DATA", &mut storage);
        session.handle_line("END", &mut storage);
        assert!(session.cursors.is_empty());
        assert!(session.in_transfer());

        storage.create_ring("XX.NEW", 16, 1024).unwrap();
        session.station_avail("XX.NEW", &mut storage);
        assert!(session.cursors.contains_key("XX.NEW"));

        session.station_avail("YY.OTHER", &mut storage);
        assert!(!session.cursors.contains_key("YY.OTHER"));
    }

    #[test]
    fn round_robin_across_stations() {
        let (mut session, mut storage, _dir) = test_session(1, "192.0.2.1");
        for name in ["XX.STA1", "XX.STA2"] {
            let ring = storage.create_ring(name, 16, 1024).unwrap();
            for _ in 0..2 {
                ring.put(stored_record(name, vec![0xaa; 64], "2D"), SEQ_UNSET)
                    .unwrap()
                    .unwrap();
            }
        }

        session.handle_line("SLPROTO 4.0", &mut storage);
        session.handle_line("STATION XX.STA1", &mut storage);
        session.handle_line("DATA 0", &mut storage);
        session.handle_line("STATION XX.STA2", &mut storage);
        session.handle_line("DATA 0", &mut storage);

        let data = sent(&session.handle_line("END", &mut storage));

        // frames alternate between the two stations
        let mut stations = Vec::new();
        let mut rest = &data[..];
        while rest.len() > 17 && &rest[..2] == b"SE" {
            let payload_len = u32::from_le_bytes(rest[4..8].try_into().unwrap()) as usize;
            let sta_len = rest[16] as usize;
            stations.push(String::from_utf8(rest[17..17 + sta_len].to_vec()).unwrap());
            rest = &rest[17 + sta_len + payload_len..];
        }
        assert_eq!(stations, vec!["XX.STA1", "XX.STA2", "XX.STA1", "XX.STA2"]);
    }

    #[test]
    fn transfer_ignores_other_commands() {
        let (mut session, mut storage, _dir) = test_session(1, "192.0.2.1");
        storage.create_ring("XX.STA", 16, 1024).unwrap();

        session.handle_line("STATION STA XX", &mut storage);
        session.handle_line("DATA", &mut storage);
        session.handle_line("END", &mut storage);
        assert!(session.in_transfer());

        assert!(session.handle_line("HELLO", &mut storage).is_empty());
        // INFO stays available
        let data = sent(&session.handle_line("INFO ID", &mut storage));
        assert_eq!(&data[..6], b"SLINFO");
    }
}

