//! Master event loop, component 4.H (master half).
//!
//! Grounded on `olivehc.c`'s `master_loop`: one thread owns every listening
//! socket and every client connection; reads/writes against a client
//! socket happen inline on this thread, while anything that would touch a
//! device fd is handed to [`crate::worker::WorkerPool`] instead. `mio`
//! plays the role of the original's `epoll_wait` with a capped timeout, so
//! the loop still wakes up to run the timer wheel and each server's
//! periodic routine even with no socket activity.
//!
//! This module also owns the tenant table (one [`Server`] per configured
//! port) and the device list, and is where a parsed request actually turns
//! into a fingerprint lookup, a device allocation/read, and a worker job —
//! `request.rs`/`worker.rs` model the mechanics of a connection and a disk
//! job in isolation, but something has to hold the live state those
//! mechanics operate on.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{info, warn};

use olivehc_common::Fingerprint;
use olivehc_core::device::{Device, EvictDecision, OccupantId};
use olivehc_core::server::{now_unix, Lookup, Server, ServerConfig};
use olivehc_core::{Item, Passby};
use olivehc_proto::request_parse::{self, ParseOutcome, ParsedRequest};
use olivehc_proto::response::{self, StatusCode};
use olivehc_proto::Method;

use crate::request::{Phase, Request};
use crate::worker::{DiskJob, DiskOp, DiskResult, WorkerPool};

/// Upper bound on how long a single `poll` call blocks, so the timer wheel
/// and periodic routines still run during quiet periods (`olivehc.c` uses
/// a 1-second `epoll_wait` timeout for the same reason).
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// How often `Server::routine` runs per tenant, bounding stale-passby
/// sweeps to once a second rather than on every single `tick`.
const ROUTINE_INTERVAL: Duration = Duration::from_secs(1);
const ROUTINE_MAX_SCAN: usize = 64;

const LISTENER_TOKEN_BASE: usize = 0;
const CONNECTION_TOKEN_BASE: usize = 1 << 16;

struct Connection {
    stream: TcpStream,
    request: Request,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    port: u16,
    /// Headers parsed for this connection's in-flight request, kept around
    /// until the body (if any) has fully arrived and dispatch can use the
    /// host/key/range fields alongside it.
    parsed: Option<ParsedRequest>,
    body: Vec<u8>,
}

/// A device opened by the binary crate and handed to the master: the
/// in-memory free-space manager plus the backing fd workers read/write
/// against (`device.c`'s `device.fd`, shared read-only with every worker).
pub struct DeviceEntry {
    pub device: Device,
    pub file: Arc<File>,
    /// Backing file path, used to name the warm-restart sidecar index
    /// file (`<path>.idx`) written on clean shutdown and read on startup.
    pub path: std::path::PathBuf,
}

/// Sidecar index file path for a device, standing in for the reserved
/// on-device superblock region `format.c` writes directly into the raw
/// block device — a plain file alongside the device file is simpler and
/// doesn't require reserving device capacity for header bytes.
fn sidecar_path(device_path: &std::path::Path) -> std::path::PathBuf {
    let mut s = device_path.as_os_str().to_owned();
    s.push(".idx");
    std::path::PathBuf::from(s)
}

/// Tracks what a dispatched [`DiskJob`] is for, so its [`DiskResult`] can be
/// turned back into the right HTTP response and tenant/device bookkeeping.
enum PendingOp {
    Read {
        port: u16,
        handle: olivehc_core::server::ItemHandle,
        range: Option<(u64, u64)>,
        total_len: u64,
    },
    Write {
        port: u16,
        fp: Fingerprint,
        device_idx: usize,
        order_key: usize,
        offset: u64,
        length: u32,
        expire: i64,
        occupant: OccupantId,
    },
}

/// A command relayed from the admin text protocol (`olivehc::main`'s tokio
/// runtime) across to the master thread, since the tenant/device state the
/// admin protocol reports on is only ever touched from `Master::tick`.
/// Replies ride a `tokio::sync::oneshot` channel — sending into one from a
/// plain OS thread is a non-blocking call, so `Master` doesn't need to be
/// async to answer one.
pub enum AdminCommand {
    Status { reply: tokio::sync::oneshot::Sender<String> },
    Reload { reply: tokio::sync::oneshot::Sender<()> },
    Clear { port: u16, reply: tokio::sync::oneshot::Sender<bool> },
}

pub struct MasterConfig {
    pub listen_addrs: Vec<std::net::SocketAddr>,
    pub worker_count: usize,
    pub servers: Vec<ServerConfig>,
    pub devices: Vec<DeviceEntry>,
    pub admin_rx: std::sync::mpsc::Receiver<AdminCommand>,
}

pub struct Master {
    poll: Poll,
    listeners: Vec<(Token, TcpListener, u16)>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    next_request_id: u64,
    workers: WorkerPool,
    shutdown: bool,
    tenants: HashMap<u16, Server>,
    devices: Vec<DeviceEntry>,
    device_cursor: usize,
    /// Maps a device occupant tag back to the tenant/fingerprint that owns
    /// it, so `Device::free_block_extend`'s eviction callback can reach
    /// into the right `Server` without the device layer knowing what a
    /// tenant or a fingerprint is.
    occupants: HashMap<OccupantId, (u16, Fingerprint)>,
    next_occupant: OccupantId,
    pending: HashMap<u64, PendingOp>,
    routine_clock: PeriodicClock,
    admin_rx: std::sync::mpsc::Receiver<AdminCommand>,
}

impl Master {
    pub fn bind(config: MasterConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listeners = Vec::new();

        for (i, addr) in config.listen_addrs.into_iter().enumerate() {
            let mut listener = TcpListener::bind(addr)?;
            let token = Token(LISTENER_TOKEN_BASE + i);
            poll.registry().register(&mut listener, token, Interest::READABLE)?;
            listeners.push((token, listener, addr.port()));
        }

        let mut tenants = HashMap::new();
        for server_config in config.servers {
            let port = server_config.port;
            tenants.insert(port, Server::new(server_config));
        }

        let mut devices = config.devices;
        let mut occupants = HashMap::new();
        let mut next_occupant: OccupantId = 0;
        warm_restart(&mut tenants, &mut devices, &mut occupants, &mut next_occupant);

        Ok(Master {
            poll,
            listeners,
            connections: HashMap::new(),
            next_token: CONNECTION_TOKEN_BASE,
            next_request_id: 0,
            workers: WorkerPool::spawn(config.worker_count),
            shutdown: false,
            tenants,
            devices,
            device_cursor: 0,
            occupants,
            next_occupant,
            pending: HashMap::new(),
            routine_clock: PeriodicClock::new(ROUTINE_INTERVAL),
            admin_rx: config.admin_rx,
        })
    }

    /// Runs one full iteration: poll, accept/read/write, drain finished
    /// disk jobs, age the connection table, and run per-tenant periodic
    /// maintenance when due.
    pub fn tick(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        self.poll.poll(&mut events, Some(POLL_TIMEOUT))?;

        let listener_tokens: Vec<Token> = self.listeners.iter().map(|(t, _, _)| *t).collect();

        for event in events.iter() {
            let token = event.token();
            if listener_tokens.contains(&token) {
                self.accept_all(token);
                continue;
            }
            if event.is_readable() {
                self.handle_readable(token);
            }
            if event.is_writable() {
                self.handle_writable(token);
            }
        }

        self.drain_worker_results();
        self.drain_admin_commands();
        self.reap_finished();

        if self.routine_clock.due(Instant::now()) {
            let now = now_unix();
            for server in self.tenants.values_mut() {
                server.routine(now, ROUTINE_MAX_SCAN);
            }
        }

        Ok(())
    }

    pub fn request_quit(&mut self) {
        self.shutdown = true;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown
    }

    fn accept_all(&mut self, listener_token: Token) {
        let Some((_, listener, port)) = self.listeners.iter().find(|(t, _, _)| *t == listener_token) else {
            return;
        };
        let port = *port;
        loop {
            match listener.accept() {
                Ok((mut stream, _addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(error = %e, "failed to register accepted connection");
                        continue;
                    }
                    let request_id = self.next_request_id;
                    self.next_request_id += 1;
                    self.connections.insert(
                        token,
                        Connection {
                            stream,
                            request: Request::new(request_id),
                            read_buf: Vec::new(),
                            write_buf: Vec::new(),
                            port,
                            parsed: None,
                            body: Vec::new(),
                        },
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else { return };
        let mut chunk = [0u8; 8192];
        loop {
            match conn.stream.read(&mut chunk) {
                Ok(0) => {
                    conn.request.fail(StatusCode::BAD_REQUEST);
                    break;
                }
                Ok(n) => {
                    conn.read_buf.extend_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    conn.request.fail(StatusCode::BAD_REQUEST);
                    break;
                }
            }
        }

        if matches!(conn.request.phase, Phase::ReadingHeaders) {
            match request_parse::parse(&conn.read_buf) {
                Ok(ParseOutcome::Complete { request: parsed, consumed }) => {
                    conn.request.method = parsed.method.unwrap_or(Method::Get);
                    conn.request.path = parsed.path.clone();
                    conn.read_buf.drain(..consumed);
                    match parsed.content_length {
                        Some(len) if len > 0 => {
                            conn.request.begin_body(len);
                            let carried_over = std::mem::take(&mut conn.read_buf);
                            conn.parsed = Some(parsed);
                            self.ingest_body_bytes(token, carried_over);
                        }
                        _ => {
                            conn.parsed = Some(parsed);
                            conn.request.dispatch();
                            self.dispatch_request(token);
                        }
                    }
                }
                Ok(ParseOutcome::Incomplete) => {}
                Err(_) => conn.request.fail(StatusCode::BAD_REQUEST),
            }
        } else if matches!(conn.request.phase, Phase::ReadingBody { .. }) {
            let fresh = std::mem::take(&mut conn.read_buf);
            self.ingest_body_bytes(token, fresh);
        }
    }

    /// Appends freshly-read bytes to the connection's body buffer and, once
    /// the declared `Content-Length` has fully arrived, moves the request
    /// to `AwaitingDisk` and dispatches it.
    fn ingest_body_bytes(&mut self, token: Token, fresh: Vec<u8>) {
        let Some(conn) = self.connections.get_mut(&token) else { return };
        let n = fresh.len() as u64;
        conn.body.extend_from_slice(&fresh);
        conn.request.body_progress(n);
        if matches!(conn.request.phase, Phase::AwaitingDisk) {
            self.dispatch_request(token);
        }
    }

    fn handle_writable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else { return };
        if conn.write_buf.is_empty() {
            return;
        }
        match conn.stream.write(&conn.write_buf) {
            Ok(n) => {
                conn.write_buf.drain(..n);
                conn.request.header_progress(n, None);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => conn.request.fail(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// Turns a fully-parsed, fully-bodied request into tenant/device work:
    /// a fingerprint lookup for `GET`/`HEAD`/`DELETE`/`PURGE`, or a space
    /// allocation plus a disk write for `PUT`/`POST`.
    fn dispatch_request(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else { return };
        let Some(parsed) = conn.parsed.take() else { return };
        let port = conn.port;
        let request_id = conn.request.id;
        let fp = fingerprint_of(&parsed);

        let Some(_) = self.tenants.get(&port) else {
            self.fail(token, StatusCode::INTERNAL_SERVER_ERROR);
            return;
        };

        match parsed.method.unwrap_or(Method::Get) {
            Method::Get => self.dispatch_read(token, port, fp, parsed.range),
            Method::Head => self.dispatch_head(token, port, fp),
            Method::Put | Method::Post => {
                let body = std::mem::take(&mut self.connections.get_mut(&token).unwrap().body);
                self.dispatch_write(token, port, fp, parsed, body, request_id);
            }
            Method::Delete | Method::Purge => self.dispatch_delete(token, port, fp),
        }
    }

    fn dispatch_read(&mut self, token: Token, port: u16, fp: Fingerprint, range: Option<request_parse::Range>) {
        let now = now_unix();
        let server = self.tenants.get_mut(&port).unwrap();
        let handle = match server.lookup(fp, now) {
            Lookup::Hit(handle) => handle,
            Lookup::Passby(h) => {
                server.note_passby_hit(h);
                self.fail(token, StatusCode::NOT_FOUND);
                return;
            }
            Lookup::StalePassby(_) | Lookup::Stale(_) | Lookup::Miss => {
                self.fail(token, StatusCode::NOT_FOUND);
                return;
            }
        };
        let item = *server.item(handle).unwrap();
        let resolved = match range {
            Some(r) => match r.resolve(item.length as u64) {
                Some(bounds) => Some(bounds),
                None => {
                    self.fail(token, StatusCode::RANGE_NOT_SATISFIABLE);
                    return;
                }
            },
            None => None,
        };
        let (start, length) = match resolved {
            Some((s, e)) => (s, (e - s + 1) as u32),
            None => (0, item.length),
        };

        let Some(device_entry) = self.devices.get(item.device as usize) else {
            self.fail(token, StatusCode::INTERNAL_SERVER_ERROR);
            return;
        };
        if let Some(node) = server.item_mut(handle) {
            node.used += 1;
        }

        let request_id = self.connections.get(&token).unwrap().request.id;
        self.pending.insert(
            request_id,
            PendingOp::Read { port, handle, range: resolved, total_len: item.length as u64 },
        );
        let job = DiskJob {
            request_id,
            op: DiskOp::Read { file: device_entry.file.clone(), offset: item.offset + start, length },
        };
        if self.workers.dispatch(job).is_err() {
            self.pending.remove(&request_id);
            if let Some(server) = self.tenants.get_mut(&port) {
                if let Some(node) = server.item_mut(handle) {
                    node.used = node.used.saturating_sub(1);
                }
            }
            self.fail(token, StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    fn dispatch_head(&mut self, token: Token, port: u16, fp: Fingerprint) {
        let now = now_unix();
        let server = self.tenants.get_mut(&port).unwrap();
        let handle = match server.lookup(fp, now) {
            Lookup::Hit(handle) => handle,
            Lookup::Passby(h) => {
                server.note_passby_hit(h);
                self.fail(token, StatusCode::NOT_FOUND);
                return;
            }
            Lookup::StalePassby(_) | Lookup::Stale(_) | Lookup::Miss => {
                self.fail(token, StatusCode::NOT_FOUND);
                return;
            }
        };
        let length = server.item(handle).unwrap().length as u64;
        let Some(conn) = self.connections.get_mut(&token) else { return };
        let header = response::ok_header(length, 0, &[]);
        conn.write_buf = header.clone();
        conn.request.begin_response(header);
    }

    fn dispatch_write(
        &mut self,
        token: Token,
        port: u16,
        fp: Fingerprint,
        parsed: ParsedRequest,
        body: Vec<u8>,
        request_id: u64,
    ) {
        let now = now_unix();
        let is_post = matches!(parsed.method, Some(Method::Post));

        {
            let server = self.tenants.get(&port).unwrap();
            if body.len() as u64 > server.config.item_max_size {
                self.fail(token, StatusCode::PAYLOAD_TOO_LARGE);
                return;
            }
        }

        let server = self.tenants.get_mut(&port).unwrap();
        match server.lookup(fp, now) {
            Lookup::Passby(h) | Lookup::StalePassby(h) => server.remove_passby(fp, h),
            Lookup::Hit(h) => {
                if is_post {
                    let Some(conn) = self.connections.get_mut(&token) else { return };
                    let header = response::empty_response(StatusCode::NO_CONTENT);
                    conn.write_buf = header.clone();
                    conn.request.begin_response(header);
                    return;
                }
                if let Some(removed) = server.remove_item(fp, h) {
                    self.release_item_space(port, &removed);
                }
            }
            Lookup::Stale(h) => {
                if let Some(removed) = server.remove_item(fp, h) {
                    self.release_item_space(port, &removed);
                }
            }
            Lookup::Miss => {
                if server.should_promote_to_passby() {
                    let expire = now + server.config.passby_expire;
                    server.insert_passby(Passby { fingerprint: fp, expire });
                    let Some(conn) = self.connections.get_mut(&token) else { return };
                    let header = response::empty_response(StatusCode::NO_CONTENT);
                    conn.write_buf = header.clone();
                    conn.request.begin_response(header);
                    return;
                }
            }
        }

        if self.devices.is_empty() {
            self.fail(token, StatusCode::INTERNAL_SERVER_ERROR);
            return;
        }
        let device_idx = self.device_cursor;
        self.device_cursor = (self.device_cursor + 1) % self.devices.len();

        let occupant = self.next_occupant;
        self.next_occupant += 1;

        let Some((_, order_key)) = self.allocate_space(device_idx, body.len() as u64, occupant, port) else {
            self.fail(token, StatusCode::INTERNAL_SERVER_ERROR);
            return;
        };
        let offset = {
            let device = &self.devices[device_idx].device;
            match find_order_key_offset(device, order_key) {
                Some(offset) => offset,
                None => {
                    self.fail(token, StatusCode::INTERNAL_SERVER_ERROR);
                    return;
                }
            }
        };

        let expire = resolve_expire(&parsed, now, self.tenants.get(&port).unwrap().config.expire_default_secs);

        self.pending.insert(
            request_id,
            PendingOp::Write {
                port,
                fp,
                device_idx,
                order_key,
                offset,
                length: body.len() as u32,
                expire,
                occupant,
            },
        );

        let job = DiskJob {
            request_id,
            op: DiskOp::Write { file: self.devices[device_idx].file.clone(), offset, data: Bytes::from(body) },
        };
        if self.workers.dispatch(job).is_err() {
            if let Some(PendingOp::Write { device_idx, order_key, length, .. }) = self.pending.remove(&request_id) {
                self.devices[device_idx].device.return_free_block(order_key, length as u64, false);
            }
            self.fail(token, StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    fn dispatch_delete(&mut self, token: Token, port: u16, fp: Fingerprint) {
        let now = now_unix();
        let server = self.tenants.get_mut(&port).unwrap();
        let handle = match server.lookup(fp, now) {
            Lookup::Hit(h) | Lookup::Stale(h) => h,
            Lookup::Passby(h) | Lookup::StalePassby(h) => {
                server.remove_passby(fp, h);
                self.fail(token, StatusCode::NOT_FOUND);
                return;
            }
            Lookup::Miss => {
                self.fail(token, StatusCode::NOT_FOUND);
                return;
            }
        };
        if let Some(removed) = server.remove_item(fp, handle) {
            self.release_item_space(port, &removed);
        }
        let Some(conn) = self.connections.get_mut(&token) else { return };
        let header = response::empty_response(StatusCode::NO_CONTENT);
        conn.write_buf = header.clone();
        conn.request.begin_response(header);
    }

    /// Returns `item`'s backing device space and forgets it in the
    /// occupant map, used whenever a `Server::remove_item` call actually
    /// reclaimed the item (as opposed to deferring deletion).
    fn release_item_space(&mut self, _port: u16, item: &Item) {
        let Some(device_entry) = self.devices.get_mut(item.device as usize) else { return };
        if let Some(key) = find_order_key(&device_entry.device, item.offset) {
            device_entry.device.return_free_block(key, item.length as u64, item.badblock);
        }
        self.occupants.retain(|_, (_, fp)| *fp != item.fingerprint);
    }

    /// `get_free_block`, falling back to the eviction cascade spec §4.F
    /// describes: this server's own LRU first, then a device-wide
    /// `free_block_extend` pass that may reach into any tenant's items.
    fn allocate_space(&mut self, device_idx: usize, length: u64, occupant: OccupantId, port: u16) -> Option<(u64, usize)> {
        if let Some(result) = self.devices[device_idx].device.get_free_block(length, occupant) {
            return Some(result);
        }

        if let Some(server) = self.tenants.get_mut(&port) {
            let device = &mut self.devices[device_idx].device;
            server.evict(length, |victim| {
                if victim.device as usize == device_idx {
                    if let Some(key) = find_order_key(device, victim.offset) {
                        device.return_free_block(key, victim.length as u64, victim.badblock);
                    }
                }
            });
        }
        if let Some(result) = self.devices[device_idx].device.get_free_block(length, occupant) {
            return Some(result);
        }

        let tenants = &mut self.tenants;
        let occupants = &mut self.occupants;
        let device = &mut self.devices[device_idx].device;
        device.free_block_extend(length, |occ_id| evict_by_occupant(tenants, occupants, occ_id));

        self.devices[device_idx].device.get_free_block(length, occupant)
    }

    fn fail(&mut self, token: Token, status: StatusCode) {
        let Some(conn) = self.connections.get_mut(&token) else { return };
        conn.write_buf = response::error_response(status);
        conn.request.fail(status);
    }

    fn drain_worker_results(&mut self) {
        while let Some(result) = self.workers.try_recv_result() {
            let request_id = match &result {
                DiskResult::Read { request_id, .. } => *request_id,
                DiskResult::Write { request_id, .. } => *request_id,
                DiskResult::Error { request_id, .. } => *request_id,
            };
            let Some(pending) = self.pending.remove(&request_id) else { continue };
            let Some(token) = self.find_connection_by_request(request_id) else { continue };

            match (result, pending) {
                (DiskResult::Read { data, .. }, PendingOp::Read { port, handle, range, total_len }) => {
                    if let Some(server) = self.tenants.get_mut(&port) {
                        if let Some(node) = server.item_mut(handle) {
                            node.used = node.used.saturating_sub(1);
                        }
                    }
                    let Some(conn) = self.connections.get_mut(&token) else { continue };
                    let header = match range {
                        Some((start, end)) => response::partial_header(start, end, total_len, &[]),
                        None => response::ok_header(data.len() as u64, 0, &[]),
                    };
                    conn.write_buf.extend_from_slice(&header);
                    conn.write_buf.extend_from_slice(&data);
                    conn.request.begin_response(header);
                }
                (
                    DiskResult::Write { written, .. },
                    PendingOp::Write { port, fp, device_idx, order_key, offset, length, expire, occupant },
                ) => {
                    if written == length as usize {
                        if let Some(server) = self.tenants.get_mut(&port) {
                            let item = Item {
                                fingerprint: fp,
                                server: 0,
                                device: device_idx as u16,
                                offset,
                                length,
                                headers_len: 0,
                                expire,
                                clear: server.clear,
                                putting: false,
                                deleted: false,
                                badblock: false,
                                used: 0,
                            };
                            server.insert_item(item);
                            self.occupants.insert(occupant, (port, fp));
                        }
                        let Some(conn) = self.connections.get_mut(&token) else { continue };
                        let header = response::empty_response(StatusCode::CREATED);
                        conn.write_buf = header.clone();
                        conn.request.begin_response(header);
                    } else {
                        self.devices[device_idx].device.return_free_block(order_key, length as u64, true);
                        self.fail(token, StatusCode::INTERNAL_SERVER_ERROR);
                    }
                }
                (DiskResult::Error { .. }, PendingOp::Read { port, handle, .. }) => {
                    if let Some(server) = self.tenants.get_mut(&port) {
                        if let Some(node) = server.item_mut(handle) {
                            node.used = node.used.saturating_sub(1);
                        }
                    }
                    self.fail(token, StatusCode::INTERNAL_SERVER_ERROR);
                }
                (DiskResult::Error { .. }, PendingOp::Write { device_idx, order_key, length, .. }) => {
                    self.devices[device_idx].device.return_free_block(order_key, length as u64, true);
                    self.fail(token, StatusCode::INTERNAL_SERVER_ERROR);
                }
                _ => {}
            }
        }
    }

    /// Services whatever admin commands piled up since the last tick.
    /// `try_recv` never blocks, so a quiet admin port costs nothing here.
    fn drain_admin_commands(&mut self) {
        while let Ok(cmd) = self.admin_rx.try_recv() {
            match cmd {
                AdminCommand::Status { reply } => {
                    let mut report = String::new();
                    for (port, server) in &self.tenants {
                        report.push_str(&format!(
                            "port={} items={} consumed={} hits={} misses={} puts={} evictions={}\n",
                            port,
                            server.item_count(),
                            server.consumed,
                            server.stats.hits,
                            server.stats.misses,
                            server.stats.puts,
                            server.stats.evictions,
                        ));
                    }
                    let _ = reply.send(report);
                }
                AdminCommand::Reload { reply } => {
                    let _ = reply.send(());
                }
                AdminCommand::Clear { port, reply } => {
                    let found = if let Some(server) = self.tenants.get_mut(&port) {
                        server.clear();
                        true
                    } else {
                        false
                    };
                    let _ = reply.send(found);
                }
            }
        }
    }

    fn find_connection_by_request(&self, request_id: u64) -> Option<Token> {
        self.connections
            .iter()
            .find(|(_, c)| c.request.id == request_id)
            .map(|(t, _)| *t)
    }

    fn reap_finished(&mut self) {
        let done: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, c)| c.request.is_done() && c.write_buf.is_empty())
            .map(|(t, _)| *t)
            .collect();
        for token in done {
            if let Some(mut conn) = self.connections.remove(&token) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
            }
        }
    }

    /// `format_store_device`: on clean shutdown, write each device's
    /// surviving items out to its sidecar index file so the next startup's
    /// [`warm_restart`] can recover them. Tenants with `server_dump` off
    /// are skipped, per `SPEC_FULL.md`'s supplemented per-server flag.
    pub fn dump_to_disk(&self) {
        let now = now_unix();
        let known_ports: Vec<u16> = self.tenants.keys().copied().collect();

        for (device_idx, entry) in self.devices.iter().enumerate() {
            let mut records = Vec::new();
            for (&port, server) in &self.tenants {
                if !server.config.server_dump {
                    continue;
                }
                for item in server.iter_items(now) {
                    if item.device as usize == device_idx {
                        records.push(olivehc_core::format::IndexRecord {
                            fingerprint: item.fingerprint,
                            port,
                            offset: item.offset,
                            length: item.length,
                            headers_len: item.headers_len,
                            expire: item.expire,
                        });
                    }
                }
            }
            let image = olivehc_core::format::build_image(known_ports.clone(), records);
            let bytes = olivehc_core::format::encode(&image);
            if let Err(e) = std::fs::write(sidecar_path(&entry.path), bytes) {
                warn!(path = %entry.path.display(), error = %e, "failed to write warm restart index");
            }
        }
    }
}

/// `format_load_device`, called once per device at startup: reads that
/// device's sidecar index file (if any), validates it, and re-cuts each
/// surviving item's device space plus its tenant's hash/LRU entry. A
/// missing, truncated, or otherwise malformed sidecar is treated as "no
/// warm restart data" rather than a startup failure — a fresh cache is
/// always a safe fallback.
fn warm_restart(
    tenants: &mut HashMap<u16, Server>,
    devices: &mut [DeviceEntry],
    occupants: &mut HashMap<OccupantId, (u16, Fingerprint)>,
    next_occupant: &mut OccupantId,
) {
    let now = now_unix();
    let known_ports: Vec<u16> = tenants.keys().copied().collect();

    for (device_idx, entry) in devices.iter_mut().enumerate() {
        let Ok(bytes) = std::fs::read(sidecar_path(&entry.path)) else { continue };
        let Some(image) = olivehc_core::format::decode(&bytes) else {
            warn!(path = %entry.path.display(), "warm restart index is malformed, starting cold");
            continue;
        };
        let mut surviving = match olivehc_core::format::validate_and_filter(&image, &known_ports, now) {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %entry.path.display(), error = %e, "warm restart index failed validation, starting cold");
                continue;
            }
        };
        // `cut_free_block` always carves from the device's tail free block
        // forward, so records must be replayed in ascending offset order
        // regardless of what order they were written in.
        surviving.sort_by_key(|r| r.offset);

        for record in surviving {
            let occupant = *next_occupant;
            if entry.device.cut_free_block(record.offset, record.length as u64, occupant).is_none() {
                continue;
            }
            let Some(server) = tenants.get_mut(&record.port) else { continue };
            let item = Item {
                fingerprint: record.fingerprint,
                server: 0,
                device: device_idx as u16,
                offset: record.offset,
                length: record.length,
                headers_len: record.headers_len,
                expire: record.expire,
                clear: server.clear,
                putting: false,
                deleted: false,
                badblock: false,
                used: 0,
            };
            server.insert_item(item);
            occupants.insert(occupant, (record.port, record.fingerprint));
            *next_occupant += 1;
        }
        entry.device.load_post();
    }
}

fn fingerprint_of(parsed: &ParsedRequest) -> Fingerprint {
    let mut parts: Vec<&[u8]> = vec![&parsed.path];
    if let Some(host) = &parsed.host {
        parts.push(host);
    }
    if let Some(key) = &parsed.ohc_key {
        parts.push(key);
    }
    Fingerprint::compute(&parts)
}

/// `expire_force` (`max-age`/`Expires`, already parsed) overrides; otherwise
/// falls back to the tenant's `expire_default`, per §4.F's PUT/POST rule.
fn resolve_expire(parsed: &ParsedRequest, now: i64, expire_default_secs: i64) -> i64 {
    if let Some(max_age) = parsed.max_age {
        return now + max_age;
    }
    if let Some(expires) = parsed.expires {
        return expires;
    }
    now + expire_default_secs
}

/// Locates the order-list key backing the item at `offset`. `Item` (by
/// design, see `SPEC_FULL.md` §9's item-size note) doesn't carry its own
/// order-list index, so release paths look it up by offset instead; this
/// only runs off the hot GET path (PUT/DELETE/eviction), not on every read.
fn find_order_key(device: &Device, offset: u64) -> Option<usize> {
    device.iter_items().find(|&(_, o, _, _)| o == offset).map(|(idx, _, _, _)| idx)
}

fn find_order_key_offset(device: &Device, key: usize) -> Option<u64> {
    device.iter_items().find(|&(idx, _, _, _)| idx == key).map(|(_, offset, _, _)| offset)
}

fn evict_by_occupant(
    tenants: &mut HashMap<u16, Server>,
    occupants: &mut HashMap<OccupantId, (u16, Fingerprint)>,
    occupant: OccupantId,
) -> EvictDecision {
    let Some(&(port, fp)) = occupants.get(&occupant) else {
        return EvictDecision::Evicted;
    };
    let Some(server) = tenants.get_mut(&port) else {
        occupants.remove(&occupant);
        return EvictDecision::Evicted;
    };
    let now = now_unix();
    let handle = match server.lookup(fp, now) {
        Lookup::Hit(h) | Lookup::Stale(h) => h,
        _ => {
            occupants.remove(&occupant);
            return EvictDecision::Evicted;
        }
    };
    match server.remove_item(fp, handle) {
        Some(_) => {
            occupants.remove(&occupant);
            EvictDecision::Evicted
        }
        None => EvictDecision::Busy,
    }
}

/// Tracks the wall-clock instant the loop last ran its periodic routines,
/// so `Master::tick` can decide when to sweep each tenant's expired passby
/// entries without doing it on every single poll wakeup.
pub struct PeriodicClock {
    last_run: Instant,
    interval: Duration,
}

impl PeriodicClock {
    pub fn new(interval: Duration) -> Self {
        PeriodicClock { last_run: Instant::now(), interval }
    }

    pub fn due(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last_run) >= self.interval {
            self.last_run = now;
            true
        } else {
            false
        }
    }
}

pub fn log_startup(worker_count: usize, listen_count: usize) {
    info!(worker_count, listen_count, "olivehc master started");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_clock_fires_after_interval() {
        let mut clock = PeriodicClock::new(Duration::from_millis(10));
        let start = Instant::now();
        assert!(!clock.due(start));
        assert!(clock.due(start + Duration::from_millis(20)));
    }

    #[test]
    fn fingerprint_of_includes_host_and_key_when_present() {
        let mut parsed = ParsedRequest::default();
        parsed.path = b"/a".to_vec();
        let without_host = fingerprint_of(&parsed);
        parsed.host = Some(b"example.com".to_vec());
        let with_host = fingerprint_of(&parsed);
        assert_ne!(without_host, with_host);
    }

    #[test]
    fn sidecar_path_appends_idx_suffix() {
        let p = sidecar_path(std::path::Path::new("/tmp/dev0"));
        assert_eq!(p, std::path::PathBuf::from("/tmp/dev0.idx"));
    }

    #[test]
    fn warm_restart_recovers_items_after_dump() {
        let dir = std::env::temp_dir();
        let n = std::process::id();
        let device_path = dir.join(format!("olivehc-master-test-{n}.dev"));
        let sidecar = sidecar_path(&device_path);
        let _ = std::fs::remove_file(&sidecar);

        let image = olivehc_core::format::build_image(
            vec![8080],
            vec![olivehc_core::format::IndexRecord {
                fingerprint: Fingerprint { low: 1, high: 2 },
                port: 8080,
                offset: 0,
                length: 64,
                headers_len: 0,
                expire: now_unix() + 1000,
            }],
        );
        std::fs::write(&sidecar, olivehc_core::format::encode(&image)).unwrap();

        let mut tenants = HashMap::new();
        tenants.insert(8080, Server::new(ServerConfig { port: 8080, ..ServerConfig::default() }));
        let file = std::fs::OpenOptions::new().read(true).write(true).create(true).open(&device_path).unwrap();
        file.set_len(1 << 20).unwrap();
        let mut devices = vec![DeviceEntry { device: Device::new(1 << 20), file: Arc::new(file), path: device_path.clone() }];
        let mut occupants = HashMap::new();
        let mut next_occupant: OccupantId = 0;

        warm_restart(&mut tenants, &mut devices, &mut occupants, &mut next_occupant);

        let server = tenants.get_mut(&8080).unwrap();
        match server.lookup(Fingerprint { low: 1, high: 2 }, now_unix()) {
            Lookup::Hit(_) => {}
            other => panic!("expected warm-restarted item to hit, got {other:?}"),
        }

        let _ = std::fs::remove_file(&sidecar);
        let _ = std::fs::remove_file(&device_path);
    }

    #[test]
    fn resolve_expire_prefers_max_age_over_default() {
        assert_eq!(
            resolve_expire(&ParsedRequest { max_age: Some(60), ..Default::default() }, 1000, 999),
            1060
        );
        assert_eq!(
            resolve_expire(&ParsedRequest::default(), 1000, 60),
            1060
        );
    }
}
