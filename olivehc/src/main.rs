//! Entry point, grounded on `olivehc.c`'s `main`: parse flags, load the
//! config, start the master event loop (sockets + worker pool) on its own
//! thread, and run the admin text protocol on a tokio runtime on this
//! thread. `-b` skips daemonizing; OliveHC's Rust port always runs in the
//! foreground and leaves backgrounding to the process supervisor (systemd,
//! runit, ...) rather than forking itself, since a self-daemonizing Rust
//! binary fighting a supervisor's own process tracking causes more
//! problems than it solves.

mod cli;
mod conf;

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{error, info};

use olivehc_core::device::Device;
use olivehc_core::server::ServerConfig;
use olivehc_server::{AdminCommand, DeviceEntry, Master, MasterConfig};

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    init_logging();

    let conf_path = cli.resolve_conf_path();
    let config = conf::parse_file(&conf_path)
        .with_context(|| format!("failed to parse config file {}", conf_path.display()))?;

    info!(
        devices = config.global.devices.len(),
        servers = config.servers.len(),
        "loaded configuration"
    );

    write_pid_file(&cli.pid_file)?;

    let devices = open_devices(&config.global.devices)?;

    let quit = Arc::new(AtomicBool::new(false));
    let listen_addrs: Vec<SocketAddr> = config
        .servers
        .iter()
        .map(|s| SocketAddr::from(([0, 0, 0, 0], s.port)))
        .collect();
    let servers = config.servers.clone();

    let (admin_tx, admin_rx) = std::sync::mpsc::channel::<AdminCommand>();

    let master_quit = quit.clone();
    let master_thread = std::thread::Builder::new()
        .name("olivehc-master".to_string())
        .spawn(move || {
            run_master_loop(listen_addrs, config.global.threads as usize, servers, devices, admin_rx, master_quit)
        })
        .context("failed to spawn master thread")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start the admin runtime")?;
    runtime.block_on(run_admin_listener(cli.admin_port, quit.clone(), admin_tx))?;

    let _ = master_thread.join();
    Ok(())
}

/// Opens every configured device as a regular fd (`device_open`), sizing it
/// to the configured capacity if it isn't already that large — plain files
/// stand in for the raw block devices `device.c` opens directly, since a
/// development/test environment rarely has a spare block device to hand.
fn open_devices(devices: &[conf::DeviceConfig]) -> Result<Vec<DeviceEntry>> {
    devices
        .iter()
        .map(|d| {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&d.path)
                .with_context(|| format!("failed to open device {}", d.path.display()))?;
            file.set_len(d.capacity)
                .with_context(|| format!("failed to size device {}", d.path.display()))?;
            Ok(DeviceEntry { device: Device::new(d.capacity), file: Arc::new(file), path: d.path.clone() })
        })
        .collect()
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

fn write_pid_file(path: &std::path::Path) -> Result<()> {
    std::fs::write(path, std::process::id().to_string())
        .with_context(|| format!("failed to write pid file {}", path.display()))
}

fn run_master_loop(
    listen_addrs: Vec<SocketAddr>,
    worker_count: usize,
    servers: Vec<ServerConfig>,
    devices: Vec<DeviceEntry>,
    admin_rx: std::sync::mpsc::Receiver<AdminCommand>,
    quit: Arc<AtomicBool>,
) {
    let mut master = match Master::bind(MasterConfig { listen_addrs, worker_count, servers, devices, admin_rx }) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "failed to bind listening sockets");
            quit.store(true, Ordering::SeqCst);
            return;
        }
    };

    while !quit.load(Ordering::SeqCst) && !master.is_shutting_down() {
        if let Err(e) = master.tick() {
            error!(error = %e, "master loop iteration failed");
            break;
        }
    }

    master.dump_to_disk();
}

/// `olivehc_admin_handler`: accepts one connection per command, reads a
/// single line, and dispatches it. `status`/`reload`/`clear <port>` are
/// relayed to the master thread as an [`AdminCommand`] and awaited over a
/// oneshot reply channel; `quit` is the one command answered locally, via
/// the shared `AtomicBool` the master loop polls every tick.
async fn run_admin_listener(port: u16, quit: Arc<AtomicBool>, admin_tx: std::sync::mpsc::Sender<AdminCommand>) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await.with_context(|| format!("failed to bind admin port {port}"))?;
    info!(port, "admin protocol listening");

    loop {
        if quit.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (stream, _) = listener.accept().await.context("admin accept failed")?;
        let quit = quit.clone();
        let admin_tx = admin_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_admin_connection(stream, quit, admin_tx).await {
                error!(error = %e, "admin connection error");
            }
        });
    }
}

async fn handle_admin_connection(
    stream: tokio::net::TcpStream,
    quit: Arc<AtomicBool>,
    admin_tx: std::sync::mpsc::Sender<AdminCommand>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };

    let mut parts = line.trim().split_whitespace();
    let reply = match parts.next() {
        Some("status") => {
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            match admin_tx.send(AdminCommand::Status { reply: reply_tx }) {
                Ok(()) => reply_rx.await.unwrap_or_else(|_| "error: master thread gone\n".to_string()),
                Err(_) => "error: master thread gone\n".to_string(),
            }
        }
        Some("reload") => {
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            match admin_tx.send(AdminCommand::Reload { reply: reply_tx }) {
                Ok(()) => match reply_rx.await {
                    Ok(()) => "ok\n".to_string(),
                    Err(_) => "error: master thread gone\n".to_string(),
                },
                Err(_) => "error: master thread gone\n".to_string(),
            }
        }
        Some("clear") => match parts.next().and_then(|p| p.parse::<u16>().ok()) {
            Some(port) => {
                let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
                match admin_tx.send(AdminCommand::Clear { port, reply: reply_tx }) {
                    Ok(()) => match reply_rx.await {
                        Ok(true) => "ok\n".to_string(),
                        Ok(false) => "error: no such server\n".to_string(),
                        Err(_) => "error: master thread gone\n".to_string(),
                    },
                    Err(_) => "error: master thread gone\n".to_string(),
                }
            }
            None => "error: clear requires a port\n".to_string(),
        },
        Some("quit") => {
            quit.store(true, Ordering::SeqCst);
            "ok\n".to_string()
        }
        _ => "error: unknown command\n".to_string(),
    };

    writer.write_all(reply.as_bytes()).await?;
    writer.shutdown().await?;
    Ok(())
}
