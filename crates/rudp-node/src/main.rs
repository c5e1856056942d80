//! rudp-node
//!
//! - `listen`: accept connections and write every received byte to stdout
//! - `send`: stream stdin to a peer, end the stream, wait for a clean close

use std::fs;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::unbounded;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rudp_transport::net::udp::UdpTransport;
use rudp_transport::{Endpoint, Scheduler, TransportConfig};

/// Reliable byte streams over UDP.
#[derive(Parser, Debug)]
#[command(name = "rudp-node", about = "Reliable ordered byte streams over UDP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and print received data to stdout.
    Listen {
        /// Local address to bind.
        #[arg(long)]
        bind: SocketAddr,

        /// TOML file with transport overrides.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Send stdin to a peer, then end the stream.
    Send {
        /// Local address to bind.
        #[arg(long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,

        /// Peer as HOST:PORT.
        #[arg(long)]
        dest: String,

        /// TOML file with transport overrides.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print connection statistics as JSON to stderr when done.
        #[arg(long, default_value_t = false)]
        stats: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .compact()
        .init();

    match Cli::parse().command {
        Command::Listen { bind, config } => listen(bind, &load_config(config.as_deref())?),
        Command::Send {
            bind,
            dest,
            config,
            stats,
        } => send(bind, &dest, &load_config(config.as_deref())?, stats),
    }
}

fn load_config(path: Option<&Path>) -> Result<TransportConfig> {
    let Some(path) = path else {
        return Ok(TransportConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = TransportConfig::from_toml_str(&text)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

// ─── Listen ─────────────────────────────────────────────────────────────────

enum Chunk {
    Data(Vec<u8>),
    Closed(SocketAddr),
}

fn listen(bind: SocketAddr, config: &TransportConfig) -> Result<()> {
    let transport = UdpTransport::bind(bind)?;
    let sched = Scheduler::new();
    let endpoint = Endpoint::new(transport.clone(), sched.clone(), config.clone())?;

    let (tx, rx) = unbounded::<Chunk>();
    endpoint.on_accept(move |conn| {
        let remote = conn.remote();
        info!(remote = %remote, "connection accepted");

        let data_tx = tx.clone();
        conn.on_data(move |bytes| {
            let _ = data_tx.send(Chunk::Data(bytes.to_vec()));
        });
        conn.on_error(move |err| warn!(remote = %remote, error = %err, "connection failed"));
        conn.on_end(move || info!(remote = %remote, "peer ended stream"));
        let close_tx = tx.clone();
        conn.on_close(move || {
            let _ = close_tx.send(Chunk::Closed(remote));
        });
    });

    transport.start(&endpoint)?;
    sched.start(config.tick_interval);
    info!(local = %transport.local(), "listening");

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for chunk in rx {
        match chunk {
            Chunk::Data(bytes) => {
                out.write_all(&bytes)?;
                out.flush()?;
            }
            Chunk::Closed(remote) => info!(remote = %remote, "connection closed"),
        }
    }
    Ok(())
}

// ─── Send ───────────────────────────────────────────────────────────────────

enum Progress {
    Connected,
    Failed(String),
    Closed,
}

fn send(bind: SocketAddr, dest: &str, config: &TransportConfig, print_stats: bool) -> Result<()> {
    let transport = UdpTransport::bind(bind)?;
    let sched = Scheduler::new();
    let endpoint = Endpoint::new(transport.clone(), sched.clone(), config.clone())?;
    transport.start(&endpoint)?;
    sched.start(config.tick_interval);

    let conn = endpoint.connect_host(dest)?;
    let (tx, rx) = unbounded::<Progress>();
    {
        let tx = tx.clone();
        conn.on_connect(move || {
            let _ = tx.send(Progress::Connected);
        });
    }
    {
        let tx = tx.clone();
        conn.on_error(move |err| {
            let _ = tx.send(Progress::Failed(err.to_string()));
        });
    }
    conn.on_close(move || {
        let _ = tx.send(Progress::Closed);
    });

    match rx.recv()? {
        Progress::Connected => info!(remote = %conn.remote(), "connected"),
        Progress::Failed(err) => bail!("connect to {dest} failed: {err}"),
        Progress::Closed => bail!("connection to {dest} closed before establishment"),
    }

    let mut stdin = io::stdin().lock();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0usize;
    loop {
        let n = stdin.read(&mut buf).context("reading stdin")?;
        if n == 0 {
            break;
        }
        if !conn.send(&buf[..n]) {
            bail!("connection stopped accepting data after {total} bytes");
        }
        total += n;
    }
    conn.end();
    info!(bytes = total, "stream queued, waiting for close");

    let mut failure = None;
    for progress in rx {
        match progress {
            Progress::Failed(err) => failure = Some(err),
            Progress::Closed => break,
            Progress::Connected => {}
        }
    }

    if print_stats {
        eprintln!("{}", serde_json::to_string_pretty(&conn.stats())?);
    }
    sched.stop();
    transport.stop();

    if let Some(err) = failure {
        bail!("transfer to {dest} failed: {err}");
    }
    Ok(())
}
