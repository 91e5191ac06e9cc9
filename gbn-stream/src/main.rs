//! Entry point for `gbn-stream`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All actual protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;

use gbn_stream::client::Client;
use gbn_stream::config::TransportConfig;
use gbn_stream::metrics::Counters;
use gbn_stream::server::Server;
use gbn_stream::source::DirSource;

/// Go-Back-N video streaming over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Serve the files in a directory.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
        /// Directory holding the streamable files.
        #[arg(short, long, default_value = ".")]
        root: PathBuf,
        /// Go-Back-N window size.
        #[arg(short, long, default_value_t = TransportConfig::default().window_size)]
        window: u16,
        /// Payload bytes per DATA packet.
        #[arg(long, default_value_t = TransportConfig::default().chunk_size)]
        chunk_size: usize,
        /// Minimum microseconds between new DATA packets.
        #[arg(long)]
        pace_us: Option<u64>,
    },
    /// Request one file from a server.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,
        /// Name of the file to play.
        #[arg(short, long)]
        file: String,
        /// Where to write the received bytes (defaults to the file name).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server {
            bind,
            root,
            window,
            chunk_size,
            pace_us,
        } => {
            let config = TransportConfig {
                window_size: window,
                chunk_size,
                pacing: pace_us.map(Duration::from_micros),
                ..TransportConfig::default()
            };
            let counters = Arc::new(Counters::new());
            let source = DirSource::new(root);
            log::info!("[server] serving files from {}", source.root().display());
            let server = Server::bind(bind, source, config, counters.clone())
                .await
                .with_context(|| format!("cannot start server on {bind}"))?;

            server
                .run_until(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
            log::info!("[server] totals: {:?}", counters.snapshot());
        }
        Mode::Client {
            server,
            file,
            output,
        } => {
            let config = TransportConfig::default();
            let linger = config.eof_linger;
            let counters = Arc::new(Counters::new());
            let client = Client::connect(server, config, counters.clone()).await?;
            let mut stream = client
                .play(&file)
                .await
                .with_context(|| format!("PLAY {file} failed"))?;

            let path = output.unwrap_or_else(|| PathBuf::from(&file));
            let mut out = tokio::fs::File::create(&path)
                .await
                .with_context(|| format!("cannot create {}", path.display()))?;
            while let Some(chunk) = stream.recv().await? {
                out.write_all(&chunk).await?;
            }
            out.flush().await?;
            stream.linger(linger).await?;

            let snapshot = counters.snapshot();
            log::info!(
                "[client] {} bytes in {:.2?} ({:.1} KiB/s), {} duplicate(s), {} corrupt",
                snapshot.bytes_delivered,
                snapshot.elapsed,
                snapshot.throughput_bytes_per_sec / 1024.0,
                snapshot.duplicates_discarded,
                snapshot.corrupt_discarded
            );
        }
    }
    Ok(())
}
