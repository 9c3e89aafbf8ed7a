use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use time::macros::format_description;
use tracing::Level;
use tracing_appender::non_blocking;
use tracing_subscriber::fmt::time::LocalTime;

use torrent::config::parse_peer_id;
use torrent::util::io::ProgressSink;
use torrent::{ClientConfig, FileSink, HttpTracker};

#[derive(Parser, Debug)]
#[command(name = "torrent", version, about = "Single-peer BitTorrent client")]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true, value_parser = parse_peer_id, help = "20-byte peer id (or 40 hex digits)")]
    peer_id: Option<[u8; 20]>,

    #[arg(long, global = true, default_value_t = torrent::config::DEFAULT_PORT, help = "Port reported to the tracker")]
    port: u16,

    #[arg(long, global = true, value_name = "SECONDS", help = "Connect, tracker and idle timeout")]
    timeout: Option<u64>,

    #[arg(short, long, global = true, action = ArgAction::Count, help = "More detailed logs (repeatable)")]
    verbose: u8,

    #[arg(long, global = true, default_value = "logs", help = "Directory for torrent.log")]
    log_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a bencoded value as JSON
    Decode { value: String },
    /// Print the contents of a torrent file
    Info { torrent: PathBuf },
    /// List the peers returned by the tracker
    Peers { torrent: PathBuf },
    /// Handshake with one peer and print its peer id
    Handshake { torrent: PathBuf, peer: SocketAddr },
    /// Download and verify a single piece
    #[command(name = "download_piece")]
    DownloadPiece {
        #[arg(short, long)]
        output: PathBuf,
        torrent: PathBuf,
        index: u32,
    },
    /// Download the whole file
    Download {
        #[arg(short, long)]
        output: PathBuf,
        torrent: PathBuf,
    },
}

impl Args {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::default();
        if let Some(peer_id) = self.peer_id {
            config.peer_id = peer_id;
        }
        config.port = self.port;
        match self.timeout {
            Some(secs) => config.with_timeout(Duration::from_secs(secs)),
            None => config,
        }
    }
}

fn log_level(verbose: u8) -> Level {
    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn progress_bar(total: u64) -> ProgressBar {
    let style = ProgressStyle::with_template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    ProgressBar::new(total).with_style(style)
}

async fn run(args: Args) -> torrent::Result<()> {
    let config = args.client_config();
    match args.command {
        Command::Decode { value } => {
            let json = torrent::decode_to_json(value.as_bytes())?;
            println!("{json}");
        },
        Command::Info { torrent: path } => {
            let torrent = torrent::parse_torrent(&path)?;
            println!("{torrent}");
        },
        Command::Peers { torrent: path } => {
            let torrent = torrent::parse_torrent(&path)?;
            let response = torrent::retrieve_peers(&torrent, &config).await?;
            println!("{response}");
        },
        Command::Handshake { torrent: path, peer } => {
            let torrent = torrent::parse_torrent(&path)?;
            let peer_id = torrent::handshake(&torrent, peer, &config).await?;
            println!("Peer ID: {}", hex::encode(peer_id));
        },
        Command::DownloadPiece { output, torrent: path, index } => {
            let torrent = torrent::parse_torrent(&path)?;
            let tracker = HttpTracker::new(config.port, config.tracker_timeout)?;
            torrent::download_piece(&torrent, &tracker, index, &output, &config).await?;
            println!("Piece {index} downloaded to {}.", output.display());
        },
        Command::Download { output, torrent: path } => {
            let torrent = torrent::parse_torrent(&path)?;
            let tracker = HttpTracker::new(config.port, config.tracker_timeout)?;
            let file = FileSink::create(&output).await?;
            let mut sink = ProgressSink::new(file, progress_bar(torrent.total_length));
            torrent::download(&torrent, &tracker, &mut sink, &config).await?;
            println!("Downloaded {} to {}.", path.display(), output.display());
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let file_appender = tracing_appender::rolling::never(&args.log_dir, "torrent.log");
    let (non_blocking, _guard) = non_blocking(file_appender);
    let timer = LocalTime::new(format_description!(
        "[month]/[day]/[year] [hour repr:24]:[minute]:[second].[subsecond digits:4]"
    ));
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_timer(timer)
        .with_max_level(log_level(args.verbose))
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        },
    }
}
