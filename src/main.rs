use clap::Parser;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::mpsc::channel;
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub mod client;
pub mod server;
pub mod common {
    pub mod apply;
    pub mod codec;
    pub mod error;
    pub mod hash;
    pub mod message;
    pub mod util;
    pub mod watcher;
}

use common::error::{Result, SyncError};

fn main() {
    let args = Args::try_parse().unwrap_or_else(|err| err.exit());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = Config::build(args).unwrap_or_else(|err| {
        error!(%err, "invalid configuration");
        process::exit(1);
    });

    if let Err(err) = run(config) {
        error!(%err, "rmirror stopped");
        process::exit(1);
    }
}

fn run(mut config: Config) -> Result<()> {
    fs::create_dir_all(&config.root)?;
    config.root = fs::canonicalize(&config.root)?;
    info!(
        root = %config.root.display(),
        listen = %config.listen,
        peer = ?config.peer,
        server_mode = config.server_mode,
        "starting"
    );

    let server = server::Server::bind(&config)?;
    if config.server_mode {
        server.run();
        return Ok(());
    }

    let dispatcher = client::Dispatcher::new(&config)?;
    thread::Builder::new()
        .name("inbound".into())
        .spawn(move || server.run())?;

    let (tx, rx) = channel();
    let _watcher = common::watcher::start(&config.root, tx)?;
    info!("watching for changes");
    dispatcher.run(rx);
    Ok(())
}

#[derive(Parser, Debug)]
#[command(version, about = "Mirror a directory tree to a paired peer", long_about = None)]
struct Args {
    /// Directory to keep in sync; created if missing
    #[arg(short, long, default_value = "./sync_folder")]
    root: PathBuf,

    /// Address the inbound server listens on
    #[arg(short, long, default_value = "0.0.0.0:9030")]
    listen: String,

    /// Address of the paired peer's inbound server
    #[arg(short, long, required_unless_present = "server_mode")]
    peer: Option<String>,

    /// Only receive changes from the peer; local changes are not sent.
    #[arg(short, long, action)]
    server_mode: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, action)]
    verbose: bool,
}

/// Settings shared by the inbound server and the outbound dispatcher.
#[derive(Debug, Clone)]
pub struct Config {
    root: PathBuf,
    listen: SocketAddr,
    peer: Option<SocketAddr>,
    server_mode: bool,
}

impl Config {
    fn build(args: Args) -> Result<Config> {
        let listen = SocketAddr::from_str(&args.listen)?;
        let peer = args.peer.as_deref().map(SocketAddr::from_str).transpose()?;
        if peer.is_none() && !args.server_mode {
            return Err(SyncError::Config("a peer address is required".into()));
        }
        Ok(Config {
            root: args.root,
            listen,
            peer,
            server_mode: args.server_mode,
        })
    }
}

#[cfg(test)]
impl Config {
    pub(crate) fn for_test(root: impl Into<PathBuf>, peer: Option<SocketAddr>) -> Config {
        Config {
            root: root.into(),
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            peer,
            server_mode: false,
        }
    }
}
