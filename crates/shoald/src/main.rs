//! shoald — Shoal peer-to-peer chunk daemon.

use anyhow::{bail, Context, Result};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::level_filters::LevelFilter;

use shoal_core::config::{PeerOptions, USAGE};
use shoal_core::inventory::Inventory;
use shoal_core::roster::Roster;
use shoald::engine::{Command, Engine};
use shoald::sock::PeerSocket;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let options = match PeerOptions::parse(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{e}\n\n{USAGE}");
            std::process::exit(1);
        }
    };

    init_tracing(options.verbose);

    if options.identity == 0 {
        bail!("peer identity must not be zero");
    }
    let roster = Roster::load(&options.peer_file).context("loading peer roster")?;
    let Some(me) = roster.get(options.identity) else {
        bail!("no roster entry for this peer (id {})", options.identity);
    };
    let bind_addr = me.addr;

    let inventory = Inventory::load(&options.chunk_file).context("loading chunk inventory")?;
    tracing::info!(
        id = options.identity,
        addr = %bind_addr,
        chunks = inventory.len(),
        max_conn = options.max_conn,
        "shoald starting"
    );

    let sock = PeerSocket::bind(options.identity, bind_addr)
        .await
        .context("binding peer socket")?;

    let (command_tx, command_rx) = mpsc::channel(16);
    tokio::spawn(read_commands(command_tx));

    let mut engine = Engine::new(&options, roster, inventory, sock);
    tokio::select! {
        result = engine.run(command_rx) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            Ok(())
        }
    }
}

/// Feed stdin lines to the engine as commands. Unknown commands are
/// ignored; EOF just stops the feed.
async fn read_commands(commands: mpsc::Sender<Command>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match Command::parse(&line) {
            Some(command) => {
                if commands.send(command).await.is_err() {
                    return;
                }
            }
            None => {
                if !line.trim().is_empty() {
                    tracing::debug!(line = %line.trim(), "ignoring unknown command");
                }
            }
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::OFF,
        1 => LevelFilter::WARN,
        2 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}
