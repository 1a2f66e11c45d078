// AeroSync Linux daemon: discovery, sessions and file transfer on the LAN.

use std::path::PathBuf;
use std::time::Duration;

use aero_core::JobState;
use aero_linux::session::AuthPrompt;
use aero_linux::{config, Node};
use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const USAGE: &str = "usage: aero-linux [--version] [send <peer> <file>...]";
const DISCOVERY_WAIT: Duration = Duration::from_secs(30);
const POLL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("aero-linux {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("aero_linux=info,aero_core=info")),
        )
        .init();

    let cfg = config::load()?;
    match args.first().map(String::as_str) {
        None => run(cfg).await,
        Some("send") => send(cfg, &args[1..]).await,
        Some(other) => bail!("unknown command {other:?}\n{USAGE}"),
    }
}

/// Serve until Ctrl+C or SIGTERM.
async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let node = Node::start(cfg).await?;
    if let Some(prompts) = node.auth_prompts() {
        tokio::spawn(answer_prompts(prompts));
    }
    shutdown_signal().await?;
    node.shutdown().await;
    Ok(())
}

/// Send files to one peer and exit once every job has finished.
async fn send(cfg: config::Config, args: &[String]) -> anyhow::Result<()> {
    let Some((query, files)) = args.split_first() else {
        bail!(USAGE);
    };
    if files.is_empty() {
        bail!(USAGE);
    }

    let node = Node::start(cfg).await?;
    if let Some(prompts) = node.auth_prompts() {
        tokio::spawn(answer_prompts(prompts));
    }
    let result = tokio::select! {
        r = send_files(&node, query, files) => r,
        r = shutdown_signal() => match r {
            Ok(()) => Err(anyhow::anyhow!("interrupted")),
            Err(e) => Err(e),
        },
    };
    node.shutdown().await;
    result
}

async fn send_files(node: &Node, query: &str, files: &[String]) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + DISCOVERY_WAIT;
    let peer = loop {
        if let Some(p) = node.find_peer(query).await {
            break p;
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("no peer matching {query:?} found on the network");
        }
        tokio::time::sleep(POLL).await;
    };
    info!(peer_id = %peer.id, name = %peer.display_name, "sending to peer");

    let mut ids = Vec::with_capacity(files.len());
    for f in files {
        ids.push(node.enqueue_file(peer.id, &PathBuf::from(f)).await?);
    }
    node.connect(peer.id)
        .await
        .with_context(|| format!("cannot connect to {}", peer.display_name))?;

    loop {
        let jobs = node.jobs().await;
        let mine: Vec<_> = jobs.iter().filter(|j| ids.contains(&j.id)).collect();
        if mine.iter().all(|j| j.state.is_terminal()) {
            let mut failed = 0;
            for j in mine {
                match j.state {
                    JobState::Completed => println!("sent {}", j.file_name),
                    _ => {
                        failed += 1;
                        println!("failed {} ({:?})", j.file_name, j.failure);
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} transfer(s) failed");
            }
            return Ok(());
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Ask on the terminal whether the verification code matches.
async fn answer_prompts(mut prompts: mpsc::Receiver<AuthPrompt>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(prompt) = prompts.recv().await {
        println!(
            "{} ({}) wants to connect. Verification code {}. Accept? [y/N]",
            prompt.display_name, prompt.fingerprint, prompt.code
        );
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().eq_ignore_ascii_case("y") => prompt.accept(),
            Ok(_) => prompt.reject(),
            Err(e) => {
                warn!(error = %e, "cannot read from stdin");
                prompt.reject();
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
